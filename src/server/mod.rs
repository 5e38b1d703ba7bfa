//! Demo download server implementing the trailer protocol

pub mod download;

pub use download::{DemoServer, LENGTH_HEADER, MAX_LENGTH};
