//! HTTP probing
//!
//! This module provides:
//! - A minimal HTTP/1.1 client bound to the instrumented connection
//! - Body digest sinks (md5 / sha1 / crc32)
//! - The probe orchestrator assembling the final report

pub mod client;
pub mod digest;
pub mod probe;

pub use client::{fetch, send, Body, ClientOptions, HttpError, Request, Response};
pub use digest::{by_name as digest_by_name, BodyDigest};
pub use probe::{hops, ping_get, ping_simple, to_tab_json, HttpInfo, HttpPinger};
