use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;

use streampulse::server::DemoServer;

/// Demo download server for probe testing, including the TCPINFO trailer
/// protocol.
#[derive(Parser, Debug)]
#[command(name = "demoserver")]
#[command(about = "Download server for probe testing")]
struct Params {
    /// Address to listen on
    #[arg(short = 'l', long = "listen", default_value = "0.0.0.0:8082")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let params = Params::parse();

    let server = match DemoServer::bind(params.listen).await {
        Ok(server) => server,
        Err(e) => {
            eprintln!("bind {} failed: {}", params.listen, e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = server.serve().await {
        eprintln!("server failed: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
