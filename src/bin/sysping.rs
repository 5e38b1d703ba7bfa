use std::process::ExitCode;

use clap::Parser;

use streampulse::http::to_tab_json;
use streampulse::ping::sys_ping;

/// Run the platform ping tool and print the parsed result as JSON.
#[derive(Parser, Debug)]
#[command(name = "sysping")]
#[command(about = "System ping with structured output")]
struct Params {
    /// Host or IPv4 address to ping
    host: String,

    /// Interval between echoes, seconds
    #[arg(short = 'i', long = "interval", default_value_t = 1)]
    interval: u32,

    /// Number of echoes
    #[arg(short = 'c', long = "count", default_value_t = 4)]
    count: u32,

    /// Wall-clock budget for the whole run, seconds
    #[arg(short = 't', long = "timeout", default_value_t = 15)]
    timeout: u64,

    /// Source address to ping from
    #[arg(short = 's', long = "source")]
    source: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let params = Params::parse();

    match sys_ping(
        &params.host,
        params.interval,
        params.timeout,
        params.count,
        params.source.as_deref(),
    )
    .await
    {
        Ok(output) => {
            println!("{}", to_tab_json(&output));
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("ping failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
