use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use streampulse::http::{digest_by_name, HttpPinger};

/// Probe one HTTP(S) URL and print the quality report as JSON.
#[derive(Parser, Debug)]
#[command(name = "httprobe")]
#[command(about = "HTTP(S) download quality probe")]
struct Params {
    /// URL to probe; a bare host gets http:// prepended
    url: String,

    /// Run a concurrent system ping for the hop estimate
    #[arg(short = 'p', long = "ping", default_value_t = true)]
    ping: bool,

    /// Local source address to bind the dial (and the ping) to
    #[arg(short = 's', long = "source")]
    source: Option<String>,

    /// HTTP Range header value, e.g. "bytes=0-1023"
    #[arg(long = "range")]
    range: Option<String>,

    /// Ask the server for the in-band TCPINFO trailer
    #[arg(long = "server-support", default_value_t = false)]
    server_support: bool,

    /// Hash the downloaded body: md5, sha1 or crc32
    #[arg(long = "hash")]
    hash: Option<String>,

    /// User-Agent header
    #[arg(short = 'u', long = "user-agent")]
    user_agent: Option<String>,

    /// Follow redirects instead of reporting the first response
    #[arg(short = 'r', long = "redirect", default_value_t = false)]
    redirect: bool,

    /// End-to-end timeout in seconds (0 = none)
    #[arg(short = 't', long = "timeout", default_value_t = 60)]
    timeout: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let params = Params::parse();

    let digest = match &params.hash {
        None => None,
        Some(name) => match digest_by_name(name) {
            Some(d) => Some(d),
            None => {
                eprintln!("unknown hash {:?}; expected md5, sha1 or crc32", name);
                return ExitCode::from(2);
            }
        },
    };

    let mut pinger = HttpPinger::get(&params.url)
        .sys_ping(params.ping)
        .src_addr(params.source.clone())
        .server_support(params.server_support)
        .body_digest(digest)
        .follow_redirect(params.redirect);
    pinger.user_agent = params.user_agent.clone();
    if params.timeout > 0 {
        pinger = pinger.timeout(Some(Duration::from_secs(params.timeout)));
    }
    if let Some(range) = &params.range {
        pinger = pinger.header("Range", range);
    }

    match pinger.ping().await {
        Ok(info) => {
            println!("{}", info.to_json());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("probe failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
