use std::process::ExitCode;

use clap::Parser;

use streampulse::stream::Prober;

/// Probe one live stream URL (.flv or .m3u8) and print the report as JSON.
#[derive(Parser, Debug)]
#[command(name = "streamprobe")]
#[command(about = "Live-stream playback quality probe")]
struct Params {
    /// Stream URL (FLV or HLS over http/https)
    #[arg(short = 'u', long = "url")]
    url: String,

    /// Player buffer target in milliseconds
    #[arg(long = "player-buffer", default_value_t = 3000)]
    player_buffer: u32,

    /// Probe duration in seconds
    #[arg(long = "probe-time", default_value_t = 60)]
    probe_time: u32,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let params = Params::parse();

    let mut prober = Prober::new(&params.url);
    prober.player_buffer_time_ms = params.player_buffer;
    prober.probe_time_sec = params.probe_time;

    match prober.probe().await {
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
