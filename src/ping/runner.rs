//! System ping runner
//!
//! Shells out to the platform `ping` binary rather than opening raw ICMP
//! sockets; the tool is present and privileged everywhere we probe from.
//! Stdout is captured whole and fed to [`super::parser::parse`].

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use super::parser::{parse, PingError, PingOutput};

/// Ping `host` with the given interval, reply count and optional source
/// address, and parse the tool's output
///
/// `timeout_s` bounds the child's wall clock; the tool's own
/// count/interval normally finish well inside it. Arguments follow the
/// platform dialect: numeric output (`-n`), interval (`-i`), count
/// (`-c`), and `-S`/`-I` for the source address on Darwin/Linux.
pub async fn sys_ping(
    host: &str,
    interval_s: u32,
    timeout_s: u64,
    count: u32,
    source_addr: Option<&str>,
) -> Result<PingOutput, PingError> {
    let mut args: Vec<String> = vec![
        "-n".into(),
        "-i".into(),
        interval_s.to_string(),
        "-c".into(),
        count.to_string(),
    ];
    if let Some(src) = source_addr.filter(|s| !s.is_empty()) {
        args.push(if cfg!(target_os = "macos") { "-S" } else { "-I" }.into());
        args.push(src.into());
    }
    args.push(host.into());

    tracing::debug!(host = host, count = count, "running system ping");

    let child = Command::new("ping")
        .args(&args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();
    let output = match tokio::time::timeout(Duration::from_secs(timeout_s), child).await {
        Ok(Ok(out)) => out,
        Ok(Err(e)) => return Err(PingError::Spawn(e.to_string())),
        Err(_) => return Err(PingError::Timeout(timeout_s)),
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    // a nonzero exit (e.g. 100% loss) can still carry parseable output
    match parse(&stdout) {
        Ok(po) => Ok(po),
        Err(parse_err) => Err(PingError::Failed {
            command: format!("ping {}", args.join(" ")),
            exit_code: output.status.code(),
            parse: parse_err.to_string(),
            stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }),
    }
}
