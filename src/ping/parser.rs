//! `ping` output parser
//!
//! Parses the textual output of the platform `ping` tool across the Linux
//! (iputils) and Darwin (BSD) dialects: the header line, the ordered reply
//! lines (including duplicates and host-error lines), the statistics
//! separator, and the two statistics lines. The pipeline is deliberately
//! tolerant; every dialect quirk observed in the wild gets its own
//! fallback rather than a stricter grammar.

use std::sync::OnceLock;
use std::time::Duration;

use regex::{Captures, Regex};
use serde::Serialize;

/// Parse errors, in the order the pipeline can raise them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PingError {
    /// `ping: unknown host` on the first line
    UnknownHost,
    /// Fewer lines than any valid output can have
    NotEnoughLines,
    /// First line matched neither header dialect
    HeaderMismatch,
    /// A reply line matched no known shape
    UnrecognizedLine(String),
    /// The `--- <host> ping statistics ---` separator is malformed
    MalformedStatsHeader,
    /// Packet-count statistics line is malformed
    MalformedStatsLine1,
    /// `min/avg/max/mdev` statistics line is malformed
    MalformedStatsLine2,
    /// A numeric field failed to convert
    Conversion { context: &'static str, cause: String },
    /// The ping child could not be spawned
    Spawn(String),
    /// The ping child outlived its wall-clock budget
    Timeout(u64),
    /// The ping run failed and its output did not parse either
    Failed {
        command: String,
        exit_code: Option<i32>,
        parse: String,
        stdout: String,
        stderr: String,
    },
}

impl std::fmt::Display for PingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PingError::UnknownHost => write!(f, "unknown host"),
            PingError::NotEnoughLines => write!(f, "not enough lines"),
            PingError::HeaderMismatch => write!(f, "header mismatch"),
            PingError::UnrecognizedLine(l) => write!(f, "unrecognized ping reply line: {}", l),
            PingError::MalformedStatsHeader => write!(f, "malformed stats header"),
            PingError::MalformedStatsLine1 => write!(f, "malformed stats line 1"),
            PingError::MalformedStatsLine2 => write!(f, "malformed stats line 2"),
            PingError::Conversion { context, cause } => write!(f, "{}: {}", context, cause),
            PingError::Spawn(e) => write!(f, "could not run ping: {}", e),
            PingError::Timeout(secs) => write!(f, "ping wait more than {}s", secs),
            PingError::Failed {
                command,
                exit_code,
                parse,
                stdout,
                stderr,
            } => write!(
                f,
                "command: {}\nexit code: {:?}\nparse error: {}\nstdout:\n{}\nstderr:\n{}",
                command, exit_code, parse, stdout, stderr
            ),
        }
    }
}

impl std::error::Error for PingError {}

/// One ICMP echo reply line
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PingReply {
    pub size: u32,
    pub from_address: String,
    pub sequence: u32,
    pub ttl: u32,
    #[serde(serialize_with = "ser_ms", rename = "time_ms")]
    pub time: Duration,
    /// Empty on success; the host-error text otherwise
    pub error: String,
    pub duplicate: bool,
}

/// Aggregate statistics of a whole ping run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PingStatistics {
    pub ip_address: String,
    pub transmitted: u32,
    pub received: u32,
    pub errors: u32,
    pub packet_loss_percent: f32,
    #[serde(serialize_with = "ser_ms", rename = "elapsed_ms")]
    pub elapsed: Duration,
    #[serde(serialize_with = "ser_ms", rename = "rtt_min_ms")]
    pub rtt_min: Duration,
    #[serde(serialize_with = "ser_ms", rename = "rtt_avg_ms")]
    pub rtt_avg: Duration,
    #[serde(serialize_with = "ser_ms", rename = "rtt_max_ms")]
    pub rtt_max: Duration,
    #[serde(serialize_with = "ser_ms", rename = "rtt_mdev_ms")]
    pub rtt_mdev: Duration,
    pub warning: String,
}

/// Parsed output of one ping invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PingOutput {
    pub host: String,
    pub resolved_ip: String,
    pub payload_size: u32,
    pub payload_actual_size: u32,
    pub replies: Vec<PingReply>,
    pub stats: PingStatistics,
}

fn ser_ms<S>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    s.serialize_f64(d.as_secs_f64() * 1000.0)
}

struct Patterns {
    header: Regex,
    header_alt: Regex,
    reply: Regex,
    separator: Regex,
    stats1: Regex,
    stats2: Regex,
    pipe_suffix: Regex,
    pipe_line: Regex,
    host_err1: Regex,
    host_err2: Regex,
}

fn patterns() -> &'static Patterns {
    static P: OnceLock<Patterns> = OnceLock::new();
    P.get_or_init(|| Patterns {
        header: Regex::new(
            r"^PING (?P<host>.*) \((?P<ip>\d+\.\d+\.\d+\.\d+)\)( from .* :)? (?P<payload>\d+)\((?P<payload_actual>\d+)\) bytes of data",
        )
        .expect("header pattern"),
        header_alt: Regex::new(
            r"^PING (?P<host>.*) \((?P<ip>\d+\.\d+\.\d+\.\d+)\)( from .*)?: (?P<payload>\d+) data bytes",
        )
        .expect("alt header pattern"),
        reply: Regex::new(
            r"^(?P<size>\d+) bytes from (?P<from>\d+\.\d+\.\d+\.\d+): icmp_seq=(?P<seq>\d+) ttl=(?P<ttl>\d+) time=(?P<time>.*)$",
        )
        .expect("reply pattern"),
        separator: Regex::new(r"^--- (?P<ip>.*) ping statistics ---$").expect("separator pattern"),
        stats1: Regex::new(
            r"^(?P<transmitted>\d+) packets transmitted, (?P<received>\d+) (packets )?received,( \+(?P<errors>\d+) errors,)?( \+(?P<duplicates>\d+) duplicates,)?( (?P<loss>.*)% packet loss)?(, time (?P<time>.*))?( -- (?P<warning>.*))?$",
        )
        .expect("stats line 1 pattern"),
        stats2: Regex::new(
            r"^(rtt|round-trip) min/avg/max/(mdev|stddev) = (?P<min>[^/]+)/(?P<avg>[^/]+)/(?P<max>[^/]+)/(?P<mdev>[^ ]+) (?P<unit>.*)$",
        )
        .expect("stats line 2 pattern"),
        pipe_suffix: Regex::new(r"(?P<unit>[^,]+), pipe (?P<pipe>\d+)$").expect("pipe pattern"),
        pipe_line: Regex::new(r"^pipe (?P<pipe>\d+)$").expect("pipe line pattern"),
        host_err1: Regex::new(
            r"^From (?P<from>\d+\.\d+\.\d+\.\d+) icmp_seq=(?P<seq>\d+) (?P<error>.*)$",
        )
        .expect("host error 1 pattern"),
        host_err2: Regex::new(
            r"^(?P<size>\d+) bytes from (?P<from>\d+\.\d+\.\d+\.\d+): (?P<error>.*)$",
        )
        .expect("host error 2 pattern"),
    })
}

fn group<'t>(caps: &Captures<'t>, name: &str) -> &'t str {
    caps.name(name).map(|m| m.as_str()).unwrap_or("")
}

fn parse_u32(s: &str, context: &'static str) -> Result<u32, PingError> {
    s.parse::<u32>().map_err(|e| PingError::Conversion {
        context,
        cause: e.to_string(),
    })
}

/// Parse a `ping` duration like `10.3 ms`, `12.1ms` or `1001ms`
fn parse_duration(s: &str, context: &'static str) -> Result<Duration, PingError> {
    let s: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let value: f64 = num.parse().map_err(|e: std::num::ParseFloatError| {
        PingError::Conversion {
            context,
            cause: e.to_string(),
        }
    })?;
    let scale = match unit {
        "s" => 1.0,
        "ms" => 1e-3,
        "us" | "\u{b5}s" => 1e-6,
        _ => {
            return Err(PingError::Conversion {
                context,
                cause: format!("unknown time unit {:?}", unit),
            })
        }
    };
    Ok(Duration::from_secs_f64(value * scale))
}

/// Parse one complete `ping` run's stdout into a [`PingOutput`]
pub fn parse(s: &str) -> Result<PingOutput, PingError> {
    let p = patterns();
    let lines: Vec<&str> = s.split('\n').collect();
    if lines.len() < 4 {
        if lines.first() == Some(&"ping: unknown host") {
            return Err(PingError::UnknownHost);
        }
        return Err(PingError::NotEnoughLines);
    }

    // Header: on Darwin the BSD form comes first, elsewhere the iputils
    // form is primary with the BSD form as fallback.
    let darwin = cfg!(target_os = "macos");
    let (first, second) = if darwin {
        (&p.header_alt, &p.header)
    } else {
        (&p.header, &p.header_alt)
    };
    let header = first
        .captures(lines[0])
        .or_else(|| second.captures(lines[0]))
        .ok_or(PingError::HeaderMismatch)?;

    let mut po = PingOutput {
        host: group(&header, "host").to_string(),
        resolved_ip: group(&header, "ip").to_string(),
        payload_size: parse_u32(group(&header, "payload"), "payloadSize")?,
        ..Default::default()
    };
    let actual = group(&header, "payload_actual");
    if !actual.is_empty() {
        po.payload_actual_size = parse_u32(actual, "payloadActualSize")?;
    }

    // Reply section: ends at a blank line (separator on the next line) or
    // at the separator itself.
    let mut sep_caps: Option<Captures> = None;
    let mut stats_idx = 0usize;
    for (k, raw) in lines.iter().enumerate().skip(1) {
        if raw.is_empty() {
            stats_idx = k + 1;
            break;
        }

        let mut reply = PingReply::default();
        let mut line = *raw;
        if let Some(stripped) = line.strip_suffix(" (DUP!)") {
            reply.duplicate = true;
            line = stripped;
        }

        let caps = p
            .reply
            .captures(line)
            .or_else(|| p.host_err1.captures(line))
            .or_else(|| p.host_err2.captures(line));
        let caps = match caps {
            Some(c) => c,
            None => {
                // some dialects jump straight into the statistics
                if let Some(c) = p.separator.captures(line) {
                    sep_caps = Some(c);
                    stats_idx = k;
                    break;
                }
                return Err(PingError::UnrecognizedLine(line.to_string()));
            }
        };

        let size = group(&caps, "size");
        if !size.is_empty() {
            reply.size = parse_u32(size, "replySize")?;
        }
        reply.from_address = group(&caps, "from").to_string();
        reply.error = group(&caps, "error").to_string();
        let seq = group(&caps, "seq");
        if !seq.is_empty() {
            reply.sequence = parse_u32(seq, "reply seqNo")?;
        }
        let ttl = group(&caps, "ttl");
        if !ttl.is_empty() {
            reply.ttl = parse_u32(ttl, "ttl")?;
        }
        let time = group(&caps, "time");
        if !time.is_empty() {
            reply.time = parse_duration(time, "ping reply time")?;
        }
        po.replies.push(reply);
    }

    let sep_caps = match sep_caps {
        Some(c) => c,
        None => {
            if stats_idx >= lines.len() {
                return Err(PingError::NotEnoughLines);
            }
            p.separator
                .captures(lines[stats_idx])
                .ok_or(PingError::MalformedStatsHeader)?
        }
    };
    po.stats.ip_address = group(&sep_caps, "ip").to_string();

    let line1_idx = stats_idx + 1;
    if line1_idx >= lines.len() {
        return Err(PingError::NotEnoughLines);
    }
    let s1 = p
        .stats1
        .captures(lines[line1_idx])
        .ok_or(PingError::MalformedStatsLine1)?;
    po.stats.transmitted = parse_u32(group(&s1, "transmitted"), "packetsTransmitted")?;
    po.stats.received = parse_u32(group(&s1, "received"), "packetsReceived")?;
    let errors = group(&s1, "errors");
    if !errors.is_empty() {
        po.stats.errors = parse_u32(errors, "stats errors")?;
    }
    let loss = group(&s1, "loss");
    if !loss.is_empty() {
        po.stats.packet_loss_percent =
            loss.parse::<f64>().map_err(|e| PingError::Conversion {
                context: "packetLoss",
                cause: e.to_string(),
            })? as f32;
    } else {
        po.stats.warning = group(&s1, "warning").to_string();
    }
    let elapsed = group(&s1, "time");
    if !elapsed.is_empty() {
        po.stats.elapsed = parse_duration(elapsed, "stats time")?;
    }

    // line 2 only appears when at least one reply succeeded
    if po.replies.iter().all(|r| !r.error.is_empty()) {
        return Ok(po);
    }

    let line2_idx = line1_idx + 1;
    if line2_idx >= lines.len() {
        return Err(PingError::NotEnoughLines);
    }
    let s2 = match p.stats2.captures(lines[line2_idx]) {
        Some(c) => c,
        None => {
            // a lone `pipe <n>` line replaces line 2 on some kernels
            if p.pipe_line.is_match(lines[line2_idx]) {
                return Ok(po);
            }
            return Err(PingError::MalformedStatsLine2);
        }
    };

    let raw_unit = group(&s2, "unit").to_string();
    // a `, pipe <n>` modifier rides on the unit field; the pipe count is
    // ignored
    let unit = match p.pipe_suffix.captures(&raw_unit) {
        Some(pm) => group(&pm, "unit").to_string(),
        None => raw_unit.clone(),
    };
    po.stats.rtt_min = parse_duration(&format!("{}{}", group(&s2, "min"), unit), "rtt")?;
    po.stats.rtt_avg = parse_duration(&format!("{}{}", group(&s2, "avg"), unit), "avg")?;
    po.stats.rtt_max = parse_duration(&format!("{}{}", group(&s2, "max"), unit), "max")?;
    po.stats.rtt_mdev = parse_duration(&format!("{}{}", group(&s2, "mdev"), unit), "mdev")?;

    Ok(po)
}
