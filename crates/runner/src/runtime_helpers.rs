#![forbid(unsafe_code)]

use std::path::Path;
use std::process::ExitStatus;

/// RFC 3339 UTC timestamp for artifacts.
pub fn utc_now_rfc3339() -> String {
    let now = time::OffsetDateTime::now_utc();
    now.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

pub fn now_ms() -> i64 {
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    i64::try_from(nanos).unwrap_or(i64::MAX)
}

/// `exit=<code>` or, on unix, `signal=<n>` when the child was killed.
pub fn format_exit_status(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit={code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal={signal}");
        }
    }
    "exit=unknown".to_string()
}

fn sanitize_single_line(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Last `tail_chars` characters of a worker log, flattened to one line.
/// `-` when the log is missing or empty.
pub fn read_log_tail(log_path: &Path, tail_chars: usize) -> String {
    let raw = match std::fs::read(log_path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).to_string(),
        Err(_) => return "-".to_string(),
    };
    let sanitized = sanitize_single_line(&raw);
    if sanitized.is_empty() || tail_chars == 0 {
        return "-".to_string();
    }
    let total = sanitized.chars().count();
    if total <= tail_chars {
        return sanitized;
    }
    let tail = sanitized
        .chars()
        .skip(total - tail_chars)
        .collect::<String>();
    format!("… {tail}")
}
