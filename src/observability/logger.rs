//! JSON line logger
//!
//! Every line starts with `event`, `severity` and `ts`; the remaining
//! fields follow sorted by key. Lines are written whole with one
//! `write_all`, so concurrent prefetch tasks never interleave output.
//!
//! The threshold is process-wide. It starts at INFO, or at the level named
//! by `CROSSQUERY_LOG` when that is set.

use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Once;

use chrono::{DateTime, SecondsFormat, Utc};

/// Environment variable naming the initial threshold
pub const LOG_LEVEL_ENV: &str = "CROSSQUERY_LOG";

static MIN_SEVERITY: AtomicU8 = AtomicU8::new(Severity::Info as u8);
static INIT_FROM_ENV: Once = Once::new();

/// Log severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Per-page and per-fetch detail
    Trace = 0,
    /// Once per query context
    Debug = 1,
    Info = 2,
    /// Recovered: retries, rejected tokens
    Warn = 3,
    /// A query failed
    Error = 4,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Trace => "TRACE",
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Severity::Trace,
            1 => Severity::Debug,
            2 => Severity::Info,
            3 => Severity::Warn,
            _ => Severity::Error,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TRACE" => Ok(Severity::Trace),
            "DEBUG" => Ok(Severity::Debug),
            "INFO" => Ok(Severity::Info),
            "WARN" => Ok(Severity::Warn),
            "ERROR" => Ok(Severity::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// Process-wide JSON line logger
pub struct Logger;

impl Logger {
    /// Override the threshold, including one taken from the environment
    pub fn set_min_severity(severity: Severity) {
        INIT_FROM_ENV.call_once(|| {});
        MIN_SEVERITY.store(severity as u8, Ordering::Relaxed);
    }

    pub fn min_severity() -> Severity {
        INIT_FROM_ENV.call_once(|| {
            if let Some(level) = std::env::var(LOG_LEVEL_ENV).ok().and_then(|v| v.parse::<Severity>().ok()) {
                MIN_SEVERITY.store(level as u8, Ordering::Relaxed);
            }
        });
        Severity::from_u8(MIN_SEVERITY.load(Ordering::Relaxed))
    }

    pub fn enabled(severity: Severity) -> bool {
        severity >= Self::min_severity()
    }

    /// Write one line; ERROR goes to stderr, the rest to stdout
    pub fn log(severity: Severity, event: &str, fields: &[(&str, &str)]) {
        if !Self::enabled(severity) {
            return;
        }
        let line = render(severity, event, fields, Utc::now());
        if severity >= Severity::Error {
            write_line(&mut io::stderr().lock(), &line);
        } else {
            write_line(&mut io::stdout().lock(), &line);
        }
    }
}

fn write_line<W: Write>(writer: &mut W, line: &str) {
    // Logging never fails a query
    let _ = writer.write_all(line.as_bytes());
    let _ = writer.flush();
}

fn push_json_string(line: &mut String, text: &str) {
    match serde_json::to_string(text) {
        Ok(quoted) => line.push_str(&quoted),
        Err(_) => line.push_str("\"\""),
    }
}

/// Render one log line, newline included
pub(crate) fn render(severity: Severity, event: &str, fields: &[(&str, &str)], at: DateTime<Utc>) -> String {
    let mut line = String::with_capacity(160);
    line.push_str("{\"event\":");
    push_json_string(&mut line, event);
    line.push_str(",\"severity\":\"");
    line.push_str(severity.as_str());
    line.push_str("\",\"ts\":\"");
    line.push_str(&at.to_rfc3339_opts(SecondsFormat::Millis, true));
    line.push('"');

    let mut sorted: Vec<&(&str, &str)> = fields.iter().collect();
    sorted.sort_by_key(|(key, _)| *key);
    for (key, value) in sorted {
        line.push(',');
        push_json_string(&mut line, key);
        line.push(':');
        push_json_string(&mut line, value);
    }
    line.push_str("}\n");
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::Value;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()
    }

    #[test]
    fn test_fetch_failure_line_is_json() {
        let line = render(
            Severity::Warn,
            "PARTITION_FETCH_FAILED",
            &[("range_id", "3"), ("status_code", "429")],
            at(),
        );
        let parsed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["event"], "PARTITION_FETCH_FAILED");
        assert_eq!(parsed["severity"], "WARN");
        assert_eq!(parsed["ts"], "2024-01-02T03:04:05.000Z");
        assert_eq!(parsed["status_code"], "429");
    }

    #[test]
    fn test_header_then_sorted_fields() {
        let a = render(Severity::Info, "E", &[("min", ""), ("max", "FF")], at());
        let b = render(Severity::Info, "E", &[("max", "FF"), ("min", "")], at());
        assert_eq!(a, b);
        assert!(a.starts_with("{\"event\":\"E\",\"severity\":\"INFO\",\"ts\":"));
        assert!(a.find("\"max\"").unwrap() < a.find("\"min\"").unwrap());
    }

    #[test]
    fn test_continuation_text_is_escaped() {
        let token = "[{\"token\":\"+RID:~abc==\",\"range\":{\"min\":\"\",\"max\":\"FF\"}}]\n";
        let line = render(Severity::Trace, "E", &[("continuation", token)], at());
        let parsed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["continuation"], token);
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn test_parse_level() {
        assert_eq!("warn".parse::<Severity>(), Ok(Severity::Warn));
        assert_eq!(" TRACE ".parse::<Severity>(), Ok(Severity::Trace));
        assert!("loud".parse::<Severity>().is_err());
        assert_eq!("debug".parse::<Severity>(), Ok(Severity::Debug));
        assert!(Severity::Trace < Severity::Debug && Severity::Debug < Severity::Info);
        assert!(Severity::Trace < Severity::Error);
    }

    #[test]
    fn test_level_round_trips_through_threshold_storage() {
        for severity in [Severity::Trace, Severity::Debug, Severity::Info, Severity::Warn, Severity::Error] {
            assert_eq!(Severity::from_u8(severity as u8), severity);
        }
    }

    #[test]
    fn test_errors_always_enabled() {
        assert!(Logger::enabled(Severity::Error));
    }
}
