// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Logger initialization.
//!
//! Level comes from `AGENT_LOG_LEVEL`, then `LOG_LEVEL`, then `RUST_LOG`
//! directives, defaulting to `info`. `AGENT_LOG_FORMAT=json` switches to
//! structured output. Logs go to stderr.

use tracing_subscriber::EnvFilter;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

/// Normalize a level name; unknown names fall back to `info`.
pub fn parse_level(value: &str) -> &'static str {
    match value.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    }
}

/// Parse a format name; anything but `json` is text.
pub fn parse_format(value: &str) -> LogFormat {
    if value.trim().eq_ignore_ascii_case("json") {
        LogFormat::Json
    } else {
        LogFormat::Text
    }
}

fn build_filter<F>(lookup: &F) -> EnvFilter
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(level) = lookup("AGENT_LOG_LEVEL").or_else(|| lookup("LOG_LEVEL")) {
        return EnvFilter::new(parse_level(&level));
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init<F>(lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let filter = build_filter(&lookup);
    let format = lookup("AGENT_LOG_FORMAT")
        .map(|v| parse_format(&v))
        .unwrap_or(LogFormat::Text);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let _ = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), "debug");
        assert_eq!(parse_level("warning"), "warn");
        assert_eq!(parse_level("error"), "error");
        assert_eq!(parse_level("verbose"), "info");
    }

    #[test]
    fn test_parse_format() {
        assert_eq!(parse_format("JSON"), LogFormat::Json);
        assert_eq!(parse_format("text"), LogFormat::Text);
        assert_eq!(parse_format(""), LogFormat::Text);
    }

    #[test]
    fn test_agent_level_wins() {
        let filter = build_filter(&|name: &str| match name {
            "AGENT_LOG_LEVEL" => Some("debug".to_string()),
            "LOG_LEVEL" => Some("error".to_string()),
            _ => None,
        });
        assert_eq!(filter.to_string(), "debug");
    }
}
