// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Installs the global `tracing` subscriber.
//!
//! The filter comes from `RUST_LOG` and defaults to `pa_events=info`.
//! `LOG_FORMAT=json` switches the output to one JSON object per line.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "pa_events=info,pa_events_worker=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Plain,
    Json,
}

impl LogFormat {
    pub fn from_env() -> LogFormat {
        LogFormat::parse(std::env::var("LOG_FORMAT").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> LogFormat {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Plain,
        }
    }
}

/// Installs the subscriber. Later calls are no-ops.
pub fn init() {
    init_with(LogFormat::from_env());
}

pub fn init_with(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());

    let (json, plain) = match format {
        LogFormat::Json => (Some(fmt::layer().json().with_current_span(false)), None),
        LogFormat::Plain => (None, Some(fmt::layer())),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(plain)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_select_json_only_when_asked() {
        assert_eq!(LogFormat::parse(Some("json")), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some(" JSON ")), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some("pretty")), LogFormat::Plain);
        assert_eq!(LogFormat::parse(None), LogFormat::Plain);
    }

    #[test]
    fn should_tolerate_repeated_init() {
        init_with(LogFormat::Plain);
        init_with(LogFormat::Json);
    }
}
