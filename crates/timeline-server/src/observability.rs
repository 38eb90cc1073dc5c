// Tracing initialization with a configurable log level.
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::LoggingConfig;

pub fn init_tracing_from_config(cfg: &LoggingConfig) {
    init_tracing_with_level(&cfg.level, cfg.format.eq_ignore_ascii_case("json"));
}

pub fn init_tracing_with_level(level: &str, json: bool) {
    let _ = tracing_subscriber::registry()
        .with(env_filter(level))
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .try_init();
}

/// RUST_LOG from the environment wins over the configured level.
fn env_filter(level: &str) -> EnvFilter {
    std::env::var("RUST_LOG")
        .ok()
        .and_then(|_| EnvFilter::try_from_default_env().ok())
        .or_else(|| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_init_is_harmless() {
        let cfg = LoggingConfig {
            level: "debug".into(),
            format: "json".into(),
        };
        init_tracing_from_config(&cfg);
        init_tracing_with_level("info", false);
    }

    #[test]
    fn test_unparsable_level_falls_back() {
        if std::env::var_os("RUST_LOG").is_none() {
            let fallback = env_filter("timeline_server=loud").to_string();
            assert_eq!(fallback, EnvFilter::new("info").to_string());
        }
        assert!(!env_filter("warn").to_string().is_empty());
    }
}
