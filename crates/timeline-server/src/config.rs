use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, time::Duration};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Redis configuration (timeline storage and event stream)
    #[serde(default)]
    pub redis: RedisConfig,
    /// Timeline cache sizing and rebuild budget
    #[serde(default)]
    pub timeline: TimelineSettings,
    /// Mutation event consumer
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default = "default_post_service")]
    pub post_service: UpstreamConfig,
    #[serde(default = "default_relation_service")]
    pub relation_service: UpstreamConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            redis: RedisConfig::default(),
            timeline: TimelineSettings::default(),
            consumer: ConsumerConfig::default(),
            post_service: default_post_service(),
            relation_service: default_relation_service(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Server validations
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if self.server.request_timeout_ms == 0 {
            return Err("server.request_timeout_ms must be > 0".into());
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        let fmt = self.logging.format.to_ascii_lowercase();
        if fmt != "text" && fmt != "json" {
            return Err("logging.format must be \"text\" or \"json\"".into());
        }
        // Redis validation
        if self.redis.enabled && self.redis.url.is_empty() {
            return Err("redis.enabled=true requires redis.url".into());
        }
        if self.redis.pool_size == 0 {
            return Err("redis.pool_size must be > 0".into());
        }
        // Timeline validation
        if self.timeline.limit == 0 {
            return Err("timeline.limit must be > 0".into());
        }
        if self.timeline.ttl_secs == 0 {
            return Err("timeline.ttl_secs must be > 0".into());
        }
        if self.timeline.build_timeout_secs == 0 {
            return Err("timeline.build_timeout_secs must be > 0".into());
        }
        // Consumer validation
        if self.consumer.enabled {
            if !self.redis.enabled {
                return Err("consumer.enabled=true requires redis.enabled=true".into());
            }
            if self.consumer.stream.is_empty() || self.consumer.group.is_empty() {
                return Err("consumer.stream and consumer.group must not be empty".into());
            }
        }
        if self.consumer.operation_timeout_ms == 0 {
            return Err("consumer.operation_timeout_ms must be > 0".into());
        }
        if self.consumer.initial_backoff_ms == 0
            || self.consumer.initial_backoff_ms > self.consumer.max_backoff_ms
        {
            return Err("consumer.initial_backoff_ms must be > 0 and <= consumer.max_backoff_ms".into());
        }
        // Upstream validation
        for (name, upstream) in [
            ("post_service", &self.post_service),
            ("relation_service", &self.relation_service),
        ] {
            if upstream.base_url.is_empty() {
                return Err(format!("{name}.base_url must not be empty"));
            }
            if upstream.timeout_ms == 0 {
                return Err(format!("{name}.timeout_ms must be > 0"));
            }
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        let ip: std::net::IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(std::net::IpAddr::from([0, 0, 0, 0]));
        SocketAddr::from((ip, self.server.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upper bound for a single HTTP request, including a timeline rebuild
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Redis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Enable Redis (falls back to an in-process store without it)
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,

    /// Prefix prepended to the user id to form the timeline key
    #[serde(default = "default_redis_key_prefix")]
    pub key_prefix: String,
}

fn default_redis_enabled() -> bool {
    false
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

fn default_redis_key_prefix() -> String {
    "timeline:".to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
            key_prefix: default_redis_key_prefix(),
        }
    }
}

/// Timeline cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineSettings {
    /// Maximum number of posts kept per timeline
    #[serde(default = "default_timeline_limit")]
    pub limit: usize,

    /// Time-to-live of a cached timeline, refreshed on read
    #[serde(default = "default_timeline_ttl_secs")]
    pub ttl_secs: u64,

    /// Upper bound for rebuilding a timeline from the upstream services
    #[serde(default = "default_build_timeout_secs")]
    pub build_timeout_secs: u64,
}

fn default_timeline_limit() -> usize {
    1000
}

fn default_timeline_ttl_secs() -> u64 {
    72 * 60 * 60
}

fn default_build_timeout_secs() -> u64 {
    180
}

impl Default for TimelineSettings {
    fn default() -> Self {
        Self {
            limit: default_timeline_limit(),
            ttl_secs: default_timeline_ttl_secs(),
            build_timeout_secs: default_build_timeout_secs(),
        }
    }
}

/// Mutation event consumer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Stream the change events are published to
    #[serde(default = "default_consumer_stream")]
    pub stream: String,

    /// Consumer group name; progress is tracked per group
    #[serde(default = "default_consumer_group")]
    pub group: String,

    /// Consumer name inside the group (defaults to the host name)
    #[serde(default)]
    pub consumer_name: Option<String>,

    /// How long a single poll blocks waiting for a message
    #[serde(default = "default_consumer_block_ms")]
    pub block_ms: u64,

    /// Timeout for a single attempt of a timeline mutation
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Give up retrying a message after this long and stop the consumer
    #[serde(default = "default_max_retry_elapsed_ms")]
    pub max_retry_elapsed_ms: u64,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_consumer_stream() -> String {
    "timelines".into()
}
fn default_consumer_group() -> String {
    "timeline-service".into()
}
fn default_consumer_block_ms() -> u64 {
    1000
}
fn default_operation_timeout_ms() -> u64 {
    5000
}
fn default_max_retry_elapsed_ms() -> u64 {
    120_000
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    60_000
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            stream: default_consumer_stream(),
            group: default_consumer_group(),
            consumer_name: None,
            block_ms: default_consumer_block_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
            max_retry_elapsed_ms: default_max_retry_elapsed_ms(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl ConsumerConfig {
    /// Consumer name, falling back to the host name.
    pub fn resolved_consumer_name(&self) -> String {
        self.consumer_name
            .clone()
            .filter(|n| !n.is_empty())
            .or_else(|| hostname_string().map(|h| format!("{h}-{}", std::process::id())))
            .unwrap_or_else(|| format!("consumer-{}", std::process::id()))
    }
}

fn hostname_string() -> Option<String> {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
}

/// Upstream collaborator endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(default = "default_upstream_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_upstream_timeout_ms() -> u64 {
    10_000
}

fn default_post_service() -> UpstreamConfig {
    UpstreamConfig {
        base_url: "http://localhost:8081".into(),
        timeout_ms: default_upstream_timeout_ms(),
    }
}

fn default_relation_service() -> UpstreamConfig {
    UpstreamConfig {
        base_url: "http://localhost:8082".into(),
        timeout_ms: default_upstream_timeout_ms(),
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or("timeline.toml"));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., TIMELINE__SERVER__PORT=9090
        builder = builder.add_source(
            Environment::with_prefix("TIMELINE")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.timeline.limit, 1000);
        assert_eq!(cfg.timeline.ttl_secs, 259_200);
        assert_eq!(cfg.timeline.build_timeout_secs, 180);
        assert_eq!(cfg.consumer.operation_timeout_ms, 5000);
        assert_eq!(cfg.consumer.max_retry_elapsed_ms, 120_000);
        assert_eq!(cfg.redis.key_prefix, "timeline:");
    }

    #[test]
    fn test_consumer_requires_redis() {
        let mut cfg = AppConfig::default();
        cfg.consumer.enabled = true;
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("requires redis.enabled"));

        cfg.redis.enabled = true;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_invalid_logging_level() {
        let mut cfg = AppConfig::default();
        cfg.logging.level = "loud".into();
        assert!(cfg.validate().unwrap_err().contains("logging.level"));
    }

    #[test]
    fn test_addr_falls_back_to_unspecified() {
        let mut cfg = AppConfig::default();
        cfg.server.host = "not-an-ip".into();
        cfg.server.port = 9000;
        assert_eq!(cfg.addr().to_string(), "0.0.0.0:9000");
    }

    #[test]
    fn test_explicit_consumer_name_wins() {
        let cfg = ConsumerConfig {
            consumer_name: Some("worker-1".into()),
            ..ConsumerConfig::default()
        };
        assert_eq!(cfg.resolved_consumer_name(), "worker-1");
    }
}
