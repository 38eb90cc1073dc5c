pub mod cache;
pub mod clients;
pub mod config;
pub mod events;
pub mod handlers;
pub mod middleware;
pub mod observability;
pub mod server;
pub mod timeline;

use std::sync::Arc;
use std::time::Duration;

pub use cache::{MemoryTimelineRepository, RedisTimelineRepository, TimelineRepository};
pub use config::{AppConfig, ConsumerConfig, RedisConfig, ServerConfig};
pub use server::{AppState, build_app};
pub use timeline::{ServiceError, TimelineConfig, TimelinePage, TimelineService};

/// Connect to Redis, or `None` when it is disabled or unreachable.
pub async fn connect_redis(config: &RedisConfig) -> Option<deadpool_redis::Pool> {
    if !config.enabled {
        tracing::info!("Redis disabled");
        return None;
    }

    tracing::info!(url = %config.url, "Connecting to Redis");

    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    let pool_config = redis_config
        .pool
        .get_or_insert_with(deadpool_redis::PoolConfig::default);
    pool_config.max_size = config.pool_size;
    pool_config.timeouts.wait = Some(Duration::from_millis(config.timeout_ms));
    pool_config.timeouts.create = Some(Duration::from_millis(config.timeout_ms));
    pool_config.timeouts.recycle = Some(Duration::from_millis(config.timeout_ms));

    let pool = match redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1)) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to create Redis pool");
            return None;
        }
    };

    match pool.get().await {
        Ok(_) => {
            tracing::info!("Connected to Redis");
            Some(pool)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to connect to Redis");
            None
        }
    }
}

/// Timeline storage for the given pool.
///
/// ## Graceful Degradation
///
/// Without a pool, timelines live in process memory. The server still runs,
/// but every instance keeps its own copy and the event consumer cannot run.
pub fn create_timeline_repository(
    pool: Option<deadpool_redis::Pool>,
    config: &RedisConfig,
) -> Arc<dyn TimelineRepository> {
    match pool {
        Some(pool) => Arc::new(RedisTimelineRepository::new(
            pool,
            config.key_prefix.clone(),
            Duration::from_millis(config.timeout_ms),
        )),
        None => {
            tracing::warn!("Keeping timelines in process memory");
            Arc::new(MemoryTimelineRepository::new())
        }
    }
}
