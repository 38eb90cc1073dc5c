use std::{env, sync::Arc, time::Duration};

use anyhow::{Context, bail};
use timeline_server::clients::{HttpPostService, HttpRelationService};
use timeline_server::config::{AppConfig, loader::load_config};
use timeline_server::events::{EventConsumer, EventHandler, RedisStreamSource, RetryPolicy};
use timeline_server::server::{AppState, TimelineServer};
use timeline_server::{TimelineConfig, TimelineService};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How the configuration path was determined.
#[derive(Debug, Clone, Copy)]
enum ConfigSource {
    /// From --config CLI argument
    CliArgument,
    /// From TIMELINE_CONFIG environment variable
    EnvironmentVariable,
    /// Default path (timeline.toml)
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CliArgument => write!(f, "CLI argument (--config)"),
            Self::EnvironmentVariable => write!(f, "environment variable (TIMELINE_CONFIG)"),
            Self::Default => write!(f, "default"),
        }
    }
}

#[tokio::main]
async fn main() {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    let (config_path, source) = resolve_config_path();

    let cfg = match load_config(Some(&config_path)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };

    timeline_server::observability::init_tracing_from_config(&cfg.logging);
    tracing::info!(
        path = %config_path,
        source = %source,
        "Configuration loaded"
    );

    if let Err(err) = run(cfg).await {
        tracing::error!(error = %err, "timeline service failed");
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cfg: AppConfig) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();

    let pool = timeline_server::connect_redis(&cfg.redis).await;
    let repo = timeline_server::create_timeline_repository(pool.clone(), &cfg.redis);
    tracing::info!(mode = repo.mode(), "timeline storage ready");

    let relations = HttpRelationService::new(&cfg.relation_service)
        .context("failed to create relation service client")?;
    let posts =
        HttpPostService::new(&cfg.post_service).context("failed to create post service client")?;

    let service = Arc::new(TimelineService::new(
        repo,
        Arc::new(relations),
        Arc::new(posts),
        TimelineConfig::from(&cfg.timeline),
        shutdown.clone(),
    ));

    let consumer = if cfg.consumer.enabled {
        let Some(pool) = pool.as_ref() else {
            bail!("event consumer requires a Redis connection");
        };
        Some(spawn_consumer(&cfg, pool, Arc::clone(&service), shutdown.clone()).await?)
    } else {
        tracing::info!("event consumer disabled");
        None
    };

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("shutdown signal received");
                signal_token.cancel();
            }
            Err(e) => tracing::error!(error = %e, "failed to listen for shutdown signal"),
        }
    });

    let state = AppState {
        service,
        request_timeout: cfg.server.request_timeout(),
    };
    let server = TimelineServer::new(cfg.addr(), state).run(shutdown.clone());
    let served = server.await;
    // Whatever stopped the server stops the consumer too.
    shutdown.cancel();

    if let Some(consumer) = consumer {
        consumer
            .await
            .context("event consumer task panicked")?
            .context("event consumer stopped")?;
    }
    served
}

/// Start the consumer; its failure cancels `shutdown` so the server stops too.
async fn spawn_consumer(
    cfg: &AppConfig,
    pool: &deadpool_redis::Pool,
    service: Arc<TimelineService>,
    shutdown: CancellationToken,
) -> anyhow::Result<JoinHandle<Result<(), timeline_server::events::PipelineError>>> {
    let consumer_cfg = &cfg.consumer;
    let source = RedisStreamSource::connect(
        pool,
        &consumer_cfg.stream,
        &consumer_cfg.group,
        consumer_cfg.resolved_consumer_name(),
    )
    .await
    .context("failed to connect event source")?;

    let handler = EventHandler::new(
        service,
        Duration::from_millis(consumer_cfg.operation_timeout_ms),
        RetryPolicy::from(consumer_cfg),
        shutdown.clone(),
    );
    let consumer = EventConsumer::new(
        source,
        handler,
        Duration::from_millis(consumer_cfg.block_ms),
    );

    tracing::info!(
        stream = %consumer_cfg.stream,
        group = %consumer_cfg.group,
        "starting event consumer"
    );
    Ok(tokio::spawn(async move {
        let result = consumer.run(shutdown.clone()).await;
        if result.is_err() {
            shutdown.cancel();
        }
        result
    }))
}

/// Resolve the configuration file path.
///
/// Priority order:
/// 1. CLI argument: --config <path>
/// 2. Environment variable: TIMELINE_CONFIG
/// 3. Default: timeline.toml
fn resolve_config_path() -> (String, ConfigSource) {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return (path, ConfigSource::CliArgument);
            }
        }
    }

    if let Ok(path) = env::var("TIMELINE_CONFIG") {
        if !path.is_empty() {
            return (path, ConfigSource::EnvironmentVariable);
        }
    }

    ("timeline.toml".to_string(), ConfigSource::Default)
}
