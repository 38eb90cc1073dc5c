use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use timeline_core::{CoreError, PostRef};
use tokio_util::sync::CancellationToken;

use super::guard::StampedeGuard;
use crate::cache::{RepoError, TimelineRepository};
use crate::clients::{ClientError, PostService, RelationService};
use crate::config::TimelineSettings;

/// Sizing and time budget of cached timelines.
#[derive(Debug, Clone)]
pub struct TimelineConfig {
    /// Maximum posts kept per timeline
    pub limit: usize,
    pub ttl: Duration,
    pub build_timeout: Duration,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        (&TimelineSettings::default()).into()
    }
}

impl From<&TimelineSettings> for TimelineConfig {
    fn from(s: &TimelineSettings) -> Self {
        Self {
            limit: s.limit,
            ttl: Duration::from_secs(s.ttl_secs),
            build_timeout: Duration::from_secs(s.build_timeout_secs),
        }
    }
}

/// One page of a home timeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimelinePage {
    pub posts: Vec<PostRef>,
    /// Token for the following (older) page
    pub next_token: Option<String>,
    /// Token for the preceding (newer) page
    pub prev_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    PermissionDenied(String),

    /// The cursor could not be honoured; carries the first page instead.
    #[error("token is expired, returned only first page of timeline")]
    InvalidatedToken(Box<TimelinePage>),

    #[error("request canceled")]
    Canceled,

    #[error("request timeout")]
    DeadlineExceeded,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<CoreError> for ServiceError {
    fn from(e: CoreError) -> Self {
        if e.is_client_error() {
            ServiceError::InvalidArgument(e.to_string())
        } else {
            ServiceError::Internal(e.to_string())
        }
    }
}

impl From<RepoError> for ServiceError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::Timeout => ServiceError::DeadlineExceeded,
            other => ServiceError::internal(other),
        }
    }
}

/// Why a rebuild produced no timeline.
#[derive(Debug, Clone, Error)]
pub enum BuildError {
    #[error(transparent)]
    Upstream(#[from] ClientError),

    #[error("timeline build timed out")]
    TimedOut,

    #[error("timeline build canceled by shutdown")]
    Canceled,
}

/// Rebuilt timeline shared between concurrent readers.
pub(crate) type BuiltTimeline = Arc<Vec<PostRef>>;

/// Reads and maintains cached home timelines.
pub struct TimelineService {
    pub(crate) repo: Arc<dyn TimelineRepository>,
    pub(crate) relations: Arc<dyn RelationService>,
    pub(crate) posts: Arc<dyn PostService>,
    pub(crate) config: TimelineConfig,
    pub(crate) guard: StampedeGuard<BuiltTimeline, BuildError>,
    /// Process lifetime; rebuilds run under it rather than under a request.
    pub(crate) shutdown: CancellationToken,
}

impl TimelineService {
    pub fn new(
        repo: Arc<dyn TimelineRepository>,
        relations: Arc<dyn RelationService>,
        posts: Arc<dyn PostService>,
        config: TimelineConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            repo,
            relations,
            posts,
            config,
            guard: StampedeGuard::new(),
            shutdown,
        }
    }

    pub fn config(&self) -> &TimelineConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<dyn TimelineRepository> {
        &self.repo
    }

    /// Rebuilds currently running (diagnostics).
    pub fn builds_in_flight(&self) -> usize {
        self.guard.in_flight()
    }
}
