//! Per-key deduplication of expensive builds.
//!
//! The first caller for a key starts the build on its own task; everyone who
//! asks for the same key while it runs gets a handle to that same result.
//! The build keeps running if every caller goes away, so a dropped request
//! never wastes the work already done.
//!
//! A build may hand back follow-up work (storing what it built) alongside
//! its value. Waiters are released as soon as the value exists, but the key
//! stays claimed until the follow-up finishes, so a caller that still misses
//! the store in that window joins the finished build instead of starting
//! another.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Error)]
pub enum GuardError<E> {
    #[error(transparent)]
    Build(E),

    #[error("build task aborted")]
    Aborted,
}

/// Value produced by a build, plus work to finish before the key is released.
pub struct BuildOutput<T> {
    pub value: T,
    pub settle: Option<BoxFuture<'static, ()>>,
}

impl<T> BuildOutput<T> {
    pub fn ready(value: T) -> Self {
        Self {
            value,
            settle: None,
        }
    }

    pub fn then_settle(value: T, settle: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            value,
            settle: Some(settle.boxed()),
        }
    }
}

/// Result handle shared by every caller waiting on the same key.
pub type SharedBuild<T, E> = Shared<BoxFuture<'static, Result<T, GuardError<E>>>>;

pub struct StampedeGuard<T, E>
where
    T: Clone,
    E: Clone,
{
    inflight: Arc<Mutex<HashMap<String, SharedBuild<T, E>>>>,
}

impl<T, E> Default for StampedeGuard<T, E>
where
    T: Clone,
    E: Clone,
{
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T, E> StampedeGuard<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the build in flight for `key`, or start one with `builder`.
    ///
    /// `builder` is only invoked when no build for `key` is running. Must be
    /// called from within a tokio runtime.
    pub fn run_exclusive<F, Fut>(&self, key: &str, builder: F) -> SharedBuild<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<BuildOutput<T>, E>> + Send + 'static,
    {
        let mut inflight = self.inflight.lock();
        if let Some(existing) = inflight.get(key) {
            tracing::debug!(key = %key, "joining in-flight build");
            return existing.clone();
        }

        let build = builder();
        // The entry is inserted below while the lock is still held, so the
        // removal always happens after it, even when the build panics.
        let entry = InflightEntry {
            registry: Arc::clone(&self.inflight),
            key: key.to_string(),
        };
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let _entry = entry;
            match build.await {
                Ok(output) => {
                    let _ = tx.send(Ok(output.value));
                    if let Some(settle) = output.settle {
                        settle.await;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                }
            }
        });

        let shared = async move {
            match rx.await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(GuardError::Build(e)),
                Err(_) => {
                    tracing::error!("build task ended without a result");
                    Err(GuardError::Aborted)
                }
            }
        }
        .boxed()
        .shared();

        inflight.insert(key.to_string(), shared.clone());
        shared
    }

    /// Number of keys with a build in flight.
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }
}

/// Drops the registry entry for `key` when the build task ends.
struct InflightEntry<T: Clone, E: Clone> {
    registry: Arc<Mutex<HashMap<String, SharedBuild<T, E>>>>,
    key: String,
}

impl<T: Clone, E: Clone> Drop for InflightEntry<T, E> {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.key);
    }
}
