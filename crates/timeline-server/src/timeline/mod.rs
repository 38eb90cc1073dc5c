//! Home timeline orchestration.
//!
//! [`TimelineService`] serves pages from the cache, rebuilds missing
//! timelines from the relation and post services, and applies the
//! incremental changes delivered by the event consumer.

pub mod guard;
mod mutate;
mod read;
pub mod service;

pub use guard::{BuildOutput, GuardError, StampedeGuard};
pub use service::{BuildError, ServiceError, TimelineConfig, TimelinePage, TimelineService};
