//! Timeline change events.
//!
//! Upstream services announce post and follow-graph changes as
//! [`ChangeTaskEvent`] messages. The server's event pipeline decodes them and
//! applies the matching mutation to the cached timelines.
//!
//! # Module Structure
//!
//! - [`types`]: event and change type definitions plus the binary wire format

pub mod types;

pub use types::{CHANGE_TASK_EVENT_TYPE, ChangeTaskEvent, ChangeType, MESSAGE_TYPE_HEADER};
