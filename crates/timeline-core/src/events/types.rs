//! Event types for timeline mutations.
//!
//! Events travel as MessagePack maps. Identifiers are carried as strings and
//! are only parsed by the consumer, so a malformed identifier can be told
//! apart from a malformed message.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Fully qualified message type name of [`ChangeTaskEvent`].
pub const CHANGE_TASK_EVENT_TYPE: &str = "timeline.v1.ChangeTaskEvent";

/// Header carrying the message type, used to skip uninteresting messages
/// without decoding them.
pub const MESSAGE_TYPE_HEADER: &str = "fngpnt";

/// Kind of change a [`ChangeTaskEvent`] describes.
///
/// Unrecognised wire values are kept as [`ChangeType::Unknown`] so newer
/// producers do not break older consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum ChangeType {
    /// A user published a post that belongs in a follower's timeline
    PostInsert,
    /// A post was removed and must leave a follower's timeline
    PostDelete,
    /// A user was deleted, their timeline goes with them
    UserDelete,
    /// A user followed someone
    UserSubscribe,
    /// A user unfollowed someone
    UserUnsubscribe,
    Unknown(i32),
}

impl ChangeType {
    /// Returns the string representation of the change type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::PostInsert => "post_insert",
            ChangeType::PostDelete => "post_delete",
            ChangeType::UserDelete => "user_delete",
            ChangeType::UserSubscribe => "user_subscribe",
            ChangeType::UserUnsubscribe => "user_unsubscribe",
            ChangeType::Unknown(_) => "unknown",
        }
    }
}

impl From<i32> for ChangeType {
    fn from(value: i32) -> Self {
        match value {
            1 => ChangeType::PostInsert,
            2 => ChangeType::PostDelete,
            3 => ChangeType::UserDelete,
            4 => ChangeType::UserSubscribe,
            5 => ChangeType::UserUnsubscribe,
            other => ChangeType::Unknown(other),
        }
    }
}

impl From<ChangeType> for i32 {
    fn from(value: ChangeType) -> Self {
        match value {
            ChangeType::PostInsert => 1,
            ChangeType::PostDelete => 2,
            ChangeType::UserDelete => 3,
            ChangeType::UserSubscribe => 4,
            ChangeType::UserUnsubscribe => 5,
            ChangeType::Unknown(other) => other,
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Notification that a user's home timeline needs to change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeTaskEvent {
    pub change_type: ChangeType,
    /// Acting user: the post author, or the follower for (un)subscribe events
    #[serde(default)]
    pub user_id: String,
    /// User whose timeline changes, or the followee for (un)subscribe events
    #[serde(default)]
    pub target_user_id: String,
    #[serde(default)]
    pub post_id: String,
}

impl ChangeTaskEvent {
    pub fn new(
        change_type: ChangeType,
        user_id: impl Into<String>,
        target_user_id: impl Into<String>,
        post_id: impl Into<String>,
    ) -> Self {
        Self {
            change_type,
            user_id: user_id.into(),
            target_user_id: target_user_id.into(),
            post_id: post_id.into(),
        }
    }

    /// Create a "post inserted" event: `author`'s post lands in `target`'s timeline.
    pub fn post_insert(
        author: impl Into<String>,
        target: impl Into<String>,
        post: impl Into<String>,
    ) -> Self {
        Self::new(ChangeType::PostInsert, author, target, post)
    }

    /// Create a "post deleted" event.
    pub fn post_delete(
        author: impl Into<String>,
        target: impl Into<String>,
        post: impl Into<String>,
    ) -> Self {
        Self::new(ChangeType::PostDelete, author, target, post)
    }

    /// Create a "user deleted" event for `target`'s timeline.
    pub fn user_delete(target: impl Into<String>) -> Self {
        Self::new(ChangeType::UserDelete, "", target, "")
    }

    /// Create a "user subscribed" event: `user` now follows `target`.
    pub fn user_subscribe(user: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(ChangeType::UserSubscribe, user, target, "")
    }

    /// Create a "user unsubscribed" event: `user` no longer follows `target`.
    pub fn user_unsubscribe(user: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(ChangeType::UserUnsubscribe, user, target, "")
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;

    #[test]
    fn test_change_type_wire_values() {
        assert_eq!(i32::from(ChangeType::PostInsert), 1);
        assert_eq!(i32::from(ChangeType::UserUnsubscribe), 5);
        assert_eq!(ChangeType::from(3), ChangeType::UserDelete);
        assert_eq!(ChangeType::from(0), ChangeType::Unknown(0));
        assert_eq!(ChangeType::from(42), ChangeType::Unknown(42));
    }

    #[test]
    fn test_event_binary_roundtrip() {
        let event = ChangeTaskEvent::post_insert(
            "9m4e2mr0ui3e8a215n4g",
            "cv3u8rh3rkbbf6k8kdmg",
            "cv3u8rp3rkbbf6k8kdn0",
        );
        let bytes = event.encode().unwrap();
        let decoded = ChangeTaskEvent::decode(&bytes).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_unknown_change_type_survives_decoding() {
        let event = ChangeTaskEvent::new(ChangeType::Unknown(77), "a", "b", "c");
        let decoded = ChangeTaskEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded.change_type, ChangeType::Unknown(77));
    }

    #[test]
    fn test_missing_fields_default_to_empty() {
        #[derive(Serialize)]
        struct Partial {
            change_type: i32,
            target_user_id: &'static str,
        }
        let bytes = rmp_serde::to_vec_named(&Partial {
            change_type: 3,
            target_user_id: "x",
        })
        .unwrap();
        let decoded = ChangeTaskEvent::decode(&bytes).unwrap();
        assert_eq!(decoded.change_type, ChangeType::UserDelete);
        assert!(decoded.user_id.is_empty());
        assert!(decoded.post_id.is_empty());
    }

    #[test]
    fn test_garbage_payload_fails_to_decode() {
        let err = ChangeTaskEvent::decode(b"\xff\x00garbage").unwrap_err();
        assert!(matches!(err, CoreError::Decode(_)));
    }

    #[test]
    fn test_change_type_display() {
        assert_eq!(ChangeType::PostDelete.to_string(), "post_delete");
        assert_eq!(ChangeType::Unknown(9).to_string(), "unknown");
    }
}
