//! Post references and their fixed-width encoding.
//!
//! A post reference is stored in the cache and handed to clients as a
//! pagination cursor using the same 41-byte layout:
//!
//! ```text
//! | 0..20 author id | 20..40 post id | 40 repost flag ('1' or '0') |
//! ```

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::{ENCODED_LEN, IdError, SortableId};

/// Length of an encoded post reference.
pub const POST_REF_LEN: usize = 2 * ENCODED_LEN + 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("invalid format: expected {POST_REF_LEN} bytes, got {0}")]
    InvalidLength(usize),

    #[error("invalid format: {segment}: {source}")]
    InvalidId {
        segment: &'static str,
        #[source]
        source: IdError,
    },

    #[error("invalid format: repost flag must be '0' or '1', got {0:#04x}")]
    InvalidFlag(u8),
}

/// Reference to a post in a timeline: who wrote it and which post it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PostRef {
    pub author_id: SortableId,
    pub post_id: SortableId,
    #[serde(default)]
    pub is_repost: bool,
}

impl PostRef {
    /// Reserved record marking a timeline that was rebuilt and is genuinely empty
    /// (or the end of a stored timeline).
    pub const EMPTY: PostRef = PostRef {
        author_id: SortableId::NIL,
        post_id: SortableId::NIL,
        is_repost: false,
    };

    pub fn new(author_id: SortableId, post_id: SortableId) -> Self {
        Self {
            author_id,
            post_id,
            is_repost: false,
        }
    }

    pub fn repost(author_id: SortableId, post_id: SortableId) -> Self {
        Self {
            author_id,
            post_id,
            is_repost: true,
        }
    }

    pub fn is_empty_marker(&self) -> bool {
        self.author_id.is_nil() && self.post_id.is_nil()
    }

    /// Whether this post was created after `other`.
    pub fn is_newer_than(&self, other: &PostRef) -> bool {
        self.post_id > other.post_id
    }

    pub fn encode(&self) -> [u8; POST_REF_LEN] {
        let mut out = [0u8; POST_REF_LEN];
        out[..ENCODED_LEN].copy_from_slice(&self.author_id.encode());
        out[ENCODED_LEN..2 * ENCODED_LEN].copy_from_slice(&self.post_id.encode());
        out[2 * ENCODED_LEN] = if self.is_repost { b'1' } else { b'0' };
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() != POST_REF_LEN {
            return Err(CodecError::InvalidLength(data.len()));
        }

        let author_id = SortableId::decode(&data[..ENCODED_LEN]).map_err(|source| {
            CodecError::InvalidId {
                segment: "author id",
                source,
            }
        })?;
        let post_id =
            SortableId::decode(&data[ENCODED_LEN..2 * ENCODED_LEN]).map_err(|source| {
                CodecError::InvalidId {
                    segment: "post id",
                    source,
                }
            })?;
        let is_repost = match data[2 * ENCODED_LEN] {
            b'1' => true,
            b'0' => false,
            other => return Err(CodecError::InvalidFlag(other)),
        };

        Ok(Self {
            author_id,
            post_id,
            is_repost,
        })
    }

    /// Encode as an opaque pagination token.
    pub fn to_token(&self) -> String {
        // every byte of the encoding is ASCII
        self.encode().iter().map(|&b| b as char).collect()
    }

    /// Decode an opaque pagination token.
    pub fn from_token(token: &str) -> Result<Self, CodecError> {
        Self::decode(token.as_bytes())
    }
}

impl fmt::Display for PostRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_token())
    }
}

/// Merge two newest-first lists into one newest-first list of at most `limit` entries.
///
/// Incoming entries whose post is already present in `existing` are skipped,
/// so replaying a merge leaves a single copy of each post.
pub fn merge_newest_first(existing: &[PostRef], incoming: &[PostRef], limit: usize) -> Vec<PostRef> {
    let known: HashSet<SortableId> = existing.iter().map(|p| p.post_id).collect();
    let incoming: Vec<PostRef> = incoming
        .iter()
        .filter(|p| !known.contains(&p.post_id))
        .copied()
        .collect();

    let len = limit.min(existing.len() + incoming.len());
    let mut merged = Vec::with_capacity(len);
    let (mut i, mut j) = (0, 0);

    while merged.len() < len {
        let take_existing = match (existing.get(i), incoming.get(j)) {
            (Some(a), Some(b)) => a.is_newer_than(b),
            (Some(_), None) => true,
            (None, _) => false,
        };
        if take_existing {
            merged.push(existing[i]);
            i += 1;
        } else {
            merged.push(incoming[j]);
            j += 1;
        }
    }

    merged
}
