//! Pagination window for timeline reads.

use crate::error::{CoreError, Result};

/// Page size used when the caller does not ask for one.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Largest page a caller can receive.
pub const MAX_PAGE_SIZE: usize = 100;

/// Paging boundary supplied by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    /// Continue toward older posts, starting at the token.
    Next(String),
    /// Go back toward newer posts, ending just before the token.
    Prev(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pagination {
    pub size: i64,
    pub cursor: Option<Cursor>,
}

impl Pagination {
    pub fn first_page(size: i64) -> Self {
        Self { size, cursor: None }
    }

    pub fn next(size: i64, token: impl Into<String>) -> Self {
        Self {
            size,
            cursor: Some(Cursor::Next(token.into())),
        }
    }

    pub fn prev(size: i64, token: impl Into<String>) -> Self {
        Self {
            size,
            cursor: Some(Cursor::Prev(token.into())),
        }
    }

    /// Build from optional request parameters; empty tokens count as absent.
    pub fn from_parts(
        size: Option<i64>,
        next_token: Option<String>,
        prev_token: Option<String>,
    ) -> Result<Self> {
        let next_token = next_token.filter(|t| !t.is_empty());
        let prev_token = prev_token.filter(|t| !t.is_empty());
        let cursor = match (next_token, prev_token) {
            (Some(_), Some(_)) => {
                return Err(CoreError::invalid_argument(
                    "only one of next and previous page token may be set",
                ));
            }
            (Some(t), None) => Some(Cursor::Next(t)),
            (None, Some(t)) => Some(Cursor::Prev(t)),
            (None, None) => None,
        };
        Ok(Self {
            size: size.unwrap_or(0),
            cursor,
        })
    }

    /// Page size after validation: negative sizes are rejected, zero means the
    /// default and anything above the maximum is clamped.
    pub fn effective_size(&self) -> Result<usize> {
        if self.size < 0 {
            return Err(CoreError::invalid_argument(
                "invalid pagination parameter: negative size",
            ));
        }
        Ok(match self.size as usize {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        })
    }
}
