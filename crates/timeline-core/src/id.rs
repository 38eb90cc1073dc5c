//! Time-sortable 12-byte identifiers with a fixed 20-character text form.
//!
//! Layout of the raw bytes:
//!
//! ```text
//! | 0..4 unix seconds (BE) | 4..7 machine | 7..9 pid (BE) | 9..12 counter (BE) |
//! ```
//!
//! The text form is lowercase base32hex without padding. Because the alphabet
//! is ordered the same way as the 5-bit values it encodes, comparing two
//! identifiers as text gives the same result as comparing their raw bytes,
//! which in turn orders them by creation time.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Length of the raw binary form.
pub const RAW_LEN: usize = 12;

/// Length of the text form.
pub const ENCODED_LEN: usize = 20;

const ALPHABET: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("invalid id length: expected {ENCODED_LEN} characters, got {0}")]
    InvalidLength(usize),

    #[error("invalid id character: {0:?}")]
    InvalidCharacter(char),

    #[error("invalid id: trailing bits are not zero")]
    NonCanonical,
}

/// A globally unique identifier whose ordering follows creation time.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SortableId([u8; RAW_LEN]);

impl SortableId {
    /// The all-zero identifier.
    pub const NIL: SortableId = SortableId([0; RAW_LEN]);

    /// Generate a new identifier stamped with the current time.
    pub fn new() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or_default();
        let counter = counter().fetch_add(1, Ordering::Relaxed);
        Self::from_parts(secs, *machine_id(), std::process::id() as u16, counter)
    }

    /// Build an identifier from its components.
    ///
    /// Only the low 24 bits of `counter` are kept.
    pub fn from_parts(unix_secs: u32, machine: [u8; 3], pid: u16, counter: u32) -> Self {
        let mut raw = [0u8; RAW_LEN];
        raw[0..4].copy_from_slice(&unix_secs.to_be_bytes());
        raw[4..7].copy_from_slice(&machine);
        raw[7..9].copy_from_slice(&pid.to_be_bytes());
        raw[9..12].copy_from_slice(&counter.to_be_bytes()[1..4]);
        Self(raw)
    }

    pub const fn from_bytes(raw: [u8; RAW_LEN]) -> Self {
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; RAW_LEN] {
        &self.0
    }

    pub fn is_nil(&self) -> bool {
        self.0 == [0; RAW_LEN]
    }

    /// Creation time in Unix seconds.
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn counter(&self) -> u32 {
        u32::from_be_bytes([0, self.0[9], self.0[10], self.0[11]])
    }

    /// Encode into the 20-byte text form.
    pub fn encode(&self) -> [u8; ENCODED_LEN] {
        let mut out = [0u8; ENCODED_LEN];
        let mut acc: u32 = 0;
        let mut bits = 0u32;
        let mut i = 0;

        for &byte in &self.0 {
            acc = ((acc << 8) | u32::from(byte)) & 0x1FFF;
            bits += 8;
            while bits >= 5 {
                bits -= 5;
                out[i] = ALPHABET[((acc >> bits) & 0x1F) as usize];
                i += 1;
            }
        }
        if bits > 0 {
            out[i] = ALPHABET[((acc << (5 - bits)) & 0x1F) as usize];
        }

        out
    }

    /// Decode the 20-byte text form.
    pub fn decode(text: &[u8]) -> Result<Self, IdError> {
        if text.len() != ENCODED_LEN {
            return Err(IdError::InvalidLength(text.len()));
        }

        let mut raw = [0u8; RAW_LEN];
        let mut acc: u32 = 0;
        let mut bits = 0u32;
        let mut j = 0;

        for &c in text {
            let value = decode_char(c).ok_or(IdError::InvalidCharacter(c as char))?;
            acc = (acc << 5) | u32::from(value);
            bits += 5;
            if bits >= 8 {
                bits -= 8;
                raw[j] = (acc >> bits) as u8;
                j += 1;
                acc &= (1 << bits) - 1;
            }
        }

        // 20 characters carry 100 bits; the 4 bits past the 12th byte must be zero.
        if acc != 0 {
            return Err(IdError::NonCanonical);
        }

        Ok(Self(raw))
    }

    pub fn parse(text: &str) -> Result<Self, IdError> {
        Self::decode(text.as_bytes())
    }
}

fn decode_char(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'v' => Some(c - b'a' + 10),
        _ => None,
    }
}

fn counter() -> &'static AtomicU32 {
    static COUNTER: OnceLock<AtomicU32> = OnceLock::new();
    COUNTER.get_or_init(|| AtomicU32::new(rand::random::<u32>()))
}

fn machine_id() -> &'static [u8; 3] {
    static MACHINE: OnceLock<[u8; 3]> = OnceLock::new();
    MACHINE.get_or_init(|| {
        let mut hasher = DefaultHasher::new();
        match hostname::get() {
            Ok(name) => name.hash(&mut hasher),
            Err(e) => {
                tracing::debug!(error = %e, "hostname unavailable, using random machine id");
                rand::random::<u64>().hash(&mut hasher);
            }
        }
        let h = hasher.finish().to_be_bytes();
        [h[0], h[1], h[2]]
    })
}

impl fmt::Display for SortableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.encode();
        // The alphabet is ASCII, so this never fails.
        f.write_str(std::str::from_utf8(&text).map_err(|_| fmt::Error)?)
    }
}

impl fmt::Debug for SortableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SortableId({self})")
    }
}

impl FromStr for SortableId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for SortableId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SortableId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
