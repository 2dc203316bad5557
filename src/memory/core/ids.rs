// File: src/memory/core/ids.rs

//! Identifier types for the dialogue memory engine.
//!
//! User, audio and request identifiers arrive from outside (channel user ids,
//! object names, transport request ids) so they are validated string newtypes.
//! Every one of them is embedded in key names such as `audio:{user}:{audio}:buf`,
//! therefore `:` and glob metacharacters are rejected: two distinct ids can
//! never produce overlapping key families or prefix scans.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Errors returned when parsing/validating an external identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    /// Empty (or whitespace-only) identifier.
    Empty,
    /// Exceeds the maximum accepted length.
    TooLong {
        /// Maximum allowed length.
        max: usize,
        /// Actual length received.
        got: usize,
    },
    /// Contains a disallowed character.
    InvalidChar {
        /// The invalid character.
        ch: char,
        /// The index where it was found.
        index: usize,
    },
}

impl fmt::Display for IdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "identifier must not be empty"),
            Self::TooLong { max, got } => write!(f, "identifier too long: got {got}, max {max}"),
            Self::InvalidChar { ch, index } => {
                write!(
                    f,
                    "identifier contains invalid character {ch:?} at index {index}"
                )
            }
        }
    }
}

impl std::error::Error for IdError {}

impl From<IdError> for crate::memory::core::errors::MemoryError {
    fn from(value: IdError) -> Self {
        Self::InvalidId(value.to_string())
    }
}

fn validate_id(raw: &str, max_len: usize) -> Result<String, IdError> {
    let s = raw.trim();

    if s.is_empty() {
        return Err(IdError::Empty);
    }
    if s.len() > max_len {
        return Err(IdError::TooLong {
            max: max_len,
            got: s.len(),
        });
    }

    for (i, ch) in s.chars().enumerate() {
        let ok = ch.is_ascii_alphanumeric()
            || matches!(ch, '.' | '_' | '-' | '/' | '+' | '@' | '#' | '=');
        if !ok {
            return Err(IdError::InvalidChar { ch, index: i });
        }
    }

    Ok(s.to_owned())
}

/// Declare a validated string identifier with a consistent API.
macro_rules! define_string_id {
    (
        $(#[$meta:meta])*
        $name:ident,
        max_len = $max:expr
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[repr(transparent)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Hard ceiling to prevent pathological payloads.
            pub const MAX_LEN: usize = $max;

            /// Build a validated identifier.
            ///
            /// # Errors
            /// Returns `IdError` if the input is empty, too long, or contains
            /// characters outside `[A-Za-z0-9._/+@#=-]`.
            pub fn new(raw: impl AsRef<str>) -> Result<Self, IdError> {
                validate_id(raw.as_ref(), Self::MAX_LEN).map(Self)
            }

            /// Borrow as `&str`.
            #[inline]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }
    };
}

define_string_id!(
    /// End-user identifier (channel user id, patient id, ...).
    UserId,
    max_len = 64
);

define_string_id!(
    /// Identifier of one streamed audio clip (usually the uploaded object name).
    AudioId,
    max_len = 128
);

define_string_id!(
    /// Idempotency identifier of one inbound turn.
    RequestId,
    max_len = 128
);

impl AudioId {
    /// Derive a stand-in audio id from the message text.
    ///
    /// Used for plain text messages, which have no uploaded clip: identical text
    /// maps to the same id, so duplicate deliveries contend for the same lock.
    #[must_use]
    pub fn from_text(text: &str) -> Self {
        let digest = hex::encode(Sha256::digest(text.as_bytes()));
        Self(digest[..16].to_string())
    }
}

impl RequestId {
    /// Default bucket width for [`RequestId::derive`].
    pub const DEFAULT_BUCKET_MS: i64 = 3000;

    /// Derive a deterministic request id when the transport provides none.
    ///
    /// The same user sending the same text inside one `bucket_ms` window yields
    /// the same id, which is what makes redelivered webhooks idempotent.
    #[must_use]
    pub fn derive(user_id: &UserId, text: &str, now_ms: i64, bucket_ms: i64) -> Self {
        let bucket = now_ms.div_euclid(bucket_ms.max(1));
        let digest = Sha256::digest(format!("{user_id}|{text}|{bucket}").as_bytes());
        Self(hex::encode(digest))
    }
}

/// Generate an ID intended to have good DB insert locality.
///
/// With feature `uuid_v7` enabled, this uses `Uuid::now_v7()`.
/// Otherwise it falls back to `Uuid::new_v4()`.
#[inline]
#[must_use]
fn uuid_time_ordered() -> Uuid {
    #[cfg(feature = "uuid_v7")]
    {
        Uuid::now_v7()
    }
    #[cfg(not(feature = "uuid_v7"))]
    {
        Uuid::new_v4()
    }
}

/// Identifier of one finalized conversation session.
///
/// Stamped on every memory atom extracted from that session as its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionId {
    /// Create a new identifier.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(uuid_time_ordered())
    }

    /// Borrow the underlying UUID.
    #[inline]
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_validation() {
        assert!(UserId::new("12345").is_ok());
        assert!(UserId::new("  line-U1f2e  ").is_ok());
        assert_eq!(UserId::new("   "), Err(IdError::Empty));
        assert!(matches!(
            UserId::new("a:b"),
            Err(IdError::InvalidChar { ch: ':', index: 1 })
        ));
        assert!(matches!(
            UserId::new("abc*"),
            Err(IdError::InvalidChar { ch: '*', .. })
        ));
        let long = "x".repeat(65);
        assert!(matches!(
            UserId::new(long),
            Err(IdError::TooLong { max: 64, got: 65 })
        ));
    }

    #[test]
    fn test_audio_id_accepts_object_names() {
        let id = AudioId::new("uploads/2024/clip_01.m4a").unwrap();
        assert_eq!(id.as_str(), "uploads/2024/clip_01.m4a");
    }

    #[test]
    fn test_audio_id_from_text_is_stable() {
        let a = AudioId::from_text("hello there");
        let b = AudioId::from_text("hello there");
        let c = AudioId::from_text("hello there!");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 16);
    }

    #[test]
    fn test_request_id_buckets() {
        let user = UserId::new("u1").unwrap();
        let first = RequestId::derive(&user, "hi", 3_000, 3_000);
        let same_bucket = RequestId::derive(&user, "hi", 5_999, 3_000);
        let next_bucket = RequestId::derive(&user, "hi", 6_000, 3_000);
        assert_eq!(first, same_bucket);
        assert_ne!(first, next_bucket);
        assert!(RequestId::new(first.as_str()).is_ok());
    }

    #[test]
    fn test_serde_round_trip_validates() {
        let user = UserId::new("u-7").unwrap();
        let json = serde_json::to_string(&user).unwrap();
        assert_eq!(json, "\"u-7\"");
        assert!(serde_json::from_str::<UserId>("\"bad:id\"").is_err());
    }
}
