//! Long-term memory atoms.
//!
//! An atom is one durable fact about a user ("allergic to penicillin",
//! "prefers morning reminders"). Atoms are keyed by `(user, type, norm_key)`:
//! re-extracting the same fact overwrites the previous row instead of adding a
//! second one.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::memory::core::errors::{MemoryError, MemoryResult};
use crate::memory::core::ids::{SessionId, UserId};

/// Maximum length of an atom type.
pub const MAX_TYPE_CHARS: usize = 32;
/// Maximum length of a normalized key.
pub const MAX_NORM_KEY_CHARS: usize = 128;
/// Maximum length of atom text.
pub const MAX_TEXT_CHARS: usize = 2_000;
/// Type used when the extractor gives none.
pub const DEFAULT_ATOM_TYPE: &str = "other";
/// Importance used when the extractor gives none.
pub const DEFAULT_IMPORTANCE: u8 = 3;
/// Confidence used when the extractor gives none.
pub const DEFAULT_CONFIDENCE: f32 = 0.7;

/// Lifecycle status of a memory atom.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AtomStatus {
    /// Eligible for retrieval.
    #[default]
    Active,
    /// Replaced by a newer fact.
    Superseded,
    /// Retired by an operator.
    Archived,
}

impl AtomStatus {
    /// Stored representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Superseded => "superseded",
            Self::Archived => "archived",
        }
    }
}

impl fmt::Display for AtomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AtomStatus {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "superseded" => Ok(Self::Superseded),
            "archived" => Ok(Self::Archived),
            other => Err(MemoryError::InvalidAtom(format!("unknown status {other:?}"))),
        }
    }
}

/// Derive the primary key of an atom.
///
/// First 8 bytes of `SHA-256("{user}|{type}|{norm_key}")` read big-endian,
/// with the sign bit cleared.
#[must_use]
pub fn atom_primary_key(user_id: &UserId, atom_type: &str, norm_key: &str) -> i64 {
    let digest = Sha256::digest(format!("{user_id}|{atom_type}|{norm_key}").as_bytes());
    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes) & i64::MAX
}

/// Key assigned to atoms the extractor did not key.
#[must_use]
pub fn auto_norm_key(text: &str) -> String {
    let head: String = text.chars().take(64).collect();
    let digest = hex::encode(Sha256::digest(head.as_bytes()));
    format!("auto:{}", &digest[..24])
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Read a JSON number or numeric string; anything else counts as absent.
fn lenient_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|n| n.is_finite())
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn lenient_int<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(lenient_number)
        .map(|n| n.round().clamp(i64::MIN as f64, i64::MAX as f64) as i64))
}

fn lenient_float<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(lenient_number))
}

/// Raw atom proposed by an extractor, before normalization.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AtomCandidate {
    /// Category, e.g. `allergy`, `preference`.
    #[serde(rename = "type", default)]
    pub atom_type: Option<String>,
    /// Stable key of the fact inside its category.
    #[serde(alias = "normKey", alias = "nk", default)]
    pub norm_key: Option<String>,
    /// Human readable fact.
    #[serde(default)]
    pub text: String,
    /// Importance, 1 to 5.
    #[serde(default, deserialize_with = "lenient_int")]
    pub importance: Option<i64>,
    /// Confidence, 0 to 1.
    #[serde(default, deserialize_with = "lenient_float")]
    pub confidence: Option<f64>,
    /// Times the fact came up; at least 1.
    #[serde(alias = "timesSeen", default, deserialize_with = "lenient_int")]
    pub times_seen: Option<i64>,
}

impl AtomCandidate {
    /// Apply length limits and defaults. Returns `None` for blank text.
    #[must_use]
    pub fn normalize(self) -> Option<AtomDraft> {
        let text = truncate_chars(self.text.trim(), MAX_TEXT_CHARS);
        if text.is_empty() {
            return None;
        }

        let atom_type = self
            .atom_type
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .map_or_else(
                || DEFAULT_ATOM_TYPE.to_string(),
                |t| truncate_chars(&t, MAX_TYPE_CHARS),
            );

        let norm_key = self
            .norm_key
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .map_or_else(
                || auto_norm_key(&text),
                |k| truncate_chars(&k, MAX_NORM_KEY_CHARS),
            );

        let importance = self.importance.map_or(DEFAULT_IMPORTANCE, |i| {
            u8::try_from(i.clamp(1, 5)).unwrap_or(DEFAULT_IMPORTANCE)
        });

        #[allow(clippy::cast_possible_truncation)]
        let confidence = self
            .confidence
            .filter(|c| c.is_finite())
            .map_or(DEFAULT_CONFIDENCE, |c| c.clamp(0.0, 1.0) as f32);

        let times_seen = self
            .times_seen
            .map_or(1, |n| u32::try_from(n.max(1)).unwrap_or(u32::MAX));

        Some(AtomDraft {
            atom_type,
            norm_key,
            text,
            importance,
            confidence,
            times_seen,
        })
    }
}

/// Normalized atom waiting for its embedding.
#[derive(Clone, Debug, PartialEq)]
pub struct AtomDraft {
    /// Category.
    pub atom_type: String,
    /// Normalized key.
    pub norm_key: String,
    /// Fact text.
    pub text: String,
    /// Importance, 1 to 5.
    pub importance: u8,
    /// Confidence, 0 to 1.
    pub confidence: f32,
    /// Times the fact came up, at least 1.
    pub times_seen: u32,
}

impl AtomDraft {
    /// Text sent to the embedder: `"[norm_key] text"`.
    #[must_use]
    pub fn embedding_input(&self) -> String {
        format!("[{}] {}", self.norm_key, self.text)
    }

    /// Attach ownership, provenance and embedding.
    #[must_use]
    pub fn into_atom(
        self,
        user_id: UserId,
        source_session_id: Option<SessionId>,
        embedding: Vec<f32>,
        now: DateTime<Utc>,
    ) -> MemoryAtom {
        MemoryAtom {
            pk: atom_primary_key(&user_id, &self.atom_type, &self.norm_key),
            user_id,
            atom_type: self.atom_type,
            norm_key: self.norm_key,
            text: self.text,
            importance: self.importance,
            confidence: self.confidence,
            times_seen: self.times_seen,
            status: AtomStatus::Active,
            source_session_id,
            created_at: now,
            updated_at: now,
            last_used_at: None,
            embedding,
        }
    }
}

/// A stored long-term memory fact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryAtom {
    /// Primary key, see [`atom_primary_key`].
    pub pk: i64,
    /// Owner.
    pub user_id: UserId,
    /// Category.
    #[serde(rename = "type")]
    pub atom_type: String,
    /// Normalized key.
    pub norm_key: String,
    /// Fact text.
    pub text: String,
    /// Importance, 1 to 5.
    pub importance: u8,
    /// Confidence, 0 to 1.
    pub confidence: f32,
    /// How many times the fact was retrieved or re-extracted.
    pub times_seen: u32,
    /// Lifecycle status.
    pub status: AtomStatus,
    /// Session the fact was extracted from.
    pub source_session_id: Option<SessionId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
    /// Last retrieval time.
    pub last_used_at: Option<DateTime<Utc>>,
    /// Embedding vector.
    pub embedding: Vec<f32>,
}

impl MemoryAtom {
    /// Check the atom against the index dimension and field ranges.
    ///
    /// # Errors
    /// Returns an error describing the first violated constraint.
    pub fn validate(&self, dims: usize) -> MemoryResult<()> {
        if self.embedding.len() != dims {
            return Err(MemoryError::DimensionMismatch {
                expected: dims,
                got: self.embedding.len(),
            });
        }
        if self.embedding.iter().any(|v| !v.is_finite()) {
            return Err(MemoryError::InvalidAtom(
                "embedding contains non-finite values".to_string(),
            ));
        }
        if !(1..=5).contains(&self.importance) {
            return Err(MemoryError::InvalidAtom(format!(
                "importance {} outside 1..=5",
                self.importance
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(MemoryError::InvalidAtom(format!(
                "confidence {} outside 0..=1",
                self.confidence
            )));
        }
        if self.text.trim().is_empty() {
            return Err(MemoryError::InvalidAtom("empty text".to_string()));
        }
        if self.atom_type.is_empty() || self.atom_type.chars().count() > MAX_TYPE_CHARS {
            return Err(MemoryError::InvalidAtom("bad type length".to_string()));
        }
        if self.norm_key.is_empty() || self.norm_key.chars().count() > MAX_NORM_KEY_CHARS {
            return Err(MemoryError::InvalidAtom("bad norm_key length".to_string()));
        }
        if self.text.chars().count() > MAX_TEXT_CHARS {
            return Err(MemoryError::InvalidAtom("text too long".to_string()));
        }
        Ok(())
    }

    /// Reference time for recency: last use, else last write.
    #[must_use]
    pub fn recency_anchor(&self) -> DateTime<Utc> {
        self.last_used_at.unwrap_or(self.updated_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserId {
        UserId::new("u1").unwrap()
    }

    #[test]
    fn test_primary_key_is_deterministic_and_non_negative() {
        let a = atom_primary_key(&user(), "allergy", "penicillin");
        let b = atom_primary_key(&user(), "allergy", "penicillin");
        let c = atom_primary_key(&user(), "allergy", "peanut");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a >= 0 && c >= 0);
    }

    #[test]
    fn test_normalize_applies_defaults() {
        let draft = AtomCandidate {
            text: "  Likes green tea  ".to_string(),
            ..AtomCandidate::default()
        }
        .normalize()
        .unwrap();

        assert_eq!(draft.atom_type, "other");
        assert_eq!(draft.text, "Likes green tea");
        assert_eq!(draft.importance, 3);
        assert!((draft.confidence - 0.7).abs() < f32::EPSILON);
        assert!(draft.norm_key.starts_with("auto:"));
        assert_eq!(draft.norm_key.len(), "auto:".len() + 24);
    }

    #[test]
    fn test_normalize_truncates_and_clamps() {
        let draft = AtomCandidate {
            atom_type: Some("X".repeat(40)),
            norm_key: Some("k".repeat(200)),
            text: "t".repeat(2_500),
            importance: Some(9),
            confidence: Some(1.5),
            times_seen: Some(-3),
        }
        .normalize()
        .unwrap();

        assert_eq!(draft.atom_type.chars().count(), MAX_TYPE_CHARS);
        assert_eq!(draft.norm_key.chars().count(), MAX_NORM_KEY_CHARS);
        assert_eq!(draft.text.chars().count(), MAX_TEXT_CHARS);
        assert_eq!(draft.importance, 5);
        assert!((draft.confidence - 1.0).abs() < f32::EPSILON);
        assert_eq!(draft.times_seen, 1);
    }

    #[test]
    fn test_times_seen_carried_into_atom() {
        let candidates: Vec<AtomCandidate> = serde_json::from_str(
            r#"[{"type":"diet","normKey":"light","text":"Prefers light dinners","times_seen":4},
                {"type":"diet","normKey":"tea","text":"Drinks green tea","timesSeen":2},
                {"text":"Walks daily"}]"#,
        )
        .unwrap();
        let seen: Vec<u32> = candidates
            .into_iter()
            .map(|c| {
                c.normalize()
                    .unwrap()
                    .into_atom(user(), None, vec![0.1], Utc::now())
                    .times_seen
            })
            .collect();
        assert_eq!(seen, vec![4, 2, 1]);
    }

    #[test]
    fn test_numeric_fields_accept_loose_types() {
        let candidates: Vec<AtomCandidate> = serde_json::from_str(
            r#"[{"text":"a","importance":3.5,"confidence":"0.8","times_seen":"2"},
                {"text":"b","importance":"4","confidence":1},
                {"text":"c","importance":"high","confidence":null}]"#,
        )
        .unwrap();

        assert_eq!(candidates[0].importance, Some(4));
        assert_eq!(candidates[0].confidence, Some(0.8));
        assert_eq!(candidates[0].times_seen, Some(2));
        assert_eq!(candidates[1].importance, Some(4));
        assert_eq!(candidates[1].confidence, Some(1.0));
        assert_eq!(candidates[2].importance, None);
        assert_eq!(candidates[2].confidence, None);
        assert_eq!(candidates[2].clone().normalize().unwrap().importance, DEFAULT_IMPORTANCE);
    }

    #[test]
    fn test_blank_candidate_is_dropped() {
        let candidate = AtomCandidate {
            text: "   ".to_string(),
            ..AtomCandidate::default()
        };
        assert!(candidate.normalize().is_none());
    }

    #[test]
    fn test_candidate_accepts_camel_case_key() {
        let candidate: AtomCandidate =
            serde_json::from_str(r#"{"type":"allergy","normKey":"penicillin","text":"Allergic to penicillin","importance":5}"#)
                .unwrap();
        assert_eq!(candidate.norm_key.as_deref(), Some("penicillin"));
        let draft = candidate.normalize().unwrap();
        assert_eq!(draft.embedding_input(), "[penicillin] Allergic to penicillin");
    }

    #[test]
    fn test_validate_rejects_bad_atoms() {
        let draft = AtomCandidate {
            text: "fact".to_string(),
            ..AtomCandidate::default()
        }
        .normalize()
        .unwrap();
        let atom = draft.into_atom(user(), None, vec![0.1, 0.2], Utc::now());
        atom.validate(2).unwrap();

        assert!(matches!(
            atom.validate(3),
            Err(MemoryError::DimensionMismatch { expected: 3, got: 2 })
        ));

        let mut bad = atom.clone();
        bad.importance = 0;
        assert!(bad.validate(2).is_err());

        let mut bad = atom;
        bad.confidence = -0.1;
        assert!(bad.validate(2).is_err());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [AtomStatus::Active, AtomStatus::Superseded, AtomStatus::Archived] {
            assert_eq!(status.as_str().parse::<AtomStatus>().unwrap(), status);
        }
        assert!("deleted".parse::<AtomStatus>().is_err());
    }
}
