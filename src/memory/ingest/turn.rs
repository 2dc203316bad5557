//! Conversation turn record stored in the per-user history list.

use serde::{Deserialize, Serialize};

use crate::memory::core::errors::{MemoryError, MemoryResult};
use crate::memory::core::ids::RequestId;

/// One round of dialogue: the user's input and the assistant's reply.
///
/// Serialized as `{"input": .., "output": .., "rid": ..}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// What the user said.
    pub input: String,
    /// What the assistant answered.
    pub output: String,
    /// Request that produced the turn; absent for proactive messages.
    #[serde(rename = "rid", default)]
    pub request_id: Option<RequestId>,
}

impl ConversationTurn {
    /// Create a turn answering a request.
    #[must_use]
    pub fn new(
        input: impl Into<String>,
        output: impl Into<String>,
        request_id: Option<RequestId>,
    ) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            request_id,
        }
    }

    /// Create an assistant-initiated turn with no user input.
    #[must_use]
    pub fn proactive(output: impl Into<String>) -> Self {
        Self::new(String::new(), output, None)
    }

    /// Encode for storage.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> MemoryResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a stored turn; `key` only labels the error.
    ///
    /// # Errors
    /// Returns [`MemoryError::CorruptValue`] for malformed payloads.
    pub fn decode(key: &str, raw: &str) -> MemoryResult<Self> {
        serde_json::from_str(raw).map_err(|err| MemoryError::corrupt(key, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let turn = ConversationTurn::new("hi", "hello", Some(RequestId::new("r1").unwrap()));
        let raw = turn.encode().unwrap();
        assert_eq!(raw, r#"{"input":"hi","output":"hello","rid":"r1"}"#);
        assert_eq!(ConversationTurn::decode("k", &raw).unwrap(), turn);
    }

    #[test]
    fn test_decode_without_rid() {
        let turn = ConversationTurn::decode("k", r#"{"input":"","output":"good morning"}"#).unwrap();
        assert_eq!(turn, ConversationTurn::proactive("good morning"));
    }

    #[test]
    fn test_decode_corrupt() {
        assert!(matches!(
            ConversationTurn::decode("session:u:history", "not json"),
            Err(MemoryError::CorruptValue { .. })
        ));
    }
}
