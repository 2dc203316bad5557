//! Key naming for every per-user state family.

use crate::memory::core::ids::{AudioId, RequestId, UserId};

/// Prefix of the last-activity records scanned by the idle sweeper.
pub const LAST_ACTIVE_PREFIX: &str = "session:last_active:";

/// Ordered list of JSON-encoded turns.
#[must_use]
pub fn history(user: &UserId) -> String {
    format!("session:{user}:history")
}

/// Running summary text.
#[must_use]
pub fn summary_text(user: &UserId) -> String {
    format!("session:{user}:summary:text")
}

/// Number of rounds folded into the summary.
#[must_use]
pub fn summary_rounds(user: &UserId) -> String {
    format!("session:{user}:summary:rounds")
}

/// Session lifecycle state.
#[must_use]
pub fn session_state(user: &UserId) -> String {
    format!("session:{user}:state")
}

/// Sliding idle marker.
#[must_use]
pub fn active_marker(user: &UserId) -> String {
    format!("session:active:{user}")
}

/// Unix timestamp of the last user activity.
#[must_use]
pub fn last_active(user: &UserId) -> String {
    format!("{LAST_ACTIVE_PREFIX}{user}")
}

/// Buffered partial transcripts of one clip.
#[must_use]
pub fn audio_buffer(user: &UserId, audio: &AudioId) -> String {
    format!("audio:{user}:{audio}:buf")
}

/// Cached final reply for one clip.
#[must_use]
pub fn audio_result(user: &UserId, audio: &AudioId) -> String {
    format!("audio:{user}:{audio}:result")
}

/// Processing lock of one clip.
#[must_use]
pub fn audio_lock(user: &UserId, audio: &AudioId) -> String {
    format!("lock:audio:{user}:{audio}")
}

/// Write-once marker of a processed request.
#[must_use]
pub fn processed(user: &UserId, request: &RequestId) -> String {
    format!("processed:{user}:{request}")
}

/// Fixed keys owned by a user.
#[must_use]
pub fn session_keys(user: &UserId) -> Vec<String> {
    vec![
        history(user),
        summary_text(user),
        summary_rounds(user),
        session_state(user),
        active_marker(user),
        last_active(user),
    ]
}

/// Prefixes of the per-user families with open-ended key sets.
#[must_use]
pub fn scan_prefixes(user: &UserId) -> [String; 3] {
    [
        format!("audio:{user}:"),
        format!("lock:audio:{user}:"),
        format!("processed:{user}:"),
    ]
}

/// Extract the user id from a last-activity key.
#[must_use]
pub fn user_from_last_active(key: &str) -> Option<UserId> {
    key.strip_prefix(LAST_ACTIVE_PREFIX)
        .and_then(|raw| UserId::new(raw).ok())
}
