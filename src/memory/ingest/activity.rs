//! Session activity markers.
//!
//! Each user has a lifecycle state key, a sliding idle marker and a
//! last-activity timestamp. Refreshing activity never touches the history.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, info};

use crate::memory::core::errors::{MemoryError, MemoryResult};
use crate::memory::core::ids::UserId;
use crate::memory::kv::keys;
use crate::memory::kv::store::{KvStore, KvWrite};

const ACTIVE: &str = "ACTIVE";
const FINALIZING: &str = "FINALIZING";

/// Lifecycle state of a user session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No session; the state key is missing.
    #[default]
    Absent,
    /// Accepting turns.
    Active,
    /// Being finalized; owned by exactly one worker.
    Finalizing,
}

impl SessionState {
    /// Stored value, `None` for [`SessionState::Absent`].
    #[must_use]
    pub const fn as_stored(self) -> Option<&'static str> {
        match self {
            Self::Absent => None,
            Self::Active => Some(ACTIVE),
            Self::Finalizing => Some(FINALIZING),
        }
    }

    /// Parse a stored value.
    ///
    /// # Errors
    /// Returns [`MemoryError::CorruptValue`] for unknown values.
    pub fn from_stored(key: &str, raw: Option<&str>) -> MemoryResult<Self> {
        match raw {
            None => Ok(Self::Absent),
            Some(ACTIVE) => Ok(Self::Active),
            Some(FINALIZING) => Ok(Self::Finalizing),
            Some(other) => Err(MemoryError::corrupt(
                key,
                format!("unknown session state {other:?}"),
            )),
        }
    }
}

/// Maintains the activity markers of user sessions.
#[derive(Clone)]
pub struct ActivityTracker {
    kv: Arc<dyn KvStore>,
    idle_timeout: Duration,
}

impl ActivityTracker {
    /// Create a tracker with the given idle timeout.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, idle_timeout: Duration) -> Self {
        Self { kv, idle_timeout }
    }

    /// Mark the session active (if absent) and push the idle deadline out.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable.
    pub async fn start_or_refresh(&self, user: &UserId, now: DateTime<Utc>) -> MemoryResult<()> {
        let started = self
            .kv
            .set_nx(&keys::session_state(user), ACTIVE, None)
            .await?;
        if started {
            info!(user = %user, "session started");
        }

        let writes = vec![
            KvWrite::set_with_ttl(keys::active_marker(user), "1", self.idle_timeout),
            KvWrite::set(keys::last_active(user), now.timestamp().to_string()),
        ];
        self.kv
            .watch_and_commit(Vec::new(), Box::new(move |_: &[Option<String>]| Some(writes)))
            .await?;
        debug!(user = %user, idle_s = self.idle_timeout.as_secs(), "activity refreshed");
        Ok(())
    }

    /// Whether the idle marker is still alive.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable.
    pub async fn is_active(&self, user: &UserId) -> MemoryResult<bool> {
        self.kv.exists(&keys::active_marker(user)).await
    }

    /// Last recorded activity, if any.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable or the value is malformed.
    pub async fn last_active(&self, user: &UserId) -> MemoryResult<Option<DateTime<Utc>>> {
        let key = keys::last_active(user);
        let Some(raw) = self.kv.get(&key).await? else {
            return Ok(None);
        };
        parse_unix_seconds(&key, &raw).map(Some)
    }
}

/// Parse a unix-seconds timestamp written by [`ActivityTracker`].
///
/// # Errors
/// Returns [`MemoryError::CorruptValue`] if the value is not a valid timestamp.
pub fn parse_unix_seconds(key: &str, raw: &str) -> MemoryResult<DateTime<Utc>> {
    let seconds: i64 = raw
        .trim()
        .parse()
        .map_err(|err| MemoryError::corrupt(key, err))?;
    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| MemoryError::corrupt(key, "timestamp out of range"))
}
