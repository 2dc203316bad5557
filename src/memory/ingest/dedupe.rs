//! Request idempotency.
//!
//! Messaging channels redeliver webhooks. A request is registered once with a
//! write-once marker; later deliveries of the same request are ignored.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::memory::core::errors::MemoryResult;
use crate::memory::core::ids::{RequestId, UserId};
use crate::memory::kv::keys;
use crate::memory::kv::store::KvStore;

/// Marks requests as processed.
#[derive(Clone)]
pub struct RequestDeduplicator {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
    bucket_ms: i64,
}

impl RequestDeduplicator {
    /// Create a deduplicator whose markers live for `ttl`.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration, bucket_ms: i64) -> Self {
        Self { kv, ttl, bucket_ms }
    }

    /// Register a request. Returns `true` only for the first registration.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable.
    pub async fn try_register(&self, user: &UserId, request: &RequestId) -> MemoryResult<bool> {
        let fresh = self
            .kv
            .set_nx(&keys::processed(user, request), "1", Some(self.ttl))
            .await?;
        if !fresh {
            debug!(user = %user, request = %request, "duplicate request");
        }
        Ok(fresh)
    }

    /// Whether a request was already registered.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable.
    pub async fn is_processed(&self, user: &UserId, request: &RequestId) -> MemoryResult<bool> {
        self.kv.exists(&keys::processed(user, request)).await
    }

    /// The transport's request id, or one derived from the text and time bucket.
    #[must_use]
    pub fn request_id_for(
        &self,
        user: &UserId,
        text: &str,
        supplied: Option<RequestId>,
        now_ms: i64,
    ) -> RequestId {
        supplied.unwrap_or_else(|| RequestId::derive(user, text, now_ms, self.bucket_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::kv::InMemoryKvStore;

    fn dedupe() -> RequestDeduplicator {
        RequestDeduplicator::new(
            Arc::new(InMemoryKvStore::new()),
            Duration::from_secs(60),
            RequestId::DEFAULT_BUCKET_MS,
        )
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let dedupe = dedupe();
        let user = UserId::new("u1").unwrap();
        let request = RequestId::new("r1").unwrap();

        assert!(dedupe.try_register(&user, &request).await.unwrap());
        assert!(!dedupe.try_register(&user, &request).await.unwrap());
        assert!(!dedupe.try_register(&user, &request).await.unwrap());
        assert!(dedupe.is_processed(&user, &request).await.unwrap());

        let other = UserId::new("u2").unwrap();
        assert!(dedupe.try_register(&other, &request).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_marker_expires() {
        let dedupe = dedupe();
        let user = UserId::new("u1").unwrap();
        let request = RequestId::new("r1").unwrap();
        assert!(dedupe.try_register(&user, &request).await.unwrap());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(dedupe.try_register(&user, &request).await.unwrap());
    }

    #[test]
    fn test_request_id_for_prefers_supplied() {
        let dedupe = dedupe();
        let user = UserId::new("u1").unwrap();
        let supplied = RequestId::new("wamid.1").unwrap();
        assert_eq!(
            dedupe.request_id_for(&user, "hi", Some(supplied.clone()), 0),
            supplied
        );
        assert_eq!(
            dedupe.request_id_for(&user, "hi", None, 1_000),
            dedupe.request_id_for(&user, "hi", None, 2_999)
        );
    }
}
