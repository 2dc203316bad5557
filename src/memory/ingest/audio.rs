//! Streamed audio reassembly and per-clip processing lock.
//!
//! A voice message arrives as several partial transcripts followed by a final
//! one. Partials are buffered per `(user, audio)`; the final fragment takes a
//! TTL lock, drains the buffer and produces exactly one reply, which is cached
//! for duplicate deliveries.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::memory::core::config::AudioConfig;
use crate::memory::core::errors::MemoryResult;
use crate::memory::core::ids::{AudioId, UserId};
use crate::memory::kv::keys;
use crate::memory::kv::store::KvStore;

/// Result of submitting a final fragment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AudioOutcome {
    /// This call produced the reply.
    Processed(String),
    /// The reply was already produced by an earlier delivery.
    Cached(String),
    /// Another worker holds the lock; the placeholder reply is returned.
    StillProcessing(String),
}

impl AudioOutcome {
    /// Reply text to send back.
    #[must_use]
    pub fn reply(&self) -> &str {
        match self {
            Self::Processed(text) | Self::Cached(text) | Self::StillProcessing(text) => text,
        }
    }

    /// Consume into the reply text.
    #[must_use]
    pub fn into_reply(self) -> String {
        match self {
            Self::Processed(text) | Self::Cached(text) | Self::StillProcessing(text) => text,
        }
    }
}

/// Join trimmed, non-empty fragments with single spaces.
#[must_use]
pub fn merge_fragments<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    parts
        .into_iter()
        .filter_map(|part| {
            let trimmed = part.as_ref().trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Buffers audio fragments and serializes final processing per clip.
#[derive(Clone)]
pub struct AudioReassembler {
    kv: Arc<dyn KvStore>,
    config: AudioConfig,
}

impl AudioReassembler {
    /// Create a reassembler.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, config: AudioConfig) -> Self {
        Self { kv, config }
    }

    /// Buffer a partial transcript.
    ///
    /// Returns `false` without buffering when the clip is already being
    /// processed or has a cached reply, or when the fragment is blank.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable.
    pub async fn append_fragment(
        &self,
        user: &UserId,
        audio: &AudioId,
        text: &str,
    ) -> MemoryResult<bool> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(false);
        }
        if self.kv.exists(&keys::audio_lock(user, audio)).await?
            || self.kv.exists(&keys::audio_result(user, audio)).await?
        {
            debug!(user = %user, audio = %audio, "fragment after finalization dropped");
            return Ok(false);
        }
        let ttl = Duration::from_secs(self.config.fragment_ttl_seconds);
        self.kv
            .push_back(&keys::audio_buffer(user, audio), text, Some(ttl))
            .await?;
        Ok(true)
    }

    /// Try to take the processing lock of a clip.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable.
    pub async fn acquire_lock(
        &self,
        user: &UserId,
        audio: &AudioId,
        ttl: Duration,
    ) -> MemoryResult<bool> {
        self.kv
            .set_nx(&keys::audio_lock(user, audio), "1", Some(ttl))
            .await
    }

    /// Release the processing lock unconditionally.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable.
    pub async fn release_lock(&self, user: &UserId, audio: &AudioId) -> MemoryResult<()> {
        self.kv.delete(vec![keys::audio_lock(user, audio)]).await?;
        Ok(())
    }

    /// Atomically take every buffered fragment and clear the buffer.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable.
    pub async fn drain_and_clear(&self, user: &UserId, audio: &AudioId) -> MemoryResult<String> {
        let parts = self.kv.drain_list(&keys::audio_buffer(user, audio)).await?;
        Ok(merge_fragments(parts))
    }

    /// Cached final reply, if any.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable.
    pub async fn cached_result(
        &self,
        user: &UserId,
        audio: &AudioId,
    ) -> MemoryResult<Option<String>> {
        self.kv.get(&keys::audio_result(user, audio)).await
    }

    /// Cache the final reply.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable.
    pub async fn store_result(
        &self,
        user: &UserId,
        audio: &AudioId,
        reply: &str,
        ttl: Duration,
    ) -> MemoryResult<()> {
        self.kv
            .set(&keys::audio_result(user, audio), reply, Some(ttl))
            .await
    }

    /// Process the final fragment of a clip exactly once.
    ///
    /// Takes the lock, merges the buffered head with `final_text`, runs `work`
    /// on the merged transcript and caches its reply. The lock is released on
    /// every path once acquired, including when `work` fails.
    ///
    /// # Errors
    /// Returns the error of `work` or of the store.
    pub async fn process_final<F, Fut>(
        &self,
        user: &UserId,
        audio: &AudioId,
        final_text: &str,
        work: F,
    ) -> MemoryResult<AudioOutcome>
    where
        F: FnOnce(String) -> Fut + Send,
        Fut: Future<Output = MemoryResult<String>> + Send,
    {
        if !self.acquire_lock(user, audio, self.config.lock_ttl()).await? {
            return Ok(match self.cached_result(user, audio).await? {
                Some(reply) => AudioOutcome::Cached(reply),
                None => {
                    debug!(user = %user, audio = %audio, "clip locked by another worker");
                    AudioOutcome::StillProcessing(self.config.processing_placeholder.clone())
                }
            });
        }

        let outcome = self.process_locked(user, audio, final_text, work).await;

        if let Err(err) = self.release_lock(user, audio).await {
            warn!(user = %user, audio = %audio, ?err, "failed to release audio lock");
        }
        outcome
    }

    async fn process_locked<F, Fut>(
        &self,
        user: &UserId,
        audio: &AudioId,
        final_text: &str,
        work: F,
    ) -> MemoryResult<AudioOutcome>
    where
        F: FnOnce(String) -> Fut + Send,
        Fut: Future<Output = MemoryResult<String>> + Send,
    {
        if let Some(reply) = self.cached_result(user, audio).await? {
            return Ok(AudioOutcome::Cached(reply));
        }

        let head = self.drain_and_clear(user, audio).await?;
        let merged = merge_fragments([head.as_str(), final_text]);
        let reply = work(merged).await?;

        let ttl = Duration::from_secs(self.config.result_ttl_seconds);
        self.store_result(user, audio, &reply, ttl).await?;
        info!(user = %user, audio = %audio, "audio clip processed");
        Ok(AudioOutcome::Processed(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::core::errors::MemoryError;
    use crate::memory::kv::InMemoryKvStore;

    fn setup() -> (Arc<InMemoryKvStore>, AudioReassembler, UserId, AudioId) {
        let kv = Arc::new(InMemoryKvStore::new());
        let audio = AudioReassembler::new(kv.clone(), AudioConfig::default());
        (
            kv,
            audio,
            UserId::new("u1").unwrap(),
            AudioId::new("clip-1").unwrap(),
        )
    }

    #[test]
    fn test_merge_fragments() {
        assert_eq!(merge_fragments(["  I have ", "", "a headache  "]), "I have a headache");
        assert_eq!(merge_fragments(Vec::<String>::new()), "");
    }

    #[tokio::test]
    async fn test_fragments_merge_into_final() {
        let (_, audio, user, clip) = setup();
        assert!(audio.append_fragment(&user, &clip, "my head").await.unwrap());
        assert!(audio.append_fragment(&user, &clip, " hurts ").await.unwrap());
        assert!(!audio.append_fragment(&user, &clip, "   ").await.unwrap());

        let outcome = audio
            .process_final(&user, &clip, "since morning", |merged| async move {
                assert_eq!(merged, "my head hurts since morning");
                Ok::<_, MemoryError>(format!("reply to: {merged}"))
            })
            .await
            .unwrap();
        assert_eq!(
            outcome,
            AudioOutcome::Processed("reply to: my head hurts since morning".to_string())
        );

        // Redelivery returns the cached reply and never reruns the work.
        let again = audio
            .process_final(&user, &clip, "since morning", |_| async move {
                Err::<String, _>(MemoryError::Collaborator("must not run".to_string()))
            })
            .await
            .unwrap();
        assert_eq!(again.reply(), "reply to: my head hurts since morning");
        assert!(matches!(again, AudioOutcome::Cached(_)));
        assert!(!audio.append_fragment(&user, &clip, "late").await.unwrap());
    }

    #[tokio::test]
    async fn test_locked_clip_returns_placeholder() {
        let (_, audio, user, clip) = setup();
        assert!(audio
            .acquire_lock(&user, &clip, Duration::from_secs(180))
            .await
            .unwrap());
        assert!(!audio.append_fragment(&user, &clip, "late").await.unwrap());

        let outcome = audio
            .process_final(&user, &clip, "x", |_| async move {
                Ok::<_, MemoryError>("y".to_string())
            })
            .await
            .unwrap();
        assert!(matches!(outcome, AudioOutcome::StillProcessing(_)));
        assert_eq!(outcome.reply(), AudioConfig::default().processing_placeholder);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_exclusive_until_ttl() {
        let (_, audio, user, clip) = setup();
        let ttl = Duration::from_secs(3);
        assert!(audio.acquire_lock(&user, &clip, ttl).await.unwrap());
        assert!(!audio.acquire_lock(&user, &clip, ttl).await.unwrap());
        tokio::time::advance(Duration::from_millis(2_900)).await;
        assert!(!audio.acquire_lock(&user, &clip, ttl).await.unwrap());
        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(audio.acquire_lock(&user, &clip, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_released_when_work_fails() {
        let (kv, audio, user, clip) = setup();
        audio.append_fragment(&user, &clip, "hello").await.unwrap();

        let result = audio
            .process_final(&user, &clip, "there", |_| async move {
                Err::<String, _>(MemoryError::Collaborator("model down".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert!(!kv.exists(&keys::audio_lock(&user, &clip)).await.unwrap());
        assert!(audio.cached_result(&user, &clip).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_drain_clears_buffer() {
        let (kv, audio, user, clip) = setup();
        audio.append_fragment(&user, &clip, "a").await.unwrap();
        audio.append_fragment(&user, &clip, "b").await.unwrap();
        assert_eq!(audio.drain_and_clear(&user, &clip).await.unwrap(), "a b");
        assert_eq!(audio.drain_and_clear(&user, &clip).await.unwrap(), "");
        assert!(!kv.exists(&keys::audio_buffer(&user, &clip)).await.unwrap());
    }
}
