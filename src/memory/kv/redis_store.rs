//! Redis implementation of [`KvStore`] over a `deadpool-redis` pool.

use std::time::Duration;

use deadpool_redis::redis::{self, AsyncCommands};
use deadpool_redis::{Config, Connection, Pool, PoolConfig, Runtime};
use tracing::debug;

use crate::memory::core::config::StorageConfig;
use crate::memory::core::errors::MemoryResult;
use crate::memory::kv::store::{KvFuture, KvStore, KvWrite, TxnPlan};

const SCAN_BATCH: usize = 256;

/// Redis-backed key-value store.
#[derive(Clone)]
pub struct RedisKvStore {
    pool: Pool,
}

impl RedisKvStore {
    /// Build a pooled store from storage settings.
    ///
    /// # Errors
    /// Returns an error if the pool cannot be created.
    pub fn new(config: &StorageConfig) -> MemoryResult<Self> {
        let mut cfg = Config::from_url(config.redis_url.clone());
        cfg.pool = Some(PoolConfig::new(config.redis_pool_size));
        let pool = cfg.create_pool(Some(Runtime::Tokio1))?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> MemoryResult<Connection> {
        Ok(self.pool.get().await?)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Escape glob metacharacters so a literal prefix can be used with `MATCH`.
fn escape_glob(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 4);
    for ch in prefix.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn queue_writes(pipe: &mut redis::Pipeline, writes: &[KvWrite]) {
    for write in writes {
        match write {
            KvWrite::Set {
                key,
                value,
                ttl: Some(ttl),
            } => {
                pipe.cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("PX")
                    .arg(ttl_millis(*ttl))
                    .ignore();
            }
            KvWrite::Set {
                key,
                value,
                ttl: None,
            } => {
                pipe.cmd("SET").arg(key).arg(value).ignore();
            }
            KvWrite::Delete { key } => {
                pipe.cmd("DEL").arg(key).ignore();
            }
        }
    }
}

impl KvStore for RedisKvStore {
    fn get(&self, key: &str) -> KvFuture<'_, MemoryResult<Option<String>>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut conn = self.conn().await?;
            let value: Option<String> = conn.get(&key).await?;
            Ok(value)
        })
    }

    fn get_many(&self, keys: Vec<String>) -> KvFuture<'_, MemoryResult<Vec<Option<String>>>> {
        Box::pin(async move {
            if keys.is_empty() {
                return Ok(Vec::new());
            }
            let mut conn = self.conn().await?;
            let values: Vec<Option<String>> =
                redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;
            Ok(values)
        })
    }

    fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> KvFuture<'_, MemoryResult<()>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            let mut conn = self.conn().await?;
            let mut cmd = redis::cmd("SET");
            cmd.arg(&key).arg(&value);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl_millis(ttl));
            }
            let _: () = cmd.query_async(&mut conn).await?;
            Ok(())
        })
    }

    fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> KvFuture<'_, MemoryResult<bool>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            let mut conn = self.conn().await?;
            let mut cmd = redis::cmd("SET");
            cmd.arg(&key).arg(&value).arg("NX");
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl_millis(ttl));
            }
            let reply: Option<String> = cmd.query_async(&mut conn).await?;
            Ok(reply.is_some())
        })
    }

    fn delete(&self, keys: Vec<String>) -> KvFuture<'_, MemoryResult<u64>> {
        Box::pin(async move {
            if keys.is_empty() {
                return Ok(0);
            }
            let mut conn = self.conn().await?;
            let removed: u64 = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
            Ok(removed)
        })
    }

    fn exists(&self, key: &str) -> KvFuture<'_, MemoryResult<bool>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut conn = self.conn().await?;
            let found: bool = conn.exists(&key).await?;
            Ok(found)
        })
    }

    fn push_back(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> KvFuture<'_, MemoryResult<u64>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            let mut conn = self.conn().await?;
            let mut pipe = redis::pipe();
            pipe.atomic().cmd("RPUSH").arg(&key).arg(&value);
            if let Some(ttl) = ttl {
                pipe.cmd("PEXPIRE").arg(&key).arg(ttl_millis(ttl)).ignore();
            }
            let (len,): (u64,) = pipe.query_async(&mut conn).await?;
            Ok(len)
        })
    }

    fn list_len(&self, key: &str) -> KvFuture<'_, MemoryResult<u64>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut conn = self.conn().await?;
            let len: u64 = conn.llen(&key).await?;
            Ok(len)
        })
    }

    fn list_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> KvFuture<'_, MemoryResult<Vec<String>>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut conn = self.conn().await?;
            let items: Vec<String> = redis::cmd("LRANGE")
                .arg(&key)
                .arg(start)
                .arg(stop)
                .query_async(&mut conn)
                .await?;
            Ok(items)
        })
    }

    fn drain_list(&self, key: &str) -> KvFuture<'_, MemoryResult<Vec<String>>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut conn = self.conn().await?;
            let (items,): (Vec<String>,) = redis::pipe()
                .atomic()
                .cmd("LRANGE")
                .arg(&key)
                .arg(0)
                .arg(-1)
                .cmd("DEL")
                .arg(&key)
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok(items)
        })
    }

    fn scan_keys(&self, prefix: &str) -> KvFuture<'_, MemoryResult<Vec<String>>> {
        let pattern = format!("{}*", escape_glob(prefix));
        Box::pin(async move {
            let mut conn = self.conn().await?;
            let mut cursor: u64 = 0;
            let mut keys = Vec::new();
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async(&mut conn)
                    .await?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            keys.sort();
            keys.dedup();
            Ok(keys)
        })
    }

    fn watch_and_commit(
        &self,
        keys: Vec<String>,
        plan: TxnPlan,
    ) -> KvFuture<'_, MemoryResult<bool>> {
        Box::pin(async move {
            // WATCH state is per connection: the whole flow stays on this one.
            let mut conn = self.conn().await?;

            let current: Vec<Option<String>> = if keys.is_empty() {
                Vec::new()
            } else {
                let _: () = redis::cmd("WATCH").arg(&keys).query_async(&mut conn).await?;
                redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?
            };

            let Some(writes) = plan(&current) else {
                if !keys.is_empty() {
                    let _: () = redis::cmd("UNWATCH").query_async(&mut conn).await?;
                }
                debug!(keys = ?keys, "transaction aborted by plan");
                return Ok(false);
            };

            if writes.is_empty() {
                if !keys.is_empty() {
                    let _: () = redis::cmd("UNWATCH").query_async(&mut conn).await?;
                }
                return Ok(true);
            }

            let mut pipe = redis::pipe();
            pipe.atomic();
            queue_writes(&mut pipe, &writes);

            let committed: Option<()> = pipe.query_async(&mut conn).await?;
            if committed.is_none() {
                debug!(keys = ?keys, "transaction aborted by concurrent write");
            }
            Ok(committed.is_some())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("audio:u1:"), "audio:u1:");
        assert_eq!(escape_glob("a*b?[c]"), "a\\*b\\?\\[c\\]");
    }

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(3)), 3_000);
    }

    #[tokio::test]
    async fn test_pool_creation_is_lazy() {
        let store = RedisKvStore::new(&StorageConfig::default());
        assert!(store.is_ok());
    }
}
