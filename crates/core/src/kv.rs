//! Key-value backend for the vault and the API key store.
//!
//! Three backends: Redis (when `REDIS_ADDR` is configured and reachable),
//! an in-process memory map with expiry (no `REDIS_ADDR`; also used by the
//! test suites), and a disabled stub used when Redis is configured but
//! unreachable at startup. Runtime Redis failures degrade the individual
//! operation only; the first failure logs a warning.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use redis::AsyncCommands;

pub enum KvStore {
    Redis(RedisBackend),
    Memory(MemoryBackend),
    Disabled,
}

pub struct RedisBackend {
    manager: redis::aio::ConnectionManager,
    warned: AtomicBool,
}

#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

struct MemoryEntry {
    fields: HashMap<String, String>,
    expires_at: Option<Instant>,
}

impl KvStore {
    /// Connect according to configuration. A configured but unreachable
    /// Redis yields the disabled backend (no persistence) with one warning.
    pub async fn connect(addr: Option<&str>, password: Option<&str>) -> Self {
        let Some(addr) = addr else {
            tracing::debug!("no REDIS_ADDR configured, using in-process vault storage");
            return Self::Memory(MemoryBackend::default());
        };

        let url = match password {
            Some(pw) => format!("redis://:{pw}@{addr}"),
            None => format!("redis://{addr}"),
        };

        let manager = match redis::Client::open(url) {
            Ok(client) => client.get_connection_manager().await,
            Err(e) => Err(e),
        };

        match manager {
            Ok(manager) => Self::Redis(RedisBackend {
                manager,
                warned: AtomicBool::new(false),
            }),
            Err(e) => {
                tracing::warn!("key-value service unreachable, continuing without persistence: {e}");
                Self::Disabled
            }
        }
    }

    pub fn memory() -> Self {
        Self::Memory(MemoryBackend::default())
    }

    /// Set all fields of a hash. `ttl` (when given) is refreshed on every call.
    pub async fn hash_set_all(&self, key: &str, entries: &[(String, String)], ttl: Option<Duration>) {
        match self {
            Self::Redis(backend) => {
                let mut conn = backend.manager.clone();
                let result: redis::RedisResult<()> = async {
                    conn.hset_multiple::<_, _, _, ()>(key, entries).await?;
                    if let Some(ttl) = ttl {
                        conn.expire::<_, ()>(key, ttl.as_secs() as i64).await?;
                    }
                    Ok(())
                }
                .await;
                if let Err(e) = result {
                    backend.warn_once(&e);
                }
            }
            Self::Memory(backend) => backend.set_all(key, entries, ttl),
            Self::Disabled => {}
        }
    }

    /// Set a single hash field, preserving any existing TTL.
    pub async fn hash_set(&self, key: &str, field: &str, value: &str) {
        match self {
            Self::Redis(backend) => {
                let mut conn = backend.manager.clone();
                let result: redis::RedisResult<()> = conn.hset(key, field, value).await;
                if let Err(e) = result {
                    backend.warn_once(&e);
                }
            }
            Self::Memory(backend) => {
                backend.set_all(key, &[(field.to_string(), value.to_string())], None)
            }
            Self::Disabled => {}
        }
    }

    pub async fn hash_get(&self, key: &str, field: &str) -> Option<String> {
        match self {
            Self::Redis(backend) => {
                let mut conn = backend.manager.clone();
                match conn.hget::<_, _, Option<String>>(key, field).await {
                    Ok(value) => value,
                    Err(e) => {
                        backend.warn_once(&e);
                        None
                    }
                }
            }
            Self::Memory(backend) => backend.get(key, field),
            Self::Disabled => None,
        }
    }

    pub async fn hash_get_all(&self, key: &str) -> HashMap<String, String> {
        match self {
            Self::Redis(backend) => {
                let mut conn = backend.manager.clone();
                match conn.hgetall::<_, HashMap<String, String>>(key).await {
                    Ok(map) => map,
                    Err(e) => {
                        backend.warn_once(&e);
                        HashMap::new()
                    }
                }
            }
            Self::Memory(backend) => backend.get_all(key),
            Self::Disabled => HashMap::new(),
        }
    }

    pub async fn delete(&self, key: &str) {
        match self {
            Self::Redis(backend) => {
                let mut conn = backend.manager.clone();
                let result: redis::RedisResult<()> = conn.del(key).await;
                if let Err(e) = result {
                    backend.warn_once(&e);
                }
            }
            Self::Memory(backend) => {
                backend.entries.lock().unwrap().remove(key);
            }
            Self::Disabled => {}
        }
    }
}

impl RedisBackend {
    fn warn_once(&self, e: &redis::RedisError) {
        if !self.warned.swap(true, Ordering::Relaxed) {
            tracing::warn!("key-value operation failed, degrading without persistence: {e}");
        } else {
            tracing::debug!("key-value operation failed: {e}");
        }
    }
}

impl MemoryBackend {
    fn set_all(&self, key: &str, fields: &[(String, String)], ttl: Option<Duration>) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(key.to_string()).or_insert_with(|| MemoryEntry {
            fields: HashMap::new(),
            expires_at: None,
        });
        if entry.expired() {
            entry.fields.clear();
            entry.expires_at = None;
        }
        for (field, value) in fields {
            entry.fields.insert(field.clone(), value.clone());
        }
        if let Some(ttl) = ttl {
            entry.expires_at = Some(Instant::now() + ttl);
        }
    }

    fn get(&self, key: &str, field: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(key)?;
        if entry.expired() {
            return None;
        }
        entry.fields.get(field).cloned()
    }

    fn get_all(&self, key: &str) -> HashMap<String, String> {
        let entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if !entry.expired() => entry.fields.clone(),
            _ => HashMap::new(),
        }
    }
}

impl MemoryEntry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_roundtrip() {
        let kv = KvStore::memory();
        kv.hash_set_all(
            "k",
            &[("a".into(), "1".into()), ("b".into(), "2".into())],
            None,
        )
        .await;

        assert_eq!(kv.hash_get("k", "a").await.as_deref(), Some("1"));
        let all = kv.hash_get_all("k").await;
        assert_eq!(all.len(), 2);

        kv.delete("k").await;
        assert!(kv.hash_get_all("k").await.is_empty());
    }

    #[tokio::test]
    async fn test_memory_expiry() {
        let kv = KvStore::memory();
        kv.hash_set_all(
            "k",
            &[("a".into(), "1".into())],
            Some(Duration::from_millis(10)),
        )
        .await;
        assert!(kv.hash_get("k", "a").await.is_some());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(kv.hash_get("k", "a").await.is_none());
    }

    #[tokio::test]
    async fn test_disabled_is_empty() {
        let kv = KvStore::Disabled;
        kv.hash_set_all("k", &[("a".into(), "1".into())], None).await;
        assert!(kv.hash_get("k", "a").await.is_none());
    }
}
