//! Session-scoped pseudonym vault.
//!
//! Each session owns a token → original map stored under
//! `pii:session:<session-id>` with a TTL refreshed on every store. Values
//! are encrypted when an encryptor is configured.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::crypto::Encryptor;
use crate::error::VeilError;
use crate::kv::KvStore;

const SESSION_KEY_PREFIX: &str = "pii:session:";

pub struct Vault {
    kv: Arc<KvStore>,
    encryptor: Option<Encryptor>,
    ttl: Duration,
}

impl Vault {
    pub fn new(kv: Arc<KvStore>, encryptor: Option<Encryptor>, ttl: Duration) -> Self {
        Self { kv, encryptor, ttl }
    }

    fn session_key(session: &str) -> String {
        format!("{SESSION_KEY_PREFIX}{session}")
    }

    /// Store a token → original mapping for a session. Idempotent per token;
    /// the session TTL is extended on every write.
    pub async fn store(
        &self,
        session: &str,
        mapping: &HashMap<String, String>,
    ) -> Result<(), VeilError> {
        if mapping.is_empty() {
            return Ok(());
        }

        let mut entries = Vec::with_capacity(mapping.len());
        for (token, original) in mapping {
            let value = match &self.encryptor {
                Some(enc) => enc.encrypt(original)?,
                None => original.clone(),
            };
            entries.push((token.clone(), value));
        }

        self.kv
            .hash_set_all(&Self::session_key(session), &entries, Some(self.ttl))
            .await;
        Ok(())
    }

    /// Look up the original value for a single token.
    pub async fn lookup(&self, session: &str, token: &str) -> Result<Option<String>, VeilError> {
        let Some(stored) = self.kv.hash_get(&Self::session_key(session), token).await else {
            return Ok(None);
        };
        match &self.encryptor {
            Some(enc) => enc.decrypt(&stored).map(Some),
            None => Ok(Some(stored)),
        }
    }

    /// All mappings for a session. Tokens whose stored value fails to
    /// decrypt are dropped, each with its own error log.
    pub async fn lookup_all(&self, session: &str) -> HashMap<String, String> {
        let stored = self.kv.hash_get_all(&Self::session_key(session)).await;
        let Some(enc) = &self.encryptor else {
            return stored;
        };

        let mut out = HashMap::with_capacity(stored.len());
        for (token, value) in stored {
            match enc.decrypt(&value) {
                Ok(original) => {
                    out.insert(token, original);
                }
                Err(e) => tracing::error!("vault: cannot decrypt value for {token}: {e}"),
            }
        }
        out
    }

    /// Remove all mappings for a session.
    pub async fn delete(&self, session: &str) {
        self.kv.delete(&Self::session_key(session)).await;
    }
}
