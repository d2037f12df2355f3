//! API key management: generation, validation, role binding, revocation.
//!
//! Plaintext keys are `veil_sk_` + 32 hex chars, revealed only at
//! generation time. The store holds the SHA-256 hash under
//! `auth:apikey:<sha256-hex>`; a secondary `auth:apikey:index` hash maps
//! key id → hash for revocation by id. Revoked keys are marked inactive,
//! never deleted.

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::VeilError;
use crate::kv::KvStore;

pub const KEY_PREFIX: &str = "veil_sk_";

const RECORD_KEY_PREFIX: &str = "auth:apikey:";
const INDEX_KEY: &str = "auth:apikey:index";

/// Role bound to a credential. Clients cannot escalate past this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Operator,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Operator => "operator",
            Self::Viewer => "viewer",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "operator" => Ok(Self::Operator),
            "viewer" => Ok(Self::Viewer),
            _ => Err(format!("unknown role: {s}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    /// First 12 hex chars of the key hash.
    pub id: String,
    pub role: Role,
    pub label: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub active: bool,
}

pub struct ApiKeyStore {
    kv: Arc<KvStore>,
}

fn hash_hex(plaintext: &str) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

impl ApiKeyStore {
    pub fn new(kv: Arc<KvStore>) -> Self {
        Self { kv }
    }

    fn record_key(hash: &str) -> String {
        format!("{RECORD_KEY_PREFIX}{hash}")
    }

    /// Generate a new key. The plaintext is returned exactly once.
    pub async fn generate(&self, role: Role, label: &str) -> (String, ApiKeyRecord) {
        let secret: [u8; 16] = rand::random();
        let plaintext = format!("{KEY_PREFIX}{}", hex::encode(secret));
        let hash = hash_hex(&plaintext);

        let record = ApiKeyRecord {
            id: hash[..12].to_string(),
            role,
            label: label.to_string(),
            created_at: chrono::Utc::now(),
            active: true,
        };

        let fields = vec![
            ("id".to_string(), record.id.clone()),
            ("role".to_string(), record.role.to_string()),
            ("label".to_string(), record.label.clone()),
            ("created_at".to_string(), record.created_at.to_rfc3339()),
            ("active".to_string(), "true".to_string()),
        ];
        self.kv
            .hash_set_all(&Self::record_key(&hash), &fields, None)
            .await;
        self.kv.hash_set(INDEX_KEY, &record.id, &hash).await;

        (plaintext, record)
    }

    /// Look up a plaintext key. `Ok(None)` means unknown; inactive keys are
    /// an error so callers can distinguish revocation.
    pub async fn validate(&self, plaintext: &str) -> Result<Option<ApiKeyRecord>, VeilError> {
        let hash = hash_hex(plaintext);
        let fields = self.kv.hash_get_all(&Self::record_key(&hash)).await;
        if fields.is_empty() {
            return Ok(None);
        }

        let record = Self::parse_record(&fields)?;
        if !record.active {
            return Err(VeilError::Unauthorized("API key has been revoked".into()));
        }
        Ok(Some(record))
    }

    pub async fn revoke(&self, plaintext: &str) -> bool {
        let hash = hash_hex(plaintext);
        self.revoke_hash(&hash).await
    }

    pub async fn revoke_by_id(&self, id: &str) -> bool {
        match self.kv.hash_get(INDEX_KEY, id).await {
            Some(hash) => self.revoke_hash(&hash).await,
            None => false,
        }
    }

    async fn revoke_hash(&self, hash: &str) -> bool {
        let key = Self::record_key(hash);
        if self.kv.hash_get_all(&key).await.is_empty() {
            return false;
        }
        self.kv.hash_set(&key, "active", "false").await;
        true
    }

    fn parse_record(
        fields: &std::collections::HashMap<String, String>,
    ) -> Result<ApiKeyRecord, VeilError> {
        let get = |name: &str| {
            fields
                .get(name)
                .cloned()
                .ok_or_else(|| VeilError::Internal(format!("API key record missing {name}")))
        };
        let role = get("role")?
            .parse::<Role>()
            .map_err(VeilError::Internal)?;
        let created_at = chrono::DateTime::parse_from_rfc3339(&get("created_at")?)
            .map_err(|e| VeilError::Internal(format!("invalid created_at: {e}")))?
            .with_timezone(&chrono::Utc);

        Ok(ApiKeyRecord {
            id: get("id")?,
            role,
            label: get("label")?,
            created_at,
            active: get("active")? == "true",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ApiKeyStore {
        ApiKeyStore::new(Arc::new(KvStore::memory()))
    }

    #[tokio::test]
    async fn test_generate_and_validate() {
        let store = store();
        let (plaintext, record) = store.generate(Role::Operator, "ci bot").await;

        assert!(plaintext.starts_with(KEY_PREFIX));
        assert_eq!(plaintext.len(), KEY_PREFIX.len() + 32);
        assert_eq!(record.id.len(), 12);

        let validated = store.validate(&plaintext).await.unwrap().unwrap();
        assert_eq!(validated.role, Role::Operator);
        assert_eq!(validated.label, "ci bot");
        assert!(validated.active);
    }

    #[tokio::test]
    async fn test_unknown_key() {
        let store = store();
        let result = store.validate("veil_sk_00000000000000000000000000000000").await;
        assert!(result.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_revoke() {
        let store = store();
        let (plaintext, _) = store.generate(Role::Viewer, "temp").await;

        assert!(store.revoke(&plaintext).await);
        assert!(store.validate(&plaintext).await.is_err());
    }

    #[tokio::test]
    async fn test_revoke_by_id() {
        let store = store();
        let (plaintext, record) = store.generate(Role::Admin, "ops").await;

        assert!(store.revoke_by_id(&record.id).await);
        assert!(store.validate(&plaintext).await.is_err());
        assert!(!store.revoke_by_id("missing-id-x").await);
    }

    #[tokio::test]
    async fn test_id_is_hash_prefix() {
        let store = store();
        let (plaintext, record) = store.generate(Role::Viewer, "x").await;
        let hash = hex::encode(Sha256::digest(plaintext.as_bytes()));
        assert_eq!(record.id, hash[..12]);
    }
}
