//! Conversation share records keyed by an order-independent message-id set.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::store::StoreError;

/// Deduplicate, sort ascending and join with commas
pub fn normalize_message_ids(ids: &[i64]) -> String {
    let mut ids = ids.to_vec();
    ids.sort_unstable();
    ids.dedup();
    ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",")
}

/// SHA-256 hex digest of a normalized id list
pub fn hash_normalized_key(normalized: &str) -> String {
    format!("{:x}", Sha256::digest(normalized.as_bytes()))
}

/// Unique identity of a share: (tenant, conversation, hash of the id set)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShareKey {
    pub tenant_id: i64,
    pub conversation_id: i64,
    pub message_ids: String,
    pub message_ids_hash: String,
}

impl ShareKey {
    pub fn new(tenant_id: i64, conversation_id: i64, message_ids: &[i64]) -> Self {
        let normalized = normalize_message_ids(message_ids);
        let hash = hash_normalized_key(&normalized);
        Self {
            tenant_id,
            conversation_id,
            message_ids: normalized,
            message_ids_hash: hash,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareRecord {
    pub share_id: String,
    #[serde(flatten)]
    pub key: ShareKey,
    pub created_at: i64,
}

#[async_trait]
pub trait ShareStore: Send + Sync {
    async fn find_share(&self, key: &ShareKey) -> Result<Option<ShareRecord>, StoreError>;

    async fn insert_share(&self, record: ShareRecord) -> Result<ShareRecord, StoreError>;
}

/// Returns the existing share for a key or creates one
pub async fn share_conversation(
    store: &Arc<dyn ShareStore>,
    tenant_id: i64,
    conversation_id: i64,
    message_ids: &[i64],
) -> Result<ShareRecord, StoreError> {
    let key = ShareKey::new(tenant_id, conversation_id, message_ids);
    if let Some(existing) = store.find_share(&key).await? {
        debug!("Reusing share {} for conversation {}", existing.share_id, conversation_id);
        return Ok(existing);
    }

    store
        .insert_share(ShareRecord {
            share_id: Uuid::new_v4().simple().to_string(),
            key,
            created_at: Utc::now().timestamp(),
        })
        .await
}
