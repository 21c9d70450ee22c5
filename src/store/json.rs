use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{
    Channel, ChannelFileMapping, ChannelStore, FileMappingStore, Provider, StoreError, UploadFile, VendorType,
};
use crate::share::{ShareKey, ShareRecord, ShareStore};

/// Everything the store persists, as one JSON document
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    next_id: i64,
    #[serde(default)]
    channels: BTreeMap<i64, Channel>,
    #[serde(default)]
    providers: BTreeMap<i64, Provider>,
    #[serde(default)]
    upload_files: BTreeMap<i64, UploadFile>,
    #[serde(default)]
    file_mappings: Vec<ChannelFileMapping>,
    #[serde(default)]
    shares: Vec<ShareRecord>,
}

impl StoreState {
    fn allocate_id(&mut self) -> i64 {
        let max_existing = self
            .channels
            .keys()
            .chain(self.providers.keys())
            .chain(self.upload_files.keys())
            .copied()
            .chain(self.file_mappings.iter().map(|m| m.id))
            .max()
            .unwrap_or(0);
        self.next_id = self.next_id.max(max_existing) + 1;
        self.next_id
    }
}

/// Channel/provider/file-mapping store persisted to a JSON file.
///
/// Every write rewrites the file (mode 0600 on unix). Without a path the
/// store lives only in memory.
#[derive(Debug, Clone)]
pub struct JsonStore {
    file_path: Option<PathBuf>,
    state: Arc<RwLock<StoreState>>,
}

impl JsonStore {
    /// Open a store, loading existing state from `file_path` if present
    pub async fn open(file_path: PathBuf) -> Result<Self, StoreError> {
        let state = match tokio::fs::read_to_string(&file_path).await {
            Ok(content) if !content.trim().is_empty() => serde_json::from_str(&content)?,
            Ok(_) => StoreState::default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => return Err(e.into()),
        };

        info!(
            "💾 Loaded state from {} ({} channels, {} providers)",
            file_path.display(),
            state.channels.len(),
            state.providers.len()
        );

        Ok(Self {
            file_path: Some(file_path),
            state: Arc::new(RwLock::new(state)),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            file_path: None,
            state: Arc::new(RwLock::new(StoreState::default())),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    /// Insert rows that are not present yet (by id); returns how many were added
    pub async fn import_seed(&self, providers: Vec<Provider>, channels: Vec<Channel>) -> Result<usize, StoreError> {
        let mut added = 0;
        {
            let mut state = self.state.write().await;
            for provider in providers {
                if !state.providers.contains_key(&provider.id) {
                    state.providers.insert(provider.id, provider);
                    added += 1;
                }
            }
            for mut channel in channels {
                if channel.id == 0 {
                    channel.id = state.allocate_id();
                }
                if !state.channels.contains_key(&channel.id) {
                    state.channels.insert(channel.id, channel);
                    added += 1;
                }
            }
        }
        if added > 0 {
            self.persist().await?;
        }
        Ok(added)
    }

    pub async fn insert_provider(&self, mut provider: Provider) -> Result<Provider, StoreError> {
        {
            let mut state = self.state.write().await;
            if provider.id == 0 {
                provider.id = state.allocate_id();
            }
            state.providers.insert(provider.id, provider.clone());
        }
        self.persist().await?;
        Ok(provider)
    }

    pub async fn insert_upload_file(&self, mut file: UploadFile) -> Result<UploadFile, StoreError> {
        {
            let mut state = self.state.write().await;
            if file.id == 0 {
                file.id = state.allocate_id();
            }
            state.upload_files.insert(file.id, file.clone());
        }
        self.persist().await?;
        Ok(file)
    }

    pub async fn list_channels(&self) -> Vec<Channel> {
        self.state.read().await.channels.values().cloned().collect()
    }

    pub async fn list_file_mappings(&self) -> Vec<ChannelFileMapping> {
        self.state.read().await.file_mappings.clone()
    }

    /// Persist state to file
    async fn persist(&self) -> Result<(), StoreError> {
        let Some(ref file_path) = self.file_path else {
            return Ok(());
        };

        let json = {
            let state = self.state.read().await;
            serde_json::to_string_pretty(&*state)?
        };

        if let Some(parent) = file_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(file_path, json).await?;

        // Owner read/write only; the file holds vendor credentials
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(file_path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        debug!("State persisted to {}", file_path.display());
        Ok(())
    }
}

#[async_trait]
impl ChannelStore for JsonStore {
    async fn find_eligible_channels(
        &self,
        tenant_id: i64,
        vendor: VendorType,
        model: &str,
    ) -> Result<Vec<Channel>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .channels
            .values()
            .filter(|c| c.tenant_id == tenant_id && c.vendor == vendor && c.is_enabled() && c.serves_model(model))
            .cloned()
            .collect())
    }

    async fn get_channel(&self, id: i64) -> Result<Option<Channel>, StoreError> {
        Ok(self.state.read().await.channels.get(&id).cloned())
    }

    async fn channels_for_provider(&self, tenant_id: i64, provider_id: i64) -> Result<Vec<Channel>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .channels
            .values()
            .filter(|c| c.tenant_id == tenant_id && c.provider_id == Some(provider_id))
            .cloned()
            .collect())
    }

    async fn save_channel(&self, mut channel: Channel) -> Result<Channel, StoreError> {
        {
            let mut state = self.state.write().await;
            if channel.id == 0 {
                channel.id = state.allocate_id();
            }
            state.channels.insert(channel.id, channel.clone());
        }
        self.persist().await?;
        Ok(channel)
    }

    async fn update_channel(&self, channel: &Channel) -> Result<(), StoreError> {
        {
            let mut state = self.state.write().await;
            if !state.channels.contains_key(&channel.id) {
                return Err(StoreError::NotFound(format!("channel {}", channel.id)));
            }
            state.channels.insert(channel.id, channel.clone());
        }
        self.persist().await
    }

    async fn get_provider(&self, id: i64, tenant_id: i64) -> Result<Option<Provider>, StoreError> {
        let state = self.state.read().await;
        Ok(state.providers.get(&id).filter(|p| p.tenant_id == tenant_id).cloned())
    }

    async fn update_provider(&self, provider: &Provider) -> Result<(), StoreError> {
        {
            let mut state = self.state.write().await;
            if !state.providers.contains_key(&provider.id) {
                return Err(StoreError::NotFound(format!("provider {}", provider.id)));
            }
            state.providers.insert(provider.id, provider.clone());
        }
        self.persist().await
    }
}

#[async_trait]
impl FileMappingStore for JsonStore {
    async fn get_upload_file(&self, id: i64, tenant_id: i64) -> Result<Option<UploadFile>, StoreError> {
        let state = self.state.read().await;
        Ok(state.upload_files.get(&id).filter(|f| f.tenant_id == tenant_id).cloned())
    }

    async fn find_file_mapping(
        &self,
        file_id: i64,
        channel_id: i64,
        model: &str,
    ) -> Result<Option<ChannelFileMapping>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .file_mappings
            .iter()
            .find(|m| m.file_id == file_id && m.channel_id == channel_id && m.model == model)
            .cloned())
    }

    async fn save_file_mapping(&self, mut mapping: ChannelFileMapping) -> Result<ChannelFileMapping, StoreError> {
        {
            let mut state = self.state.write().await;
            let existing = state.file_mappings.iter().position(|m| {
                m.file_id == mapping.file_id && m.channel_id == mapping.channel_id && m.model == mapping.model
            });
            match existing {
                Some(index) => {
                    mapping.id = state.file_mappings[index].id;
                    state.file_mappings[index] = mapping.clone();
                }
                None => {
                    mapping.id = state.allocate_id();
                    state.file_mappings.push(mapping.clone());
                }
            }
        }
        self.persist().await?;
        Ok(mapping)
    }
}

#[async_trait]
impl ShareStore for JsonStore {
    async fn find_share(&self, key: &ShareKey) -> Result<Option<ShareRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state.shares.iter().find(|s| &s.key == key).cloned())
    }

    async fn insert_share(&self, record: ShareRecord) -> Result<ShareRecord, StoreError> {
        {
            let mut state = self.state.write().await;
            state.shares.push(record.clone());
        }
        self.persist().await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ChannelStatus, ProviderKind};
    use secrecy::{ExposeSecret, SecretString};
    use tempfile::TempDir;

    fn channel(tenant_id: i64, vendor: VendorType, models: &[&str]) -> Channel {
        Channel {
            id: 0,
            tenant_id,
            name: "test".to_string(),
            vendor,
            key: SecretString::new("sk-test".to_string()),
            base_url: None,
            models: models.iter().map(|m| m.to_string()).collect(),
            weight: 1,
            priority: 0,
            status: ChannelStatus::Enabled,
            provider_id: None,
        }
    }

    #[tokio::test]
    async fn test_eligible_channels_filter_tenant_vendor_model_status() {
        let store = JsonStore::in_memory();
        let a = store.save_channel(channel(1, VendorType::OpenAi, &["gpt-4o"])).await.unwrap();
        store.save_channel(channel(2, VendorType::OpenAi, &["gpt-4o"])).await.unwrap();
        store.save_channel(channel(1, VendorType::Tencent, &["gpt-4o"])).await.unwrap();
        let mut disabled = channel(1, VendorType::OpenAi, &["gpt-4o"]);
        disabled.status = ChannelStatus::Disabled;
        store.save_channel(disabled).await.unwrap();

        let eligible = store.find_eligible_channels(1, VendorType::OpenAi, "gpt-4o").await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, a.id);
        assert!(store.find_eligible_channels(1, VendorType::OpenAi, "other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.json");

        let store = JsonStore::open(path.clone()).await.unwrap();
        let saved = store.save_channel(channel(1, VendorType::Coze, &["bot-1"])).await.unwrap();
        store
            .insert_provider(Provider {
                id: 0,
                tenant_id: 1,
                name: "coze".to_string(),
                kind: ProviderKind::CozeCn,
                access_token: SecretString::new("access-123".to_string()),
                refresh_token: SecretString::new("refresh-456".to_string()),
                expires_in: 1_700_000_000,
                base_url: None,
                is_authorized: true,
                authed_time: 0,
                oauth: None,
            })
            .await
            .unwrap();

        let reopened = JsonStore::open(path.clone()).await.unwrap();
        let channel = reopened.get_channel(saved.id).await.unwrap().unwrap();
        assert_eq!(channel.key.expose_secret(), "sk-test");
        assert_eq!(channel.models, vec!["bot-1"]);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_provider_lookup_is_tenant_scoped() {
        let store = JsonStore::in_memory();
        let provider = store
            .insert_provider(Provider {
                id: 0,
                tenant_id: 1,
                name: "p".to_string(),
                kind: ProviderKind::CozeCom,
                access_token: SecretString::new(String::new()),
                refresh_token: SecretString::new(String::new()),
                expires_in: 0,
                base_url: None,
                is_authorized: false,
                authed_time: 0,
                oauth: None,
            })
            .await
            .unwrap();

        assert!(store.get_provider(provider.id, 1).await.unwrap().is_some());
        assert!(store.get_provider(provider.id, 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_mapping_upsert_last_write_wins() {
        let store = JsonStore::in_memory();
        let mut mapping = ChannelFileMapping {
            id: 0,
            tenant_id: 1,
            file_id: 5,
            channel_id: 9,
            model: "bot-1".to_string(),
            channel_file_id: "remote-a".to_string(),
            expires_at: 10,
            api_response: String::new(),
        };
        let first = store.save_file_mapping(mapping.clone()).await.unwrap();
        mapping.channel_file_id = "remote-b".to_string();
        let second = store.save_file_mapping(mapping).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.list_file_mappings().await.len(), 1);
        let found = store.find_file_mapping(5, 9, "bot-1").await.unwrap().unwrap();
        assert_eq!(found.channel_file_id, "remote-b");
    }

    #[tokio::test]
    async fn test_update_missing_channel_fails() {
        let store = JsonStore::in_memory();
        let mut c = channel(1, VendorType::OpenAi, &[]);
        c.id = 77;
        assert!(matches!(store.update_channel(&c).await, Err(StoreError::NotFound(_))));
    }
}
