use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::adaptors::RelayError;
use crate::store::{Channel, ChannelStore, Provider};

/// Where a Provider sits in its credential lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialState {
    Unauthorized,
    Fresh,
    /// Expiry passed; the next check refreshes
    Expiring,
    /// Non-expiring token, never refreshed
    Static,
}

impl Provider {
    pub fn credential_state(&self, now: i64) -> CredentialState {
        if self.kind.uses_static_token() {
            CredentialState::Static
        } else if !self.is_authorized {
            CredentialState::Unauthorized
        } else if self.expires_in <= now {
            CredentialState::Expiring
        } else {
            CredentialState::Fresh
        }
    }
}

/// Token pair returned by the vendor's token endpoint
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: SecretString,
    pub refresh_token: SecretString,
    /// Absolute expiry, epoch seconds
    pub expires_in: i64,
}

/// Vendor token endpoint
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn exchange_code(&self, provider: &Provider, code: &str, redirect_uri: &str) -> Result<TokenGrant, RelayError>;

    async fn refresh(&self, provider: &Provider) -> Result<TokenGrant, RelayError>;
}

/// Result of a credential check on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Token still valid, or the channel has no Provider
    Fresh,
    /// Token exchanged and written to the Provider and its channels
    Refreshed,
    /// Static Provider, nothing to do
    Static,
    /// Channel rewritten from its static Provider
    Synced,
}

impl RefreshOutcome {
    /// The persisted channel row differs from the one the caller holds
    pub fn channel_changed(&self) -> bool {
        matches!(self, RefreshOutcome::Refreshed | RefreshOutcome::Synced)
    }
}

/// Keeps Provider tokens fresh and channel keys in step with them.
///
/// Refreshes of one Provider are serialized; the Provider is re-read after
/// the lock is taken so a caller queued behind a refresh sees the new token.
pub struct CredentialManager {
    store: Arc<dyn ChannelStore>,
    refresher: Arc<dyn TokenRefresher>,
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl CredentialManager {
    pub fn new(store: Arc<dyn ChannelStore>, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            store,
            refresher,
            locks: DashMap::new(),
        }
    }

    async fn load_provider(&self, provider_id: i64, tenant_id: i64) -> Result<Provider, RelayError> {
        self.store
            .get_provider(provider_id, tenant_id)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("provider {} for tenant {}", provider_id, tenant_id)))
    }

    /// Credential step run by the selector before a channel is used
    pub async fn ensure_channel(&self, channel: &Channel) -> Result<RefreshOutcome, RelayError> {
        let Some(provider_id) = channel.provider_id else {
            return Ok(RefreshOutcome::Fresh);
        };

        let provider = self.load_provider(provider_id, channel.tenant_id).await?;
        if provider.kind.uses_static_token() {
            return self.sync_static(channel, &provider).await;
        }
        self.check_and_refresh(provider_id, channel.tenant_id).await
    }

    /// Refresh the Provider's token when its expiry has passed.
    ///
    /// A failed refresh leaves the Provider untouched and surfaces as an
    /// auth error.
    pub async fn check_and_refresh(&self, provider_id: i64, tenant_id: i64) -> Result<RefreshOutcome, RelayError> {
        let lock = self.locks.entry(provider_id).or_default().clone();
        let _guard = lock.lock().await;

        let mut provider = self.load_provider(provider_id, tenant_id).await?;
        let now = Utc::now().timestamp();
        match provider.credential_state(now) {
            CredentialState::Static => return Ok(RefreshOutcome::Static),
            CredentialState::Fresh => return Ok(RefreshOutcome::Fresh),
            CredentialState::Unauthorized => {
                return Err(RelayError::Auth(format!("provider {} is not authorized", provider_id)));
            }
            CredentialState::Expiring => {}
        }

        debug!("Token for provider {} expired at {}, refreshing", provider_id, provider.expires_in);
        let grant = self.refresher.refresh(&provider).await.map_err(|e| {
            warn!("⚠️  Token refresh failed for provider {}: {}", provider_id, e);
            match e {
                RelayError::Auth(_) => e,
                other => RelayError::Auth(other.to_string()),
            }
        })?;

        provider.access_token = grant.access_token;
        provider.refresh_token = grant.refresh_token;
        provider.expires_in = grant.expires_in;
        self.store.update_provider(&provider).await?;

        let updated = self.propagate_token(&provider).await?;
        info!(
            "🔄 Refreshed token for provider {} ({} channel(s) updated)",
            provider_id, updated
        );
        Ok(RefreshOutcome::Refreshed)
    }

    /// Write the Provider's access token into every channel bound to it
    async fn propagate_token(&self, provider: &Provider) -> Result<usize, RelayError> {
        let channels = self.store.channels_for_provider(provider.tenant_id, provider.id).await?;
        let count = channels.len();
        for mut channel in channels {
            channel.key = provider.access_token.clone();
            self.store.update_channel(&channel).await?;
        }
        Ok(count)
    }

    async fn sync_static(&self, channel: &Channel, provider: &Provider) -> Result<RefreshOutcome, RelayError> {
        let base_url = provider
            .api_base_url()
            .ok_or_else(|| RelayError::Config(format!("provider {} requires a custom base_url", provider.id)))?;

        let key_differs = channel.key.expose_secret() != provider.access_token.expose_secret();
        let url_differs = channel.base_url.as_deref() != Some(base_url.as_str());
        if !key_differs && !url_differs {
            return Ok(RefreshOutcome::Static);
        }

        let mut updated = channel.clone();
        updated.key = provider.access_token.clone();
        updated.base_url = Some(base_url);
        self.store.update_channel(&updated).await?;
        info!("🔄 Synced channel {} from static provider {}", channel.id, provider.id);
        Ok(RefreshOutcome::Synced)
    }

    /// Exchange an authorization code, moving the Provider to authorized
    pub async fn authorize(
        &self,
        provider_id: i64,
        tenant_id: i64,
        code: &str,
        redirect_uri: &str,
    ) -> Result<Provider, RelayError> {
        let lock = self.locks.entry(provider_id).or_default().clone();
        let _guard = lock.lock().await;

        let mut provider = self.load_provider(provider_id, tenant_id).await?;
        if provider.kind.uses_static_token() {
            return Err(RelayError::Config(format!(
                "provider {} uses a static token and cannot be authorized",
                provider_id
            )));
        }

        let grant = self.refresher.exchange_code(&provider, code, redirect_uri).await?;
        provider.access_token = grant.access_token;
        provider.refresh_token = grant.refresh_token;
        provider.expires_in = grant.expires_in;
        provider.is_authorized = true;
        provider.authed_time = Utc::now().timestamp_millis();
        self.store.update_provider(&provider).await?;

        info!("🔐 Provider {} authorized", provider_id);
        Ok(provider)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::{ChannelStatus, JsonStore, ProviderKind, VendorType};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Hands out numbered tokens and counts calls
    #[derive(Default)]
    pub(crate) struct FakeRefresher {
        pub refreshes: AtomicUsize,
        pub exchanges: AtomicUsize,
        pub fail: bool,
        pub delay: Option<Duration>,
    }

    impl FakeRefresher {
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl TokenRefresher for FakeRefresher {
        async fn exchange_code(&self, _provider: &Provider, code: &str, _redirect_uri: &str) -> Result<TokenGrant, RelayError> {
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            Ok(TokenGrant {
                access_token: SecretString::new(format!("access-{}", code)),
                refresh_token: SecretString::new("refresh-0".to_string()),
                expires_in: Utc::now().timestamp() + 900,
            })
        }

        async fn refresh(&self, _provider: &Provider) -> Result<TokenGrant, RelayError> {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(RelayError::Transport {
                    status: 401,
                    body: "invalid refresh token".to_string(),
                });
            }
            Ok(TokenGrant {
                access_token: SecretString::new(format!("access-{}", n)),
                refresh_token: SecretString::new(format!("refresh-{}", n)),
                expires_in: Utc::now().timestamp() + 900,
            })
        }
    }

    pub(crate) fn provider(kind: ProviderKind, expires_in: i64) -> Provider {
        Provider {
            id: 0,
            tenant_id: 1,
            name: "coze".to_string(),
            kind,
            access_token: SecretString::new("access-0".to_string()),
            refresh_token: SecretString::new("refresh-0".to_string()),
            expires_in,
            base_url: None,
            is_authorized: true,
            authed_time: 0,
            oauth: None,
        }
    }

    pub(crate) fn bound_channel(provider_id: i64, key: &str) -> Channel {
        Channel {
            id: 0,
            tenant_id: 1,
            name: "coze".to_string(),
            vendor: VendorType::Coze,
            key: SecretString::new(key.to_string()),
            base_url: Some("https://api.coze.cn".to_string()),
            models: vec!["bot-1".to_string()],
            weight: 1,
            priority: 0,
            status: ChannelStatus::Enabled,
            provider_id: Some(provider_id),
        }
    }

    async fn setup(p: Provider, refresher: Arc<FakeRefresher>) -> (JsonStore, CredentialManager, Provider, Channel) {
        let store = JsonStore::in_memory();
        let p = store.insert_provider(p).await.unwrap();
        let channel = store.save_channel(bound_channel(p.id, "access-0")).await.unwrap();
        let manager = CredentialManager::new(Arc::new(store.clone()), refresher);
        (store, manager, p, channel)
    }

    #[test]
    fn test_credential_states() {
        let now = 1_000;
        assert_eq!(provider(ProviderKind::CozeCn, 2_000).credential_state(now), CredentialState::Fresh);
        assert_eq!(provider(ProviderKind::CozeCn, 1_000).credential_state(now), CredentialState::Expiring);
        assert_eq!(provider(ProviderKind::CozeStudio, 0).credential_state(now), CredentialState::Static);

        let mut unauthorized = provider(ProviderKind::CozeCom, 2_000);
        unauthorized.is_authorized = false;
        assert_eq!(unauthorized.credential_state(now), CredentialState::Unauthorized);
    }

    #[tokio::test]
    async fn test_expired_token_refreshes_once_and_propagates() {
        let refresher = Arc::new(FakeRefresher::default());
        let expired = Utc::now().timestamp() - 10;
        let (store, manager, p, channel) = setup(provider(ProviderKind::CozeCn, expired), refresher.clone()).await;

        let outcome = manager.ensure_channel(&channel).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Refreshed);
        assert!(outcome.channel_changed());

        let stored = store.get_provider(p.id, 1).await.unwrap().unwrap();
        assert_eq!(stored.access_token.expose_secret(), "access-1");
        assert_eq!(stored.refresh_token.expose_secret(), "refresh-1");
        assert!(stored.expires_in > Utc::now().timestamp());
        let reread = store.get_channel(channel.id).await.unwrap().unwrap();
        assert_eq!(reread.key.expose_secret(), "access-1");

        // The new token is fresh; no second exchange
        assert_eq!(manager.ensure_channel(&reread).await.unwrap(), RefreshOutcome::Fresh);
        assert_eq!(refresher.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fresh_token_is_left_alone() {
        let refresher = Arc::new(FakeRefresher::default());
        let (_, manager, p, _) = setup(provider(ProviderKind::CozeCn, Utc::now().timestamp() + 600), refresher.clone()).await;

        assert_eq!(manager.check_and_refresh(p.id, 1).await.unwrap(), RefreshOutcome::Fresh);
        assert_eq!(refresher.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_old_credentials() {
        let refresher = Arc::new(FakeRefresher::failing());
        let expired = Utc::now().timestamp() - 10;
        let (store, manager, p, _) = setup(provider(ProviderKind::CozeCn, expired), refresher).await;

        let err = manager.check_and_refresh(p.id, 1).await.unwrap_err();
        assert!(matches!(err, RelayError::Auth(_)));

        let stored = store.get_provider(p.id, 1).await.unwrap().unwrap();
        assert_eq!(stored.access_token.expose_secret(), "access-0");
        assert_eq!(stored.credential_state(Utc::now().timestamp()), CredentialState::Expiring);
    }

    #[tokio::test]
    async fn test_concurrent_checks_refresh_once() {
        let refresher = Arc::new(FakeRefresher {
            delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let expired = Utc::now().timestamp() - 10;
        let (_, manager, p, _) = setup(provider(ProviderKind::CozeCom, expired), refresher.clone()).await;

        let (a, b) = tokio::join!(manager.check_and_refresh(p.id, 1), manager.check_and_refresh(p.id, 1));
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| *o == RefreshOutcome::Refreshed);

        assert_eq!(outcomes, vec![RefreshOutcome::Fresh, RefreshOutcome::Refreshed]);
        assert_eq!(refresher.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_static_provider_never_refreshes_but_syncs_channel() {
        let refresher = Arc::new(FakeRefresher::default());
        let mut studio = provider(ProviderKind::CozeStudio, 0);
        studio.base_url = Some("https://studio.internal/".to_string());
        studio.access_token = SecretString::new("pat-1".to_string());
        let (store, manager, p, channel) = setup(studio, refresher.clone()).await;

        assert_eq!(manager.check_and_refresh(p.id, 1).await.unwrap(), RefreshOutcome::Static);
        assert_eq!(manager.ensure_channel(&channel).await.unwrap(), RefreshOutcome::Synced);

        let reread = store.get_channel(channel.id).await.unwrap().unwrap();
        assert_eq!(reread.key.expose_secret(), "pat-1");
        assert_eq!(reread.base_url.as_deref(), Some("https://studio.internal"));
        assert_eq!(manager.ensure_channel(&reread).await.unwrap(), RefreshOutcome::Static);
        assert_eq!(refresher.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_static_provider_without_base_url_is_config_error() {
        let refresher = Arc::new(FakeRefresher::default());
        let (_, manager, _, channel) = setup(provider(ProviderKind::CozeStudio, 0), refresher).await;

        let err = manager.ensure_channel(&channel).await.unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[tokio::test]
    async fn test_authorize_sets_tokens_and_flag() {
        let refresher = Arc::new(FakeRefresher::default());
        let mut pending = provider(ProviderKind::CozeCn, 0);
        pending.is_authorized = false;
        let (store, manager, p, _) = setup(pending, refresher.clone()).await;

        let authorized = manager.authorize(p.id, 1, "abc", "https://hub/callback").await.unwrap();

        assert!(authorized.is_authorized);
        assert!(authorized.authed_time > 0);
        assert_eq!(authorized.access_token.expose_secret(), "access-abc");
        let stored = store.get_provider(p.id, 1).await.unwrap().unwrap();
        assert_eq!(stored.credential_state(Utc::now().timestamp()), CredentialState::Fresh);
        assert_eq!(refresher.exchanges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_channel_without_provider_is_fresh() {
        let store = JsonStore::in_memory();
        let manager = CredentialManager::new(Arc::new(store), Arc::new(FakeRefresher::default()));
        let mut channel = bound_channel(0, "k");
        channel.provider_id = None;

        assert_eq!(manager.ensure_channel(&channel).await.unwrap(), RefreshOutcome::Fresh);
    }
}
