//! Coze OAuth token endpoint, workspace/bot discovery, and the callback flow
//! that binds discovered bots to the Provider's channel.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::credentials::{CredentialManager, TokenGrant, TokenRefresher};
use crate::adaptors::coze::CozeEnvelope;
use crate::adaptors::{error_from_response, RelayError};
use crate::store::{Channel, ChannelStatus, ChannelStore, OAuthClientConfig, Provider, VendorType};
use crate::tasks::TaskRunner;

const PAGE_SIZE: usize = 50;
const MAX_PAGES: usize = 20;

fn provider_base(provider: &Provider) -> Result<String, RelayError> {
    provider
        .api_base_url()
        .ok_or_else(|| RelayError::Config(format!("provider {} requires a custom base_url", provider.id)))
}

fn oauth_client(provider: &Provider) -> Result<&OAuthClientConfig, RelayError> {
    provider
        .oauth
        .as_ref()
        .ok_or_else(|| RelayError::Config(format!("provider {} has no OAuth client configured", provider.id)))
}

#[derive(Debug, Serialize)]
#[serde(tag = "grant_type", rename_all = "snake_case")]
enum TokenRequest<'a> {
    AuthorizationCode {
        code: &'a str,
        redirect_uri: &'a str,
        client_id: &'a str,
    },
    RefreshToken {
        refresh_token: &'a str,
        client_id: &'a str,
    },
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: String,
    /// Absolute expiry in epoch seconds
    #[serde(default)]
    expires_in: i64,
    #[serde(default)]
    error_message: Option<String>,
}

/// Exchanges codes and refresh tokens at `/api/permission/oauth2/token`
#[derive(Clone)]
pub struct CozeOAuthClient {
    client: reqwest::Client,
}

impl CozeOAuthClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn request_token(&self, provider: &Provider, body: &TokenRequest<'_>) -> Result<TokenGrant, RelayError> {
        let oauth = oauth_client(provider)?;
        let url = format!("{}/api/permission/oauth2/token", provider_base(provider)?);
        debug!("Requesting Coze token for provider {}", provider.id);

        let response = self
            .client
            .post(&url)
            .bearer_auth(oauth.client_secret.expose_secret())
            .json(body)
            .send()
            .await?;
        if !response.status().is_success() {
            let err = error_from_response(response).await;
            return Err(RelayError::Auth(err.to_string()));
        }

        let token: TokenResponse = response.json().await?;
        if token.access_token.is_empty() {
            return Err(RelayError::Auth(
                token
                    .error_message
                    .unwrap_or_else(|| "token endpoint returned no access_token".to_string()),
            ));
        }
        Ok(TokenGrant {
            access_token: SecretString::new(token.access_token),
            refresh_token: SecretString::new(token.refresh_token),
            expires_in: token.expires_in,
        })
    }
}

#[async_trait]
impl TokenRefresher for CozeOAuthClient {
    async fn exchange_code(&self, provider: &Provider, code: &str, redirect_uri: &str) -> Result<TokenGrant, RelayError> {
        let oauth = oauth_client(provider)?;
        let body = TokenRequest::AuthorizationCode {
            code,
            redirect_uri,
            client_id: &oauth.client_id,
        };
        self.request_token(provider, &body).await
    }

    async fn refresh(&self, provider: &Provider) -> Result<TokenGrant, RelayError> {
        let oauth = oauth_client(provider)?;
        let body = TokenRequest::RefreshToken {
            refresh_token: provider.refresh_token.expose_secret(),
            client_id: &oauth.client_id,
        };
        self.request_token(provider, &body).await
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Workspace {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct WorkspacePage {
    #[serde(default)]
    workspaces: Vec<Workspace>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Bot {
    pub bot_id: String,
    #[serde(default)]
    pub bot_name: String,
}

#[derive(Debug, Deserialize)]
struct BotPage {
    #[serde(default)]
    space_bots: Vec<Bot>,
}

/// Paginated discovery over the Coze open API
#[derive(Clone)]
pub struct CozeApi {
    client: reqwest::Client,
}

impl CozeApi {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn get_page<T>(&self, provider: &Provider, path: &str, query: &[(&str, String)]) -> Result<T, RelayError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let url = format!("{}{}", provider_base(provider)?, path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(provider.access_token.expose_secret())
            .query(query)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let envelope: CozeEnvelope<T> = response.json().await?;
        envelope.into_data()
    }

    /// All workspaces, stopping at the first empty page
    pub async fn workspaces(&self, provider: &Provider) -> Result<Vec<Workspace>, RelayError> {
        let mut all = Vec::new();
        for page in 1..=MAX_PAGES {
            let query = [("page_num", page.to_string()), ("page_size", PAGE_SIZE.to_string())];
            let batch: WorkspacePage = self.get_page(provider, "/v1/workspaces", &query).await?;
            if batch.workspaces.is_empty() {
                break;
            }
            all.extend(batch.workspaces);
        }
        Ok(all)
    }

    /// Published bots of one workspace, stopping at the first short page
    pub async fn bots(&self, provider: &Provider, space_id: &str) -> Result<Vec<Bot>, RelayError> {
        let mut all = Vec::new();
        for page in 1..=MAX_PAGES {
            let query = [
                ("space_id", space_id.to_string()),
                ("page_index", page.to_string()),
                ("page_size", PAGE_SIZE.to_string()),
            ];
            let batch: BotPage = self.get_page(provider, "/v1/space/published_bots_list", &query).await?;
            let count = batch.space_bots.len();
            all.extend(batch.space_bots);
            if count < PAGE_SIZE {
                break;
            }
        }
        Ok(all)
    }

    /// Bot model names across every workspace; a failing workspace is skipped
    pub async fn discover_models(&self, provider: &Provider) -> Result<Vec<String>, RelayError> {
        let mut models = Vec::new();
        for workspace in self.workspaces(provider).await? {
            match self.bots(provider, &workspace.id).await {
                Ok(bots) => models.extend(bots.into_iter().map(|b| format!("bot-{}", b.bot_id))),
                Err(e) => warn!("⚠️  Skipping workspace {} ({}): {}", workspace.id, workspace.name, e),
            }
        }
        Ok(models)
    }
}

/// Merge `models` into the Provider's Coze channel, creating it when absent
pub async fn merge_channel_models(
    store: &dyn ChannelStore,
    provider: &Provider,
    models: Vec<String>,
) -> Result<Channel, RelayError> {
    let base_url = provider.api_base_url();
    let existing = store
        .channels_for_provider(provider.tenant_id, provider.id)
        .await?
        .into_iter()
        .find(|c| c.vendor == VendorType::Coze);

    match existing {
        Some(mut channel) => {
            let added = channel.merge_models(models);
            channel.key = provider.access_token.clone();
            channel.base_url = base_url;
            channel.status = ChannelStatus::Enabled;
            store.update_channel(&channel).await?;
            info!("🤖 Channel {} now serves {} bot(s), {} new", channel.id, channel.models.len(), added);
            Ok(channel)
        }
        None => {
            let mut channel = Channel {
                id: 0,
                tenant_id: provider.tenant_id,
                name: provider.name.clone(),
                vendor: VendorType::Coze,
                key: provider.access_token.clone(),
                base_url,
                models: Vec::new(),
                weight: 1,
                priority: 0,
                status: ChannelStatus::Enabled,
                provider_id: Some(provider.id),
            };
            channel.merge_models(models);
            let channel = store.save_channel(channel).await?;
            info!("🤖 Created channel {} with {} bot(s)", channel.id, channel.models.len());
            Ok(channel)
        }
    }
}

/// OAuth callback handling for Coze Providers
pub struct CozeService {
    store: Arc<dyn ChannelStore>,
    credentials: Arc<CredentialManager>,
    api: CozeApi,
    tasks: TaskRunner,
}

impl CozeService {
    pub fn new(
        store: Arc<dyn ChannelStore>,
        credentials: Arc<CredentialManager>,
        api: CozeApi,
        tasks: TaskRunner,
    ) -> Self {
        Self {
            store,
            credentials,
            api,
            tasks,
        }
    }

    /// Exchange the code, then discover bots and merge them off the response path
    pub async fn handle_callback(
        &self,
        tenant_id: i64,
        provider_id: i64,
        code: &str,
        redirect_uri: &str,
    ) -> Result<Provider, RelayError> {
        if code.is_empty() {
            return Err(RelayError::Validation("missing authorization code".to_string()));
        }
        let provider = self
            .credentials
            .authorize(provider_id, tenant_id, code, redirect_uri)
            .await?;

        let store = self.store.clone();
        let api = self.api.clone();
        let discovered = provider.clone();
        self.tasks
            .run("coze-bot-sync", async move {
                let models = api.discover_models(&discovered).await?;
                merge_channel_models(store.as_ref(), &discovered, models).await?;
                Ok::<(), RelayError>(())
            })
            .await;

        Ok(provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credentials::tests::{bound_channel, provider};
    use crate::store::{JsonStore, ProviderKind};
    use mockito::Matcher;
    use serde_json::json;

    fn oauth_provider(base_url: &str) -> Provider {
        let mut p = provider(ProviderKind::CozeCn, 0);
        p.is_authorized = false;
        p.base_url = Some(base_url.to_string());
        p.oauth = Some(OAuthClientConfig {
            client_id: "client-1".to_string(),
            client_secret: SecretString::new("secret-1".to_string()),
        });
        p
    }

    #[tokio::test]
    async fn test_refresh_posts_refresh_grant() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/permission/oauth2/token")
            .match_header("authorization", "Bearer secret-1")
            .match_body(Matcher::Json(json!({
                "grant_type": "refresh_token",
                "refresh_token": "refresh-0",
                "client_id": "client-1"
            })))
            .with_status(200)
            .with_body(r#"{"access_token":"new-access","refresh_token":"new-refresh","expires_in":1900000000}"#)
            .create_async()
            .await;

        let client = CozeOAuthClient::new(reqwest::Client::new());
        let grant = client.refresh(&oauth_provider(&server.url())).await.unwrap();

        mock.assert_async().await;
        assert_eq!(grant.access_token.expose_secret(), "new-access");
        assert_eq!(grant.refresh_token.expose_secret(), "new-refresh");
        assert_eq!(grant.expires_in, 1_900_000_000);
    }

    #[tokio::test]
    async fn test_token_endpoint_rejection_is_auth_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/permission/oauth2/token")
            .with_status(400)
            .with_body(r#"{"error_code":"invalid_grant","error_message":"code expired"}"#)
            .create_async()
            .await;

        let client = CozeOAuthClient::new(reqwest::Client::new());
        let err = client
            .exchange_code(&oauth_provider(&server.url()), "abc", "https://hub/cb")
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Auth(_)));
    }

    #[tokio::test]
    async fn test_missing_oauth_client_is_config_error() {
        let mut p = oauth_provider("https://api.coze.cn");
        p.oauth = None;
        let err = CozeOAuthClient::new(reqwest::Client::new()).refresh(&p).await.unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[tokio::test]
    async fn test_bot_pagination_stops_on_short_page() {
        let mut server = mockito::Server::new_async().await;
        let full: Vec<_> = (0..PAGE_SIZE).map(|i| json!({"bot_id": format!("a{}", i)})).collect();
        let page1 = server
            .mock("GET", "/v1/space/published_bots_list")
            .match_query(Matcher::UrlEncoded("page_index".into(), "1".into()))
            .with_body(json!({"code": 0, "msg": "", "data": {"space_bots": full}}).to_string())
            .create_async()
            .await;
        let page2 = server
            .mock("GET", "/v1/space/published_bots_list")
            .match_query(Matcher::UrlEncoded("page_index".into(), "2".into()))
            .with_body(json!({"code": 0, "msg": "", "data": {"space_bots": [{"bot_id": "last"}]}}).to_string())
            .create_async()
            .await;

        let api = CozeApi::new(reqwest::Client::new());
        let bots = api.bots(&oauth_provider(&server.url()), "ws-1").await.unwrap();

        page1.assert_async().await;
        page2.assert_async().await;
        assert_eq!(bots.len(), PAGE_SIZE + 1);
        assert_eq!(bots.last().unwrap().bot_id, "last");
    }

    #[tokio::test]
    async fn test_discovery_skips_failing_workspace() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/workspaces")
            .match_query(Matcher::UrlEncoded("page_num".into(), "1".into()))
            .with_body(json!({"code": 0, "data": {"workspaces": [{"id": "ws-1"}, {"id": "ws-2"}]}}).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/v1/workspaces")
            .match_query(Matcher::UrlEncoded("page_num".into(), "2".into()))
            .with_body(json!({"code": 0, "data": {"workspaces": []}}).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/v1/space/published_bots_list")
            .match_query(Matcher::UrlEncoded("space_id".into(), "ws-1".into()))
            .with_body(json!({"code": 0, "data": {"space_bots": [{"bot_id": "7"}]}}).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/v1/space/published_bots_list")
            .match_query(Matcher::UrlEncoded("space_id".into(), "ws-2".into()))
            .with_body(r#"{"code":4101,"msg":"no permission"}"#)
            .create_async()
            .await;

        let api = CozeApi::new(reqwest::Client::new());
        let models = api.discover_models(&oauth_provider(&server.url())).await.unwrap();

        assert_eq!(models, vec!["bot-7".to_string()]);
    }

    #[tokio::test]
    async fn test_merge_appends_to_existing_channel() {
        let store = JsonStore::in_memory();
        let mut p = store.insert_provider(provider(ProviderKind::CozeCn, 0)).await.unwrap();
        let channel = store.save_channel(bound_channel(p.id, "stale")).await.unwrap();
        p.access_token = SecretString::new("fresh".to_string());

        let merged = merge_channel_models(&store, &p, vec!["bot-2".into(), "bot-1".into()]).await.unwrap();

        assert_eq!(merged.id, channel.id);
        assert_eq!(merged.models, vec!["bot-1", "bot-2"]);
        assert_eq!(merged.key.expose_secret(), "fresh");
        assert_eq!(store.list_channels().await.len(), 1);
    }

    #[tokio::test]
    async fn test_callback_authorizes_and_creates_channel() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/permission/oauth2/token")
            .with_body(r#"{"access_token":"at-1","refresh_token":"rt-1","expires_in":1900000000}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/v1/workspaces")
            .match_query(Matcher::UrlEncoded("page_num".into(), "1".into()))
            .with_body(json!({"code": 0, "data": {"workspaces": [{"id": "ws-1"}]}}).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/v1/workspaces")
            .match_query(Matcher::UrlEncoded("page_num".into(), "2".into()))
            .with_body(json!({"code": 0, "data": {"workspaces": []}}).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/v1/space/published_bots_list")
            .with_body(json!({"code": 0, "data": {"space_bots": [{"bot_id": "7"}, {"bot_id": "8"}]}}).to_string())
            .create_async()
            .await;

        let store = JsonStore::in_memory();
        let p = store.insert_provider(oauth_provider(&server.url())).await.unwrap();
        let shared: Arc<dyn ChannelStore> = Arc::new(store.clone());
        let client = reqwest::Client::new();
        let credentials = Arc::new(CredentialManager::new(
            shared.clone(),
            Arc::new(CozeOAuthClient::new(client.clone())),
        ));
        let service = CozeService::new(shared, credentials, CozeApi::new(client), TaskRunner::inline());

        let authorized = service.handle_callback(1, p.id, "code-1", "https://hub/cb").await.unwrap();
        assert!(authorized.is_authorized);

        let channels = store.list_channels().await;
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].models, vec!["bot-7", "bot-8"]);
        assert_eq!(channels[0].provider_id, Some(p.id));
        assert_eq!(channels[0].key.expose_secret(), "at-1");
    }
}
