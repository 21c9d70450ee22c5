use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router as AxumRouter,
};
use bytes::Bytes;
use futures::stream::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::adaptors::streaming::data_frame;
use crate::adaptors::{AdaptorContext, AdaptorRegistry, RelayError};
use crate::auth::{CozeApi, CozeOAuthClient, CozeService, CredentialManager};
use crate::bridge::FileBridge;
use crate::cli::{AppConfig, OAuthSettings};
use crate::models::ChatRequest;
use crate::relay::{CallContext, ChatReply, Relay};
use crate::rerank::RerankRequest;
use crate::selector::ChannelSelector;
use crate::store::{ChannelStore, JsonStore, LocalFileStore, VendorType};
use crate::tasks::TaskRunner;
use crate::usage::{JsonlLedger, TracingLedger, UsageCalculator, UsageLedger};

const TENANT_HEADER: &str = "x-tenant-id";
const USER_HEADER: &str = "x-user-id";
const VENDOR_HEADER: &str = "x-vendor-type";
const CONVERSATION_HEADER: &str = "x-conversation-id";

/// Application state shared across handlers
pub struct AppState {
    pub relay: Relay,
    pub coze: CozeService,
    pub oauth: OAuthSettings,
}

/// Wire the relay from configuration
pub async fn build_state(config: &AppConfig) -> anyhow::Result<AppState> {
    let store = JsonStore::open(config.storage.state_path.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open state store: {}", e))?;
    let imported = store
        .import_seed(config.providers.clone(), config.channels.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to import seed channels: {}", e))?;
    if imported > 0 {
        info!("🌱 Imported {} seed providers/channels", imported);
    }

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.relay.request_timeout_secs))
        .build()?;

    let files = LocalFileStore::new(&config.storage.files_dir);
    let bridge = Arc::new(FileBridge::new(
        Arc::new(store.clone()),
        Arc::new(files),
        config.relay.file_mapping_ttl_secs,
    ));
    let channels: Arc<dyn ChannelStore> = Arc::new(store.clone());
    let credentials = Arc::new(CredentialManager::new(
        channels.clone(),
        Arc::new(CozeOAuthClient::new(client.clone())),
    ));
    let selector = Arc::new(ChannelSelector::new(
        channels.clone(),
        credentials.clone(),
        config.relay.channel_retry_times,
    ));

    let ledger: Arc<dyn UsageLedger> = match &config.storage.usage_log {
        Some(path) => Arc::new(JsonlLedger::open(path.clone()).await?),
        None => Arc::new(TracingLedger),
    };
    let tasks = TaskRunner::background();
    let ctx = AdaptorContext {
        client: client.clone(),
        bridge,
    };

    let registry = Arc::new(AdaptorRegistry::with_defaults());
    info!("📦 Registered adaptors: {:?}", registry.vendors());

    let relay = Relay::new(
        selector,
        registry,
        ctx,
        UsageCalculator::new(config.pricing.clone()),
        ledger,
        tasks,
    );
    let coze = CozeService::new(channels, credentials, CozeApi::new(client), tasks);

    Ok(AppState {
        relay,
        coze,
        oauth: config.oauth.clone(),
    })
}

pub fn app(state: Arc<AppState>) -> AxumRouter {
    AxumRouter::new()
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/rerank", post(handle_rerank))
        .route("/api/callback/coze/auth/:tenant", get(handle_coze_callback))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_server(config: AppConfig) -> anyhow::Result<()> {
    let state = Arc::new(build_state(&config).await?);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🚀 Server listening on {}", addr);

    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "hub-relay"
    }))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Caller identity from gateway-set headers
fn call_context(headers: &HeaderMap) -> Result<CallContext, AppError> {
    let tenant_id = header_str(headers, TENANT_HEADER)
        .ok_or_else(|| RelayError::Validation(format!("missing {} header", TENANT_HEADER)))?
        .parse::<i64>()
        .map_err(|_| RelayError::Validation(format!("{} must be an integer", TENANT_HEADER)))?;
    let vendor = header_str(headers, VENDOR_HEADER)
        .map(|v| v.parse::<VendorType>().map_err(RelayError::Validation))
        .transpose()?;

    Ok(CallContext {
        tenant_id,
        user_id: header_str(headers, USER_HEADER).unwrap_or_default().to_string(),
        vendor,
        conversation_id: header_str(headers, CONVERSATION_HEADER).map(str::to_string),
    })
}

/// `data: {"error":...}` frame closing a stream that failed mid-flight
fn error_frame(err: &RelayError) -> Bytes {
    let payload = serde_json::json!({
        "error": {"type": err.error_type(), "message": err.to_string()}
    });
    data_frame(&payload.to_string())
}

async fn handle_chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Response, AppError> {
    let call = call_context(&headers)?;
    info!(
        "💬 chat tenant={} model={} stream={}",
        call.tenant_id, request.model, request.stream
    );

    match state.relay.chat(&call, request).await? {
        ChatReply::Complete {
            response,
            conversation_id,
        } => {
            let mut http = Json(response).into_response();
            if let Some(value) = conversation_id.and_then(|id| HeaderValue::from_str(&id).ok()) {
                http.headers_mut().insert(CONVERSATION_HEADER, value);
            }
            Ok(http)
        }
        ChatReply::Stream(frames) => {
            let body_stream = frames.map(|frame| {
                Ok::<Bytes, Infallible>(match frame {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!("Stream error: {}", e);
                        error_frame(&e)
                    }
                })
            });

            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .header(header::CONNECTION, "keep-alive")
                .body(Body::from_stream(body_stream))
                .map_err(|e| AppError(RelayError::Config(format!("failed to build stream response: {}", e))))
        }
    }
}

async fn handle_rerank(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<RerankRequest>,
) -> Result<Response, AppError> {
    let call = call_context(&headers)?;
    let response = state.relay.rerank(&call, request).await?;
    Ok(Json(response).into_response())
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    #[serde(default)]
    code: String,
    /// Provider id
    #[serde(default)]
    state: String,
}

async fn handle_coze_callback(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<i64>,
    Query(params): Query<CallbackParams>,
) -> Result<Response, AppError> {
    let provider_id = params
        .state
        .parse::<i64>()
        .map_err(|_| RelayError::Validation("state must carry the provider id".to_string()))?;
    let redirect_uri = state.oauth.coze_redirect_uri(tenant_id);

    let provider = state
        .coze
        .handle_callback(tenant_id, provider_id, &params.code, &redirect_uri)
        .await
        .inspect_err(|e| warn!("⚠️  Coze authorization failed for provider {}: {}", provider_id, e))?;

    Ok(Json(serde_json::json!({
        "status": "authorized",
        "provider_id": provider.id,
        "tenant_id": provider.tenant_id,
    }))
    .into_response())
}

/// Relay errors rendered as `{"error": {"type", "message"}}`
#[derive(Debug)]
pub struct AppError(pub RelayError);

impl From<RelayError> for AppError {
    fn from(e: RelayError) -> Self {
        AppError(e)
    }
}

impl AppError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            RelayError::Validation(_) => StatusCode::BAD_REQUEST,
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::Auth(_) => StatusCode::UNAUTHORIZED,
            RelayError::Config(_) | RelayError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::Parse(_) | RelayError::Http(_) | RelayError::Transport { .. } | RelayError::Vendor { .. } => {
                StatusCode::BAD_GATEWAY
            }
            RelayError::Exhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("❌ {}", self.0);
        }

        let body = Json(serde_json::json!({
            "error": {
                "type": self.0.error_type(),
                "message": self.0.to_string()
            }
        }));

        (status, body).into_response()
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for AppError {}
