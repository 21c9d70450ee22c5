//! Tencent LKE enterprise chat over SSE.

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::{RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::error::RelayError;
use super::streaming::{
    normalize_events, parse_sse_events, AllowList, EventKind, SseEvent, SseStream, StreamAccounting, VendorEvents,
};
use super::{
    do_request_helper, error_from_response, resolve_base_url, Adaptor, AdaptorContext, AdaptorOutput, Completion,
    Meta, RelayStream,
};
use crate::models::{ChatCompletionChunk, ChatRequest, ChatResponse};

const DEFAULT_BASE_URL: &str = "https://wss.lke.cloud.tencent.com";

const MODEL_LIST: &[&str] = &["lke-default"];

static REPLY_EVENTS: AllowList = AllowList::new(&[("reply", EventKind::Content), ("error", EventKind::Error)]);

#[derive(Debug, Serialize)]
struct TencentRequest {
    content: String,
    session_id: String,
    bot_app_key: String,
    visitor_biz_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    system_role: String,
    incremental: bool,
    stream: &'static str,
    #[serde(skip_serializing_if = "String::is_empty")]
    model_name: String,
}

#[derive(Debug, Default, Deserialize)]
struct ReplyEnvelope {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    payload: ReplyPayload,
    #[serde(default)]
    error: Option<ErrorInfo>,
}

#[derive(Debug, Default, Clone, Deserialize)]
struct ReplyPayload {
    #[serde(default)]
    request_id: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    is_from_self: bool,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    timestamp: i64,
}

impl ReplyPayload {
    fn response_id(&self) -> &str {
        if self.session_id.is_empty() {
            &self.request_id
        } else {
            &self.session_id
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorInfo {
    #[serde(default)]
    code: Value,
    #[serde(default)]
    message: String,
}

fn vendor_error(error: Option<&ErrorInfo>) -> RelayError {
    match error {
        Some(info) => RelayError::Vendor {
            code: match &info.code {
                Value::String(s) => s.clone(),
                Value::Null => "tencent_error".to_string(),
                other => other.to_string(),
            },
            message: info.message.clone(),
        },
        None => RelayError::Vendor {
            code: "tencent_error".to_string(),
            message: "Tencent reported an error".to_string(),
        },
    }
}

/// New text in `current` relative to the previous reply
fn reply_delta<'a>(previous: &str, current: &'a str) -> &'a str {
    if current.len() > previous.len() && current.starts_with(previous) {
        &current[previous.len()..]
    } else {
        current
    }
}

pub struct TencentAdaptor {
    ctx: AdaptorContext,
}

impl TencentAdaptor {
    pub fn new(ctx: AdaptorContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Adaptor for TencentAdaptor {
    fn request_url(&self, meta: &Meta) -> Result<String, RelayError> {
        let base = resolve_base_url(meta.base_url.as_deref(), Some(DEFAULT_BASE_URL), "tencent")?;
        Ok(format!("{}/v1/qbot/chat/sse", base))
    }

    fn setup_request_header(&self, request: RequestBuilder, meta: &Meta) -> RequestBuilder {
        request.bearer_auth(meta.api_key()).header(ACCEPT, "text/event-stream")
    }

    async fn convert_request(&self, meta: &Meta, request: &ChatRequest) -> Result<Value, RelayError> {
        let session_id = meta
            .conversation_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let body = TencentRequest {
            content: request.last_text_for_role("user").unwrap_or_default(),
            session_id,
            bot_app_key: meta.api_key().to_string(),
            visitor_biz_id: meta.user_id.clone(),
            system_role: request.last_text_for_role("system").unwrap_or_default(),
            incremental: true,
            stream: if meta.is_stream { "enable" } else { "disable" },
            model_name: request.model.clone(),
        };
        Ok(serde_json::to_value(body)?)
    }

    async fn do_request(&self, meta: &Meta, body: Value) -> Result<Response, RelayError> {
        do_request_helper(self, &self.ctx.client, meta, &body).await
    }

    async fn do_response(&self, meta: &Meta, response: Response) -> Result<AdaptorOutput, RelayError> {
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        if meta.is_stream {
            let accounting = StreamAccounting::new();
            let frames = normalize_events(
                SseStream::new(response.bytes_stream()),
                ReplyEvents::new(&meta.actual_model),
                accounting.clone(),
            );
            return Ok(AdaptorOutput::Stream(RelayStream { frames, accounting }));
        }

        let body = response.text().await?;
        let reply = final_reply(&body)?;
        debug!("Tencent final reply for session {}", reply.session_id);

        let mut response = ChatResponse::assistant(reply.response_id(), meta.actual_model.clone(), reply.content.clone());
        if reply.timestamp > 0 {
            response.created = reply.timestamp;
        }
        Ok(AdaptorOutput::Complete(Completion {
            response,
            vendor_usage: None,
            vendor_conversation_id: Some(reply.session_id).filter(|id| !id.is_empty()),
        }))
    }

    fn model_list(&self) -> Vec<String> {
        MODEL_LIST.iter().map(|m| m.to_string()).collect()
    }

    fn channel_name(&self) -> &'static str {
        "tencent"
    }
}

/// Final bot reply from a JSON body or an SSE transcript
fn final_reply(body: &str) -> Result<ReplyPayload, RelayError> {
    let envelopes: Vec<ReplyEnvelope> = match serde_json::from_str::<ReplyEnvelope>(body) {
        Ok(envelope) => vec![envelope],
        Err(_) => parse_sse_events(body)
            .iter()
            .filter_map(|e| serde_json::from_str(&e.data).ok())
            .collect(),
    };

    if let Some(error) = envelopes.iter().find(|e| e.kind == "error") {
        return Err(vendor_error(error.error.as_ref()));
    }

    let replies: Vec<&ReplyPayload> = envelopes
        .iter()
        .filter(|e| e.kind == "reply" && !e.payload.is_from_self)
        .map(|e| &e.payload)
        .collect();

    replies
        .iter()
        .rev()
        .find(|p| p.is_final)
        .or_else(|| replies.last())
        .map(|p| (*p).clone())
        .ok_or_else(|| RelayError::Parse("Tencent response carried no reply".to_string()))
}

/// Turns cumulative replies into OpenAI chunk deltas
struct ReplyEvents {
    model: String,
    previous: String,
}

impl ReplyEvents {
    fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            previous: String::new(),
        }
    }
}

impl VendorEvents for ReplyEvents {
    fn allow_list(&self) -> &'static AllowList {
        &REPLY_EVENTS
    }

    fn render(&mut self, _kind: EventKind, _sse: &SseEvent, payload: &Value, tally: &StreamAccounting) -> Option<String> {
        let envelope: ReplyEnvelope = serde_json::from_value(payload.clone()).ok()?;
        let reply = envelope.payload;
        if reply.is_from_self {
            return None;
        }

        let delta = reply_delta(&self.previous, &reply.content).to_string();
        self.previous = reply.content.clone();
        tally.push_text(&delta);
        tally.set_conversation_id(reply.session_id.clone());

        let finish = reply.is_final.then_some("stop");
        let mut chunk = ChatCompletionChunk::delta(reply.response_id(), self.model.clone(), Some("assistant"), Some(delta), finish);
        if reply.timestamp > 0 {
            chunk.created = reply.timestamp;
        }
        serde_json::to_string(&chunk).ok()
    }

    fn error(&self, payload: &Value) -> RelayError {
        let envelope: ReplyEnvelope = serde_json::from_value(payload.clone()).unwrap_or_default();
        vendor_error(envelope.error.as_ref())
    }

    fn is_terminal(&self, _kind: EventKind, payload: &Value) -> bool {
        let is_final = payload.pointer("/payload/is_final").and_then(Value::as_bool).unwrap_or(false);
        let from_self = payload.pointer("/payload/is_from_self").and_then(Value::as_bool).unwrap_or(false);
        is_final && !from_self
    }
}
