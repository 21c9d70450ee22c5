//! 53AI workflow runs.
//!
//! Upstream always streams. Stream callers receive the accepted workflow
//! events verbatim; everyone else gets the run folded into a single
//! response carrying the workflow outputs.

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::{RequestBuilder, Response};
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

use super::ai53::{ai53_base_url, Ai53File, Ai53Uploader};
use super::error::RelayError;
use super::streaming::{
    drain, normalize_events, AllowList, EventKind, SseEvent, SseStream, StreamAccounting, VendorEvents,
};
use super::{
    do_request_helper, error_from_response, strip_model_prefix, Adaptor, AdaptorContext, AdaptorOutput, Completion,
    Meta, RelayStream,
};
use crate::bridge::classify_file_type;
use crate::models::{ChatRequest, ChatResponse, WorkflowResult};

const DEFAULT_USER: &str = "ai53_user";
const FILE_ID_PREFIX: &str = "file_id:";

static STREAM_EVENTS: AllowList = AllowList::new(&[
    ("workflow_started", EventKind::Start),
    ("text_chunk", EventKind::Content),
    ("workflow_finished", EventKind::Finish),
    ("error", EventKind::Error),
]);

static AGGREGATE_EVENTS: AllowList = AllowList::new(&[
    ("workflow_started", EventKind::Start),
    ("text_chunk", EventKind::Content),
    ("node_finished", EventKind::Content),
    ("workflow_finished", EventKind::Finish),
    ("error", EventKind::Error),
]);

pub struct Ai53WorkflowAdaptor {
    ctx: AdaptorContext,
}

impl Ai53WorkflowAdaptor {
    pub fn new(ctx: AdaptorContext) -> Self {
        Self { ctx }
    }

    /// Bridge a file and describe it as a workflow file input
    async fn file_input(&self, meta: &Meta, file_id: i64) -> Result<Ai53File, RelayError> {
        let uploader = Ai53Uploader {
            client: self.ctx.client.clone(),
        };
        let file = self.ctx.bridge.upload_file(file_id, meta.tenant_id).await?;
        let mapping = self
            .ctx
            .bridge
            .bridge(&uploader, meta, file_id, &meta.actual_model)
            .await?;
        Ok(Ai53File::local(
            classify_file_type(&file.mime_type, &file.extension),
            mapping.channel_file_id,
        ))
    }

    /// Replace every `file_id:<n>` string in the parameters with a file input array.
    ///
    /// References that fail to resolve keep their original string.
    async fn resolve_parameters(&self, meta: &Meta, parameters: Map<String, Value>) -> Map<String, Value> {
        let mut ids = BTreeSet::new();
        for value in parameters.values() {
            collect_file_ids(value, &mut ids);
        }

        let mut resolved = HashMap::new();
        for id in ids {
            match self.file_input(meta, id).await {
                Ok(file) => {
                    resolved.insert(id, file);
                }
                Err(e) => warn!("Keeping unresolved workflow file reference {}: {}", id, e),
            }
        }

        parameters
            .into_iter()
            .map(|(key, value)| (key, substitute_file_ids(value, &resolved)))
            .collect()
    }
}

fn parse_file_id(value: &str) -> Option<i64> {
    value.strip_prefix(FILE_ID_PREFIX)?.trim().parse().ok()
}

fn collect_file_ids(value: &Value, ids: &mut BTreeSet<i64>) {
    match value {
        Value::String(s) => {
            if let Some(id) = parse_file_id(s) {
                ids.insert(id);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_file_ids(v, ids)),
        Value::Object(map) => map.values().for_each(|v| collect_file_ids(v, ids)),
        _ => {}
    }
}

fn substitute_file_ids(value: Value, resolved: &HashMap<i64, Ai53File>) -> Value {
    match value {
        Value::String(s) => match parse_file_id(&s).and_then(|id| resolved.get(&id)) {
            Some(file) => json!([file]),
            None => Value::String(s),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(|v| substitute_file_ids(v, resolved)).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, substitute_file_ids(v, resolved)))
                .collect(),
        ),
        other => other,
    }
}

#[async_trait]
impl Adaptor for Ai53WorkflowAdaptor {
    fn request_url(&self, meta: &Meta) -> Result<String, RelayError> {
        Ok(format!("{}/v3/workflows/run", ai53_base_url(meta)?))
    }

    fn setup_request_header(&self, request: RequestBuilder, meta: &Meta) -> RequestBuilder {
        request
            .bearer_auth(meta.api_key())
            .header("Bot-Id", strip_model_prefix(&meta.actual_model, &["workflow-"]))
            .header(ACCEPT, "text/event-stream")
    }

    async fn convert_request(&self, meta: &Meta, request: &ChatRequest) -> Result<Value, RelayError> {
        let parameters = request.parameters.clone().unwrap_or_default();
        let mut inputs = self.resolve_parameters(meta, parameters).await;

        if let Some(last) = request.last_message() {
            let text = last.text();
            if !text.is_empty() && !inputs.contains_key("input") {
                inputs.insert("input".to_string(), Value::String(text));
            }

            let mut sys_files = Vec::new();
            for file_ref in last.file_refs() {
                match self.file_input(meta, file_ref.file_id).await {
                    Ok(file) => sys_files.push(file),
                    Err(e) => warn!("Skipping workflow file {}: {}", file_ref.file_id, e),
                }
            }
            if !sys_files.is_empty() {
                inputs.insert("sys_files".to_string(), serde_json::to_value(sys_files)?);
            }
        }

        let user = request
            .user
            .clone()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_USER.to_string());
        debug!("Workflow run with {} inputs for user {}", inputs.len(), user);

        Ok(json!({
            "inputs": inputs,
            "response_mode": "streaming",
            "user": user,
        }))
    }

    async fn do_request(&self, meta: &Meta, body: Value) -> Result<Response, RelayError> {
        do_request_helper(self, &self.ctx.client, meta, &body).await
    }

    async fn do_response(&self, meta: &Meta, response: Response) -> Result<AdaptorOutput, RelayError> {
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let accounting = StreamAccounting::new();
        let events = SseStream::new(response.bytes_stream());

        if meta.is_stream {
            let frames = normalize_events(events, WorkflowEvents { aggregate: false }, accounting.clone());
            return Ok(AdaptorOutput::Stream(RelayStream { frames, accounting }));
        }

        drain(normalize_events(events, WorkflowEvents { aggregate: true }, accounting.clone())).await?;
        let tally = accounting.snapshot();

        let mut outputs = tally.outputs.unwrap_or_default();
        if !tally.text.is_empty() {
            outputs.insert("text".to_string(), Value::String(tally.text.clone()));
        }
        let execute_id = tally.execute_id.unwrap_or_default();
        let content = if tally.text.is_empty() && !outputs.is_empty() {
            Value::Object(outputs.clone()).to_string()
        } else {
            tally.text
        };

        let mut response = ChatResponse::assistant(
            format!("workflow-{}", execute_id),
            meta.actual_model.clone(),
            content,
        );
        response.workflow = Some(WorkflowResult { execute_id, outputs });
        Ok(AdaptorOutput::Complete(Completion {
            response,
            vendor_usage: None,
            vendor_conversation_id: None,
        }))
    }

    fn model_list(&self) -> Vec<String> {
        vec!["53ai-workflow".to_string()]
    }

    fn channel_name(&self) -> &'static str {
        "53AI-workflow"
    }
}

/// Workflow events, forwarded verbatim or folded into the tally
struct WorkflowEvents {
    aggregate: bool,
}

impl VendorEvents for WorkflowEvents {
    fn allow_list(&self) -> &'static AllowList {
        if self.aggregate {
            &AGGREGATE_EVENTS
        } else {
            &STREAM_EVENTS
        }
    }

    fn event_name(&self, _sse: &SseEvent, payload: &Value) -> Option<String> {
        payload.get("event").and_then(Value::as_str).map(str::to_string)
    }

    fn render(&mut self, kind: EventKind, sse: &SseEvent, payload: &Value, tally: &StreamAccounting) -> Option<String> {
        let task_id = payload.get("task_id").and_then(Value::as_str).filter(|id| !id.is_empty());
        let outputs = payload
            .pointer("/data/outputs")
            .and_then(Value::as_object)
            .filter(|o| kind == EventKind::Finish || !o.is_empty())
            .cloned();
        let text = payload.pointer("/data/text").and_then(Value::as_str);

        tally.update(|t| {
            if t.execute_id.is_none() {
                t.execute_id = task_id.map(str::to_string);
            }
            if let Some(outputs) = outputs {
                t.outputs = Some(outputs);
            }
            if payload.get("event").and_then(Value::as_str) == Some("text_chunk") {
                if let Some(text) = text {
                    t.text.push_str(text);
                }
            }
        });

        Some(sse.data.clone())
    }

    fn error(&self, payload: &Value) -> RelayError {
        let field = |name: &str| {
            payload
                .get(name)
                .or_else(|| payload.get("data").and_then(|d| d.get(name)))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        RelayError::Vendor {
            code: field("code").unwrap_or_else(|| "workflow_error".to_string()),
            message: field("message")
                .or_else(|| field("error"))
                .unwrap_or_else(|| "workflow execution failed".to_string()),
        }
    }
}
