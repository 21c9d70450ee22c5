//! Request orchestration: select a channel, run the adaptor pipeline, retry
//! transport failures on another channel, and account for usage.

use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::adaptors::streaming::{FrameStream, StreamAccounting};
use crate::adaptors::{AdaptorContext, AdaptorOutput, AdaptorRegistry, Meta, RelayError};
use crate::models::{ChatRequest, ChatResponse, Usage};
use crate::rerank::{BailianRerank, RerankRequest, RerankResponse};
use crate::selector::ChannelSelector;
use crate::store::{Channel, VendorType};
use crate::tasks::TaskRunner;
use crate::usage::{count_message_tokens, UsageCalculator, UsageLedger, UsageRecord};

/// Caller identity and routing hints, set by the fronting gateway
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub tenant_id: i64,
    pub user_id: String,
    /// Vendor family; inferred from the model name when absent
    pub vendor: Option<VendorType>,
    /// Vendor conversation to continue
    pub conversation_id: Option<String>,
}

impl CallContext {
    fn vendor_for(&self, model: &str) -> VendorType {
        self.vendor.unwrap_or_else(|| VendorType::infer_from_model(model))
    }
}

pub enum ChatReply {
    Complete {
        response: ChatResponse,
        /// Vendor conversation id to hand back to the caller
        conversation_id: Option<String>,
    },
    Stream(FrameStream),
}

/// Everything needed to turn a finished call into a ledger entry
#[derive(Clone)]
struct Accountant {
    calculator: UsageCalculator,
    ledger: Arc<dyn UsageLedger>,
    tasks: TaskRunner,
}

impl Accountant {
    fn record(&self, meta: &Meta, usage: Usage, started: Instant) -> UsageRecord {
        UsageRecord {
            ts: Utc::now(),
            request_id: meta.request_id.clone(),
            tenant_id: meta.tenant_id,
            user: meta.user_id.clone(),
            model: meta.origin_model.clone(),
            channel_id: meta.channel_id,
            usage,
            cost: self.calculator.cost(&meta.origin_model, &usage),
            elapsed_ms: started.elapsed().as_millis() as u64,
            is_stream: meta.is_stream,
        }
    }

    async fn dispatch(&self, record: UsageRecord) {
        let ledger = self.ledger.clone();
        self.tasks
            .run("usage-record", async move {
                ledger.record(record).await;
                Ok::<(), Infallible>(())
            })
            .await;
    }
}

/// Records a stream's usage once, at its end or when the caller drops it
struct StreamRecorder {
    accountant: Accountant,
    meta: Meta,
    accounting: StreamAccounting,
    started: Instant,
    recorded: bool,
}

impl StreamRecorder {
    fn take_record(&mut self) -> Option<UsageRecord> {
        if self.recorded {
            return None;
        }
        self.recorded = true;
        let tally = self.accounting.snapshot();
        let usage = self
            .accountant
            .calculator
            .resolve(tally.usage, self.meta.prompt_tokens, &tally.text);
        Some(self.accountant.record(&self.meta, usage, self.started))
    }
}

impl Drop for StreamRecorder {
    fn drop(&mut self) {
        let Some(record) = self.take_record() else {
            return;
        };
        warn!("Stream {} ended early, recording partial usage", record.request_id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let ledger = self.accountant.ledger.clone();
            handle.spawn(async move { ledger.record(record).await });
        }
    }
}

fn account_stream(frames: FrameStream, mut recorder: StreamRecorder) -> FrameStream {
    let tail = stream::once(async move {
        if let Some(record) = recorder.take_record() {
            recorder.accountant.dispatch(record).await;
        }
    })
    .filter_map(|()| async { None::<Result<Bytes, RelayError>> });
    Box::pin(frames.chain(tail))
}

pub struct Relay {
    selector: Arc<ChannelSelector>,
    registry: Arc<AdaptorRegistry>,
    ctx: AdaptorContext,
    reranker: BailianRerank,
    accountant: Accountant,
}

impl Relay {
    pub fn new(
        selector: Arc<ChannelSelector>,
        registry: Arc<AdaptorRegistry>,
        ctx: AdaptorContext,
        calculator: UsageCalculator,
        ledger: Arc<dyn UsageLedger>,
        tasks: TaskRunner,
    ) -> Self {
        let reranker = BailianRerank::new(ctx.client.clone());
        Self {
            selector,
            registry,
            ctx,
            reranker,
            accountant: Accountant {
                calculator,
                ledger,
                tasks,
            },
        }
    }

    fn meta_for(&self, call: &CallContext, channel: &Channel, request: &ChatRequest, prompt_tokens: u32) -> Meta {
        let mut meta = Meta::for_channel(channel, request);
        if !call.user_id.is_empty() {
            meta.user_id = call.user_id.clone();
        }
        meta.prompt_tokens = prompt_tokens;
        meta.conversation_id = call.conversation_id.clone().filter(|c| !c.is_empty());
        meta
    }

    async fn attempt(&self, meta: &Meta, request: &ChatRequest) -> Result<AdaptorOutput, RelayError> {
        let mut adaptor = self.registry.build(meta.vendor, &self.ctx)?;
        adaptor.init(meta);
        let body = adaptor.convert_request(meta, request).await?;
        let response = adaptor.do_request(meta, body).await?;
        adaptor.do_response(meta, response).await
    }

    /// Relay one chat call, moving to another channel on transport failures
    pub async fn chat(&self, call: &CallContext, request: ChatRequest) -> Result<ChatReply, RelayError> {
        if request.messages.is_empty() {
            return Err(RelayError::Validation("messages must not be empty".to_string()));
        }
        if request.model.trim().is_empty() {
            return Err(RelayError::Validation("model must not be empty".to_string()));
        }

        let vendor = call.vendor_for(&request.model);
        let prompt_tokens = count_message_tokens(&request.messages);
        let started = Instant::now();
        let budget = self.selector.retry_times();
        let mut failed = None;
        let mut last_error = None;

        for attempt in 1..=budget {
            let channel = self
                .selector
                .select_channel(call.tenant_id, vendor, &request.model, failed)
                .await?;
            let meta = self.meta_for(call, &channel, &request, prompt_tokens);

            match self.attempt(&meta, &request).await {
                Ok(output) => return Ok(self.finish(meta, output, started).await),
                Err(e) if e.is_retryable() => {
                    warn!(
                        "⚠️  Channel {} failed (attempt {}/{}): {}",
                        channel.id, attempt, budget, e
                    );
                    failed = Some(channel.id);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        let last = last_error.unwrap_or_else(|| RelayError::NotFound(format!("no channel for {}", request.model)));
        Err(RelayError::exhausted(budget, last))
    }

    async fn finish(&self, meta: Meta, output: AdaptorOutput, started: Instant) -> ChatReply {
        match output {
            AdaptorOutput::Complete(completion) => {
                let mut response = completion.response;
                let usage =
                    self.accountant
                        .calculator
                        .resolve(completion.vendor_usage, meta.prompt_tokens, &response.text());
                response.usage = usage;
                info!(
                    "✅ {} via channel {}: {} prompt + {} completion tokens",
                    meta.origin_model,
                    meta.channel_id,
                    usage.prompt_tokens(),
                    usage.completion_tokens()
                );
                self.accountant.dispatch(self.accountant.record(&meta, usage, started)).await;
                ChatReply::Complete {
                    response,
                    conversation_id: completion.vendor_conversation_id,
                }
            }
            AdaptorOutput::Stream(stream) => {
                info!("🌊 Streaming {} via channel {}", meta.origin_model, meta.channel_id);
                let recorder = StreamRecorder {
                    accountant: self.accountant.clone(),
                    meta,
                    accounting: stream.accounting,
                    started,
                    recorded: false,
                };
                ChatReply::Stream(account_stream(stream.frames, recorder))
            }
        }
    }

    /// Validate and rerank documents on a Bailian channel
    pub async fn rerank(&self, call: &CallContext, mut request: RerankRequest) -> Result<RerankResponse, RelayError> {
        request.validate()?;
        let vendor = call.vendor_for(&request.model);
        if vendor != VendorType::Bailian {
            return Err(RelayError::Validation(format!(
                "model '{}' is not served by a rerank vendor",
                request.model
            )));
        }

        let started = Instant::now();
        let budget = self.selector.retry_times();
        let mut failed = None;
        let mut last_error = None;

        for attempt in 1..=budget {
            let channel = self
                .selector
                .select_channel(call.tenant_id, vendor, &request.model, failed)
                .await?;

            match self.reranker.rerank(&channel, &request).await {
                Ok(response) => {
                    let meta = Meta {
                        request_id: uuid::Uuid::new_v4().simple().to_string(),
                        tenant_id: call.tenant_id,
                        user_id: call.user_id.clone(),
                        channel_id: channel.id,
                        vendor,
                        origin_model: request.model.clone(),
                        actual_model: request.model.clone(),
                        api_key: channel.key.clone(),
                        base_url: channel.base_url.clone(),
                        is_stream: false,
                        prompt_tokens: response.usage.prompt_tokens(),
                        conversation_id: None,
                    };
                    self.accountant
                        .dispatch(self.accountant.record(&meta, response.usage, started))
                        .await;
                    return Ok(response);
                }
                Err(e) if e.is_retryable() => {
                    warn!("⚠️  Rerank channel {} failed (attempt {}/{}): {}", channel.id, attempt, budget, e);
                    failed = Some(channel.id);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        let last = last_error.unwrap_or_else(|| RelayError::NotFound(format!("no channel for {}", request.model)));
        Err(RelayError::exhausted(budget, last))
    }
}
