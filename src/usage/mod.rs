//! Token counting and quota computation shared by every adaptor.

pub mod ledger;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tiktoken_rs::CoreBPE;
use tracing::warn;

use crate::models::{Message, Usage};

pub use ledger::{JsonlLedger, MemoryLedger, TracingLedger, UsageLedger, UsageRecord};

const TOKENS_PER_MESSAGE: u32 = 3;
const REPLY_PRIMER_TOKENS: u32 = 3;

static ENCODER: Lazy<Option<CoreBPE>> = Lazy::new(|| match tiktoken_rs::cl100k_base() {
    Ok(bpe) => Some(bpe),
    Err(e) => {
        warn!("⚠️ Tokenizer unavailable, falling back to length estimate: {}", e);
        None
    }
});

/// Token count of `text`; `chars / 4` when the tokenizer cannot load
pub fn count_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    match ENCODER.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as u32,
        None => (text.chars().count() / 4) as u32,
    }
}

/// Prompt tokens for a message list, including per-message framing
pub fn count_message_tokens(messages: &[Message]) -> u32 {
    let body: u32 = messages
        .iter()
        .map(|m| TOKENS_PER_MESSAGE + count_tokens(&m.role) + count_tokens(&m.text()))
        .sum();
    body + REPLY_PRIMER_TOKENS
}

fn one() -> f64 {
    1.0
}

/// Price multipliers for one model; a trailing `*` in `name` matches by prefix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPrice {
    pub name: String,
    pub model_ratio: f64,
    #[serde(default = "one")]
    pub completion_ratio: f64,
}

impl ModelPrice {
    fn matches(&self, model: &str) -> bool {
        match self.name.strip_suffix('*') {
            Some(prefix) => model.starts_with(prefix),
            None => self.name == model,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    #[serde(default = "one")]
    pub default_model_ratio: f64,
    #[serde(default = "one")]
    pub group_ratio: f64,
    #[serde(default)]
    pub models: Vec<ModelPrice>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            default_model_ratio: 1.0,
            group_ratio: 1.0,
            models: Vec::new(),
        }
    }
}

/// Cost figures handed to the ledger; this crate keeps no balance
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cost {
    pub quota: i64,
    pub model_ratio: f64,
    pub completion_ratio: f64,
    pub group_ratio: f64,
}

/// `ceil((prompt + completion * completion_ratio) * model_ratio * group_ratio)`,
/// at least 1 unless the combined ratio is zero
pub fn compute_quota(usage: &Usage, model_ratio: f64, completion_ratio: f64, group_ratio: f64) -> i64 {
    let ratio = model_ratio * group_ratio;
    if ratio == 0.0 {
        return 0;
    }
    let weighted = usage.prompt_tokens() as f64 + usage.completion_tokens() as f64 * completion_ratio;
    let quota = (weighted * ratio).ceil() as i64;
    quota.max(1)
}

#[derive(Debug, Clone, Default)]
pub struct UsageCalculator {
    pricing: PricingConfig,
}

impl UsageCalculator {
    pub fn new(pricing: PricingConfig) -> Self {
        Self { pricing }
    }

    fn price_for(&self, model: &str) -> (f64, f64) {
        self.pricing
            .models
            .iter()
            .find(|p| p.matches(model))
            .map(|p| (p.model_ratio, p.completion_ratio))
            .unwrap_or((self.pricing.default_model_ratio, 1.0))
    }

    pub fn cost(&self, model: &str, usage: &Usage) -> Cost {
        let (model_ratio, completion_ratio) = self.price_for(model);
        let group_ratio = self.pricing.group_ratio;
        Cost {
            quota: compute_quota(usage, model_ratio, completion_ratio, group_ratio),
            model_ratio,
            completion_ratio,
            group_ratio,
        }
    }

    /// Usage for a generated text when the vendor reports none
    pub fn text_usage(&self, prompt_tokens: u32, response_text: &str) -> Usage {
        Usage::new(prompt_tokens, count_tokens(response_text))
    }

    /// Vendor usage when present and non-zero, otherwise counted usage
    pub fn resolve(&self, vendor_usage: Option<Usage>, prompt_tokens: u32, response_text: &str) -> Usage {
        match vendor_usage {
            Some(usage) if !usage.is_zero() => usage,
            _ => self.text_usage(prompt_tokens, response_text),
        }
    }
}
