//! Document reranking against the Bailian text-rerank service.

use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::adaptors::{error_from_response, mask_api_key, RelayError};
use crate::models::Usage;
use crate::store::Channel;
use crate::usage::count_tokens;

pub const DEFAULT_BASE_URL: &str = "https://dashscope.aliyuncs.com";

pub const MAX_DOCUMENTS: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankRequest {
    pub model: String,
    pub query: String,
    pub documents: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_n: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_documents: Option<bool>,
}

impl RerankRequest {
    /// Reject malformed input and clamp `top_n` to the document count
    pub fn validate(&mut self) -> Result<(), RelayError> {
        if self.model.trim().is_empty() {
            return Err(RelayError::Validation("model must not be empty".to_string()));
        }
        if self.query.is_empty() {
            return Err(RelayError::Validation("query must not be empty".to_string()));
        }
        if self.documents.is_empty() {
            return Err(RelayError::Validation("documents must not be empty".to_string()));
        }
        if self.documents.len() > MAX_DOCUMENTS {
            return Err(RelayError::Validation(format!(
                "at most {} documents are accepted, got {}",
                MAX_DOCUMENTS,
                self.documents.len()
            )));
        }
        if let Some(top_n) = self.top_n {
            if top_n <= 0 {
                return Err(RelayError::Validation("top_n must be greater than 0".to_string()));
            }
            self.top_n = Some(top_n.min(self.documents.len() as i64));
        }
        Ok(())
    }

    fn wants_documents(&self) -> bool {
        self.return_documents.unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankDocument {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankResult {
    pub object: String,
    pub index: usize,
    pub relevance_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<RerankDocument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankResponse {
    pub object: String,
    pub model: String,
    pub data: Vec<RerankResult>,
    pub usage: Usage,
}

/// Query plus all documents as prompt; nothing is generated
pub fn rerank_usage(request: &RerankRequest) -> Usage {
    let prompt = count_tokens(&request.query) + count_tokens(&request.documents.join(" "));
    Usage::new(prompt, 0)
}

#[derive(Debug, Deserialize)]
struct VendorResult {
    index: usize,
    #[serde(default)]
    relevance_score: f64,
    #[serde(default)]
    document: Option<RerankDocument>,
}

#[derive(Debug, Deserialize)]
struct VendorOutput {
    results: Vec<VendorResult>,
}

#[derive(Debug, Deserialize)]
struct VendorResponse {
    output: Option<VendorOutput>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

fn convert_response(vendor: VendorResponse, request: &RerankRequest) -> Result<RerankResponse, RelayError> {
    let Some(output) = vendor.output else {
        return match vendor.code {
            Some(code) => Err(RelayError::Vendor {
                code,
                message: vendor.message.unwrap_or_default(),
            }),
            None => Err(RelayError::Parse("rerank response has no output".to_string())),
        };
    };

    let data = output
        .results
        .into_iter()
        .map(|r| {
            let document = if request.wants_documents() {
                r.document
                    .or_else(|| request.documents.get(r.index).map(|text| RerankDocument { text: text.clone() }))
            } else {
                None
            };
            RerankResult {
                object: "rerank_result".to_string(),
                index: r.index,
                relevance_score: r.relevance_score,
                document,
            }
        })
        .collect();

    Ok(RerankResponse {
        object: "list".to_string(),
        model: request.model.clone(),
        data,
        usage: rerank_usage(request),
    })
}

/// Bailian text-rerank client
#[derive(Clone)]
pub struct BailianRerank {
    client: reqwest::Client,
}

impl BailianRerank {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Score `request.documents` against the query; the request must be validated
    pub async fn rerank(&self, channel: &Channel, request: &RerankRequest) -> Result<RerankResponse, RelayError> {
        let base = channel.base_url_or(DEFAULT_BASE_URL).trim_end_matches('/');
        let url = format!("{}/api/v1/services/rerank/text-rerank/text-rerank", base);

        let mut parameters = serde_json::Map::new();
        if let Some(top_n) = request.top_n {
            parameters.insert("top_n".to_string(), json!(top_n));
        }
        parameters.insert("return_documents".to_string(), json!(request.wants_documents()));
        let body = json!({
            "model": request.model,
            "input": {"query": request.query, "documents": request.documents},
            "parameters": parameters,
        });

        let key = channel.key.expose_secret();
        debug!(
            "Rerank {} documents with {} via {} (key {})",
            request.documents.len(),
            request.model,
            url,
            mask_api_key(key)
        );

        let response = self.client.post(&url).bearer_auth(key).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let vendor: VendorResponse = response.json().await?;
        let reranked = convert_response(vendor, request)?;
        info!(
            "✅ Reranked {} documents into {} results ({} tokens)",
            request.documents.len(),
            reranked.data.len(),
            reranked.usage.total_tokens()
        );
        Ok(reranked)
    }
}
