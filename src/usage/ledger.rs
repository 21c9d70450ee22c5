//! Usage ledgers
//!
//! The relay computes figures and hands them over; balances and billing
//! belong to whoever consumes the ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info};

use super::Cost;
use crate::models::Usage;

/// One completed call
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub ts: DateTime<Utc>,
    pub request_id: String,
    pub tenant_id: i64,
    pub user: String,
    pub model: String,
    pub channel_id: i64,
    pub usage: Usage,
    pub cost: Cost,
    pub elapsed_ms: u64,
    pub is_stream: bool,
}

#[async_trait]
pub trait UsageLedger: Send + Sync {
    async fn record(&self, record: UsageRecord);
}

/// Logs usage through `tracing` only
#[derive(Debug, Default)]
pub struct TracingLedger;

#[async_trait]
impl UsageLedger for TracingLedger {
    async fn record(&self, record: UsageRecord) {
        info!(
            request_id = %record.request_id,
            tenant = record.tenant_id,
            channel = record.channel_id,
            model = %record.model,
            prompt = record.usage.prompt_tokens(),
            completion = record.usage.completion_tokens(),
            quota = record.cost.quota,
            elapsed_ms = record.elapsed_ms,
            "📊 usage"
        );
    }
}

/// Appends one JSON object per line
pub struct JsonlLedger {
    file: Mutex<File>,
}

impl JsonlLedger {
    pub async fn open(path: PathBuf) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        info!("📝 Usage ledger: {}", path.display());
        Ok(Self { file: Mutex::new(file) })
    }
}

#[async_trait]
impl UsageLedger for JsonlLedger {
    async fn record(&self, record: UsageRecord) {
        let mut line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize usage record: {}", e);
                return;
            }
        };
        line.push('\n');

        let mut file = self.file.lock().await;
        if let Err(e) = file.write_all(line.as_bytes()).await {
            error!("Failed to write usage record: {}", e);
            return;
        }
        if let Err(e) = file.flush().await {
            error!("Failed to flush usage ledger: {}", e);
        }
    }
}

/// Keeps records in memory; handy for tests and the CLI
#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    records: Arc<Mutex<Vec<UsageRecord>>>,
}

impl MemoryLedger {
    pub async fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl UsageLedger for MemoryLedger {
    async fn record(&self, record: UsageRecord) {
        self.records.lock().await.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(request_id: &str) -> UsageRecord {
        UsageRecord {
            ts: Utc::now(),
            request_id: request_id.to_string(),
            tenant_id: 1,
            user: "u".to_string(),
            model: "gpt-4o".to_string(),
            channel_id: 3,
            usage: Usage::new(4, 6),
            cost: Cost { quota: 10, model_ratio: 1.0, completion_ratio: 1.0, group_ratio: 1.0 },
            elapsed_ms: 12,
            is_stream: false,
        }
    }

    #[tokio::test]
    async fn test_jsonl_ledger_appends_lines() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("usage/usage.jsonl");
        let ledger = JsonlLedger::open(path.clone()).await.unwrap();

        ledger.record(record("a")).await;
        ledger.record(record("b")).await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<serde_json::Value> = content.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["request_id"], "b");
        assert_eq!(lines[0]["usage"]["total_tokens"], 10);
    }
}
