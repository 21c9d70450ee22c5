//! File bridging: tenant uploads mapped to vendor-side file handles.
//!
//! A handle is scoped to (file, channel, model) and expires; an absent or
//! expired mapping triggers a fresh upload. Concurrent bridges of the same
//! key may both upload; the mapping keeps whichever write lands last.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::multipart::Part;
use std::sync::Arc;
use tracing::{debug, info};

use crate::adaptors::error::RelayError;
use crate::adaptors::Meta;
use crate::store::{ChannelFileMapping, FileMappingStore, FileStore, UploadFile};

pub const DEFAULT_MAPPING_TTL_SECS: i64 = 3600 * 24 * 30;

/// Handle returned by a vendor upload endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFile {
    pub id: String,
    /// Raw vendor answer, stored for diagnostics
    pub api_response: String,
}

/// Vendor-specific multipart upload
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, meta: &Meta, file: &UploadFile, bytes: Bytes) -> Result<RemoteFile, RelayError>;
}

pub struct FileBridge {
    mappings: Arc<dyn FileMappingStore>,
    files: Arc<dyn FileStore>,
    ttl_secs: i64,
}

impl FileBridge {
    pub fn new(mappings: Arc<dyn FileMappingStore>, files: Arc<dyn FileStore>, ttl_secs: i64) -> Self {
        Self { mappings, files, ttl_secs }
    }

    pub async fn upload_file(&self, file_id: i64, tenant_id: i64) -> Result<UploadFile, RelayError> {
        self.mappings
            .get_upload_file(file_id, tenant_id)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("upload file {}", file_id)))
    }

    /// Vendor handle for `file_id` on the call's channel, uploading when needed
    pub async fn bridge(
        &self,
        uploader: &dyn Uploader,
        meta: &Meta,
        file_id: i64,
        model: &str,
    ) -> Result<ChannelFileMapping, RelayError> {
        let file = self.upload_file(file_id, meta.tenant_id).await?;
        let now = Utc::now().timestamp();

        let existing = self.mappings.find_file_mapping(file_id, meta.channel_id, model).await?;
        if let Some(ref mapping) = existing {
            if !mapping.channel_file_id.is_empty() && !mapping.is_expired(now) {
                debug!("File {} already bridged as {}", file_id, mapping.channel_file_id);
                return Ok(mapping.clone());
            }
        }

        let bytes = self.files.load_file_bytes(&file.key).await?;
        debug!("Uploading file {} ({} bytes) to channel {}", file.id, bytes.len(), meta.channel_id);
        let remote = uploader.upload(meta, &file, bytes).await?;

        let mapping = ChannelFileMapping {
            id: existing.map(|m| m.id).unwrap_or(0),
            tenant_id: file.tenant_id,
            file_id: file.id,
            channel_id: meta.channel_id,
            model: model.to_string(),
            channel_file_id: remote.id,
            expires_at: now + self.ttl_secs,
            api_response: remote.api_response,
        };
        let saved = self.mappings.save_file_mapping(mapping).await?;
        info!(
            "📎 Bridged file {} to channel {} as {}",
            saved.file_id, saved.channel_id, saved.channel_file_id
        );
        Ok(saved)
    }
}

/// Multipart part carrying the file bytes with its name and mime type
pub fn file_part(file: &UploadFile, bytes: Bytes) -> Result<Part, RelayError> {
    let mime = if file.mime_type.is_empty() {
        "application/octet-stream"
    } else {
        file.mime_type.as_str()
    };
    Part::bytes(bytes.to_vec())
        .file_name(file.file_name.clone())
        .mime_str(mime)
        .map_err(|e| RelayError::Config(format!("invalid mime type '{}': {}", mime, e)))
}

const AUDIO_EXTENSIONS: &[&str] = &[".mp3", ".m4a", ".wav", ".webm", ".amr"];
const VIDEO_EXTENSIONS: &[&str] = &[".mp4", ".mov", ".mpeg", ".mpga"];
const DOCUMENT_EXTENSIONS: &[&str] = &[
    ".txt", ".md", ".markdown", ".pdf", ".html", ".xlsx", ".xls", ".docx", ".csv", ".eml", ".msg", ".pptx", ".ppt",
    ".xml", ".epub",
];

/// Workflow file category from mime type and extension
pub fn classify_file_type(mime_type: &str, extension: &str) -> &'static str {
    let ext = extension.to_ascii_lowercase();
    let ext = if ext.is_empty() || ext.starts_with('.') {
        ext
    } else {
        format!(".{}", ext)
    };

    if mime_type.starts_with("image/") {
        return "image";
    }
    if mime_type.starts_with("audio/") && AUDIO_EXTENSIONS.contains(&ext.as_str()) {
        return "audio";
    }
    if mime_type.starts_with("video/") && VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        return "video";
    }
    if DOCUMENT_EXTENSIONS.contains(&ext.as_str()) {
        return "document";
    }
    debug!("Unclassified file type (mime {}, extension {})", mime_type, extension);
    "custom"
}
