//! Wire protocol for package download, batch sync, and media upload.
//!
//! The engine talks to the boundary through the [`ExamTransport`] and
//! [`MediaUploader`] traits; [`HttpTransport`] is the production
//! implementation. Tests substitute scripted transports.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::{EngineError, EngineResult};
use crate::model::{EncryptedExamPackage, SyncItemKind};

/// Upper bound on items per sync request accepted by the server
pub const MAX_BATCH_ITEMS: usize = 50;

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Server base URL
    pub server_url: String,
    /// Authentication token
    pub auth_token: Option<String>,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080/api".to_string(),
            auth_token: None,
            request_timeout_secs: 30,
        }
    }
}

/// Request body for the package download endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub session_id: Uuid,
    pub token_code: String,
    pub device_fingerprint: String,
    /// Dedupes repeated download attempts after connection drops
    pub idempotency_key: Uuid,
}

/// Response body from the package download endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResponse {
    pub package_id: Uuid,
    /// Base64 ciphertext
    pub encrypted_data: String,
    /// Base64 GCM nonce
    pub iv: String,
    /// Hex SHA-256 digest of the ciphertext
    pub package_hash: String,
    /// Base64 session key material
    pub session_key: String,
    /// Opaque server checksum, recorded but not interpreted
    pub checksum: String,
}

impl DownloadResponse {
    /// Decode the wire encoding into the package envelope and key material.
    ///
    /// The key material comes back zeroizing; it should go straight into
    /// the keyring and be dropped.
    pub fn decode(
        &self,
        session_id: Uuid,
    ) -> EngineResult<(EncryptedExamPackage, Zeroizing<Vec<u8>>)> {
        let encrypted_data = BASE64
            .decode(&self.encrypted_data)
            .map_err(|e| EngineError::MalformedPackage(format!("invalid encryptedData: {}", e)))?;
        let iv = BASE64
            .decode(&self.iv)
            .map_err(|e| EngineError::MalformedPackage(format!("invalid iv: {}", e)))?;
        let session_key = Zeroizing::new(
            BASE64
                .decode(&self.session_key)
                .map_err(|e| EngineError::MalformedPackage(format!("invalid sessionKey: {}", e)))?,
        );

        let package = EncryptedExamPackage {
            package_id: self.package_id,
            session_id,
            encrypted_data,
            iv,
            package_hash: self.package_hash.clone(),
        };

        Ok((package, session_key))
    }
}

/// One operation inside a sync request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncItem {
    #[serde(rename = "type")]
    pub kind: SyncItemKind,
    pub attempt_id: Uuid,
    pub idempotency_key: Uuid,
    pub payload: serde_json::Value,
}

/// Sync request body; the server accepts 1..=50 items per call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncBatch {
    pub batch: Vec<SyncItem>,
}

/// Per-item conflict reported by the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemConflict {
    pub idempotency_key: Uuid,
    pub reason: String,
}

/// Acknowledgement for a sync request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchAck {
    /// Idempotency keys the server applied (or had already applied)
    pub accepted: Vec<Uuid>,
    /// Keys refused because the payload differs from an earlier application
    #[serde(default)]
    pub conflicts: Vec<ItemConflict>,
}

/// One chunk of a media upload
#[derive(Debug, Clone)]
pub struct MediaChunk {
    pub attempt_id: Uuid,
    pub question_id: String,
    /// Groups the chunks of a single file
    pub upload_id: Uuid,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub file_name: String,
    pub data: Vec<u8>,
}

/// Acknowledgement for a media chunk
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaAck {
    /// Present once the final chunk has been assembled
    #[serde(default)]
    object_key: Option<String>,
}

/// Server boundary for package download and batch sync
#[async_trait]
pub trait ExamTransport: Send + Sync {
    async fn download_package(&self, request: &DownloadRequest) -> EngineResult<DownloadResponse>;

    async fn push_batch(&self, batch: &SyncBatch) -> EngineResult<BatchAck>;
}

/// Server boundary for chunked media upload
#[async_trait]
pub trait MediaUploader: Send + Sync {
    /// Upload one chunk. Returns the object key once the final chunk lands.
    async fn upload_chunk(&self, chunk: &MediaChunk) -> EngineResult<Option<String>>;
}

/// HTTP implementation of the server boundary
pub struct HttpTransport {
    client: reqwest::Client,
    config: TransportConfig,
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| EngineError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ExamTransport for HttpTransport {
    async fn download_package(&self, request: &DownloadRequest) -> EngineResult<DownloadResponse> {
        let url = format!("{}/student/download", self.config.server_url);
        let response = self
            .authorize(self.client.post(&url).json(request))
            .send()
            .await
            .map_err(|e| EngineError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EngineError::Network(format!(
                "Download failed with status: {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| EngineError::Serialization(e.to_string()))
    }

    async fn push_batch(&self, batch: &SyncBatch) -> EngineResult<BatchAck> {
        if batch.batch.is_empty() || batch.batch.len() > MAX_BATCH_ITEMS {
            return Err(EngineError::Internal(format!(
                "batch size {} outside 1..={}",
                batch.batch.len(),
                MAX_BATCH_ITEMS
            )));
        }

        let url = format!("{}/sync", self.config.server_url);
        let response = self
            .authorize(self.client.post(&url).json(batch))
            .send()
            .await
            .map_err(|e| EngineError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EngineError::Network(format!(
                "Sync push failed with status: {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| EngineError::Serialization(e.to_string()))
    }
}

#[async_trait]
impl MediaUploader for HttpTransport {
    async fn upload_chunk(&self, chunk: &MediaChunk) -> EngineResult<Option<String>> {
        let part = reqwest::multipart::Part::bytes(chunk.data.clone())
            .file_name(chunk.file_name.clone());
        let form = reqwest::multipart::Form::new()
            .text("attemptId", chunk.attempt_id.to_string())
            .text("questionId", chunk.question_id.clone())
            .text("uploadId", chunk.upload_id.to_string())
            .text("chunkIndex", chunk.chunk_index.to_string())
            .text("totalChunks", chunk.total_chunks.to_string())
            .part("chunk", part);

        let url = format!("{}/media", self.config.server_url);
        let response = self
            .authorize(self.client.post(&url).multipart(form))
            .send()
            .await
            .map_err(|e| EngineError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EngineError::Network(format!(
                "Media upload failed with status: {}",
                response.status()
            )));
        }

        let ack: MediaAck = response
            .json()
            .await
            .map_err(|e| EngineError::Serialization(e.to_string()))?;

        Ok(ack.object_key)
    }
}
