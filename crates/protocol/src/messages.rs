//! Request and response messages of the upload protocol.
//!
//! Field names serialize as camelCase; an HTTP binding maps these 1:1
//! onto the `/upload/create`, `/upload/verify`, `/upload/chunk`,
//! `/upload/merge`, and `/health` endpoints.

use serde::{Deserialize, Serialize};

use crate::token::UploadToken;

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Opens an upload session for one logical file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFileRequest {
    pub file_name: String,
    pub file_size: u64,
    /// MIME type; may be empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_type: String,
    /// Client's preferred chunk size; the server may override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_chunk_size: Option<u64>,
}

/// Asks the server what it already has.
///
/// With `file_hash` set, the server answers whether the whole file
/// already exists (instant upload). With `chunk_hashes` set, it splits
/// the supplied list into already-present and missing chunks — the
/// returned indices refer to the client's supplied order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub upload_token: UploadToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_hashes: Option<Vec<String>>,
}

/// Metadata accompanying one chunk upload; the chunk bytes travel out
/// of band (multipart body, loopback `Bytes`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkRequest {
    pub upload_token: UploadToken,
    pub chunk_index: u32,
    /// Digest the server recomputes and verifies against the bytes.
    pub chunk_hash: String,
}

/// Logical merge: binds the ordered chunk-hash list and the file hash
/// to the session's manifest. No bytes are copied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    pub upload_token: UploadToken,
    pub file_hash: String,
    pub chunk_hashes: Vec<String>,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFileResponse {
    pub upload_token: UploadToken,
    /// Chunk size the whole session must use, clamped server-side.
    pub negotiated_chunk_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    /// `true` means the full file is instantly available; no upload
    /// is required.
    pub file_exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub existing_chunks: Vec<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_chunks: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkResponse {
    pub success: bool,
    pub chunk_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResponse {
    pub success: bool,
    pub file_url: String,
    pub file_id: String,
}

/// Liveness answer for the `/health` surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    /// Epoch milliseconds at the time of the probe.
    pub timestamp: u64,
    pub uptime_secs: u64,
}
