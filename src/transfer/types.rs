//! Core transfer types shared across the engines, registry and manager.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::remote::RemoteLocator;

/// Opaque identifier for one transfer attempt. Resuming a parked transfer
/// starts a new attempt with a fresh id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(String);

impl TransferId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferDirection::Upload => "upload",
            TransferDirection::Download => "download",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferStatus::Active => "active",
            TransferStatus::Paused => "paused",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
            TransferStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Live view of one transfer as the registry tracks it.
#[derive(Debug, Clone, Serialize)]
pub struct TransferDescriptor {
    pub id: TransferId,
    pub direction: TransferDirection,
    pub remote: RemoteLocator,
    /// Local side of the transfer. Stream-sourced uploads have none.
    pub local_path: Option<PathBuf>,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub status: TransferStatus,
    /// Unix seconds.
    pub started_at: i64,
}

/// Durable state of a paused or failed transfer, enough to start a new
/// attempt later. `transferred_bytes` only counts bytes that are safe to
/// skip: the contiguous acked prefix for uploads, flushed file size for
/// downloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeSnapshot {
    pub transfer_id: TransferId,
    pub direction: TransferDirection,
    pub remote: RemoteLocator,
    pub local_path: Option<PathBuf>,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    /// Multipart session token at capture time. Informational: resumed
    /// uploads open a fresh session rather than re-entering this one.
    pub remote_session_token: Option<String>,
    /// Unix seconds.
    pub captured_at: i64,
}

/// One progress event as delivered to callbacks.
#[derive(Debug, Clone, Serialize)]
pub struct TransferProgress {
    pub transfer_id: String,
    pub transferred_bytes: u64,
    pub total_bytes: u64,
    /// 0..=100, rounded. 0 when the total is unknown.
    pub percent: u32,
    /// Bytes per second over the current attempt.
    pub speed: f64,
}
