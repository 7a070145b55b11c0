use thiserror::Error;

use crate::types::{OtaFailure, OtaStatus};

/// The sensor returned no frame buffer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("capture failed: {0}")]
pub struct CaptureError(pub String);

/// Conversion of a raw frame to JPEG failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("jpeg encoding failed: {0}")]
pub struct EncodeError(pub String);

/// Writing to the client connection failed, usually because the peer left.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("send failed: {0}")]
pub struct TransportError(pub String);

/// The firmware download could not be opened or read.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct SourceError(pub String);

/// The update partition rejected an operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct PartitionError(pub String);

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("stream stopped by shutdown request")]
    Shutdown,
}

impl StreamError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Capture(_) => "capture",
            Self::Encode(_) => "encode",
            Self::Transport(_) => "transport",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OtaError {
    #[error("download failed: {0}")]
    Download(String),
    #[error("firmware of {size} bytes does not fit partition of {capacity} bytes")]
    Capacity { size: u64, capacity: u64 },
    #[error("failed to begin update: {0}")]
    Begin(PartitionError),
    #[error("failed writing update data: {0}")]
    Write(PartitionError),
    #[error("failed finalizing update image: {0}")]
    Finalize(PartitionError),
    #[error("update image reported incomplete after {written} bytes")]
    IncompleteImage { written: u64 },
    #[error("sha256 mismatch (expected {expected}, got {actual})")]
    Checksum { expected: String, actual: String },
    #[error("no data received for {idle_ms} ms")]
    Timeout { idle_ms: u64 },
    #[error("update aborted")]
    Aborted,
}

impl OtaError {
    pub fn failure(&self) -> OtaFailure {
        match self {
            Self::Download(_) => OtaFailure::Download,
            Self::Capacity { .. } => OtaFailure::Capacity,
            Self::Begin(_) | Self::Write(_) => OtaFailure::Write,
            Self::Finalize(_) => OtaFailure::Finalize,
            Self::IncompleteImage { .. } => OtaFailure::IncompleteImage,
            Self::Checksum { .. } => OtaFailure::Checksum,
            Self::Timeout { .. } => OtaFailure::Timeout,
            Self::Aborted => OtaFailure::Aborted,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TriggerError {
    #[error("OTA update already in progress ({})", .0.as_str())]
    Busy(OtaStatus),
    #[error("{0}")]
    InvalidRequest(&'static str),
}
