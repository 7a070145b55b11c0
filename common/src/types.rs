use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    Jpeg,
    Rgb565,
    Yuv422,
    Grayscale,
}

impl PixelFormat {
    pub fn is_jpeg(self) -> bool {
        matches!(self, Self::Jpeg)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Jpeg => "JPEG",
            Self::Rgb565 => "RGB565",
            Self::Yuv422 => "YUV422",
            Self::Grayscale => "GRAYSCALE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FrameSize {
    Qqvga,
    Qvga,
    #[serde(rename = "240X240")]
    Square240,
    Cif,
    Vga,
    Svga,
}

impl FrameSize {
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            Self::Qqvga => (160, 120),
            Self::Qvga => (320, 240),
            Self::Square240 => (240, 240),
            Self::Cif => (400, 296),
            Self::Vga => (640, 480),
            Self::Svga => (800, 600),
        }
    }
}

/// Capture time as reported by the sensor driver. Seconds and microseconds
/// are kept as separate integers so they survive formatting without loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameTimestamp {
    pub secs: i64,
    pub micros: u32,
}

impl FrameTimestamp {
    pub fn new(secs: i64, micros: u32) -> Self {
        Self {
            secs: secs + i64::from(micros / 1_000_000),
            micros: micros % 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OtaStatus {
    Idle,
    Downloading,
    Writing,
    Verifying,
    Complete,
    Failed,
}

impl OtaStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Downloading => "DOWNLOADING",
            Self::Writing => "WRITING",
            Self::Verifying => "VERIFYING",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// True while an attempt holds (or is about to hold) the update partition.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Downloading | Self::Writing | Self::Verifying)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OtaFailure {
    Download,
    Capacity,
    Write,
    Finalize,
    IncompleteImage,
    Checksum,
    Timeout,
    Aborted,
}

impl OtaFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Download => "DOWNLOAD",
            Self::Capacity => "CAPACITY",
            Self::Write => "WRITE",
            Self::Finalize => "FINALIZE",
            Self::IncompleteImage => "INCOMPLETE_IMAGE",
            Self::Checksum => "CHECKSUM",
            Self::Timeout => "TIMEOUT",
            Self::Aborted => "ABORTED",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OtaStatusView {
    pub status: &'static str,
    #[serde(rename = "inProgress")]
    pub in_progress: bool,
    #[serde(rename = "bytesWritten")]
    pub bytes_written: u64,
    #[serde(rename = "totalBytes")]
    pub total_bytes: Option<u64>,
    #[serde(rename = "progressPct")]
    pub progress_pct: Option<u8>,
    #[serde(rename = "failureReason")]
    pub failure_reason: Option<&'static str>,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
    #[serde(rename = "lastSha256")]
    pub last_sha256: Option<String>,
    #[serde(rename = "lastSourceUrl")]
    pub last_source_url: Option<String>,
    #[serde(rename = "lastCompletedEpoch")]
    pub last_completed_epoch: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OtaTriggerResponse {
    pub accepted: bool,
    #[serde(rename = "inProgress")]
    pub in_progress: bool,
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_normalizes_microsecond_overflow() {
        let ts = FrameTimestamp::new(10, 2_500_000);
        assert_eq!(ts, FrameTimestamp { secs: 12, micros: 500_000 });
    }

    #[test]
    fn status_order_follows_transfer_sequence() {
        assert!(OtaStatus::Idle < OtaStatus::Downloading);
        assert!(OtaStatus::Downloading < OtaStatus::Writing);
        assert!(OtaStatus::Writing < OtaStatus::Verifying);
        assert!(OtaStatus::Verifying < OtaStatus::Complete);
        assert!(OtaStatus::Writing.is_active());
        assert!(!OtaStatus::Failed.is_active());
    }

    #[test]
    fn frame_size_serializes_square_variant() {
        let raw = serde_json::to_string(&FrameSize::Square240).unwrap();
        assert_eq!(raw, "\"240X240\"");
        assert_eq!(FrameSize::Square240.dimensions(), (240, 240));
    }
}
