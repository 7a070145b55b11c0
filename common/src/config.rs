use serde::{Deserialize, Serialize};

use crate::types::{FrameSize, PixelFormat};

pub const DEFAULT_BOUNDARY: &str = "123456789000000000000987654321";
const MAX_BOUNDARY_LEN: usize = 70;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StreamConfig {
    pub boundary: String,
    pub jpeg_quality: u8,
    pub advertised_fps: u16,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            boundary: DEFAULT_BOUNDARY.to_string(),
            jpeg_quality: 80,
            advertised_fps: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OtaConfig {
    pub firmware_url: String,
    pub inactivity_timeout_ms: u64,
    pub chunk_size: usize,
    pub restart_delay_ms: u64,
    /// Capacity of the staging partition used by host builds. ESP builds read
    /// the real size from the partition table.
    pub partition_capacity: u64,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            firmware_url: String::new(),
            inactivity_timeout_ms: 480_000,
            chunk_size: 4096,
            restart_delay_ms: 1_000,
            partition_capacity: 1_966_080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub http_port: u16,
    /// Port of the stream-only server on the device. 0 serves the stream
    /// from the main server only.
    pub stream_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            http_port: 80,
            stream_port: 81,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CameraConfig {
    pub pixel_format: PixelFormat,
    pub frame_size: FrameSize,
    /// Sensor-side JPEG quality (0-63, lower is better). Only used when the
    /// sensor emits JPEG natively.
    pub sensor_jpeg_quality: u8,
    pub fb_count: u8,
    pub xclk_freq_hz: u32,
    pub flash_pin: i32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            pixel_format: PixelFormat::Rgb565,
            frame_size: FrameSize::Qvga,
            sensor_jpeg_quality: 20,
            fb_count: 2,
            xclk_freq_hz: 10_000_000,
            flash_pin: 4,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub ota: OtaConfig,
    #[serde(default)]
    pub camera: CameraConfig,
}

impl RuntimeConfig {
    /// Parses a stored configuration blob. Missing sections and fields take
    /// their defaults and out-of-range values are clamped.
    pub fn from_json_slice(raw: &[u8]) -> Result<Self, serde_json::Error> {
        let mut config: Self = serde_json::from_slice(raw)?;
        config.sanitize();
        Ok(config)
    }

    pub fn to_json_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn sanitize(&mut self) {
        self.network.sanitize();
        self.stream.sanitize();
        self.ota.sanitize();
        self.camera.sanitize();
    }
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        self.wifi_ssid = self.wifi_ssid.trim().to_string();
        if self.http_port == 0 {
            self.http_port = 80;
        }
        if self.stream_port == self.http_port {
            self.stream_port = 0;
        }
    }
}

impl StreamConfig {
    pub fn sanitize(&mut self) {
        if !is_valid_boundary(&self.boundary) {
            self.boundary = DEFAULT_BOUNDARY.to_string();
        }
        self.jpeg_quality = self.jpeg_quality.clamp(1, 100);
        self.advertised_fps = self.advertised_fps.clamp(1, 120);
    }
}

impl OtaConfig {
    pub fn sanitize(&mut self) {
        self.firmware_url = self.firmware_url.trim().to_string();
        self.inactivity_timeout_ms = self.inactivity_timeout_ms.clamp(1_000, 3_600_000);
        self.chunk_size = self.chunk_size.clamp(128, 16 * 1024);
        self.restart_delay_ms = self.restart_delay_ms.min(10_000);
    }
}

impl CameraConfig {
    pub fn sanitize(&mut self) {
        self.sensor_jpeg_quality = self.sensor_jpeg_quality.min(63);
        self.fb_count = self.fb_count.clamp(1, 3);
        self.xclk_freq_hz = self.xclk_freq_hz.clamp(5_000_000, 24_000_000);
        if self.flash_pin < 0 {
            self.flash_pin = 4;
        }
    }
}

/// Boundary tokens are limited to 70 characters and must not need quoting in
/// the `Content-Type` header.
pub fn is_valid_boundary(boundary: &str) -> bool {
    !boundary.is_empty()
        && boundary.len() <= MAX_BOUNDARY_LEN
        && boundary
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
