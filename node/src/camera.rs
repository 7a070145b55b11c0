use core::{ffi::c_void, ptr};

use anyhow::anyhow;
use esp_idf_svc::sys::{
    self,
    camera::{self, camera_config_t, camera_fb_t, pixformat_t},
};
use log::info;

use camstream_common::{
    CameraConfig, CaptureError, CapturedFrame, EncodeError, FrameSize, FrameSource,
    FrameTimestamp, JpegEncoder, PixelFormat, RawFrame,
};

/// AI-Thinker ESP32-CAM wiring.
mod pinout {
    pub const PWDN: i32 = 32;
    pub const RESET: i32 = -1;
    pub const XCLK: i32 = 0;
    pub const SIOD: i32 = 26;
    pub const SIOC: i32 = 27;
    pub const D7: i32 = 35;
    pub const D6: i32 = 34;
    pub const D5: i32 = 39;
    pub const D4: i32 = 36;
    pub const D3: i32 = 21;
    pub const D2: i32 = 19;
    pub const D1: i32 = 18;
    pub const D0: i32 = 5;
    pub const VSYNC: i32 = 25;
    pub const HREF: i32 = 23;
    pub const PCLK: i32 = 22;
}

/// Handle to the initialized esp32-camera driver. The driver owns the frame
/// buffer pool; frames are borrowed with `esp_camera_fb_get` and handed back
/// when an [`EspFrame`] drops. Every stream session holds its own copy.
#[derive(Debug, Clone)]
pub struct EspCamera {
    _private: (),
}

pub struct EspFrame {
    fb: ptr::NonNull<camera_fb_t>,
}

/// JPEG produced by `fmt2jpg`; the driver allocated it with `malloc`.
pub struct EspJpeg {
    buf: ptr::NonNull<u8>,
    len: usize,
}

#[derive(Debug, Default)]
pub struct EspJpegEncoder;

impl EspCamera {
    pub fn init(config: &CameraConfig) -> anyhow::Result<Self> {
        let mut conf = camera_config_t::default();

        conf.pin_pwdn = pinout::PWDN;
        conf.pin_reset = pinout::RESET;
        conf.pin_xclk = pinout::XCLK;
        conf.__bindgen_anon_1.pin_sccb_sda = pinout::SIOD;
        conf.__bindgen_anon_2.pin_sccb_scl = pinout::SIOC;
        conf.pin_d7 = pinout::D7;
        conf.pin_d6 = pinout::D6;
        conf.pin_d5 = pinout::D5;
        conf.pin_d4 = pinout::D4;
        conf.pin_d3 = pinout::D3;
        conf.pin_d2 = pinout::D2;
        conf.pin_d1 = pinout::D1;
        conf.pin_d0 = pinout::D0;
        conf.pin_vsync = pinout::VSYNC;
        conf.pin_href = pinout::HREF;
        conf.pin_pclk = pinout::PCLK;

        conf.xclk_freq_hz = config.xclk_freq_hz as i32;
        conf.ledc_timer = camera::ledc_timer_t_LEDC_TIMER_0;
        conf.ledc_channel = camera::ledc_channel_t_LEDC_CHANNEL_0;
        conf.pixel_format = to_pixformat(config.pixel_format);
        conf.frame_size = to_framesize(config.frame_size);
        conf.jpeg_quality = i32::from(config.sensor_jpeg_quality);
        conf.fb_count = usize::from(config.fb_count);
        conf.fb_location = camera::camera_fb_location_t_CAMERA_FB_IN_PSRAM;
        conf.grab_mode = camera::camera_grab_mode_t_CAMERA_GRAB_LATEST;

        let rc = unsafe { camera::esp_camera_init(&conf) };
        if rc != sys::ESP_OK {
            return Err(anyhow!("esp_camera_init failed with code 0x{rc:x}"));
        }

        info!(
            "camera initialized: {:?} {} x{} buffers @ {} Hz",
            config.frame_size,
            config.pixel_format.as_str(),
            config.fb_count,
            config.xclk_freq_hz
        );
        Ok(Self { _private: () })
    }
}

impl FrameSource for EspCamera {
    type Frame = EspFrame;

    fn capture(&mut self) -> Result<EspFrame, CaptureError> {
        let fb = unsafe { camera::esp_camera_fb_get() };
        ptr::NonNull::new(fb)
            .map(|fb| EspFrame { fb })
            .ok_or_else(|| CaptureError("esp_camera_fb_get returned no frame".to_string()))
    }
}

impl EspFrame {
    fn fb(&self) -> &camera_fb_t {
        unsafe { self.fb.as_ref() }
    }
}

impl CapturedFrame for EspFrame {
    fn data(&self) -> &[u8] {
        let fb = self.fb();
        unsafe { core::slice::from_raw_parts(fb.buf, fb.len) }
    }

    fn format(&self) -> PixelFormat {
        from_pixformat(self.fb().format)
    }

    fn width(&self) -> u32 {
        self.fb().width as u32
    }

    fn height(&self) -> u32 {
        self.fb().height as u32
    }

    fn timestamp(&self) -> FrameTimestamp {
        let ts = self.fb().timestamp;
        FrameTimestamp::new(i64::from(ts.tv_sec), ts.tv_usec.max(0) as u32)
    }
}

impl Drop for EspFrame {
    fn drop(&mut self) {
        unsafe { camera::esp_camera_fb_return(self.fb.as_ptr()) };
    }
}

impl JpegEncoder for EspJpegEncoder {
    type Output = EspJpeg;

    fn encode(&mut self, frame: RawFrame<'_>, quality: u8) -> Result<EspJpeg, EncodeError> {
        let width = u16::try_from(frame.width)
            .map_err(|_| EncodeError(format!("width {} out of range", frame.width)))?;
        let height = u16::try_from(frame.height)
            .map_err(|_| EncodeError(format!("height {} out of range", frame.height)))?;

        let mut out: *mut u8 = ptr::null_mut();
        let mut out_len: usize = 0;
        // fmt2jpg only reads the source buffer.
        let converted = unsafe {
            camera::fmt2jpg(
                frame.data.as_ptr() as *mut u8,
                frame.data.len(),
                width,
                height,
                to_pixformat(frame.format),
                quality,
                &mut out,
                &mut out_len,
            )
        };

        match ptr::NonNull::new(out) {
            Some(buf) if converted => Ok(EspJpeg { buf, len: out_len }),
            Some(buf) => {
                unsafe { sys::free(buf.as_ptr() as *mut c_void) };
                Err(EncodeError("fmt2jpg failed".to_string()))
            }
            None => Err(EncodeError("fmt2jpg failed".to_string())),
        }
    }
}

impl AsRef<[u8]> for EspJpeg {
    fn as_ref(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.buf.as_ptr(), self.len) }
    }
}

impl Drop for EspJpeg {
    fn drop(&mut self) {
        unsafe { sys::free(self.buf.as_ptr() as *mut c_void) };
    }
}

fn to_pixformat(format: PixelFormat) -> pixformat_t {
    match format {
        PixelFormat::Jpeg => camera::pixformat_t_PIXFORMAT_JPEG,
        PixelFormat::Rgb565 => camera::pixformat_t_PIXFORMAT_RGB565,
        PixelFormat::Yuv422 => camera::pixformat_t_PIXFORMAT_YUV422,
        PixelFormat::Grayscale => camera::pixformat_t_PIXFORMAT_GRAYSCALE,
    }
}

fn from_pixformat(format: pixformat_t) -> PixelFormat {
    match format {
        camera::pixformat_t_PIXFORMAT_JPEG => PixelFormat::Jpeg,
        camera::pixformat_t_PIXFORMAT_YUV422 => PixelFormat::Yuv422,
        camera::pixformat_t_PIXFORMAT_GRAYSCALE => PixelFormat::Grayscale,
        _ => PixelFormat::Rgb565,
    }
}

fn to_framesize(size: FrameSize) -> camera::framesize_t {
    match size {
        FrameSize::Qqvga => camera::framesize_t_FRAMESIZE_QQVGA,
        FrameSize::Qvga => camera::framesize_t_FRAMESIZE_QVGA,
        FrameSize::Square240 => camera::framesize_t_FRAMESIZE_240X240,
        FrameSize::Cif => camera::framesize_t_FRAMESIZE_CIF,
        FrameSize::Vga => camera::framesize_t_FRAMESIZE_VGA,
        FrameSize::Svga => camera::framesize_t_FRAMESIZE_SVGA,
    }
}
