//! Host stand-ins for the camera, the JPEG converter, the firmware download
//! and the OTA partition.

use std::{
    fs::{self, File},
    io::{ErrorKind, Read, Write},
    mem,
    path::{Path, PathBuf},
    sync::{
        mpsc::{self, Receiver, SyncSender, TryRecvError},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use chrono::Utc;
use image::{codecs::jpeg::JpegEncoder as ImageJpeg, GrayImage, ImageBuffer, RgbImage};
use reqwest::{
    blocking::{Client, ClientBuilder},
    header::CONTENT_LENGTH,
};
use tracing::{debug, info, warn};

use camstream_common::{
    CameraConfig, CaptureError, CapturedFrame, EncodeError, FirmwareDownload, FirmwareSource,
    FrameSource, FrameTimestamp, ImageState, JpegEncoder, LampPin, PartitionError, PixelFormat,
    RawFrame, ReadStatus, SourceError, UpdatePartition, UpdateWriter,
};

/// First byte of every ESP application image.
const ESP_IMAGE_MAGIC: u8 = 0xE9;
const DOWNLOAD_READ_CHUNK: usize = 4096;
const DOWNLOAD_QUEUE_DEPTH: usize = 16;

const BAR_COLORS: [(u8, u8, u8); 8] = [
    (255, 255, 255),
    (255, 255, 0),
    (0, 255, 255),
    (0, 255, 0),
    (255, 0, 255),
    (255, 0, 0),
    (0, 0, 255),
    (0, 0, 0),
];

type BufferPool = Arc<Mutex<Vec<Vec<u8>>>>;

/// Scrolling color bars with the same buffer discipline as the sensor
/// driver: `fb_count` buffers, each handed out until the frame is dropped.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    format: PixelFormat,
    pool: BufferPool,
    sequence: u32,
    frame_interval: Duration,
    next_frame: Option<Instant>,
}

pub struct PatternFrame {
    data: Vec<u8>,
    format: PixelFormat,
    width: u32,
    height: u32,
    timestamp: FrameTimestamp,
    pool: BufferPool,
}

impl TestPatternSource {
    pub fn new(camera: &CameraConfig) -> Self {
        let (width, height) = camera.frame_size.dimensions();
        let format = match camera.pixel_format {
            PixelFormat::Grayscale => PixelFormat::Grayscale,
            PixelFormat::Rgb565 => PixelFormat::Rgb565,
            other => {
                warn!(
                    "test pattern cannot emit {}; using RGB565",
                    other.as_str()
                );
                PixelFormat::Rgb565
            }
        };

        let frame_len = (width * height) as usize * bytes_per_pixel(format);
        let pool = (0..camera.fb_count.max(1))
            .map(|_| vec![0_u8; frame_len])
            .collect();

        Self {
            width,
            height,
            format,
            pool: Arc::new(Mutex::new(pool)),
            sequence: 0,
            frame_interval: Duration::ZERO,
            next_frame: None,
        }
    }

    /// Produces at most `fps` frames per second, like a sensor clocked at
    /// that rate. Without it frames are produced as fast as they are taken.
    pub fn with_frame_rate(mut self, fps: u32) -> Self {
        self.frame_interval = Duration::from_secs(1) / fps.max(1);
        self
    }

    fn wait_for_exposure(&mut self) {
        if self.frame_interval.is_zero() {
            return;
        }
        if let Some(due) = self.next_frame {
            let now = Instant::now();
            if due > now {
                thread::sleep(due - now);
            }
        }
        self.next_frame = Some(Instant::now() + self.frame_interval);
    }

    fn paint(&self, buf: &mut [u8]) {
        let shift = self.sequence.wrapping_mul(4);
        let bar_width = (self.width / BAR_COLORS.len() as u32).max(1);
        let bpp = bytes_per_pixel(self.format);

        for y in 0..self.height {
            for x in 0..self.width {
                let bar = ((x + shift) / bar_width) as usize % BAR_COLORS.len();
                let (r, g, b) = BAR_COLORS[bar];
                let offset = ((y * self.width + x) as usize) * bpp;

                match self.format {
                    PixelFormat::Grayscale => {
                        buf[offset] = ((u16::from(r) + u16::from(g) + u16::from(b)) / 3) as u8;
                    }
                    _ => {
                        let pixel = rgb888_to_rgb565(r, g, b).to_be_bytes();
                        buf[offset..offset + 2].copy_from_slice(&pixel);
                    }
                }
            }
        }
    }
}

impl FrameSource for TestPatternSource {
    type Frame = PatternFrame;

    fn capture(&mut self) -> Result<PatternFrame, CaptureError> {
        self.wait_for_exposure();

        let mut data = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .ok_or_else(|| CaptureError("frame buffer pool exhausted".to_string()))?;

        self.paint(&mut data);
        self.sequence = self.sequence.wrapping_add(1);

        let now = Utc::now();
        Ok(PatternFrame {
            data,
            format: self.format,
            width: self.width,
            height: self.height,
            timestamp: FrameTimestamp::new(now.timestamp(), now.timestamp_subsec_micros()),
            pool: self.pool.clone(),
        })
    }
}

impl CapturedFrame for PatternFrame {
    fn data(&self) -> &[u8] {
        &self.data
    }

    fn format(&self) -> PixelFormat {
        self.format
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn timestamp(&self) -> FrameTimestamp {
        self.timestamp
    }
}

impl Drop for PatternFrame {
    fn drop(&mut self) {
        let data = mem::take(&mut self.data);
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(data);
    }
}

/// JPEG conversion through the `image` crate.
#[derive(Debug, Default)]
pub struct ImageJpegEncoder;

impl JpegEncoder for ImageJpegEncoder {
    type Output = Vec<u8>;

    fn encode(&mut self, frame: RawFrame<'_>, quality: u8) -> Result<Vec<u8>, EncodeError> {
        let mismatch = || {
            EncodeError(format!(
                "{} buffer of {} bytes does not match {}x{}",
                frame.format.as_str(),
                frame.data.len(),
                frame.width,
                frame.height
            ))
        };

        if frame.format.is_jpeg() {
            return Ok(frame.data.to_vec());
        }

        let mut out = Vec::new();
        let mut encoder = ImageJpeg::new_with_quality(&mut out, quality);
        let result = match frame.format {
            PixelFormat::Grayscale => {
                let image: GrayImage =
                    ImageBuffer::from_raw(frame.width, frame.height, frame.data.to_vec())
                        .ok_or_else(mismatch)?;
                encoder.encode_image(&image)
            }
            PixelFormat::Yuv422 => {
                let image: RgbImage =
                    ImageBuffer::from_raw(frame.width, frame.height, yuyv_to_rgb888(frame.data))
                        .ok_or_else(mismatch)?;
                encoder.encode_image(&image)
            }
            PixelFormat::Rgb565 | PixelFormat::Jpeg => {
                let image: RgbImage =
                    ImageBuffer::from_raw(frame.width, frame.height, rgb565_to_rgb888(frame.data))
                        .ok_or_else(mismatch)?;
                encoder.encode_image(&image)
            }
        };
        drop(encoder);
        result.map_err(|err| EncodeError(err.to_string()))?;

        Ok(out)
    }
}

fn bytes_per_pixel(format: PixelFormat) -> usize {
    match format {
        PixelFormat::Grayscale => 1,
        _ => 2,
    }
}

fn rgb888_to_rgb565(r: u8, g: u8, b: u8) -> u16 {
    (u16::from(r) >> 3) << 11 | (u16::from(g) >> 2) << 5 | u16::from(b) >> 3
}

/// Big-endian RGB565, as the sensor emits it.
fn rgb565_to_rgb888(data: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(data.len() / 2 * 3);
    for pixel in data.chunks_exact(2) {
        let value = u16::from_be_bytes([pixel[0], pixel[1]]);
        let r = ((value >> 11) & 0x1f) as u8;
        let g = ((value >> 5) & 0x3f) as u8;
        let b = (value & 0x1f) as u8;
        rgb.extend_from_slice(&[r << 3 | r >> 2, g << 2 | g >> 4, b << 3 | b >> 2]);
    }
    rgb
}

fn yuyv_to_rgb888(data: &[u8]) -> Vec<u8> {
    fn convert(y: u8, u: u8, v: u8) -> [u8; 3] {
        let y = f32::from(y);
        let u = f32::from(u) - 128.0;
        let v = f32::from(v) - 128.0;
        [
            (y + 1.402 * v).clamp(0.0, 255.0) as u8,
            (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8,
            (y + 1.772 * u).clamp(0.0, 255.0) as u8,
        ]
    }

    let mut rgb = Vec::with_capacity(data.len() / 2 * 3);
    for quad in data.chunks_exact(4) {
        rgb.extend_from_slice(&convert(quad[0], quad[1], quad[3]));
        rgb.extend_from_slice(&convert(quad[2], quad[1], quad[3]));
    }
    rgb
}

enum BodyEvent {
    Data(Vec<u8>),
    End,
    Failed(String),
}

/// Firmware download over reqwest's blocking client. The body is pulled by
/// a reader thread so `read` never waits on the socket. The client timeout
/// bounds every socket wait of that thread, so a stalled server cannot keep
/// it alive after the attempt is gone.
pub struct HttpFirmwareSource {
    client: Client,
}

pub struct HttpDownload {
    status: u16,
    content_length: Option<i64>,
    events: Receiver<BodyEvent>,
    pending: Vec<u8>,
    offset: usize,
}

impl HttpFirmwareSource {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self, SourceError> {
        Self::from_builder(Self::builder(connect_timeout, read_timeout))
    }

    fn builder(connect_timeout: Duration, read_timeout: Duration) -> ClientBuilder {
        Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
    }

    fn from_builder(builder: ClientBuilder) -> Result<Self, SourceError> {
        let client = builder
            .build()
            .map_err(|err| SourceError(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { client })
    }
}

impl FirmwareSource for HttpFirmwareSource {
    type Download = HttpDownload;

    fn get(&mut self, url: &str) -> Result<HttpDownload, SourceError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| SourceError(err.to_string()))?;

        let status = response.status().as_u16();
        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<i64>().ok());
        debug!("firmware response: HTTP {status}, content-length {content_length:?}");

        let (tx, events) = mpsc::sync_channel(DOWNLOAD_QUEUE_DEPTH);
        thread::Builder::new()
            .name("ota-download".into())
            .spawn(move || pump_body(response, tx))
            .map_err(|err| SourceError(format!("failed to spawn download reader: {err}")))?;

        Ok(HttpDownload {
            status,
            content_length,
            events,
            pending: Vec::new(),
            offset: 0,
        })
    }
}

fn pump_body(mut body: impl Read, tx: SyncSender<BodyEvent>) {
    let mut chunk = vec![0_u8; DOWNLOAD_READ_CHUNK];
    loop {
        let event = match body.read(&mut chunk) {
            Ok(0) => BodyEvent::End,
            Ok(read) => BodyEvent::Data(chunk[..read].to_vec()),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => BodyEvent::Failed(err.to_string()),
        };
        let last = !matches!(event, BodyEvent::Data(_));
        if tx.send(event).is_err() || last {
            return;
        }
    }
}

impl FirmwareDownload for HttpDownload {
    fn http_status(&self) -> u16 {
        self.status
    }

    fn content_length(&self) -> Option<i64> {
        self.content_length
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<ReadStatus, SourceError> {
        if self.offset == self.pending.len() {
            match self.events.try_recv() {
                Ok(BodyEvent::Data(data)) => {
                    self.pending = data;
                    self.offset = 0;
                }
                Ok(BodyEvent::End) => return Ok(ReadStatus::End),
                Ok(BodyEvent::Failed(err)) => return Err(SourceError(err)),
                Err(TryRecvError::Empty) => return Ok(ReadStatus::Pending),
                Err(TryRecvError::Disconnected) => {
                    return Err(SourceError("download reader stopped".to_string()))
                }
            }
        }

        let available = &self.pending[self.offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.offset += n;
        Ok(ReadStatus::Data(n))
    }
}

/// Firmware slot backed by a file. Data goes to `<path>.part` and is renamed
/// over `path` only when a complete, well-formed image was written.
#[derive(Debug, Clone)]
pub struct FilePartition {
    path: PathBuf,
    capacity: u64,
}

pub struct FileWriter<'a> {
    partition: &'a FilePartition,
    staging: PathBuf,
    file: Option<File>,
    expected: u64,
    written: u64,
    first_byte: Option<u8>,
}

impl FilePartition {
    pub fn new(path: impl Into<PathBuf>, capacity: u64) -> Self {
        Self {
            path: path.into(),
            capacity,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(&self) -> PathBuf {
        let mut staging = self.path.clone().into_os_string();
        staging.push(".part");
        PathBuf::from(staging)
    }
}

impl UpdatePartition for FilePartition {
    type Writer<'a> = FileWriter<'a>;

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn begin(&mut self, size: u64) -> Result<FileWriter<'_>, PartitionError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_error("create partition dir"))?;
        }
        let staging = self.staging_path();
        let file = File::create(&staging).map_err(io_error("open staging file"))?;
        info!("staging firmware image at {}", staging.display());

        Ok(FileWriter {
            partition: self,
            staging,
            file: Some(file),
            expected: size,
            written: 0,
            first_byte: None,
        })
    }
}

impl UpdateWriter for FileWriter<'_> {
    fn write(&mut self, data: &[u8]) -> Result<(), PartitionError> {
        if self.first_byte.is_none() {
            self.first_byte = data.first().copied();
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| PartitionError("staging file already closed".to_string()))?;
        file.write_all(data).map_err(io_error("write staging file"))?;
        self.written += data.len() as u64;
        Ok(())
    }

    fn finalize(mut self) -> Result<ImageState, PartitionError> {
        if let Some(file) = self.file.take() {
            file.sync_all().map_err(io_error("sync staging file"))?;
        }

        if self.written != self.expected || self.first_byte != Some(ESP_IMAGE_MAGIC) {
            warn!(
                "staged image rejected ({} of {} bytes, magic {:?})",
                self.written, self.expected, self.first_byte
            );
            fs::remove_file(&self.staging).map_err(io_error("remove staging file"))?;
            return Ok(ImageState::Incomplete);
        }

        fs::rename(&self.staging, &self.partition.path).map_err(io_error("commit image"))?;
        info!("firmware image committed to {}", self.partition.path.display());
        Ok(ImageState::Valid)
    }

    fn abort(mut self) -> Result<(), PartitionError> {
        self.discard_staging()
    }
}

impl FileWriter<'_> {
    fn discard_staging(&mut self) -> Result<(), PartitionError> {
        self.file.take();
        match fs::remove_file(&self.staging) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error("remove staging file")(err)),
        }
    }
}

/// A writer dropped without `finalize` or `abort` leaves no staging file.
impl Drop for FileWriter<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.discard_staging() {
            warn!("{err}");
        }
    }
}

fn io_error(action: &'static str) -> impl Fn(std::io::Error) -> PartitionError {
    move |err| PartitionError(format!("{action}: {err}"))
}

/// Flash LED stand-in; only logs level changes.
#[derive(Debug, Default)]
pub struct SimulatedLamp;

impl LampPin for SimulatedLamp {
    type Error = std::convert::Infallible;

    fn set_lit(&mut self, lit: bool) -> Result<(), Self::Error> {
        debug!("flash LED {}", if lit { "on" } else { "off" });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use camstream_common::{
        DeviceControl, FrameSize, OtaConfig, OtaController, OtaHandle, OtaRequest, OtaStatus,
        Scheduler,
    };

    use super::*;

    fn camera(pixel_format: PixelFormat, fb_count: u8) -> CameraConfig {
        CameraConfig {
            pixel_format,
            frame_size: FrameSize::Qqvga,
            fb_count,
            ..CameraConfig::default()
        }
    }

    #[test]
    fn pattern_source_lends_each_buffer_once() {
        let mut source = TestPatternSource::new(&camera(PixelFormat::Rgb565, 2));

        let first = source.capture().unwrap();
        let second = source.capture().unwrap();
        assert_eq!(first.data().len(), 160 * 120 * 2);
        assert!(source.capture().is_err());

        drop(first);
        let third = source.capture().unwrap();
        assert_eq!(third.width(), 160);
        drop((second, third));
        assert_eq!(source.pool.lock().unwrap().len(), 2);
    }

    #[test]
    fn frame_rate_spaces_out_captures() {
        let mut source =
            TestPatternSource::new(&camera(PixelFormat::Grayscale, 2)).with_frame_rate(50);

        let start = Instant::now();
        let first = source.capture().unwrap();
        drop(first);
        let second = source.capture().unwrap();

        assert!(start.elapsed() >= Duration::from_millis(20));
        drop(second);
    }

    #[test]
    fn encodes_rgb565_and_grayscale_frames() {
        for format in [PixelFormat::Rgb565, PixelFormat::Grayscale] {
            let mut source = TestPatternSource::new(&camera(format, 1));
            let frame = source.capture().unwrap();

            let jpeg = ImageJpegEncoder.encode(frame.raw(), 80).unwrap();
            assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
            assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
        }
    }

    #[test]
    fn short_buffer_is_an_encode_error() {
        let frame = RawFrame {
            data: &[0; 10],
            format: PixelFormat::Rgb565,
            width: 4,
            height: 4,
        };
        assert!(ImageJpegEncoder.encode(frame, 80).is_err());
    }

    #[test]
    fn rgb565_conversion_expands_channels() {
        let white = rgb888_to_rgb565(255, 255, 255).to_be_bytes();
        let red = rgb888_to_rgb565(255, 0, 0).to_be_bytes();
        let rgb = rgb565_to_rgb888(&[white[0], white[1], red[0], red[1]]);
        assert_eq!(rgb, [255, 255, 255, 255, 0, 0]);
    }

    #[test]
    fn valid_image_is_committed() {
        let dir = tempfile::tempdir().unwrap();
        let mut partition = FilePartition::new(dir.path().join("fw/firmware.bin"), 1024);
        let image = [ESP_IMAGE_MAGIC, 1, 2, 3, 4];

        let mut writer = partition.begin(5).unwrap();
        writer.write(&image[..2]).unwrap();
        writer.write(&image[2..]).unwrap();
        assert_eq!(writer.finalize().unwrap(), ImageState::Valid);

        assert_eq!(fs::read(partition.path()).unwrap(), image);
        assert!(!partition.staging_path().exists());
    }

    #[test]
    fn bad_magic_is_incomplete_and_leaves_no_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut partition = FilePartition::new(dir.path().join("firmware.bin"), 1024);

        let mut writer = partition.begin(3).unwrap();
        writer.write(b"abc").unwrap();
        assert_eq!(writer.finalize().unwrap(), ImageState::Incomplete);

        assert!(!partition.path().exists());
        assert!(!partition.staging_path().exists());
    }

    #[test]
    fn abort_discards_staged_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut partition = FilePartition::new(dir.path().join("firmware.bin"), 1024);
        fs::write(partition.path(), b"previous").unwrap();

        let mut writer = partition.begin(100).unwrap();
        writer.write(&[ESP_IMAGE_MAGIC; 10]).unwrap();
        writer.abort().unwrap();

        assert_eq!(fs::read(partition.path()).unwrap(), b"previous");
        assert!(!partition.staging_path().exists());
    }

    #[test]
    fn download_reads_queued_body_then_ends() {
        let (tx, events) = mpsc::sync_channel(4);
        pump_body(&b"firmware"[..], tx);

        let mut download = HttpDownload {
            status: 200,
            content_length: Some(8),
            events,
            pending: Vec::new(),
            offset: 0,
        };

        let mut buf = [0_u8; 5];
        assert_eq!(download.read(&mut buf).unwrap(), ReadStatus::Data(5));
        assert_eq!(&buf, b"firmw");
        assert_eq!(download.read(&mut buf).unwrap(), ReadStatus::Data(3));
        assert_eq!(&buf[..3], b"are");
        assert_eq!(download.read(&mut buf).unwrap(), ReadStatus::End);
    }

    #[test]
    fn empty_queue_is_pending() {
        let (_tx, events) = mpsc::sync_channel(1);
        let mut download = HttpDownload {
            status: 200,
            content_length: Some(1),
            events,
            pending: Vec::new(),
            offset: 0,
        };
        assert_eq!(download.read(&mut [0; 4]).unwrap(), ReadStatus::Pending);
    }

    #[test]
    fn stalled_body_releases_the_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut request = [0_u8; 1024];
            let _ = socket.read(&mut request).unwrap();
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\n0123456789")
                .unwrap();
            socket.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
            // Returns once the client drops the stalled connection.
            match socket.read(&mut request) {
                Ok(read) => read == 0,
                Err(err) => err.kind() == ErrorKind::ConnectionReset,
            }
        });

        let builder =
            HttpFirmwareSource::builder(Duration::from_secs(5), Duration::from_millis(300));
        let mut source = HttpFirmwareSource::from_builder(builder.no_proxy()).unwrap();
        let download = source.get(&format!("http://{addr}/firmware.bin")).unwrap();
        assert_eq!(download.http_status(), 200);
        assert_eq!(download.content_length(), Some(1000));
        drop(download);

        assert!(server.join().unwrap(), "connection stayed open");
    }

    struct QueuedSource(Option<HttpDownload>);

    impl FirmwareSource for QueuedSource {
        type Download = HttpDownload;

        fn get(&mut self, _url: &str) -> Result<HttpDownload, SourceError> {
            self.0
                .take()
                .ok_or_else(|| SourceError("already fetched".to_string()))
        }
    }

    /// Requests an abort on the first yield, as the server does on shutdown.
    struct AbortOnYield(OtaHandle);

    impl Scheduler for AbortOnYield {
        fn now_ms(&self) -> u64 {
            0
        }

        fn yield_now(&self) {
            self.0.abort();
        }

        fn sleep_ms(&self, _ms: u64) {}
    }

    struct NoRestart;

    impl DeviceControl for NoRestart {
        fn restart(&self) {}
    }

    #[test]
    fn abort_mid_transfer_removes_staging_file() {
        let dir = tempfile::tempdir().unwrap();
        let partition = FilePartition::new(dir.path().join("firmware.bin"), 1024);
        let staging = partition.staging_path();
        let final_path = partition.path().to_path_buf();

        let (tx, events) = mpsc::sync_channel(4);
        tx.send(BodyEvent::Data(vec![ESP_IMAGE_MAGIC; 10])).unwrap();
        let mut source = QueuedSource(Some(HttpDownload {
            status: 200,
            content_length: Some(100),
            events,
            pending: Vec::new(),
            offset: 0,
        }));

        let request = OtaRequest::new("http://fw.local/camstream.bin");
        let handle = OtaHandle::new();
        handle.try_begin(&request, 0).unwrap();

        let mut controller =
            OtaController::new(&OtaConfig::default(), handle.clone(), partition, NoRestart);
        let result = controller.run(&request, &mut source, &AbortOnYield(handle.clone()));
        drop(tx);

        assert!(result.is_err());
        assert_eq!(handle.status(), OtaStatus::Failed);
        assert_eq!(handle.view().failure_reason, Some("ABORTED"));
        assert_eq!(handle.view().bytes_written, 10);
        assert!(!staging.exists());
        assert!(!final_path.exists());
    }

    #[test]
    fn dropped_writer_leaves_no_staging_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut partition = FilePartition::new(dir.path().join("firmware.bin"), 1024);

        let mut writer = partition.begin(100).unwrap();
        writer.write(&[ESP_IMAGE_MAGIC; 10]).unwrap();
        assert!(writer.staging.exists());
        drop(writer);

        assert!(!partition.staging_path().exists());
        assert!(!partition.path().exists());
    }
}
