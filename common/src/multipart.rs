//! `multipart/x-mixed-replace` framing for MJPEG streaming.
//!
//! Each captured frame becomes one part:
//!
//! ```text
//! \r\n--<boundary>\r\n
//! Content-Type: image/jpeg\r\n
//! Content-Length: <n>\r\n
//! X-Timestamp: <secs>.<micros>\r\n
//! \r\n
//! <n bytes of JPEG>
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info, warn};

use crate::{
    config::StreamConfig,
    error::{StreamError, TransportError},
    frame::{acquire_jpeg, FrameSource, JpegEncoder},
    sched::{Scheduler, ShutdownSignal},
    types::FrameTimestamp,
};

pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_ALLOW_ORIGIN: &str = "Access-Control-Allow-Origin";
pub const HEADER_FRAMERATE: &str = "X-Framerate";

/// Byte sink for one client connection.
pub trait FrameSink {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;
}

impl<W: FrameSink + ?Sized> FrameSink for &mut W {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).send(bytes)
    }
}

#[derive(Debug)]
pub struct MultipartStreamEngine {
    boundary: String,
    jpeg_quality: u8,
    advertised_fps: u16,
    next_session_id: AtomicU64,
}

/// Per-connection state. Lives exactly as long as the client connection.
#[derive(Debug)]
pub struct StreamSession<W> {
    id: u64,
    sink: W,
    delimiter: Vec<u8>,
    last_frame_ms: u64,
    frames_sent: u64,
    bytes_sent: u64,
}

#[derive(Debug)]
pub struct StreamSummary {
    pub session_id: u64,
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub error: StreamError,
}

impl MultipartStreamEngine {
    pub fn new(config: &StreamConfig) -> Self {
        let mut config = config.clone();
        config.sanitize();
        Self {
            boundary: config.boundary,
            jpeg_quality: config.jpeg_quality,
            advertised_fps: config.advertised_fps,
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn content_type(&self) -> String {
        format!("multipart/x-mixed-replace;boundary={}", self.boundary)
    }

    /// Headers sent once, before the first part.
    pub fn response_headers(&self) -> [(&'static str, String); 3] {
        [
            (HEADER_CONTENT_TYPE, self.content_type()),
            (HEADER_ALLOW_ORIGIN, "*".to_string()),
            (HEADER_FRAMERATE, self.advertised_fps.to_string()),
        ]
    }

    pub fn open<W: FrameSink>(&self, sink: W, now_ms: u64) -> StreamSession<W> {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        info!("stream session {id} opened");
        StreamSession {
            id,
            sink,
            delimiter: format!("\r\n--{}\r\n", self.boundary).into_bytes(),
            last_frame_ms: now_ms,
            frames_sent: 0,
            bytes_sent: 0,
        }
    }

    /// Streams frames until capture, encoding, or the connection fails.
    ///
    /// Only returns on error; the session is finished afterwards and the
    /// error never reaches other sessions.
    pub fn serve<S, J, W, C>(
        &self,
        mut session: StreamSession<W>,
        source: &mut S,
        encoder: &mut J,
        scheduler: &C,
        shutdown: &ShutdownSignal,
    ) -> StreamSummary
    where
        S: FrameSource,
        J: JpegEncoder,
        W: FrameSink,
        C: Scheduler,
    {
        let error = loop {
            if shutdown.is_triggered() {
                break StreamError::Shutdown;
            }

            if let Err(err) = self.stream_one(&mut session, source, encoder, scheduler) {
                break err;
            }

            scheduler.yield_now();
        };

        match &error {
            StreamError::Transport(_) | StreamError::Shutdown => info!(
                "stream session {} closed after {} frames: {error}",
                session.id, session.frames_sent
            ),
            StreamError::Capture(_) | StreamError::Encode(_) => warn!(
                "stream session {} aborted after {} frames: {error}",
                session.id, session.frames_sent
            ),
        }

        StreamSummary {
            session_id: session.id,
            frames_sent: session.frames_sent,
            bytes_sent: session.bytes_sent,
            error,
        }
    }

    fn stream_one<S, J, W, C>(
        &self,
        session: &mut StreamSession<W>,
        source: &mut S,
        encoder: &mut J,
        scheduler: &C,
    ) -> Result<(), StreamError>
    where
        S: FrameSource,
        J: JpegEncoder,
        W: FrameSink,
        C: Scheduler,
    {
        let (payload, timestamp) = acquire_jpeg(source, encoder, self.jpeg_quality)?;
        let result = session.write_part(payload.bytes(), timestamp);
        drop(payload);
        result?;

        let now_ms = scheduler.now_ms();
        debug!(
            "stream session {}: frame {} in {} ms",
            session.id,
            session.frames_sent,
            now_ms.saturating_sub(session.last_frame_ms)
        );
        session.last_frame_ms = now_ms;
        Ok(())
    }
}

impl<W: FrameSink> StreamSession<W> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    fn write_part(&mut self, jpeg: &[u8], timestamp: FrameTimestamp) -> Result<(), TransportError> {
        let header = part_header(jpeg.len(), timestamp);

        self.sink.send(&self.delimiter)?;
        self.sink.send(header.as_bytes())?;
        self.sink.send(jpeg)?;

        self.frames_sent += 1;
        self.bytes_sent += (self.delimiter.len() + header.len() + jpeg.len()) as u64;
        Ok(())
    }
}

pub fn part_header(content_length: usize, timestamp: FrameTimestamp) -> String {
    format!(
        "Content-Type: image/jpeg\r\nContent-Length: {content_length}\r\nX-Timestamp: {}.{:06}\r\n\r\n",
        timestamp.secs, timestamp.micros
    )
}
