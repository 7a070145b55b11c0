use crate::{
    error::{CaptureError, EncodeError, StreamError},
    types::{FrameTimestamp, PixelFormat},
};

/// A frame buffer borrowed from the sensor's pool.
///
/// Implementations return the buffer to the pool when dropped, so a frame is
/// handed back exactly once no matter which path ends its use.
pub trait CapturedFrame {
    fn data(&self) -> &[u8];
    fn format(&self) -> PixelFormat;
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn timestamp(&self) -> FrameTimestamp;

    fn raw(&self) -> RawFrame<'_> {
        RawFrame {
            data: self.data(),
            format: self.format(),
            width: self.width(),
            height: self.height(),
        }
    }
}

pub trait FrameSource {
    type Frame: CapturedFrame;

    fn capture(&mut self) -> Result<Self::Frame, CaptureError>;
}

/// Borrowed view of raw pixel data handed to a [`JpegEncoder`].
#[derive(Debug, Clone, Copy)]
pub struct RawFrame<'a> {
    pub data: &'a [u8],
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

pub trait JpegEncoder {
    /// Heap buffer owned by the caller; freed when dropped.
    type Output: AsRef<[u8]>;

    fn encode(&mut self, frame: RawFrame<'_>, quality: u8) -> Result<Self::Output, EncodeError>;
}

/// JPEG bytes for one part, either still borrowed from the sensor or owned
/// after conversion. Dropping it takes the matching release path.
pub enum JpegPayload<F, E> {
    Borrowed(F),
    Encoded(E),
}

impl<F, E> JpegPayload<F, E>
where
    F: CapturedFrame,
    E: AsRef<[u8]>,
{
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Borrowed(frame) => frame.data(),
            Self::Encoded(buffer) => buffer.as_ref(),
        }
    }

    pub fn is_borrowed(&self) -> bool {
        matches!(self, Self::Borrowed(_))
    }
}

/// Captures one frame and makes sure it is JPEG.
///
/// A frame that needed conversion goes back to the source right after the
/// encoder has run, whether or not encoding succeeded.
pub fn acquire_jpeg<S, J>(
    source: &mut S,
    encoder: &mut J,
    quality: u8,
) -> Result<(JpegPayload<S::Frame, J::Output>, FrameTimestamp), StreamError>
where
    S: FrameSource,
    J: JpegEncoder,
{
    let frame = source.capture()?;
    let timestamp = frame.timestamp();

    if frame.format().is_jpeg() {
        return Ok((JpegPayload::Borrowed(frame), timestamp));
    }

    let encoded = encoder.encode(frame.raw(), quality);
    drop(frame);

    Ok((JpegPayload::Encoded(encoded?), timestamp))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{cell::RefCell, collections::VecDeque, rc::Rc};

    use super::*;

    #[derive(Debug, Default)]
    pub struct Ledger {
        pub captured: usize,
        pub returned: usize,
        pub encoded: usize,
        pub freed: usize,
    }

    pub type SharedLedger = Rc<RefCell<Ledger>>;

    pub struct MockFrame {
        pub data: Vec<u8>,
        pub format: PixelFormat,
        pub timestamp: FrameTimestamp,
        ledger: SharedLedger,
    }

    impl CapturedFrame for MockFrame {
        fn data(&self) -> &[u8] {
            &self.data
        }

        fn format(&self) -> PixelFormat {
            self.format
        }

        fn width(&self) -> u32 {
            4
        }

        fn height(&self) -> u32 {
            2
        }

        fn timestamp(&self) -> FrameTimestamp {
            self.timestamp
        }
    }

    impl Drop for MockFrame {
        fn drop(&mut self) {
            self.ledger.borrow_mut().returned += 1;
        }
    }

    /// Scripted sensor: `None` entries simulate the driver returning no buffer.
    pub struct MockSource {
        pub script: VecDeque<Option<(PixelFormat, Vec<u8>)>>,
        pub ledger: SharedLedger,
        next_secs: i64,
    }

    impl MockSource {
        pub fn new(script: Vec<Option<(PixelFormat, Vec<u8>)>>) -> Self {
            Self {
                script: script.into(),
                ledger: SharedLedger::default(),
                next_secs: 100,
            }
        }
    }

    impl FrameSource for MockSource {
        type Frame = MockFrame;

        fn capture(&mut self) -> Result<MockFrame, CaptureError> {
            let Some((format, data)) = self.script.pop_front().flatten() else {
                return Err(CaptureError("no frame buffer".to_string()));
            };
            self.next_secs += 1;
            self.ledger.borrow_mut().captured += 1;
            Ok(MockFrame {
                data,
                format,
                timestamp: FrameTimestamp::new(self.next_secs, 42),
                ledger: self.ledger.clone(),
            })
        }
    }

    pub struct MockJpeg {
        pub data: Vec<u8>,
        ledger: SharedLedger,
    }

    impl AsRef<[u8]> for MockJpeg {
        fn as_ref(&self) -> &[u8] {
            &self.data
        }
    }

    impl Drop for MockJpeg {
        fn drop(&mut self) {
            self.ledger.borrow_mut().freed += 1;
        }
    }

    pub struct MockEncoder {
        pub ledger: SharedLedger,
        pub fail: bool,
        pub last_quality: Option<u8>,
    }

    impl MockEncoder {
        pub fn new(ledger: SharedLedger) -> Self {
            Self {
                ledger,
                fail: false,
                last_quality: None,
            }
        }
    }

    impl JpegEncoder for MockEncoder {
        type Output = MockJpeg;

        fn encode(&mut self, frame: RawFrame<'_>, quality: u8) -> Result<MockJpeg, EncodeError> {
            self.last_quality = Some(quality);
            if self.fail {
                return Err(EncodeError("out of memory".to_string()));
            }
            self.ledger.borrow_mut().encoded += 1;
            let mut data = vec![0xFF, 0xD8];
            data.extend_from_slice(frame.data);
            data.extend_from_slice(&[0xFF, 0xD9]);
            Ok(MockJpeg {
                data,
                ledger: self.ledger.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{testing::*, *};

    #[test]
    fn jpeg_frame_is_borrowed_without_encoding() {
        let mut source = MockSource::new(vec![Some((PixelFormat::Jpeg, vec![1, 2, 3]))]);
        let mut encoder = MockEncoder::new(source.ledger.clone());

        let (payload, timestamp) = acquire_jpeg(&mut source, &mut encoder, 80).unwrap();
        assert!(payload.is_borrowed());
        assert_eq!(payload.bytes(), &[1, 2, 3]);
        assert_eq!(timestamp.micros, 42);
        assert_eq!(source.ledger.borrow().returned, 0);

        drop(payload);
        let ledger = source.ledger.borrow();
        assert_eq!(ledger.returned, 1);
        assert_eq!(ledger.freed, 0);
        assert_eq!(encoder.last_quality, None);
    }

    #[test]
    fn raw_frame_returns_to_pool_before_payload_is_used() {
        let mut source = MockSource::new(vec![Some((PixelFormat::Rgb565, vec![7; 16]))]);
        let mut encoder = MockEncoder::new(source.ledger.clone());

        let (payload, _) = acquire_jpeg(&mut source, &mut encoder, 80).unwrap();
        assert!(!payload.is_borrowed());
        assert_eq!(source.ledger.borrow().returned, 1);
        assert_eq!(encoder.last_quality, Some(80));

        drop(payload);
        let ledger = source.ledger.borrow();
        assert_eq!(ledger.freed, 1);
        assert_eq!(ledger.returned, 1);
    }

    #[test]
    fn failed_encoding_still_returns_raw_frame() {
        let mut source = MockSource::new(vec![Some((PixelFormat::Yuv422, vec![1; 8]))]);
        let mut encoder = MockEncoder::new(source.ledger.clone());
        encoder.fail = true;

        let result = acquire_jpeg(&mut source, &mut encoder, 80);
        assert!(matches!(result, Err(StreamError::Encode(_))));

        let ledger = source.ledger.borrow();
        assert_eq!(ledger.returned, 1);
        assert_eq!(ledger.freed, 0);
    }

    #[test]
    fn missing_buffer_is_capture_error() {
        let mut source = MockSource::new(vec![None]);
        let mut encoder = MockEncoder::new(source.ledger.clone());

        let result = acquire_jpeg(&mut source, &mut encoder, 80);
        assert!(matches!(result, Err(StreamError::Capture(_))));
        assert_eq!(source.ledger.borrow().captured, 0);
    }
}
