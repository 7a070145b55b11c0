pub mod config;
pub mod error;
pub mod flash;
pub mod frame;
pub mod multipart;
pub mod ota;
pub mod routes;
pub mod sched;
pub mod transfer;
pub mod types;

pub use config::{CameraConfig, NetworkConfig, OtaConfig, RuntimeConfig, StreamConfig};
pub use error::{
    CaptureError, EncodeError, OtaError, PartitionError, SourceError, StreamError, TransportError,
    TriggerError,
};
pub use flash::{FlashLight, LampPin};
pub use frame::{CapturedFrame, FrameSource, JpegEncoder, JpegPayload, RawFrame};
pub use multipart::{FrameSink, MultipartStreamEngine, StreamSession, StreamSummary};
pub use ota::{
    DeviceControl, FirmwareDownload, FirmwareSource, ImageState, OtaController, OtaHandle,
    OtaReport, OtaRequest, ReadStatus, UpdatePartition, UpdateWriter,
};
pub use routes::{Capability, HttpMethod, Route, UpdateTrigger, ROUTES};
pub use sched::{Scheduler, ShutdownSignal, ThreadScheduler};
pub use transfer::OtaTransfer;
pub use types::{
    FrameSize, FrameTimestamp, OtaFailure, OtaStatus, OtaStatusView, OtaTriggerResponse,
    PixelFormat,
};
