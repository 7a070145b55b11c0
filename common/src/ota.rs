//! Over-the-air firmware update: download, write, verify, commit.
//!
//! The HTTP client, the update partition, and the restart hook are traits so
//! the same controller drives the ESP-IDF OTA API on the device and a file
//! backed partition on the host.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use log::{info, warn};
use sha2::{Digest, Sha256};

use crate::{
    config::OtaConfig,
    error::{OtaError, PartitionError, SourceError, TriggerError},
    sched::{Scheduler, ShutdownSignal},
    transfer::OtaTransfer,
    types::{OtaStatus, OtaStatusView},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// `n` bytes were copied into the buffer.
    Data(usize),
    /// Nothing available yet; the connection is still open.
    Pending,
    /// The body has ended.
    End,
}

impl ReadStatus {
    /// Classifies a read on a transport that returns after a short poll
    /// timeout. An empty read only ends the body once the transport has
    /// received all of it; otherwise the connection is idle.
    pub fn from_poll(read: usize, body_complete: bool) -> Self {
        match read {
            0 if body_complete => Self::End,
            0 => Self::Pending,
            read => Self::Data(read),
        }
    }
}

pub trait FirmwareDownload {
    fn http_status(&self) -> u16;
    fn content_length(&self) -> Option<i64>;
    /// Reads what is available without waiting longer than the transport's
    /// own poll interval.
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadStatus, SourceError>;
}

pub trait FirmwareSource {
    type Download: FirmwareDownload;

    /// Issues a GET for `url`, following redirects.
    fn get(&mut self, url: &str) -> Result<Self::Download, SourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    Valid,
    Incomplete,
}

/// The inactive firmware slot.
pub trait UpdatePartition {
    type Writer<'a>: UpdateWriter
    where
        Self: 'a;

    fn capacity(&self) -> u64;
    fn begin(&mut self, size: u64) -> Result<Self::Writer<'_>, PartitionError>;
}

/// An open update stream. Consuming `finalize` or `abort` ends it; only a
/// `Valid` finalize may mark the slot bootable.
pub trait UpdateWriter {
    fn write(&mut self, data: &[u8]) -> Result<(), PartitionError>;
    fn finalize(self) -> Result<ImageState, PartitionError>;
    fn abort(self) -> Result<(), PartitionError>;
}

pub trait DeviceControl {
    fn restart(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaRequest {
    pub url: String,
    pub sha256: Option<String>,
    pub restart: bool,
}

impl OtaRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            sha256: None,
            restart: true,
        }
    }

    pub fn validate(&self) -> Result<(), TriggerError> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(TriggerError::InvalidRequest("firmware url is not configured"));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(TriggerError::InvalidRequest(
                "url must start with http:// or https://",
            ));
        }

        if let Some(sha256) = self.sha256.as_ref() {
            let value = sha256.trim();
            if value.len() != 64 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(TriggerError::InvalidRequest(
                    "sha256 must be 64 hex characters",
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaReport {
    pub bytes_written: u64,
    pub sha256: String,
}

#[derive(Debug, Default)]
struct OtaRecord {
    transfer: OtaTransfer,
    last_error: Option<String>,
    last_sha256: Option<String>,
    last_source_url: Option<String>,
    last_completed_epoch: Option<i64>,
}

/// Shared view of the device's single update slot.
///
/// The router keeps a clone to report status and to refuse a second trigger
/// while an attempt is running; the worker running the attempt updates it.
#[derive(Debug, Clone, Default)]
pub struct OtaHandle {
    record: Arc<Mutex<OtaRecord>>,
    shutdown: ShutdownSignal,
}

impl OtaHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> OtaStatus {
        self.lock().transfer.status()
    }

    /// Claims the update slot for `request`. Fails if the request is invalid
    /// or another attempt is still running.
    pub fn try_begin(&self, request: &OtaRequest, now_ms: u64) -> Result<(), TriggerError> {
        request.validate()?;

        let mut record = self.lock();
        record.transfer.begin_download(now_ms)?;
        record.last_error = None;
        record.last_source_url = Some(request.url.trim().to_string());
        self.shutdown.reset();
        Ok(())
    }

    /// Asks a running attempt to stop. The worker aborts the partition write
    /// at its next iteration.
    pub fn abort(&self) {
        self.shutdown.trigger();
    }

    pub fn view(&self) -> OtaStatusView {
        let record = self.lock();
        let transfer = &record.transfer;
        let sized = transfer.target_size() > 0;

        OtaStatusView {
            status: transfer.status().as_str(),
            in_progress: transfer.status().is_active(),
            bytes_written: transfer.bytes_written(),
            total_bytes: sized.then(|| transfer.target_size()),
            progress_pct: sized.then(|| transfer.progress_pct()),
            failure_reason: transfer.failure().map(|failure| failure.as_str()),
            last_error: record.last_error.clone(),
            last_sha256: record.last_sha256.clone(),
            last_source_url: record.last_source_url.clone(),
            last_completed_epoch: record.last_completed_epoch,
        }
    }

    /// Records a failure that happened outside the controller, such as the
    /// worker thread failing to start.
    pub fn fail(&self, err: &OtaError) {
        let mut record = self.lock();
        if record.transfer.fail(err.failure()) {
            record.last_error = Some(err.to_string());
            record.last_completed_epoch = Some(Utc::now().timestamp());
        }
    }

    fn update<R>(&self, f: impl FnOnce(&mut OtaTransfer) -> R) -> R {
        f(&mut self.lock().transfer)
    }

    fn finish(&self, result: &Result<OtaReport, OtaError>) {
        let mut record = self.lock();
        match result {
            Ok(report) => {
                record.last_sha256 = Some(report.sha256.clone());
            }
            Err(err) => {
                record.transfer.fail(err.failure());
                record.last_error = Some(err.to_string());
            }
        }
        record.last_completed_epoch = Some(Utc::now().timestamp());
    }

    fn lock(&self) -> MutexGuard<'_, OtaRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct OtaController<P, D> {
    config: OtaConfig,
    handle: OtaHandle,
    partition: P,
    device: D,
}

impl<P, D> OtaController<P, D>
where
    P: UpdatePartition,
    D: DeviceControl,
{
    pub fn new(config: &OtaConfig, handle: OtaHandle, partition: P, device: D) -> Self {
        let mut config = config.clone();
        config.sanitize();
        Self {
            config,
            handle,
            partition,
            device,
        }
    }

    /// Runs the attempt claimed with [`OtaHandle::try_begin`].
    ///
    /// On success the device is restarted after the configured delay unless
    /// the request opted out. Failures leave the running firmware untouched.
    pub fn run<F, C>(
        &mut self,
        request: &OtaRequest,
        source: &mut F,
        scheduler: &C,
    ) -> Result<OtaReport, OtaError>
    where
        F: FirmwareSource,
        C: Scheduler,
    {
        let result = self.attempt(request, source, scheduler);
        self.handle.finish(&result);

        match &result {
            Ok(report) => {
                info!(
                    "OTA update completed ({} bytes, sha256 {})",
                    report.bytes_written, report.sha256
                );
                if request.restart {
                    info!("restarting in {} ms", self.config.restart_delay_ms);
                    scheduler.sleep_ms(self.config.restart_delay_ms);
                    self.device.restart();
                }
            }
            Err(err) => warn!("OTA update failed ({}): {err}", err.failure().as_str()),
        }

        result
    }

    fn attempt<F, C>(
        &mut self,
        request: &OtaRequest,
        source: &mut F,
        scheduler: &C,
    ) -> Result<OtaReport, OtaError>
    where
        F: FirmwareSource,
        C: Scheduler,
    {
        let Self {
            config,
            handle,
            partition,
            ..
        } = self;

        if handle.status() != OtaStatus::Downloading {
            return Err(OtaError::Aborted);
        }

        let url = request.url.trim();
        info!("OTA download starting from {url}");
        let mut download = source
            .get(url)
            .map_err(|err| OtaError::Download(err.to_string()))?;

        let size = handle.update(|transfer| {
            transfer.accept_response(download.http_status(), download.content_length())
        })?;
        let capacity = partition.capacity();
        info!(
            "firmware size: {} KB, update partition: {} KB",
            size / 1024,
            capacity / 1024
        );
        handle.update(|transfer| transfer.begin_writing(size, capacity, scheduler.now_ms()))?;

        let mut writer = partition.begin(size).map_err(OtaError::Begin)?;

        let digest = match write_image(config, handle, &mut download, &mut writer, scheduler) {
            Ok(digest) => digest,
            Err(err) => {
                abort_writer(writer);
                return Err(err);
            }
        };

        if let Err(err) = handle.update(|transfer| transfer.begin_verifying()) {
            abort_writer(writer);
            return Err(err);
        }

        if let Some(expected) = request.sha256.as_deref() {
            let expected = expected.trim().to_ascii_lowercase();
            if expected != digest {
                abort_writer(writer);
                return Err(OtaError::Checksum {
                    expected,
                    actual: digest,
                });
            }
        }

        match writer.finalize().map_err(OtaError::Finalize)? {
            ImageState::Valid => {}
            ImageState::Incomplete => {
                return Err(OtaError::IncompleteImage { written: size });
            }
        }

        handle.update(|transfer| transfer.complete())?;
        Ok(OtaReport {
            bytes_written: size,
            sha256: digest,
        })
    }
}

/// Copies the body into the writer until the declared size is reached.
/// Yields and checks the inactivity watchdog on every iteration.
fn write_image<R, W, C>(
    config: &OtaConfig,
    handle: &OtaHandle,
    download: &mut R,
    writer: &mut W,
    scheduler: &C,
) -> Result<String, OtaError>
where
    R: FirmwareDownload,
    W: UpdateWriter,
    C: Scheduler,
{
    let mut hasher = Sha256::new();
    let mut chunk = vec![0_u8; config.chunk_size];

    loop {
        if handle.shutdown.is_triggered() {
            return Err(OtaError::Aborted);
        }

        let (written, target) =
            handle.update(|transfer| (transfer.bytes_written(), transfer.target_size()));
        let remaining = target - written;
        if remaining == 0 {
            break;
        }

        let want = chunk.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        match download
            .read(&mut chunk[..want])
            .map_err(|err| OtaError::Download(err.to_string()))?
        {
            ReadStatus::Data(read) if read > 0 => {
                let read = read.min(want);
                writer.write(&chunk[..read]).map_err(OtaError::Write)?;
                hasher.update(&chunk[..read]);

                let now_ms = scheduler.now_ms();
                if let Some(pct) = handle.update(|transfer| transfer.record_chunk(read, now_ms))? {
                    info!("OTA progress: {pct}%");
                }
            }
            ReadStatus::Data(_) | ReadStatus::Pending => {}
            ReadStatus::End => {
                return Err(OtaError::Download(format!(
                    "stream ended after {written} of {target} bytes"
                )));
            }
        }

        let now_ms = scheduler.now_ms();
        handle.update(|transfer| transfer.check_timeout(now_ms, config.inactivity_timeout_ms))?;
        scheduler.yield_now();
    }

    Ok(to_hex(&hasher.finalize()))
}

fn abort_writer<W: UpdateWriter>(writer: W) {
    if let Err(err) = writer.abort() {
        warn!("failed to abort OTA write: {err}");
    }
}

fn to_hex(bytes: &[u8]) -> String {
    use core::fmt::Write as _;

    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(&mut hex, "{byte:02x}");
    }
    hex
}
