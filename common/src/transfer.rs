use crate::{
    error::{OtaError, TriggerError},
    types::{OtaFailure, OtaStatus},
};

/// Bookkeeping for a single firmware update attempt.
///
/// Status only moves forward along IDLE, DOWNLOADING, WRITING, VERIFYING,
/// COMPLETE, except that any non-terminal status may drop to FAILED. A new
/// attempt may start from IDLE or from a terminal status.
#[derive(Debug, Clone)]
pub struct OtaTransfer {
    status: OtaStatus,
    target_size: u64,
    bytes_written: u64,
    last_progress_pct: u8,
    last_activity_ms: u64,
    failure: Option<OtaFailure>,
}

impl Default for OtaTransfer {
    fn default() -> Self {
        Self::new()
    }
}

impl OtaTransfer {
    pub fn new() -> Self {
        Self {
            status: OtaStatus::Idle,
            target_size: 0,
            bytes_written: 0,
            last_progress_pct: 0,
            last_activity_ms: 0,
            failure: None,
        }
    }

    pub fn status(&self) -> OtaStatus {
        self.status
    }

    pub fn target_size(&self) -> u64 {
        self.target_size
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn progress_pct(&self) -> u8 {
        self.last_progress_pct
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms
    }

    pub fn failure(&self) -> Option<OtaFailure> {
        self.failure
    }

    pub fn begin_download(&mut self, now_ms: u64) -> Result<(), TriggerError> {
        if self.status.is_active() {
            return Err(TriggerError::Busy(self.status));
        }

        *self = Self::new();
        self.status = OtaStatus::Downloading;
        self.last_activity_ms = now_ms;
        Ok(())
    }

    /// Checks the HTTP response of the firmware request and returns the image
    /// size. Storage has not been touched when this fails.
    pub fn accept_response(
        &mut self,
        http_status: u16,
        content_length: Option<i64>,
    ) -> Result<u64, OtaError> {
        self.expect(OtaStatus::Downloading)?;

        if http_status != 200 {
            return Err(OtaError::Download(format!("HTTP status {http_status}")));
        }

        match content_length {
            Some(len) if len > 0 => Ok(len as u64),
            Some(len) => Err(OtaError::Download(format!("invalid firmware size {len}"))),
            None => Err(OtaError::Download("missing content length".to_string())),
        }
    }

    pub fn begin_writing(&mut self, size: u64, capacity: u64, now_ms: u64) -> Result<(), OtaError> {
        self.expect(OtaStatus::Downloading)?;

        if size == 0 {
            return Err(OtaError::Download("empty firmware image".to_string()));
        }
        if size > capacity {
            return Err(OtaError::Capacity { size, capacity });
        }

        self.status = OtaStatus::Writing;
        self.target_size = size;
        self.bytes_written = 0;
        self.last_progress_pct = 0;
        self.last_activity_ms = now_ms;
        Ok(())
    }

    /// Accounts for `len` freshly written bytes. Returns the new progress
    /// percentage when it differs from the last reported one.
    pub fn record_chunk(&mut self, len: usize, now_ms: u64) -> Result<Option<u8>, OtaError> {
        self.expect(OtaStatus::Writing)?;

        self.last_activity_ms = now_ms;

        let written = self.bytes_written.saturating_add(len as u64);
        if written > self.target_size {
            return Err(OtaError::Download(format!(
                "received {written} bytes, more than the declared {}",
                self.target_size
            )));
        }
        self.bytes_written = written;

        let pct = (written.saturating_mul(100) / self.target_size).min(100) as u8;
        if pct != self.last_progress_pct {
            self.last_progress_pct = pct;
            return Ok(Some(pct));
        }
        Ok(None)
    }

    pub fn check_timeout(&self, now_ms: u64, timeout_ms: u64) -> Result<(), OtaError> {
        let idle_ms = now_ms.saturating_sub(self.last_activity_ms);
        if self.status == OtaStatus::Writing && idle_ms > timeout_ms {
            return Err(OtaError::Timeout { idle_ms });
        }
        Ok(())
    }

    pub fn is_fully_written(&self) -> bool {
        self.status == OtaStatus::Writing && self.bytes_written == self.target_size
    }

    pub fn begin_verifying(&mut self) -> Result<(), OtaError> {
        self.expect(OtaStatus::Writing)?;

        if self.bytes_written != self.target_size {
            return Err(OtaError::IncompleteImage {
                written: self.bytes_written,
            });
        }
        self.status = OtaStatus::Verifying;
        Ok(())
    }

    pub fn complete(&mut self) -> Result<(), OtaError> {
        self.expect(OtaStatus::Verifying)?;
        self.status = OtaStatus::Complete;
        Ok(())
    }

    /// Moves any non-terminal attempt to FAILED. Terminal states are left as
    /// they are so a finished attempt keeps its outcome.
    pub fn fail(&mut self, failure: OtaFailure) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = OtaStatus::Failed;
        self.failure = Some(failure);
        true
    }

    fn expect(&self, status: OtaStatus) -> Result<(), OtaError> {
        if self.status == status {
            Ok(())
        } else {
            Err(OtaError::Aborted)
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn writing(size: u64) -> OtaTransfer {
        let mut transfer = OtaTransfer::new();
        transfer.begin_download(0).unwrap();
        transfer.begin_writing(size, u64::MAX, 0).unwrap();
        transfer
    }

    #[test]
    fn rejects_non_ok_status_and_bad_lengths() {
        let mut transfer = OtaTransfer::new();
        transfer.begin_download(0).unwrap();

        assert!(matches!(
            transfer.accept_response(404, Some(10)),
            Err(OtaError::Download(_))
        ));
        assert!(matches!(
            transfer.accept_response(200, Some(0)),
            Err(OtaError::Download(_))
        ));
        assert!(matches!(
            transfer.accept_response(200, Some(-1)),
            Err(OtaError::Download(_))
        ));
        assert!(matches!(
            transfer.accept_response(200, None),
            Err(OtaError::Download(_))
        ));
        assert_eq!(transfer.accept_response(200, Some(10)), Ok(10));
    }

    #[test]
    fn oversized_image_fails_capacity_check() {
        let mut transfer = OtaTransfer::new();
        transfer.begin_download(0).unwrap();

        let err = transfer.begin_writing(2_000_000, 1_500_000, 0).unwrap_err();
        assert_eq!(
            err,
            OtaError::Capacity {
                size: 2_000_000,
                capacity: 1_500_000
            }
        );
        assert_eq!(transfer.status(), OtaStatus::Downloading);
        assert!(transfer.fail(err.failure()));
        assert_eq!(transfer.status(), OtaStatus::Failed);
        assert_eq!(transfer.failure(), Some(OtaFailure::Capacity));
    }

    #[test]
    fn empty_image_is_refused_before_writing() {
        let mut transfer = OtaTransfer::new();
        transfer.begin_download(0).unwrap();

        assert_eq!(
            transfer.begin_writing(0, 4_096, 0),
            Err(OtaError::Download("empty firmware image".to_string()))
        );
        assert_eq!(transfer.status(), OtaStatus::Downloading);
        assert_eq!(transfer.record_chunk(0, 1), Err(OtaError::Aborted));
    }

    #[test]
    fn progress_is_reported_only_on_change() {
        let mut transfer = writing(1_000);

        let mut reported = Vec::new();
        for now in 1..=200 {
            if let Some(pct) = transfer.record_chunk(5, now).unwrap() {
                reported.push(pct);
            }
        }

        assert_eq!(transfer.bytes_written(), 1_000);
        assert_eq!(reported, (1..=100).collect::<Vec<u8>>());
        assert!(transfer.is_fully_written());
    }

    #[test]
    fn small_chunks_do_not_repeat_progress() {
        let mut transfer = writing(10_000);
        assert_eq!(transfer.record_chunk(1, 1).unwrap(), None);
        assert_eq!(transfer.record_chunk(99, 2).unwrap(), Some(1));
        assert_eq!(transfer.record_chunk(50, 3).unwrap(), None);
        assert_eq!(transfer.last_activity_ms(), 3);
    }

    #[test]
    fn bytes_never_exceed_target() {
        let mut transfer = writing(10);
        transfer.record_chunk(8, 1).unwrap();

        assert!(transfer.record_chunk(3, 2).is_err());
        assert_eq!(transfer.bytes_written(), 8);
    }

    #[test]
    fn watchdog_fires_only_after_window() {
        let mut transfer = writing(100);
        transfer.record_chunk(10, 1_000).unwrap();

        assert!(transfer.check_timeout(1_500, 500).is_ok());
        assert_eq!(
            transfer.check_timeout(1_501, 500),
            Err(OtaError::Timeout { idle_ms: 501 })
        );
    }

    #[test]
    fn verifying_requires_every_byte() {
        let mut transfer = writing(100);
        transfer.record_chunk(99, 1).unwrap();
        assert!(transfer.begin_verifying().is_err());

        transfer.record_chunk(1, 2).unwrap();
        transfer.begin_verifying().unwrap();
        transfer.complete().unwrap();
        assert_eq!(transfer.status(), OtaStatus::Complete);
        assert!(!transfer.fail(OtaFailure::Timeout));
        assert_eq!(transfer.status(), OtaStatus::Complete);
    }

    #[test]
    fn second_attempt_is_rejected_while_active() {
        let mut transfer = writing(100);
        assert_eq!(
            transfer.begin_download(5),
            Err(TriggerError::Busy(OtaStatus::Writing))
        );

        transfer.fail(OtaFailure::Write);
        transfer.begin_download(6).unwrap();
        assert_eq!(transfer.status(), OtaStatus::Downloading);
        assert_eq!(transfer.failure(), None);
        assert_eq!(transfer.bytes_written(), 0);
    }

    #[test]
    fn steps_out_of_order_are_refused() {
        let mut transfer = OtaTransfer::new();
        assert!(transfer.record_chunk(1, 0).is_err());
        assert!(transfer.complete().is_err());
        assert!(transfer.begin_writing(1, 1, 0).is_err());
        assert_eq!(transfer.status(), OtaStatus::Idle);
    }
}
