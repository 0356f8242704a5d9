//! Over-the-air upgrade of the MCM's own firmware.
//!
//! The image is streamed in fixed chunks over bulk OUT; after every chunk the MCM
//! prints `EMPTY` once its buffer is drained. After the last chunk it validates the
//! partition and prints `VALID`, after which the new partition is made bootable and
//! the MCM restarts.

use crate::constants::{OTA_CHUNK_SIZE, VendorRequest};
use crate::error::{McmError, Result};
use crate::lines::{Ack, LineBuffer};
use crate::session::{Mode, Session};
use crate::transport::UsbTransport;
use bytes::Bytes;
use tracing::{debug, info, warn};

impl<T: UsbTransport> Session<T> {
    /// Flash `image` onto the MCM and restart it.
    ///
    /// `on_progress(sent, total)` is called once before the first chunk and after every
    /// chunk. The session is disconnected afterwards because the device re-enumerates.
    /// Any active mode is left first and the mode is back to [`Mode::None`] on return,
    /// whatever the outcome.
    pub async fn upgrade_firmware<P>(&mut self, image: impl Into<Bytes>, mut on_progress: P) -> Result<()>
    where
        P: FnMut(usize, usize),
    {
        let result = self.run_upgrade(image.into(), &mut on_progress).await;
        if let Err(e) = &result {
            warn!("Firmware upgrade failed: {}", e);
        }
        self.set_mode(Mode::None);
        result
    }

    async fn run_upgrade<P>(&mut self, mut image: Bytes, on_progress: &mut P) -> Result<()>
    where
        P: FnMut(usize, usize),
    {
        let total = image.len();
        self.release_bulk_stream().await?;
        self.enter_mode(Mode::Upgrading).await?;
        info!("Starting firmware upgrade, {} bytes", total);

        self.vendor_command(VendorRequest::OtaDoTransfer, 1).await?;
        on_progress(0, total);

        let mut lines = LineBuffer::new();
        let ack_timeout = self.config.ota_ack_timeout;
        while !image.is_empty() {
            let chunk = image.split_to(OTA_CHUNK_SIZE.min(image.len()));
            self.vendor_transfer_out(chunk).await?;
            on_progress(total - image.len(), total);

            let line = self.wait_for_line(&mut lines, ack_timeout).await?;
            match Ack::parse(&line) {
                Ack::Empty => {}
                Ack::Fail(message) => return Err(McmError::DeviceReportedFailure(message)),
                _ => {
                    return Err(McmError::InvalidResponse(format!(
                        "unexpected chunk acknowledgement {:?}",
                        line
                    )));
                }
            }
        }

        self.vendor_command(VendorRequest::OtaDoTransfer, 0).await?;
        info!("Image sent, waiting for validation");

        let validation_timeout = self.config.ota_validation_timeout;
        loop {
            let line = self.wait_for_line(&mut lines, validation_timeout).await?;
            match Ack::parse(&line) {
                Ack::Valid => break,
                Ack::Fail(message) => return Err(McmError::DeviceReportedFailure(message)),
                Ack::Empty => {}
                _ => debug!("Ignoring {:?} while waiting for validation", line),
            }
        }

        info!("Image valid, switching boot partition");
        self.vendor_command(VendorRequest::OtaUpdateBootPartition, 0).await?;
        self.restart().await
    }
}
