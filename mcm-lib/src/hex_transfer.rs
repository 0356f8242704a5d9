//! Staging of Intel-hex images on the MCM for its LIN/UART bootloaders.

use crate::constants::{VendorRequest, ack};
use crate::error::{McmError, Result};
use crate::lines::LineBuffer;
use crate::session::{Mode, Session};
use crate::transport::UsbTransport;
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, info, warn};

impl<T: UsbTransport> Session<T> {
    /// Send a hex file to the MCM and wait until it has been parsed and stored.
    ///
    /// Any active mode is left first. The mode is [`Mode::None`] on return.
    pub async fn transfer_hex_file(&mut self, hexfile: impl Into<Bytes>) -> Result<()> {
        let result = self.run_hex_transfer(hexfile.into()).await;
        if let Err(e) = &result {
            warn!("Hex file transfer failed: {}", e);
        }
        self.set_mode(Mode::None);
        result
    }

    async fn run_hex_transfer(&mut self, hexfile: Bytes) -> Result<()> {
        self.release_bulk_stream().await?;
        self.enter_mode(Mode::HexTransfer).await?;
        info!("Transferring hex file, {} bytes", hexfile.len());

        self.vendor_command(VendorRequest::BootloaderDoTransfer, 1).await?;
        self.vendor_transfer_out(hexfile).await?;
        self.vendor_command(VendorRequest::BootloaderDoTransfer, 0).await?;

        let timeout = self.config.hex_processing_timeout;
        self.wait_for_ok(timeout).await?;
        info!("Hex file accepted");
        Ok(())
    }

    /// Wait for a line containing `OK`, failing on a `FAIL:<message>` line.
    pub(crate) async fn wait_for_ok(&mut self, timeout: Duration) -> Result<()> {
        let mut lines = LineBuffer::new();
        loop {
            let line = self.wait_for_line(&mut lines, timeout).await?;
            if let Some(message) = line.strip_prefix(ack::FAIL_WITH_MESSAGE) {
                return Err(McmError::DeviceReportedFailure(message.trim().to_string()));
            }
            if line.contains(ack::OK) {
                return Ok(());
            }
            debug!("Ignoring {:?} while waiting for OK", line);
        }
    }
}
