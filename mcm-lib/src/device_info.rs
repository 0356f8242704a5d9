//! Identification and runtime information requests.

use crate::constants::{CONTROL_IN_MAX_LENGTH, InfoSelector, VendorRequest};
use crate::error::{McmError, Result};
use crate::session::Session;
use crate::transport::UsbTransport;
use num_enum::{FromPrimitive, IntoPrimitive};
use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

/// Why the MCM's ESP32 last reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive, Serialize)]
#[repr(u8)]
pub enum ResetReason {
    Undetermined = 0,
    PowerOn = 1,
    ExternalPin = 2,
    Software = 3,
    Panic = 4,
    InterruptWatchdog = 5,
    TaskWatchdog = 6,
    OtherWatchdog = 7,
    DeepSleep = 8,
    Brownout = 9,
    Sdio = 10,
    Usb = 11,
    Jtag = 12,
    #[num_enum(catch_all)]
    Unknown(u8),
}

impl ResetReason {
    pub fn description(&self) -> String {
        let text = match self {
            ResetReason::Undetermined => "Reset reason can not be determined",
            ResetReason::PowerOn => "Reset due to power-on event",
            ResetReason::ExternalPin => "Reset by external pin",
            ResetReason::Software => "Software reset via esp_restart",
            ResetReason::Panic => "Software reset due to exception/panic",
            ResetReason::InterruptWatchdog => "Reset (software or hardware) due to interrupt watchdog",
            ResetReason::TaskWatchdog => "Reset due to task watchdog",
            ResetReason::OtherWatchdog => "Reset due to other watchdogs",
            ResetReason::DeepSleep => "Reset after exiting deep sleep mode",
            ResetReason::Brownout => "Brownout reset (software or hardware)",
            ResetReason::Sdio => "Reset over SDIO",
            ResetReason::Usb => "Reset by USB peripheral",
            ResetReason::Jtag => "Reset by JTAG",
            ResetReason::Unknown(code) => return format!("Unknown reset reason {}", code),
        };
        text.to_string()
    }
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

/// Decode a NUL-terminated (or unterminated) string reply.
pub(crate) fn decode_c_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// Little-endian unsigned value of up to 4 bytes; extra bytes are ignored.
pub(crate) fn decode_le_u32(data: &[u8]) -> u32 {
    data.iter()
        .take(4)
        .enumerate()
        .fold(0u32, |acc, (i, &b)| acc | (u32::from(b) << (8 * i)))
}

impl<T: UsbTransport> Session<T> {
    /// Make the MCM signal its presence (blinks its LED).
    pub async fn identify(&mut self) -> Result<()> {
        self.vendor_command(VendorRequest::Identify, 1).await
    }

    /// Firmware version string.
    pub async fn version(&mut self) -> Result<String> {
        let data = self
            .vendor_control_transfer_in(VendorRequest::Info, InfoSelector::Version.into(), CONTROL_IN_MAX_LENGTH)
            .await?;
        Ok(decode_c_string(&data))
    }

    pub async fn reset_reason(&mut self) -> Result<ResetReason> {
        let data = self
            .vendor_control_transfer_in(
                VendorRequest::Info,
                InfoSelector::ResetReason.into(),
                CONTROL_IN_MAX_LENGTH,
            )
            .await?;
        let code = data
            .first()
            .copied()
            .ok_or_else(|| McmError::InvalidResponse("empty reset reason reply".to_string()))?;
        Ok(ResetReason::from(code))
    }

    /// Uptime counter as reported by the firmware.
    pub async fn uptime(&mut self) -> Result<u32> {
        let data = self
            .vendor_control_transfer_in(VendorRequest::Info, InfoSelector::UpTime.into(), CONTROL_IN_MAX_LENGTH)
            .await?;
        Ok(decode_le_u32(&data))
    }

    /// Restart the MCM and drop the connection; the device re-enumerates.
    pub async fn restart(&mut self) -> Result<()> {
        info!("Restarting MCM");
        self.vendor_command(VendorRequest::Restart, 0).await?;
        if let Err(e) = self.disconnect().await {
            // the device may already be gone
            warn!("Disconnect after restart: {}", e);
        }
        Ok(())
    }
}
