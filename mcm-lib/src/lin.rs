//! LIN master operations and bootloading of LIN slaves through the PPM bootloader.

use crate::constants::{LIN_WAKEUP_PULSE_TIME, MessageId, VendorRequest};
use crate::error::{McmError, Result};
use crate::session::{Mode, Session};
use crate::transport::UsbTransport;
use bytes::Bytes;
use num_enum::IntoPrimitive;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tracing::{debug, info, warn};

/// Default LIN bus baud rate
pub const DEFAULT_LIN_BAUDRATE: u16 = 19200;

/// Direction of a LIN frame as seen from the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, Display)]
#[repr(u8)]
pub enum FrameDirection {
    SlaveToMaster = 0,
    MasterToSlave = 1,
}

/// Target memory of a bootloader operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Memory {
    #[default]
    Flash,
    Nvram,
}

impl Memory {
    /// Encoding used by the PPM and UART bootloader payloads.
    pub fn code(self) -> u8 {
        match self {
            Memory::Nvram => 0,
            Memory::Flash => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    #[default]
    Program,
    Verify,
}

impl Operation {
    pub fn code(self) -> u8 {
        match self {
            Operation::Program => 0,
            Operation::Verify => 1,
        }
    }
}

/// Parameters of a PPM bootloader action on a LIN slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PpmBootloadParams {
    pub bit_rate: u32,
    /// Slave power is switched by hand instead of by the MCM
    pub manual_power: bool,
    /// Address all slaves on the bus
    pub broadcast: bool,
    pub memory: Memory,
    pub operation: Operation,
}

impl Default for PpmBootloadParams {
    fn default() -> Self {
        Self {
            bit_rate: u32::from(DEFAULT_LIN_BAUDRATE),
            manual_power: false,
            broadcast: false,
            memory: Memory::Flash,
            operation: Operation::Program,
        }
    }
}

impl PpmBootloadParams {
    /// `bit_rate u32 LE | manual_power | broadcast | memory | operation`
    pub fn to_payload(&self) -> [u8; 8] {
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&self.bit_rate.to_le_bytes());
        payload[4] = u8::from(self.manual_power);
        payload[5] = u8::from(self.broadcast);
        payload[6] = self.memory.code();
        payload[7] = self.operation.code();
        payload
    }
}

/// Payload of a [`MessageId::LinHandleMessage`] request.
///
/// `baudrate u16 LE | data_length | direction | enhanced_crc | frame_id | payload`
pub fn lin_frame_request(
    baudrate: u16,
    direction: FrameDirection,
    enhanced_crc: bool,
    frame_id: u8,
    data_length: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut request = Vec::with_capacity(6 + payload.len());
    request.extend_from_slice(&baudrate.to_le_bytes());
    request.push(data_length);
    request.push(direction.into());
    request.push(u8::from(enhanced_crc));
    request.push(frame_id);
    request.extend_from_slice(payload);
    request
}

impl<T: UsbTransport> Session<T> {
    /// Switch the MCM into LIN master mode.
    pub async fn lin_setup(&mut self) -> Result<()> {
        self.enter_mode(Mode::Lin).await?;
        if let Err(e) = self.vendor_command(VendorRequest::LinComm, 1).await {
            self.set_mode(Mode::None);
            return Err(e);
        }
        info!("LIN communication enabled");
        Ok(())
    }

    /// Leave LIN master mode. The mode is [`Mode::None`] afterwards even on error.
    pub async fn lin_teardown(&mut self) -> Result<()> {
        let result = self.vendor_command(VendorRequest::LinComm, 0).await;
        self.set_mode(Mode::None);
        if result.is_ok() {
            info!("LIN communication disabled");
        }
        result
    }

    fn require_lin(&self) -> Result<()> {
        match self.mode() {
            Mode::Lin => Ok(()),
            actual => Err(McmError::ModeMismatch {
                expected: Mode::Lin,
                actual,
            }),
        }
    }

    /// Send a wake-up pulse on the LIN bus.
    pub async fn lin_wake_up(&mut self) -> Result<()> {
        self.require_lin()?;
        let timeout = self.config.lin_response_timeout;
        self.send_and_await(MessageId::LinSendWakeup, &LIN_WAKEUP_PULSE_TIME.to_le_bytes(), timeout)
            .await?;
        debug!("LIN wake-up sent");
        Ok(())
    }

    /// Publish a frame with `payload` as the master. Returns the response payload.
    pub async fn lin_master_to_slave(
        &mut self,
        baudrate: u16,
        enhanced_crc: bool,
        frame_id: u8,
        payload: &[u8],
    ) -> Result<Bytes> {
        self.require_lin()?;
        let data_length = u8::try_from(payload.len()).map_err(|_| McmError::FrameTooLarge { len: payload.len() })?;
        let request = lin_frame_request(
            baudrate,
            FrameDirection::MasterToSlave,
            enhanced_crc,
            frame_id,
            data_length,
            payload,
        );
        let timeout = self.config.lin_response_timeout;
        self.send_and_await(MessageId::LinHandleMessage, &request, timeout).await
    }

    /// Send a frame header and read `data_length` bytes published by a slave.
    pub async fn lin_slave_to_master(
        &mut self,
        baudrate: u16,
        enhanced_crc: bool,
        frame_id: u8,
        data_length: u8,
    ) -> Result<Bytes> {
        self.require_lin()?;
        let request = lin_frame_request(
            baudrate,
            FrameDirection::SlaveToMaster,
            enhanced_crc,
            frame_id,
            data_length,
            &[],
        );
        let timeout = self.config.lin_response_timeout;
        self.send_and_await(MessageId::LinHandleMessage, &request, timeout).await
    }

    /// Program or verify a LIN slave: stage `hexfile`, then run the PPM bootloader action.
    ///
    /// Any active mode is left first. PPM mode is switched off again whatever the outcome.
    pub async fn bootload_lin_slave(&mut self, hexfile: impl Into<Bytes>, params: &PpmBootloadParams) -> Result<()> {
        self.release_bulk_stream().await?;
        self.transfer_hex_file(hexfile).await?;

        info!(
            "PPM bootloader: {} {} at {} bit/s",
            params.operation, params.memory, params.bit_rate
        );
        let result = self.run_ppm_action(&params.to_payload()).await;
        let cleanup = self.vendor_command(VendorRequest::BootloaderPpm, 0).await;
        self.set_mode(Mode::None);

        match (result, cleanup) {
            (Err(e), Err(cleanup_err)) => {
                warn!("Disabling PPM mode after failure also failed: {}", cleanup_err);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), Err(cleanup_err)) => Err(cleanup_err),
            (Ok(()), Ok(())) => {
                info!("PPM bootloader action finished");
                Ok(())
            }
        }
    }

    async fn run_ppm_action(&mut self, payload: &[u8]) -> Result<()> {
        self.enter_mode(Mode::Bootloader).await?;
        self.vendor_command(VendorRequest::BootloaderPpm, 1).await?;
        let timeout = self.config.bootload_response_timeout;
        self.send_and_await(MessageId::PpmDoBootloaderAction, payload, timeout)
            .await?;
        Ok(())
    }
}
