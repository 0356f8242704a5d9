//! Bare-UART pass-through and bootloading of UART attached chips.

use crate::constants::VendorRequest;
use crate::error::{McmError, Result};
use crate::lin::{Memory, Operation};
use crate::session::{Mode, Session};
use crate::transport::UsbTransport;
use bytes::{Buf, Bytes, BytesMut};
use num_enum::IntoPrimitive;
use strum_macros::Display;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, IntoPrimitive, Display)]
#[repr(u8)]
pub enum DataBits {
    #[strum(to_string = "5")]
    Five = 0,
    #[strum(to_string = "6")]
    Six = 1,
    #[strum(to_string = "7")]
    Seven = 2,
    #[default]
    #[strum(to_string = "8")]
    Eight = 3,
}

impl TryFrom<u8> for DataBits {
    type Error = McmError;

    /// From the number of data bits, 5 to 8.
    fn try_from(bits: u8) -> Result<Self> {
        match bits {
            5 => Ok(DataBits::Five),
            6 => Ok(DataBits::Six),
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            other => Err(McmError::InvalidResponse(format!("unsupported data bits {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, IntoPrimitive, Display)]
#[repr(u8)]
pub enum StopBits {
    #[default]
    #[strum(to_string = "1")]
    One = 1,
    #[strum(to_string = "1.5")]
    OnePointFive = 2,
    #[strum(to_string = "2")]
    Two = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, IntoPrimitive, Display)]
#[repr(u8)]
pub enum Parity {
    #[default]
    Disabled = 0,
    Even = 2,
    Odd = 3,
}

/// Line settings for bare-UART mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BareUartConfig {
    pub bit_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub half_duplex: bool,
}

impl Default for BareUartConfig {
    fn default() -> Self {
        Self {
            bit_rate: 115_200,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::Disabled,
            half_duplex: false,
        }
    }
}

impl BareUartConfig {
    /// `bit_rate u32 LE | data_bits | stop_bits | parity | half_duplex`
    pub fn to_payload(&self) -> [u8; 8] {
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&self.bit_rate.to_le_bytes());
        payload[4] = self.data_bits.into();
        payload[5] = self.stop_bits.into();
        payload[6] = self.parity.into();
        payload[7] = u8::from(self.half_duplex);
        payload
    }
}

/// Receives bytes read from the UART.
///
/// `consume` sees everything not yet consumed and returns how many leading bytes it
/// used; the rest is offered again, extended, with the next delivery.
pub trait UartSink: Send + 'static {
    fn consume(&mut self, data: &[u8]) -> usize;
}

impl<F> UartSink for F
where
    F: FnMut(&[u8]) -> usize + Send + 'static,
{
    fn consume(&mut self, data: &[u8]) -> usize {
        self(data)
    }
}

/// Keeps the bytes a [`UartSink`] left unconsumed.
pub struct SinkBuffer<S> {
    sink: S,
    pending: BytesMut,
}

impl<S: UartSink> SinkBuffer<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            pending: BytesMut::new(),
        }
    }

    pub fn deliver(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        let consumed = self.sink.consume(&self.pending);
        if consumed > self.pending.len() {
            warn!(
                "UART sink claims {} bytes of {}, dropping all",
                consumed,
                self.pending.len()
            );
        }
        self.pending.advance(consumed.min(self.pending.len()));
    }

    pub fn pending(&self) -> &[u8] {
        &self.pending
    }
}

/// Parameters of a UART chip bootloader operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UartBootloadParams {
    pub bit_rate: u32,
    pub flash_keys: [u32; 4],
    pub manual_power: bool,
    pub full_duplex: bool,
    pub tx_pin: u8,
    pub memory: Memory,
    pub operation: Operation,
}

impl Default for UartBootloadParams {
    fn default() -> Self {
        Self {
            bit_rate: 115_200,
            flash_keys: [0; 4],
            manual_power: false,
            full_duplex: false,
            tx_pin: 0,
            memory: Memory::Flash,
            operation: Operation::Program,
        }
    }
}

impl UartBootloadParams {
    /// `bit_rate | flash_keys[4] | manual_power | full_duplex | tx_pin | memory | operation | 3 reserved`
    pub fn to_payload(&self) -> [u8; 28] {
        let mut payload = [0u8; 28];
        payload[..4].copy_from_slice(&self.bit_rate.to_le_bytes());
        for (i, key) in self.flash_keys.iter().enumerate() {
            let at = 4 + i * 4;
            payload[at..at + 4].copy_from_slice(&key.to_le_bytes());
        }
        payload[20] = u8::from(self.manual_power);
        payload[21] = u8::from(self.full_duplex);
        payload[22] = self.tx_pin;
        payload[23] = self.memory.code();
        payload[24] = self.operation.code();
        payload
    }
}

impl<T: UsbTransport> Session<T> {
    /// Switch to bare-UART mode and stream every received byte to `sink`.
    pub async fn enable_bare_uart<S: UartSink>(&mut self, config: &BareUartConfig, sink: S) -> Result<()> {
        if self.is_receiver_running() {
            return Err(McmError::ReceiverAlreadyRunning);
        }
        self.connect().await?;
        info!(
            "Enabling bare UART: {} bit/s, {} data bits, parity {}, {} stop bits{}",
            config.bit_rate,
            config.data_bits,
            config.parity,
            config.stop_bits,
            if config.half_duplex { " half duplex" } else { "" }
        );
        self.vendor_control_transfer_out(VendorRequest::BareUartMode, 1, config.to_payload().to_vec())
            .await?;

        let mut buffer = SinkBuffer::new(sink);
        let started = self
            .start_bulk_receiver(Mode::BareUart, move |chunk| buffer.deliver(&chunk))
            .await;
        if let Err(e) = started {
            if let Err(cleanup_err) = self.vendor_command(VendorRequest::BareUartMode, 0).await {
                debug!("Disabling bare UART after failed start: {}", cleanup_err);
            }
            self.set_mode(Mode::None);
            return Err(e);
        }
        Ok(())
    }

    /// Stop streaming and leave bare-UART mode. The mode is [`Mode::None`] afterwards.
    pub async fn disable_bare_uart(&mut self) -> Result<()> {
        self.stop_bulk_receiver().await;
        let result = self.vendor_command(VendorRequest::BareUartMode, 0).await;
        self.set_mode(Mode::None);
        if result.is_ok() {
            info!("Bare UART disabled");
        }
        result
    }

    /// Transmit `data` on the UART.
    pub async fn write_bare_uart(&mut self, data: impl Into<Bytes>) -> Result<()> {
        match self.mode() {
            Mode::BareUart | Mode::Error if self.is_receiver_running() => self.vendor_transfer_out(data).await,
            actual => Err(McmError::ModeMismatch {
                expected: Mode::BareUart,
                actual,
            }),
        }
    }

    /// Program or verify a chip on the UART: stage `hexfile`, then run the UART bootloader.
    pub async fn bootload_uart_chip(&mut self, hexfile: impl Into<Bytes>, params: &UartBootloadParams) -> Result<()> {
        self.release_bulk_stream().await?;
        self.transfer_hex_file(hexfile).await?;

        info!(
            "UART bootloader: {} {} at {} bit/s",
            params.operation, params.memory, params.bit_rate
        );
        let result = self.run_uart_bootload(&params.to_payload()).await;
        if let Err(e) = &result {
            warn!("UART bootload failed: {}", e);
        }
        self.set_mode(Mode::None);
        result
    }

    async fn run_uart_bootload(&mut self, payload: &[u8; 28]) -> Result<()> {
        self.enter_mode(Mode::Bootloader).await?;
        self.vendor_control_transfer_out(VendorRequest::BootloaderDo, 0, payload.to_vec())
            .await?;
        let timeout = self.config.hex_processing_timeout;
        self.wait_for_ok(timeout).await
    }
}
