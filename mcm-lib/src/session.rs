//! The device session: sole owner of the USB connection to one MCM.
//!
//! A [`Session`] opens the transport on demand, finds the vendor interface and its
//! bulk endpoints, wraps the raw transfers with the MCM's error conventions and
//! tracks which [`Mode`] currently owns the bulk IN stream.
//!
//! Exchanges are strictly sequential. The only concurrent activity is the optional
//! background bulk receiver (see [`Session::start_bulk_receiver`]).

use crate::config::SessionConfig;
use crate::constants::{DEFAULT_CONFIGURATION, VENDOR_SPECIFIC_CLASS, VendorRequest};
use crate::error::{McmError, Result, TransportError};
use crate::frame::{self, FrameDecoder};
use crate::lines::LineBuffer;
use crate::receiver::BulkReceiver;
use crate::transport::{
    ControlSetup, Direction, EndpointDescriptor, EndpointKind, InTransfer, InterfaceDescriptor, OutTransfer,
    TransferStatus, UsbTransport,
};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use strum_macros::Display;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Which protocol currently owns the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum Mode {
    #[default]
    None,
    Lin,
    BareUart,
    Bootloader,
    HexTransfer,
    Upgrading,
    Error,
}

/// Vendor interface and bulk endpoints found on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VendorEndpoints {
    pub interface: u8,
    pub ep_in: EndpointDescriptor,
    pub ep_out: EndpointDescriptor,
}

/// Find the vendor class interface and its IN and OUT bulk endpoints.
pub fn detect_vendor_endpoints(interfaces: &[InterfaceDescriptor]) -> Result<VendorEndpoints> {
    let iface = interfaces
        .iter()
        .find(|iface| iface.class == VENDOR_SPECIFIC_CLASS)
        .ok_or_else(|| McmError::EndpointDetectionFailed("no interface with vendor class 0xFF".to_string()))?;

    let find = |direction: Direction| {
        iface
            .endpoints
            .iter()
            .find(|ep| ep.direction == direction && ep.kind == EndpointKind::Bulk)
            .copied()
    };

    match (find(Direction::In), find(Direction::Out)) {
        (Some(ep_in), Some(ep_out)) => Ok(VendorEndpoints {
            interface: iface.number,
            ep_in,
            ep_out,
        }),
        _ => Err(McmError::EndpointDetectionFailed(format!(
            "interface {} lacks bulk IN and OUT endpoints",
            iface.number
        ))),
    }
}

/// Lets the platform report that the physical device is gone.
///
/// Obtained from [`Session::select_device`]; cheap to clone and safe to call from any task.
#[derive(Debug, Clone)]
pub struct DeviceRemoval {
    removed: Arc<AtomicBool>,
    mode: Arc<watch::Sender<Mode>>,
}

impl DeviceRemoval {
    pub fn notify(&self) {
        if !self.removed.swap(true, Ordering::SeqCst) {
            warn!("MCM device removed");
            self.mode.send_replace(Mode::None);
        }
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }
}

pub struct Session<T: UsbTransport> {
    pub(crate) device: Option<Arc<T>>,
    pub(crate) removal: DeviceRemoval,
    pub(crate) endpoints: Option<VendorEndpoints>,
    pub(crate) mode: Arc<watch::Sender<Mode>>,
    pub(crate) receiver: Option<BulkReceiver>,
    decoder: FrameDecoder,
    pub(crate) config: SessionConfig,
}

impl<T: UsbTransport> Default for Session<T> {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl<T: UsbTransport> Session<T> {
    pub fn new(config: SessionConfig) -> Self {
        let mode = Arc::new(watch::Sender::new(Mode::None));
        Self {
            device: None,
            removal: DeviceRemoval {
                removed: Arc::new(AtomicBool::new(false)),
                mode: mode.clone(),
            },
            endpoints: None,
            mode,
            receiver: None,
            decoder: FrameDecoder::new(),
            config,
        }
    }

    /// Make `device` the session's transport, tearing down any previous one.
    ///
    /// The returned handle must be fired by whoever watches for hot-unplug.
    pub async fn select_device(&mut self, device: Arc<T>) -> DeviceRemoval {
        if let Err(e) = self.dispose().await {
            warn!("Failed to release previous device cleanly: {}", e);
        }
        self.removal = DeviceRemoval {
            removed: Arc::new(AtomicBool::new(false)),
            mode: self.mode.clone(),
        };
        self.device = Some(device);
        self.removal.clone()
    }

    pub fn removal_handle(&self) -> DeviceRemoval {
        self.removal.clone()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_selected(&self) -> bool {
        self.device.is_some() && !self.removal.is_removed()
    }

    pub fn is_connected(&self) -> bool {
        self.is_selected() && self.endpoints.is_some() && self.device.as_ref().is_some_and(|d| d.is_open())
    }

    pub fn endpoints(&self) -> Option<VendorEndpoints> {
        self.endpoints
    }

    pub fn mode(&self) -> Mode {
        *self.mode.borrow()
    }

    /// Observe mode changes, e.g. to drive a UI.
    pub fn subscribe_mode(&self) -> watch::Receiver<Mode> {
        self.mode.subscribe()
    }

    pub(crate) fn set_mode(&self, mode: Mode) {
        let previous = self.mode.send_replace(mode);
        if previous != mode {
            info!("Mode {} -> {}", previous, mode);
        }
    }

    /// Connect and switch to `mode`. Keeps "mode set implies connected" true.
    pub(crate) async fn enter_mode(&mut self, mode: Mode) -> Result<()> {
        self.connect().await?;
        self.set_mode(mode);
        Ok(())
    }

    /// The transport, unless none was selected or the device has been removed.
    pub(crate) fn transport(&mut self) -> Result<Arc<T>> {
        if self.removal.is_removed() && self.device.is_some() {
            info!("Dropping transport of removed device");
            self.device = None;
            self.endpoints = None;
            self.decoder.clear();
        }
        self.device.clone().ok_or(McmError::NoDeviceSelected)
    }

    fn link(&mut self) -> Result<(Arc<T>, VendorEndpoints)> {
        let device = self.transport()?;
        let endpoints = self
            .endpoints
            .ok_or_else(|| McmError::EndpointDetectionFailed("session is not connected".to_string()))?;
        Ok((device, endpoints))
    }

    /// Open the device, select a configuration and claim the vendor interface.
    ///
    /// Does nothing when already connected.
    pub async fn connect(&mut self) -> Result<()> {
        let device = self.transport()?;
        if device.is_open() && self.endpoints.is_some() {
            return Ok(());
        }

        if !device.is_open() {
            info!("Opening MCM device");
            device.open().await?;
        }
        if device.active_configuration().is_none() {
            info!("Selecting configuration {}", DEFAULT_CONFIGURATION);
            device.select_configuration(DEFAULT_CONFIGURATION).await?;
        }

        let endpoints = detect_vendor_endpoints(&device.interfaces()?)?;
        info!(
            "Vendor interface {}: IN 0x{:02X} ({} B), OUT 0x{:02X} ({} B)",
            endpoints.interface,
            endpoints.ep_in.address,
            endpoints.ep_in.max_packet_size,
            endpoints.ep_out.address,
            endpoints.ep_out.max_packet_size
        );

        match device.claim_interface(endpoints.interface).await {
            Ok(()) => info!("Interface {} claimed", endpoints.interface),
            Err(TransportError::AlreadyClaimed(number)) => debug!("Interface {} was already claimed", number),
            Err(e) => return Err(e.into()),
        }
        self.endpoints = Some(endpoints);
        Ok(())
    }

    /// Stop the receiver, release the interface and close the transport.
    ///
    /// Idempotent. State is cleared even if releasing fails; the first failure is returned.
    pub async fn disconnect(&mut self) -> Result<()> {
        self.stop_bulk_receiver().await;

        let mut result = Ok(());
        if let Some(device) = self.device.clone().filter(|d| d.is_open()) {
            if let Some(endpoints) = self.endpoints {
                if let Err(e) = device.release_interface(endpoints.interface).await {
                    warn!("Failed to release interface {}: {}", endpoints.interface, e);
                    result = Err(e.into());
                }
            }
            if let Err(e) = device.close().await {
                warn!("Failed to close device: {}", e);
                if result.is_ok() {
                    result = Err(e.into());
                }
            }
            info!("Disconnected from MCM");
        }

        self.endpoints = None;
        self.decoder.clear();
        self.set_mode(Mode::None);
        result
    }

    /// Disconnect and forget the device.
    pub async fn dispose(&mut self) -> Result<()> {
        let result = self.disconnect().await;
        self.device = None;
        result
    }

    /// Read up to `length` bytes from the vendor bulk IN endpoint.
    pub async fn vendor_transfer_in(&mut self, length: usize) -> Result<Bytes> {
        self.connect().await?;
        let (device, endpoints) = self.link()?;
        let transfer = device.transfer_in(endpoints.ep_in.address, length).await?;
        finish_in(device.as_ref(), transfer, endpoints.ep_in.address).await
    }

    /// Write `data` to the vendor bulk OUT endpoint.
    pub async fn vendor_transfer_out(&mut self, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        self.connect().await?;
        let (device, endpoints) = self.link()?;
        let expected = data.len();
        let transfer = device.transfer_out(endpoints.ep_out.address, data).await?;
        finish_out(device.as_ref(), transfer, expected, endpoints.ep_out.address).await
    }

    pub async fn vendor_control_transfer_in(
        &mut self,
        request: VendorRequest,
        value: u16,
        length: u16,
    ) -> Result<Bytes> {
        self.connect().await?;
        let (device, endpoints) = self.link()?;
        let setup = control_setup(request, value, endpoints.interface);
        let transfer = device.control_transfer_in(setup, length).await?;
        finish_in(device.as_ref(), transfer, endpoints.ep_in.address).await
    }

    pub async fn vendor_control_transfer_out(
        &mut self,
        request: VendorRequest,
        value: u16,
        data: impl Into<Bytes>,
    ) -> Result<()> {
        let data = data.into();
        self.connect().await?;
        let (device, endpoints) = self.link()?;
        let setup = control_setup(request, value, endpoints.interface);
        let expected = data.len();
        let transfer = device.control_transfer_out(setup, data).await?;
        finish_out(device.as_ref(), transfer, expected, endpoints.ep_out.address).await
    }

    /// Control OUT request without a data stage.
    pub async fn vendor_command(&mut self, request: VendorRequest, value: u16) -> Result<()> {
        self.vendor_control_transfer_out(request, value, Bytes::new()).await
    }

    /// Send one framed request and wait for the matching framed response.
    ///
    /// Returns the response payload. Only one exchange may be outstanding at a time and
    /// none while the background receiver owns the bulk IN stream.
    pub async fn send_and_await(
        &mut self,
        command: impl Into<u16>,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Bytes> {
        if self.is_receiver_running() {
            return Err(McmError::BulkStreamBusy);
        }
        let command = command.into();
        let request = frame::encode(command, payload)?;
        debug!(bytes = hex::encode(&request), "Framed request 0x{:04X}", command);

        self.decoder.clear();
        self.vendor_transfer_out(request).await?;

        let response = tokio::time::timeout(timeout, self.read_frame())
            .await
            .map_err(|_| McmError::ResponseTimeout)??;
        debug!(bytes = hex::encode(&response), "Framed response");
        frame::validate(response, command)
    }

    async fn read_frame(&mut self) -> Result<Bytes> {
        let read_len = self.config.bulk_read_len;
        let poll = self.config.line_poll_interval;
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                return Ok(frame);
            }
            let chunk = self.vendor_transfer_in(read_len).await?;
            if chunk.is_empty() {
                tokio::time::sleep(poll).await;
            } else {
                self.decoder.push(&chunk);
            }
        }
    }

    /// Read bulk IN data into `lines` until a complete line is available.
    pub(crate) async fn wait_for_line(&mut self, lines: &mut LineBuffer, timeout: Duration) -> Result<String> {
        if self.is_receiver_running() {
            return Err(McmError::BulkStreamBusy);
        }
        let read_len = self.config.bulk_read_len;
        let poll = self.config.line_poll_interval;
        let wait = async {
            loop {
                if let Some(line) = lines.next_line() {
                    debug!(line, "Line received");
                    return Ok::<_, McmError>(line);
                }
                let chunk = self.vendor_transfer_in(read_len).await?;
                if chunk.is_empty() {
                    tokio::time::sleep(poll).await;
                } else {
                    lines.push(&chunk);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| McmError::ResponseTimeout)?
    }

    /// Return to [`Mode::None`], undoing whatever the current mode switched on.
    ///
    /// In [`Mode::Error`] the mode the receiver was started for decides the teardown.
    pub async fn leave_mode(&mut self) -> Result<()> {
        let mode = match (self.mode(), &self.receiver) {
            (Mode::Error, Some(receiver)) => receiver.mode(),
            (mode, _) => mode,
        };
        match mode {
            Mode::None => Ok(()),
            Mode::Lin => self.lin_teardown().await,
            Mode::BareUart => self.disable_bare_uart().await,
            _ => {
                self.stop_bulk_receiver().await;
                self.set_mode(Mode::None);
                Ok(())
            }
        }
    }

    /// Leave any active mode so a chunked protocol can own the bulk stream.
    pub(crate) async fn release_bulk_stream(&mut self) -> Result<()> {
        if self.mode() != Mode::None || self.is_receiver_running() {
            info!("Leaving mode {} before taking over the bulk stream", self.mode());
            self.leave_mode().await?;
        }
        Ok(())
    }
}

impl<T: UsbTransport> Drop for Session<T> {
    fn drop(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            receiver.abort();
        }
    }
}

fn control_setup(request: VendorRequest, value: u16, interface: u8) -> ControlSetup {
    ControlSetup {
        request: request.into(),
        value,
        index: u16::from(interface),
    }
}

async fn clear_halt_after_stall<T: UsbTransport>(device: &T, direction: Direction, endpoint: u8) -> McmError {
    warn!("Endpoint 0x{:02X} stalled, clearing halt", endpoint);
    if let Err(e) = device.clear_halt(direction, endpoint).await {
        warn!("Clearing halt on 0x{:02X} failed: {}", endpoint, e);
    }
    McmError::DeviceSignalledError
}

async fn finish_in<T: UsbTransport>(device: &T, transfer: InTransfer, endpoint: u8) -> Result<Bytes> {
    match transfer.status {
        TransferStatus::Ok => Ok(transfer.data),
        TransferStatus::Stall => Err(clear_halt_after_stall(device, Direction::In, endpoint).await),
        TransferStatus::Babble => Err(McmError::UnexpectedDataVolume),
        TransferStatus::Other => Err(McmError::UnexpectedTransferStatus("transfer in failed".to_string())),
    }
}

async fn finish_out<T: UsbTransport>(
    device: &T,
    transfer: OutTransfer,
    expected: usize,
    endpoint: u8,
) -> Result<()> {
    match transfer.status {
        TransferStatus::Ok if transfer.bytes_written == expected => Ok(()),
        TransferStatus::Ok => Err(McmError::IncompleteWrite {
            written: transfer.bytes_written,
            expected,
        }),
        TransferStatus::Stall => Err(clear_halt_after_stall(device, Direction::Out, endpoint).await),
        status => Err(McmError::UnexpectedTransferStatus(format!("transfer out gave {:?}", status))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(address: u8, direction: Direction) -> EndpointDescriptor {
        EndpointDescriptor {
            address,
            direction,
            kind: EndpointKind::Bulk,
            max_packet_size: 64,
        }
    }

    #[test]
    fn picks_vendor_interface() {
        let interfaces = vec![
            InterfaceDescriptor {
                number: 0,
                class: 0x02,
                endpoints: vec![bulk(0x83, Direction::In)],
            },
            InterfaceDescriptor {
                number: 2,
                class: 0xFF,
                endpoints: vec![bulk(0x81, Direction::In), bulk(0x01, Direction::Out)],
            },
        ];
        let found = detect_vendor_endpoints(&interfaces).unwrap();
        assert_eq!(found.interface, 2);
        assert_eq!(found.ep_in.address, 0x81);
        assert_eq!(found.ep_out.address, 0x01);
    }

    #[test]
    fn vendor_interface_without_out_endpoint_fails() {
        let interfaces = vec![InterfaceDescriptor {
            number: 0,
            class: 0xFF,
            endpoints: vec![bulk(0x81, Direction::In)],
        }];
        assert!(matches!(
            detect_vendor_endpoints(&interfaces),
            Err(McmError::EndpointDetectionFailed(_))
        ));
    }

    #[test]
    fn no_vendor_interface_fails() {
        assert!(matches!(
            detect_vendor_endpoints(&[]),
            Err(McmError::EndpointDetectionFailed(_))
        ));
    }

    #[test]
    fn interrupt_endpoints_are_ignored() {
        let mut ep_in = bulk(0x82, Direction::In);
        ep_in.kind = EndpointKind::Interrupt;
        let interfaces = vec![InterfaceDescriptor {
            number: 1,
            class: 0xFF,
            endpoints: vec![ep_in, bulk(0x02, Direction::Out)],
        }];
        assert!(detect_vendor_endpoints(&interfaces).is_err());
    }
}
