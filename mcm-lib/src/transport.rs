//! Capability surface over a physical USB device.
//!
//! The session never talks to a USB stack directly. Everything it needs from the
//! platform goes through [`UsbTransport`], which keeps the protocol engine testable
//! without hardware. [`NusbTransport`](crate::usb::NusbTransport) is the production
//! implementation.

use crate::error::TransportError;
use bytes::Bytes;
use std::future::Future;

/// Direction of an endpoint or transfer, seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// Transfer type of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// Full endpoint address, including the direction bit.
    pub address: u8,
    pub direction: Direction,
    pub kind: EndpointKind,
    pub max_packet_size: usize,
}

/// Active alternate setting of one interface of the current configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub class: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

/// Completion status of a control or bulk transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Ok,
    /// The device halted the endpoint to signal an error.
    Stall,
    /// The device sent more data than was requested.
    Babble,
    /// Any other platform specific failure status.
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InTransfer {
    pub status: TransferStatus,
    pub data: Bytes,
}

impl InTransfer {
    pub fn ok(data: impl Into<Bytes>) -> Self {
        Self {
            status: TransferStatus::Ok,
            data: data.into(),
        }
    }

    pub fn failed(status: TransferStatus) -> Self {
        Self { status, data: Bytes::new() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutTransfer {
    pub status: TransferStatus,
    pub bytes_written: usize,
}

impl OutTransfer {
    pub fn ok(bytes_written: usize) -> Self {
        Self {
            status: TransferStatus::Ok,
            bytes_written,
        }
    }

    pub fn failed(status: TransferStatus) -> Self {
        Self {
            status,
            bytes_written: 0,
        }
    }
}

/// Setup packet fields of a class/interface control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

/// Operations a platform must provide for one USB device.
///
/// Every method takes `&self`: the background bulk receiver issues `transfer_in`
/// while the session keeps using the other primitives, and `close` must be callable
/// while a transfer is pending so that it can abort it.
pub trait UsbTransport: Send + Sync + 'static {
    fn is_open(&self) -> bool;

    fn open(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Close the device. Pending transfers resolve with [`TransportError::Cancelled`].
    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Value of the active configuration, `None` when the device is unconfigured.
    fn active_configuration(&self) -> Option<u8>;

    fn select_configuration(&self, value: u8) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Interfaces of the active configuration.
    fn interfaces(&self) -> Result<Vec<InterfaceDescriptor>, TransportError>;

    fn claim_interface(&self, number: u8) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn release_interface(&self, number: u8) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn control_transfer_in(
        &self,
        setup: ControlSetup,
        length: u16,
    ) -> impl Future<Output = Result<InTransfer, TransportError>> + Send;

    fn control_transfer_out(
        &self,
        setup: ControlSetup,
        data: Bytes,
    ) -> impl Future<Output = Result<OutTransfer, TransportError>> + Send;

    fn transfer_in(&self, endpoint: u8, length: usize)
    -> impl Future<Output = Result<InTransfer, TransportError>> + Send;

    fn transfer_out(&self, endpoint: u8, data: Bytes)
    -> impl Future<Output = Result<OutTransfer, TransportError>> + Send;

    fn clear_halt(&self, direction: Direction, endpoint: u8)
    -> impl Future<Output = Result<(), TransportError>> + Send;
}
