//! [`UsbTransport`] backed by `nusb`.

use crate::constants::VENDOR_SPECIFIC_CLASS;
use crate::error::TransportError;
use crate::session::DeviceRemoval;
use crate::transport::{
    ControlSetup, Direction, EndpointDescriptor, EndpointKind, InTransfer, InterfaceDescriptor, OutTransfer,
    TransferStatus, UsbTransport,
};
use bytes::Bytes;
use futures_lite::StreamExt;
use nusb::hotplug::HotplugEvent;
use nusb::transfer::{
    Completion, ControlIn, ControlOut, ControlType, EndpointType, Recipient, RequestBuffer, ResponseBuffer,
    TransferError,
};
use nusb::{DeviceInfo, Interface};
use serde::Serialize;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What `list` shows about an attached MCM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSummary {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub device_address: u8,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

/// Attached devices exposing a vendor class interface, optionally filtered by VID/PID.
pub fn list_mcm_devices(vendor_id: Option<u16>, product_id: Option<u16>) -> Result<Vec<NusbTransport>, TransportError> {
    let devices = nusb::list_devices()?
        .filter(|d| vendor_id.is_none_or(|vid| d.vendor_id() == vid))
        .filter(|d| product_id.is_none_or(|pid| d.product_id() == pid))
        .filter(|d| d.interfaces().any(|i| i.class() == VENDOR_SPECIFIC_CLASS))
        .map(NusbTransport::new)
        .collect::<Vec<_>>();
    debug!("Found {} MCM candidate(s)", devices.len());
    Ok(devices)
}

struct Opened {
    device: nusb::Device,
    interfaces: HashMap<u8, Interface>,
    /// Endpoint address to the claimed interface that owns it
    endpoint_owner: HashMap<u8, u8>,
}

pub struct NusbTransport {
    info: DeviceInfo,
    state: Mutex<Option<Opened>>,
    closed: Notify,
}

impl NusbTransport {
    pub fn new(info: DeviceInfo) -> Self {
        Self {
            info,
            state: Mutex::new(None),
            closed: Notify::new(),
        }
    }

    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            vendor_id: self.info.vendor_id(),
            product_id: self.info.product_id(),
            bus_number: self.info.bus_number(),
            device_address: self.info.device_address(),
            manufacturer: self.info.manufacturer_string().map(str::to_string),
            product: self.info.product_string().map(str::to_string),
            serial_number: self.info.serial_number().map(str::to_string),
        }
    }

    /// Fire `removal` when this device is unplugged.
    pub fn watch_removal(&self, removal: DeviceRemoval) -> Result<JoinHandle<()>, TransportError> {
        let id = self.info.id();
        let mut events = nusb::watch_devices()?;
        Ok(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let HotplugEvent::Disconnected(gone) = event {
                    if gone == id {
                        removal.notify();
                        break;
                    }
                }
            }
        }))
    }

    fn lock(&self) -> MutexGuard<'_, Option<Opened>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn device(&self) -> Result<nusb::Device, TransportError> {
        self.lock()
            .as_ref()
            .map(|o| o.device.clone())
            .ok_or(TransportError::NotOpen)
    }

    fn interface(&self, number: u8) -> Result<Interface, TransportError> {
        let state = self.lock();
        let opened = state.as_ref().ok_or(TransportError::NotOpen)?;
        opened
            .interfaces
            .get(&number)
            .cloned()
            .ok_or_else(|| TransportError::Usb(std::io::Error::other(format!("interface {} not claimed", number))))
    }

    fn endpoint_interface(&self, endpoint: u8) -> Result<Interface, TransportError> {
        let number = {
            let state = self.lock();
            let opened = state.as_ref().ok_or(TransportError::NotOpen)?;
            *opened.endpoint_owner.get(&endpoint).ok_or_else(|| {
                TransportError::Usb(std::io::Error::other(format!(
                    "endpoint 0x{:02X} not on a claimed interface",
                    endpoint
                )))
            })?
        };
        self.interface(number)
    }
}

fn descriptors(device: &nusb::Device) -> Vec<InterfaceDescriptor> {
    let Ok(config) = device.active_configuration() else {
        return Vec::new();
    };
    config
        .interface_alt_settings()
        .filter(|alt| alt.alternate_setting() == 0)
        .map(|alt| InterfaceDescriptor {
            number: alt.interface_number(),
            class: alt.class(),
            endpoints: alt
                .endpoints()
                .map(|ep| EndpointDescriptor {
                    address: ep.address(),
                    direction: match ep.direction() {
                        nusb::transfer::Direction::In => Direction::In,
                        nusb::transfer::Direction::Out => Direction::Out,
                    },
                    kind: match ep.transfer_type() {
                        EndpointType::Control => EndpointKind::Control,
                        EndpointType::Isochronous => EndpointKind::Isochronous,
                        EndpointType::Bulk => EndpointKind::Bulk,
                        EndpointType::Interrupt => EndpointKind::Interrupt,
                    },
                    max_packet_size: ep.max_packet_size(),
                })
                .collect(),
        })
        .collect()
}

fn status_of(error: TransferError) -> Result<TransferStatus, TransportError> {
    match error {
        TransferError::Stall => Ok(TransferStatus::Stall),
        TransferError::Disconnected => Err(TransportError::Disconnected),
        TransferError::Cancelled => Err(TransportError::Cancelled),
        _ => Ok(TransferStatus::Other),
    }
}

fn finish_in(completion: Completion<Vec<u8>>) -> Result<InTransfer, TransportError> {
    match completion.status {
        Ok(()) => Ok(InTransfer::ok(completion.data)),
        Err(e) => Ok(InTransfer::failed(status_of(e)?)),
    }
}

fn finish_out(completion: Completion<ResponseBuffer>) -> Result<OutTransfer, TransportError> {
    match completion.status {
        Ok(()) => Ok(OutTransfer::ok(completion.data.actual_length())),
        Err(e) => Ok(OutTransfer::failed(status_of(e)?)),
    }
}

impl UsbTransport for NusbTransport {
    fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    async fn open(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.is_none() {
            info!(
                "Opening device {:04X}:{:04X} on bus {} addr {}",
                self.info.vendor_id(),
                self.info.product_id(),
                self.info.bus_number(),
                self.info.device_address()
            );
            *state = Some(Opened {
                device: self.info.open()?,
                interfaces: HashMap::new(),
                endpoint_owner: HashMap::new(),
            });
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let opened = self.lock().take();
        if opened.is_some() {
            self.closed.notify_waiters();
            debug!("Device closed");
        }
        Ok(())
    }

    fn active_configuration(&self) -> Option<u8> {
        let device = self.device().ok()?;
        let value = device.active_configuration().ok()?.configuration_value();
        (value != 0).then_some(value)
    }

    async fn select_configuration(&self, value: u8) -> Result<(), TransportError> {
        Ok(self.device()?.set_configuration(value)?)
    }

    fn interfaces(&self) -> Result<Vec<InterfaceDescriptor>, TransportError> {
        Ok(descriptors(&self.device()?))
    }

    async fn claim_interface(&self, number: u8) -> Result<(), TransportError> {
        let mut state = self.lock();
        let opened = state.as_mut().ok_or(TransportError::NotOpen)?;
        if opened.interfaces.contains_key(&number) {
            return Err(TransportError::AlreadyClaimed(number));
        }
        let interface = opened.device.claim_interface(number).map_err(|e| match e.kind() {
            ErrorKind::ResourceBusy => TransportError::AlreadyClaimed(number),
            _ => TransportError::Usb(e),
        })?;
        for iface in descriptors(&opened.device).iter().filter(|i| i.number == number) {
            for ep in &iface.endpoints {
                opened.endpoint_owner.insert(ep.address, number);
            }
        }
        opened.interfaces.insert(number, interface);
        Ok(())
    }

    async fn release_interface(&self, number: u8) -> Result<(), TransportError> {
        let mut state = self.lock();
        let opened = state.as_mut().ok_or(TransportError::NotOpen)?;
        opened.interfaces.remove(&number);
        opened.endpoint_owner.retain(|_, owner| *owner != number);
        Ok(())
    }

    async fn control_transfer_in(&self, setup: ControlSetup, length: u16) -> Result<InTransfer, TransportError> {
        let closed = self.closed.notified();
        let interface = self.interface(setup.index as u8)?;
        let request = ControlIn {
            control_type: ControlType::Class,
            recipient: Recipient::Interface,
            request: setup.request,
            value: setup.value,
            index: setup.index,
            length,
        };
        tokio::select! {
            completion = interface.control_in(request) => finish_in(completion),
            _ = closed => Err(TransportError::Cancelled),
        }
    }

    async fn control_transfer_out(&self, setup: ControlSetup, data: Bytes) -> Result<OutTransfer, TransportError> {
        let closed = self.closed.notified();
        let interface = self.interface(setup.index as u8)?;
        let request = ControlOut {
            control_type: ControlType::Class,
            recipient: Recipient::Interface,
            request: setup.request,
            value: setup.value,
            index: setup.index,
            data: &data,
        };
        tokio::select! {
            completion = interface.control_out(request) => finish_out(completion),
            _ = closed => Err(TransportError::Cancelled),
        }
    }

    async fn transfer_in(&self, endpoint: u8, length: usize) -> Result<InTransfer, TransportError> {
        let closed = self.closed.notified();
        let interface = self.endpoint_interface(endpoint)?;
        tokio::select! {
            completion = interface.bulk_in(endpoint, RequestBuffer::new(length)) => finish_in(completion),
            _ = closed => Err(TransportError::Cancelled),
        }
    }

    async fn transfer_out(&self, endpoint: u8, data: Bytes) -> Result<OutTransfer, TransportError> {
        let closed = self.closed.notified();
        let interface = self.endpoint_interface(endpoint)?;
        tokio::select! {
            completion = interface.bulk_out(endpoint, data.to_vec()) => finish_out(completion),
            _ = closed => Err(TransportError::Cancelled),
        }
    }

    async fn clear_halt(&self, direction: Direction, endpoint: u8) -> Result<(), TransportError> {
        let interface = self.endpoint_interface(endpoint)?;
        let expected = if endpoint & 0x80 != 0 { Direction::In } else { Direction::Out };
        if expected != direction {
            warn!("Clearing halt on 0x{:02X} with mismatched direction {:?}", endpoint, direction);
        }
        Ok(interface.clear_halt(endpoint)?)
    }
}
