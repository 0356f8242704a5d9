//! Common test utilities: a scripted in-memory transport

// Shared across test files; not every helper is used by each of them
#![allow(dead_code)]

use bytes::Bytes;
use mcm_lib::SessionConfig;
use mcm_lib::error::TransportError;
use mcm_lib::frame;
use mcm_lib::session::Session;
use mcm_lib::transport::{
    ControlSetup, Direction, EndpointDescriptor, EndpointKind, InTransfer, InterfaceDescriptor, OutTransfer,
    TransferStatus, UsbTransport,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

pub const VENDOR_INTERFACE: u8 = 1;
pub const EP_IN: u8 = 0x81;
pub const EP_OUT: u8 = 0x01;

/// Every primitive the session invoked, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open,
    Close,
    SelectConfiguration(u8),
    ClaimInterface(u8),
    ReleaseInterface(u8),
    ControlIn { request: u8, value: u16, index: u16, length: u16 },
    ControlOut { request: u8, value: u16, index: u16, data: Vec<u8> },
    TransferIn { endpoint: u8, length: usize },
    TransferOut { endpoint: u8, data: Vec<u8> },
    ClearHalt { direction: Direction, endpoint: u8 },
}

/// Scripted result of an IN transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InReply {
    Data(Vec<u8>),
    Status(TransferStatus),
    Disconnected,
}

/// Scripted result of an OUT transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutReply {
    Complete,
    Written(usize),
    Status(TransferStatus),
}

type Responder = Box<dyn FnMut(&Call) -> Vec<InReply> + Send>;

struct State {
    open: bool,
    configuration: Option<u8>,
    interfaces: Vec<InterfaceDescriptor>,
    claimed: HashSet<u8>,
    claim_reports_busy: bool,
    calls: Vec<Call>,
    bulk_in: VecDeque<InReply>,
    bulk_out: VecDeque<OutReply>,
    control_in: HashMap<(u8, u16), InReply>,
    control_out: HashMap<u8, OutReply>,
    control_out_value: HashMap<(u8, u16), OutReply>,
    responder: Option<Responder>,
}

pub struct FakeTransport {
    state: Mutex<State>,
    data_ready: Notify,
    closed: Notify,
}

fn bulk(address: u8, direction: Direction) -> EndpointDescriptor {
    EndpointDescriptor {
        address,
        direction,
        kind: EndpointKind::Bulk,
        max_packet_size: 64,
    }
}

/// A CDC interface next to the vendor interface, as on the real MCM.
pub fn mcm_interfaces() -> Vec<InterfaceDescriptor> {
    vec![
        InterfaceDescriptor {
            number: 0,
            class: 0x02,
            endpoints: vec![EndpointDescriptor {
                address: 0x83,
                direction: Direction::In,
                kind: EndpointKind::Interrupt,
                max_packet_size: 8,
            }],
        },
        InterfaceDescriptor {
            number: VENDOR_INTERFACE,
            class: 0xFF,
            endpoints: vec![bulk(EP_IN, Direction::In), bulk(EP_OUT, Direction::Out)],
        },
    ]
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Self::with_interfaces(mcm_interfaces())
    }

    pub fn with_interfaces(interfaces: Vec<InterfaceDescriptor>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                open: false,
                configuration: None,
                interfaces,
                claimed: HashSet::new(),
                claim_reports_busy: false,
                calls: Vec::new(),
                bulk_in: VecDeque::new(),
                bulk_out: VecDeque::new(),
                control_in: HashMap::new(),
                control_out: HashMap::new(),
                control_out_value: HashMap::new(),
                responder: None,
            }),
            data_ready: Notify::new(),
            closed: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn record(&self, call: Call) {
        let mut state = self.lock();
        let replies = match state.responder.as_mut() {
            Some(responder) => responder(&call),
            None => Vec::new(),
        };
        state.calls.push(call);
        let added = !replies.is_empty();
        state.bulk_in.extend(replies);
        drop(state);
        if added {
            self.data_ready.notify_waiters();
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Payloads of all bulk OUT transfers.
    pub fn bulk_writes(&self) -> Vec<Vec<u8>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::TransferOut { data, .. } => Some(data),
                _ => None,
            })
            .collect()
    }

    /// `(request, value, data)` of all control OUT transfers.
    pub fn control_outs(&self) -> Vec<(u8, u16, Vec<u8>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::ControlOut { request, value, data, .. } => Some((request, value, data)),
                _ => None,
            })
            .collect()
    }

    pub fn is_claimed(&self, number: u8) -> bool {
        self.lock().claimed.contains(&number)
    }

    pub fn push_in(&self, reply: InReply) {
        self.lock().bulk_in.push_back(reply);
        self.data_ready.notify_waiters();
    }

    pub fn push_data(&self, data: &[u8]) {
        self.push_in(InReply::Data(data.to_vec()));
    }

    pub fn push_line(&self, line: &str) {
        self.push_data(format!("{}\n", line).as_bytes());
    }

    pub fn push_frame(&self, command: u16, payload: &[u8]) {
        let encoded = frame::encode(command, payload).unwrap();
        self.push_data(&encoded);
    }

    pub fn pending_in(&self) -> usize {
        self.lock().bulk_in.len()
    }

    pub fn push_out_reply(&self, reply: OutReply) {
        self.lock().bulk_out.push_back(reply);
    }

    pub fn set_control_in(&self, request: u8, value: u16, reply: InReply) {
        self.lock().control_in.insert((request, value), reply);
    }

    pub fn set_control_out(&self, request: u8, reply: OutReply) {
        self.lock().control_out.insert(request, reply);
    }

    /// Like [`set_control_out`](Self::set_control_out) but only for one `value`.
    pub fn set_control_out_value(&self, request: u8, value: u16, reply: OutReply) {
        self.lock().control_out_value.insert((request, value), reply);
    }

    pub fn set_claim_busy(&self, busy: bool) {
        self.lock().claim_reports_busy = busy;
    }

    /// Queue IN replies in reaction to calls, like firmware answering requests.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&Call) -> Vec<InReply> + Send + 'static,
    {
        self.lock().responder = Some(Box::new(responder));
    }
}

fn out_result(reply: OutReply, len: usize) -> OutTransfer {
    match reply {
        OutReply::Complete => OutTransfer::ok(len),
        OutReply::Written(n) => OutTransfer::ok(n),
        OutReply::Status(status) => OutTransfer::failed(status),
    }
}

impl UsbTransport for FakeTransport {
    fn is_open(&self) -> bool {
        self.lock().open
    }

    async fn open(&self) -> Result<(), TransportError> {
        self.record(Call::Open);
        self.lock().open = true;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.record(Call::Close);
        {
            let mut state = self.lock();
            state.open = false;
            state.claimed.clear();
        }
        self.closed.notify_waiters();
        Ok(())
    }

    fn active_configuration(&self) -> Option<u8> {
        let state = self.lock();
        if state.open { state.configuration } else { None }
    }

    async fn select_configuration(&self, value: u8) -> Result<(), TransportError> {
        self.record(Call::SelectConfiguration(value));
        self.lock().configuration = Some(value);
        Ok(())
    }

    fn interfaces(&self) -> Result<Vec<InterfaceDescriptor>, TransportError> {
        Ok(self.lock().interfaces.clone())
    }

    async fn claim_interface(&self, number: u8) -> Result<(), TransportError> {
        self.record(Call::ClaimInterface(number));
        let mut state = self.lock();
        if state.claim_reports_busy {
            return Err(TransportError::AlreadyClaimed(number));
        }
        state.claimed.insert(number);
        Ok(())
    }

    async fn release_interface(&self, number: u8) -> Result<(), TransportError> {
        self.record(Call::ReleaseInterface(number));
        self.lock().claimed.remove(&number);
        Ok(())
    }

    async fn control_transfer_in(&self, setup: ControlSetup, length: u16) -> Result<InTransfer, TransportError> {
        self.record(Call::ControlIn {
            request: setup.request,
            value: setup.value,
            index: setup.index,
            length,
        });
        let reply = self.lock().control_in.get(&(setup.request, setup.value)).cloned();
        match reply {
            None => Ok(InTransfer::ok(Bytes::new())),
            Some(InReply::Data(data)) => Ok(InTransfer::ok(data)),
            Some(InReply::Status(status)) => Ok(InTransfer::failed(status)),
            Some(InReply::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    async fn control_transfer_out(&self, setup: ControlSetup, data: Bytes) -> Result<OutTransfer, TransportError> {
        let len = data.len();
        self.record(Call::ControlOut {
            request: setup.request,
            value: setup.value,
            index: setup.index,
            data: data.to_vec(),
        });
        let reply = {
            let state = self.lock();
            state
                .control_out_value
                .get(&(setup.request, setup.value))
                .or_else(|| state.control_out.get(&setup.request))
                .cloned()
        };
        Ok(out_result(reply.unwrap_or(OutReply::Complete), len))
    }

    async fn transfer_in(&self, endpoint: u8, length: usize) -> Result<InTransfer, TransportError> {
        self.record(Call::TransferIn { endpoint, length });
        loop {
            let ready = self.data_ready.notified();
            let closed = self.closed.notified();
            {
                let mut state = self.lock();
                if !state.open {
                    return Err(TransportError::NotOpen);
                }
                match state.bulk_in.pop_front() {
                    Some(InReply::Data(mut data)) => {
                        if data.len() > length {
                            let rest = data.split_off(length);
                            state.bulk_in.push_front(InReply::Data(rest));
                        }
                        return Ok(InTransfer::ok(data));
                    }
                    Some(InReply::Status(status)) => return Ok(InTransfer::failed(status)),
                    Some(InReply::Disconnected) => return Err(TransportError::Disconnected),
                    None => {}
                }
            }
            tokio::select! {
                _ = ready => {}
                _ = closed => return Err(TransportError::Cancelled),
            }
        }
    }

    async fn transfer_out(&self, endpoint: u8, data: Bytes) -> Result<OutTransfer, TransportError> {
        let len = data.len();
        let reply = self.lock().bulk_out.pop_front().unwrap_or(OutReply::Complete);
        if reply == OutReply::Complete {
            self.record(Call::TransferOut {
                endpoint,
                data: data.to_vec(),
            });
        } else {
            // failed writes must not trigger scripted answers
            self.lock().calls.push(Call::TransferOut {
                endpoint,
                data: data.to_vec(),
            });
        }
        Ok(out_result(reply, len))
    }

    async fn clear_halt(&self, direction: Direction, endpoint: u8) -> Result<(), TransportError> {
        self.record(Call::ClearHalt { direction, endpoint });
        Ok(())
    }
}

/// Short timings so paused-clock tests stay readable.
pub fn test_config() -> SessionConfig {
    SessionConfig::default()
        .with_receiver_timing(Duration::from_millis(200), Duration::from_millis(300))
        .with_line_poll_interval(Duration::from_millis(10))
        .with_response_timeouts(Duration::from_secs(2))
}

/// A session with `fake` selected and connected, call log cleared.
pub async fn connected_session(fake: &Arc<FakeTransport>) -> Session<FakeTransport> {
    let mut session = Session::new(test_config());
    session.select_device(fake.clone()).await;
    session.connect().await.unwrap();
    fake.clear_calls();
    session
}

/// Control setup fields the session uses for vendor requests.
pub fn vendor_setup(request: u8, value: u16) -> ControlSetup {
    ControlSetup {
        request,
        value,
        index: u16::from(VENDOR_INTERFACE),
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
