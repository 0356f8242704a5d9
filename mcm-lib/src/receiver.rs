//! Background bulk IN receiver.
//!
//! A bulk IN transfer has no timeout of its own, so a pending read can only be
//! interrupted from outside. Stopping therefore happens in two steps: the loop is
//! asked to stop (it checks before every transfer) and, if it has not finished
//! after a grace period, the transport is closed under it, which fails the pending
//! transfer.

use crate::error::{McmError, Result, TransportError};
use crate::session::{DeviceRemoval, Mode, Session};
use crate::transport::{Direction, InTransfer, TransferStatus, UsbTransport};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub(crate) struct BulkReceiver {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
    mode: Mode,
}

impl BulkReceiver {
    /// The mode the receiver was started for, kept while the session shows [`Mode::Error`].
    pub(crate) fn mode(&self) -> Mode {
        self.mode
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub(crate) fn abort(self) {
        self.cancel.send_replace(true);
        self.task.abort();
    }
}

struct ReceiveLoop<T: UsbTransport> {
    transport: Arc<T>,
    endpoint: u8,
    read_len: usize,
    backoff: Duration,
    mode: Arc<watch::Sender<Mode>>,
    own_mode: Mode,
    removal: DeviceRemoval,
    cancel: watch::Receiver<bool>,
}

impl<T: UsbTransport> ReceiveLoop<T> {
    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    async fn run<F>(mut self, mut on_data: F)
    where
        F: FnMut(Bytes) + Send,
    {
        info!("Bulk receiver started in mode {}", self.own_mode);
        loop {
            if self.cancelled() {
                debug!("Bulk receiver cancelled");
                break;
            }
            if self.removal.is_removed() {
                info!("Bulk receiver stopping: device removed");
                break;
            }

            let result = self.transport.transfer_in(self.endpoint, self.read_len).await;
            if self.cancelled() {
                debug!("Bulk receiver cancelled during transfer");
                break;
            }

            let fault = match result {
                Ok(InTransfer {
                    status: TransferStatus::Ok,
                    data,
                }) => {
                    if *self.mode.borrow() == Mode::Error {
                        info!("Bulk receiver recovered");
                        self.mode.send_replace(self.own_mode);
                    }
                    if !data.is_empty() {
                        debug!(bytes = hex::encode(&data), "Bulk receiver got {} bytes", data.len());
                        on_data(data);
                    }
                    continue;
                }
                Ok(InTransfer {
                    status: TransferStatus::Stall,
                    ..
                }) => {
                    if let Err(e) = self.transport.clear_halt(Direction::In, self.endpoint).await {
                        warn!("Clearing halt on 0x{:02X} failed: {}", self.endpoint, e);
                    }
                    McmError::DeviceSignalledError
                }
                Ok(InTransfer {
                    status: TransferStatus::Babble,
                    ..
                }) => McmError::UnexpectedDataVolume,
                Ok(InTransfer { status, .. }) => {
                    McmError::UnexpectedTransferStatus(format!("bulk receiver transfer gave {:?}", status))
                }
                Err(TransportError::Disconnected) => {
                    self.removal.notify();
                    break;
                }
                Err(e @ (TransportError::NotOpen | TransportError::Cancelled)) if !self.transport.is_open() => {
                    info!("Bulk receiver stopping: transport closed ({})", e);
                    self.mode.send_replace(Mode::None);
                    break;
                }
                Err(e) => e.into(),
            };

            warn!("Bulk receiver transfer failed, retrying in {:?}: {}", self.backoff, fault);
            self.mode.send_replace(Mode::Error);
            tokio::select! {
                _ = tokio::time::sleep(self.backoff) => {}
                _ = self.cancel.changed() => {}
            }
        }
        info!("Bulk receiver stopped");
    }
}

impl<T: UsbTransport> Session<T> {
    pub fn is_receiver_running(&self) -> bool {
        self.receiver.as_ref().is_some_and(|r| !r.is_finished())
    }

    /// Switch to `mode` and hand every bulk IN chunk to `on_data` from a background task.
    ///
    /// The loop keeps retrying after transfer errors and ends only when stopped, when
    /// the device goes away or when the transport is closed under it.
    pub async fn start_bulk_receiver<F>(&mut self, mode: Mode, on_data: F) -> Result<()>
    where
        F: FnMut(Bytes) + Send + 'static,
    {
        if self.is_receiver_running() {
            return Err(McmError::ReceiverAlreadyRunning);
        }
        self.receiver = None;
        self.enter_mode(mode).await?;

        let transport = self.transport()?;
        let endpoints = self
            .endpoints
            .ok_or_else(|| McmError::EndpointDetectionFailed("session is not connected".to_string()))?;
        let (cancel, cancel_rx) = watch::channel(false);
        let receive_loop = ReceiveLoop {
            transport,
            endpoint: endpoints.ep_in.address,
            read_len: self.config.bulk_read_len,
            backoff: self.config.receiver_backoff,
            mode: self.mode.clone(),
            own_mode: mode,
            removal: self.removal.clone(),
            cancel: cancel_rx,
        };
        let task = tokio::spawn(receive_loop.run(on_data));
        self.receiver = Some(BulkReceiver { cancel, task, mode });
        Ok(())
    }

    /// Stop the background receiver, if any, and return to [`Mode::None`].
    ///
    /// Falls back to closing the transport when the loop is stuck in a transfer; the
    /// session then reconnects on its next operation.
    pub async fn stop_bulk_receiver(&mut self) {
        let Some(mut receiver) = self.receiver.take() else {
            return;
        };
        receiver.cancel.send_replace(true);

        let grace = self.config.receiver_stop_grace;
        if tokio::time::timeout(grace, &mut receiver.task).await.is_err() {
            warn!("Bulk receiver still busy after {:?}, force-closing transport", grace);
            if let Some(device) = &self.device {
                if let Err(e) = device.close().await {
                    warn!("Force-closing transport failed: {}", e);
                }
            }
            self.endpoints = None;
            if tokio::time::timeout(grace, &mut receiver.task).await.is_err() {
                warn!("Bulk receiver ignored forced close, aborting task");
                receiver.task.abort();
            }
        }
        self.set_mode(Mode::None);
    }
}
