//! LIN schedules: named sequences of frames run by the MCM as bus master.
//!
//! Schedules arrive already parsed. They can be built in code or loaded from JSON:
//!
//! ```json
//! {
//!   "name": "diag",
//!   "baudrate": 19200,
//!   "entries": [
//!     { "name": "wake", "frames": [{ "type": "wake_up" }] },
//!     { "name": "read", "frames": [
//!       { "type": "master_to_slave", "frame_id": 60, "enhanced_crc": false, "payload": [1, 2] },
//!       { "type": "slave_to_master", "frame_id": 61, "enhanced_crc": false, "data_length": 8 }
//!     ]}
//!   ]
//! }
//! ```

use crate::error::{McmError, Result};
use crate::lin::DEFAULT_LIN_BAUDRATE;
use crate::session::Session;
use crate::transport::UsbTransport;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinFrame {
    WakeUp,
    SlaveToMaster {
        frame_id: u8,
        #[serde(default)]
        enhanced_crc: bool,
        data_length: u8,
    },
    MasterToSlave {
        frame_id: u8,
        #[serde(default)]
        enhanced_crc: bool,
        payload: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub name: String,
    pub frames: Vec<LinFrame>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_baudrate")]
    pub baudrate: u16,
    pub entries: Vec<ScheduleEntry>,
}

fn default_baudrate() -> u16 {
    DEFAULT_LIN_BAUDRATE
}

impl Schedule {
    pub fn from_json(text: &str) -> Result<Self> {
        let schedule: Schedule = serde_json::from_str(text)?;
        if schedule.baudrate == 0 {
            return Err(McmError::InvalidSchedule("baudrate must not be zero".to_string()));
        }
        for frame in schedule.entries.iter().flat_map(|e| &e.frames) {
            let frame_id = match frame {
                LinFrame::WakeUp => continue,
                LinFrame::SlaveToMaster { frame_id, .. } | LinFrame::MasterToSlave { frame_id, .. } => *frame_id,
            };
            if frame_id > 0x3F {
                return Err(McmError::InvalidSchedule(format!(
                    "frame id 0x{:02X} exceeds 6 bits",
                    frame_id
                )));
            }
        }
        Ok(schedule)
    }

    pub fn entry(&self, name: &str) -> Option<&ScheduleEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

/// Result of one frame of a schedule entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    WokeUp,
    /// Response payload of a master-to-slave frame
    Sent(Bytes),
    /// Data published by the slave
    Received(Bytes),
}

impl<T: UsbTransport> Session<T> {
    /// Run the frames of `entry` in order, stopping at the first failure.
    ///
    /// Requires LIN mode (see [`Session::lin_setup`]).
    pub async fn run_schedule_entry(&mut self, baudrate: u16, entry: &ScheduleEntry) -> Result<Vec<FrameOutcome>> {
        info!("Running schedule entry {:?} ({} frames)", entry.name, entry.frames.len());
        let mut outcomes = Vec::with_capacity(entry.frames.len());
        for frame in &entry.frames {
            debug!(?frame, "Schedule frame");
            let outcome = match frame {
                LinFrame::WakeUp => {
                    self.lin_wake_up().await?;
                    FrameOutcome::WokeUp
                }
                LinFrame::SlaveToMaster {
                    frame_id,
                    enhanced_crc,
                    data_length,
                } => FrameOutcome::Received(
                    self.lin_slave_to_master(baudrate, *enhanced_crc, *frame_id, *data_length)
                        .await?,
                ),
                LinFrame::MasterToSlave {
                    frame_id,
                    enhanced_crc,
                    payload,
                } => FrameOutcome::Sent(
                    self.lin_master_to_slave(baudrate, *enhanced_crc, *frame_id, payload)
                        .await?,
                ),
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}
