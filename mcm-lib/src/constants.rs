// Protocol constants for the MCM USB interface

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// USB interface class code of the MCM vendor interface
pub const VENDOR_SPECIFIC_CLASS: u8 = 0xFF;

/// Configuration selected when the device is unconfigured
pub const DEFAULT_CONFIGURATION: u8 = 1;

/// Magic value opening every framed bulk message (little-endian on the wire)
pub const FRAME_MAGIC: u32 = 0xAA55_AA55;

/// Size of the frame header: magic, length, command, reserved
pub const FRAME_HEADER_SIZE: usize = 12;

/// Size of the trailing CRC16
pub const FRAME_CRC_SIZE: usize = 2;

/// Smallest valid frame (empty payload)
pub const FRAME_MIN_SIZE: usize = FRAME_HEADER_SIZE + FRAME_CRC_SIZE;

/// Largest payload the u16 length field can describe
pub const FRAME_MAX_PAYLOAD: usize = u16::MAX as usize - FRAME_MIN_SIZE;

/// Bytes needed before the decoder can look at magic and length
pub const FRAME_PREFIX_SIZE: usize = 6;

/// Seed of the frame CRC16
pub const CRC16_SEED: u16 = 0x1D0F;

/// Chunk size used when streaming a firmware image
pub const OTA_CHUNK_SIZE: usize = 5120;

/// Maximum length requested by control-in transfers
pub const CONTROL_IN_MAX_LENGTH: u16 = 255;

/// Wake-up pulse time sent with a LIN wake-up request
pub const LIN_WAKEUP_PULSE_TIME: u16 = 200;

/// Vendor specific control requests understood by the MCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum VendorRequest {
    Identify = 0x00,
    Info = 0x01,
    Config = 0x02,
    SlaveCtrl = 0x10,
    BareUartMode = 0x20,
    LinComm = 0x21,
    BootloaderDoTransfer = 0x30,
    BootloaderDo = 0x31,
    BootloaderPpm = 0x33,
    OtaDoTransfer = 0x40,
    OtaUpdateBootPartition = 0x41,
    Restart = 0x50,
}

/// `wValue` selectors for [`VendorRequest::Info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum InfoSelector {
    Version = 0x00,
    ResetReason = 0x01,
    UpTime = 0x02,
}

/// `wValue` selectors for [`VendorRequest::Config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum ConfigSelector {
    Hostname = 0x00,
    WifiSsid = 0x01,
    WifiPassword = 0x02,
    WifiMac = 0x03,
    WifiIpInfo = 0x04,
}

/// Command ids carried in framed bulk messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum MessageId {
    LinSendWakeup = 0x2200,
    LinHandleMessage = 0x2201,
    PpmDoBootloaderAction = 0x3300,
    /// Sent by the device instead of the expected response when a request fails
    ErrorReport = 0xFFFF,
}

/// Acknowledgement lines printed by the MCM on the bulk stream
pub mod ack {
    pub const OK: &str = "OK";
    pub const EMPTY: &str = "EMPTY";
    pub const VALID: &str = "VALID";
    pub const FAIL: &str = "FAIL";
    pub const FAIL_WITH_MESSAGE: &str = "FAIL:";
}
