pub mod config;
pub mod constants;
pub mod device_info;
pub mod error;
pub mod frame;
pub mod hex_transfer;
pub mod lin;
pub mod lines;
pub mod ota;
pub mod receiver;
pub mod schedule;
pub mod session;
pub mod settings;
pub mod transport;
pub mod uart;
pub mod usb;


// Re-export the main entry points for easy access
pub use config::SessionConfig;
pub use error::{McmError, Result, TransportError};
pub use session::{DeviceRemoval, Mode, Session};
pub use transport::UsbTransport;
pub use usb::{NusbTransport, list_mcm_devices};
