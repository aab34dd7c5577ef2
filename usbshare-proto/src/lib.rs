//! Wire protocol shared between the usbshare relay, hosts and clients.

pub mod device;
pub mod relay;

pub use device::DeviceEntry;
pub use relay::{ParseError, RelayMessage};
