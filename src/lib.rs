//! Host-side programmer for UPDI AVR microcontrollers over a serial
//! adapter (serialUPDI-style): link framing, physical opcodes, the
//! application/handshake layer, the per-family NVM controller driver, and
//! session orchestration on top of them.

pub mod app;
pub mod device;
pub mod hex;
pub mod link;
pub mod nvm;
pub mod phy;
pub mod session;

pub use device::{get_device, DeviceDescriptor, DeviceError, Family, MemoryRegion, RegionFlags, RegionKind};
pub use session::{Session, SessionConfig, SessionError};
