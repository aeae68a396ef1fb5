//! STM32 ROM bootloader (AN3155) protocol implementation.

pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod flashing;
pub mod format;
pub mod protocol;
pub mod reset;
pub mod session;
pub mod transport;
pub mod workspace;

pub use self::config::Config;
pub use self::device::{Device, DeviceDB};
pub use self::error::{Error, Result};
pub use self::flashing::{Flashing, InputLength};
pub use self::session::Bootloader;
pub use self::transport::{parse_baud_rate, SerialConfig, SerialTransport, Transport};
pub use self::workspace::{
    AddressSelector, ExecAddress, MemoryType, PageSelector, ResolvedWorkspace, Selector,
    WorkspaceSpec,
};
