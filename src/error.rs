//! Error types shared by the whole crate.
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("IO error while using serial port: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("timeout while waiting for a reply from the device")]
    Timeout,
    #[error("got NACK from device on {0}")]
    Nack(String),
    #[error("unexpected reply 0x{byte:02x} from device on {context}")]
    UnexpectedReply { context: String, byte: u8 },
    #[error("only {0} bytes sent in the PID, unknown/unsupported device")]
    UnsupportedDevice(usize),
    #[error("unknown/unsupported device (Device ID: 0x{0:03x})")]
    UnknownDevice(u16),
    #[error("invalid selector: {0}")]
    InvalidSelector(String),
    #[error(
        "can't fit input to selected region or specified start/length are invalid: \
         start 0x{start:08x} < 0x{allowed_start:08x} or end 0x{end:08x} > 0x{allowed_end:08x}"
    )]
    RegionOutOfBounds {
        start: u64,
        end: u64,
        allowed_start: u32,
        allowed_end: u32,
    },
    #[error("execution address 0x{0:08x} must be in flash or RAM")]
    BadExecuteAddress(u32),
    #[error("this chip does not have EEPROM")]
    NoEeprom,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed to verify at address 0x{address:08x}, expected 0x{expected:02x} and found 0x{actual:02x}")]
    VerifyMismatch { address: u32, expected: u8, actual: u8 },
    #[error("input ended early, nothing left to write at address 0x{0:08x}")]
    ShortInput(u32),
    #[error("device catalog is malformed: {0}")]
    Catalog(#[from] serde_yaml::Error),
}

impl Error {
    /// True when the device simply never answered.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}
