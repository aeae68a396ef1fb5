/// Largest block moved by a single Read Memory / Write Memory command.
pub const MAX_PACKET_SIZE: usize = 256;

/// Page count meaning "the whole flash". Encoded differently by the two
/// erase sub-protocols.
pub const MASS_ERASE: u16 = 0xFFFF;

/// Filler sent after a write payload to reach a 4-byte boundary.
pub const WRITE_PADDING: u8 = 0xFF;

/// Attempts at the INIT handshake before giving up.
pub const INIT_ATTEMPTS: usize = 5;

pub mod replies {
    pub const ACK: u8 = 0x79;
    pub const NACK: u8 = 0x1F;
}

pub mod commands {
    /// Autobaud synchronisation byte, not a real command.
    pub const INIT: u8 = 0x7F;
    /// The only opcode known before GET has been answered.
    pub const GET: u8 = 0x00;
    pub const ERASE: u8 = 0x43;
    pub const EXTENDED_ERASE: u8 = 0x44;
}

/// Parts which reject the extended-erase mass erase sequence.
pub const NO_MASS_ERASE_PIDS: &[u16] = &[0x416];
