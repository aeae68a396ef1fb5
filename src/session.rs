//! Bootloader session: handshake, capability discovery and the memory
//! primitives built on the checksummed command framing.

use crate::constants::{commands, replies, INIT_ATTEMPTS, MASS_ERASE, NO_MASS_ERASE_PIDS};
use crate::device::{Device, DeviceDB};
use crate::protocol::{self, CommandTable, EraseMode, Reply};
use crate::{Error, Result, Transport};

/// Discovered state of one connection to the ROM bootloader.
///
/// The transport is owned for the session's lifetime and released when the
/// session is dropped.
pub struct Bootloader<T: Transport> {
    transport: T,
    device: Device,
    commands: CommandTable,
    erase_mode: EraseMode,
    bootloader_version: u8,
    option1: u8,
    option2: u8,
}

impl<T: Transport> Bootloader<T> {
    /// Handshakes with the bootloader and identifies the device.
    ///
    /// With `init` unset the INIT byte is skipped, for resuming a connection
    /// that is already synchronised.
    pub fn connect(mut transport: T, db: &DeviceDB, init: bool) -> Result<Self> {
        if init {
            Self::init(&mut transport)?;
        }

        exchange(&mut transport, commands::GET, "GET")?;
        let len = transport.recv_byte()? as usize + 1;
        let raw = transport.recv_vec(len)?;
        let bootloader_version = raw[0];
        let (commands, unknown) = CommandTable::parse(&raw[1..])?;
        if unknown > 0 {
            log::warn!(
                "Bootloader returns {} more command(s) than understood in GET, skipped: {}",
                unknown,
                hex::encode(&raw[1 + protocol::KNOWN_COMMANDS..])
            );
        }
        expect_ack(&mut transport, "GET")?;
        log::debug!("Commands: {}", commands);

        exchange(&mut transport, commands.get_version, "GET VERSION")?;
        let status = transport.recv_vec(3)?;
        expect_ack(&mut transport, "GET VERSION")?;
        let (version, option1, option2) = (status[0], status[1], status[2]);
        log::debug!(
            "Version 0x{:02x}, option bytes 0x{:02x} 0x{:02x}",
            version,
            option1,
            option2
        );

        exchange(&mut transport, commands.get_id, "GET ID")?;
        let len = transport.recv_byte()? as usize + 1;
        if len < 2 {
            return Err(Error::UnsupportedDevice(len));
        }
        let id = transport.recv_vec(len)?;
        let product_id = u16::from_be_bytes([id[0], id[1]]);
        if len > 2 {
            log::warn!(
                "Bootloader returns {} extra bytes in PID: {}",
                len - 2,
                hex::encode(&id[2..])
            );
        }
        expect_ack(&mut transport, "GET ID")?;

        let device = db
            .find(product_id)
            .cloned()
            .ok_or(Error::UnknownDevice(product_id))?;
        log::debug!("Found device: {}", device);

        Ok(Bootloader {
            transport,
            device,
            erase_mode: commands.erase_mode(),
            commands,
            bootloader_version,
            option1,
            option2,
        })
    }

    fn init(transport: &mut T) -> Result<()> {
        let mut answer = None;
        for attempt in 1..=INIT_ATTEMPTS {
            transport.send(&[commands::INIT])?;
            match transport.recv_byte() {
                Ok(byte) => {
                    answer = Some(byte);
                    break;
                }
                Err(e) if e.is_timeout() => {
                    log::debug!("No answer to INIT (attempt {}/{})", attempt, INIT_ATTEMPTS)
                }
                Err(e) => return Err(e),
            }
        }
        match answer.map(Reply::from) {
            None => Err(Error::Timeout),
            Some(Reply::Ack) => Ok(()),
            Some(Reply::Nack) => {
                log::warn!("Got NACK from INIT, trying to resume connection");
                Ok(())
            }
            Some(other) => other.into_result("INIT"),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn product_id(&self) -> u16 {
        self.device.product_id
    }

    pub fn commands(&self) -> &CommandTable {
        &self.commands
    }

    pub fn erase_mode(&self) -> EraseMode {
        self.erase_mode
    }

    pub fn bootloader_version(&self) -> u8 {
        self.bootloader_version
    }

    pub fn option_bytes(&self) -> (u8, u8) {
        (self.option1, self.option2)
    }

    /// Reads `buf.len()` (at most 256) bytes from a word-aligned address.
    pub fn read_memory(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        let length = protocol::read_length_frame(address, buf.len())?;
        let context = ReadAt(address);

        exchange(&mut self.transport, self.commands.read_memory, &context)?;
        self.transport.send(&protocol::address_frame(address))?;
        expect_ack(&mut self.transport, &context)?;
        self.transport.send(&length)?;
        expect_ack(&mut self.transport, &context)?;
        self.transport.recv_raw(buf)
    }

    /// Writes up to 256 bytes to a word-aligned address. The device pads
    /// the tail of a short block with 0xFF.
    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let frame = protocol::write_frame(address, data)?;
        let context = WriteAt(address);

        exchange(&mut self.transport, self.commands.write_memory, &context)?;
        self.transport.send(&protocol::address_frame(address))?;
        expect_ack(&mut self.transport, &context)?;
        self.transport.send(&frame)?;
        expect_ack(&mut self.transport, &context)
    }

    /// Erases `count` flash pages from `start`, [`MASS_ERASE`] for all of
    /// them. Zero pages is a no-op.
    pub fn erase(&mut self, mut start: u16, mut count: u16) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        if self.erase_mode == EraseMode::Extended
            && count == MASS_ERASE
            && NO_MASS_ERASE_PIDS.contains(&self.device.product_id)
        {
            start = 0;
            count = u16::try_from(self.device.flash_pages()).map_err(|_| {
                Error::InvalidArgument("flash has too many pages to list".into())
            })?;
            log::debug!(
                "Mass erase not supported on 0x{:03x}, erasing {} pages instead",
                self.device.product_id,
                count
            );
        }
        let frame = protocol::erase_frame(self.erase_mode, start, count)?;

        exchange(&mut self.transport, self.commands.erase, "ERASE")?;
        self.transport.send(&frame)?;
        match self.transport.recv_byte().map(Reply::from)? {
            Reply::Ack => Ok(()),
            reply if count == MASS_ERASE => {
                log::error!("Mass erase failed, try specifying the number of pages to be erased");
                reply.into_result("mass erase")
            }
            reply => reply.into_result(format_args!("erase of {} pages from {}", count, start)),
        }
    }

    /// Removes write protection from all sectors. The device resets itself
    /// afterwards.
    pub fn write_unprotect(&mut self) -> Result<()> {
        self.two_stage(self.commands.write_unprotect, "write unprotect")
    }

    /// Enables readout protection. The device resets itself afterwards.
    pub fn readout_protect(&mut self) -> Result<()> {
        self.two_stage(self.commands.readout_protect, "readout protect")
    }

    /// Disables readout protection, which mass erases the flash. The device
    /// resets itself afterwards.
    pub fn readout_unprotect(&mut self) -> Result<()> {
        self.two_stage(self.commands.readout_unprotect, "readout unprotect")
    }

    /// Write protects the given sectors. The device resets itself afterwards.
    pub fn write_protect(&mut self, sectors: &[u8]) -> Result<()> {
        let frame = protocol::write_protect_frame(sectors)?;
        exchange(&mut self.transport, self.commands.write_protect, "write protect")?;
        self.transport.send(&frame)?;
        expect_ack(&mut self.transport, "write protect")
    }

    // Reception is acknowledged once by the command exchange and once more
    // when the option bytes have been programmed.
    fn two_stage(&mut self, opcode: u8, context: &str) -> Result<()> {
        exchange(&mut self.transport, opcode, context)?;
        expect_ack(&mut self.transport, context)
    }

    /// Jumps to `address`. After an ACK the device runs user code and will
    /// not answer on this connection again.
    pub fn go(&mut self, address: u32) -> Result<()> {
        let context = format!("GO 0x{:08x}", address);
        exchange(&mut self.transport, self.commands.go, &context)?;
        self.transport.send(&protocol::address_frame(address))?;
        expect_ack(&mut self.transport, &context)
    }
}

/// Sends an opcode with its complement and waits for the ACK.
fn exchange<T: Transport>(
    transport: &mut T,
    opcode: u8,
    context: impl std::fmt::Display,
) -> Result<()> {
    transport.send(&protocol::command_frame(opcode))?;
    expect_ack(transport, format_args!("{} (command 0x{:02x})", context, opcode))
}

fn expect_ack<T: Transport>(transport: &mut T, context: impl std::fmt::Display) -> Result<()> {
    let byte = transport.recv_byte()?;
    if byte != replies::ACK {
        log::debug!("Device answered 0x{:02x} on {}", byte, context);
    }
    Reply::from(byte).into_result(context)
}

struct ReadAt(u32);

impl std::fmt::Display for ReadAt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "read memory at address 0x{:08x}", self.0)
    }
}

struct WriteAt(u32);

impl std::fmt::Display for WriteAt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "write memory at address 0x{:08x}", self.0)
    }
}
