//! Chip flashing logic.

use std::io::{Read, Write};

use indicatif::{ProgressBar, ProgressStyle};

use crate::constants::MAX_PACKET_SIZE;
use crate::device::DeviceDB;
use crate::session::Bootloader;
use crate::transport::{SerialConfig, SerialTransport};
use crate::workspace::{MemoryType, ResolvedWorkspace, WorkspaceSpec};
use crate::{Config, Error, Result, Transport};

/// How much data the write source holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputLength {
    /// A file of known size; running dry early is an error
    Known(u32),
    /// A pipe or terminal; running dry just ends the transfer
    Streamed,
}

pub struct Flashing<T: Transport> {
    session: Bootloader<T>,
    config: Config,
}

impl Flashing<SerialTransport> {
    pub fn new_from_serial(port: &str, serial: &SerialConfig, config: Config) -> Result<Self> {
        let transport = SerialTransport::open(port, serial)?;
        Self::new(transport, config)
    }
}

impl<T: Transport> Flashing<T> {
    pub fn new(transport: T, config: Config) -> Result<Self> {
        let db = DeviceDB::load()?;
        let session = Bootloader::connect(transport, &db, config.init)?;
        log::info!("Connected to {}", session.device());
        Ok(Flashing { session, config })
    }

    pub fn resolve(&self, spec: &WorkspaceSpec) -> Result<ResolvedWorkspace> {
        spec.resolve(self.session.device())
    }

    pub fn dump_info(&self) {
        let dev = self.session.device();
        let (option1, option2) = self.session.option_bytes();
        log::info!("Device ID     : 0x{:04x} ({})", dev.product_id, dev.name);
        log::info!("Bootloader Ver: 0x{:02x}", self.session.bootloader_version());
        log::info!("Option 1      : 0x{:02x}", option1);
        log::info!("Option 2      : 0x{:02x}", option2);
        log::info!(
            "RAM up to     : {}KiB at 0x{:08x} ({}b to 0x{:08x} reserved by bootloader)",
            (dev.ram.end - dev.ram.start) / 1024,
            dev.ram.start,
            dev.ram.reserved - dev.ram.start,
            dev.ram.reserved
        );
        log::info!(
            "System mem    : {}KiB at 0x{:08x}",
            dev.system_memory.len() / 1024,
            dev.system_memory.start
        );
        log::info!(
            "Option mem    : {}B at 0x{:08x}",
            dev.option_bytes.len(),
            dev.option_bytes.start
        );
        log::info!(
            "Flash up to   : {}KiB at 0x{:08x}",
            dev.flash_size() / 1024,
            dev.flash.start
        );
        log::info!(
            "Flash org.    : {} sectors x {} pages x {} bytes",
            dev.flash_sectors(),
            dev.flash.pages_per_sector,
            dev.flash.page_size
        );
        if dev.has_eeprom() {
            log::info!(
                "EEPROM        : {}KiB at 0x{:08x}",
                dev.eeprom.len() / 1024,
                dev.eeprom.start
            );
        }
        log::info!("Specified RAM/Flash sizes are maximum for this chip type, yours may have less");
    }

    fn progress_bar(&self, len: u64) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len);
        let style = ProgressStyle::default_bar()
            .template("  {wide_bar} {bytes}/{total_bytes} {bytes_per_sec} {eta}  ")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        bar.set_style(style);
        bar
    }

    /// Copies the workspace into `sink`, 256 bytes at a time.
    pub fn read<W: Write>(&mut self, ws: &ResolvedWorkspace, sink: &mut W) -> Result<u32> {
        log::info!("Reading 0x{:08x}..0x{:08x}", ws.start, ws.end);
        let bar = self.progress_bar(ws.len() as u64);
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let mut address = ws.start;
        while address < ws.end {
            let len = (ws.end - address).min(MAX_PACKET_SIZE as u32) as usize;
            self.session
                .read_memory(address, &mut buf[..len])
                .inspect_err(|_| {
                    log::error!(
                        "Failed to read memory at address 0x{:08x}, target write-protected?",
                        address
                    )
                })?;
            sink.write_all(&buf[..len])?;
            address += len as u32;
            bar.set_position((address - ws.start) as u64);
        }
        sink.flush()?;
        bar.finish_and_clear();
        log::info!("Read {} bytes", address - ws.start);
        Ok(address - ws.start)
    }

    /// Erases the workspace's pages. Only flash can be erased.
    pub fn erase(&mut self, ws: &ResolvedWorkspace) -> Result<()> {
        if ws.memory_type != MemoryType::Flash {
            return Err(Error::InvalidArgument(
                "only flash can be erased".into(),
            ));
        }
        if ws.is_full_flash() {
            log::info!("Erasing entire flash");
        } else {
            log::info!("Erasing {} pages from page {}", ws.page_count, ws.start_page);
        }
        self.session.erase(ws.start_page, ws.page_count)
    }

    /// Programs the workspace from `source`, erasing flash pages first.
    pub fn write<R: Read>(
        &mut self,
        ws: &ResolvedWorkspace,
        source: &mut R,
        input: InputLength,
    ) -> Result<u32> {
        let size = match input {
            InputLength::Known(n) if n > ws.len() => {
                return Err(Error::InvalidArgument(format!(
                    "input of {} bytes is too big for {} byte region",
                    n,
                    ws.len()
                )));
            }
            InputLength::Known(n) => n,
            InputLength::Streamed => ws.len(),
        };

        if ws.memory_type == MemoryType::Flash {
            self.erase(ws)?;
        }

        log::info!("Writing {} bytes at 0x{:08x}", size, ws.start);
        let bar = self.progress_bar(size as u64);
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let mut address = ws.start;
        let mut offset = 0u32;
        while address < ws.end && offset < size {
            let want = (ws.end - address)
                .min(size - offset)
                .min(MAX_PACKET_SIZE as u32) as usize;
            let len = read_up_to(source, &mut buf[..want])?;
            if len == 0 {
                match input {
                    InputLength::Streamed => break,
                    InputLength::Known(_) => return Err(Error::ShortInput(address)),
                }
            }
            self.write_block(address, &buf[..len])?;
            address += len as u32;
            offset += len as u32;
            bar.set_position(offset as u64);
        }
        bar.finish_and_clear();
        log::info!(
            "Wrote {}{} bytes",
            if self.config.verify { "and verified " } else { "" },
            offset
        );
        Ok(offset)
    }

    /// Writes one block, reading it back when verification is on. A block
    /// that keeps failing is rewritten up to `retries` times; the count
    /// starts over for every block.
    fn write_block(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let mut failures = 0;
        let mut readback = [0u8; MAX_PACKET_SIZE];
        loop {
            self.session.write_memory(address, data)?;
            if !self.config.verify {
                return Ok(());
            }
            let readback = &mut readback[..data.len()];
            self.session.read_memory(address, readback)?;
            let Some(i) = data.iter().zip(readback.iter()).position(|(a, b)| a != b) else {
                return Ok(());
            };
            let mismatch = Error::VerifyMismatch {
                address: address + i as u32,
                expected: data[i],
                actual: readback[i],
            };
            if failures >= self.config.retries {
                return Err(mismatch);
            }
            failures += 1;
            log::warn!("{}, retrying ({}/{})", mismatch, failures, self.config.retries);
        }
    }

    pub fn write_unprotect(&mut self) -> Result<()> {
        log::info!("Write-unprotecting flash");
        self.session.write_unprotect()
    }

    pub fn write_protect(&mut self, sectors: &[u8]) -> Result<()> {
        log::info!("Write-protecting sectors {:?}", sectors);
        self.session.write_protect(sectors)
    }

    pub fn readout_protect(&mut self) -> Result<()> {
        log::info!("Read-protecting flash");
        self.session.readout_protect()
    }

    pub fn readout_unprotect(&mut self) -> Result<()> {
        log::info!("Read-unprotecting flash");
        self.session.readout_unprotect()
    }

    /// Starts user code at `address`.
    pub fn go(&mut self, address: u32) -> Result<()> {
        log::info!("Starting execution at address 0x{:08x}", address);
        self.session.go(address)
    }

    pub fn reset(&mut self) -> Result<()> {
        self.session.reset_device()?;
        log::info!("Device reset");
        Ok(())
    }

    /// Resolves `spec`, runs `op` on the resulting workspace, then leaves
    /// the bootloader. A successful run jumps to the execute address when
    /// one was given; otherwise the device is reset if the config asks for
    /// it. `self_resetting` ops restart the device on their own, so neither
    /// follows them. Resolution failures still get the reset.
    pub fn run_operation<E, F>(
        &mut self,
        spec: &WorkspaceSpec,
        self_resetting: bool,
        op: F,
    ) -> std::result::Result<(), E>
    where
        E: From<Error>,
        F: FnOnce(&mut Self, &ResolvedWorkspace) -> std::result::Result<(), E>,
    {
        let outcome = match self.resolve(spec) {
            Ok(ws) => op(self, &ws).map(|()| ws.execute),
            Err(e) => Err(e.into()),
        };
        let execute = match &outcome {
            Ok(execute) if !self_resetting => *execute,
            _ => None,
        };
        let reset = self.config.reset && !self_resetting;
        let finished = self.finish(execute, reset);
        outcome?;
        Ok(finished?)
    }

    fn finish(&mut self, execute: Option<u32>, reset: bool) -> Result<()> {
        match execute {
            Some(address) => self.go(address),
            None if reset => self.reset(),
            None => Ok(()),
        }
    }
}

/// Fills `buf` from `source`, returning fewer bytes only at end of input.
fn read_up_to<R: Read>(source: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
