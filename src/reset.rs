//! Software reset by uploading a tiny Cortex-M program and jumping to it.

use crate::constants::MAX_PACKET_SIZE;
use crate::session::Bootloader;
use crate::{Error, Result, Transport};

/// Initial stack pointer placed in the first word of the uploaded block.
pub const TRAMPOLINE_STACK: u32 = 0x2000_2000;

/// Requests SYSRESETREQ through the NVIC AIRCR register, then spins.
/// Valid for ARMv6-M and ARMv7-M.
pub const RESET_CODE: [u8; 16] = [
    0x01, 0x49, // ldr r1, [pc, #4] ; AIRCR address
    0x02, 0x4A, // ldr r2, [pc, #8] ; VECTKEY | SYSRESETREQ
    0x0A, 0x60, // str r2, [r1, #0]
    0xFE, 0xE7, // b .
    0x0C, 0xED, 0x00, 0xE0, // .word 0xe000ed0c
    0x04, 0x00, 0xFA, 0x05, // .word 0x05fa0004
];

/// Builds the block uploaded at `target`: stack word, entry word pointing
/// just past the two words, then the code.
pub fn build_trampoline(target: u32, code: &[u8]) -> Vec<u8> {
    let mut block = Vec::with_capacity(code.len() + 8);
    block.extend_from_slice(&TRAMPOLINE_STACK.to_le_bytes());
    block.extend_from_slice(&target.wrapping_add(8).to_le_bytes());
    block.extend_from_slice(code);
    block
}

impl<T: Transport> Bootloader<T> {
    /// Uploads `code` to RAM at `target` and executes it.
    pub fn run_raw_code(&mut self, target: u32, code: &[u8]) -> Result<()> {
        if target % 4 != 0 {
            return Err(Error::InvalidArgument(format!(
                "code address 0x{:08x} is not 32-bit aligned",
                target
            )));
        }
        let block = build_trampoline(target, code);
        let mut address = target;
        for chunk in block.chunks(MAX_PACKET_SIZE) {
            self.write_memory(address, chunk)?;
            address += chunk.len() as u32;
        }
        self.go(target)
    }

    /// Resets the device through a trampoline placed at the start of user
    /// RAM. Not needed after the protection commands, which reset on their
    /// own.
    pub fn reset_device(&mut self) -> Result<()> {
        let target = self.device().ram.reserved;
        log::debug!("Running reset code at 0x{:08x}", target);
        self.run_raw_code(target, &RESET_CODE)
    }
}
