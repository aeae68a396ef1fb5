//! The underlying binary protocol of the STM32 ROM bootloader (AN3155)
//!
//! Everything here is pure frame building and decoding; the I/O lives in
//! [`crate::session`].

use std::fmt;

use scroll::Pwrite;

use crate::constants::{commands, replies, MASS_ERASE, MAX_PACKET_SIZE, WRITE_PADDING};
use crate::{Error, Result};

/// Number of opcodes a GET reply lists before any we don't understand.
pub const KNOWN_COMMANDS: usize = 11;

/// Single byte answer to a command or payload stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Nack,
    Other(u8),
}

impl From<u8> for Reply {
    fn from(byte: u8) -> Self {
        match byte {
            replies::ACK => Reply::Ack,
            replies::NACK => Reply::Nack,
            other => Reply::Other(other),
        }
    }
}

impl Reply {
    /// `context` names the operation in the resulting error.
    pub fn into_result(self, context: impl fmt::Display) -> Result<()> {
        match self {
            Reply::Ack => Ok(()),
            Reply::Nack => Err(Error::Nack(context.to_string())),
            Reply::Other(byte) => Err(Error::UnexpectedReply {
                context: context.to_string(),
                byte,
            }),
        }
    }
}

/// Which of the two incompatible erase framings the device speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseMode {
    /// One byte page count and page numbers.
    Regular,
    /// Two byte, MSB-first page count and page numbers.
    Extended,
}

impl EraseMode {
    pub fn from_opcode(opcode: u8) -> Self {
        if opcode == commands::EXTENDED_ERASE {
            EraseMode::Extended
        } else {
            EraseMode::Regular
        }
    }
}

/// Opcodes reported by the GET command, in the order the device lists them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTable {
    pub get: u8,
    pub get_version: u8,
    pub get_id: u8,
    pub read_memory: u8,
    pub go: u8,
    pub write_memory: u8,
    /// Either regular or extended erase, see [`CommandTable::erase_mode`]
    pub erase: u8,
    pub write_protect: u8,
    pub write_unprotect: u8,
    pub readout_protect: u8,
    pub readout_unprotect: u8,
}

impl CommandTable {
    /// Parses the opcode list of a GET reply, the bytes following the
    /// bootloader version. Returns the table and the number of trailing
    /// opcodes that were not understood.
    pub fn parse(opcodes: &[u8]) -> Result<(Self, usize)> {
        if opcodes.len() < KNOWN_COMMANDS {
            return Err(Error::UnexpectedReply {
                context: format!("GET, only {} commands listed", opcodes.len()),
                byte: opcodes.len() as u8,
            });
        }
        let table = CommandTable {
            get: opcodes[0],
            get_version: opcodes[1],
            get_id: opcodes[2],
            read_memory: opcodes[3],
            go: opcodes[4],
            write_memory: opcodes[5],
            erase: opcodes[6],
            write_protect: opcodes[7],
            write_unprotect: opcodes[8],
            readout_protect: opcodes[9],
            readout_unprotect: opcodes[10],
        };
        Ok((table, opcodes.len() - KNOWN_COMMANDS))
    }

    pub fn erase_mode(&self) -> EraseMode {
        EraseMode::from_opcode(self.erase)
    }
}

impl fmt::Display for CommandTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GET={:02x} GV={:02x} GID={:02x} RM={:02x} GO={:02x} WM={:02x} ER={:02x} WP={:02x} UW={:02x} RP={:02x} UR={:02x}",
            self.get,
            self.get_version,
            self.get_id,
            self.read_memory,
            self.go,
            self.write_memory,
            self.erase,
            self.write_protect,
            self.write_unprotect,
            self.readout_protect,
            self.readout_unprotect
        )
    }
}

/// XOR of all bytes, the checksum used by every payload stage.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// Checksum of a 32-bit address as sent on the wire.
pub fn address_checksum(address: u32) -> u8 {
    checksum(&address.to_be_bytes())
}

/// Opcode followed by its complement.
pub fn command_frame(opcode: u8) -> [u8; 2] {
    [opcode, opcode ^ 0xFF]
}

/// Big-endian address followed by its checksum.
pub fn address_frame(address: u32) -> [u8; 5] {
    let mut buf = [0u8; 5];
    // A 4-byte write into a 5-byte buffer can't run out of room.
    let _ = buf.pwrite_with(address, 0, scroll::BE);
    buf[4] = address_checksum(address);
    buf
}

fn check_transfer(address: u32, len: usize) -> Result<()> {
    if len == 0 || len > MAX_PACKET_SIZE {
        return Err(Error::InvalidArgument(format!(
            "transfer of {} bytes, must be 1..={}",
            len, MAX_PACKET_SIZE
        )));
    }
    if address % 4 != 0 {
        return Err(Error::InvalidArgument(format!(
            "address 0x{:08x} is not 32-bit aligned",
            address
        )));
    }
    Ok(())
}

/// Byte count stage of Read Memory: `len - 1` and its complement.
pub fn read_length_frame(address: u32, len: usize) -> Result<[u8; 2]> {
    check_transfer(address, len)?;
    let n = (len - 1) as u8;
    Ok([n, n ^ 0xFF])
}

/// Padding needed to bring `len` to a 4-byte boundary.
pub fn write_padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

/// Payload stage of Write Memory: length byte, data, 0xFF filler up to a
/// word boundary, and the XOR of everything before it.
pub fn write_frame(address: u32, data: &[u8]) -> Result<Vec<u8>> {
    check_transfer(address, data.len())?;
    let pad = write_padding(data.len());
    let mut buf = Vec::with_capacity(data.len() + pad + 2);
    buf.push((data.len() - 1 + pad) as u8);
    buf.extend_from_slice(data);
    buf.resize(buf.len() + pad, WRITE_PADDING);
    buf.push(checksum(&buf));
    Ok(buf)
}

/// Payload stage of Erase / Extended Erase for `count` pages from `start`.
///
/// `count` must not be zero; [`MASS_ERASE`] selects the whole-chip form.
pub fn erase_frame(mode: EraseMode, start: u16, count: u16) -> Result<Vec<u8>> {
    if count == 0 {
        return Err(Error::InvalidArgument("erase of zero pages".into()));
    }
    match mode {
        EraseMode::Regular if count == MASS_ERASE => Ok(vec![0xFF, 0x00]),
        EraseMode::Regular => {
            let last = start as u32 + count as u32 - 1;
            // N = 0xFF is the global erase code, so 255 pages is the most
            if count > 255 || last > 0xFF {
                return Err(Error::InvalidArgument(format!(
                    "pages {}..={} can't be addressed by the regular erase command",
                    start, last
                )));
            }
            let mut buf = Vec::with_capacity(count as usize + 2);
            buf.push((count - 1) as u8);
            buf.extend((start..=last as u16).map(|p| p as u8));
            buf.push(checksum(&buf));
            Ok(buf)
        }
        EraseMode::Extended if count == MASS_ERASE => Ok(vec![0xFF, 0xFF, 0x00]),
        EraseMode::Extended => {
            let last = start as u32 + count as u32 - 1;
            if last > 0xFFFF {
                return Err(Error::InvalidArgument(format!(
                    "pages {}..={} exceed the extended erase range",
                    start, last
                )));
            }
            let mut buf = Vec::with_capacity(2 * count as usize + 3);
            buf.extend_from_slice(&(count - 1).to_be_bytes());
            for page in start..=last as u16 {
                buf.extend_from_slice(&page.to_be_bytes());
            }
            buf.push(checksum(&buf));
            Ok(buf)
        }
    }
}

/// Payload stage of Write Protect: sector count, sector codes, checksum.
pub fn write_protect_frame(sectors: &[u8]) -> Result<Vec<u8>> {
    if sectors.is_empty() || sectors.len() > 256 {
        return Err(Error::InvalidArgument(format!(
            "write protect of {} sectors",
            sectors.len()
        )));
    }
    let mut buf = Vec::with_capacity(sectors.len() + 2);
    buf.push((sectors.len() - 1) as u8);
    buf.extend_from_slice(sectors);
    buf.push(checksum(&buf));
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_checksum_folds_all_bytes() {
        for a in [0u32, 0x0800_0000, 0x2000_1200, 0xdead_beef, 0xffff_ffff, 0x1234_5678] {
            let expected = ((a >> 24) ^ (a >> 16) ^ (a >> 8) ^ a) as u8;
            assert_eq!(address_checksum(a), expected);
            assert_eq!(address_frame(a)[4], expected);
        }
        assert_eq!(address_frame(0x0800_0000), [0x08, 0x00, 0x00, 0x00, 0x08]);
    }

    #[test]
    fn command_is_followed_by_complement() {
        assert_eq!(command_frame(0x00), [0x00, 0xFF]);
        assert_eq!(command_frame(0x31), [0x31, 0xCE]);
    }

    #[test]
    fn reply_decoding() {
        assert_eq!(Reply::from(0x79), Reply::Ack);
        assert_eq!(Reply::from(0x1F), Reply::Nack);
        assert_eq!(Reply::from(0x42), Reply::Other(0x42));
        assert!(matches!(Reply::Nack.into_result("GO"), Err(Error::Nack(_))));
        assert!(matches!(
            Reply::Other(0x42).into_result("GO"),
            Err(Error::UnexpectedReply { byte: 0x42, .. })
        ));
    }

    #[test]
    fn aligned_write_has_no_padding() {
        let data: Vec<u8> = (0..44).collect();
        let frame = write_frame(0x0800_0000, &data).unwrap();
        assert_eq!(frame.len(), 1 + 44 + 1);
        assert_eq!(frame[0], 43);
        assert_eq!(*frame.last().unwrap(), checksum(&frame[..frame.len() - 1]));
    }

    #[test]
    fn short_write_is_padded_and_checksummed() {
        let frame = write_frame(0x0800_0100, &[0xAB]).unwrap();
        // length byte counts the three filler bytes
        assert_eq!(frame, vec![0x03, 0xAB, 0xFF, 0xFF, 0xFF, 0x03 ^ 0xAB ^ 0xFF]);
    }

    #[test]
    fn write_checksum_covers_length_payload_and_padding() {
        for len in 1..=256usize {
            let data: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
            let frame = write_frame(0, &data).unwrap();
            let pad = write_padding(len);
            assert_eq!(frame.len(), len + pad + 2);
            assert_eq!((frame[0] as usize + 1) % 4, 0);
            let mut cs = frame[0];
            data.iter().for_each(|b| cs ^= b);
            (0..pad).for_each(|_| cs ^= 0xFF);
            assert_eq!(*frame.last().unwrap(), cs);
        }
    }

    #[test]
    fn transfers_are_bounded_and_aligned() {
        assert!(write_frame(0x0800_0002, &[0; 4]).is_err());
        assert!(write_frame(0, &[]).is_err());
        assert!(write_frame(0, &[0; 257]).is_err());
        assert_eq!(read_length_frame(0, 256).unwrap(), [0xFF, 0x00]);
        assert_eq!(read_length_frame(4, 10).unwrap(), [9, 0xF6]);
        assert!(read_length_frame(1, 10).is_err());
    }

    #[test]
    fn regular_erase_frames() {
        assert_eq!(erase_frame(EraseMode::Regular, 0, MASS_ERASE).unwrap(), vec![0xFF, 0x00]);
        assert_eq!(
            erase_frame(EraseMode::Regular, 4, 3).unwrap(),
            vec![2, 4, 5, 6, 2 ^ 4 ^ 5 ^ 6]
        );
        assert!(erase_frame(EraseMode::Regular, 250, 10).is_err());
        assert!(erase_frame(EraseMode::Regular, 0, 0).is_err());
    }

    #[test]
    fn extended_erase_frames() {
        assert_eq!(
            erase_frame(EraseMode::Extended, 0, MASS_ERASE).unwrap(),
            vec![0xFF, 0xFF, 0x00]
        );
        let frame = erase_frame(EraseMode::Extended, 0x0100, 2).unwrap();
        assert_eq!(frame[..6], [0x00, 0x01, 0x01, 0x00, 0x01, 0x01]);
        assert_eq!(frame[6], checksum(&frame[..6]));
    }

    #[test]
    fn command_table_from_get_reply() {
        let raw = [
            0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x44, 0x63, 0x73, 0x82, 0x92, 0xAA,
        ];
        let (table, extra) = CommandTable::parse(&raw).unwrap();
        assert_eq!(extra, 1);
        assert_eq!(table.erase, 0x44);
        assert_eq!(table.erase_mode(), EraseMode::Extended);
        assert_eq!(table.readout_unprotect, 0x92);
        assert!(CommandTable::parse(&raw[..5]).is_err());
        assert_eq!(EraseMode::from_opcode(0x43), EraseMode::Regular);
    }

    #[test]
    fn write_protect_sector_list() {
        assert_eq!(write_protect_frame(&[1, 2]).unwrap(), vec![1, 1, 2, 1 ^ 1 ^ 2]);
        assert!(write_protect_frame(&[]).is_err());
    }
}
