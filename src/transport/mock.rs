//! In-memory STM32 bootloader used by the unit tests.
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::Transport;
use crate::constants::{commands, replies};
use crate::protocol::checksum;
use crate::{Error, Result};

const ACK: u8 = replies::ACK;
const NACK: u8 = replies::NACK;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Command,
    ReadAddress,
    ReadLength(u32),
    WriteAddress,
    WriteData(u32),
    Erase,
    ExtendedErase,
    Go,
    WriteProtect,
    /// Executing user code; nothing more is answered.
    Running,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EraseRecord {
    Mass,
    Pages(Vec<u16>),
}

pub struct MockBootloader {
    pub pid: u16,
    pub version: u8,
    pub option1: u8,
    pub option2: u8,
    pub erase_opcode: u8,
    pub page_size: u32,
    pub flash_start: u32,
    /// Opcodes appended to the GET reply beyond the known eleven
    pub extra_commands: Vec<u8>,
    /// Bytes appended to the GET-ID reply after the product ID
    pub extra_id_bytes: Vec<u8>,
    /// Number of ID bytes announced and sent in GET-ID, instead of all
    pub id_len_override: Option<u8>,
    /// INIT bytes to ignore before answering
    pub silent_inits: usize,
    /// Reply to INIT once it is answered
    pub init_reply: u8,
    /// Opcodes the device refuses
    pub nacked: BTreeSet<u8>,
    /// Addresses that never take a written value and read back as given
    pub stuck: BTreeMap<u32, u8>,
    /// Number of upcoming Read Memory replies with the first byte flipped
    pub flaky_reads: usize,
    /// Read Memory addresses whose next reply has the first byte flipped
    pub flaky_blocks: BTreeSet<u32>,

    pub memory: BTreeMap<u32, u8>,
    pub writes: Vec<(u32, Vec<u8>)>,
    pub raw_writes: Vec<Vec<u8>>,
    pub reads: Vec<(u32, usize)>,
    pub erases: Vec<EraseRecord>,
    pub go_address: Option<u32>,
    pub protect_calls: Vec<u8>,
    pub protected_sectors: Vec<u8>,

    state: State,
    rx: Vec<u8>,
    tx: VecDeque<u8>,
}

impl MockBootloader {
    pub fn new(pid: u16, erase_opcode: u8, page_size: u32) -> Self {
        MockBootloader {
            pid,
            version: 0x22,
            option1: 0x00,
            option2: 0x00,
            erase_opcode,
            page_size,
            flash_start: 0x0800_0000,
            extra_commands: Vec::new(),
            extra_id_bytes: Vec::new(),
            id_len_override: None,
            silent_inits: 0,
            init_reply: ACK,
            nacked: BTreeSet::new(),
            stuck: BTreeMap::new(),
            flaky_reads: 0,
            flaky_blocks: BTreeSet::new(),
            memory: BTreeMap::new(),
            writes: Vec::new(),
            raw_writes: Vec::new(),
            reads: Vec::new(),
            erases: Vec::new(),
            go_address: None,
            protect_calls: Vec::new(),
            protected_sectors: Vec::new(),
            state: State::Command,
            rx: Vec::new(),
            tx: VecDeque::new(),
        }
    }

    /// STM32F Medium-density, regular erase, 1 KiB pages.
    pub fn medium_density() -> Self {
        Self::new(0x410, commands::ERASE, 1024)
    }

    /// STM32L Medium-density, extended erase, 256 byte pages.
    pub fn l1_medium_density() -> Self {
        Self::new(0x416, commands::EXTENDED_ERASE, 256)
    }

    pub fn peek(&self, address: u32, len: usize) -> Vec<u8> {
        (address..address + len as u32)
            .map(|a| *self.memory.get(&a).unwrap_or(&0xFF))
            .collect()
    }

    pub fn poke(&mut self, address: u32, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.memory.insert(address + i as u32, *b);
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == State::Running
    }

    fn opcodes(&self) -> [u8; 11] {
        [
            0x00,
            0x01,
            0x02,
            0x11,
            0x21,
            0x31,
            self.erase_opcode,
            0x63,
            0x73,
            0x82,
            0x92,
        ]
    }

    fn reply(&mut self, bytes: &[u8]) {
        self.tx.extend(bytes.iter().copied());
    }

    fn take(&mut self, n: usize) -> Option<Vec<u8>> {
        if self.rx.len() < n {
            return None;
        }
        Some(self.rx.drain(..n).collect())
    }

    fn take_address(&mut self) -> Option<std::result::Result<u32, ()>> {
        let raw = self.take(5)?;
        if checksum(&raw[..4]) != raw[4] {
            return Some(Err(()));
        }
        Some(Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])))
    }

    fn process(&mut self) {
        loop {
            let progressed = match self.state {
                State::Running => {
                    self.rx.clear();
                    false
                }
                State::Command => self.on_command(),
                State::ReadAddress => match self.take_address() {
                    None => false,
                    Some(Ok(address)) => {
                        self.reply(&[ACK]);
                        self.state = State::ReadLength(address);
                        true
                    }
                    Some(Err(())) => self.fail(),
                },
                State::ReadLength(address) => match self.take(2) {
                    None => false,
                    Some(raw) if raw[0] ^ raw[1] != 0xFF => self.fail(),
                    Some(raw) => {
                        let len = raw[0] as usize + 1;
                        self.reads.push((address, len));
                        let mut data = self.peek(address, len);
                        if self.flaky_reads > 0 {
                            self.flaky_reads -= 1;
                            data[0] ^= 0x5A;
                        } else if self.flaky_blocks.remove(&address) {
                            data[0] ^= 0x5A;
                        }
                        self.reply(&[ACK]);
                        self.reply(&data);
                        self.state = State::Command;
                        true
                    }
                },
                State::WriteAddress => match self.take_address() {
                    None => false,
                    Some(Ok(address)) => {
                        self.reply(&[ACK]);
                        self.state = State::WriteData(address);
                        true
                    }
                    Some(Err(())) => self.fail(),
                },
                State::WriteData(address) => {
                    let Some(&n) = self.rx.first() else {
                        return;
                    };
                    match self.take(n as usize + 3) {
                        None => false,
                        Some(raw) if checksum(&raw[..raw.len() - 1]) != raw[raw.len() - 1] => {
                            self.fail()
                        }
                        Some(raw) => {
                            let data = raw[1..raw.len() - 1].to_vec();
                            for (i, b) in data.iter().enumerate() {
                                let a = address + i as u32;
                                let v = self.stuck.get(&a).copied().unwrap_or(*b);
                                self.memory.insert(a, v);
                            }
                            self.raw_writes.push(raw);
                            self.writes.push((address, data));
                            self.reply(&[ACK]);
                            self.state = State::Command;
                            true
                        }
                    }
                }
                State::Erase => self.on_erase(),
                State::ExtendedErase => self.on_extended_erase(),
                State::Go => match self.take_address() {
                    None => false,
                    Some(Ok(address)) => {
                        self.go_address = Some(address);
                        self.reply(&[ACK]);
                        self.state = State::Running;
                        true
                    }
                    Some(Err(())) => self.fail(),
                },
                State::WriteProtect => {
                    let Some(&n) = self.rx.first() else {
                        return;
                    };
                    match self.take(n as usize + 3) {
                        None => false,
                        Some(raw) if checksum(&raw[..raw.len() - 1]) != raw[raw.len() - 1] => {
                            self.fail()
                        }
                        Some(raw) => {
                            self.protected_sectors = raw[1..raw.len() - 1].to_vec();
                            self.reply(&[ACK]);
                            self.state = State::Command;
                            true
                        }
                    }
                }
            };
            if !progressed {
                return;
            }
        }
    }

    fn fail(&mut self) -> bool {
        self.reply(&[NACK]);
        self.state = State::Command;
        true
    }

    fn on_command(&mut self) -> bool {
        if self.rx.first() == Some(&commands::INIT) {
            self.rx.remove(0);
            if self.silent_inits > 0 {
                self.silent_inits -= 1;
            } else {
                let reply = self.init_reply;
                self.reply(&[reply]);
            }
            return true;
        }
        let Some(raw) = self.take(2) else {
            return false;
        };
        let opcode = raw[0];
        if raw[1] != opcode ^ 0xFF || self.nacked.contains(&opcode) {
            return self.fail();
        }
        self.reply(&[ACK]);
        match opcode {
            0x00 => {
                let mut listed = self.opcodes().to_vec();
                listed.extend_from_slice(&self.extra_commands);
                let len = listed.len() as u8;
                let version = self.version;
                self.reply(&[len, version]);
                self.reply(&listed);
                self.reply(&[ACK]);
            }
            0x01 => {
                let (v, o1, o2) = (self.version, self.option1, self.option2);
                self.reply(&[v, o1, o2, ACK]);
            }
            0x02 => {
                let mut id = self.pid.to_be_bytes().to_vec();
                id.extend_from_slice(&self.extra_id_bytes);
                if let Some(n) = self.id_len_override {
                    id.truncate(n as usize);
                }
                self.reply(&[id.len() as u8 - 1]);
                self.reply(&id);
                self.reply(&[ACK]);
            }
            0x11 => self.state = State::ReadAddress,
            0x21 => self.state = State::Go,
            0x31 => self.state = State::WriteAddress,
            0x43 => self.state = State::Erase,
            0x44 => self.state = State::ExtendedErase,
            0x63 => self.state = State::WriteProtect,
            0x73 | 0x82 | 0x92 => {
                self.protect_calls.push(opcode);
                self.reply(&[ACK]);
            }
            _ => {}
        }
        true
    }

    fn erase_pages(&mut self, pages: &[u16]) {
        for &page in pages {
            let start = self.flash_start + page as u32 * self.page_size;
            let keys: Vec<u32> = self
                .memory
                .range(start..start + self.page_size)
                .map(|(k, _)| *k)
                .collect();
            keys.iter().for_each(|k| {
                self.memory.remove(k);
            });
        }
    }

    fn on_erase(&mut self) -> bool {
        let Some(&n) = self.rx.first() else {
            return false;
        };
        if n == 0xFF {
            let Some(raw) = self.take(2) else {
                return false;
            };
            if raw[1] != 0x00 {
                return self.fail();
            }
            self.memory.clear();
            self.erases.push(EraseRecord::Mass);
        } else {
            let Some(raw) = self.take(n as usize + 3) else {
                return false;
            };
            if checksum(&raw[..raw.len() - 1]) != raw[raw.len() - 1] {
                return self.fail();
            }
            let pages: Vec<u16> = raw[1..raw.len() - 1].iter().map(|&p| p as u16).collect();
            self.erase_pages(&pages);
            self.erases.push(EraseRecord::Pages(pages));
        }
        self.reply(&[ACK]);
        self.state = State::Command;
        true
    }

    fn on_extended_erase(&mut self) -> bool {
        if self.rx.len() < 2 {
            return false;
        }
        let count = u16::from_be_bytes([self.rx[0], self.rx[1]]);
        if count == 0xFFFF {
            let Some(raw) = self.take(3) else {
                return false;
            };
            if raw[2] != 0x00 || self.pid == 0x416 {
                return self.fail();
            }
            self.memory.clear();
            self.erases.push(EraseRecord::Mass);
        } else {
            let n = count as usize + 1;
            let Some(raw) = self.take(2 + 2 * n + 1) else {
                return false;
            };
            if checksum(&raw[..raw.len() - 1]) != raw[raw.len() - 1] {
                return self.fail();
            }
            let pages: Vec<u16> = raw[2..raw.len() - 1]
                .chunks(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            self.erase_pages(&pages);
            self.erases.push(EraseRecord::Pages(pages));
        }
        self.reply(&[ACK]);
        self.state = State::Command;
        true
    }
}

impl Transport for MockBootloader {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        self.rx.extend_from_slice(raw);
        self.process();
        Ok(())
    }

    fn recv_raw(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.tx.len() < buf.len() {
            self.tx.clear();
            return Err(Error::Timeout);
        }
        for b in buf.iter_mut() {
            *b = self.tx.pop_front().unwrap_or_default();
        }
        Ok(())
    }
}
