//! Abstract Device transport interface.
use crate::{Error, Result};

pub use self::serial::{parse_baud_rate, SerialConfig, SerialTransport};

mod serial;

#[cfg(test)]
pub(crate) mod mock;

/// Abstraction of the byte-oriented, half-duplex link to the bootloader.
///
/// `recv_raw` must fill the whole buffer or fail; a deadline expiring
/// surfaces as [`Error::Timeout`] so callers can tell silence from a broken
/// link.
pub trait Transport {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()>;
    fn recv_raw(&mut self, buf: &mut [u8]) -> Result<()>;

    fn send(&mut self, raw: &[u8]) -> Result<()> {
        log::debug!("=> {}", hex::encode(raw));
        self.send_raw(raw)
    }

    fn recv_byte(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.recv_raw(&mut buf)?;
        log::debug!("<= {:02x}", buf[0]);
        Ok(buf[0])
    }

    fn recv_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.recv_raw(&mut buf)?;
        log::debug!("<= {}", hex::encode(&buf));
        Ok(buf)
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        (**self).send_raw(raw)
    }

    fn recv_raw(&mut self, buf: &mut [u8]) -> Result<()> {
        (**self).recv_raw(buf)
    }
}

/// Maps the OS read deadline onto the protocol-level timeout.
pub(crate) fn map_io_error(err: std::io::Error) -> Error {
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Error::Timeout,
        _ => Error::Io(err),
    }
}
