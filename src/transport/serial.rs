//! Serial Transportation.
use std::io::{Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use super::{map_io_error, Transport};
use crate::{Error, Result};

/// Per-read deadline; a silent device is reported as a timeout after this.
const SERIAL_TIMEOUT_MS: u64 = 3000;

/// Rates the bootloader's autobaud and common host UARTs agree on.
pub const BAUD_RATES: &[u32] = &[
    50, 75, 110, 134, 150, 200, 300, 600, 1200, 1800, 2400, 4800, 7200, 9600, 14400, 19200,
    28800, 38400, 56000, 57600, 76800, 115200, 128000, 230400, 256000, 460800, 500000, 576000,
    921600, 1000000, 1152000, 1500000, 2000000, 2500000, 3000000, 3500000, 4000000,
];

pub fn parse_baud_rate(s: &str) -> Result<u32> {
    let rate: u32 = s
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid baud rate {:?}", s)))?;
    if BAUD_RATES.contains(&rate) {
        Ok(rate)
    } else {
        Err(Error::InvalidArgument(format!(
            "invalid baud rate {}, valid options are: {:?}",
            rate, BAUD_RATES
        )))
    }
}

/// Line settings. The ROM bootloader always talks 8E1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig {
            baud_rate: 57600,
            data_bits: DataBits::Eight,
            parity: Parity::Even,
            stop_bits: StopBits::One,
            timeout: Duration::from_millis(SERIAL_TIMEOUT_MS),
        }
    }
}

impl std::fmt::Display for SerialConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        };
        let bits = match self.data_bits {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        };
        let stop = match self.stop_bits {
            StopBits::One => 1,
            StopBits::Two => 2,
        };
        write!(f, "{} {}{}{}", self.baud_rate, bits, parity, stop)
    }
}

pub struct SerialTransport {
    serial_port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    pub fn open(port: &str, config: &SerialConfig) -> Result<Self> {
        log::info!("Opening serial port: \"{}\" @ {}", port, config);
        let serial_port = serialport::new(port, config.baud_rate)
            .data_bits(config.data_bits)
            .parity(config.parity)
            .stop_bits(config.stop_bits)
            .flow_control(FlowControl::None)
            .timeout(config.timeout)
            .open()?;
        serial_port.clear(ClearBuffer::All)?;
        Ok(SerialTransport { serial_port })
    }
}

impl Transport for SerialTransport {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        self.serial_port.write_all(raw)?;
        self.serial_port.flush()?;
        Ok(())
    }

    fn recv_raw(&mut self, buf: &mut [u8]) -> Result<()> {
        self.serial_port.read_exact(buf).map_err(map_io_error)
    }
}
