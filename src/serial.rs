//! Serial port transport for sticks enumerating as USB CDC devices

use log::{debug, info};
use serialport::{SerialPortType, UsbPortInfo};
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use crate::transport::StickTransport;

/// USB IDs of the TI CC1111 stick firmware
pub const STICK_VID: u16 = 0x0451;
pub const STICK_PID: u16 = 0x16A7;

// USB CDC ignores it, but the OS wants one
const BAUD_RATE: u32 = 115_200;

pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialTransport {
    pub fn new(port_name: &str, baud_rate: u32) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(Duration::from_secs(1))
            .open()?;
        port.clear(serialport::ClearBuffer::All)?;
        info!("Opened stick on {}", port_name);

        Ok(Self { port })
    }

    /// Open the first serial port whose USB IDs match the stick
    pub fn find() -> Result<Self, serialport::Error> {
        let ports = serialport::available_ports()?;
        let stick = ports.iter().find(|port| {
            debug!("Found serial port {}", port.port_name);
            matches!(
                port.port_type,
                SerialPortType::UsbPort(UsbPortInfo { vid: STICK_VID, pid: STICK_PID, .. })
            )
        });

        match stick {
            Some(port) => Self::new(&port.port_name, BAUD_RATE),
            None => Err(serialport::Error::new(
                serialport::ErrorKind::NoDevice,
                "no radio stick connected",
            )),
        }
    }
}

impl StickTransport for SerialTransport {
    type Error = std::io::Error;

    fn write(&mut self, data: &[u8]) -> Result<usize, Self::Error> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, Self::Error> {
        self.port
            .set_timeout(Duration::from_millis(timeout_ms as u64))
            .map_err(std::io::Error::other)?;
        match self.port.read(buf) {
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(0),
            other => other,
        }
    }

    fn clear_input(&mut self) -> Result<(), Self::Error> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(std::io::Error::other)
    }
}
