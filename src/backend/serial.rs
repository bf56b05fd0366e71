use std::io::{Read, Write};
use std::time::Duration;

use log::debug;
use serialport::SerialPort;

use crate::config::SerialConfig;
use crate::error::DeviceFault;
use crate::hardware::SerialDevice;
use crate::resource::SerialSettings;

/// Serial device opened through the `serialport` crate.
pub struct SerialPortDevice {
    path: String,
    port: Box<dyn SerialPort>,
}

impl SerialPortDevice {
    pub fn open(serial: &SerialConfig, call_timeout: Duration) -> Result<Self, DeviceFault> {
        let port = serialport::new(&serial.path, serial.baud_rate)
            .timeout(call_timeout)
            .open()
            .map_err(serial_fault)?;
        debug!("{}: opened at {} baud", serial.path, serial.baud_rate);

        Ok(Self {
            path: serial.path.clone(),
            port,
        })
    }
}

impl SerialDevice for SerialPortDevice {
    fn read_serial(&mut self, buf: &mut [u8]) -> Result<usize, DeviceFault> {
        self.port.read(buf).map_err(DeviceFault::from)
    }

    fn write_serial(&mut self, data: &[u8]) -> Result<usize, DeviceFault> {
        let n = self.port.write(data).map_err(DeviceFault::from)?;
        self.port.flush().map_err(DeviceFault::from)?;
        Ok(n)
    }

    fn configure_serial(&mut self, settings: &SerialSettings) -> Result<(), DeviceFault> {
        self.port
            .set_baud_rate(settings.baud_rate)
            .map_err(serial_fault)?;
        debug!("{}: baud rate set to {}", self.path, settings.baud_rate);
        Ok(())
    }
}

fn serial_fault(e: serialport::Error) -> DeviceFault {
    match e.kind() {
        serialport::ErrorKind::NoDevice => DeviceFault::Disconnected(e.to_string()),
        serialport::ErrorKind::InvalidInput => DeviceFault::Unsupported(e.to_string()),
        serialport::ErrorKind::Io(kind) => {
            DeviceFault::from(std::io::Error::new(kind, e.description))
        }
        _ => DeviceFault::Io(e.to_string()),
    }
}
