//! Native serial port implementation using the `serialport` crate.

use {
    crate::{
        device::SerialEndpoint,
        error::{Error, Result},
        port::{Port, PortEnumerator, SerialConfig},
    },
    log::trace,
    serialport::{DataBits, FlowControl, Parity, StopBits},
    std::io::{Read, Write},
};

/// Native serial port implementation.
pub struct NativePort {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
}

impl NativePort {
    /// Open a serial port with the given configuration.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .dtr_on_open(config.dtr_on_open)
            .open()?;

        trace!(
            "Opened {} at {} baud (DTR {})",
            config.port_name, config.baud_rate, config.dtr_on_open
        );

        Ok(Self {
            port: Some(port),
            name: config
                .port_name
                .clone(),
        })
    }

    fn closed_error() -> Error {
        Error::Serial(serialport::Error::new(
            serialport::ErrorKind::NoDevice,
            "Port is closed",
        ))
    }
}

impl Port for NativePort {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        trace!("Setting DTR to {level}");
        match self.port {
            Some(ref mut p) => {
                p.write_data_terminal_ready(level)?;
                Ok(())
            },
            None => Err(Self::closed_error()),
        }
    }

    fn close(&mut self) -> Result<()> {
        // Take ownership of the port and let it drop (close)
        if self
            .port
            .take()
            .is_some()
        {
            trace!("Closed {}", self.name);
        }
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(|p| p.read(buf))
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(|p| p.write(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(std::io::Write::flush)
    }
}

/// Native port enumerator.
pub struct NativePortEnumerator;

impl PortEnumerator for NativePortEnumerator {
    fn list_ports() -> Result<Vec<SerialEndpoint>> {
        let ports = serialport::available_ports().map_err(Error::Serial)?;

        Ok(ports
            .into_iter()
            .map(|p| match p.port_type {
                serialport::SerialPortType::UsbPort(info) => SerialEndpoint {
                    name: p.port_name,
                    vid: Some(info.vid),
                    pid: Some(info.pid),
                    manufacturer: info.manufacturer,
                    product: info.product,
                    serial_number: info.serial_number,
                },
                _ => SerialEndpoint::bare(p.port_name),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_list_ports() {
        // This test just verifies that list_ports doesn't panic
        let _ = NativePortEnumerator::list_ports();
    }

    #[test]
    fn test_serial_config_default() {
        let config = SerialConfig::default();
        assert_eq!(config.baud_rate, 115200);
        assert!(config.dtr_on_open);
    }

    #[test]
    fn test_serial_config_builder() {
        let config = SerialConfig::new("/dev/ttyACM0", 1200)
            .with_timeout(Duration::from_secs(5))
            .with_dtr_on_open(false);

        assert_eq!(config.port_name, "/dev/ttyACM0");
        assert_eq!(config.baud_rate, 1200);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert!(!config.dtr_on_open);
    }

    #[test]
    fn test_open_missing_port_fails() {
        assert!(NativePort::open(&SerialConfig::new("/dev/yunflash-does-not-exist", 115200)).is_err());
    }
}
