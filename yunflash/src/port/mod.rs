//! Port abstraction for serial communication.
//!
//! The console session is generic over any `Read + Write` transport, so
//! protocol code can be exercised against scripted in-memory transports.
//! The `Port` trait adds the serial-only controls (DTR, close) needed by the
//! 1200 bps reset touch.
//!
//! ```text
//! +------------------+     +------------------+
//! | Console Session  |     |   Reset touch    |
//! |  (send/expect)   |     |   (1200 bps)     |
//! +--------+---------+     +--------+---------+
//!          |                        |
//!          v                        v
//! +--------+---------+     +--------+---------+
//! |   Read + Write   |<----+    Port Trait    |
//! +--------+---------+     +--------+---------+
//!          |                        |
//!          v                        v
//! +--------+------------------------+---------+
//! |   Native SerialPort / ScriptedPort (test)  |
//! +-------------------------------------------+
//! ```

pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use crate::device::SerialEndpoint;
use crate::error::Result;

/// Baud rate of the bridged Linux console.
pub const CONSOLE_BAUD: u32 = 115_200;

/// Baud rate that makes the MCU bootloader restart when the port is closed.
pub const RESET_BAUD: u32 = 1200;

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyACM0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout.
    pub timeout: Duration,
    /// DTR level applied when the port is opened.
    pub dtr_on_open: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: CONSOLE_BAUD,
            timeout: Duration::from_millis(100),
            dtr_on_open: true,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the DTR level applied on open.
    #[must_use]
    pub fn with_dtr_on_open(mut self, level: bool) -> Self {
        self.dtr_on_open = level;
        self
    }
}

/// Unified port trait for serial communication.
pub trait Port: Read + Write + Send {
    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Set DTR (Data Terminal Ready) pin state.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;
}

/// Trait for listing available serial ports.
///
/// This is separated from `Port` because it's a static operation that
/// doesn't require an open port instance.
pub trait PortEnumerator {
    /// List all available serial ports with their USB metadata.
    fn list_ports() -> Result<Vec<SerialEndpoint>>;

    /// List only the port names, as used for before/after reset snapshots.
    fn port_names() -> Result<Vec<String>> {
        Ok(Self::list_ports()?
            .into_iter()
            .map(|p| p.name)
            .collect())
    }
}

pub use native::{NativePort, NativePortEnumerator};
