//! Serial endpoint discovery and board classification.
//!
//! Endpoints are identified only by their platform name, which can change
//! when the board re-enumerates after a reset. USB metadata is used to pick
//! the port to flash, never to correlate a port before and after a reset.

use log::{debug, info, trace};

use crate::error::{Error, Result};
use crate::port::{NativePortEnumerator, PortEnumerator};

/// Board kinds recognized by their USB VID/PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardKind {
    /// Genuine Arduino board (application or bootloader PID).
    Arduino,
    /// Arduino.org (Arduino SRL) board.
    ArduinoSrl,
    /// Anything else.
    Unknown,
}

/// Known VID/PID pairs of boards whose MCU can bridge the Linux console.
const KNOWN_BOARDS: &[(u16, &[u16], BoardKind)] = &[
    (0x2341, &[0x8041, 0x0041, 0x8051, 0x0051], BoardKind::Arduino),
    (0x2A03, &[0x8041, 0x0041], BoardKind::ArduinoSrl),
];

impl BoardKind {
    /// Classify a VID/PID combination.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        for (known_vid, pids, kind) in KNOWN_BOARDS {
            if vid == *known_vid && pids.contains(&pid) {
                return *kind;
            }
        }
        Self::Unknown
    }

    /// Get a human-readable name for the board kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Arduino => "Arduino",
            Self::ArduinoSrl => "Arduino SRL",
            Self::Unknown => "Unknown",
        }
    }

    /// Check if this board can be flashed by this tool.
    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// A serial endpoint and its capability metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SerialEndpoint {
    /// Platform device name (e.g., "/dev/ttyACM0" or "COM3").
    pub name: String,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

impl SerialEndpoint {
    /// An endpoint without USB metadata.
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }

    /// Whether the endpoint is a USB device.
    pub fn is_usb(&self) -> bool {
        self.vid.is_some() && self.pid.is_some()
    }

    /// Classify the endpoint by its USB identifiers.
    pub fn board(&self) -> BoardKind {
        match (self.vid, self.pid) {
            (Some(vid), Some(pid)) => BoardKind::from_vid_pid(vid, pid),
            _ => BoardKind::Unknown,
        }
    }
}

/// List all serial endpoints. Enumeration failures yield an empty list.
pub fn list_endpoints() -> Vec<SerialEndpoint> {
    match NativePortEnumerator::list_ports() {
        Ok(ports) => ports,
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            Vec::new()
        },
    }
}

/// Names of all serial ports.
pub fn list_port_names() -> Result<Vec<String>> {
    NativePortEnumerator::port_names()
}

/// Pick the first USB endpoint that belongs to a supported board.
pub fn select_flashing_port(ports: &[SerialEndpoint]) -> Result<SerialEndpoint> {
    if ports.is_empty() {
        return Err(Error::DeviceNotFound);
    }

    for port in ports.iter().filter(|p| p.is_usb()) {
        info!(
            "Found serial port: {} ID: {:04x}:{:04x} Serial number: {}",
            port.name,
            port.vid.unwrap_or_default(),
            port.pid.unwrap_or_default(),
            port.serial_number.as_deref().unwrap_or("-")
        );
        if port.board().is_supported() {
            info!("Using {} [{}]", port.name, port.board().name());
            return Ok(port.clone());
        }
        trace!("Skipping {}: not a supported board", port.name);
    }

    Err(Error::DeviceNotFound)
}

/// Locate the serial port of the board to flash.
pub fn find_flashing_port() -> Result<SerialEndpoint> {
    let ports = NativePortEnumerator::list_ports()?;
    select_flashing_port(&ports)
}

/// Format a list of endpoints for display.
pub fn format_port_list(ports: &[SerialEndpoint]) -> Vec<String> {
    let mut result = Vec::new();

    for port in ports {
        let device_info = if port.board().is_supported() {
            format!(" [{}]", port.board().name())
        } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" [VID:{vid:04X} PID:{pid:04X}]")
        } else {
            String::new()
        };

        let product_info = port
            .product
            .as_ref()
            .map(|p| format!(" - {p}"))
            .unwrap_or_default();

        result.push(format!("{}{}{}", port.name, device_info, product_info));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb(name: &str, vid: u16, pid: u16) -> SerialEndpoint {
        SerialEndpoint {
            vid: Some(vid),
            pid: Some(pid),
            product: Some("Board".to_string()),
            ..SerialEndpoint::bare(name)
        }
    }

    #[test]
    fn test_board_kind_from_vid_pid() {
        assert_eq!(BoardKind::from_vid_pid(0x2341, 0x8041), BoardKind::Arduino);
        assert_eq!(BoardKind::from_vid_pid(0x2341, 0x0051), BoardKind::Arduino);
        assert_eq!(BoardKind::from_vid_pid(0x2A03, 0x0041), BoardKind::ArduinoSrl);
        assert_eq!(BoardKind::from_vid_pid(0x2A03, 0x8051), BoardKind::Unknown);
        assert_eq!(BoardKind::from_vid_pid(0x1A86, 0x7523), BoardKind::Unknown);
    }

    #[test]
    fn test_select_skips_unknown_and_non_usb() {
        let ports = vec![
            SerialEndpoint::bare("/dev/ttyS0"),
            usb("/dev/ttyUSB0", 0x1A86, 0x7523),
            usb("/dev/ttyACM0", 0x2341, 0x8041),
            usb("/dev/ttyACM1", 0x2341, 0x0041),
        ];
        let selected = select_flashing_port(&ports).unwrap();
        assert_eq!(selected.name, "/dev/ttyACM0");
    }

    #[test]
    fn test_select_without_ports_is_not_found() {
        assert!(matches!(
            select_flashing_port(&[]),
            Err(Error::DeviceNotFound)
        ));
        assert!(matches!(
            select_flashing_port(&[SerialEndpoint::bare("/dev/ttyS0")]),
            Err(Error::DeviceNotFound)
        ));
    }

    #[test]
    fn test_format_port_list() {
        let ports = vec![
            usb("/dev/ttyACM0", 0x2341, 0x8041),
            usb("/dev/ttyUSB0", 0x1A86, 0x7523),
            SerialEndpoint::bare("/dev/ttyS0"),
        ];

        let formatted = format_port_list(&ports);
        assert_eq!(formatted.len(), 3);
        assert!(formatted[0].contains("[Arduino]"));
        assert!(formatted[1].contains("VID:1A86 PID:7523"));
        assert_eq!(formatted[2], "/dev/ttyS0");
    }
}
