//! Tracking a serial device across a hardware reset.
//!
//! After a reset the board's USB device disappears and re-enumerates, possibly
//! under another name. The watcher only compares port listings; it never
//! opens or claims a device itself.

use std::collections::HashSet;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::is_interrupted_requested;
use crate::port::{NativePort, NativePortEnumerator, Port, PortEnumerator, RESET_BAUD, SerialConfig};

/// Interval between two port listings.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Time given to a freshly enumerated port before it is used.
pub const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// How long DTR is held low during the 1200 bps touch.
const TOUCH_HOLD: Duration = Duration::from_millis(200);

/// Deadline for the port to disappear and reappear after a touch.
pub const RESET_TIMEOUT: Duration = Duration::from_secs(10);

/// Return the first element present in only one of the two listings.
///
/// Elements of `a` are checked before elements of `b`.
pub fn differ(a: &[String], b: &[String]) -> Option<String> {
    let set_a: HashSet<&str> = a.iter().map(String::as_str).collect();
    let set_b: HashSet<&str> = b.iter().map(String::as_str).collect();

    a.iter()
        .find(|name| !set_b.contains(name.as_str()))
        .or_else(|| {
            b.iter()
                .find(|name| !set_a.contains(name.as_str()))
        })
        .cloned()
}

/// Polling parameters of the watcher.
#[derive(Debug, Clone, Copy)]
pub struct WatchConfig {
    /// Interval between two listings.
    pub poll_interval: Duration,
    /// Pause after the new port was found.
    pub settle: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            settle: SETTLE_DELAY,
        }
    }
}

/// Poll until the listing differs from `baseline` or the deadline passes.
fn poll_change<F>(baseline: &[String], deadline: Instant, config: &WatchConfig, list: &mut F) -> Option<String>
where
    F: FnMut() -> Result<Vec<String>>,
{
    loop {
        match list() {
            Ok(ports) => {
                if let Some(port) = differ(&ports, baseline) {
                    return Some(port);
                }
            },
            Err(e) => debug!("Port listing failed: {e}"),
        }

        if Instant::now() >= deadline || is_interrupted_requested() {
            return None;
        }
        thread::sleep(config.poll_interval);
    }
}

/// Wait for a port to disappear and a port to reappear after a reset.
///
/// Both phases share one deadline. If no port reappears in time, the
/// original name is returned (some boards reset without re-enumerating).
pub fn wait_for_reset<F>(
    before_reset: &[String],
    original: &str,
    timeout: Duration,
    config: &WatchConfig,
    mut list: F,
) -> String
where
    F: FnMut() -> Result<Vec<String>>,
{
    let deadline = Instant::now() + timeout;

    info!("Wait for the port to disappear");
    match poll_change(before_reset, deadline, config, &mut list) {
        Some(port) => debug!("Port change detected: {port}"),
        None => debug!("No port disappeared before the deadline"),
    }

    info!("Wait for the port to reappear");
    let after_reset = list().unwrap_or_default();
    if let Some(port) = poll_change(&after_reset, deadline, config, &mut list) {
        info!("Found upload port: {port}");
        thread::sleep(config.settle);
        return port;
    }

    let timeout = Error::DeviceTimeout {
        original: original.to_string(),
    };
    warn!("{timeout}, trying {original}");
    original.to_string()
}

/// Open the port at 1200 bps with DTR low, which restarts the MCU bootloader.
pub fn touch_at_1200bps(port_name: &str) -> Result<()> {
    let config = SerialConfig::new(port_name, RESET_BAUD);
    let mut port = NativePort::open(&config)?;

    debug!("Touching {} at {RESET_BAUD} bps", port.name());
    port.set_dtr(false)?;

    // Wait a bit to allow restart of the board
    thread::sleep(TOUCH_HOLD);

    port.close()
}

/// Reset the board through its serial port.
///
/// Returns the port name to use afterwards, which may differ from `port_name`.
pub fn reset_board(port_name: &str, wait: bool) -> Result<String> {
    info!("Restarting in bootloader mode");

    let before_reset = NativePortEnumerator::port_names()?;
    touch_at_1200bps(port_name)?;

    if !wait {
        return Ok(port_name.to_string());
    }

    Ok(wait_for_reset(
        &before_reset,
        port_name,
        RESET_TIMEOUT,
        &WatchConfig::default(),
        NativePortEnumerator::port_names,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter()
            .map(|s| (*s).to_string())
            .collect()
    }

    fn fast() -> WatchConfig {
        WatchConfig {
            poll_interval: Duration::from_millis(1),
            settle: Duration::ZERO,
        }
    }

    /// Replays listings in order, repeating the last one forever.
    fn replay(listings: Vec<Vec<String>>) -> impl FnMut() -> Result<Vec<String>> {
        let mut queue: VecDeque<Vec<String>> = listings.into();
        move || {
            if queue.len() > 1 {
                Ok(queue
                    .pop_front()
                    .unwrap_or_default())
            } else {
                Ok(queue
                    .front()
                    .cloned()
                    .unwrap_or_default())
            }
        }
    }

    #[test]
    fn test_differ_single_element() {
        let a = names(&["/dev/ttyS0", "/dev/ttyACM0"]);
        let b = names(&["/dev/ttyS0"]);
        assert_eq!(differ(&a, &b).as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(differ(&b, &a).as_deref(), Some("/dev/ttyACM0"));
    }

    #[test]
    fn test_differ_identical_lists() {
        let a = names(&["/dev/ttyS0", "/dev/ttyACM0"]);
        let b = names(&["/dev/ttyACM0", "/dev/ttyS0"]);
        assert_eq!(differ(&a, &b), None);
        assert_eq!(differ(&[], &[]), None);
    }

    #[test]
    fn test_wait_for_reset_returns_renamed_port() {
        let before = names(&["/dev/ttyS0", "/dev/ttyACM0"]);
        let list = replay(vec![
            names(&["/dev/ttyS0", "/dev/ttyACM0"]),
            names(&["/dev/ttyS0"]),
            names(&["/dev/ttyS0"]),
            names(&["/dev/ttyS0"]),
            names(&["/dev/ttyS0", "/dev/ttyACM1"]),
        ]);

        let port = wait_for_reset(&before, "/dev/ttyACM0", Duration::from_secs(2), &fast(), list);
        assert_eq!(port, "/dev/ttyACM1");
    }

    #[test]
    fn test_wait_for_reset_falls_back_to_original() {
        let before = names(&["/dev/ttyACM0"]);
        let list = replay(vec![names(&["/dev/ttyACM0"])]);

        let start = Instant::now();
        let port = wait_for_reset(&before, "/dev/ttyACM0", Duration::from_millis(50), &fast(), list);

        assert_eq!(port, "/dev/ttyACM0");
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_wait_for_reset_tolerates_listing_errors() {
        let before = names(&["/dev/ttyACM0"]);
        let mut calls = 0;
        let list = move || {
            calls += 1;
            match calls {
                1 => Err(Error::DeviceNotFound),
                2 => Ok(Vec::new()),
                3 => Ok(Vec::new()),
                _ => Ok(names(&["/dev/ttyACM0"])),
            }
        };

        let port = wait_for_reset(&before, "/dev/ttyACM9", Duration::from_secs(2), &fast(), list);
        assert_eq!(port, "/dev/ttyACM0");
    }
}
