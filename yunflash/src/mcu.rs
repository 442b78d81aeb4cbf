//! Microcontroller flashing through an external `avrdude` process.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::error::{Error, Result};
use crate::port::{NativePortEnumerator, PortEnumerator};
use crate::watcher::{self, WatchConfig};

/// Delay between the bootloader port appearing and starting the tool.
const BOOTLOADER_SETTLE: Duration = Duration::from_secs(1);

/// Deadline for the sketch's port to come back after flashing.
const SKETCH_RESET_TIMEOUT: Duration = Duration::from_secs(5);

/// Serial terminal sketch bridging the Linux console to USB.
pub const TERMINAL_HEX: &str = "mcu_serial_terminal.hex";

/// Final MCU firmware.
pub const FIRMWARE_HEX: &str = "mcu_firmware.hex";

/// Invocation parameters of the external flashing tool.
#[derive(Debug, Clone)]
pub struct McuFlasher {
    /// Path of the tool binary.
    pub tool: PathBuf,
    /// Tool configuration file.
    pub config_file: PathBuf,
    /// Directory holding the hex files.
    pub hex_dir: PathBuf,
    /// Chip identifier.
    pub part: String,
    /// Programmer identifier.
    pub programmer: String,
    /// Bootloader baud rate.
    pub baud: u32,
}

impl McuFlasher {
    /// Flasher for a tool bundle laid out as `<dir>/bin/avrdude` and `<dir>/etc/avrdude.conf`.
    pub fn from_bundle(dir: &Path) -> Self {
        let binary = if cfg!(windows) { "avrdude.exe" } else { "avrdude" };
        Self {
            tool: dir.join("bin").join(binary),
            config_file: dir.join("etc").join("avrdude.conf"),
            hex_dir: dir.to_path_buf(),
            part: "atmega32u4".to_string(),
            programmer: "avr109".to_string(),
            baud: 57_600,
        }
    }

    /// Arguments for writing `hex` through `port`.
    pub fn args(&self, port: &str, hex: &Path) -> Vec<String> {
        vec![
            format!("-C{}", self.config_file.display()),
            "-v".to_string(),
            format!("-p{}", self.part),
            format!("-c{}", self.programmer),
            format!("-P{port}"),
            format!("-b{}", self.baud),
            "-D".to_string(),
            format!("-Uflash:w:{}:i", hex.display()),
        ]
    }

    /// Reset the MCU into its bootloader, write `hex_name`, and return the port
    /// the new sketch enumerated on.
    pub fn flash_hex(&self, port: &str, hex_name: &str) -> Result<String> {
        let bootloader_port = watcher::reset_board(port, true)?;

        thread::sleep(BOOTLOADER_SETTLE);

        let before = NativePortEnumerator::port_names().unwrap_or_default();
        let hex = self.hex_dir.join(hex_name);
        run_tool(&self.tool, &self.args(&bootloader_port, &hex))?;

        Ok(watcher::wait_for_reset(
            &before,
            &bootloader_port,
            SKETCH_RESET_TIMEOUT,
            &WatchConfig::default(),
            NativePortEnumerator::port_names,
        ))
    }
}

/// Forward every line of `reader` to the log.
fn forward_lines<R: Read + Send + 'static>(reader: R, is_stderr: bool) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for line in BufReader::new(reader)
            .lines()
            .map_while(std::result::Result::ok)
        {
            if is_stderr {
                warn!("{line}");
            } else {
                info!("{line}");
            }
        }
    })
}

/// Run an external program, streaming its output to the log.
///
/// Success is solely a zero exit status.
pub fn run_tool(program: &Path, args: &[String]) -> Result<()> {
    let args: Vec<String> = args
        .iter()
        .map(|a| a.replace('"', ""))
        .collect();
    info!("Flashing with command: {} {}", program.display(), args.join(" "));

    let mut child = Command::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::SubprocessFailure {
            program: program.display().to_string(),
            status: format!("could not start: {e}"),
        })?;

    let forwarders: Vec<_> = [
        child
            .stdout
            .take()
            .map(|out| forward_lines(out, false)),
        child
            .stderr
            .take()
            .map(|err| forward_lines(err, true)),
    ]
    .into_iter()
    .flatten()
    .collect();

    let status = child.wait()?;
    for handle in forwarders {
        let _ = handle.join();
    }

    if status.success() {
        Ok(())
    } else {
        Err(Error::SubprocessFailure {
            program: program.display().to_string(),
            status: status.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_layout() {
        let flasher = McuFlasher::from_bundle(Path::new("/opt/avr"));
        let args = flasher.args("/dev/ttyACM0", Path::new("/opt/avr/mcu_firmware.hex"));

        assert_eq!(args[0], "-C/opt/avr/etc/avrdude.conf");
        assert!(args.contains(&"-patmega32u4".to_string()));
        assert!(args.contains(&"-cavr109".to_string()));
        assert!(args.contains(&"-P/dev/ttyACM0".to_string()));
        assert!(args.contains(&"-b57600".to_string()));
        assert_eq!(
            args.last().map(String::as_str),
            Some("-Uflash:w:/opt/avr/mcu_firmware.hex:i")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_run_tool_zero_exit() {
        let args = vec!["-c".to_string(), "echo flashing; echo oops >&2".to_string()];
        assert!(run_tool(Path::new("/bin/sh"), &args).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_run_tool_nonzero_exit() {
        let args = vec!["-c".to_string(), "exit 3".to_string()];
        let err = run_tool(Path::new("/bin/sh"), &args).unwrap_err();
        assert!(matches!(err, Error::SubprocessFailure { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_run_tool_missing_binary() {
        let err = run_tool(Path::new("/nonexistent/avrdude"), &[]).unwrap_err();
        assert!(matches!(err, Error::SubprocessFailure { .. }));
    }
}
