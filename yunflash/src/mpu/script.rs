//! Bootloader console scripts.
//!
//! Every builder returns the batch as plain [`Step`]s; nothing here touches a
//! transport. Addresses and names embedded in patterns are escaped.

use std::net::Ipv4Addr;

use crate::console::{Step, StepResult};
use crate::context::{Artifact, FlashContext};
use crate::error::{Error, Result};

/// RAM address images are loaded to.
pub const LOAD_ADDR: &str = "0x80060000";

/// Flash address of the bootloader.
pub const BOOTLOADER_FLASH_ADDR: &str = "0x9f000000";

/// Flash address of the bootloader environment.
pub const ENV_FLASH_ADDR: &str = "0x9f040000";

/// Flash address of the system image.
pub const IMAGE_FLASH_ADDR: &str = "0x9f050000";

/// Erase granularity of the NOR flash.
pub const SECTOR_SIZE: u64 = 64 * 1024;

/// Prompt of an up-to-date bootloader.
pub const STOCK_PROMPT: &str = "arduino";

/// Autoboot stop keyword of an up-to-date bootloader.
pub const STOCK_KEYWORD: &str = "ard";

/// Any of the known autoboot banners.
pub const BANNER_PATTERN: &str = r"stop with '(?P<stop>[a-z]+)'|(?P<legacy>Hit any key to stop autoboot)|type '(?P<typed>[a-z]+)' to enter u-boot console";

/// A bootloader shell prompt such as `arduino>`.
pub const PROMPT_PATTERN: &str = r"(?P<prompt>[0-9a-zA-Z]+)>";

/// The bootloader's TFTP completion line.
pub const TRANSFERRED_PATTERN: &str = r"Bytes transferred = (?P<bytes>\d+)\D";

/// The bootloader's erase completion line.
pub const ERASED_PATTERN: &str = r"Erased (?P<sectors>\d+) sectors";

/// Which autoboot banner the bootloader printed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootBanner {
    /// `stop with '<keyword>'`.
    StopWith(String),
    /// `Hit any key to stop autoboot`; any input stops it.
    Legacy,
    /// `type '<keyword>' to enter u-boot console`.
    TypeToEnter(String),
}

impl BootBanner {
    /// Classify the result of a [`BANNER_PATTERN`] match.
    pub fn classify(result: &StepResult) -> Result<Self> {
        if result
            .name("legacy")
            .is_some()
        {
            return Ok(Self::Legacy);
        }
        if let Some(keyword) = result.non_empty("stop") {
            return Ok(Self::StopWith(keyword.to_string()));
        }
        if let Some(keyword) = result.non_empty("typed") {
            return Ok(Self::TypeToEnter(keyword.to_string()));
        }
        Err(Error::Protocol(format!(
            "unrecognized boot banner: {}",
            result.matched()
        )))
    }

    /// Text that stops autoboot; empty for the legacy banner.
    pub fn stop_keyword(&self) -> &str {
        match self {
            Self::StopWith(keyword) | Self::TypeToEnter(keyword) => keyword,
            Self::Legacy => "",
        }
    }
}

fn prompt(prompt: &str) -> Result<Step> {
    Step::expect_text(&format!("{prompt}>"))
}

/// Reach the running Linux shell and force a reboot.
pub fn shell_reboot() -> Result<Vec<Step>> {
    Ok(vec![
        Step::send("\n"),
        Step::expect_text("root@")?,
        Step::line("reboot -f"),
    ])
}

/// Wait for any autoboot banner.
pub fn boot_banner() -> Result<Vec<Step>> {
    Ok(vec![Step::expect(BANNER_PATTERN)?])
}

/// Stop autoboot and read back the prompt.
pub fn stop_autoboot(keyword: &str) -> Result<Vec<Step>> {
    Ok(vec![
        Step::line(keyword),
        Step::line("printenv ipaddr"),
        Step::expect(PROMPT_PATTERN)?,
    ])
}

/// Set both addresses and check that the board reaches the host.
pub fn network_setup(prompt_token: &str, server: Ipv4Addr, board: Ipv4Addr) -> Result<Vec<Step>> {
    Ok(vec![
        Step::line(format_args!("setenv serverip {server}")),
        prompt(prompt_token)?,
        Step::line("printenv serverip"),
        Step::expect_text(&format!("serverip={server}"))?,
        Step::line(format_args!("setenv ipaddr {board}")),
        Step::line("printenv ipaddr"),
        Step::expect_text(&format!("ipaddr={board}"))?,
        Step::line(format_args!("ping {server}")),
        Step::expect_text(&format!("host {server} is alive"))?,
    ])
}

/// Load the bootloader image into RAM.
pub fn bootloader_transfer(prompt_token: &str, bootloader: &Artifact) -> Result<Vec<Step>> {
    Ok(vec![
        Step::line("printenv ipaddr"),
        prompt(prompt_token)?,
        Step::line(format_args!("tftp {LOAD_ADDR} {}", bootloader.name)),
        Step::expect(TRANSFERRED_PATTERN)?,
    ])
}

/// Write the loaded bootloader, wipe its environment and reset.
pub fn bootloader_write() -> Result<Vec<Step>> {
    Ok(vec![
        Step::line(format_args!("erase {BOOTLOADER_FLASH_ADDR} +0x40000")),
        Step::expect_text("Erased 4 sectors")?,
        Step::line(format_args!("cp.b $fileaddr {BOOTLOADER_FLASH_ADDR} $filesize")),
        Step::expect_text("done")?,
        Step::line(format_args!("erase {ENV_FLASH_ADDR} +0x10000")),
        Step::expect_text("Erased 1 sectors")?,
        Step::line("reset"),
    ])
}

/// Stop the new bootloader and store the board name in its environment.
pub fn bootloader_resync(target_board: &str) -> Result<Vec<Step>> {
    Ok(vec![
        Step::expect_text("autoboot in")?,
        Step::line(STOCK_KEYWORD),
        prompt(STOCK_PROMPT)?,
        Step::line("printenv ipaddr"),
        prompt(STOCK_PROMPT)?,
        Step::line(format_args!("setenv board {target_board}")),
        prompt(STOCK_PROMPT)?,
        Step::line("saveenv"),
        prompt(STOCK_PROMPT)?,
    ])
}

/// Check the board name and load the system image into RAM.
pub fn image_transfer(context: &FlashContext) -> Result<Vec<Step>> {
    Ok(vec![
        Step::line("printenv board"),
        Step::expect_text(&format!("board={}", context.target_board))?,
        Step::line(format_args!("tftp {LOAD_ADDR} {}", context.sysupgrade.name)),
        Step::expect(TRANSFERRED_PATTERN)?,
    ])
}

/// Erase the flash span the system image will occupy.
pub fn image_erase(image: &Artifact) -> Result<Vec<Step>> {
    Ok(vec![
        Step::line(format_args!("erase {IMAGE_FLASH_ADDR} +0x{:x}", image.size)),
        Step::expect(ERASED_PATTERN)?,
    ])
}

/// Copy the loaded system image to the erased flash and boot it.
pub fn image_copy(prompt_token: &str) -> Result<Vec<Step>> {
    Ok(vec![
        Step::line("printenv serverip"),
        prompt(prompt_token)?,
        Step::line(format_args!("cp.b $fileaddr {IMAGE_FLASH_ADDR} $filesize")),
        Step::expect_text("done")?,
        Step::line("printenv serverip"),
        prompt(prompt_token)?,
        Step::line("reset"),
        Step::expect_text("Transferring control to Linux")?,
    ])
}

/// Parse a named numeric capture.
pub fn captured_number(result: &StepResult, name: &str) -> Result<u64> {
    result
        .name(name)
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| Error::Protocol(format!("no {name} in {:?}", result.matched())))
}

/// Check that `sectors` erased sectors span the whole image.
pub fn check_erased(image: &Artifact, sectors: u64) -> Result<()> {
    let erased = sectors.saturating_mul(SECTOR_SIZE);
    if erased >= image.size {
        Ok(())
    } else {
        Err(Error::Protocol(format!(
            "erased {erased} bytes, {} needs {}",
            image.name, image.size
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::ConsoleSession;
    use crate::console::mock::ScriptedPort;
    use std::time::Duration;

    fn banner(output: &str) -> StepResult {
        let mut session = ConsoleSession::new(ScriptedPort::new().with_output(output));
        session
            .run_batch(&boot_banner().unwrap(), Duration::from_millis(200))
            .unwrap()
            .remove(0)
    }

    fn sends(steps: &[Step]) -> Vec<String> {
        steps
            .iter()
            .filter_map(|step| match step {
                Step::Send(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
                Step::Expect(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_banner_stop_with_keyword() {
        let result = banner("Hit any ... autoboot in 4 seconds (stop with 'ard') ...");
        let kind = BootBanner::classify(&result).unwrap();
        assert_eq!(kind, BootBanner::StopWith("ard".into()));
        assert_eq!(kind.stop_keyword(), "ard");
    }

    #[test]
    fn test_banner_legacy_yields_empty_keyword() {
        let result = banner("U-Boot 1.1.4\nHit any key to stop autoboot:  4 ");
        let kind = BootBanner::classify(&result).unwrap();
        assert_eq!(kind, BootBanner::Legacy);
        assert_eq!(kind.stop_keyword(), "");
    }

    #[test]
    fn test_banner_type_to_enter() {
        let result = banner("autoboot in 1 s, type 'lin' to enter u-boot console");
        let kind = BootBanner::classify(&result).unwrap();
        assert_eq!(kind, BootBanner::TypeToEnter("lin".into()));
        assert_eq!(kind.stop_keyword(), "lin");
    }

    #[test]
    fn test_network_setup_escapes_addresses() {
        let steps = network_setup(
            "arduino",
            Ipv4Addr::new(192, 168, 1, 10),
            Ipv4Addr::new(192, 168, 1, 24),
        )
        .unwrap();

        let patterns: Vec<&str> = steps
            .iter()
            .filter_map(|step| match step {
                Step::Expect(expect) => Some(expect.pattern()),
                Step::Send(_) => None,
            })
            .collect();
        assert_eq!(patterns[1], r"serverip=192\.168\.1\.10");
        assert_eq!(patterns[3], r"host 192\.168\.1\.10 is alive");
        assert_eq!(
            sends(&steps),
            vec![
                "setenv serverip 192.168.1.10\n",
                "printenv serverip\n",
                "setenv ipaddr 192.168.1.24\n",
                "printenv ipaddr\n",
                "ping 192.168.1.10\n",
            ]
        );
    }

    #[test]
    fn test_image_erase_size_in_hex() {
        let image = Artifact::new("image.bin", 9_437_188);
        let steps = image_erase(&image).unwrap();
        assert_eq!(sends(&steps), vec!["erase 0x9f050000 +0x900004\n"]);
    }

    #[test]
    fn test_image_copy_starts_after_erase() {
        let steps = image_copy("arduino").unwrap();
        let sent = sends(&steps);
        assert!(sent.iter().all(|line| !line.starts_with("erase")));
        assert_eq!(sent[1], "cp.b $fileaddr 0x9f050000 $filesize\n");
        assert_eq!(sent.last().map(String::as_str), Some("reset\n"));
    }

    #[test]
    fn test_check_erased_must_cover_image() {
        let image = Artifact::new("image.bin", 2 * SECTOR_SIZE + 1);
        assert!(check_erased(&image, 3).is_ok());
        assert!(matches!(check_erased(&image, 2), Err(Error::Protocol(_))));
    }
}
