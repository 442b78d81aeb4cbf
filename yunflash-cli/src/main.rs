//! yunflash CLI - Command-line tool for reflashing Arduino Yun style boards.
//!
//! ## Features
//!
//! - Flash the Linux processor's bootloader and system image over TFTP
//! - Upload the MCU terminal sketch and final firmware through avrdude
//! - Host/board address discovery
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::{debug, warn};
use std::env;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Invalid combination of arguments.
    #[error("{0}")]
    Usage(String),
    /// The user interrupted the operation.
    #[error("{0}")]
    Cancelled(String),
}

/// yunflash - Reflash Arduino Yun style boards over USB serial and TFTP.
///
/// Environment variables:
///   YUNFLASH_PORT    - Serial port of the board
///   YUNFLASH_BOARD   - Board identifier written to the bootloader (default: Yun)
#[derive(Parser)]
#[command(name = "yunflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "YUNFLASH_PORT")]
    pub(crate) port: Option<String>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

/// Options of the `provision` command.
#[derive(Args, Debug, Clone, Default)]
pub(crate) struct ProvisionArgs {
    /// Flash the bootloader even if it looks current.
    #[arg(long = "bl")]
    pub(crate) flash_bootloader: bool,

    /// Board identifier written to the bootloader environment.
    #[arg(long, env = "YUNFLASH_BOARD")]
    pub(crate) board: Option<String>,

    /// Host address (requires --boardip).
    #[arg(long = "serverip", value_name = "IP")]
    pub(crate) server_ip: Option<Ipv4Addr>,

    /// Board address (requires --serverip).
    #[arg(long = "boardip", value_name = "IP")]
    pub(crate) board_ip: Option<Ipv4Addr>,

    /// Directory served over TFTP (default: <exe dir>/tftp).
    #[arg(long, value_name = "DIR")]
    pub(crate) tftp_dir: Option<PathBuf>,

    /// Directory holding avrdude and the MCU hex files (default: <exe dir>/avr).
    #[arg(long, value_name = "DIR")]
    pub(crate) avr_dir: Option<PathBuf>,

    /// UDP port of the TFTP server.
    #[arg(long, default_value_t = yunflash::tftp::DEFAULT_PORT)]
    pub(crate) tftp_port: u16,

    /// Skip the MCU sketch uploads.
    #[arg(long)]
    pub(crate) no_mcu: bool,
}

/// Available commands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Flash the bootloader, Linux image and MCU firmware.
    Provision(ProvisionArgs),

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Show the host and board addresses that would be used.
    Netinfo {
        /// Host address to avoid.
        #[arg(long, value_name = "IP")]
        exclude: Option<Ipv4Addr>,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Map an error to the process exit code.
fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Cancelled(_) => 130,
        };
    }
    let interrupted = err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<yunflash::Error>(),
            Some(yunflash::Error::Interrupted)
        )
    });
    if interrupted { 130 } else { 1 }
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

fn install_interrupt_handler() {
    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
        warn!("Could not install Ctrl-C handler: {e}");
    }
    yunflash::set_interrupt_checker(was_interrupted);
}

fn run(cli: &Cli) -> Result<()> {
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Provision(args) => {
            commands::provision::cmd_provision(cli, &config, args)?;
        },
        Commands::ListPorts { json } => {
            commands::ports::cmd_list_ports(*json)?;
        },
        Commands::Netinfo { exclude } => {
            commands::netinfo::cmd_netinfo(cli, &config, *exclude)?;
        },
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
        },
    }

    Ok(())
}

fn main() {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);
    install_interrupt_handler();

    debug!(
        "yunflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code(&err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_provision_flags() {
        let cli = Cli::try_parse_from([
            "yunflash",
            "provision",
            "--bl",
            "--board",
            "YunMini",
            "--serverip",
            "192.168.1.10",
            "--boardip",
            "192.168.1.24",
            "--no-mcu",
        ])
        .unwrap();

        let Commands::Provision(args) = cli.command else {
            panic!("expected provision");
        };
        assert!(args.flash_bootloader);
        assert!(args.no_mcu);
        assert_eq!(args.board.as_deref(), Some("YunMini"));
        assert_eq!(args.server_ip, Some(Ipv4Addr::new(192, 168, 1, 10)));
        assert_eq!(args.board_ip, Some(Ipv4Addr::new(192, 168, 1, 24)));
        assert_eq!(args.tftp_port, 69);
    }

    #[test]
    fn test_parse_global_port_after_subcommand() {
        let cli = Cli::try_parse_from(["yunflash", "provision", "-p", "/dev/ttyACM0"]).unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyACM0"));
    }

    #[test]
    fn test_parse_rejects_bad_address() {
        let err = Cli::try_parse_from(["yunflash", "provision", "--serverip", "10.0.0"])
            .err()
            .unwrap();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_verbose_counts() {
        let cli = Cli::try_parse_from(["yunflash", "-vv", "list-ports"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_exit_code_usage() {
        let err = anyhow::Error::new(CliError::Usage("bad".into()));
        assert_eq!(exit_code(&err), 2);
    }

    #[test]
    fn test_exit_code_cancelled() {
        let err = anyhow::Error::new(CliError::Cancelled("stop".into()));
        assert_eq!(exit_code(&err), 130);
    }

    #[test]
    fn test_exit_code_library_interrupt_in_chain() {
        let err = anyhow::Error::new(yunflash::Error::Interrupted).context("provisioning");
        assert_eq!(exit_code(&err), 130);
    }

    #[test]
    fn test_exit_code_generic() {
        let err = anyhow::anyhow!("boom");
        assert_eq!(exit_code(&err), 1);
    }
}
