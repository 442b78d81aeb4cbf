//! Address discovery command implementation.

use anyhow::{Context, Result};
use console::style;
use std::net::Ipv4Addr;
use yunflash::netconf::DEFAULT_PROBE_PORT;
use yunflash::{AddressNegotiator, LocalNegotiator, TcpProbe};

use crate::Cli;
use crate::config::Config;

/// Print the host and board addresses a provisioning run would use.
pub(crate) fn cmd_netinfo(cli: &Cli, config: &Config, exclude: Option<Ipv4Addr>) -> Result<()> {
    let probe = TcpProbe {
        port: config.network.probe_port.unwrap_or(DEFAULT_PROBE_PORT),
        ..TcpProbe::default()
    };

    if !cli.quiet {
        eprintln!(
            "{} Looking for addresses (probing TCP port {})...",
            style("⏳").yellow(),
            probe.port
        );
    }

    let (server, board) = LocalNegotiator::new(probe)
        .negotiate(exclude)
        .context("Could not find a usable network address")?;

    println!("server_ip = {server}");
    println!("board_ip = {board}");
    Ok(())
}
