//! Port listing command implementation.

use anyhow::Result;
use console::style;
use yunflash::SerialEndpoint;
use yunflash::device::{format_port_list, list_endpoints, select_flashing_port};

/// Serialized endpoint plus the board it was recognized as.
fn port_json(port: &SerialEndpoint) -> serde_json::Result<serde_json::Value> {
    let mut value = serde_json::to_value(port)?;
    if let Some(fields) = value.as_object_mut() {
        let board = port.board();
        fields.insert("board".into(), board.name().into());
        fields.insert("supported".into(), board.is_supported().into());
    }
    Ok(value)
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let detected = list_endpoints();
    let selected = select_flashing_port(&detected).ok();

    if json {
        let ports = detected
            .iter()
            .map(port_json)
            .collect::<serde_json::Result<Vec<_>>>()?;
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "ports": ports,
                "flashing_port": selected.as_ref().map(|p| p.name.clone()),
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports:").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
    } else {
        for line in format_port_list(&detected) {
            eprintln!("  {} {}", style("•").green(), line);
        }
    }

    if let Some(port) = selected {
        eprintln!(
            "\n{} Board detected on {}",
            style("→").green().bold(),
            style(&port.name).cyan().bold()
        );
    }

    Ok(())
}
