//! Serial port listing.

use console::style;
use log::warn;
use mpylink::PortInfo;

fn describe(port: &PortInfo) -> String {
    let ids = match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => format!(" ({vid:04X}:{pid:04X})"),
        _ => String::new(),
    };
    let product = port
        .product
        .as_deref()
        .or(port.manufacturer.as_deref())
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();
    format!("{}{ids}{product}", style(&port.name).cyan())
}

/// List-ports command implementation.
///
/// Enumeration failures are reported as warnings and treated as "no ports".
pub(crate) fn cmd_list_ports(json: bool) {
    let ports = mpylink::list_ports().unwrap_or_else(|e| {
        warn!("Could not enumerate serial ports: {e}");
        Vec::new()
    });

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&ports).unwrap_or_default()
        );
        return;
    }

    eprintln!(
        "{}",
        style("Available serial ports:")
            .bold()
            .underlined()
    );
    if ports.is_empty() {
        eprintln!("  {}", style("(none)").dim());
        return;
    }
    for port in &ports {
        eprintln!("  {} {}", style("•").green(), describe(port));
    }
}
