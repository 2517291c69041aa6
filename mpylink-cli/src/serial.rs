//! Serial port selection.
//!
//! An explicit `--port` wins, then the configured port. Otherwise the
//! available ports are listed and, when more than one is present, the user
//! picks one. Non-interactive mode never prompts.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, error, info},
    mpylink::PortInfo,
    std::{cmp::Ordering, io::IsTerminal},
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI or environment.
    pub port: Option<String>,
    /// Non-interactive mode (fail if the choice is ambiguous).
    pub non_interactive: bool,
}

/// Outcome of port selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedPort {
    /// Port name/path.
    pub name: String,
    /// Whether the user picked it from a prompt.
    pub prompted: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

fn cancelled_err() -> anyhow::Error {
    CliError::Cancelled("port selection cancelled".to_string()).into()
}

/// Pick a port without prompting. Exactly one candidate is required.
fn select_non_interactive_port(ports: Vec<PortInfo>) -> Result<SelectedPort> {
    match ports.len().cmp(&1) {
        Ordering::Equal => {
            let name = ports
                .into_iter()
                .next()
                .map(|p| p.name)
                .ok_or_else(|| usage_err("no serial ports available"))?;
            info!("Auto-selected port: {name}");
            Ok(SelectedPort {
                name,
                prompted: false,
            })
        },
        Ordering::Greater => Err(usage_err(
            "multiple serial ports found; pass --port to choose one",
        )),
        Ordering::Less => Err(usage_err("no serial ports available")),
    }
}

/// Resolve the port to use.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    if let Some(name) = &options.port {
        return Ok(SelectedPort {
            name: name.clone(),
            prompted: false,
        });
    }

    if let Some(name) = &config.connection.port {
        debug!("Using port from config: {name}");
        return Ok(SelectedPort {
            name: name.clone(),
            prompted: false,
        });
    }

    let ports = mpylink::list_ports()?;
    if ports.is_empty() {
        return Err(usage_err("no serial ports found"));
    }

    if options.non_interactive || ports.len() == 1 {
        return select_non_interactive_port(ports);
    }

    ensure_interactive_terminal()?;
    select_port_interactive(&ports)
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "port selection needs a terminal; pass --port or --non-interactive",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                cancelled_err()
            } else {
                usage_err(&format!("prompt failed: {io_err}"))
            }
        },
    }
}

/// One-line label for a port in the picker.
fn port_label(port: &PortInfo) -> String {
    let ids = match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => format!(" ({vid:04X}:{pid:04X})"),
        _ => String::new(),
    };
    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();
    format!("{}{ids}{product}", style(&port.name).bold())
}

fn select_port_interactive(ports: &[PortInfo]) -> Result<SelectedPort> {
    eprintln!(
        "{} {} serial ports found",
        style("ℹ").blue(),
        ports.len()
    );

    let term_width = console::Term::stderr().size().1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|p| console::truncate_str(&port_label(p), max_item_width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select a serial port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    let index = selection.ok_or_else(cancelled_err)?;
    let port = ports
        .get(index)
        .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
    Ok(SelectedPort {
        name: port.name.clone(),
        prompted: true,
    })
}

/// Offer to save a prompted port to the local config file.
pub fn ask_remember_port(port: &SelectedPort, config: &mut Config) -> Result<()> {
    if !port.prompted {
        return Ok(());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use {} by default in this directory?", port.name))
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        if let Err(e) = config.remember_port(&port.name) {
            error!("Failed to save port configuration: {e}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str) -> PortInfo {
        PortInfo {
            name: name.to_string(),
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
        }
    }

    fn assert_usage(err: &anyhow::Error) {
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Usage(_))
        ));
    }

    #[test]
    fn test_explicit_port_wins() {
        let mut config = Config::default();
        config.connection.port = Some("/dev/ttyACM0".into());
        let options = SerialOptions {
            port: Some("/dev/ttyUSB0".into()),
            non_interactive: true,
        };
        let selected = select_serial_port(&options, &config).unwrap();
        assert_eq!(selected.name, "/dev/ttyUSB0");
        assert!(!selected.prompted);
    }

    #[test]
    fn test_config_port_used_without_flag() {
        let mut config = Config::default();
        config.connection.port = Some("COM4".into());
        let selected = select_serial_port(&SerialOptions::default(), &config).unwrap();
        assert_eq!(selected.name, "COM4");
    }

    #[test]
    fn test_non_interactive_single_port() {
        let selected = select_non_interactive_port(vec![port("/dev/ttyUSB0")]).unwrap();
        assert_eq!(selected.name, "/dev/ttyUSB0");
    }

    #[test]
    fn test_non_interactive_multiple_ports_is_usage_error() {
        let err = select_non_interactive_port(vec![port("/dev/ttyUSB0"), port("/dev/ttyUSB1")])
            .unwrap_err();
        assert_usage(&err);
    }

    #[test]
    fn test_non_interactive_no_ports_is_usage_error() {
        let err = select_non_interactive_port(vec![]).unwrap_err();
        assert_usage(&err);
    }

    #[test]
    fn test_port_label_includes_ids_and_product() {
        console::set_colors_enabled(false);
        let info = PortInfo {
            name: "/dev/ttyACM0".into(),
            vid: Some(0x2E8A),
            pid: Some(0x0005),
            manufacturer: None,
            product: Some("Board in FS mode".into()),
        };
        let label = port_label(&info);
        assert!(label.starts_with("/dev/ttyACM0"));
        assert!(label.contains("(2E8A:0005)"));
        assert!(label.contains("Board in FS mode"));
    }

    #[test]
    fn test_unprompted_port_is_not_remembered() {
        let mut config = Config::default();
        let selected = SelectedPort {
            name: "COM3".into(),
            prompted: false,
        };
        ask_remember_port(&selected, &mut config).unwrap();
        assert!(config.connection.port.is_none());
    }
}
