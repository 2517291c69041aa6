//! Network credential command.

use super::{Context, close_device};
use crate::CliError;
use anyhow::Result;
use console::style;
use mpylink::device::validate_wifi_credentials;

/// Reject credentials the board would refuse, before opening the port.
fn check_credentials(ssid: &str, password: &str) -> Result<(), CliError> {
    validate_wifi_credentials(ssid, password).map_err(|e| CliError::Usage(e.to_string()))
}

/// Wifi command implementation.
pub(crate) fn cmd_wifi(ctx: &mut Context, ssid: &str, password: &str) -> Result<()> {
    check_credentials(ssid, password)?;

    let device = ctx.open_device()?;
    let result = device.set_wifi_config(ssid, password);
    close_device(&device, result)?;

    if !ctx.quiet {
        eprintln!(
            "{} Network credentials for {} stored",
            style("✓").green(),
            style(ssid).cyan()
        );
    }
    Ok(())
}
