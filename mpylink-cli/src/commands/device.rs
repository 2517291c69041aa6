//! Board status commands.

use super::{Context, close_device};
use crate::{CliError, use_fancy_output};
use anyhow::{Result, bail};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use mpylink::DeviceInfo;
use std::time::{Duration, Instant};

/// Ping command implementation.
pub(crate) fn cmd_ping(ctx: &mut Context) -> Result<()> {
    let device = ctx.open_device()?;
    let started = Instant::now();

    let spinner = if use_fancy_output() && !ctx.quiet {
        let pb = ProgressBar::new_spinner();
        #[allow(clippy::unwrap_used)] // Static template string
        let spinner_style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap();
        pb.set_style(spinner_style);
        pb.set_message("Waiting for the board...");
        pb.enable_steady_tick(Duration::from_millis(100));
        Some(pb)
    } else {
        None
    };

    let online = device.is_online();
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }

    let port = device.connection().port().to_string();
    let online = close_device(&device, Ok(online))?;
    if ctx.cancel.is_cancelled() {
        return Err(CliError::Cancelled("ping cancelled".into()).into());
    }
    if !online {
        bail!("{port} did not answer");
    }

    println!(
        "{} {port} answered in {} ms",
        style("✓").green(),
        started.elapsed().as_millis()
    );
    Ok(())
}

/// Info command implementation.
pub(crate) fn cmd_info(ctx: &mut Context, json: bool) -> Result<()> {
    let device = ctx.open_device()?;
    let info = device.device_info();
    let info = close_device(&device, info)?;

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": info,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    print_info(&info);
    Ok(())
}

fn print_info(info: &DeviceInfo) {
    if info.fields.is_empty() {
        println!("{}", info.raw.trim_end());
        return;
    }

    let width = info
        .fields
        .keys()
        .map(String::len)
        .max()
        .unwrap_or(0);
    for (key, value) in &info.fields {
        println!("{}  {value}", style(format!("{key:width$}")).bold());
    }
}
