//! Board file system commands.

use super::{Context, close_device};
use crate::{CliError, use_fancy_output};
use anyhow::{Context as _, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use mpylink::transfer::validate_filename;
use mpylink::{DeviceManager, EntryKind, TransferProgress};
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

/// Arguments of the `put` command.
pub(crate) struct PutArgs {
    pub local: PathBuf,
    pub remote: String,
    pub chunk_size: Option<usize>,
    pub append: bool,
    pub verify: bool,
}

/// Run `op` against the board and close the port afterwards.
fn with_device<T>(
    ctx: &mut Context,
    op: impl FnOnce(&DeviceManager) -> mpylink::Result<T>,
) -> Result<T> {
    let device = ctx.open_device()?;
    let result = op(&device);
    close_device(&device, result)
}

/// Ls command implementation.
pub(crate) fn cmd_ls(ctx: &mut Context, path: &str, json: bool) -> Result<()> {
    let entries = with_device(ctx, |d| d.list_directory(path))?;

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "path": path,
                "entries": entries,
            },
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    for entry in &entries {
        match entry.kind {
            EntryKind::Directory => println!("{}/", style(&entry.name).blue().bold()),
            EntryKind::File => println!("{}", entry.name),
        }
    }
    Ok(())
}

/// Cat command implementation.
pub(crate) fn cmd_cat(ctx: &mut Context, path: &str) -> Result<()> {
    let data = with_device(ctx, |d| d.read_file(path))?;
    let mut stdout = io::stdout().lock();
    stdout.write_all(&data)?;
    stdout.flush()?;
    Ok(())
}

fn progress_bar(ctx: &Context, total: usize, name: &str) -> Option<ProgressBar> {
    if ctx.quiet || !use_fancy_output() {
        return None;
    }
    let pb = ProgressBar::new(total as u64);
    #[allow(clippy::unwrap_used)] // Static template string
    let bar_style = ProgressStyle::default_bar()
        .template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
        )
        .unwrap()
        .progress_chars("#>-");
    pb.set_style(bar_style);
    pb.set_message(name.to_string());
    Some(pb)
}

/// Put command implementation.
pub(crate) fn cmd_put(ctx: &mut Context, args: &PutArgs) -> Result<()> {
    // Reject bad names before touching the port.
    validate_filename(&args.remote).map_err(|e| CliError::Usage(e.to_string()))?;

    let content = fs::read(&args.local)
        .with_context(|| format!("Failed to read {}", args.local.display()))?;
    let options = ctx.upload_options(args.chunk_size, args.verify);

    let pb = progress_bar(ctx, content.len(), &args.remote);
    let on_progress = |p: &TransferProgress| {
        if let Some(pb) = &pb {
            pb.set_position(p.bytes_transferred as u64);
        }
    };

    let result = with_device(ctx, |d| {
        if args.append {
            d.append_file(&args.remote, &content, &options, on_progress)
        } else {
            d.write_file(&args.remote, &content, &options, on_progress)
        }
    });
    if let Some(pb) = &pb {
        pb.finish_and_clear();
    }
    let report = result?;

    if !ctx.quiet {
        let verified = if report.verified { ", verified" } else { "" };
        eprintln!(
            "{} {} -> {} ({} bytes in {} chunks, {:.2}s{verified})",
            style("✓").green(),
            args.local.display(),
            style(&report.filename).cyan(),
            report.bytes,
            report.chunks,
            report.elapsed.as_secs_f64()
        );
    }
    Ok(())
}

/// Local path for a downloaded board file.
fn default_local_path(remote: &str) -> PathBuf {
    let name = remote
        .rsplit('/')
        .find(|piece| !piece.is_empty())
        .unwrap_or(remote);
    PathBuf::from(name)
}

/// Get command implementation.
pub(crate) fn cmd_get(ctx: &mut Context, remote: &str, local: Option<PathBuf>) -> Result<()> {
    let local = local.unwrap_or_else(|| default_local_path(remote));
    let data = with_device(ctx, |d| d.read_file(remote))?;
    write_local(&local, &data)?;

    if !ctx.quiet {
        eprintln!(
            "{} {} -> {} ({} bytes)",
            style("✓").green(),
            style(remote).cyan(),
            local.display(),
            data.len()
        );
    }
    Ok(())
}

fn write_local(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(path, data).with_context(|| format!("Failed to write {}", path.display()))
}

/// Rm command implementation.
pub(crate) fn cmd_rm(ctx: &mut Context, path: &str) -> Result<()> {
    with_device(ctx, |d| d.delete_file(path))?;
    if !ctx.quiet {
        eprintln!("{} Removed {}", style("✓").green(), style(path).cyan());
    }
    Ok(())
}
