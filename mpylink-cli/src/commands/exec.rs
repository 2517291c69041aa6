//! Code execution commands.

use super::{Context, close_device};
use anyhow::{Result, bail};
use console::style;
use log::debug;
use mpylink::{DeviceManager, ExecutionResult};

fn run_on_device(
    ctx: &mut Context,
    op: impl FnOnce(&DeviceManager) -> mpylink::Result<ExecutionResult>,
) -> Result<()> {
    let device = ctx.open_device()?;
    let result = op(&device);
    let result = close_device(&device, result)?;
    debug!(
        "Run finished with exit code {} after {:?}",
        result.exit_code, result.duration
    );

    if !result.output.is_empty() {
        println!("{}", result.output);
    }
    if !result.success() {
        // Output without the completion marker usually carries a traceback.
        bail!("program did not complete (exit code {})", result.exit_code);
    }
    if !ctx.quiet {
        eprintln!(
            "{} done in {:.2}s",
            style("✓").green(),
            result.duration.as_secs_f64()
        );
    }
    Ok(())
}

/// Exec command implementation.
pub(crate) fn cmd_exec(ctx: &mut Context, code: &str) -> Result<()> {
    run_on_device(ctx, |d| d.execute_code(code))
}

/// Run command implementation.
pub(crate) fn cmd_run(ctx: &mut Context, path: &str) -> Result<()> {
    run_on_device(ctx, |d| d.execute_file(path))
}

/// Run-project command implementation.
pub(crate) fn cmd_run_project(ctx: &mut Context, dir: &str) -> Result<()> {
    run_on_device(ctx, |d| d.execute_project(dir))
}
