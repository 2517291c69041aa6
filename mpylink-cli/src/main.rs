//! mpylink CLI - manage files and run code on MicroPython boards.
//!
//! ## Features
//!
//! - Upload, download, list and delete files on the board
//! - Run code snippets, board-side scripts and projects
//! - Configure board network credentials
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use mpylink::CancelToken;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod serial;

use commands::Context;
use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Failures that map to a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or setup; exit code 2.
    #[error("{0}")]
    Usage(String),
    /// Interrupted by the user; exit code 130.
    #[error("{0}")]
    Cancelled(String),
}

/// mpylink - talk to MicroPython boards over a serial link.
///
/// Environment variables:
///   MPYLINK_PORT              - Default serial port
///   MPYLINK_BAUD              - Baud rate (default: 115200)
///   MPYLINK_TIMEOUT_MS        - Command timeout in milliseconds (all commands)
///   MPYLINK_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "mpylink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port to use (prompted for if not specified).
    #[arg(short, long, global = true, env = "MPYLINK_PORT")]
    port: Option<String>,

    /// Baud rate.
    #[arg(short, long, global = true, env = "MPYLINK_BAUD")]
    baud: Option<u32>,

    /// Command timeout in milliseconds, for every command.
    #[arg(long, global = true, env = "MPYLINK_TIMEOUT_MS", value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "MPYLINK_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Check that the board answers.
    Ping,

    /// Show board information.
    Info {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List a directory on the board.
    Ls {
        /// Directory path.
        #[arg(default_value = "/")]
        path: String,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print a board file to stdout.
    Cat {
        /// File path on the board.
        path: String,
    },

    /// Upload a local file to the board.
    Put {
        /// Local file.
        local: PathBuf,

        /// Destination file name on the board.
        remote: String,

        /// Bytes per chunk (picked from the file size if omitted).
        #[arg(long, value_name = "N")]
        chunk_size: Option<usize>,

        /// Append instead of replacing the file (content that fits one chunk).
        #[arg(long)]
        append: bool,

        /// Read the file back and compare after uploading.
        #[arg(long)]
        verify: bool,
    },

    /// Download a board file.
    Get {
        /// File path on the board.
        remote: String,

        /// Local destination (defaults to the board file name).
        local: Option<PathBuf>,
    },

    /// Delete a board file.
    Rm {
        /// File path on the board.
        path: String,
    },

    /// Run a code snippet.
    Exec {
        /// Source code.
        code: String,
    },

    /// Run a script stored on the board.
    Run {
        /// Script path on the board.
        path: String,
    },

    /// Run the main.py of a project directory on the board.
    RunProject {
        /// Project directory on the board.
        dir: String,
    },

    /// Store network credentials on the board.
    Wifi {
        /// Network name.
        ssid: String,

        /// Network password.
        password: String,
    },

    /// List available serial ports.
    ListPorts {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type (auto-detected with --install if omitted).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Install the completion script into the shell's search path.
        #[arg(long)]
        install: bool,
    },
}

fn main() -> ExitCode {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var_os("NO_COLOR").is_some() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
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

    debug!(
        "mpylink v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = exit_code(&err);
            eprintln!(
                "{} {err:#}",
                style("Error:")
                    .red()
                    .bold()
            );
            ExitCode::from(code)
        },
    }
}

/// Exit status for a failed run.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Cancelled(_) => 130,
        };
    }
    let cancelled = err
        .chain()
        .filter_map(|cause| cause.downcast_ref::<mpylink::Error>())
        .any(mpylink::Error::is_cancelled);
    if cancelled { 130 } else { 1 }
}

fn run(cli: Cli) -> Result<()> {
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_token.cancel()) {
        debug!("Ctrl-C handler not installed: {e}");
    }

    let mut ctx = Context {
        port: cli.port,
        baud: cli.baud,
        timeout_ms: cli.timeout_ms,
        non_interactive: cli.non_interactive,
        quiet: cli.quiet,
        config,
        cancel,
    };

    match cli.command {
        Commands::Ping => commands::device::cmd_ping(&mut ctx),
        Commands::Info { json } => commands::device::cmd_info(&mut ctx, json),
        Commands::Ls { path, json } => commands::fs::cmd_ls(&mut ctx, &path, json),
        Commands::Cat { path } => commands::fs::cmd_cat(&mut ctx, &path),
        Commands::Put {
            local,
            remote,
            chunk_size,
            append,
            verify,
        } => {
            let args = commands::fs::PutArgs {
                local,
                remote,
                chunk_size,
                append,
                verify,
            };
            commands::fs::cmd_put(&mut ctx, &args)
        },
        Commands::Get { remote, local } => commands::fs::cmd_get(&mut ctx, &remote, local),
        Commands::Rm { path } => commands::fs::cmd_rm(&mut ctx, &path),
        Commands::Exec { code } => commands::exec::cmd_exec(&mut ctx, &code),
        Commands::Run { path } => commands::exec::cmd_run(&mut ctx, &path),
        Commands::RunProject { dir } => commands::exec::cmd_run_project(&mut ctx, &dir),
        Commands::Wifi { ssid, password } => commands::wifi::cmd_wifi(&mut ctx, &ssid, &password),
        Commands::ListPorts { json } => {
            commands::ports::cmd_list_ports(json);
            Ok(())
        },
        Commands::Completions { shell, install } => {
            if install {
                commands::completions::cmd_completions_install(shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell type, e.g.: mpylink completions bash \
                         (or use --install to auto-detect)"
                            .to_string(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
                Ok(())
            }
        },
    }
}
