//! spflash CLI - Build, inspect and update service processor flash images.
//!
//! ## Features
//!
//! - Create dual-partition images from JSON templates
//! - Inspect and verify images, with JSON output for scripting
//! - Extract and replace individual regions
//! - Offline firmware update and boot counter bookkeeping on flash dumps
//! - Shell completion generation
//! - Configuration files and environment variable support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(true);

/// Check if progress bars and colors should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(std::sync::atomic::Ordering::Relaxed) && console::colors_enabled_stderr()
}

mod commands;
mod config;
mod template;

use commands::completions::cmd_completions;
use commands::device::{cmd_boot, cmd_status, cmd_update};
use commands::image::{cmd_create, cmd_extract, cmd_extract_all, cmd_replace, cmd_view};
use config::Config;

/// spflash - Dual-partition flash image tool for the service processor.
///
/// Environment variables:
///   SPFLASH_CONFIG   - Path to a configuration file
///   RUST_LOG         - Log filter (overrides -v/-q)
///   NO_COLOR         - Disable colored output
#[derive(Parser)]
#[command(name = "spflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(
        short,
        long,
        global = true,
        visible_short_alias = 's',
        visible_alias = "silent"
    )]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(
        long = "config",
        global = true,
        value_name = "PATH",
        env = "SPFLASH_CONFIG"
    )]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an image from a JSON template.
    Create {
        /// Output image file.
        image: PathBuf,

        /// JSON template describing the partitions.
        template: PathBuf,

        /// Image version for every partition (overrides template and config).
        #[arg(long, value_parser = parse_u32)]
        image_version: Option<u32>,

        /// Do not print the image summary afterwards.
        #[arg(long)]
        no_view: bool,
    },

    /// Show and verify the contents of an image.
    View {
        /// Image file.
        image: PathBuf,

        /// Output as JSON.
        #[arg(long)]
        json: bool,

        /// Show checksums and dump the configuration data region.
        #[arg(long)]
        crc: bool,
    },

    /// Extract regions to files.
    Extract {
        /// Image file.
        image: PathBuf,

        /// Region and output path pairs: REGION OUT [REGION OUT]...
        #[arg(required = true, value_name = "REGION_OUT")]
        pairs: Vec<String>,

        /// Treat numeric regions as identifiers instead of table indices.
        #[arg(short = 'I', long = "id")]
        by_id: bool,

        /// Partition number within the image.
        #[arg(short = 'P', long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=2))]
        partition: u8,
    },

    /// Extract every region of every partition into a directory.
    #[command(alias = "extract_all")]
    ExtractAll {
        /// Image file.
        image: PathBuf,

        /// Output directory (created if missing).
        out_dir: PathBuf,
    },

    /// Replace region contents from files.
    Replace {
        /// Image file.
        image: PathBuf,

        /// Region and input path pairs: REGION IN [REGION IN]...
        #[arg(required = true, value_name = "REGION_IN")]
        pairs: Vec<String>,

        /// Treat numeric regions as identifiers instead of table indices.
        #[arg(short = 'I', long = "id")]
        by_id: bool,

        /// Partition number within the image.
        #[arg(short = 'P', long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=2))]
        partition: u8,

        /// Write the result here instead of modifying the image in place.
        #[arg(short = 'O', long, value_name = "PATH")]
        output: Option<PathBuf>,
    },

    /// Show the boot state of a flash dump.
    Status {
        /// Flash dump holding both partitions.
        dump: PathBuf,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Write a partition image into the passive half of a flash dump.
    Update {
        /// Flash dump holding both partitions (modified on success).
        dump: PathBuf,

        /// Single-partition image to install.
        new_image: PathBuf,

        /// Configuration data to install instead of carrying it over.
        #[arg(long, value_name = "FILE")]
        config_data: Option<PathBuf>,

        /// Flash page size (default from config, 4096).
        #[arg(long)]
        page_size: Option<usize>,
    },

    /// Record a boot event in a flash dump.
    #[command(group(
        clap::ArgGroup::new("event")
            .required(true)
            .args(["attempted", "completed"])
    ))]
    Boot {
        /// Flash dump holding both partitions.
        dump: PathBuf,

        /// Partition number.
        #[arg(short = 'P', long, value_parser = clap::value_parser!(u8).range(1..=2))]
        partition: u8,

        /// Increment the attempted-boot counter.
        #[arg(long)]
        attempted: bool,

        /// Increment the completed-boot counter.
        #[arg(long)]
        completed: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type (detected from $SHELL if omitted).
        #[arg(value_enum)]
        shell: Option<Shell>,
    },
}

/// Parse a decimal or `0x` hex integer.
fn parse_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| format!("invalid number '{s}': {e}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, std::sync::atomic::Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

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
        "spflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Create {
            image,
            template,
            image_version,
            no_view,
        } => {
            cmd_create(&cli, &config, image, template, *image_version, !*no_view)?;
        },
        Commands::View { image, json, crc } => {
            cmd_view(&cli, image, *json, *crc || config.show_crc())?;
        },
        Commands::Extract {
            image,
            pairs,
            by_id,
            partition,
        } => {
            cmd_extract(&cli, image, pairs, *by_id, usize::from(*partition))?;
        },
        Commands::ExtractAll { image, out_dir } => {
            cmd_extract_all(&cli, image, out_dir)?;
        },
        Commands::Replace {
            image,
            pairs,
            by_id,
            partition,
            output,
        } => {
            cmd_replace(
                &cli,
                image,
                pairs,
                *by_id,
                usize::from(*partition),
                output.as_ref(),
            )?;
        },
        Commands::Status { dump, json } => {
            cmd_status(dump, *json)?;
        },
        Commands::Update {
            dump,
            new_image,
            config_data,
            page_size,
        } => {
            let page_size = page_size.unwrap_or_else(|| config.page_size());
            cmd_update(&cli, dump, new_image, config_data.as_ref(), page_size)?;
        },
        Commands::Boot {
            dump,
            partition,
            attempted,
            completed: _,
        } => {
            cmd_boot(&cli, dump, usize::from(*partition), *attempted)?;
        },
        Commands::Completions { shell } => {
            cmd_completions(*shell)?;
        },
    }

    Ok(())
}
