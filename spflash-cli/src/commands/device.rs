//! Flash dump command implementations: status, update, boot.
//!
//! A flash dump is a raw copy of the whole device, both partitions back to
//! back. Commands that modify it work on an in-memory copy and only write
//! the file back once the operation succeeded.

use {
    anyhow::{Context, Result, bail},
    console::style,
    indicatif::{ProgressBar, ProgressStyle},
    spflash::{
        BLOCK_SIZE, MemoryFlash, Updater,
        flash::{FirmwareStatus, firmware_status, record_boot_attempt, record_boot_completed},
    },
    std::{fs, path::Path},
};

use crate::{Cli, use_fancy_output};

fn load_dump(path: &Path, page_size: usize) -> Result<MemoryFlash> {
    let bytes =
        fs::read(path).with_context(|| format!("Failed to read flash dump {}", path.display()))?;
    if bytes.is_empty() || bytes.len() % (2 * BLOCK_SIZE) != 0 {
        bail!(
            "Flash dump {} is {} bytes, expected two partitions of whole {BLOCK_SIZE}-byte blocks",
            path.display(),
            bytes.len()
        );
    }
    Ok(MemoryFlash::from_bytes(bytes, page_size))
}

fn save_dump(path: &Path, flash: MemoryFlash) -> Result<()> {
    fs::write(path, flash.into_bytes())
        .with_context(|| format!("Failed to write flash dump {}", path.display()))
}

fn opt(value: Option<u32>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

fn print_status(status: &FirmwareStatus) {
    for p in &status.partitions {
        let marker = if status.active == Some(p.index) {
            style("*").green().bold()
        } else {
            style(" ")
        };
        let state = if p.valid {
            style("valid").green()
        } else {
            style("invalid").red()
        };
        eprintln!(
            "{} Partition {} [{}] version {}, priority {}, boots {}/{}",
            marker,
            p.index + 1,
            state,
            p.image_version
                .map_or_else(|| "-".to_string(), |v| format!("{v:#x}")),
            opt(p.priority),
            opt(p.completed_boots),
            opt(p.attempted_boots)
        );
        if let Some(error) = &p.error {
            eprintln!("    {} {}", style("✗").red(), error);
        }
        if p.boot_incomplete {
            eprintln!("    {} last boot did not complete", style("!").yellow());
        }
        if p.counters_corrupted {
            eprintln!("    {} counter corruption detected", style("!").yellow());
        }
    }
    match (status.active, status.reason) {
        (Some(active), Some(reason)) => eprintln!(
            "{} partition {} ({:?})",
            style("Boots:").bold(),
            active + 1,
            reason
        ),
        _ => eprintln!("{} {}", style("Boots:").bold(), style("nothing bootable").red()),
    }
}

/// Status command implementation.
pub(crate) fn cmd_status(dump: &Path, json: bool) -> Result<()> {
    let mut flash = load_dump(dump, BLOCK_SIZE)?;
    let status = firmware_status(&mut flash)?;

    if json {
        let output = serde_json::json!({
            "ok": status.active.is_some(),
            "data": status,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_status(&status);
    }

    if status.active.is_none() {
        bail!("No bootable partition in {}", dump.display());
    }
    Ok(())
}

/// Update command implementation.
pub(crate) fn cmd_update(
    cli: &Cli,
    dump: &Path,
    new_image: &Path,
    config_data: Option<&std::path::PathBuf>,
    page_size: usize,
) -> Result<()> {
    let mut flash = load_dump(dump, page_size)?;
    let image = fs::read(new_image)
        .with_context(|| format!("Failed to read image {}", new_image.display()))?;
    let config_data = config_data
        .map(|path| {
            fs::read(path)
                .with_context(|| format!("Failed to read config data {}", path.display()))
        })
        .transpose()?;

    let pb = if cli.quiet || !use_fancy_output() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(1);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb
    };

    let result = {
        let mut updater = Updater::new(&mut flash);
        if let Some(data) = config_data {
            updater = updater.with_config_data(data);
        }
        updater.run(&image, &mut |step: &str, done: usize, total: usize| {
            pb.set_message(step.to_string());
            pb.set_length(total as u64);
            pb.set_position(done as u64);
        })
    };

    let report = result
        .inspect_err(|_| pb.abandon())
        .with_context(|| format!("Update failed, {} left unchanged", dump.display()))?;
    pb.finish_with_message("done");

    save_dump(dump, flash)?;

    if !cli.quiet {
        eprintln!(
            "{} Partition {} updated ({} pages), priority {}; partition {} is now passive",
            style("✓").green(),
            report.updated + 1,
            report.pages,
            report.new_priority,
            report.previous_active + 1
        );
    }
    Ok(())
}

/// Boot command implementation.
pub(crate) fn cmd_boot(cli: &Cli, dump: &Path, partition: usize, attempted: bool) -> Result<()> {
    let mut flash = load_dump(dump, BLOCK_SIZE)?;
    let index = partition - 1;

    let (event, count) = if attempted {
        ("attempted", record_boot_attempt(&mut flash, index)?)
    } else {
        ("completed", record_boot_completed(&mut flash, index)?)
    };
    save_dump(dump, flash)?;

    if !cli.quiet {
        eprintln!(
            "{} Partition {partition}: {event} boots = {count}",
            style("✓").green()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_dump_rejects_odd_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.bin");

        fs::write(&path, vec![0xFF; BLOCK_SIZE]).unwrap();
        assert!(load_dump(&path, BLOCK_SIZE).is_err());

        fs::write(&path, vec![0xFF; 4 * BLOCK_SIZE]).unwrap();
        let flash = load_dump(&path, BLOCK_SIZE).unwrap();
        assert_eq!(flash.as_bytes().len(), 4 * BLOCK_SIZE);
    }

    #[test]
    fn test_status_of_erased_dump_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.bin");
        fs::write(&path, vec![0xFF; 4 * BLOCK_SIZE]).unwrap();
        assert!(cmd_status(&path, true).is_err());
    }
}
