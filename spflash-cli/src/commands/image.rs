//! Image file command implementations: create, view, extract, replace.

use {
    anyhow::{Context, Result, anyhow, bail},
    console::style,
    spflash::{
        ImageReport, RegionId, RegionSelector, create_image, extract_all, extract_region, replace_region,
        tool::view::{CounterReport, PartitionReport},
        view_image,
    },
    std::{
        fs,
        path::{Path, PathBuf},
    },
};

use crate::Cli;
use crate::config::Config;
use crate::template::load_template;

fn read_image(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("Failed to read image {}", path.display()))
}

/// Split `REGION PATH` pairs, parsing the region half.
fn region_pairs(pairs: &[String], by_id: bool) -> Result<Vec<(RegionSelector, PathBuf)>> {
    if pairs.len() % 2 != 0 {
        bail!(
            "regions and paths must come in pairs, got {} arguments",
            pairs.len()
        );
    }
    pairs
        .chunks(2)
        .map(|pair| {
            let selector = RegionSelector::parse(&pair[0], by_id)
                .ok_or_else(|| anyhow!("invalid region '{}'", pair[0]))?;
            Ok((selector, PathBuf::from(&pair[1])))
        })
        .collect()
}

/// Create command implementation.
pub(crate) fn cmd_create(
    cli: &Cli,
    config: &Config,
    image: &Path,
    template: &Path,
    image_version: Option<u32>,
    view: bool,
) -> Result<()> {
    let mut specs = load_template(template, config.image_version())?;
    if let Some(version) = image_version {
        for spec in &mut specs {
            spec.image_version = version;
        }
    }

    let bytes = create_image(&specs)
        .with_context(|| format!("Failed to build image from {}", template.display()))?;
    fs::write(image, &bytes)
        .with_context(|| format!("Failed to write image {}", image.display()))?;

    if !cli.quiet {
        eprintln!(
            "{} Created {} ({} partition(s), {} bytes)",
            style("✓").green(),
            style(image.display()).cyan(),
            specs.len(),
            bytes.len()
        );
        if view && config.view_after_create() {
            let report = view_image(&bytes)?;
            print_report(&report, &bytes, config.show_crc(), cli.verbose > 0);
        }
    }
    Ok(())
}

/// View command implementation.
pub(crate) fn cmd_view(cli: &Cli, image: &Path, json: bool, show_crc: bool) -> Result<()> {
    let bytes = read_image(image)?;
    let report =
        view_image(&bytes).with_context(|| format!("Invalid image {}", image.display()))?;

    if json {
        let output = serde_json::json!({
            "ok": report.is_valid(),
            "data": report,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if !cli.quiet || !report.is_valid() {
        print_report(&report, &bytes, show_crc, show_crc || cli.verbose > 0);
    }

    if !report.is_valid() {
        bail!("Image {} failed verification", image.display());
    }
    Ok(())
}

fn counter_text(counter: Option<&CounterReport>) -> String {
    match counter {
        Some(c) if c.corrupted => format!("{} {}", c.value, style("(corrupted)").red()),
        Some(c) => c.value.to_string(),
        None => style("-").dim().to_string(),
    }
}

fn print_partition(p: &PartitionReport, show_crc: bool) {
    let state = if p.is_valid() {
        style("valid").green()
    } else {
        style("INVALID").red().bold()
    };
    eprintln!(
        "\n{} {} @ {:#x} [{}]",
        style("Partition").bold(),
        style(p.number).bold(),
        p.offset,
        state
    );
    if let Some(error) = &p.error {
        eprintln!("  {} {}", style("✗").red(), error);
    }
    if let (Some(version), Some(blocks)) = (p.image_version, p.size_blocks) {
        eprintln!("  Image version: {version:#x}, size: {blocks} blocks");
    }
    if show_crc {
        if let Some(crc) = p.header_checksum {
            eprintln!("  Header CRC:    {crc:#010x}");
        }
    }
    eprintln!(
        "  Priority: {}, boots attempted: {}, completed: {}",
        counter_text(p.priority.as_ref()),
        counter_text(p.attempted_boots.as_ref()),
        counter_text(p.completed_boots.as_ref())
    );

    if p.regions.is_empty() {
        return;
    }
    eprintln!(
        "  {:<3} {:<6} {:<22} {:>6} {:>6}  {}",
        style("#").dim(),
        style("ID").dim(),
        style("NAME").dim(),
        style("OFFSET").dim(),
        style("BLOCKS").dim(),
        style("CONTENT").dim()
    );
    for r in &p.regions {
        let content = match &r.file {
            None => "control".to_string(),
            Some(f) => match (&f.error, f.size) {
                (Some(e), _) => style(e).red().to_string(),
                (None, Some(size)) => match (show_crc, f.checksum, f.payload_checksum) {
                    (true, Some(crc), Some(payload)) => {
                        format!("file {size} bytes, crc {crc:#010x}, payload crc {payload:#010x}")
                    },
                    (true, Some(crc), None) => format!("file {size} bytes, crc {crc:#010x}"),
                    _ => format!("file {size} bytes"),
                },
                (None, None) => String::new(),
            },
        };
        let crc = if show_crc {
            format!(" [{:#010x}]", r.checksum)
        } else {
            String::new()
        };
        eprintln!(
            "  {:<3} {:<6} {:<22} {:>6} {:>6}  {}{}",
            r.index,
            format!("{:#04x}", r.id),
            style(&r.name).cyan(),
            r.offset_blocks,
            r.size_blocks,
            content,
            crc
        );
    }
}

/// Format `data` as offset, hex and ASCII columns, 16 bytes per line.
///
/// Trailing erased (0xFF) bytes are left out.
fn hex_dump(data: &[u8]) -> Vec<String> {
    let used = data.iter().rposition(|&b| b != 0xFF).map_or(0, |i| i + 1);
    data[..used]
        .chunks(16)
        .enumerate()
        .map(|(line, chunk)| {
            let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
            let ascii: String = chunk
                .iter()
                .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
                .collect();
            format!("{:08x}  {:<47}  |{}|", line * 16, hex.join(" "), ascii)
        })
        .collect()
}

fn print_config_dump(image: &[u8], number: usize) {
    let selector = RegionSelector::Id(RegionId::ConfigurationData);
    let Ok(data) = extract_region(image, number, selector) else {
        return;
    };
    let lines = hex_dump(&data);
    if lines.is_empty() {
        eprintln!("  {} erased", style("Configuration data:").bold());
        return;
    }
    eprintln!("  {}", style("Configuration data:").bold());
    for line in lines {
        eprintln!("    {line}");
    }
}

fn print_report(report: &ImageReport, image: &[u8], show_crc: bool, dump_config: bool) {
    eprintln!(
        "{} {} bytes, {} x {} byte partition(s)",
        style("Image:").bold(),
        report.image_size,
        report.partitions.len(),
        report.partition_size
    );
    match report.active {
        Some(n) => eprintln!("{} partition {}", style("Boots:").bold(), style(n).green()),
        None => eprintln!("{} {}", style("Boots:").bold(), style("nothing bootable").red()),
    }
    for p in &report.partitions {
        print_partition(p, show_crc);
        if dump_config && p.valid {
            print_config_dump(image, p.number);
        }
    }
}

/// Extract command implementation.
pub(crate) fn cmd_extract(
    cli: &Cli,
    image: &Path,
    pairs: &[String],
    by_id: bool,
    partition: usize,
) -> Result<()> {
    let pairs = region_pairs(pairs, by_id)?;
    let bytes = read_image(image)?;

    for (selector, out) in &pairs {
        let data = extract_region(&bytes, partition, *selector).with_context(|| {
            format!("Failed to extract region {selector} from partition {partition}")
        })?;
        fs::write(out, &data).with_context(|| format!("Failed to write {}", out.display()))?;
        if !cli.quiet {
            eprintln!(
                "{} Region {} -> {} ({} bytes)",
                style("✓").green(),
                selector,
                style(out.display()).cyan(),
                data.len()
            );
        }
    }
    Ok(())
}

/// Extract-all command implementation.
pub(crate) fn cmd_extract_all(cli: &Cli, image: &Path, out_dir: &Path) -> Result<()> {
    let bytes = read_image(image)?;
    let regions =
        extract_all(&bytes).with_context(|| format!("Invalid image {}", image.display()))?;

    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create directory {}", out_dir.display()))?;
    for region in &regions {
        let path = out_dir.join(&region.file_name);
        fs::write(&path, &region.data)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        if !cli.quiet {
            eprintln!(
                "  {} {} ({} bytes)",
                style("•").green(),
                region.file_name,
                region.data.len()
            );
        }
    }

    if !cli.quiet {
        eprintln!(
            "{} Extracted {} region(s) to {}",
            style("✓").green(),
            regions.len(),
            style(out_dir.display()).cyan()
        );
    }
    Ok(())
}

/// Replace command implementation.
pub(crate) fn cmd_replace(
    cli: &Cli,
    image: &Path,
    pairs: &[String],
    by_id: bool,
    partition: usize,
    output: Option<&PathBuf>,
) -> Result<()> {
    let pairs = region_pairs(pairs, by_id)?;
    let mut bytes = read_image(image)?;

    for (selector, input) in &pairs {
        let data =
            fs::read(input).with_context(|| format!("Failed to read {}", input.display()))?;
        bytes = replace_region(&bytes, partition, *selector, &data).with_context(|| {
            format!("Failed to replace region {selector} in partition {partition}")
        })?;
        if !cli.quiet {
            eprintln!(
                "{} Region {} <- {} ({} bytes)",
                style("✓").green(),
                selector,
                style(input.display()).cyan(),
                data.len()
            );
        }
    }

    let target = output.map_or(image, PathBuf::as_path);
    fs::write(target, &bytes)
        .with_context(|| format!("Failed to write image {}", target.display()))?;
    if !cli.quiet {
        eprintln!("{} Wrote {}", style("✓").green(), style(target.display()).cyan());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_pairs() {
        let args: Vec<String> = ["SP_BL1", "a.bin", "2", "b.bin"]
            .iter()
            .map(ToString::to_string)
            .collect();
        let pairs = region_pairs(&args, false).unwrap();
        assert_eq!(pairs[0].0, RegionSelector::Id(RegionId::SpBl1));
        assert_eq!(pairs[1].0, RegionSelector::Index(2));
        assert_eq!(pairs[1].1, PathBuf::from("b.bin"));

        let pairs = region_pairs(&args, true).unwrap();
        assert_eq!(pairs[1].0, RegionSelector::Id(RegionId::BootCounters));
    }

    #[test]
    fn test_hex_dump_trims_erased_tail() {
        let mut data = b"cfg=1 ok\x00\x01".to_vec();
        data.resize(64, 0xFF);
        let lines = hex_dump(&data);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("00000000  63 66 67 3d 31 20 6f 6b 00 01"));
        assert!(lines[0].ends_with("|cfg=1 ok..|"));

        assert!(hex_dump(&[0xFF; 32]).is_empty());
        assert_eq!(hex_dump(&[0u8; 17]).len(), 2);
        assert!(hex_dump(&[0u8; 17])[1].starts_with("00000010  00 "));
    }

    #[test]
    fn test_region_pairs_errors() {
        let odd = vec!["SP_BL1".to_string()];
        assert!(region_pairs(&odd, false).is_err());
        let bad = vec!["bogus".to_string(), "out.bin".to_string()];
        assert!(region_pairs(&bad, false).is_err());
    }
}
