//! JSON image templates.
//!
//! A template describes either a whole image or a single partition:
//!
//! ```json
//! {"image": {"partitions": [
//!     {"partition_size": 64, "priority": 1, "regions": [
//!         {"id": "SP_BL1", "file": "bl1.bin"},
//!         {"id": "0x03", "size": 4}
//!     ]}
//! ]}}
//! ```
//!
//! Sizes are in KiB. Integers may be JSON numbers or strings holding a
//! decimal or `0x` hex value. File paths are relative to the template.

use {
    anyhow::{Context, Result, anyhow, bail},
    log::debug,
    serde::Deserialize,
    spflash::{PartitionSpec, RegionId, RegionSpec},
    std::{
        fs,
        path::{Path, PathBuf},
    },
};

const KIB: u64 = 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Integer {
    Number(u64),
    Text(String),
}

impl Integer {
    fn value(&self) -> Result<u64> {
        match self {
            Self::Number(n) => Ok(*n),
            Self::Text(s) => {
                let s = s.trim();
                match s
                    .strip_prefix("0x")
                    .or_else(|| s.strip_prefix("0X"))
                {
                    Some(hex) => u64::from_str_radix(hex, 16),
                    None => s.parse(),
                }
                .map_err(|e| anyhow!("invalid integer '{s}': {e}"))
            },
        }
    }

    fn as_u32(&self, field: &str) -> Result<u32> {
        let value = self.value()?;
        u32::try_from(value).map_err(|_| anyhow!("{field} {value} does not fit in 32 bits"))
    }

    fn as_bytes(&self, field: &str) -> Result<usize> {
        let value = self.value()?;
        value
            .checked_mul(KIB)
            .and_then(|bytes| usize::try_from(bytes).ok())
            .ok_or_else(|| anyhow!("{field} {value} KiB is too large"))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TemplateFile {
    image: Option<ImageTemplate>,
    partition: Option<PartitionTemplate>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImageTemplate {
    partitions: Vec<PartitionTemplate>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PartitionTemplate {
    partition_size: Integer,
    image_version: Option<Integer>,
    priority: Option<Integer>,
    attempted_boot_count: Option<Integer>,
    completed_boot_count: Option<Integer>,
    #[serde(default)]
    regions: Vec<RegionTemplate>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegionTemplate {
    id: Integer,
    size: Option<Integer>,
    file: Option<PathBuf>,
}

/// Load a template file and turn it into partition specs.
///
/// `default_version` applies to partitions that do not set `image_version`.
pub(crate) fn load_template(path: &Path, default_version: u32) -> Result<Vec<PartitionSpec>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read template {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    parse_template(&text, base, default_version)
        .with_context(|| format!("Invalid template {}", path.display()))
}

fn parse_template(text: &str, base: &Path, default_version: u32) -> Result<Vec<PartitionSpec>> {
    let file: TemplateFile = serde_json::from_str(text)?;
    let partitions = match (file.image, file.partition) {
        (Some(image), None) => image.partitions,
        (None, Some(partition)) => vec![partition],
        (Some(_), Some(_)) => bail!("template has both 'image' and 'partition'"),
        (None, None) => bail!("template needs an 'image' or 'partition' object"),
    };
    if partitions.is_empty() || partitions.len() > 2 {
        bail!(
            "an image holds one or two partitions, template has {}",
            partitions.len()
        );
    }

    partitions
        .iter()
        .enumerate()
        .map(|(i, p)| {
            partition_spec(p, base, default_version)
                .with_context(|| format!("partition {}", i + 1))
        })
        .collect()
}

fn partition_spec(p: &PartitionTemplate, base: &Path, default_version: u32) -> Result<PartitionSpec> {
    let mut spec = PartitionSpec::new(p.partition_size.as_bytes("partition_size")?);
    spec.image_version = match &p.image_version {
        Some(v) => v.as_u32("image_version")?,
        None => default_version,
    };
    if let Some(v) = &p.priority {
        spec.priority = v.as_u32("priority")?;
    }
    if let Some(v) = &p.attempted_boot_count {
        spec.attempted_boot_count = v.as_u32("attempted_boot_count")?;
    }
    if let Some(v) = &p.completed_boot_count {
        spec.completed_boot_count = v.as_u32("completed_boot_count")?;
    }

    for region in &p.regions {
        let id = match &region.id {
            Integer::Number(n) => u32::try_from(*n).ok().map(RegionId::from),
            Integer::Text(s) => RegionId::parse(s),
        }
        .ok_or_else(|| anyhow!("unknown region id {:?}", region.id))?;

        let mut rs = RegionSpec::new(id);
        if let Some(size) = &region.size {
            rs = rs.with_size(size.as_bytes("region size")?);
        }
        if let Some(file) = &region.file {
            let path = base.join(file);
            let data = fs::read(&path)
                .with_context(|| format!("Failed to read region file {}", path.display()))?;
            debug!("Region {id}: {} bytes from {}", data.len(), path.display());
            rs.data = Some(data);
        }
        spec.regions.push(rs);
    }
    Ok(spec)
}
