//! Region identifiers and the region table codec.

use std::fmt;
use std::io::{self, Read};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use thiserror::Error;

use super::{BLOCK_SIZE, crc32};

/// Encoded region descriptor size in bytes.
pub const REGION_INFO_SIZE: usize = 16;

/// Largest region identifier a reader accepts.
///
/// Identifiers above the known set but not above this value are tolerated
/// and skipped by readers.
pub const MAX_REGION_ID: u32 = 0xFF;

/// Offset of the checksum field inside a descriptor.
const CHECKSUM_OFFSET: usize = REGION_INFO_SIZE - 4;

/// Region identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionId {
    /// Never valid in a region table.
    Invalid,
    /// Priority counter used to pick the active partition.
    PriorityDesignator,
    /// Attempted/completed boot counters.
    BootCounters,
    /// Board and asset configuration.
    ConfigurationData,
    /// VaultIP firmware.
    VaultipFw,
    /// PCIe configuration data.
    PcieConfig,
    /// Service processor certificates.
    SpCertificates,
    /// Service processor first-stage bootloader.
    SpBl1,
    /// Service processor second-stage bootloader.
    SpBl2,
    /// Software certificates.
    SwCertificates,
    /// Communication certificates.
    CommCertificates,
    /// DRAM training data.
    DramTraining,
    /// Machine minion firmware.
    MachineMinion,
    /// Master minion firmware.
    MasterMinion,
    /// Worker minion firmware.
    WorkerMinion,
    /// Maxion first-stage bootloader.
    MaxionBl1,
    /// 2D DRAM training data.
    DramTraining2d,
    /// Identifier not known to this build but within the accepted range.
    Unknown(u32),
}

/// Known identifiers and their canonical names.
const KNOWN_REGIONS: &[(RegionId, &str)] = &[
    (RegionId::PriorityDesignator, "PRIORITY_DESIGNATOR"),
    (RegionId::BootCounters, "BOOT_COUNTERS"),
    (RegionId::ConfigurationData, "CONFIGURATION_DATA"),
    (RegionId::VaultipFw, "VAULTIP_FW"),
    (RegionId::PcieConfig, "PCIE_CONFIG"),
    (RegionId::SpCertificates, "SP_CERTIFICATES"),
    (RegionId::SpBl1, "SP_BL1"),
    (RegionId::SpBl2, "SP_BL2"),
    (RegionId::SwCertificates, "SW_CERTIFICATES"),
    (RegionId::CommCertificates, "COMM_CERTIFICATES"),
    (RegionId::DramTraining, "DRAM_TRAINING"),
    (RegionId::MachineMinion, "MACHINE_MINION"),
    (RegionId::MasterMinion, "MASTER_MINION"),
    (RegionId::WorkerMinion, "WORKER_MINION"),
    (RegionId::MaxionBl1, "MAXION_BL1"),
    (RegionId::DramTraining2d, "DRAM_TRAINING_2D"),
];

impl From<u32> for RegionId {
    fn from(value: u32) -> Self {
        match value {
            0 => Self::Invalid,
            1 => Self::PriorityDesignator,
            2 => Self::BootCounters,
            3 => Self::ConfigurationData,
            4 => Self::VaultipFw,
            5 => Self::PcieConfig,
            6 => Self::SpCertificates,
            7 => Self::SpBl1,
            8 => Self::SpBl2,
            9 => Self::SwCertificates,
            10 => Self::CommCertificates,
            11 => Self::DramTraining,
            12 => Self::MachineMinion,
            13 => Self::MasterMinion,
            14 => Self::WorkerMinion,
            15 => Self::MaxionBl1,
            16 => Self::DramTraining2d,
            v => Self::Unknown(v),
        }
    }
}

impl RegionId {
    /// Returns the numeric value stored on flash.
    pub fn as_u32(&self) -> u32 {
        match self {
            Self::Invalid => 0,
            Self::PriorityDesignator => 1,
            Self::BootCounters => 2,
            Self::ConfigurationData => 3,
            Self::VaultipFw => 4,
            Self::PcieConfig => 5,
            Self::SpCertificates => 6,
            Self::SpBl1 => 7,
            Self::SpBl2 => 8,
            Self::SwCertificates => 9,
            Self::CommCertificates => 10,
            Self::DramTraining => 11,
            Self::MachineMinion => 12,
            Self::MasterMinion => 13,
            Self::WorkerMinion => 14,
            Self::MaxionBl1 => 15,
            Self::DramTraining2d => 16,
            Self::Unknown(v) => *v,
        }
    }

    /// Whether this is one of the fixed one-block control regions.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Self::PriorityDesignator | Self::BootCounters | Self::ConfigurationData
        )
    }

    /// Whether readers accept this identifier.
    pub fn is_valid(&self) -> bool {
        let value = self.as_u32();
        value != 0 && value <= MAX_REGION_ID
    }

    /// Canonical name, if the identifier is known.
    pub fn name(&self) -> Option<&'static str> {
        KNOWN_REGIONS
            .iter()
            .find(|(id, _)| id == self)
            .map(|(_, name)| *name)
    }

    /// Look up an identifier by name (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        KNOWN_REGIONS
            .iter()
            .find(|(_, known)| known.eq_ignore_ascii_case(name))
            .map(|(id, _)| *id)
    }

    /// Parse a name, a decimal number or a `0x`-prefixed hex number.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Some(id) = Self::from_name(s) {
            return Some(id);
        }
        let value = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            u32::from_str_radix(hex, 16).ok()?
        } else {
            s.parse().ok()?
        };
        Some(Self::from(value))
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None if *self == Self::Invalid => f.write_str("INVALID"),
            None => write!(f, "UNKNOWN({:#x})", self.as_u32()),
        }
    }
}

/// Region table verification errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegionError {
    /// Fewer bytes than a descriptor were supplied.
    #[error("region descriptor truncated: {len} bytes")]
    Truncated {
        /// Bytes available.
        len: usize,
    },

    /// Descriptor checksum mismatch.
    #[error("region checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// Checksum stored in the descriptor.
        stored: u32,
        /// Checksum computed over the descriptor bytes.
        computed: u32,
    },

    /// Identifier is zero or above [`MAX_REGION_ID`].
    #[error("invalid region id {0:#x}")]
    InvalidId(u32),

    /// Region reserves no space.
    #[error("region {0} has zero size")]
    ZeroSize(RegionId),

    /// Offset plus size overflows.
    #[error("region {id} offset {offset} + size {size} overflows")]
    Overflow {
        /// Region identifier.
        id: RegionId,
        /// Offset in blocks.
        offset: u32,
        /// Size in blocks.
        size: u32,
    },

    /// Region does not start where the previous one ended.
    #[error("region {id} starts at block {actual}, expected {expected}")]
    NonContiguous {
        /// Region identifier.
        id: RegionId,
        /// Expected starting block.
        expected: u32,
        /// Actual starting block.
        actual: u32,
    },

    /// Region ends past the partition.
    #[error("region {id} ends at block {end}, partition has {partition_blocks}")]
    OutOfBounds {
        /// Region identifier.
        id: RegionId,
        /// First block after the region.
        end: u32,
        /// Partition size in blocks.
        partition_blocks: u32,
    },

    /// Control region is not exactly one block.
    #[error("control region {id} must be 1 block, found {size}")]
    ControlRegionSize {
        /// Region identifier.
        id: RegionId,
        /// Size in blocks.
        size: u32,
    },
}

/// One entry of the region table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionDescriptor {
    /// Region identifier.
    pub region_id: RegionId,
    /// Offset from the start of the partition, in blocks.
    pub offset_blocks: u32,
    /// Reserved size, in blocks.
    pub size_blocks: u32,
    /// CRC-32 over the preceding fields.
    pub checksum: u32,
}

impl RegionDescriptor {
    /// Build a sealed descriptor.
    pub fn new(region_id: RegionId, offset_blocks: u32, size_blocks: u32) -> Self {
        let mut desc = Self {
            region_id,
            offset_blocks,
            size_blocks,
            checksum: 0,
        };
        desc.checksum = desc.compute_checksum();
        desc
    }

    /// Read a descriptor from a reader without validating it.
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            region_id: reader.read_u32::<LittleEndian>()?.into(),
            offset_blocks: reader.read_u32::<LittleEndian>()?,
            size_blocks: reader.read_u32::<LittleEndian>()?,
            checksum: reader.read_u32::<LittleEndian>()?,
        })
    }

    /// Encode the descriptor.
    pub fn to_bytes(&self) -> [u8; REGION_INFO_SIZE] {
        let mut buf = [0u8; REGION_INFO_SIZE];
        LittleEndian::write_u32_into(
            &[
                self.region_id.as_u32(),
                self.offset_blocks,
                self.size_blocks,
                self.checksum,
            ],
            &mut buf,
        );
        buf
    }

    /// Checksum the descriptor fields as currently set.
    pub fn compute_checksum(&self) -> u32 {
        crc32(&self.to_bytes()[..CHECKSUM_OFFSET])
    }

    /// Byte offset of the region within its partition.
    pub fn offset_bytes(&self) -> usize {
        self.offset_blocks as usize * BLOCK_SIZE
    }

    /// Reserved size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.size_blocks as usize * BLOCK_SIZE
    }

    /// Byte range of the region within its partition.
    pub fn byte_range(&self) -> std::ops::Range<usize> {
        let start = self.offset_bytes();
        start..start + self.size_bytes()
    }

    /// First block after this region.
    pub fn end_block(&self) -> Option<u32> {
        self.offset_blocks.checked_add(self.size_blocks)
    }
}

/// Decode and verify one region descriptor.
///
/// `expected_next_offset` is the block where the previous region ended
/// (block 1 for the first entry).
pub fn verify_region(
    bytes: &[u8],
    partition_size_blocks: u32,
    expected_next_offset: u32,
) -> Result<RegionDescriptor, RegionError> {
    let Some(mut raw) = bytes.get(..REGION_INFO_SIZE) else {
        return Err(RegionError::Truncated { len: bytes.len() });
    };
    let desc = RegionDescriptor::read_from(&mut raw)
        .map_err(|_| RegionError::Truncated { len: bytes.len() })?;

    let computed = desc.compute_checksum();
    if computed != desc.checksum {
        return Err(RegionError::ChecksumMismatch {
            stored: desc.checksum,
            computed,
        });
    }

    let id = desc.region_id;
    if !id.is_valid() {
        return Err(RegionError::InvalidId(id.as_u32()));
    }
    if desc.size_blocks == 0 {
        return Err(RegionError::ZeroSize(id));
    }
    let Some(end) = desc.end_block() else {
        return Err(RegionError::Overflow {
            id,
            offset: desc.offset_blocks,
            size: desc.size_blocks,
        });
    };
    if desc.offset_blocks != expected_next_offset {
        return Err(RegionError::NonContiguous {
            id,
            expected: expected_next_offset,
            actual: desc.offset_blocks,
        });
    }
    if end > partition_size_blocks {
        return Err(RegionError::OutOfBounds {
            id,
            end,
            partition_blocks: partition_size_blocks,
        });
    }
    if id.is_control() && desc.size_blocks != 1 {
        return Err(RegionError::ControlRegionSize {
            id,
            size: desc.size_blocks,
        });
    }

    Ok(desc)
}
