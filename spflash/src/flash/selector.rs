//! Active-partition selection.

use log::{debug, warn};
use thiserror::Error;

use super::partition::Partition;

/// Selection errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SelectError {
    /// Neither partition passed verification.
    #[error("no bootable partition")]
    NoBootablePartition,
}

/// Why a partition was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SelectReason {
    /// The other partition is invalid.
    OnlyValid,
    /// Both valid, this one has the greater priority counter.
    HigherPriority,
    /// Both valid with equal priority; the lower index wins.
    Tie,
}

/// Result of partition selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    /// Index of the partition to boot.
    pub active: usize,
    /// Index of the other partition.
    pub passive: usize,
    /// Why `active` was chosen.
    pub reason: SelectReason,
}

/// Pick the partition to boot from two scanned partitions.
///
/// A missing priority region ranks below every present counter value. On a
/// tie the first partition (`a`) wins. Incomplete boots are logged but do
/// not influence the choice.
pub fn select_active(a: &Partition, b: &Partition) -> Result<Selection, SelectError> {
    let pick = |active: &Partition, passive: &Partition, reason| {
        if active.boot_incomplete() {
            warn!(
                "Partition {}: last boot did not complete (attempted {:?}, completed {:?})",
                active.index,
                active.attempted_boot_count(),
                active.completed_boot_count()
            );
        }
        debug!("Selected partition {} ({reason:?})", active.index);
        Selection {
            active: active.index,
            passive: passive.index,
            reason,
        }
    };

    let selection = match (a.valid, b.valid) {
        (false, false) => return Err(SelectError::NoBootablePartition),
        (true, false) => pick(a, b, SelectReason::OnlyValid),
        (false, true) => pick(b, a, SelectReason::OnlyValid),
        (true, true) => {
            let (pa, pb) = (a.priority_value(), b.priority_value());
            if pb > pa {
                pick(b, a, SelectReason::HigherPriority)
            } else if pa > pb {
                pick(a, b, SelectReason::HigherPriority)
            } else {
                warn!(
                    "Partitions {} and {} have equal priority {pa:?}, using {}",
                    a.index, b.index, a.index
                );
                pick(a, b, SelectReason::Tie)
            }
        },
    };

    Ok(selection)
}
