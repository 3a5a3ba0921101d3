//! Write-once-bit ("thermometer") counters.
//!
//! A counter field starts erased (all ones). Its value is the number of zero
//! bits. Incrementing clears more bits, starting from bit 0 of byte 0, so the
//! field can be updated with a plain program operation and never needs an
//! erase cycle.
//!
//! A well-formed field therefore reads, from the low bit upwards, as a run of
//! zeros followed by a run of ones. A zero that shows up after a one means
//! the field was damaged; the value is still reported on a best-effort basis.

use log::warn;
use thiserror::Error;

use super::BLOCK_SIZE;

/// Size of each boot counter inside the boot-counters region.
pub const BOOT_COUNTER_SIZE: usize = BLOCK_SIZE / 2;

/// Counter encoding errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CounterError {
    /// The requested value does not fit the field.
    #[error("counter value {value} exceeds field capacity of {capacity}")]
    ValueTooLarge {
        /// Requested value.
        value: u32,
        /// Largest value the field can hold.
        capacity: u32,
    },

    /// The requested value is below the current one.
    #[error("counter cannot move backwards from {current} to {requested}")]
    Decrease {
        /// Current decoded value.
        current: u32,
        /// Requested value.
        requested: u32,
    },
}

/// Largest value a field of `len` bytes can represent.
pub fn capacity(len: usize) -> u32 {
    u32::try_from(len.saturating_mul(8)).unwrap_or(u32::MAX)
}

/// Decode a counter field.
///
/// Returns the number of zero bits and whether the field is corrupted
/// (a zero bit found above a one bit).
pub fn decode(bytes: &[u8]) -> (u32, bool) {
    let mut value = 0u32;
    let mut seen_one = false;
    let mut corrupted = false;

    for byte in bytes {
        if *byte == 0x00 && !seen_one {
            value += 8;
            continue;
        }
        for bit in 0..8 {
            if (byte >> bit) & 1 == 0 {
                value += 1;
                corrupted |= seen_one;
            } else {
                seen_one = true;
            }
        }
    }

    (value, corrupted)
}

/// Produce the bytes of `current` with the low `new_value` bits cleared.
///
/// Bits above `new_value` keep their existing state, so the result is always
/// a bitwise AND-subset of `current`. The caller must not ask for a value
/// below the current one; this function cannot set bits back to one.
pub fn encode_increment(current: &[u8], new_value: u32) -> Result<Vec<u8>, CounterError> {
    let capacity = capacity(current.len());
    if new_value > capacity {
        return Err(CounterError::ValueTooLarge {
            value: new_value,
            capacity,
        });
    }

    let mut out = current.to_vec();
    let full_bytes = (new_value / 8) as usize;
    let rest = new_value % 8;

    for byte in &mut out[..full_bytes] {
        *byte = 0;
    }
    if rest != 0 {
        out[full_bytes] &= 0xFF << rest;
    }

    Ok(out)
}

/// A decoded thermometer counter together with its raw field.
///
/// All mutation goes through [`Counter::try_increment_to`], which keeps the
/// monotonicity invariant in one place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counter {
    bytes: Vec<u8>,
    value: u32,
    corrupted: bool,
}

impl Counter {
    /// An erased (zero-valued) counter of `len` bytes.
    pub fn erased(len: usize) -> Self {
        Self {
            bytes: vec![0xFF; len],
            value: 0,
            corrupted: false,
        }
    }

    /// Decode a counter from its raw field.
    pub fn decode(bytes: &[u8]) -> Self {
        let (value, corrupted) = decode(bytes);
        if corrupted {
            warn!("Counter field is corrupted, best-effort value is {value}");
        }
        Self {
            bytes: bytes.to_vec(),
            value,
            corrupted,
        }
    }

    /// Decoded value.
    pub fn value(&self) -> u32 {
        self.value
    }

    /// Whether the field had a zero bit above a one bit.
    pub fn is_corrupted(&self) -> bool {
        self.corrupted
    }

    /// Largest value this field can hold.
    pub fn capacity(&self) -> u32 {
        capacity(self.bytes.len())
    }

    /// Raw field bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume the counter and return its raw field.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Advance the counter to `new_value`.
    ///
    /// Fails without modifying the counter if `new_value` is below the
    /// current value or beyond the field capacity.
    pub fn try_increment_to(&mut self, new_value: u32) -> Result<(), CounterError> {
        if new_value < self.value {
            return Err(CounterError::Decrease {
                current: self.value,
                requested: new_value,
            });
        }
        let bytes = encode_increment(&self.bytes, new_value)?;
        let (value, corrupted) = decode(&bytes);
        self.bytes = bytes;
        self.value = value;
        self.corrupted = corrupted;
        Ok(())
    }

    /// Advance the counter by one.
    pub fn increment(&mut self) -> Result<(), CounterError> {
        let next = self
            .value
            .checked_add(1)
            .ok_or(CounterError::ValueTooLarge {
                value: u32::MAX,
                capacity: self.capacity(),
            })?;
        self.try_increment_to(next)
    }
}

/// Split a boot-counters block into its (attempted, completed) halves.
pub fn split_boot_counters(block: &[u8]) -> (Counter, Counter) {
    let mid = block.len().min(BOOT_COUNTER_SIZE);
    let (attempted, completed) = block.split_at(mid);
    let completed = &completed[..completed.len().min(BOOT_COUNTER_SIZE)];
    (Counter::decode(attempted), Counter::decode(completed))
}
