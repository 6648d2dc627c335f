//! Tensor layout and memory placement tags.
//!
//! Backends report where a device tensor lives and how its payload is arranged. The split
//! convolution driver only inspects these tags; it never reorders data itself.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Physical arrangement of a device tensor's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    /// Plain row-major storage.
    RowMajor,
    /// 32x32 tiles, the native layout of the accelerator's matrix engine.
    Tile,
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layout::RowMajor => f.write_str("row-major"),
            Layout::Tile => f.write_str("tile"),
        }
    }
}

/// Class of memory a tensor currently resides in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    /// Host memory; the tensor has not been transferred to the device yet.
    Host,
    /// Bulk DRAM-class device memory.
    Dram,
    /// Fast on-chip scratch memory with small capacity.
    L1,
}

impl MemoryTier {
    pub fn is_device(self) -> bool {
        !matches!(self, MemoryTier::Host)
    }
}

impl fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryTier::Host => f.write_str("host"),
            MemoryTier::Dram => f.write_str("dram"),
            MemoryTier::L1 => f.write_str("l1"),
        }
    }
}
