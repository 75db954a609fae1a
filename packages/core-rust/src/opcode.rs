//! Operation kinds understood by the acceleration framework.
//!
//! Every opcode has a stable lowercase name used by configuration dumps and
//! administrative requests, and a dense index used to address per-opcode
//! tables (routing slots, overrides, module sub-channels).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Number of defined opcodes. Sizes every per-opcode table.
pub const OPCODE_COUNT: usize = 10;

/// A bulk-data operation that can be offloaded to a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Opcode {
    Copy,
    Fill,
    /// Copy one source into two destinations.
    Dualcast,
    Compare,
    Crc32c,
    /// Copy combined with a CRC-32C over the source.
    CopyCrc32c,
    Compress,
    Decompress,
    Encrypt,
    Decrypt,
}

impl Opcode {
    /// All opcodes in index order.
    pub const ALL: [Opcode; OPCODE_COUNT] = [
        Opcode::Copy,
        Opcode::Fill,
        Opcode::Dualcast,
        Opcode::Compare,
        Opcode::Crc32c,
        Opcode::CopyCrc32c,
        Opcode::Compress,
        Opcode::Decompress,
        Opcode::Encrypt,
        Opcode::Decrypt,
    ];

    /// Dense index of this opcode, in `0..OPCODE_COUNT`.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Looks up an opcode by its dense index.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownOpcode::Index`] when `index >= OPCODE_COUNT`.
    pub fn from_index(index: usize) -> Result<Self, UnknownOpcode> {
        Self::ALL
            .get(index)
            .copied()
            .ok_or(UnknownOpcode::Index(index))
    }

    /// Stable lowercase name, e.g. `"copy_crc32c"`.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Opcode::Copy => "copy",
            Opcode::Fill => "fill",
            Opcode::Dualcast => "dualcast",
            Opcode::Compare => "compare",
            Opcode::Crc32c => "crc32c",
            Opcode::CopyCrc32c => "copy_crc32c",
            Opcode::Compress => "compress",
            Opcode::Decompress => "decompress",
            Opcode::Encrypt => "encrypt",
            Opcode::Decrypt => "decrypt",
        }
    }

    /// Whether this opcode consumes a crypto key.
    #[must_use]
    pub const fn is_crypto(self) -> bool {
        matches!(self, Opcode::Encrypt | Opcode::Decrypt)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Opcode {
    type Err = UnknownOpcode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|op| op.name() == s)
            .ok_or_else(|| UnknownOpcode::Name(s.to_string()))
    }
}

/// An opcode name or index that does not identify a defined opcode.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnknownOpcode {
    #[error("unknown opcode name: {0}")]
    Name(String),
    #[error("opcode index {0} out of range")]
    Index(usize),
}
