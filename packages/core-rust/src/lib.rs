//! Offload core types: the opcode vocabulary plus key and checksum helpers.

pub mod crc32c;
pub mod key_hex;
pub mod opcode;

pub use key_hex::{unhexlify, HexError, MAX_KEY_HEX_LEN};
pub use opcode::{Opcode, UnknownOpcode, OPCODE_COUNT};
