//! Admission checks for candidate binaries.
//!
//! Runs before anything touches the filesystem or spawns a process. The
//! checks are ordered from cheapest to most expensive so that obviously bad
//! input never reaches the ELF parser.

use crate::config::types::{ValidationError, DEFAULT_MAX_FILE_SIZE};
use goblin::elf::Elf;

/// `\x7fELF`
pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// Validate `bytes` as an ELF binary no larger than `max_size` (50MB when `None`).
pub fn validate_binary(bytes: &[u8], max_size: Option<u64>) -> Result<(), ValidationError> {
    let max = max_size.unwrap_or(DEFAULT_MAX_FILE_SIZE);
    let size = bytes.len() as u64;

    if bytes.is_empty() {
        return Err(ValidationError::Empty);
    }
    if size > max {
        return Err(ValidationError::TooLarge { size, max });
    }
    if bytes.len() < ELF_MAGIC.len() {
        return Err(ValidationError::TooSmall { size });
    }
    if bytes[..4] != ELF_MAGIC {
        return Err(ValidationError::BadMagic);
    }

    Elf::parse(bytes).map_err(|e| ValidationError::Malformed(e.to_string()))?;
    Ok(())
}
