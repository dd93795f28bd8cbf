//! ELF admission and static analysis
//!
//! Nothing in this module executes the binary it inspects.

pub mod analyze;
pub mod names;
pub mod validate;

pub use analyze::{analyze, analyze_binary, BinaryInfo, SectionInfo, SegmentInfo};
pub use validate::validate_binary;
