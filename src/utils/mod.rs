//! Generic utility primitives with zero domain knowledge.
//!
//! - `archive` - Zip packing, unpacking and exclude matching
//! - `artifact` - Artifact path resolution
//! - `command` - Command execution with timeouts and captured output
//! - `shell` - Quoting for remote shell commands
//! - `timestamp` - UTC timestamp formats

pub mod archive;
pub mod artifact;
pub mod command;
pub mod shell;
pub mod timestamp;
