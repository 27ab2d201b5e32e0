// Public modules
pub mod backup;
pub mod build;
pub mod deploy;
pub mod environment;
pub mod error;
pub mod git;
pub mod health;
pub mod history;
pub mod lock;
pub mod pipeline;
pub mod ssh;
pub mod transport;
pub mod workspace;

// Public modules for CLI access
pub mod defaults;
pub mod paths;

// Re-export common types for convenience
pub use error::{Error, ErrorCode, Result};
