pub mod config;
pub mod error;
pub mod tool;

pub use config::NodeConfig;
pub use error::{NomadToolError, Result};

// Re-export key types from workspace crates
pub use consensus;
pub use network;
pub use storage;
