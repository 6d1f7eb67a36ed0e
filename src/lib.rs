pub mod config;
pub mod core;
pub mod errors;

// Re-export commonly used items for convenience
pub use config::{ConfigError, VoiceConfig};
pub use core::*;
pub use errors::{VoiceError, VoiceResult};
