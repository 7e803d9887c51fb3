// Core modules
pub mod backfill;
pub mod clock;
pub mod config;
pub mod engine;
pub mod execution;
pub mod journal;
pub mod models;
pub mod range;
pub mod sim;
pub mod stream;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::{Engine, EngineError, EngineEvent, EngineSnapshot};
pub use models::*;
