//! `postpilot-core`: shared configuration, error and domain tag types.

pub mod config;
pub mod error;
pub mod types;

pub use config::{PostpilotConfig, SchedulerConfig};
pub use error::{CoreError, Result};
pub use types::{Platform, PostId, PostStatus};
