pub mod api;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod hierarchy;
pub mod pipeline;
pub mod progress;
pub mod sequencer;
pub mod snapshot;
pub mod stacks;

pub use error::{ApiError, MigrateError};

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber: `RUST_LOG` when set, `info`
/// otherwise. Call once from the binary entry point.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
