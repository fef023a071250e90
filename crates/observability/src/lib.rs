//! Tracing/logging setup shared by the pipeline binaries and tests.

pub mod subscriber;

pub use subscriber::{LogConfig, LogFormat};

/// Initialize process-wide logging with JSON output filtered by `RUST_LOG`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    subscriber::init(&LogConfig::from_env());
}
