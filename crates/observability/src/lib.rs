//! Process-wide logging setup shared by pickline binaries.

/// Tracing subscriber configuration.
pub mod tracing;

/// Initialize JSON logging filtered by `RUST_LOG` (default `info`).
///
/// Safe to call multiple times; later calls are no-ops.
pub fn init() {
    tracing::init(tracing::DEFAULT_FILTER);
}
