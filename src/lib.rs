/*!
 * Tollgate - rate-limited, retrying, circuit-broken HTTP client calls
 *
 * The client-facing layer over `tollgate-core-resilience`:
 * - TOML configuration with per-destination overrides
 * - Structured logging setup (compact stdout or JSON file)
 * - A registry holding one execution controller per destination
 *
 * Author: Shane Wall <shaneawall@gmail.com>
 */

pub mod config;
pub mod error;
pub mod logging;
pub mod registry;

// Re-export commonly used types
pub use config::{DestinationOverrides, LogLevel, TollgateConfig};
pub use error::{Result, TollgateError};
pub use logging::init_logging;
pub use registry::DestinationRegistry;
pub use tollgate_core_resilience as resilience;
pub use tollgate_core_resilience::{
    AttemptOutcome, ExecutionController, ExecutionError, FailureKind, RunContext,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
