// Logging setup for binaries and host applications
// Library code only emits tracing events; installing a subscriber is the host's call

use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "tempoline=info";

/// Install a global `fmt` subscriber.
///
/// `RUST_LOG` takes precedence over `filter`; with neither set the engine logs
/// at `info`. Fails if a global subscriber is already installed.
pub fn init_logging(filter: Option<&str>) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter.unwrap_or(DEFAULT_FILTER)))
        .map_err(|e| format!("Invalid log filter: {}", e))?;

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|e| format!("Failed to install log subscriber: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_an_error_not_a_panic() {
        let _ = init_logging(Some("tempoline=debug"));
        assert!(init_logging(None).is_err());
    }
}
