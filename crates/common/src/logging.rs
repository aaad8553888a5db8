//! Logging setup shared by the gateway binary and tests

use eyre::Result;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, EnvFilter};

/// Initializes logging for a lockrpc component
///
/// Reads the filter from `RUST_LOG` (defaulting to `info` for the given
/// component) and installs a formatted subscriber on stdout.
///
/// # Arguments
/// * `component` - Component name used as the default filter target
/// * `with_ansi` - Whether to emit ANSI color codes
pub fn init_logging(component: &str, with_ansi: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("info,{component}=info")));

    fmt()
        .with_env_filter(filter)
        .with_ansi(with_ansi)
        .with_target(true)
        .try_init()
        .map_err(|e| eyre::eyre!("Failed to initialize logging: {e}"))?;

    Ok(())
}

static TEST_LOGGING: OnceLock<()> = OnceLock::new();

/// Ensures logging is initialized exactly once for tests
///
/// Safe to call from every test; subsequent calls are no-ops. An explicit
/// filter overrides `RUST_LOG`; with `None` the environment (or `warn`)
/// decides.
pub fn ensure_test_logging(filter: Option<&str>) {
    let directive = filter.map(str::to_string);
    TEST_LOGGING.get_or_init(|| {
        let filter = match directive {
            Some(directive) => EnvFilter::new(directive),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        };

        // A second subscriber in the same process is fine to ignore.
        let _ = fmt().with_env_filter(filter).with_test_writer().try_init();
    });
}
