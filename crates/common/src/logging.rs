// PoW Proxy - Ethereum JSON-RPC relay
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Logging configuration for the proxy components
//!
//! Provides centralized logging setup with:
//! - Colorful console output with structured formatting
//! - Optional file logging to a temporary directory with daily rotation
//! - Environment variable support (RUST_LOG)
//! - Default INFO level

use eyre::Result;
use std::{env, fs, path::PathBuf, sync::Once};
use tracing::Level;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    fmt::{self, time::LocalTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Name of the directory (under the system temp dir) that holds log files
const LOG_ROOT_DIR: &str = "pow-proxy-logs";

/// Noisy HTTP and websocket internals that are capped at WARN on the console
const QUIET_TARGETS: &[&str] = &["tower_http=warn", "hyper=warn", "reqwest=warn", "tungstenite=warn"];

/// Initialize logging for a proxy component
///
/// This function sets up:
/// - Colorful, structured console logging with timestamps
/// - File logging to a temporary directory with daily rotation (optional)
/// - Environment variable support for log levels (RUST_LOG)
/// - Default INFO level if no RUST_LOG is set
///
/// # Arguments
/// * `component_name` - Name of the component (e.g., "pow-proxy")
/// * `enable_file_logging` - Whether to also write logs to a rolling file
///
/// # Returns
/// The log directory when file logging was enabled
///
/// # Examples
/// ```rust,no_run
/// use pow_proxy_common::logging;
///
/// fn main() -> eyre::Result<()> {
///     logging::init_logging("pow-proxy", false)?;
///
///     tracing::info!("Application started");
///     Ok(())
/// }
/// ```
pub fn init_logging(component_name: &str, enable_file_logging: bool) -> Result<Option<PathBuf>> {
    let env_filter = default_filter(Level::INFO)?;

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_timer(LocalTime::rfc_3339())
        .with_ansi(true)
        .compact();

    let log_dir = if enable_file_logging {
        let log_dir = create_log_directory(component_name)?;

        // Create file appender with daily rotation
        let file_appender = rolling::daily(&log_dir, format!("{component_name}.log"));
        let (non_blocking_appender, guard) = non_blocking(file_appender);

        // The guard flushes on drop and the subscriber lives for the whole process
        std::mem::forget(guard);

        let file_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_timer(LocalTime::rfc_3339())
            .with_ansi(false)
            .with_writer(non_blocking_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer.with_filter(filter_for_console()?))
            .with(file_layer)
            .try_init()
            .map_err(|e| eyre::eyre!("Failed to initialize tracing subscriber: {}", e))?;

        tracing::info!(
            component = component_name,
            log_dir = %log_dir.display(),
            "Logging initialized with console and file output"
        );
        Some(log_dir)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer.with_filter(filter_for_console()?))
            .try_init()
            .map_err(|e| eyre::eyre!("Failed to initialize tracing subscriber: {}", e))?;

        tracing::info!(component = component_name, "Logging initialized with console output only");
        None
    };

    log_environment_info(component_name);

    Ok(log_dir)
}

/// Build the base filter from RUST_LOG, falling back to `level`
fn default_filter(level: Level) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.as_str()))
        .map_err(|e| eyre::eyre!("Failed to create environment filter: {}", e))
}

/// Create log directory in system temp folder
fn create_log_directory(component_name: &str) -> Result<PathBuf> {
    let log_dir = env::temp_dir().join(LOG_ROOT_DIR).join(component_name);
    fs::create_dir_all(&log_dir)?;
    Ok(log_dir)
}

/// Filter for console output - quiets transport internals
fn filter_for_console() -> Result<EnvFilter> {
    let mut filter = default_filter(Level::INFO)?;
    for directive in QUIET_TARGETS {
        filter = filter.add_directive(directive.parse()?);
    }
    Ok(filter)
}

/// Log useful environment and system information
fn log_environment_info(component_name: &str) {
    let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    tracing::info!(
        component = component_name,
        version = env!("CARGO_PKG_VERSION"),
        rust_log = %rust_log,
        pid = std::process::id(),
        "Environment information"
    );
}

/// Initialize simple logging (console only, no fancy formatting)
///
/// This is useful for tests or simple utilities that don't need
/// the full logging setup.
///
/// # Arguments
/// * `level` - The default log level to use
pub fn init_simple_logging(level: Level) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(default_filter(level)?)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|e| eyre::eyre!("Failed to initialize simple logging: {}", e))?;

    Ok(())
}

// Global test logging initialization - ensures logging is only set up once across all tests
static TEST_LOGGING_INIT: Once = Once::new();

/// Safe logging initialization for tests - can be called multiple times without crashing
///
/// Console-only, INFO by default but respects RUST_LOG. Uses `std::sync::Once`
/// so that every test in a process can call it.
///
/// # Usage
/// ```rust
/// use pow_proxy_common::logging;
/// use tracing::info;
///
/// fn my_test() {
///     logging::ensure_test_logging(None);
///     info!("This will work safely in any test!");
/// }
/// ```
pub fn ensure_test_logging(default_level: Option<Level>) {
    TEST_LOGGING_INIT.call_once(|| {
        // A subscriber may already be installed by the harness, which is fine
        let _ = init_simple_logging(default_level.unwrap_or(Level::INFO));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{debug, error, info, warn};

    #[test]
    fn test_logging_functions_work() {
        ensure_test_logging(None);

        info!("Test info message");
        warn!("Test warning message");
        debug!("Test debug message");
        error!("Test error message");
    }

    #[test]
    fn test_log_directory_creation() {
        let log_dir = create_log_directory("test-component").unwrap();
        assert!(log_dir.exists());
        assert!(log_dir.to_string_lossy().contains(LOG_ROOT_DIR));
        assert!(log_dir.to_string_lossy().contains("test-component"));
    }

    #[test]
    fn test_console_filter_quiets_transport_targets() {
        let console_filter = filter_for_console().unwrap().to_string();
        assert!(console_filter.contains("hyper=warn"));
        assert!(console_filter.contains("tungstenite=warn"));
    }

    #[test]
    fn test_repeated_initialization_is_graceful() {
        ensure_test_logging(None);

        // A subscriber is already installed, so this must fail without panicking
        assert!(init_logging("test-repeat", false).is_err());
        info!("Test logging after repeated init attempts");
    }
}
