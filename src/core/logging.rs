//! Logging initialization and utilities

/// Initialize the logging system
///
/// Uses env_logger with the given default filter level (`info`, `debug`,
/// `trace`...). Override with RUST_LOG environment variable.
///
/// # Example
/// ```
/// copcbuild::core::logging::init("info");
/// log::info!("Build started");
/// ```
pub fn init(default_level: &str) {
    // try_init: tests and doc-tests may call this more than once
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_level)
    )
    .format_timestamp_millis()
    .try_init();
}
