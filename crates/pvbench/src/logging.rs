use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "PVBENCH_LOG";

/// Diagnostics go to stderr; stdout stays reserved for progress lines and reports.
/// `PVBENCH_LOG` takes precedence over `RUST_LOG`; the default level is `warn`.
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
