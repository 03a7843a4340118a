use tracing_subscriber::EnvFilter;

/// Initializes the global `tracing` subscriber once, at process start. Components never
/// reach for a singleton logger themselves — they just call `tracing::{info,warn,error}`,
/// which this sets up to route somewhere sane.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// CRITICAL-level events per the error handling design: rollback failures, market-close
/// failures, incomplete orphan recovery, drawdown force-resets. Tagged with `critical = true`
/// so a log-shipping sidecar can route these to an alerting channel without string matching.
#[macro_export]
macro_rules! critical {
    ($($arg:tt)*) => {
        tracing::error!(critical = true, $($arg)*)
    };
}
