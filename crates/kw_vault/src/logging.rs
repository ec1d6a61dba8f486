use tracing_subscriber::EnvFilter;

/// Default directives when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "kw_vault=info,kw_store=info";

/// Install the global fmt subscriber. Safe to call more than once; later
/// calls are no-ops.
pub fn init() {
    init_with(DEFAULT_FILTER);
}

pub fn init_with(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .try_init();
}
