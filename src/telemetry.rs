// Process-wide logging initialization.
//
// `tracing` + `tracing-subscriber` are treated as an ambient capability:
// initialized once before any component starts, consulted by every
// component thereafter. See the design note on global state.

use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize the global tracing subscriber. Safe to call more than once;
/// only the first call takes effect.
pub fn init() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    });
}
