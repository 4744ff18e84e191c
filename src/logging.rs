/*!
 * Diagnostic logging initialization
 *
 * Diagnostics go through `tracing` to stderr; stdout belongs to the monitor.
 */

use std::io;

use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Initialize the global subscriber. `RUST_LOG` overrides the default
/// `convoy=warn` filter. Safe to call more than once; later calls are no-ops.
pub fn init() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("convoy=warn"));

    let fmt_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .ok();
}
