use std::sync::Once;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static INIT: Once = Once::new();

/// Environment variable holding the log filter, e.g.
/// `FUSION_SYNC_LOG=fusion_sync_rs=debug,tower_http=warn`.
pub const LOG_ENV: &str = "FUSION_SYNC_LOG";

const DEFAULT_FILTER: &str = "fusion_sync_rs=info,tower_http=info";

/// Install the global tracing subscriber. Safe to call more than once.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(filter)
            .init();
    });
}
