use std::env;

use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "CHATSYNC_LOG";
const DEFAULT_FILTER: &str = "info,chatsync_demo=debug,chatsync_client=debug,chatsync_core=debug";

/// Install the global subscriber. `RUST_LOG` wins over `CHATSYNC_LOG`; blank
/// or unparseable values fall through to the built-in filter.
pub fn init() {
    let filter = resolve_filter(
        env::var(EnvFilter::DEFAULT_ENV).ok(),
        env::var(LOG_ENV).ok(),
    );
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_env_filter(filter)
        .try_init();
}

fn resolve_filter(rust_log: Option<String>, chatsync_log: Option<String>) -> EnvFilter {
    [rust_log, chatsync_log]
        .into_iter()
        .flatten()
        .filter(|directives| !directives.trim().is_empty())
        .find_map(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}
