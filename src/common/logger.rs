use crate::configs::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` wins over the config file.
pub fn init(config: Option<&LoggingConfig>) {
    let level = config.and_then(|l| l.level.as_deref()).unwrap_or("info");
    let filters = config.and_then(|l| l.filters.as_deref()).unwrap_or("");

    let directives = if filters.is_empty() {
        level.to_string()
    } else {
        format!("{},{}", level, filters)
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        // The worker thread name (pcm-mix / pcm-snoop) tells which PCM side
        // a line came from.
        .with_thread_names(true)
        .init();
}
