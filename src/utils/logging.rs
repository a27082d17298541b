use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the diagnostic filter, e.g. `arena_chat=debug`.
pub const LOG_ENV: &str = "ARENA_CHAT_LOG";

/// Installs the global subscriber. Diagnostics go to stderr so command
/// output on stdout stays clean.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    // A second initialization (e.g. from an embedding program) is harmless.
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .try_init();
}
