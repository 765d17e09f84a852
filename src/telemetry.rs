use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global tracing subscriber.
///
/// Filter comes from `RUST_LOG`, defaulting to `codegate=debug`. Calling it
/// again after a subscriber is installed has no effect.
pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "codegate=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
