use tracing_subscriber::EnvFilter;
use tracing_subscriber::FmtSubscriber;

/// `#[traced_test]` filters out events that do not come from the test crate
/// itself, which for integration tests is everything of interest. Call this at
/// the start of each test instead.
///
/// There can be only one global default subscriber, so the two cannot be
/// combined.
pub fn tracing_logger() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("circle_rendezvous=debug"));
    let subscriber = FmtSubscriber::builder()
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .with_env_filter(env_filter)
        .with_thread_ids(true)
        .finish();

    // Fails if another test in this process already set it; that is fine.
    let _result = tracing::subscriber::set_global_default(subscriber);
}
