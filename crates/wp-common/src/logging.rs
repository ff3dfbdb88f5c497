//! Tracing subscriber setup shared by binaries and integration tests.

use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber honouring `RUST_LOG`, defaulting to INFO.
///
/// `json` switches to the JSON formatter for log shipping. Calling this more
/// than once is harmless: later calls leave the first subscriber in place.
pub fn init(json: bool) {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    let result = if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

/// Test-friendly variant writing through the test harness capture.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
