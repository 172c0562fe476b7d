pub mod sql_summary;

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

static TRACING: OnceLock<()> = OnceLock::new();

/// Install the tracing subscriber once per test binary.
///
/// Output goes through the libtest capture writer, so logs only show up
/// for failing tests (or under `--nocapture`). Raise the level with
/// `RUST_LOG`, e.g. `RUST_LOG=jobdag=debug cargo test`.
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_test_writer()
            .init();
    });
}
