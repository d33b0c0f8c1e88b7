use once_cell::sync::Lazy;
use tracing_subscriber::EnvFilter;

mod buffer_scenarios;
mod topology_scenarios;

static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
});

pub(crate) fn init_tracing() {
    Lazy::force(&TRACING);
}
