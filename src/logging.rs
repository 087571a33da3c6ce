use tracing_subscriber::{fmt, EnvFilter};

/// Install a global tracing subscriber driven by `RUST_LOG`, defaulting to
/// warnings plus this crate's info-level spans. Embedders that install their
/// own subscriber should skip this.
pub fn init() {
    init_with_filter("warn,colloquy=info");
}

pub fn init_with_filter(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    // try_init: a second subscriber (tests, embedder-owned) is not an error
    // worth surfacing.
    let _ = fmt().with_env_filter(filter).try_init();
}
