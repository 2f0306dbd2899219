use anyhow::anyhow;
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt,
    EnvFilter,
};

use crate::conf;

/// `RUST_LOG`, when set, takes precedence over the configured level.
pub fn init() -> anyhow::Result<()> {
    let level = conf::global().log_level;
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();
    let layer_stderr = fmt::Layer::new()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_file(false)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false);
    tracing_subscriber::registry()
        .with(filter)
        .with(layer_stderr)
        .try_init()
        .map_err(|error| anyhow!("Failed to init tracing: {error}"))?;
    Ok(())
}
