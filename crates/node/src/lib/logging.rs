//! Log output for the node binary and its test suites.

use std::str::FromStr;

use tracing_subscriber::{
    fmt, layer::Layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::config::NodeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "plain" | "text" => Ok(LogFormat::Plain),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other:?}")),
        }
    }
}

/// Directives used when `RUST_LOG` is unset: our crates at info, the
/// noisier internals of the storage and HTTP layers at warn.
fn default_filter() -> EnvFilter {
    EnvFilter::new("info")
        .add_directive("rocksdb=warn".parse().expect("static directive"))
        .add_directive("hyper=warn".parse().expect("static directive"))
}

/// Install the global subscriber as the node configuration asks. Repeat
/// calls (other suites in the same process) leave the first winner in
/// place.
pub fn init_logging(config: &NodeConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter());
    let format = match config.log_format {
        LogFormat::Json => json_subscriber::layer()
            .with_target(true)
            .with_thread_names(config.log_thread_names)
            .flatten_event(true)
            .boxed(),
        LogFormat::Plain => fmt::layer()
            .compact()
            .with_target(true)
            .with_thread_names(config.log_thread_names)
            .boxed(),
    };
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(format)
        .try_init();
}

/// Captured-output subscriber for tests.
pub fn init_test_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("debug"))
        .with(fmt::layer().compact().with_test_writer())
        .try_init();
}
