use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[clap(rename_all = "UPPER")]
#[serde(rename_all = "UPPERCASE")]
pub enum LevelFilter {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LevelFilter {
    fn into_tracing(self) -> tracing::level_filters::LevelFilter {
        match self {
            Self::Off => tracing::level_filters::LevelFilter::OFF,
            Self::Error => tracing::level_filters::LevelFilter::ERROR,
            Self::Warn => tracing::level_filters::LevelFilter::WARN,
            Self::Info => tracing::level_filters::LevelFilter::INFO,
            Self::Debug => tracing::level_filters::LevelFilter::DEBUG,
            Self::Trace => tracing::level_filters::LevelFilter::TRACE,
        }
    }
}

fn env_filter(default: Option<LevelFilter>) -> EnvFilter {
    match default {
        Some(filter) => {
            // We have a default (from config or command argument), ignore RUST_LOG.
            EnvFilter::builder()
                .with_default_directive(filter.into_tracing().into())
                .parse_lossy("")
        }
        None => {
            // No default, use RUST_LOG or fall back to WARN.
            EnvFilter::builder()
                .with_default_directive(tracing::level_filters::LevelFilter::WARN.into())
                .from_env_lossy()
        }
    }
}

/// Configures tracing and sets up the logging facility.
///
/// Log messages go to stderr; stdout carries the RTT data.
pub fn setup_logging(default: Option<LevelFilter>) {
    let stderr_subscriber = tracing_subscriber::fmt::layer()
        .compact()
        .without_time()
        .with_writer(std::io::stderr)
        .with_filter(env_filter(default));

    tracing_subscriber::registry()
        .with(stderr_subscriber)
        .init();
}
