//! Tracing subscriber setup for embedding applications.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log level for the ingestion pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    /// Debug output except for the per-packet network layer.
    Verbose,
    Debug,
    Trace,
}

impl LogLevel {
    /// Map a `-v` count onto a level, keeping `self` when zero.
    pub fn with_verbosity(self, count: u8) -> Self {
        match count {
            0 => self,
            1 => LogLevel::Verbose,
            2 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Filter directives used when `RUST_LOG` is not set.
    pub fn directives(self) -> &'static str {
        match self {
            LogLevel::Error => "avb_ingest=error",
            LogLevel::Warn => "avb_ingest=warn",
            LogLevel::Info => "avb_ingest=info",
            LogLevel::Verbose => "avb_ingest=debug,avb_ingest::net=info",
            LogLevel::Debug => "avb_ingest=debug",
            LogLevel::Trace => "avb_ingest=trace",
        }
    }
}

/// Install a global subscriber; `RUST_LOG` takes priority over `level`.
///
/// # Arguments
///
/// * `level` - default verbosity
/// * `json` - emit JSON lines instead of the human-readable format
pub fn init(level: LogLevel, json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| level.directives().into());

    let result = if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };

    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
