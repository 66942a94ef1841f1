//! Logging setup.
//!
//! `DOLTKEEPER_LOG` takes an `EnvFilter` directive (default `info`).
//! `DOLTKEEPER_LOG_FORMAT=json` switches to one JSON object per line.
//! Everything goes to stderr so stdout stays parseable.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

pub const LOG_ENV: &str = "DOLTKEEPER_LOG";
pub const FORMAT_ENV: &str = "DOLTKEEPER_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn from_env_value(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Text,
        }
    }
}

/// Held for the life of `main`.
#[must_use]
pub struct TelemetryGuard {
    pub format: LogFormat,
}

pub fn init() -> TelemetryGuard {
    let format = LogFormat::from_env_value(std::env::var(FORMAT_ENV).ok().as_deref());
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .with_env_var(LOG_ENV)
        .from_env_lossy();

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed(),
    };

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init();

    TelemetryGuard { format }
}
