use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Domain error taxonomy for the simulation core.
///
/// HTTP handlers and CLI commands match on these variants to decide status
/// codes and user-facing messages; infrastructure failures that don't belong
/// to this taxonomy flow through `anyhow` instead.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("position out of range: {0}")]
    OutOfRange(String),

    #[error("weather cycle {cycle} model {model} is not available yet: {reason}")]
    WeatherUnavailable {
        cycle: String,
        model: u32,
        reason: String,
    },

    #[error("downloaded archive {0} failed validation")]
    CorruptedArchive(String),

    #[error("download stalled: no data received for {0}s")]
    DownloadStalled(u64),

    #[error("simulator for model {0} was torn down mid-use")]
    RaceWithCleanup(u32),

    #[error("http error {status}: {message}")]
    Http { status: u16, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl CoreError {
    pub fn other(msg: impl ToString) -> Self {
        CoreError::Other(msg.to_string())
    }

    /// Whether this error should be reported to the caller as "model file not
    /// available" (HTTP 404) rather than a hard failure.
    pub fn is_weather_unavailable(&self) -> bool {
        matches!(self, CoreError::WeatherUnavailable { .. })
    }
}
