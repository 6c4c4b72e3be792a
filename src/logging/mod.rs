use std::fmt::Debug;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("invalid log level `{level}`: `{reason}`")]
    InvalidLevel { level: String, reason: String },

    #[error("init logging error: `{0}`")]
    TryInitError(String),
}

pub struct Logging;

impl Logging {
    /// Sets the global subscriber, `level` accepts any `EnvFilter` directive such as
    /// `debug` or `info,pcluster_integ=trace`.
    pub fn try_init(level: &str) -> Result<(), LoggingError> {
        tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(env_filter(level)?)
            .try_init()
            .map_err(|_| {
                LoggingError::TryInitError(
                    "unable to set the global logging subscriber".to_string(),
                )
            })
    }
}

fn env_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    EnvFilter::try_new(level).map_err(|err| LoggingError::InvalidLevel {
        level: level.to_string(),
        reason: err.to_string(),
    })
}
