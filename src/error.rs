use thiserror::Error;

use crate::provider::ProviderError;

pub type NarratorResult<T> = Result<T, NarratorError>;

#[derive(Debug, Error)]
pub enum NarratorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Detection error: {0}")]
    Detection(#[from] DetectionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NarratorError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Replay record on line {line} is invalid: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Captured frame is empty")]
    EmptyFrame,

    #[error("Detection source has no more frames")]
    Exhausted,

    #[error("Detector backend failed: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
