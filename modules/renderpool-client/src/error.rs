use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RenderError>;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("render pool did not answer within {0:?}")]
    Timeout(Duration),

    #[error("render pool rejected the page (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("render pool transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl RenderError {
    /// Timeouts and transport faults may clear on a later attempt; a
    /// rejection for the same URL will not.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RenderError::Rejected { .. })
    }
}
