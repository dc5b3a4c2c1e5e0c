use thiserror::Error;

/// Failure of an outbound HTTP call. Owners log these and move on.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("http error: {0}")]
    Http(reqwest::Error),
    #[error("unexpected status: {0}")]
    Status(reqwest::StatusCode),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if let Some(status) = e.status() {
            TransportError::Status(status)
        } else if e.is_decode() {
            TransportError::Malformed(e.to_string())
        } else {
            TransportError::Http(e)
        }
    }
}
