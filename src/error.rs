//! Error taxonomy shared by the capture, classification and storage layers.
//!
//! Callers branch on the variant: validation errors drop the capture, transient
//! errors go back to the retry queue, permanent errors fail the event at once,
//! and storage errors abandon the triggering operation.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Malformed capture or image. Dropped, never retried.
    #[error("[ERR_VALIDATION] {0}")]
    Validation(String),

    /// Network, timeout or rate limit from OCR or the classifier.
    #[error("[ERR_TRANSIENT] {0}")]
    TransientService(String),

    /// The classifier refused the input as unprocessable.
    #[error("[ERR_PERMANENT] {0}")]
    PermanentService(String),

    /// Transaction or write failure in the event store.
    #[error("[ERR_STORAGE] {0}")]
    Storage(String),

    #[error("[ERR_NOT_FOUND] {0}")]
    NotFound(String),
}

impl PipelineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientService(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::PermanentService(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientService(_))
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        // `{:#}` keeps the context chain on one line
        Self::Storage(format!("{err:#}"))
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(format!("database error: {err}"))
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(format!("io error: {err}"))
    }
}

/// Maps transport-level failures from the classification backend.
impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::transient("request timed out")
        } else if err.is_connect() {
            Self::transient("connection failed")
        } else if let Some(status) = err.status() {
            classify_http_status(status.as_u16(), &err.to_string())
        } else if err.is_decode() {
            Self::transient(format!("malformed response body: {err}"))
        } else {
            Self::transient(format!("request failed: {err}"))
        }
    }
}

/// Status codes the backend uses to say "never send this again" are permanent;
/// everything else is worth another attempt.
pub fn classify_http_status(status: u16, detail: &str) -> PipelineError {
    match status {
        400 | 413 | 415 | 422 => {
            PipelineError::permanent(format!("classifier rejected input ({status}): {detail}"))
        }
        _ => PipelineError::transient(format!("classifier returned {status}: {detail}")),
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_prefixes() {
        let err = PipelineError::validation("empty frame");
        assert_eq!(err.to_string(), "[ERR_VALIDATION] empty frame");

        let err = PipelineError::transient("timeout");
        assert_eq!(err.to_string(), "[ERR_TRANSIENT] timeout");
    }

    #[test]
    fn test_http_status_mapping() {
        assert!(classify_http_status(429, "slow down").is_transient());
        assert!(classify_http_status(503, "unavailable").is_transient());
        assert!(classify_http_status(401, "bad key").is_transient());
        assert!(matches!(
            classify_http_status(422, "bad image"),
            PipelineError::PermanentService(_)
        ));
        assert!(matches!(
            classify_http_status(413, "too large"),
            PipelineError::PermanentService(_)
        ));
    }

    #[test]
    fn test_anyhow_becomes_storage() {
        let err: PipelineError = anyhow::anyhow!("disk full").context("failed to insert").into();
        match err {
            PipelineError::Storage(msg) => {
                assert!(msg.contains("failed to insert"));
                assert!(msg.contains("disk full"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_sqlite_error_conversion() {
        let err: PipelineError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(err.to_string().contains("ERR_STORAGE"));
    }
}
