use std::path::PathBuf;

use axum::http::StatusCode;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Parse(String),

    #[error("remote fetch failed: {0}")]
    Fetch(String),

    #[error("remote source returned status {status}: {message}")]
    FetchStatus { status: u16, message: String },

    #[error("ledger chain broken at block {index}")]
    #[diagnostic(help("the stored ledger no longer matches its hash chain; restore it from a trusted copy"))]
    ChainIntegrity { index: u64 },

    #[error("{0} not found")]
    NotFound(String),

    #[error("payload too large: {0}")]
    TooLarge(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),
}

impl PipelineError {
    pub fn storage(err: impl std::fmt::Display) -> Self {
        PipelineError::Storage(err.to_string())
    }

    /// HTTP status for this error: 4xx when the request itself is at fault,
    /// 502 when the remote source failed, 500 otherwise.
    pub const fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::Validation(_) | PipelineError::Parse(_) => StatusCode::BAD_REQUEST,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            PipelineError::Fetch(_) | PipelineError::FetchStatus { .. } => StatusCode::BAD_GATEWAY,
            PipelineError::ChainIntegrity { .. }
            | PipelineError::Storage(_)
            | PipelineError::Server(_)
            | PipelineError::ConfigRead(_)
            | PipelineError::ConfigParse(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_names_the_file() {
        let err = PipelineError::NotFound("a.fasta".to_string());
        assert_eq!(err.to_string(), "a.fasta not found");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert!(err.is_client_error());
    }

    #[test]
    fn storage_is_server_side() {
        let err = PipelineError::storage("disk full");
        assert_eq!(err.to_string(), "storage error: disk full");
        assert!(!err.is_client_error());
    }

    #[test]
    fn upstream_failures_are_bad_gateway() {
        let err = PipelineError::FetchStatus {
            status: 404,
            message: "gone".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }
}
