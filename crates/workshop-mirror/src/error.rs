//! Error taxonomy shared by the pipeline, the proxy and the HTTP layer.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// All errors that can surface from a mirror request.
#[derive(thiserror::Error, Debug)]
pub enum MirrorError {
    /// A path parameter was not a valid numeric identifier.
    #[error("invalid {field}: {value:?}")]
    Validation { field: &'static str, value: String },

    /// Title or manifest lookup against the upstream site failed.
    #[error("could not resolve {subject}: {reason}")]
    Resolution { subject: String, reason: String },

    /// The acquisition tool gave up, or too many collection children failed.
    #[error("acquisition failed for {subject}: {reason}")]
    Acquisition { subject: String, reason: String },

    /// Walking the content directory or writing the archive failed.
    #[error("archive build failed: {0}")]
    Archival(#[from] std::io::Error),

    /// An upstream HTML body could not be parsed or serialized.
    #[error("rewrite failed: {0}")]
    Rewrite(String),

    /// The upstream site could not be reached.
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

pub type MirrorResult<T> = Result<T, MirrorError>;

impl MirrorError {
    pub fn resolution(subject: impl Into<String>, reason: impl ToString) -> Self {
        MirrorError::Resolution {
            subject: subject.into(),
            reason: reason.to_string(),
        }
    }

    pub fn acquisition(subject: impl Into<String>, reason: impl ToString) -> Self {
        MirrorError::Acquisition {
            subject: subject.into(),
            reason: reason.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            MirrorError::Validation { .. } => StatusCode::BAD_REQUEST,
            MirrorError::Resolution { .. } => StatusCode::NOT_FOUND,
            MirrorError::Acquisition { .. }
            | MirrorError::Archival(_)
            | MirrorError::Rewrite(_) => StatusCode::INTERNAL_SERVER_ERROR,
            MirrorError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Message shown to the client. Never includes local paths.
    pub fn public_message(&self) -> String {
        match self {
            MirrorError::Validation { field, .. } => format!("Invalid {field}."),
            MirrorError::Resolution { subject, .. } => format!("Could not find {subject}."),
            MirrorError::Acquisition { subject, .. } => format!("Failed to download {subject}."),
            MirrorError::Archival(_) => "Failed to create zip archive.".to_string(),
            MirrorError::Rewrite(_) => "Failed to process upstream page.".to_string(),
            MirrorError::Upstream(_) => "Upstream site is unavailable.".to_string(),
        }
    }
}

impl IntoResponse for MirrorError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        (status, self.public_message()).into_response()
    }
}
