//! Error taxonomy shared by the extractor, dispatcher, and HTTP surface.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Missing body, missing/unparseable boundary, or no file part found.
    #[error("malformed request: {message}")]
    MalformedRequest { message: String },

    /// The destination could not be reached, even after the fallback attempt.
    #[error("upstream unavailable (primary: {primary}; fallback: {fallback})")]
    UpstreamUnavailable { primary: String, fallback: String },

    /// The destination was reachable but returned an application error or an
    /// unparseable body. Never retried.
    #[error("upstream error ({status}): {detail}")]
    UpstreamError { status: u16, detail: String },

    /// A polling loop exhausted its attempt budget.
    #[error("processing timed out after {attempts} poll attempts")]
    ProcessingTimeout { attempts: u32 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn malformed(message: impl Into<String>) -> Self {
        Error::MalformedRequest {
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::MalformedRequest { .. } => StatusCode::BAD_REQUEST,
            Error::UpstreamUnavailable { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::UpstreamError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::ProcessingTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand back to the caller. Upstream bodies may echo
    /// request content, so they are only included in dev mode (see
    /// [`Error::detailed_message`]).
    pub fn user_message(&self) -> String {
        match self {
            Error::MalformedRequest { message } => message.clone(),
            Error::UpstreamUnavailable { .. } => {
                "document extraction service is unreachable".to_string()
            }
            Error::UpstreamError { status, .. } => {
                format!("document extraction service failed (status {status})")
            }
            Error::ProcessingTimeout { .. } => {
                "document processing timed out, please try again".to_string()
            }
            Error::Other(_) => "internal server error".to_string(),
        }
    }

    /// Full diagnostic text, for logs and for responses under the dev flag.
    pub fn detailed_message(&self) -> String {
        self.to_string()
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "status": "error",
            "message": self.user_message(),
        }));
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(
            Error::malformed("no boundary").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::UpstreamUnavailable {
                primary: "dns".into(),
                fallback: "refused".into()
            }
            .status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            Error::ProcessingTimeout { attempts: 60 }.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn user_message_hides_upstream_body() {
        let err = Error::UpstreamError {
            status: 422,
            detail: "secret-bearing body".into(),
        };
        assert!(!err.user_message().contains("secret-bearing"));
        assert!(err.detailed_message().contains("secret-bearing"));
    }
}
