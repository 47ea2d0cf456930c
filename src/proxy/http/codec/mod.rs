mod headers;
mod request;
mod response;

use http::StatusCode;
use thiserror::Error;

pub use headers::Http1HeaderLine;
pub use request::{Http1RequestHead, is_request_head_complete, parse_request};
pub use response::{canned_response, is_status_line_received, parse_status_code};

/// Reasons a client request head is refused before any upstream work starts.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("request head exceeds configured limit of {limit} bytes")]
    TooLarge { limit: usize },
    #[error("unsupported request: {0}")]
    Unsupported(String),
}

impl ParseError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed(reason.into())
    }

    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::Unsupported(reason.into())
    }

    /// Status sent back to the client for this rejection.
    pub fn status(&self) -> StatusCode {
        match self {
            ParseError::Malformed(_) => StatusCode::BAD_REQUEST,
            ParseError::TooLarge { .. } => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            ParseError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
        }
    }
}
