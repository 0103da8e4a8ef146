//! Error taxonomy for the request engine.
//!
//! Every remote failure surfaces as an [`Error`] value. Callers branch on the
//! variant to tell a retired user apart from a broken server or a reply that
//! could not be decoded. [`ErrorCategory`] groups errors into coarse buckets
//! used as log fields and Prometheus labels.

use std::fmt;

use reqwest::StatusCode;

/// Errors returned by the executor, the session and the API layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The session gave up earlier; no request was sent.
    #[error("already retired client")]
    AlreadyRetired,

    /// The session gave up during this call because the service was too slow.
    #[error("{0}")]
    ElapsedTimeOverRetire(String),

    /// Non-timeout transport failure (connection refused, reset, body read).
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    /// The service answered with a status the caller did not accept.
    #[error("{context} [status:{}, body:{body}]", .status.as_u16())]
    Status {
        context: String,
        status: StatusCode,
        body: String,
    },

    /// The service answered 200 but the body was not the expected JSON.
    #[error("{context} body decode failed: {source}")]
    Decode {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    /// The reply decoded but carried values that make no sense structurally.
    #[error("{0}")]
    Unexpected(String),

    #[error("url parse failed for '{path}': {source}")]
    InvalidUrl {
        path: String,
        #[source]
        source: url::ParseError,
    },

    /// The request could not be assembled.
    #[error("new request failed: {0}")]
    Request(#[source] reqwest::Error),
}

impl Error {
    /// True for both retirement variants.
    pub fn is_retirement(&self) -> bool {
        matches!(self, Error::AlreadyRetired | Error::ElapsedTimeOverRetire(_))
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::AlreadyRetired | Error::ElapsedTimeOverRetire(_) => ErrorCategory::Retired,
            Error::Transport(e) => ErrorCategory::from_reqwest_error(e),
            Error::Status { status, .. } => ErrorCategory::from_status_code(status.as_u16())
                .unwrap_or(ErrorCategory::OtherError),
            Error::Decode { .. } | Error::Unexpected(_) => ErrorCategory::DecodeError,
            Error::InvalidUrl { .. } | Error::Request(_) => ErrorCategory::OtherError,
        }
    }

    pub(crate) fn status(context: impl Into<String>, status: StatusCode, body: &[u8]) -> Self {
        Error::Status {
            context: context.into(),
            status,
            body: String::from_utf8_lossy(body).into_owned(),
        }
    }
}

/// Coarse categories of failures seen while driving load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// HTTP 4xx errors (client errors)
    ClientError,

    /// HTTP 5xx errors (server errors)
    ServerError,

    /// Network connectivity errors (DNS, connection refused, etc.)
    NetworkError,

    /// Request timeout errors
    TimeoutError,

    /// TLS/SSL certificate errors
    TlsError,

    /// The simulated user gave up
    Retired,

    /// Malformed response payloads
    DecodeError,

    /// Other/unknown errors
    OtherError,
}

impl ErrorCategory {
    /// Categorize an HTTP status code.
    ///
    /// Returns `None` for 2xx and 3xx.
    pub fn from_status_code(status_code: u16) -> Option<Self> {
        match status_code {
            200..=399 => None,
            400..=499 => Some(ErrorCategory::ClientError),
            500..=599 => Some(ErrorCategory::ServerError),
            _ => Some(ErrorCategory::OtherError),
        }
    }

    /// Categorize a reqwest error.
    pub fn from_reqwest_error(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            ErrorCategory::TimeoutError
        } else if error.is_connect() || error.is_request() || error.is_body() {
            ErrorCategory::NetworkError
        } else if error.is_decode() {
            ErrorCategory::DecodeError
        } else if error.is_redirect() {
            ErrorCategory::ClientError
        } else {
            let error_msg = error.to_string().to_lowercase();

            if error_msg.contains("certificate")
                || error_msg.contains("tls")
                || error_msg.contains("ssl")
            {
                ErrorCategory::TlsError
            } else if error_msg.contains("connect") || error_msg.contains("connection") {
                ErrorCategory::NetworkError
            } else {
                ErrorCategory::OtherError
            }
        }
    }

    /// Get the Prometheus label for this error category.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::ClientError => "client_error",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::NetworkError => "network_error",
            ErrorCategory::TimeoutError => "timeout_error",
            ErrorCategory::TlsError => "tls_error",
            ErrorCategory::Retired => "retired",
            ErrorCategory::DecodeError => "decode_error",
            ErrorCategory::OtherError => "other_error",
        }
    }

    /// Get a human-readable description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCategory::ClientError => "HTTP 4xx Client Errors",
            ErrorCategory::ServerError => "HTTP 5xx Server Errors",
            ErrorCategory::NetworkError => "Network/Connection Errors",
            ErrorCategory::TimeoutError => "Request Timeout Errors",
            ErrorCategory::TlsError => "TLS/SSL Certificate Errors",
            ErrorCategory::Retired => "Retired Users",
            ErrorCategory::DecodeError => "Malformed Response Bodies",
            ErrorCategory::OtherError => "Other/Unknown Errors",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}
