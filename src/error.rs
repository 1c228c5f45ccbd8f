//! Unified error type.
//!
//! Three families of failure flow through [`Error`]:
//!
//! - **setup** errors (bad transport combination, unresolvable plugin,
//!   malformed TLS material) are returned from constructors and are fatal;
//! - **mutation** errors (status outside 100–999, malformed cookie, header or
//!   media type) are returned by the offending [`Context`](crate::Context)
//!   setter;
//! - **handler** errors travel up the pipeline to
//!   [`Context::on_error`](crate::Context::on_error), which turns them into a
//!   response.

use std::fmt;

use http::StatusCode;

/// Boxed error used for foreign body and stream failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type returned by wharf's fallible operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("module not found: {specifier} (searched {})", .searched.join(", "))]
    ModuleNotFound { specifier: String, searched: Vec<String> },

    #[error("invalid plugin `{name}`: {reason}")]
    InvalidPlugin { name: String, reason: String },

    #[error("invalid status code: {0}")]
    InvalidStatus(u16),

    #[error("invalid cookie {field}: {value:?}")]
    InvalidCookie { field: &'static str, value: String },

    #[error("invalid media type: {0:?}")]
    InvalidMediaType(String),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),

    #[error("hyper: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("body: {0}")]
    Body(#[source] BoxError),

    #[error("connection: {0}")]
    Connection(#[source] BoxError),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("next() called multiple times")]
    NextCalledTwice,

    #[error("middleware panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Http(#[from] HttpError),
}

impl Error {
    /// Status code a response should carry for this error.
    ///
    /// [`HttpError`]s carry their own status; a missing file maps to 404;
    /// everything else is a 500.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Http(e) => e.status,
            Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the message may be shown to the client.
    pub fn expose(&self) -> bool {
        match self {
            Self::Http(e) => e.expose,
            _ => false,
        }
    }

    pub(crate) fn panicked(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_owned());
        Self::Panicked(msg)
    }
}

/// An error that maps directly onto an HTTP response.
///
/// `expose` decides whether `message` reaches the client; by default only
/// client errors (`status < 500`) are exposed. A status below 400 is not an
/// error status and becomes an unexposed 500.
#[derive(Debug, Clone)]
pub struct HttpError {
    status: StatusCode,
    message: String,
    expose: bool,
}

impl HttpError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        if status.as_u16() < 400 {
            return Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: message.into(),
                expose: false,
            };
        }
        Self {
            status,
            message: message.into(),
            expose: status.as_u16() < 500,
        }
    }

    /// Error with the canonical reason phrase as its message.
    pub fn from_status(status: StatusCode) -> Self {
        Self::new(status, status.canonical_reason().unwrap_or("Unknown"))
    }

    pub fn with_expose(mut self, expose: bool) -> Self {
        self.expose = expose;
        self
    }

    pub fn status(&self) -> StatusCode { self.status }
    pub fn message(&self) -> &str { &self.message }
    pub fn is_exposed(&self) -> bool { self.expose }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HttpError {}
