//! Error types.
//!
//! Three families, one per layer:
//!
//! - [`Error`]: infrastructure failures such as a port that will not bind or unreadable TLS
//!   material. Returned from [`Server`](crate::Server).
//! - [`RegistryError`]: rejected tenant/host registrations. Returned
//!   synchronously from [`TenantRegistry`](crate::TenantRegistry) and never
//!   surfaced mid-request.
//! - [`HandlerError`]: anything a middleware or handler returns through the
//!   chain. It carries the [`Status`] the dispatcher falls back to when no
//!   middleware translates it.

use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;
use crate::response::{IntoResponse, Response};
use crate::status::Status;

/// Boxed, thread-safe error used as the source of a [`HandlerError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

// ── Infrastructure ────────────────────────────────────────────────────────────

/// The error type returned by portico's server-level operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls: {0}")]
    Tls(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("quic: {0}")]
    Quic(String),
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Self::Tls(e.to_string())
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// A rejected [`TenantRegistry`](crate::TenantRegistry) mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("host `{host}` is already registered to tenant `{tenant}`")]
    DuplicateHost { host: String, tenant: String },

    #[error("tenant `{0}` is not registered")]
    UnknownTenant(String),

    #[error("tenant id must not be empty")]
    InvalidTenantId,

    #[error("invalid hostname `{0}`")]
    InvalidHostname(String),
}

// ── Chain errors ──────────────────────────────────────────────────────────────

/// What a [`HandlerError`] represents to the dispatcher.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// No route matched the request path.
    RouteNotFound,
    /// A route matched the path but not the method.
    MethodNotAllowed,
    /// The request required a tenant and none was resolved from its host.
    TenantUnresolved,
    /// A handler panicked.
    Panic,
    /// The request exceeded its deadline or was cancelled.
    Timeout,
    /// Any other middleware or handler failure.
    Aborted,
}

/// An error travelling back up a middleware chain.
///
/// Middleware return it to abort forward progress; every enclosing `next`
/// hands it back unchanged until a middleware translates it or the
/// dispatcher renders it as a response of [`status`](HandlerError::status).
///
/// Any `std::error::Error` converts into a `500` via `?`:
///
/// ```rust
/// use portico::{Context, HandlerError, Response};
///
/// async fn parse(ctx: Context) -> Result<Response, HandlerError> {
///     let n: u32 = std::str::from_utf8(ctx.request().body())?.trim().parse()?;
///     Ok(Response::text(format!("{}", n * 2)))
/// }
/// ```
pub struct HandlerError {
    status: Status,
    kind: ErrorKind,
    message: String,
    headers: Vec<(String, String)>,
    source: Option<BoxError>,
}

impl HandlerError {
    /// An error that renders as `status` with `message` as its body.
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            kind: ErrorKind::Aborted,
            message: message.into(),
            headers: Vec::new(),
            source: None,
        }
    }

    /// An error with the status's reason phrase as its message.
    pub fn status(status: Status) -> Self {
        Self::new(status, status.reason())
    }

    /// A `500` wrapping `source`.
    pub fn internal(source: impl Into<BoxError>) -> Self {
        let source = source.into();
        Self {
            status: Status::InternalServerError,
            kind: ErrorKind::Aborted,
            message: source.to_string(),
            headers: Vec::new(),
            source: Some(source),
        }
    }

    pub(crate) fn route_not_found() -> Self {
        Self::status(Status::NotFound).with_kind(ErrorKind::RouteNotFound)
    }

    pub(crate) fn method_not_allowed(allow: &str) -> Self {
        Self::status(Status::MethodNotAllowed)
            .with_kind(ErrorKind::MethodNotAllowed)
            .with_header("allow", allow)
    }

    pub(crate) fn panicked(message: String) -> Self {
        Self::new(Status::InternalServerError, message).with_kind(ErrorKind::Panic)
    }

    pub(crate) fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    /// Adds a header to the response this error renders as.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn status_code(&self) -> Status { self.status }
    pub fn kind(&self) -> ErrorKind { self.kind }
    pub fn message(&self) -> &str { &self.message }

    pub fn source(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.source.as_deref()
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerError")
            .field("status", &self.status.code())
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("source", &self.source)
            .finish()
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status.code(), self.message)
    }
}

/// `?` on any standard error inside a handler or middleware yields a `500`.
///
/// `HandlerError` itself deliberately does not implement `std::error::Error`,
/// otherwise this impl would overlap with `From<T> for T`.
impl<E> From<E> for HandlerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(e: E) -> Self {
        Self::internal(e)
    }
}

/// Fallback rendering used by the dispatcher when no middleware translated
/// the error. Server faults never echo their message to the client.
impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        let body = if self.status.is_server_error() {
            self.status.reason().to_owned()
        } else {
            self.message
        };
        let mut builder = Response::builder().status(self.status);
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        builder.text(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn std_errors_become_internal() {
        let err: HandlerError = "x".parse::<u32>().unwrap_err().into();
        assert_eq!(err.status_code(), Status::InternalServerError);
        assert_eq!(err.kind(), ErrorKind::Aborted);
        assert!(err.source().is_some());
    }

    #[test]
    fn server_faults_hide_their_message() {
        let res = HandlerError::new(Status::InternalServerError, "db password wrong").into_response();
        assert_eq!(res.status_code(), 500);
        assert_eq!(res.body(), b"Internal Server Error");
    }

    #[test]
    fn client_errors_keep_message_and_headers() {
        let res = HandlerError::method_not_allowed("GET, POST").into_response();
        assert_eq!(res.status_code(), 405);
        assert_eq!(res.header("allow"), Some("GET, POST"));
        assert_eq!(res.body(), b"Method Not Allowed");
    }
}
