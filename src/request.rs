//! Incoming HTTP request type.
//!
//! One representation for every front-end: HTTP/1.1, HTTP/2 and HTTP/3
//! requests are all collected into a [`Request`] before dispatch.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use http::{HeaderMap, Uri, Version};

/// The wire protocol a request arrived on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Protocol {
    Http1,
    Http2,
    Http3,
}

impl Protocol {
    fn from_version(version: Version) -> Self {
        match version {
            Version::HTTP_2 => Self::Http2,
            Version::HTTP_3 => Self::Http3,
            _ => Self::Http1,
        }
    }
}

/// An incoming HTTP request with its body fully collected.
#[derive(Debug)]
pub struct Request {
    method: http::Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    pub(crate) params: HashMap<String, String>,
    pub(crate) remote_addr: Option<SocketAddr>,
    pub(crate) secure: bool,
}

impl Request {
    pub fn method(&self) -> &http::Method { &self.method }
    pub fn uri(&self) -> &Uri { &self.uri }
    pub fn path(&self) -> &str { self.uri.path() }
    pub fn query(&self) -> Option<&str> { self.uri.query() }
    pub fn version(&self) -> Version { self.version }
    pub fn protocol(&self) -> Protocol { Protocol::from_version(self.version) }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn body(&self) -> &[u8] { &self.body }
    pub fn remote_addr(&self) -> Option<SocketAddr> { self.remote_addr }

    /// `true` when the request arrived over TLS or QUIC.
    pub fn is_secure(&self) -> bool { self.secure || self.protocol() == Protocol::Http3 }

    /// Case-insensitive header lookup. Non-UTF-8 values read as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns a named path parameter.
    ///
    /// For a route `/users/{id}`, `req.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// The target host as sent by the client: the `Host` header for
    /// HTTP/1.1, the `:authority` pseudo-header (carried in the URI) for
    /// HTTP/2 and HTTP/3. May include a port.
    pub fn host(&self) -> Option<&str> {
        self.header("host")
            .or_else(|| self.uri.authority().map(|a| a.as_str()))
            .filter(|h| !h.is_empty())
    }

    /// Consumes the request, returning the collected body.
    pub fn into_body(self) -> Bytes { self.body }

    pub(crate) fn with_peer(mut self, addr: SocketAddr, secure: bool) -> Self {
        self.remote_addr = Some(addr);
        self.secure = secure;
        self
    }
}

impl From<http::Request<Bytes>> for Request {
    fn from(req: http::Request<Bytes>) -> Self {
        let (parts, body) = req.into_parts();
        Self {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            body,
            params: HashMap::new(),
            remote_addr: None,
            secure: false,
        }
    }
}
