//! Per-request context.
//!
//! A [`Context`] is created by the dispatcher for every request and moved
//! down the middleware chain into the handler. It carries:
//!
//! - the [`Request`],
//! - the tenant resolved from the request's host (`None` when unresolved),
//! - a string-keyed, request-scoped state map,
//! - a response-header overlay merged into whatever response the chain
//!   produces, error responses included,
//! - the cancellation signal of the underlying connection or stream.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::request::Request;
use crate::response::Response;
use crate::tenant::TenantId;

type HeaderOverlay = Arc<Mutex<Vec<(String, String)>>>;

/// Request-scoped data handed to every middleware and the handler.
pub struct Context {
    request: Request,
    tenant: Option<TenantId>,
    tenant_config: Option<Arc<serde_json::Value>>,
    state: HashMap<String, Box<dyn Any + Send + Sync>>,
    extensions: http::Extensions,
    response_headers: HeaderOverlay,
    cancel: CancellationToken,
}

impl Context {
    /// A context with no tenant, empty state and a fresh cancellation token.
    pub fn new(request: Request) -> Self {
        Self {
            request,
            tenant: None,
            tenant_config: None,
            state: HashMap::new(),
            extensions: http::Extensions::new(),
            response_headers: Arc::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn with_tenant(mut self, tenant: TenantId, config: Arc<serde_json::Value>) -> Self {
        self.tenant = Some(tenant);
        self.tenant_config = Some(config);
        self
    }

    /// Replaces the cancellation token, typically with one owned by a front-end.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub(crate) fn header_overlay(&self) -> HeaderOverlay {
        Arc::clone(&self.response_headers)
    }

    pub fn request(&self) -> &Request { &self.request }
    pub fn request_mut(&mut self) -> &mut Request { &mut self.request }

    /// Shortcut for `ctx.request().param(key)`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.request.param(key)
    }

    /// The tenant resolved from the request host, if any.
    pub fn tenant_id(&self) -> Option<&TenantId> {
        self.tenant.as_ref()
    }

    /// The resolved tenant's configuration blob.
    pub fn tenant_config(&self) -> Option<&serde_json::Value> {
        self.tenant_config.as_deref()
    }

    // ── State ─────────────────────────────────────────────────────────────────

    /// Stores `value` under `key`, returning the previous value if it had
    /// the same type.
    pub fn set<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) -> Option<T> {
        self.state
            .insert(key.into(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    /// Reads `key` as a `T`. A value stored with a different type reads as absent.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.state.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.state.get_mut(key).and_then(|v| v.downcast_mut::<T>())
    }

    pub fn remove<T: Any>(&mut self, key: &str) -> Option<T> {
        let boxed = self.state.remove(key)?;
        match boxed.downcast::<T>() {
            Ok(v) => Some(*v),
            Err(other) => {
                // Wrong type: put it back untouched.
                self.state.insert(key.to_owned(), other);
                None
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.contains_key(key)
    }

    /// Stores a value keyed by its type, returning the previous one.
    pub fn insert<T: Clone + Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.extensions.insert(value)
    }

    /// The value of type `T` stored with [`insert`](Context::insert).
    pub fn extension<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions.get::<T>()
    }

    pub fn extension_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.extensions.get_mut::<T>()
    }

    // ── Response overlay ──────────────────────────────────────────────────────

    /// Adds a header to the eventual response, whatever produces it.
    ///
    /// Headers already present on the response win.
    pub fn set_response_header(&self, name: &str, value: &str) {
        self.response_headers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.to_owned(), value.to_owned()));
    }

    // ── Cancellation ──────────────────────────────────────────────────────────

    /// `true` once the client went away or the request deadline passed.
    /// Stays `true` for every later check.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the request is cancelled. Use it in `tokio::select!`
    /// around long-running work.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("method", self.request.method())
            .field("path", &self.request.path())
            .field("tenant", &self.tenant)
            .field("state_keys", &self.state.keys().collect::<Vec<_>>())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Merges overlay headers into `res`, skipping names the response already set.
pub(crate) fn apply_overlay(overlay: &HeaderOverlay, res: &mut Response) {
    let headers = std::mem::take(&mut *overlay.lock().unwrap_or_else(PoisonError::into_inner));
    for (name, value) in headers {
        if res.header(&name).is_none() {
            res.append_header(&name, &value);
        }
    }
}
