//! Request dispatch: the single entry point shared by every front-end.
//!
//! ```text
//! Request ──► resolve tenant (Host / :authority)
//!         ──► route lookup (matched / 405 / 404 chain)
//!         ──► Context
//!         ──► chain on its own task ──► Response (+ header overlay)
//! ```
//!
//! Every failure mode becomes a response here, so front-ends never see an
//! error: chain errors render through [`IntoResponse`], a panicking handler
//! becomes `500` without taking the connection down, and an expired request
//! deadline becomes `503`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::context::{Context, apply_overlay};
use crate::error::{ErrorKind, HandlerError};
use crate::middleware::panic_message;
use crate::request::Request;
use crate::response::{IntoResponse, Response};
use crate::router::{Lookup, RouteTable, Router};
use crate::status::Status;
use crate::tenant::TenantRegistry;

/// Routes requests through the composed chains. Cheap to clone; clones
/// share the route table and the registry.
#[derive(Clone)]
pub struct Dispatcher {
    routes: Arc<RouteTable>,
    registry: Arc<TenantRegistry>,
    request_timeout: Option<Duration>,
}

impl Dispatcher {
    /// Composes every chain of `router`. The registry stays shared: tenants
    /// registered through it after this call are visible to the next request.
    pub fn new(router: Router, registry: Arc<TenantRegistry>) -> Self {
        Self {
            routes: Arc::new(router.build()),
            registry,
            request_timeout: None,
        }
    }

    /// Bounds the whole chain of every request. `None` disables the bound.
    pub fn with_request_timeout(mut self, limit: Option<Duration>) -> Self {
        self.request_timeout = limit;
        self
    }

    pub fn registry(&self) -> &Arc<TenantRegistry> {
        &self.registry
    }

    /// Runs `req` through its chain and produces the response to send.
    ///
    /// `cancel` is the request's cancellation signal; the front-end cancels
    /// it when the client goes away. It is also cancelled if this future is
    /// dropped before completion, or when the request deadline passes.
    pub async fn dispatch(&self, mut req: Request, cancel: CancellationToken) -> Response {
        let resolved = req.host().and_then(|host| self.registry.resolve(host));

        let chain = match self.routes.lookup(req.method(), req.path()) {
            Lookup::Matched { chain, params } => {
                req.params = params;
                chain.clone()
            }
            Lookup::MethodNotAllowed { chain } | Lookup::NotFound { chain } => {
                req.params = HashMap::new();
                chain.clone()
            }
        };

        debug!(
            method = %req.method(),
            path = %req.path(),
            tenant = resolved.as_ref().map(|(id, _)| id.as_str()).unwrap_or("-"),
            "dispatching"
        );

        let path = req.path().to_owned();
        let mut ctx = Context::new(req).with_cancellation(cancel.clone());
        if let Some((tenant, config)) = resolved {
            ctx = ctx.with_tenant(tenant, config);
        }
        let overlay = ctx.header_overlay();

        let guard = cancel.clone().drop_guard();
        let mut task = tokio::spawn(chain.run(ctx));

        let joined = match self.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    cancel.cancel();
                    task.abort();
                    warn!(path = %path, limit_ms = limit.as_millis() as u64, "request deadline exceeded");
                    Ok(Err(HandlerError::new(Status::ServiceUnavailable, "request timed out")
                        .with_kind(ErrorKind::Timeout)))
                }
            },
            None => task.await,
        };
        guard.disarm();

        let result = joined.unwrap_or_else(|e| {
            if e.is_panic() {
                let message = panic_message(e.into_panic().as_ref());
                error!(path = %path, panic = %message, "handler panicked");
                Err(HandlerError::panicked(message))
            } else {
                Err(HandlerError::new(Status::ServiceUnavailable, "request aborted"))
            }
        });

        let mut res = result.unwrap_or_else(IntoResponse::into_response);
        apply_overlay(&overlay, &mut res);
        res
    }
}

impl From<Router> for Dispatcher {
    /// A dispatcher with an empty registry: every request runs tenant-less.
    fn from(router: Router) -> Self {
        Self::new(router, Arc::new(TenantRegistry::new()))
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("tenants", &self.registry.tenants().len())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::handler::HandlerResult;
    use crate::middleware::{self, Next};
    use crate::router::Stack;

    fn request(method: &str, host: &str, path: &str) -> Request {
        http::Request::builder()
            .method(method)
            .uri(path)
            .header("host", host)
            .body(Bytes::new())
            .unwrap()
            .into()
    }

    async fn data(ctx: Context) -> Response {
        Response::text(format!("tenant={}", ctx.tenant_id().map(|t| t.as_str()).unwrap_or("none")))
    }

    fn registry() -> Arc<TenantRegistry> {
        let registry = TenantRegistry::new();
        registry.register_tenant("t1", ["a.example.com"]).unwrap();
        registry.register_tenant("t2", ["b.example.com"]).unwrap();
        Arc::new(registry)
    }

    #[tokio::test]
    async fn tenants_are_resolved_per_host() {
        let d = Dispatcher::new(Router::new().get("/api/data", data), registry());

        let a = d.dispatch(request("GET", "a.example.com", "/api/data"), CancellationToken::new()).await;
        let b = d.dispatch(request("GET", "B.EXAMPLE.COM:8443", "/api/data"), CancellationToken::new()).await;
        let c = d.dispatch(request("GET", "c.example.com", "/api/data"), CancellationToken::new()).await;
        assert_eq!(a.body(), b"tenant=t1");
        assert_eq!(b.body(), b"tenant=t2");
        assert_eq!(c.body(), b"tenant=none");
    }

    #[tokio::test]
    async fn unauthorized_admin_request_never_reaches_handler() {
        async fn auth(ctx: Context, next: Next) -> HandlerResult {
            if ctx.request().header("authorization").is_none() {
                return Err(HandlerError::status(Status::Unauthorized));
            }
            next.run(ctx).await
        }
        async fn purge(_ctx: Context) -> Response {
            panic!("must not run")
        }

        let router = Router::new().group("/admin", |g| g.layer(auth).post("/purge", purge));
        let d = Dispatcher::new(router, registry());
        let res = d.dispatch(request("POST", "a.example.com", "/admin/purge"), CancellationToken::new()).await;
        assert_eq!(res.status_code(), 401);
    }

    #[tokio::test]
    async fn panics_become_500_and_server_keeps_going() {
        async fn boom(_ctx: Context) -> Response {
            panic!("kaboom")
        }
        let d = Dispatcher::from(Router::new().get("/boom", boom).get("/ok", data));

        let res = d.dispatch(request("GET", "x", "/boom"), CancellationToken::new()).await;
        assert_eq!(res.status_code(), 500);
        assert_eq!(res.body(), b"Internal Server Error");

        let res = d.dispatch(request("GET", "x", "/ok"), CancellationToken::new()).await;
        assert_eq!(res.status_code(), 200);
    }

    #[tokio::test]
    async fn unmatched_requests_run_global_middleware() {
        let d = Dispatcher::from(
            Router::new()
                .layer(middleware::request_id())
                .post("/items", data),
        );

        let res = d.dispatch(request("GET", "x", "/missing"), CancellationToken::new()).await;
        assert_eq!(res.status_code(), 404);
        assert!(res.header("x-request-id").is_some());

        let res = d.dispatch(request("DELETE", "x", "/items"), CancellationToken::new()).await;
        assert_eq!(res.status_code(), 405);
        assert_eq!(res.header("allow"), Some("POST"));
        assert!(res.header("x-request-id").is_some());
    }

    #[tokio::test]
    async fn head_falls_back_to_get() {
        let d = Dispatcher::from(Router::new().get("/x", data));
        let res = d.dispatch(request("HEAD", "x", "/x"), CancellationToken::new()).await;
        assert_eq!(res.status_code(), 200);
    }

    #[tokio::test]
    async fn route_middleware_runs_after_group_middleware() {
        async fn tag_outer(mut ctx: Context, next: Next) -> HandlerResult {
            ctx.set("trail", String::from("outer"));
            next.run(ctx).await
        }
        async fn tag_route(mut ctx: Context, next: Next) -> HandlerResult {
            if let Some(t) = ctx.get_mut::<String>("trail") {
                t.push_str(">route");
            }
            next.run(ctx).await
        }
        async fn show(ctx: Context) -> Response {
            Response::text(ctx.get::<String>("trail").cloned().unwrap_or_default())
        }

        let router = Router::new().group("/g", |g| {
            g.layer(tag_outer).on_with(crate::Method::Get, "/r", Stack::new().push(tag_route), show)
        });
        let d = Dispatcher::from(router);
        let res = d.dispatch(request("GET", "x", "/g/r"), CancellationToken::new()).await;
        assert_eq!(res.body(), b"outer>route");
    }

    #[tokio::test(start_paused = true)]
    async fn request_deadline_cancels_and_returns_503() {
        async fn slow(ctx: Context) -> Response {
            ctx.cancelled().await;
            Response::text("late")
        }
        let d = Dispatcher::from(Router::new().get("/slow", slow))
            .with_request_timeout(Some(Duration::from_secs(1)));
        let token = CancellationToken::new();
        let res = d.dispatch(request("GET", "x", "/slow"), token.clone()).await;
        assert_eq!(res.status_code(), 503);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn registry_changes_apply_to_next_request() {
        let registry = Arc::new(TenantRegistry::new());
        let d = Dispatcher::new(Router::new().get("/", data), Arc::clone(&registry));

        let before = d.dispatch(request("GET", "new.example.com", "/"), CancellationToken::new()).await;
        assert_eq!(before.body(), b"tenant=none");

        registry.register_tenant("t9", ["new.example.com"]).unwrap();
        let after = d.dispatch(request("GET", "new.example.com", "/"), CancellationToken::new()).await;
        assert_eq!(after.body(), b"tenant=t9");
    }
}
