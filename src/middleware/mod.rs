//! Middleware layer.
//!
//! A middleware is any `async fn(Context, Next) -> impl IntoHandlerResult`.
//! It sees the request on the way in, decides whether to continue, and sees
//! the result on the way out:
//!
//! ```rust
//! use portico::{Context, HandlerError, HandlerResult, Status};
//! use portico::middleware::Next;
//!
//! async fn auth(ctx: Context, next: Next) -> HandlerResult {
//!     if ctx.request().header("authorization").is_none() {
//!         // Not calling `next` ends the chain here.
//!         return Err(HandlerError::status(Status::Unauthorized));
//!     }
//!     let res = next.run(ctx).await?;
//!     // Anything after `next` runs while the chain unwinds.
//!     Ok(res)
//! }
//! ```
//!
//! [`Next`] is consumed by [`Next::run`], so a middleware continues the chain
//! at most once. Guard-style middleware that only inspect the request can
//! return an explicit [`Flow`] instead, via [`guard`].
//!
//! Middleware that need shared state receive it from a factory function as a
//! capability object, e.g. [`rate_limit`]`(Arc<RateLimiter>)`.
//!
//! Built-ins:
//!
//! | Factory | Effect |
//! |---|---|
//! | [`logger`] | one `tracing` event per request |
//! | [`handle_errors`] | renders chain errors with an application function |
//! | [`recover`] | turns handler panics into chain errors |
//! | [`require_tenant`] | rejects requests whose host resolved to no tenant |
//! | [`alt_svc`] | advertises HTTP/3 via `Alt-Svc` |
//! | [`hsts`] | `Strict-Transport-Security` on secure connections |
//! | [`rate_limit`] | token bucket per tenant (or peer address) |
//! | [`timeout`] | per-route deadline that also cancels the context |
//! | [`request_id`] | propagates or generates `x-request-id` |

use std::future::Future;
use std::sync::Arc;

use crate::context::Context;
use crate::handler::{BoxFuture, IntoHandlerResult};
use crate::response::Response;
use crate::error::HandlerError;

pub mod chain;
mod errors;
mod headers;
mod logger;
mod rate_limit;
mod request_id;
mod tenant;
mod timeout;

pub use chain::{Chain, Next, build_chain};
pub use errors::{handle_errors, recover};
pub(crate) use errors::panic_message;
pub use headers::{alt_svc, hsts};
pub use logger::logger;
pub use rate_limit::{RateLimiter, rate_limit};
pub use request_id::{REQUEST_ID_HEADER, REQUEST_ID_KEY, request_id};
pub use tenant::{require_tenant, require_tenant_with};
pub use timeout::timeout;

// ── Type erasure ──────────────────────────────────────────────────────────────

#[doc(hidden)]
pub trait ErasedMiddleware {
    fn call(&self, ctx: Context, next: Next) -> BoxFuture;
}

/// A type-erased middleware shared by every chain it appears in.
#[doc(hidden)]
pub type BoxedMiddleware = Arc<dyn ErasedMiddleware + Send + Sync + 'static>;

/// Implemented for every valid middleware.
///
/// Satisfied by any `Fn(Context, Next) -> impl Future<Output = impl IntoHandlerResult>`,
/// including `async fn` items and closures returned by the factory
/// functions in this module. Sealed, like [`Handler`](crate::Handler).
pub trait Middleware: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_middleware(self) -> BoxedMiddleware;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut, R> private::Sealed for F
where
    F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoHandlerResult + Send + 'static,
{
}

impl<F, Fut, R> Middleware for F
where
    F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoHandlerResult + Send + 'static,
{
    fn into_boxed_middleware(self) -> BoxedMiddleware {
        Arc::new(FnMiddleware(self))
    }
}

struct FnMiddleware<F>(F);

impl<F, Fut, R> ErasedMiddleware for FnMiddleware<F>
where
    F: Fn(Context, Next) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoHandlerResult + Send + 'static,
{
    fn call(&self, ctx: Context, next: Next) -> BoxFuture {
        let fut = (self.0)(ctx, next);
        Box::pin(async move { fut.await.into_handler_result() })
    }
}

// ── Guards ────────────────────────────────────────────────────────────────────

/// The explicit outcome of a guard: hand the context on, or answer now.
pub enum Flow {
    Continue(Context),
    Respond(Response),
}

/// Builds a middleware from a function that only decides whether the chain
/// continues.
///
/// ```rust
/// use portico::{Context, HandlerError, Response, Status};
/// use portico::middleware::{self, Flow};
///
/// let maintenance = middleware::guard(|ctx: Context| async move {
///     if ctx.request().path().starts_with("/admin") {
///         return Ok::<_, HandlerError>(Flow::Respond(Response::status(Status::ServiceUnavailable)));
///     }
///     Ok(Flow::Continue(ctx))
/// });
/// # let _ = portico::Router::new().layer(maintenance);
/// ```
pub fn guard<F, Fut>(f: F) -> impl Middleware
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Flow, HandlerError>> + Send + 'static,
{
    move |ctx: Context, next: Next| {
        let decision = f(ctx);
        async move {
            match decision.await? {
                Flow::Continue(ctx) => next.run(ctx).await,
                Flow::Respond(res) => Ok(res),
            }
        }
    }
}
