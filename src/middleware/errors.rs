//! Error translation and panic recovery.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tracing::error;

use super::{Middleware, Next};
use crate::context::Context;
use crate::error::HandlerError;
use crate::response::Response;

/// Renders every error that reaches this point with `render`.
///
/// Place it early in the global list so it wraps everything after it,
/// including the dispatcher's 404/405 results:
///
/// ```rust
/// use portico::{HandlerError, Response, Router};
/// use portico::middleware;
///
/// let app = Router::new().layer(middleware::handle_errors(|err: HandlerError| {
///     Response::builder()
///         .status(err.status_code())
///         .json(format!(r#"{{"error":"{}"}}"#, err.status_code().reason()))
/// }));
/// ```
pub fn handle_errors<F>(render: F) -> impl Middleware
where
    F: Fn(HandlerError) -> Response + Send + Sync + 'static,
{
    let render = Arc::new(render);
    move |ctx: Context, next: Next| {
        let render = Arc::clone(&render);
        async move {
            match next.run(ctx).await {
                Ok(res) => Ok::<_, HandlerError>(res),
                Err(err) => Ok(render(err)),
            }
        }
    }
}

/// Catches a panic anywhere after this point and returns it as a
/// `500` [`HandlerError`] so enclosing middleware can still observe it.
///
/// The dispatcher already isolates panics per request; this only matters
/// when middleware outside `recover` must see the failure.
pub fn recover() -> impl Middleware {
    |ctx: Context, next: Next| async move {
        let path = ctx.request().path().to_owned();
        match AssertUnwindSafe(next.run(ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(path = %path, panic = %message, "handler panicked");
                Err(HandlerError::panicked(message))
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_owned()
    }
}
