//! Per-route deadlines.

use std::time::Duration;

use tracing::warn;

use super::{Middleware, Next};
use crate::context::Context;
use crate::error::{ErrorKind, HandlerError};
use crate::status::Status;

/// Fails the rest of the chain with `503 Service Unavailable` once `limit`
/// elapses, and cancels the request's context so work spawned by the
/// handler can stop too.
///
/// The server-wide `timeouts.request_secs` does the same for every route;
/// use this for routes that need a tighter bound.
pub fn timeout(limit: Duration) -> impl Middleware {
    move |ctx: Context, next: Next| async move {
        let token = ctx.cancellation_token().clone();
        let path = ctx.request().path().to_owned();
        match tokio::time::timeout(limit, next.run(ctx)).await {
            Ok(result) => result,
            Err(_) => {
                token.cancel();
                warn!(path = %path, limit_ms = limit.as_millis() as u64, "request deadline exceeded");
                Err(HandlerError::new(Status::ServiceUnavailable, "request timed out")
                    .with_kind(ErrorKind::Timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::handler::Handler;
    use crate::middleware::{BoxedMiddleware, build_chain};
    use crate::response::Response;

    #[tokio::test(start_paused = true)]
    async fn slow_handler_is_cut_off_and_cancelled() {
        let h = (|ctx: Context| async move {
            ctx.cancelled().await;
            Response::text("never")
        })
        .into_boxed_handler();
        let chain = build_chain::<Vec<BoxedMiddleware>>(
            &[timeout(Duration::from_millis(50)).into_boxed_middleware()],
            &[],
            &[],
            h,
        );

        let token = CancellationToken::new();
        let ctx = Context::new(http::Request::builder().uri("/slow").body(Bytes::new()).unwrap().into())
            .with_cancellation(token.clone());

        let err = chain.run(ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(token.is_cancelled());
    }
}
