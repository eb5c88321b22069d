//! Built-in Kubernetes health-check handlers.
//!
//! | Probe | Path | Question |
//! |---|---|---|
//! | **Liveness** | `/healthz` | Is the process alive? Failure → restart. |
//! | **Readiness** | `/readyz` | Can the pod serve traffic? Failure → pulled from load-balancer. |
//!
//! Register them outside any tenant-only group, since probes arrive with the
//! pod IP as their host:
//!
//! ```rust
//! use portico::{Router, health};
//!
//! let app = Router::new()
//!     .get("/healthz", health::liveness)
//!     .get("/readyz", health::readiness);
//! ```
//!
//! Replace `readiness` with your own handler to gate on dependencies:
//!
//! ```rust
//! use portico::{Context, Response, Status};
//!
//! async fn readiness(_ctx: Context) -> Response {
//!     if dependencies_are_healthy().await {
//!         Response::text("ready")
//!     } else {
//!         Response::status(Status::ServiceUnavailable)
//!     }
//! }
//!
//! async fn dependencies_are_healthy() -> bool { true }
//! ```

use crate::{Context, Response};

/// Always `200 OK` with body `"ok"`.
pub async fn liveness(_ctx: Context) -> Response {
    Response::text("ok")
}

/// `200 OK` with body `"ready"`.
pub async fn readiness(_ctx: Context) -> Response {
    Response::text("ready")
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;

    use crate::{Dispatcher, Router};

    #[tokio::test]
    async fn probes_answer_without_a_tenant() {
        let d = Dispatcher::from(Router::new().get("/healthz", super::liveness).get("/readyz", super::readiness));
        for (path, body) in [("/healthz", "ok"), ("/readyz", "ready")] {
            let req = http::Request::builder().uri(path).header("host", "10.0.0.7:8080").body(Bytes::new()).unwrap();
            let res = d.dispatch(req.into(), CancellationToken::new()).await;
            assert_eq!(res.status_code(), 200);
            assert_eq!(res.body(), body.as_bytes());
        }
    }
}
