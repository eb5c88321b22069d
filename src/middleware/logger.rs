//! Per-request access log.

use std::time::Instant;

use tracing::{error, info, warn};

use super::{Middleware, Next};
use crate::context::Context;

/// Emits one `tracing` event per request once the chain has unwound.
///
/// Level follows the outcome: `error` for server faults, `warn` for client
/// errors, `info` otherwise. Fields: method, path, host, tenant, status,
/// latency in milliseconds.
pub fn logger() -> impl Middleware {
    |ctx: Context, next: Next| async move {
        let started = Instant::now();
        let method = ctx.request().method().clone();
        let path = ctx.request().path().to_owned();
        let host = ctx.request().host().unwrap_or("-").to_owned();
        let tenant = ctx.tenant_id().map(|t| t.to_string()).unwrap_or_else(|| "-".to_owned());

        let result = next.run(ctx).await;

        let latency_ms = started.elapsed().as_millis() as u64;
        let status = match &result {
            Ok(res) => res.status_code(),
            Err(err) => err.status_code().code(),
        };
        match status {
            500.. => error!(%method, %path, %host, %tenant, status, latency_ms, "request failed"),
            400..=499 => warn!(%method, %path, %host, %tenant, status, latency_ms, "request rejected"),
            _ => info!(%method, %path, %host, %tenant, status, latency_ms, "request completed"),
        }
        result
    }
}
