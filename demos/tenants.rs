//! Two tenants, one route table.
//!
//! ```text
//! cargo run --example tenants
//! curl -H 'Host: acme.localhost' localhost:3000/api/whoami
//! curl -H 'Host: globex.localhost' localhost:3000/api/whoami
//! curl -X POST -H 'Host: acme.localhost' localhost:3000/api/admin/purge            # 401
//! curl -X POST -H 'Host: acme.localhost' -H 'Authorization: x' localhost:3000/api/admin/purge
//! ```

use std::sync::Arc;
use std::time::Duration;

use portico::middleware::{self, Next, RateLimiter};
use portico::{Context, HandlerError, HandlerResult, Response, Router, Server, Status, TenantRegistry};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), portico::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let registry = Arc::new(TenantRegistry::new());
    registry.register_tenant_with_config("acme", ["acme.localhost"], serde_json::json!({ "plan": "enterprise" }))?;
    registry.register_tenant_with_config("globex", ["globex.localhost"], serde_json::json!({ "plan": "free" }))?;

    let limiter = Arc::new(RateLimiter::new(5, 10));

    let app = Router::new()
        .layer(middleware::request_id())
        .layer(middleware::logger())
        .get("/healthz", portico::health::liveness)
        .get("/readyz", portico::health::readiness)
        .group("/api", |api| {
            api.layer(middleware::require_tenant())
                .layer(middleware::rate_limit(limiter))
                .layer(middleware::timeout(Duration::from_secs(5)))
                .get("/whoami", whoami)
                .group("/admin", |admin| admin.layer(audit).layer(auth).post("/purge", purge))
        });

    Server::bind("0.0.0.0:3000").with_registry(registry).serve(app).await
}

async fn whoami(ctx: Context) -> Response {
    let tenant = ctx.tenant_id().map(|t| t.as_str()).unwrap_or("-");
    let plan = ctx.tenant_config().and_then(|c| c["plan"].as_str()).unwrap_or("-");
    Response::text(format!("tenant={tenant} plan={plan}\n"))
}

async fn audit(ctx: Context, next: Next) -> HandlerResult {
    let tenant = ctx.tenant_id().map(|t| t.to_string()).unwrap_or_default();
    let path = ctx.request().path().to_owned();
    let result = next.run(ctx).await;
    let status = match &result {
        Ok(res) => res.status_code(),
        Err(e) => e.status_code().code(),
    };
    info!(tenant = %tenant, path = %path, status, "admin action");
    result
}

async fn auth(ctx: Context, next: Next) -> HandlerResult {
    if ctx.request().header("authorization").is_none() {
        return Err(HandlerError::status(Status::Unauthorized));
    }
    next.run(ctx).await
}

async fn purge(_ctx: Context) -> Response {
    Response::status(Status::NoContent)
}
