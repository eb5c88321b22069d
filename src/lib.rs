//! # portico
//!
//! A multi-tenant HTTP framework: one middleware chain engine behind
//! HTTP/1.1, HTTP/2 and (with the `quic` feature) HTTP/3 front-ends.
//!
//! ## The model
//!
//! - A **registry** maps hostnames to tenants. The `Host` header (or
//!   `:authority`) of every request selects the tenant; unknown hosts run
//!   tenant-less.
//! - A **router** holds routes, nested groups and global middleware. Each
//!   route's chain is composed once, in a fixed order:
//!   global → groups (outer → inner) → route → handler.
//! - A **dispatcher** resolves tenant and route, builds the request
//!   [`Context`] and runs the chain on its own task, so a panicking handler
//!   costs one `500`, not a connection.
//! - **Front-ends** ([`Server`], `QuicServer`) only move bytes: every
//!   protocol reaches the dispatcher as the same [`Request`].
//!
//! What's left for you: handlers and middleware, plain `async fn`s.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use portico::middleware::{self, Next};
//! use portico::{Context, HandlerError, HandlerResult, Response, Router, Server, Status, TenantRegistry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), portico::Error> {
//!     let registry = Arc::new(TenantRegistry::new());
//!     registry.register_tenant("acme", ["acme.example.com"])?;
//!     registry.register_tenant("globex", ["globex.example.com"])?;
//!
//!     let app = Router::new()
//!         .layer(middleware::logger())
//!         .get("/healthz", portico::health::liveness)
//!         .group("/api", |api| {
//!             api.layer(middleware::require_tenant())
//!                 .get("/whoami", whoami)
//!                 .group("/admin", |admin| admin.layer(auth).post("/purge", purge))
//!         });
//!
//!     Server::bind("0.0.0.0:3000").with_registry(registry).serve(app).await
//! }
//!
//! async fn whoami(ctx: Context) -> Response {
//!     let tenant = ctx.tenant_id().map(|t| t.as_str()).unwrap_or("-");
//!     Response::text(format!("tenant: {tenant}"))
//! }
//!
//! async fn auth(ctx: Context, next: Next) -> HandlerResult {
//!     if ctx.request().header("authorization").is_none() {
//!         return Err(HandlerError::status(Status::Unauthorized));
//!     }
//!     next.run(ctx).await
//! }
//!
//! async fn purge(_ctx: Context) -> Response {
//!     Response::status(Status::NoContent)
//! }
//! ```

mod context;
mod dispatch;
mod error;
mod handler;
mod method;
mod request;
mod response;
mod router;
mod server;
mod status;
mod tenant;

pub mod config;
pub mod health;
pub mod middleware;
pub mod tls;

pub use config::{HostMatching, ServerConfig, TlsConfig};
pub use context::Context;
pub use dispatch::Dispatcher;
pub use error::{BoxError, Error, ErrorKind, HandlerError, RegistryError};
pub use handler::{Handler, HandlerResult, IntoHandlerResult};
pub use method::Method;
pub use request::{Protocol, Request};
pub use response::{ContentType, IntoResponse, Response, ResponseBuilder};
pub use router::{Group, Router, Stack};
#[cfg(feature = "quic")]
pub use server::quic::QuicServer;
pub use server::{Server, shutdown_signal};
pub use status::Status;
pub use tenant::{HostConfig, TenantId, TenantInfo, TenantRegistry, normalize_host};
