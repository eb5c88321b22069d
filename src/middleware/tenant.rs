//! Tenant enforcement.
//!
//! The dispatcher never rejects a request because its host is unknown; the
//! context simply carries no tenant. Routes that only make sense for a tenant
//! opt in to rejection here.

use super::{Flow, Middleware, guard};
use crate::context::Context;
use crate::error::{ErrorKind, HandlerError};
use crate::status::Status;

/// Rejects requests without a resolved tenant with `404 Not Found`.
pub fn require_tenant() -> impl Middleware {
    require_tenant_with(Status::NotFound)
}

/// Rejects requests without a resolved tenant with `status`.
pub fn require_tenant_with(status: Status) -> impl Middleware {
    guard(move |ctx: Context| async move {
        if ctx.tenant_id().is_none() {
            let host = ctx.request().host().unwrap_or_default().to_owned();
            return Err(HandlerError::new(status, format!("unknown tenant host `{host}`"))
                .with_kind(ErrorKind::TenantUnresolved));
        }
        Ok(Flow::Continue(ctx))
    })
}
