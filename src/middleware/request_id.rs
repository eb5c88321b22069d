//! Request identifiers.

use uuid::Uuid;

use super::{Middleware, Next};
use crate::context::Context;

/// Header read from the client and echoed on the response.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Context key holding the request id as a `String`.
pub const REQUEST_ID_KEY: &str = "request_id";

/// Reuses the client's `x-request-id` or generates a UUIDv4, stores it in
/// the context under [`REQUEST_ID_KEY`], and echoes it on the response.
pub fn request_id() -> impl Middleware {
    |mut ctx: Context, next: Next| {
        let id = ctx
            .request()
            .header(REQUEST_ID_HEADER)
            .filter(|v| !v.is_empty() && v.len() <= 128)
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        ctx.set_response_header(REQUEST_ID_HEADER, &id);
        ctx.set(REQUEST_ID_KEY, id);
        next.run(ctx)
    }
}
