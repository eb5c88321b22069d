//! Transport advertisement headers.

use super::{Middleware, Next};
use crate::config::HstsConfig;
use crate::context::Context;
use crate::request::Protocol;

/// Advertises an HTTP/3 endpoint on `port` to HTTP/1.1 and HTTP/2 clients.
///
/// Sets `Alt-Svc: h3=":<port>"; ma=<max_age_secs>` on every response,
/// errors included. Requests already on HTTP/3 are left alone.
pub fn alt_svc(port: u16, max_age_secs: u64) -> impl Middleware {
    let value = format!("h3=\":{port}\"; ma={max_age_secs}");
    move |ctx: Context, next: Next| {
        if ctx.request().protocol() != Protocol::Http3 {
            ctx.set_response_header("alt-svc", &value);
        }
        next.run(ctx)
    }
}

/// Adds `Strict-Transport-Security` to responses sent over TLS or QUIC.
///
/// Browsers ignore the header on plaintext connections, so it is never sent
/// there. A disabled config makes this a pass-through.
pub fn hsts(config: HstsConfig) -> impl Middleware {
    let value = config.header_value();
    move |ctx: Context, next: Next| {
        if config.enabled && ctx.request().is_secure() {
            ctx.set_response_header("strict-transport-security", &value);
        }
        next.run(ctx)
    }
}
