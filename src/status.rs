//! HTTP status codes as a typed enum.
//!
//! Use [`Status`] anywhere a status code is accepted: `Response::status()`,
//! `Response::builder().status()`, [`HandlerError::new`](crate::HandlerError::new),
//! or as a bare handler return value.
//!
//! ```rust
//! use portico::{Context, Response, Status};
//!
//! Response::status(Status::NoContent);
//!
//! async fn delete_user(_ctx: Context) -> Status {
//!     Status::NoContent
//! }
//! ```

macro_rules! statuses {
    ($( $(#[$meta:meta])* $variant:ident = $code:literal, $reason:literal; )+) => {
        /// IANA-registered HTTP status codes.
        #[allow(clippy::enum_variant_names)]
        #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
        pub enum Status {
            $( $(#[$meta])* $variant, )+
        }

        impl Status {
            /// The numeric code, e.g. `404`.
            pub const fn code(self) -> u16 {
                match self {
                    $( Self::$variant => $code, )+
                }
            }

            /// The canonical reason phrase, e.g. `"Not Found"`.
            pub const fn reason(self) -> &'static str {
                match self {
                    $( Self::$variant => $reason, )+
                }
            }

            /// Looks up a registered code. Unregistered codes return `None`.
            pub const fn from_code(code: u16) -> Option<Self> {
                match code {
                    $( $code => Some(Self::$variant), )+
                    _ => None,
                }
            }
        }
    };
}

statuses! {
    // ── 1xx Informational ─────────────────────────────────────────────────────
    Continue                      = 100, "Continue";
    SwitchingProtocols            = 101, "Switching Protocols";
    EarlyHints                    = 103, "Early Hints";

    // ── 2xx Success ───────────────────────────────────────────────────────────
    Ok                            = 200, "OK";
    Created                       = 201, "Created";
    Accepted                      = 202, "Accepted";
    NoContent                     = 204, "No Content";
    PartialContent                = 206, "Partial Content";

    // ── 3xx Redirection ───────────────────────────────────────────────────────
    MovedPermanently              = 301, "Moved Permanently";
    Found                         = 302, "Found";
    SeeOther                      = 303, "See Other";
    NotModified                   = 304, "Not Modified";
    TemporaryRedirect             = 307, "Temporary Redirect";
    PermanentRedirect             = 308, "Permanent Redirect";

    // ── 4xx Client errors ─────────────────────────────────────────────────────
    BadRequest                    = 400, "Bad Request";
    Unauthorized                  = 401, "Unauthorized";
    Forbidden                     = 403, "Forbidden";
    NotFound                      = 404, "Not Found";
    MethodNotAllowed              = 405, "Method Not Allowed";
    NotAcceptable                 = 406, "Not Acceptable";
    RequestTimeout                = 408, "Request Timeout";
    Conflict                      = 409, "Conflict";
    Gone                          = 410, "Gone";
    LengthRequired                = 411, "Length Required";
    PreconditionFailed            = 412, "Precondition Failed";
    ContentTooLarge               = 413, "Content Too Large";
    UriTooLong                    = 414, "URI Too Long";
    UnsupportedMediaType          = 415, "Unsupported Media Type";
    MisdirectedRequest            = 421, "Misdirected Request";
    UnprocessableContent          = 422, "Unprocessable Content";
    TooEarly                      = 425, "Too Early";
    PreconditionRequired          = 428, "Precondition Required";
    TooManyRequests               = 429, "Too Many Requests";
    RequestHeaderFieldsTooLarge   = 431, "Request Header Fields Too Large";

    // ── 5xx Server errors ─────────────────────────────────────────────────────
    InternalServerError           = 500, "Internal Server Error";
    NotImplemented                = 501, "Not Implemented";
    BadGateway                    = 502, "Bad Gateway";
    ServiceUnavailable            = 503, "Service Unavailable";
    GatewayTimeout                = 504, "Gateway Timeout";
    HttpVersionNotSupported       = 505, "HTTP Version Not Supported";
}

impl Status {
    pub const fn is_client_error(self) -> bool {
        matches!(self.code(), 400..=499)
    }

    pub const fn is_server_error(self) -> bool {
        matches!(self.code(), 500..=599)
    }
}

impl From<Status> for u16 {
    fn from(s: Status) -> u16 { s.code() }
}

impl From<Status> for http::StatusCode {
    fn from(s: Status) -> Self {
        // Every variant is a valid three-digit code.
        http::StatusCode::from_u16(s.code()).unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR)
    }
}

#[cfg(test)]
mod tests {
    use super::Status;

    #[test]
    fn codes_and_reasons_agree() {
        assert_eq!(Status::TooManyRequests.code(), 429);
        assert_eq!(Status::from_code(413), Some(Status::ContentTooLarge));
        assert_eq!(Status::from_code(299), None);
        assert_eq!(http::StatusCode::from(Status::NotFound).canonical_reason(), Some(Status::NotFound.reason()));
    }

    #[test]
    fn classes() {
        assert!(Status::Unauthorized.is_client_error());
        assert!(!Status::Unauthorized.is_server_error());
        assert!(Status::ServiceUnavailable.is_server_error());
    }
}
