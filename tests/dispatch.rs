use std::sync::{Arc, Mutex};

use bytes::Bytes;
use portico::middleware::{self, Next};
use portico::{
    Context, Dispatcher, ErrorKind, HandlerError, HandlerResult, Method, Request, Response, Router, Stack, Status,
    TenantRegistry,
};
use tokio_util::sync::CancellationToken;

type Log = Arc<Mutex<Vec<String>>>;

fn request(method: &str, host: &str, path: &str, auth: bool) -> Request {
    let mut b = http::Request::builder().method(method).uri(path).header("host", host);
    if auth {
        b = b.header("authorization", "Bearer secret");
    }
    b.body(Bytes::new()).unwrap().into()
}

fn tagged(log: &Log, name: &'static str) -> impl middleware::Middleware {
    let log = Arc::clone(log);
    move |ctx: Context, next: Next| {
        let log = Arc::clone(&log);
        async move {
            log.lock().unwrap().push(format!("{name}>"));
            let res = next.run(ctx).await;
            log.lock().unwrap().push(format!("<{name}"));
            res
        }
    }
}

fn two_tenants() -> Arc<TenantRegistry> {
    let registry = TenantRegistry::new();
    registry
        .register_tenant_with_config("t1", ["a.example.com"], serde_json::json!({"greeting": "hello from a"}))
        .unwrap();
    registry
        .register_tenant_with_config("t2", ["b.example.com"], serde_json::json!({"greeting": "hello from b"}))
        .unwrap();
    Arc::new(registry)
}

async fn greet(ctx: Context) -> Result<Response, HandlerError> {
    let greeting = ctx
        .tenant_config()
        .and_then(|c| c["greeting"].as_str())
        .ok_or_else(|| HandlerError::new(Status::NotFound, "no tenant"))?;
    Ok(Response::text(greeting))
}

#[tokio::test]
async fn same_path_two_tenants_are_isolated() {
    let d = Dispatcher::new(Router::new().get("/api/data", greet), two_tenants());

    let (a, b) = tokio::join!(
        d.dispatch(request("GET", "a.example.com", "/api/data", false), CancellationToken::new()),
        d.dispatch(request("GET", "b.example.com", "/api/data", false), CancellationToken::new()),
    );
    assert_eq!(a.body(), b"hello from a");
    assert_eq!(b.body(), b"hello from b");

    let none = d.dispatch(request("GET", "c.example.com", "/api/data", false), CancellationToken::new()).await;
    assert_eq!(none.status_code(), 404);
}

#[tokio::test]
async fn request_state_never_leaks_between_tenants() {
    #[derive(Clone)]
    struct Visits(u32);

    async fn mark(mut ctx: Context, next: Next) -> HandlerResult {
        let tenant = ctx.tenant_id().map(|t| t.to_string()).unwrap_or_default();
        ctx.set(format!("seen:{tenant}"), tenant.clone());
        let visits = ctx.extension::<Visits>().map_or(0, |v| v.0) + 1;
        ctx.insert(Visits(visits));
        next.run(ctx).await
    }

    async fn report(ctx: Context) -> Response {
        let tenant = ctx.tenant_id().map(|t| t.to_string()).unwrap_or_default();
        let keys: Vec<&str> = ["seen:t1", "seen:t2"].into_iter().filter(|k| ctx.contains(k)).collect();
        let owned = ctx.get::<String>(&format!("seen:{tenant}")).cloned().unwrap_or_default();
        let visits = ctx.extension::<Visits>().map_or(0, |v| v.0);
        Response::text(format!("{tenant}|{}|{owned}|{visits}", keys.join(",")))
    }

    let d = Dispatcher::new(Router::new().layer(mark).get("/api/data", report), two_tenants());

    let requests = (0..200).map(|i| {
        let d = d.clone();
        let host = if i % 2 == 0 { "a.example.com" } else { "b.example.com" };
        tokio::spawn(async move {
            let res = d.dispatch(request("GET", host, "/api/data", false), CancellationToken::new()).await;
            (host, String::from_utf8(res.body().to_vec()).unwrap())
        })
    });
    for task in requests.collect::<Vec<_>>() {
        let (host, body) = task.await.unwrap();
        let expected = if host == "a.example.com" { "t1|seen:t1|t1|1" } else { "t2|seen:t2|t2|1" };
        assert_eq!(body, expected);
    }
}

#[tokio::test]
async fn chain_runs_global_then_groups_then_route() {
    let log = Log::default();
    let handler_log = Arc::clone(&log);
    let handler = move |_ctx: Context| {
        let log = Arc::clone(&handler_log);
        async move {
            log.lock().unwrap().push("handler".into());
            Response::text("ok")
        }
    };

    let router = Router::new()
        .layer(tagged(&log, "g1"))
        .layer(tagged(&log, "g2"))
        .group("/api", |api| {
            api.layer(tagged(&log, "api"))
                .group("/v1", |v1| v1.layer(tagged(&log, "v1")).on_with(Method::Get, "/x", Stack::new().push(tagged(&log, "route")), handler))
        });
    let d = Dispatcher::from(router);

    let res = d.dispatch(request("GET", "x", "/api/v1/x", false), CancellationToken::new()).await;
    assert_eq!(res.status_code(), 200);
    assert_eq!(
        *log.lock().unwrap(),
        ["g1>", "g2>", "api>", "v1>", "route>", "handler", "<route", "<v1", "<api", "<g2", "<g1"]
    );
}

#[tokio::test]
async fn audit_sees_the_auth_rejection() {
    let audit_log: Arc<Mutex<Vec<(String, u16)>>> = Arc::default();
    let purged = Arc::new(Mutex::new(false));

    let audit = {
        let audit_log = Arc::clone(&audit_log);
        move |ctx: Context, next: Next| {
            let audit_log = Arc::clone(&audit_log);
            async move {
                let path = ctx.request().path().to_owned();
                let result = next.run(ctx).await;
                let status = match &result {
                    Ok(res) => res.status_code(),
                    Err(e) => e.status_code().code(),
                };
                audit_log.lock().unwrap().push((path, status));
                result
            }
        }
    };
    async fn auth(ctx: Context, next: Next) -> HandlerResult {
        if ctx.request().header("authorization").is_none() {
            return Err(HandlerError::status(Status::Unauthorized));
        }
        next.run(ctx).await
    }
    let purge = {
        let purged = Arc::clone(&purged);
        move |_ctx: Context| {
            let purged = Arc::clone(&purged);
            async move {
                *purged.lock().unwrap() = true;
                Response::status(Status::NoContent)
            }
        }
    };

    let router = Router::new().group("/admin", |admin| admin.layer(audit).layer(auth).post("/purge", purge));
    let d = Dispatcher::new(router, two_tenants());

    let denied = d.dispatch(request("POST", "a.example.com", "/admin/purge", false), CancellationToken::new()).await;
    assert_eq!(denied.status_code(), 401);
    assert!(!*purged.lock().unwrap());

    let allowed = d.dispatch(request("POST", "a.example.com", "/admin/purge", true), CancellationToken::new()).await;
    assert_eq!(allowed.status_code(), 204);
    assert!(*purged.lock().unwrap());

    assert_eq!(
        *audit_log.lock().unwrap(),
        [("/admin/purge".to_owned(), 401), ("/admin/purge".to_owned(), 204)]
    );
}

#[tokio::test]
async fn error_translation_sees_routing_failures() {
    let router = Router::new()
        .layer(middleware::handle_errors(|err: HandlerError| {
            let kind = match err.kind() {
                ErrorKind::RouteNotFound => "route_not_found",
                ErrorKind::MethodNotAllowed => "method_not_allowed",
                ErrorKind::TenantUnresolved => "tenant_unresolved",
                _ => "other",
            };
            Response::builder()
                .status(err.status_code())
                .json(format!(r#"{{"error":"{kind}"}}"#))
        }))
        .group("/api", |api| api.layer(middleware::require_tenant()).get("/data", greet));
    let d = Dispatcher::new(router, two_tenants());

    let cases = [
        ("GET", "a.example.com", "/nowhere", 404, "route_not_found"),
        ("PUT", "a.example.com", "/api/data", 405, "method_not_allowed"),
        ("GET", "unknown.example.com", "/api/data", 404, "tenant_unresolved"),
    ];
    for (method, host, path, status, kind) in cases {
        let res = d.dispatch(request(method, host, path, false), CancellationToken::new()).await;
        assert_eq!(res.status_code(), status, "{method} {host}{path}");
        assert_eq!(res.body(), format!(r#"{{"error":"{kind}"}}"#).as_bytes());
    }
}

#[tokio::test]
async fn handler_observes_client_cancellation() {
    let (tx, rx) = tokio::sync::oneshot::channel::<bool>();
    let tx = Arc::new(Mutex::new(Some(tx)));
    let handler = move |ctx: Context| {
        let tx = Arc::clone(&tx);
        async move {
            ctx.cancelled().await;
            // Observing the signal again is fine.
            let again = ctx.is_cancelled() && ctx.is_cancelled();
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(again);
            }
            Response::text("gone")
        }
    };
    let d = Dispatcher::from(Router::new().get("/stream", handler));

    let token = CancellationToken::new();
    let fut = d.dispatch(request("GET", "x", "/stream", false), token.clone());
    // Simulate the client going away: the front-end drops the request future.
    let _ = tokio::time::timeout(std::time::Duration::from_millis(20), fut).await;

    assert!(token.is_cancelled());
    assert!(rx.await.unwrap());
}
