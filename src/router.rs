//! Route table, groups and global middleware.
//!
//! One radix tree ([`matchit`]) over every registered path; each path holds
//! one precomputed [`Chain`] per method. Chains are composed once, when the
//! router becomes a [`Dispatcher`](crate::Dispatcher), in the fixed order
//! global → groups (outer → inner) → route → handler.
//!
//! ```rust
//! use portico::{Context, Method, Response, Router, Stack};
//! use portico::middleware;
//!
//! async fn data(ctx: Context) -> Response {
//!     Response::text(format!("tenant {:?}", ctx.tenant_id()))
//! }
//! async fn audit(ctx: Context, next: middleware::Next) -> portico::HandlerResult {
//!     next.run(ctx).await
//! }
//!
//! let app = Router::new()
//!     .layer(middleware::logger())
//!     .group("/api", |api| {
//!         api.layer(middleware::require_tenant())
//!             .get("/data", data)
//!             .group("/admin", |admin| admin.on_with(Method::Post, "/purge", Stack::new().push(audit), data))
//!     });
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use matchit::Router as MatchitRouter;

use crate::context::Context;
use crate::error::HandlerError;
use crate::handler::{BoxedHandler, Handler};
use crate::method::Method;
use crate::middleware::{BoxedMiddleware, Chain, Middleware, build_chain};
use crate::response::Response;

// ── Route definitions ─────────────────────────────────────────────────────────

/// An ordered list of route-specific middleware.
#[derive(Clone, Default)]
pub struct Stack(Vec<BoxedMiddleware>);

impl Stack {
    pub fn new() -> Self { Self(Vec::new()) }

    pub fn push(mut self, mw: impl Middleware) -> Self {
        self.0.push(mw.into_boxed_middleware());
        self
    }

    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

struct RouteDef {
    method: Method,
    path: String,
    /// Group middleware, outermost group first.
    groups: Vec<Arc<[BoxedMiddleware]>>,
    middleware: Vec<BoxedMiddleware>,
    handler: BoxedHandler,
}

fn join_path(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    match path {
        "" | "/" if prefix.is_empty() => "/".to_owned(),
        "" | "/" => prefix.to_owned(),
        p if p.starts_with('/') => format!("{prefix}{p}"),
        p => format!("{prefix}/{p}"),
    }
}

// ── Group ─────────────────────────────────────────────────────────────────────

/// A nested routing scope: a path prefix plus middleware applied to every
/// route inside it, including routes of nested groups.
pub struct Group {
    prefix: String,
    middleware: Vec<BoxedMiddleware>,
    routes: Vec<RouteDef>,
}

impl Group {
    fn new(prefix: &str) -> Self {
        Self { prefix: prefix.to_owned(), middleware: Vec::new(), routes: Vec::new() }
    }

    /// Adds middleware to this group. Applies to all of the group's routes,
    /// whether registered before or after this call.
    pub fn layer(mut self, mw: impl Middleware) -> Self {
        self.middleware.push(mw.into_boxed_middleware());
        self
    }

    pub fn on(self, method: Method, path: &str, handler: impl Handler) -> Self {
        self.on_with(method, path, Stack::new(), handler)
    }

    pub fn on_with(mut self, method: Method, path: &str, stack: Stack, handler: impl Handler) -> Self {
        self.routes.push(RouteDef {
            method,
            path: path.to_owned(),
            groups: Vec::new(),
            middleware: stack.0,
            handler: handler.into_boxed_handler(),
        });
        self
    }

    pub fn get(self, path: &str, handler: impl Handler) -> Self { self.on(Method::Get, path, handler) }
    pub fn post(self, path: &str, handler: impl Handler) -> Self { self.on(Method::Post, path, handler) }
    pub fn put(self, path: &str, handler: impl Handler) -> Self { self.on(Method::Put, path, handler) }
    pub fn patch(self, path: &str, handler: impl Handler) -> Self { self.on(Method::Patch, path, handler) }
    pub fn delete(self, path: &str, handler: impl Handler) -> Self { self.on(Method::Delete, path, handler) }

    /// Opens a nested group under this one's prefix.
    pub fn group(mut self, prefix: &str, build: impl FnOnce(Group) -> Group) -> Self {
        let child = build(Group::new(prefix));
        self.routes.extend(child.finish());
        self
    }

    /// Applies this group's prefix and middleware to its routes.
    fn finish(self) -> Vec<RouteDef> {
        let own: Arc<[BoxedMiddleware]> = self.middleware.into();
        self.routes
            .into_iter()
            .map(|mut r| {
                r.path = join_path(&self.prefix, &r.path);
                r.groups.insert(0, Arc::clone(&own));
                r
            })
            .collect()
    }
}

// ── Router ────────────────────────────────────────────────────────────────────

struct PathEntry {
    pattern: String,
    methods: BTreeMap<Method, RouteDef>,
}

/// The application router.
///
/// Build it once at startup. Each call returns `self` so registrations chain
/// naturally; the router is consumed by [`Dispatcher::new`](crate::Dispatcher::new)
/// or [`Server::serve`](crate::Server::serve).
pub struct Router {
    global: Vec<BoxedMiddleware>,
    tree: MatchitRouter<usize>,
    entries: Vec<PathEntry>,
    by_pattern: HashMap<String, usize>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            global: Vec::new(),
            tree: MatchitRouter::new(),
            entries: Vec::new(),
            by_pattern: HashMap::new(),
        }
    }

    /// Appends global middleware, run for every request (unmatched ones too).
    pub fn layer(mut self, mw: impl Middleware) -> Self {
        self.global.push(mw.into_boxed_middleware());
        self
    }

    /// Puts `mw` in front of every global middleware added so far.
    pub(crate) fn wrap(mut self, mw: impl Middleware) -> Self {
        self.global.insert(0, mw.into_boxed_middleware());
        self
    }

    /// Register a handler for a method + path pair.
    ///
    /// Path parameters use `{name}` syntax, catch-alls `{*rest}`.
    ///
    /// # Panics
    ///
    /// Panics on an invalid or conflicting pattern, or when the same method
    /// is registered twice for one path.
    pub fn on(self, method: Method, path: &str, handler: impl Handler) -> Self {
        self.on_with(method, path, Stack::new(), handler)
    }

    /// Like [`on`](Router::on), with route-specific middleware.
    pub fn on_with(mut self, method: Method, path: &str, stack: Stack, handler: impl Handler) -> Self {
        self.add(RouteDef {
            method,
            path: join_path("", path),
            groups: Vec::new(),
            middleware: stack.0,
            handler: handler.into_boxed_handler(),
        });
        self
    }

    pub fn get(self, path: &str, handler: impl Handler) -> Self { self.on(Method::Get, path, handler) }
    pub fn post(self, path: &str, handler: impl Handler) -> Self { self.on(Method::Post, path, handler) }
    pub fn put(self, path: &str, handler: impl Handler) -> Self { self.on(Method::Put, path, handler) }
    pub fn patch(self, path: &str, handler: impl Handler) -> Self { self.on(Method::Patch, path, handler) }
    pub fn delete(self, path: &str, handler: impl Handler) -> Self { self.on(Method::Delete, path, handler) }

    /// Opens a group at `prefix`. See [`Group`].
    pub fn group(mut self, prefix: &str, build: impl FnOnce(Group) -> Group) -> Self {
        for route in build(Group::new(prefix)).finish() {
            self.add(route);
        }
        self
    }

    fn add(&mut self, route: RouteDef) {
        let index = match self.by_pattern.get(&route.path) {
            Some(&i) => i,
            None => {
                let i = self.entries.len();
                self.tree
                    .insert(route.path.clone(), i)
                    .unwrap_or_else(|e| panic!("invalid route `{}`: {e}", route.path));
                self.by_pattern.insert(route.path.clone(), i);
                self.entries.push(PathEntry { pattern: route.path.clone(), methods: BTreeMap::new() });
                i
            }
        };
        let entry = &mut self.entries[index];
        if entry.methods.contains_key(&route.method) {
            panic!("route `{} {}` registered twice", route.method, entry.pattern);
        }
        entry.methods.insert(route.method, route);
    }

    /// Composes every chain. Called once by the dispatcher.
    pub(crate) fn build(self) -> RouteTable {
        let global = self.global;
        let not_found = terminal_chain(&global, HandlerError::route_not_found);

        let entries = self
            .entries
            .into_iter()
            .map(|entry| {
                let mut allowed: Vec<Method> = entry.methods.keys().copied().collect();
                if allowed.contains(&Method::Get) && !allowed.contains(&Method::Head) {
                    allowed.push(Method::Head);
                    allowed.sort();
                }
                let allow = allowed.iter().map(|m| m.as_str()).collect::<Vec<_>>().join(", ");
                let not_allowed = {
                    let allow = allow.clone();
                    terminal_chain(&global, move || HandlerError::method_not_allowed(&allow))
                };
                let chains = entry
                    .methods
                    .into_iter()
                    .map(|(method, r)| (method, build_chain(&global, &r.groups, &r.middleware, r.handler)))
                    .collect();
                BuiltEntry { chains, not_allowed }
            })
            .collect();

        RouteTable { tree: self.tree, entries, not_found }
    }
}

impl Default for Router {
    fn default() -> Self { Self::new() }
}

/// Global middleware around a handler that always fails with `make_err()`.
fn terminal_chain<F>(global: &[BoxedMiddleware], make_err: F) -> Chain
where
    F: Fn() -> HandlerError + Send + Sync + 'static,
{
    let handler = move |_ctx: Context| {
        let err = make_err();
        async move { Err::<Response, _>(err) }
    };
    build_chain::<Vec<BoxedMiddleware>>(global, &[], &[], handler.into_boxed_handler())
}

// ── Route table ───────────────────────────────────────────────────────────────

struct BuiltEntry {
    chains: BTreeMap<Method, Chain>,
    not_allowed: Chain,
}

/// Immutable after construction; shared by every connection without locking.
pub(crate) struct RouteTable {
    tree: MatchitRouter<usize>,
    entries: Vec<BuiltEntry>,
    not_found: Chain,
}

/// Outcome of a route lookup. Every variant carries the chain to run.
pub(crate) enum Lookup<'a> {
    Matched { chain: &'a Chain, params: HashMap<String, String> },
    MethodNotAllowed { chain: &'a Chain },
    NotFound { chain: &'a Chain },
}

impl RouteTable {
    pub(crate) fn lookup(&self, method: &http::Method, path: &str) -> Lookup<'_> {
        let Ok(matched) = self.tree.at(path) else {
            return Lookup::NotFound { chain: &self.not_found };
        };
        let entry = &self.entries[*matched.value];

        let chain = Method::from_http(method).and_then(|m| {
            entry.chains.get(&m).or_else(|| {
                // HEAD is served by GET; hyper drops the body on the wire.
                (m == Method::Head).then(|| entry.chains.get(&Method::Get)).flatten()
            })
        });

        match chain {
            Some(chain) => Lookup::Matched {
                chain,
                params: matched
                    .params
                    .iter()
                    .map(|(k, v)| (k.to_owned(), v.to_owned()))
                    .collect(),
            },
            None => Lookup::MethodNotAllowed { chain: &entry.not_allowed },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ok(_ctx: Context) -> Response { Response::text("ok") }

    #[test]
    fn joins_prefixes() {
        assert_eq!(join_path("", "/"), "/");
        assert_eq!(join_path("/api/", "/data"), "/api/data");
        assert_eq!(join_path("/api", "/"), "/api");
        assert_eq!(join_path("/api", "v1"), "/api/v1");
        assert_eq!(join_path("", "users"), "/users");
    }

    #[test]
    fn lookup_outcomes() {
        let table = Router::new()
            .get("/users/{id}", ok)
            .post("/users", ok)
            .group("/api", |g| g.group("/v1", |g| g.delete("/items/{id}", ok)))
            .build();

        match table.lookup(&http::Method::GET, "/users/7") {
            Lookup::Matched { params, .. } => assert_eq!(params["id"], "7"),
            _ => panic!("expected match"),
        }
        assert!(matches!(table.lookup(&http::Method::HEAD, "/users/7"), Lookup::Matched { .. }));
        assert!(matches!(table.lookup(&http::Method::DELETE, "/api/v1/items/3"), Lookup::Matched { .. }));
        assert!(matches!(table.lookup(&http::Method::GET, "/users"), Lookup::MethodNotAllowed { .. }));
        assert!(matches!(table.lookup(&http::Method::GET, "/nope"), Lookup::NotFound { .. }));
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_method_panics() {
        let _ = Router::new().get("/a", ok).get("/a", ok);
    }

    #[test]
    fn group_middleware_counts_toward_chain_length() {
        let mw = |ctx: Context, next: crate::middleware::Next| next.run(ctx);
        let table = Router::new()
            .layer(mw)
            .group("/a", |g| g.layer(mw).group("/b", |g| g.layer(mw).on_with(Method::Get, "/c", Stack::new().push(mw), ok)))
            .build();
        match table.lookup(&http::Method::GET, "/a/b/c") {
            Lookup::Matched { chain, .. } => assert_eq!(chain.len(), 4),
            _ => panic!("expected match"),
        }
    }
}
