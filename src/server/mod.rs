//! Protocol front-ends and graceful shutdown.
//!
//! [`Server`] terminates TCP (optionally TLS) and speaks HTTP/1.1 and HTTP/2
//! through hyper; with the `quic` feature it also runs a
//! [`QuicServer`](quic::QuicServer) for HTTP/3. Every front-end hands
//! complete [`Request`]s to the same [`Dispatcher`].
//!
//! # Graceful shutdown and Kubernetes
//!
//! When Kubernetes terminates a pod it sends **SIGTERM** and waits
//! `terminationGracePeriodSeconds` (default 30 s) before sending SIGKILL.
//!
//! The server reacts by:
//! 1. Immediately stopping `listener.accept()`; no new connections are made.
//! 2. Asking every open connection to finish its in-flight requests and
//!    close (HTTP/2 `GOAWAY`, HTTP/1.1 `Connection: close`, HTTP/3 `GOAWAY`).
//! 3. Waiting up to `timeouts.shutdown_grace_secs` for them, then returning
//!    from [`Server::serve`].
//!
//! Keep `shutdown_grace_secs` below `terminationGracePeriodSeconds`.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::middleware;
use crate::request::Request;
use crate::response::Response;
use crate::router::Router;
use crate::status::Status;
use crate::tenant::TenantRegistry;
use crate::tls::{self, SniResolver};

#[cfg(feature = "quic")]
pub mod quic;

/// The TCP front-end (HTTP/1.1 + HTTP/2, optionally over TLS).
pub struct Server {
    config: ServerConfig,
    listener: Option<TcpListener>,
    registry: Option<Arc<TenantRegistry>>,
}

impl Server {
    /// A server with default configuration listening on `addr`.
    ///
    /// The address is validated when [`serve`](Server::serve) is called.
    ///
    /// ```rust,no_run
    /// use portico::Server;
    /// let server = Server::bind("0.0.0.0:3000");
    /// ```
    pub fn bind(addr: &str) -> Self {
        let config = ServerConfig { listen: addr.to_owned(), ..ServerConfig::default() };
        Self::from_config(config)
    }

    /// A server driven entirely by `config`, tenants included.
    pub fn from_config(config: ServerConfig) -> Self {
        Self { config, listener: None, registry: None }
    }

    /// Serves on an already-bound listener; `config.listen` is ignored.
    pub fn from_listener(listener: TcpListener, config: ServerConfig) -> Self {
        Self { config, listener: Some(listener), registry: None }
    }

    /// Uses `registry` instead of a fresh one. Tenants from the
    /// configuration are still registered into it at startup, and the
    /// caller keeps the `Arc` to register more at runtime.
    pub fn with_registry(mut self, registry: Arc<TenantRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Serves `router` until SIGTERM or Ctrl-C, then shuts down gracefully.
    pub async fn serve(self, router: Router) -> Result<(), Error> {
        self.serve_with_shutdown(router, shutdown_signal()).await
    }

    /// Serves `router` until `signal` resolves, then shuts down gracefully.
    ///
    /// With `[hsts] enabled = true` every response on a TLS or QUIC
    /// connection carries `Strict-Transport-Security`.
    pub async fn serve_with_shutdown<F>(self, router: Router, signal: F) -> Result<(), Error>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { config, listener, registry } = self;
        config.validate()?;

        let registry = match registry {
            Some(r) => r,
            None => Arc::new(TenantRegistry::with_matching(config.host_matching)),
        };
        registry.register_config(&config.tenants)?;

        // Outermost, so early rejections from other global middleware carry it too.
        let router = if config.hsts.enabled { router.wrap(middleware::hsts(config.hsts)) } else { router };
        let dispatcher = Dispatcher::new(router, Arc::clone(&registry))
            .with_request_timeout(config.timeouts.request());

        let resolver = if config.tls.is_some() || !registry.tls_hosts().is_empty() {
            Some(Arc::new(SniResolver::from_registry(config.tls.as_ref(), Arc::clone(&registry))?))
        } else {
            None
        };

        if cfg!(not(feature = "quic")) && config.protocols.quic {
            return Err(Error::Quic("built without the `quic` feature".to_owned()));
        }

        // Everything fallible happens before any task is spawned.
        let tcp = if config.protocols.http1 || config.protocols.http2 {
            let listener = match listener {
                Some(l) => l,
                None => TcpListener::bind(&config.listen).await?,
            };
            let acceptor = match &resolver {
                Some(r) => Some(TlsAcceptor::from(Arc::new(tls::server_config(Arc::clone(r), config.protocols)?))),
                None => None,
            };
            Some((listener, acceptor))
        } else {
            None
        };

        let shutdown = CancellationToken::new();

        #[cfg(feature = "quic")]
        let quic_task = match (&resolver, config.protocols.quic) {
            (Some(resolver), true) => {
                let quic = quic::QuicServer::bind(&config, Arc::clone(resolver), dispatcher.clone())?;
                Some(tokio::spawn(quic.serve(shutdown.child_token())))
            }
            _ => None,
        };

        let result = match tcp {
            Some((listener, acceptor)) => {
                let shared = Arc::new(Shared { config, dispatcher });
                accept_loop(listener, acceptor, shared, signal, shutdown.clone()).await
            }
            None => {
                signal.await;
                Ok(())
            }
        };
        shutdown.cancel();

        #[cfg(feature = "quic")]
        if let Some(task) = quic_task {
            match task.await {
                Ok(Err(e)) => error!(error = %e, "quic server failed"),
                Err(e) => error!(error = %e, "quic server task failed"),
                Ok(Ok(())) => {}
            }
        }

        info!("portico stopped");
        result
    }
}

// ── TCP accept loop ───────────────────────────────────────────────────────────

/// State shared by every connection task.
struct Shared {
    config: ServerConfig,
    dispatcher: Dispatcher,
}

async fn accept_loop<F>(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    shared: Arc<Shared>,
    signal: F,
    shutdown: CancellationToken,
) -> Result<(), Error>
where
    F: Future<Output = ()> + Send,
{
    let addr = listener.local_addr()?;
    let protocols = shared.config.protocols;
    info!(
        addr = %addr,
        tls = acceptor.is_some(),
        http1 = protocols.http1,
        http2 = protocols.http2,
        "portico listening"
    );

    let slots = Arc::new(Semaphore::new(shared.config.limits.max_connections));
    let mut tasks = JoinSet::new();

    tokio::pin!(signal);

    loop {
        // Back-pressure: wait for a free slot before accepting.
        let permit = tokio::select! {
            biased;

            () = &mut signal => break,
            permit = Arc::clone(&slots).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        tokio::select! {
            biased;

            () = &mut signal => break,

            res = listener.accept() => {
                let (stream, peer) = match res {
                    Ok(v) => v,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let shared = Arc::clone(&shared);
                let shutdown = shutdown.clone();
                tasks.spawn(async move {
                    handle_stream(stream, peer, acceptor, shared, shutdown).await;
                    drop(permit);
                });
            }

            // Reap finished connection tasks so the JoinSet does not grow
            // without bound on long-running servers.
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
    drop(listener);
    shutdown.cancel();

    let grace = shared.config.timeouts.shutdown_grace();
    let drain = async { while tasks.join_next().await.is_some() {} };
    match grace {
        Some(grace) => {
            if tokio::time::timeout(grace, drain).await.is_err() {
                warn!(remaining = tasks.len(), "shutdown grace period elapsed, aborting connections");
                tasks.abort_all();
            }
        }
        None => drain.await,
    }
    Ok(())
}

async fn handle_stream(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    let _ = stream.set_nodelay(true);
    match acceptor {
        None => serve_io(TokioIo::new(stream), peer, false, shared, shutdown).await,
        Some(acceptor) => {
            let handshake = acceptor.accept(stream);
            let tls = match shared.config.timeouts.read() {
                Some(limit) => match tokio::time::timeout(limit, handshake).await {
                    Ok(res) => res,
                    Err(_) => {
                        debug!(peer = %peer, "tls handshake timed out");
                        return;
                    }
                },
                None => handshake.await,
            };
            match tls {
                Ok(tls) => serve_io(TokioIo::new(tls), peer, true, shared, shutdown).await,
                Err(e) => debug!(peer = %peer, "tls handshake failed: {e}"),
            }
        }
    }
}

/// Drives one connection with hyper until it closes or shutdown finishes it.
async fn serve_io<I>(io: TokioIo<I>, peer: SocketAddr, secure: bool, shared: Arc<Shared>, shutdown: CancellationToken)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let config = &shared.config;
    let mut builder = ConnBuilder::new(TokioExecutor::new());
    if !config.protocols.http2 {
        builder = builder.http1_only();
    } else if !config.protocols.http1 {
        builder = builder.http2_only();
    }
    {
        let mut http1 = builder.http1();
        http1.timer(TokioTimer::new()).max_buf_size(config.limits.buffer_size);
        if let Some(read) = config.timeouts.read() {
            http1.header_read_timeout(read);
        }
    }
    {
        let mut http2 = builder.http2();
        http2
            .timer(TokioTimer::new())
            .max_header_list_size(u32::try_from(config.limits.max_header_size).unwrap_or(u32::MAX));
        if let Some(idle) = config.timeouts.idle() {
            http2.keep_alive_interval(idle);
        }
    }

    let svc_shared = Arc::clone(&shared);
    let svc = service_fn(move |req: hyper::Request<Incoming>| {
        let shared = Arc::clone(&svc_shared);
        async move { Ok::<_, Infallible>(shared.handle(req, peer, secure).await) }
    });

    let conn = builder.serve_connection(io, svc);
    tokio::pin!(conn);

    let res = tokio::select! {
        res = conn.as_mut() => res,
        () = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(e) = res {
        debug!(peer = %peer, "connection error: {e}");
    }
}

impl Shared {
    /// Collects the body within the configured limit and dispatches.
    async fn handle(&self, req: hyper::Request<Incoming>, peer: SocketAddr, secure: bool) -> http::Response<Full<Bytes>> {
        let (parts, body) = req.into_parts();
        let body = match Limited::new(body, self.config.limits.max_body_size).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                debug!(peer = %peer, path = %parts.uri.path(), "request body over limit");
                return Response::status(Status::ContentTooLarge).into_http();
            }
            Err(e) => {
                debug!(peer = %peer, "failed to read request body: {e}");
                return Response::status(Status::BadRequest).into_http();
            }
        };

        let request = Request::from(http::Request::from_parts(parts, body)).with_peer(peer, secure);
        // Dropped by hyper when the client goes away; the dispatcher then
        // cancels the token.
        self.dispatcher.dispatch(request, CancellationToken::new()).await.into_http()
    }
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first shutdown signal the process receives.
///
/// On Unix this listens for both **SIGTERM** (sent by `kubectl` and the
/// Kubernetes control plane) and **SIGINT** (Ctrl-C, for local dev).
/// On Windows only Ctrl-C is available. A signal that cannot be installed is
/// logged and never fires.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    // `pending()` is a future that never resolves; on non-Unix platforms
    // the SIGTERM arm is effectively disabled.
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}
