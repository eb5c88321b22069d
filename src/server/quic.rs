//! HTTP/3 over QUIC.
//!
//! One task per QUIC connection, one task per request stream. Each
//! connection owns a cancellation token; every request on it gets a child
//! token, so a closed connection cancels all of its in-flight requests.
//! Server shutdown only sends `GOAWAY`: accepted requests run to completion
//! unless the peer goes away first.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use h3::server::RequestStream;
use h3_quinn::BidiStream;
use quinn::crypto::rustls::QuicServerConfig;
use quinn::{Endpoint, IdleTimeout, TransportConfig, VarInt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::request::Request;
use crate::response::Response;
use crate::status::Status;
use crate::tls::{self, SniResolver};

type Stream = RequestStream<BidiStream<Bytes>, Bytes>;

/// The QUIC front-end.
pub struct QuicServer {
    endpoint: Endpoint,
    dispatcher: Dispatcher,
    max_body_size: usize,
    enable_0rtt: bool,
    grace: Option<Duration>,
}

impl QuicServer {
    /// Binds the UDP socket (`quic.listen`, else `listen`). Must be called
    /// from within a tokio runtime.
    pub fn bind(config: &ServerConfig, resolver: Arc<SniResolver>, dispatcher: Dispatcher) -> Result<Self, Error> {
        let addr: SocketAddr = config
            .quic
            .listen
            .as_deref()
            .unwrap_or(&config.listen)
            .parse()
            .map_err(|e| Error::Quic(format!("invalid quic listen address: {e}")))?;

        let crypto = tls::quic_server_config(resolver, config.quic.enable_0rtt)?;
        let crypto = QuicServerConfig::try_from(crypto).map_err(|e| Error::Quic(e.to_string()))?;

        let mut transport = TransportConfig::default();
        transport.max_concurrent_bidi_streams(VarInt::from_u32(config.quic.max_concurrent_streams));
        if let Some(idle) = config.timeouts.idle() {
            let idle = IdleTimeout::try_from(idle).map_err(|e| Error::Quic(e.to_string()))?;
            transport.max_idle_timeout(Some(idle));
        }

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        server_config.transport_config(Arc::new(transport));

        let endpoint = Endpoint::server(server_config, addr)?;
        Ok(Self {
            endpoint,
            dispatcher,
            max_body_size: config.limits.max_body_size,
            enable_0rtt: config.quic.enable_0rtt,
            grace: config.timeouts.shutdown_grace(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Accepts connections until `shutdown` is cancelled, then sends
    /// `GOAWAY` on every connection and waits for them to drain.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), Error> {
        info!(addr = %self.local_addr()?, zero_rtt = self.enable_0rtt, "portico listening (h3)");
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,

                incoming = self.endpoint.accept() => {
                    let Some(incoming) = incoming else { break };
                    let dispatcher = self.dispatcher.clone();
                    let shutdown = shutdown.clone();
                    let max_body = self.max_body_size;
                    let zero_rtt = self.enable_0rtt;
                    connections.spawn(async move {
                        let peer = incoming.remote_address();
                        let connecting = match incoming.accept() {
                            Ok(c) => c,
                            Err(e) => {
                                debug!(peer = %peer, "quic accept failed: {e}");
                                return;
                            }
                        };
                        let conn = if zero_rtt {
                            match connecting.into_0rtt() {
                                Ok((conn, _)) => conn,
                                Err(connecting) => match connecting.await {
                                    Ok(conn) => conn,
                                    Err(e) => {
                                        debug!(peer = %peer, "quic handshake failed: {e}");
                                        return;
                                    }
                                },
                            }
                        } else {
                            match connecting.await {
                                Ok(conn) => conn,
                                Err(e) => {
                                    debug!(peer = %peer, "quic handshake failed: {e}");
                                    return;
                                }
                            }
                        };
                        serve_connection(conn, peer, dispatcher, max_body, shutdown).await;
                    });
                }

                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        info!(in_flight = connections.len(), "draining quic connections");
        let drain = async { while connections.join_next().await.is_some() {} };
        match self.grace {
            Some(grace) => {
                if tokio::time::timeout(grace, drain).await.is_err() {
                    warn!(remaining = connections.len(), "quic grace period elapsed, closing");
                    connections.abort_all();
                }
            }
            None => drain.await,
        }
        self.endpoint.close(VarInt::from_u32(0), b"shutdown");
        self.endpoint.wait_idle().await;
        Ok(())
    }
}

async fn serve_connection(
    conn: quinn::Connection,
    peer: SocketAddr,
    dispatcher: Dispatcher,
    max_body: usize,
    shutdown: CancellationToken,
) {
    let token = CancellationToken::new();
    let _cancel_on_exit = token.clone().drop_guard();

    let watched = conn.clone();
    let closed = watched.closed();
    tokio::pin!(closed);

    let mut h3_conn = match h3::server::Connection::<_, Bytes>::new(h3_quinn::Connection::new(conn)).await {
        Ok(c) => c,
        Err(e) => {
            debug!(peer = %peer, "h3 setup failed: {e}");
            return;
        }
    };

    let mut requests = JoinSet::new();
    let mut gone = false;
    loop {
        tokio::select! {
            biased;

            reason = &mut closed => {
                debug!(peer = %peer, "quic connection closed: {reason}");
                gone = true;
                break;
            }

            () = shutdown.cancelled() => {
                // GOAWAY: finish what was accepted, refuse new streams.
                if let Err(e) = h3_conn.shutdown(requests.len()).await {
                    debug!(peer = %peer, "h3 goaway failed: {e}");
                }
                break;
            }

            accepted = h3_conn.accept() => match accepted {
                Ok(Some((req, stream))) => {
                    let dispatcher = dispatcher.clone();
                    let req_token = token.child_token();
                    requests.spawn(handle_request(req, stream, peer, dispatcher, max_body, req_token));
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(peer = %peer, "h3 connection closed: {e}");
                    gone = true;
                    break;
                }
            },

            Some(_) = requests.join_next(), if !requests.is_empty() => {}
        }
    }

    if !gone {
        // The peer can still vanish while accepted requests finish.
        let drain = async { while requests.join_next().await.is_some() {} };
        tokio::select! {
            () = drain => return,
            reason = &mut closed => debug!(peer = %peer, "quic connection closed while draining: {reason}"),
        }
    }
    token.cancel();
    while requests.join_next().await.is_some() {}
}

async fn handle_request(
    req: http::Request<()>,
    mut stream: Stream,
    peer: SocketAddr,
    dispatcher: Dispatcher,
    max_body: usize,
    token: CancellationToken,
) {
    let is_head = req.method() == http::Method::HEAD;
    let res = match read_body(&mut stream, max_body).await {
        Ok(Some(body)) => {
            let (mut parts, ()) = req.into_parts();
            parts.version = http::Version::HTTP_3;
            let request = Request::from(http::Request::from_parts(parts, body)).with_peer(peer, true);
            dispatcher.dispatch(request, token).await
        }
        Ok(None) => Response::status(Status::ContentTooLarge),
        Err(e) => {
            debug!(peer = %peer, "h3 request body failed: {e}");
            return;
        }
    };

    let (head, body) = res.into_head_and_body();
    let sent = async {
        stream.send_response(head).await?;
        if !is_head && !body.is_empty() {
            stream.send_data(body).await?;
        }
        stream.finish().await
    };
    if let Err(e) = sent.await {
        debug!(peer = %peer, "h3 response failed: {e}");
    }
}

/// Collects the request body. `Ok(None)` when it exceeds `max`.
async fn read_body(stream: &mut Stream, max: usize) -> Result<Option<Bytes>, h3::Error> {
    let mut body = BytesMut::new();
    while let Some(mut chunk) = stream.recv_data().await? {
        if body.len() + chunk.remaining() > max {
            return Ok(None);
        }
        while chunk.has_remaining() {
            let part = chunk.chunk();
            body.extend_from_slice(part);
            let n = part.len();
            chunk.advance(n);
        }
    }
    Ok(Some(body.freeze()))
}
