//! DNS and HTTP servers bound to simulated stacks.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use base64::Engine as _;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;

use crate::dns::DnsHandler;
use crate::error::NetemError;
use crate::stack::{Stack, TcpListener, TcpStream};

pub const DNS_PORT: u16 = 53;
pub const DOT_PORT: u16 = 853;
pub const HTTP_PORT: u16 = 80;
pub const HTTPS_PORT: u16 = 443;
pub const DOH_PATH: &str = "/dns-query";
pub const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

/// Body served by [`default_http_router`].
pub const DEFAULT_HTTP_BODY: &str = "<!doctype html>\n<html>\n<head><title>Default Web Page</title></head>\n<body>\n<p>Hello, world!</p>\n</body>\n</html>\n";

const MAX_UDP_MESSAGE: usize = 65_535;

/// A running server task. Dropping the handle aborts the task; [`ServerHandle::shutdown`] stops
/// it and waits for it to exit.
pub struct ServerHandle {
    addr: SocketAddr,
    protocol: &'static str,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Short protocol label such as `udp`, `tcp`, `dot`, `doh`, `http` or `https`.
    pub fn protocol(&self) -> &'static str {
        self.protocol
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("addr", &self.addr)
            .field("protocol", &self.protocol)
            .finish()
    }
}

/// Serve DNS over UDP on `addr`.
pub fn serve_dns_udp(
    stack: &Stack,
    addr: SocketAddr,
    handler: Arc<dyn DnsHandler>,
) -> Result<ServerHandle, NetemError> {
    let socket = stack.bind_udp(addr)?;
    let local = socket.local_addr();
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_UDP_MESSAGE];
        loop {
            let (n, peer) = tokio::select! {
                _ = &mut shutdown_rx => break,
                res = socket.recv_from(&mut buf) => match res {
                    Ok(received) => received,
                    Err(err) => {
                        tracing::debug!(%local, %err, "dns/udp server stopped");
                        break;
                    }
                },
            };
            let Some(response) = handler.handle(&buf[..n]) else {
                continue;
            };
            if let Err(err) = socket.send_to(&response, peer).await {
                tracing::debug!(%local, %peer, %err, "dns/udp reply failed");
            }
        }
    });

    tracing::debug!(addr = %local, "dns/udp server listening");
    Ok(ServerHandle {
        addr: local,
        protocol: "udp",
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}

/// Serve DNS over TCP on `addr` using two-byte length framing (RFC 1035 4.2.2).
pub fn serve_dns_tcp(
    stack: &Stack,
    addr: SocketAddr,
    handler: Arc<dyn DnsHandler>,
) -> Result<ServerHandle, NetemError> {
    let listener = stack.listen_tcp(addr)?;
    Ok(spawn_acceptor(listener, "tcp", move |stream, peer| {
        let handler = Arc::clone(&handler);
        async move {
            if let Err(err) = serve_dns_stream(stream, handler).await {
                tracing::debug!(%peer, %err, "dns/tcp connection failed");
            }
        }
    }))
}

/// Serve DNS over TLS on `addr`.
pub fn serve_dns_tls(
    stack: &Stack,
    addr: SocketAddr,
    handler: Arc<dyn DnsHandler>,
    tls: Arc<ServerConfig>,
) -> Result<ServerHandle, NetemError> {
    let listener = stack.listen_tcp(addr)?;
    let acceptor = TlsAcceptor::from(tls);
    Ok(spawn_acceptor(listener, "dot", move |stream, peer| {
        let handler = Arc::clone(&handler);
        let acceptor = acceptor.clone();
        async move {
            let result = match acceptor.accept(stream).await {
                Ok(tls) => serve_dns_stream(tls, handler).await,
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                tracing::debug!(%peer, %err, "dns/tls connection failed");
            }
        }
    }))
}

/// Serve `router` over HTTP, or HTTPS when `tls` is set.
///
/// Connections negotiate HTTP/1.1 or HTTP/2 (via ALPN under TLS, via the connection preface
/// otherwise).
pub fn serve_http(
    stack: &Stack,
    addr: SocketAddr,
    router: Router,
    tls: Option<Arc<ServerConfig>>,
) -> Result<ServerHandle, NetemError> {
    let listener = stack.listen_tcp(addr)?;
    let handle = match tls {
        None => spawn_acceptor(listener, "http", move |stream, peer| {
            serve_http_conn(stream, peer, router.clone())
        }),
        Some(tls) => {
            let acceptor = TlsAcceptor::from(tls);
            spawn_acceptor(listener, "https", move |stream, peer| {
                let router = router.clone();
                let acceptor = acceptor.clone();
                async move {
                    match acceptor.accept(stream).await {
                        Ok(tls) => serve_http_conn(tls, peer, router).await,
                        Err(err) => tracing::debug!(%peer, %err, "tls handshake failed"),
                    }
                }
            })
        }
    };
    Ok(handle)
}

/// Router answering DNS-over-HTTPS requests (RFC 8484) at [`DOH_PATH`].
pub fn doh_router(handler: Arc<dyn DnsHandler>) -> Router {
    Router::new()
        .route(DOH_PATH, get(doh_get).post(doh_post))
        .with_state(handler)
}

/// Router serving [`DEFAULT_HTTP_BODY`] for every path.
pub fn default_http_router() -> Router {
    Router::new().fallback(default_page)
}

fn spawn_acceptor<F, Fut>(mut listener: TcpListener, protocol: &'static str, serve: F) -> ServerHandle
where
    F: Fn(TcpStream, SocketAddr) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let local = listener.local_addr();
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        let mut conns = JoinSet::new();
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                res = listener.accept() => match res {
                    Ok((stream, peer)) => {
                        tracing::trace!(%local, %peer, protocol, "accepted connection");
                        conns.spawn(serve(stream, peer));
                    }
                    Err(err) => {
                        tracing::debug!(%local, %err, protocol, "listener stopped");
                        break;
                    }
                },
                Some(_) = conns.join_next(), if !conns.is_empty() => {}
            }
        }
        conns.shutdown().await;
    });

    tracing::debug!(addr = %local, protocol, "server listening");
    ServerHandle {
        addr: local,
        protocol,
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    }
}

async fn serve_dns_stream<S>(mut io: S, handler: Arc<dyn DnsHandler>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let len = match io.read_u16().await {
            Ok(len) => len as usize,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err),
        };
        let mut query = vec![0u8; len];
        io.read_exact(&mut query).await?;

        let Some(response) = handler.handle(&query) else {
            continue;
        };
        let len = u16::try_from(response.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "DNS response too large"))?;
        io.write_u16(len).await?;
        io.write_all(&response).await?;
        io.flush().await?;
    }
}

async fn serve_http_conn<I>(io: I, peer: SocketAddr, router: Router)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let builder = auto::Builder::new(TokioExecutor::new());
    let service = TowerToHyperService::new(router);
    if let Err(err) = builder.serve_connection(TokioIo::new(io), service).await {
        tracing::debug!(%peer, %err, "http connection failed");
    }
}

async fn default_page() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        DEFAULT_HTTP_BODY,
    )
}

async fn doh_get(State(handler): State<Arc<dyn DnsHandler>>, uri: Uri) -> Response {
    let Some(encoded) = dns_param_from_query(&uri) else {
        return (StatusCode::BAD_REQUEST, "missing dns parameter").into_response();
    };
    let Ok(query) = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(encoded.trim_end_matches('='))
    else {
        return (StatusCode::BAD_REQUEST, "invalid dns parameter").into_response();
    };
    dns_message_response(handler.as_ref(), &query)
}

async fn doh_post(
    State(handler): State<Arc<dyn DnsHandler>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::trim);
    if content_type != Some(DNS_MESSAGE_CONTENT_TYPE) {
        return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
    }
    dns_message_response(handler.as_ref(), &body)
}

fn dns_message_response(handler: &dyn DnsHandler, query: &[u8]) -> Response {
    match handler.handle(query) {
        Some(response) => (
            [(header::CONTENT_TYPE, DNS_MESSAGE_CONTENT_TYPE)],
            response,
        )
            .into_response(),
        None => (StatusCode::BAD_REQUEST, "unanswerable DNS query").into_response(),
    }
}

fn dns_param_from_query(uri: &Uri) -> Option<&str> {
    let query = uri.query()?;
    for part in query.split('&') {
        let (k, v) = part.split_once('=').unwrap_or((part, ""));
        if k == "dns" {
            return (!v.is_empty()).then_some(v);
        }
    }
    None
}
