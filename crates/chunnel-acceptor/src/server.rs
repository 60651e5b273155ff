//! Acceptor server implementation

use bytes::Bytes;
use chunnel_proto::{FrameDecoder, Handshake, TokenMatcher};
use chunnel_router::RouteTable;
use chunnel_session::{relay, Session, SessionError, SessionId, SessionIdGenerator, SessionState};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{header, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default HTTP bind address.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Error)]
pub enum AcceptorError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}")]
    BindError { address: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct AcceptorConfig {
    /// HTTP listen address.
    pub bind_addr: SocketAddr,
    /// Request path -> backend address map.
    pub routes: RouteTable,
    /// Trusted inbound header carrying the client address, for
    /// deployments behind a reverse proxy that sets it.
    pub address_header: Option<String>,
    pub handshake: Handshake,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.parse().unwrap(),
            routes: RouteTable::defaults(),
            address_header: Some("client_ip".to_string()),
            handshake: Handshake::default(),
        }
    }
}

type ResponseBody = BoxBody<Bytes, Infallible>;

pub struct AcceptorServer {
    listener: TcpListener,
    config: Arc<AcceptorConfig>,
    session_ids: SessionIdGenerator,
}

impl AcceptorServer {
    /// Bind the HTTP listener. Bind failures are fatal to the process.
    pub async fn bind(config: AcceptorConfig) -> Result<Self, AcceptorError> {
        let listener = TcpListener::bind(config.bind_addr).await.map_err(|e| {
            AcceptorError::BindError {
                address: config.bind_addr.to_string(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            listener,
            config: Arc::new(config),
            session_ids: SessionIdGenerator::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. Long-lived connections are expected, so no
    /// per-connection timeouts are applied.
    pub async fn run(self) -> Result<(), AcceptorError> {
        info!("HTTP {} -> TCP", self.listener.local_addr()?);

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let config = self.config.clone();
                    let session_ids = self.session_ids.clone();

                    tokio::spawn(async move {
                        serve_connection(stream, peer_addr, config, session_ids).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept HTTP connection: {}", e);
                }
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<AcceptorConfig>,
    session_ids: SessionIdGenerator,
) {
    debug!("New HTTP connection from {}", peer_addr);

    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let config = config.clone();
        let session_ids = session_ids.clone();
        async move { handle_request(req, peer_addr, config, session_ids).await }
    });

    if let Err(e) = hyper::server::conn::http1::Builder::new()
        .keep_alive(true)
        .header_read_timeout(None::<Duration>)
        .serve_connection(io, service)
        .await
    {
        debug!("HTTP connection error from {}: {}", peer_addr, e);
    }
}

fn status_response(status: StatusCode) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .body(Empty::<Bytes>::new().boxed())
        .unwrap()
}

/// Admission and session setup for one tunnel request. Transport
/// precondition and route resolution happen before any session
/// resources are allocated.
async fn handle_request(
    req: Request<Incoming>,
    peer_addr: SocketAddr,
    config: Arc<AcceptorConfig>,
    session_ids: SessionIdGenerator,
) -> Result<Response<ResponseBody>, Infallible> {
    let path = req.uri().path().to_string();
    let client_addr = apparent_client_addr(&req, peer_addr, config.address_header.as_deref());
    let id = session_ids.generate();
    let identity = format!("{},{}", client_addr, id);

    if !relay::is_chunked(req.headers()) {
        warn!("Not chunked: {} {}", identity, path);
        return Ok(status_response(StatusCode::FORBIDDEN));
    }

    let target = match config.routes.lookup(&path) {
        Ok(target) => target.to_string(),
        Err(_) => {
            warn!("Not found: {} {}", identity, path);
            return Ok(status_response(StatusCode::NOT_FOUND));
        }
    };

    let local_hint = rewrite_source_addr(&client_addr);
    let handshake = config.handshake.clone();
    let body = req.into_body();

    let (body_tx, body_rx) = mpsc::channel(relay::BODY_CHANNEL_CAPACITY);
    let resp_body = StreamBody::new(ReceiverStream::new(body_rx)).boxed();

    info!("Connected: {} {}", identity, path);
    tokio::spawn(async move {
        if let Err(e) = drive_session(body, body_tx, target, local_hint, handshake, id, identity).await
        {
            if !e.is_disconnect() {
                debug!("Session {} ended: {}", id, e);
            }
        }
    });

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONNECTION, "keep-alive")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::TRANSFER_ENCODING, "chunked")
        .body(resp_body)
        .unwrap();
    Ok(response)
}

/// Drive one admitted session: verify the client token, confirm with
/// the server token, connect the backend, then relay both directions.
async fn drive_session(
    mut body: Incoming,
    body_tx: relay::BodySender,
    target: String,
    local_hint: Option<Ipv4Addr>,
    handshake: Handshake,
    id: SessionId,
    identity: String,
) -> Result<(), SessionError> {
    let mut session = Session::new(id);
    session.transition(SessionState::Handshaking);

    let cancel = CancellationToken::new();
    let matcher = TokenMatcher::new(handshake.client.clone());
    let remainder = match relay::await_token(&mut body, matcher, &cancel).await {
        Ok(r) => r,
        Err(e) => {
            warn!("Handshake failed: {}", identity);
            session.fail();
            return Err(e);
        }
    };

    // Confirm the channel before touching the backend; the backend
    // connection is only attempted for authenticated peers.
    relay::send_chunk(&body_tx, handshake.server.clone()).await?;

    let backend = match connect_backend(&target, local_hint).await {
        Ok(s) => s,
        Err(e) => {
            warn!("Error (tcp): {} ({})", identity, e);
            session.fail();
            return Err(e);
        }
    };

    info!("Handshaked: {}", identity);
    session.transition(SessionState::Relaying);

    let (backend_rd, backend_wr) = backend.into_split();
    let mut uplink = tokio::spawn(relay::copy_tcp_to_body(
        backend_rd,
        body_tx,
        id,
        cancel.clone(),
    ));
    let mut downlink = tokio::spawn(relay::copy_body_to_tcp(
        body,
        backend_wr,
        FrameDecoder::new(),
        remainder,
        id,
        cancel.clone(),
    ));

    let result = tokio::select! {
        res = &mut uplink => {
            cancel.cancel();
            let _ = downlink.await;
            info!("Disconnected (tcp): {}", identity);
            res
        }
        res = &mut downlink => {
            cancel.cancel();
            let _ = uplink.await;
            info!("Disconnected (http): {}", identity);
            res
        }
    };

    match result {
        Ok(Ok(())) => {
            session.close();
            Ok(())
        }
        Ok(Err(e)) if e.is_disconnect() => {
            session.close();
            Ok(())
        }
        Ok(Err(e)) => {
            if matches!(e, SessionError::BadPacket(_)) {
                warn!("Bad packet: {}", identity);
            }
            session.fail();
            Err(e)
        }
        Err(join_err) => {
            error!("Session {} task failed: {}", id, join_err);
            session.fail();
            Ok(())
        }
    }
}

/// The client address this session is attributed to: the trusted
/// header if configured and present, else the socket peer address.
fn apparent_client_addr(
    req: &Request<Incoming>,
    peer_addr: SocketAddr,
    header_name: Option<&str>,
) -> String {
    header_name
        .and_then(|name| req.headers().get(name))
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| peer_addr.ip().to_string())
}

/// Map the client's IPv4 address into 127.0.0.0/8 for use as the
/// backend connection's local source address, so network-level tools
/// on the backend (e.g. login-attempt guards) can key off client
/// locality. Best-effort: non-IPv4 input yields no hint.
fn rewrite_source_addr(client_addr: &str) -> Option<Ipv4Addr> {
    let ip: Ipv4Addr = client_addr.parse().ok()?;
    let [a, b, c, _] = ip.octets();
    Some(Ipv4Addr::new(127, a, b, c))
}

/// Connect to the backend, applying the source-address hint when one
/// is available. A hint that cannot be bound falls back silently to
/// an ordinary connect.
async fn connect_backend(
    target: &str,
    local_hint: Option<Ipv4Addr>,
) -> Result<TcpStream, SessionError> {
    if let Some(ip) = local_hint {
        if let Some(addr) = tokio::net::lookup_host(target)
            .await?
            .find(SocketAddr::is_ipv4)
        {
            if let Ok(socket) = TcpSocket::new_v4() {
                if socket.bind(SocketAddr::new(IpAddr::V4(ip), 0)).is_ok() {
                    debug!("Connecting to {} from {}", target, ip);
                    return Ok(socket.connect(addr).await?);
                }
                debug!("Source address {} not bindable; connecting directly", ip);
            }
        }
    }
    Ok(TcpStream::connect(target).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_source_addr() {
        assert_eq!(
            rewrite_source_addr("10.1.2.3"),
            Some(Ipv4Addr::new(127, 10, 1, 2))
        );
        assert_eq!(
            rewrite_source_addr("192.168.0.77"),
            Some(Ipv4Addr::new(127, 192, 168, 0))
        );
    }

    #[test]
    fn test_rewrite_skips_non_ipv4() {
        assert_eq!(rewrite_source_addr("::1"), None);
        assert_eq!(rewrite_source_addr("not-an-address"), None);
        assert_eq!(rewrite_source_addr(""), None);
    }

    #[test]
    fn test_default_config() {
        let config = AcceptorConfig::default();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.address_header.as_deref(), Some("client_ip"));
        assert!(!config.routes.is_empty());
    }

    #[tokio::test]
    async fn test_bind_reports_local_addr() {
        let config = AcceptorConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = AcceptorServer::bind(config).await.unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }
}
