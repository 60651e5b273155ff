//! Initiator server implementation

use chunnel_proto::{FrameDecoder, Handshake, TokenMatcher};
use chunnel_session::{relay, Session, SessionError, SessionId, SessionIdGenerator, SessionState};
use http_body_util::StreamBody;
use hyper::client::conn::http1;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

/// Default local bind address.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8124";

#[derive(Debug, Error)]
pub enum InitiatorError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("invalid remote URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Failed to bind to {address}: {reason}")]
    BindError { address: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct InitiatorConfig {
    /// Local TCP listen address.
    pub bind_addr: SocketAddr,
    /// Remote acceptor endpoint, e.g. `http://relay:8080/ssh`.
    pub remote_url: Url,
    pub handshake: Handshake,
}

/// Remote endpoint details derived from the configured URL once at
/// startup, so sessions never re-parse it.
#[derive(Debug)]
struct RemoteEndpoint {
    /// `host:port` to TCP-connect to.
    addr: String,
    host_header: String,
    path_and_query: String,
}

impl RemoteEndpoint {
    fn from_url(url: &Url) -> Result<Self, InitiatorError> {
        let invalid = |reason: &str| InitiatorError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        if url.scheme() != "http" {
            return Err(invalid("only http URLs are supported"));
        }
        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
        let port = url.port().unwrap_or(80);

        let mut path_and_query = url.path().to_string();
        if let Some(query) = url.query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }

        let host_header = if port == 80 {
            host.to_string()
        } else {
            format!("{}:{}", host, port)
        };

        Ok(Self {
            addr: format!("{}:{}", host, port),
            host_header,
            path_and_query,
        })
    }
}

/// Shared per-listener context handed to every session task.
struct SessionContext {
    remote: RemoteEndpoint,
    handshake: Handshake,
}

type RequestBody = StreamBody<ReceiverStream<Result<relay::BodyFrame, Infallible>>>;

pub struct InitiatorServer {
    listener: TcpListener,
    context: Arc<SessionContext>,
    remote_url: Url,
    session_ids: SessionIdGenerator,
}

impl InitiatorServer {
    /// Bind the local TCP listener. Bind failures are fatal to the
    /// process; there is no recovery path for a taken listen address.
    pub async fn bind(config: InitiatorConfig) -> Result<Self, InitiatorError> {
        let remote = RemoteEndpoint::from_url(&config.remote_url)?;

        let listener = TcpListener::bind(config.bind_addr).await.map_err(|e| {
            InitiatorError::BindError {
                address: config.bind_addr.to_string(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            listener,
            context: Arc::new(SessionContext {
                remote,
                handshake: config.handshake,
            }),
            remote_url: config.remote_url,
            session_ids: SessionIdGenerator::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. Each connection becomes one independent session;
    /// accept errors are logged and survived.
    pub async fn run(self) -> Result<(), InitiatorError> {
        info!(
            "TCP {} -> HTTP {}",
            self.listener.local_addr()?,
            self.remote_url
        );

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let id = self.session_ids.generate();
                    let context = self.context.clone();

                    debug!("New TCP connection from {} (session {})", peer_addr, id);
                    tokio::spawn(async move {
                        if let Err(e) = drive_session(stream, context, id).await {
                            if !e.is_disconnect() {
                                debug!("Session {} ended: {}", id, e);
                            }
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept TCP connection: {}", e);
                }
            }
        }
    }
}

/// Drive one session: open the outbound request, exchange handshake
/// tokens, then relay both directions until either side closes.
async fn drive_session(
    conn: TcpStream,
    ctx: Arc<SessionContext>,
    id: SessionId,
) -> Result<(), SessionError> {
    let mut session = Session::new(id);
    info!("Connected: {}", id);

    let stream = match TcpStream::connect(&ctx.remote.addr).await {
        Ok(s) => s,
        Err(e) => {
            warn!("Connect failed (http): {} ({})", id, e);
            session.fail();
            return Err(e.into());
        }
    };

    let io = TokioIo::new(stream);
    let (mut sender, http_conn) = http1::handshake::<_, RequestBody>(io).await?;
    tokio::spawn(async move {
        if let Err(e) = http_conn.await {
            debug!("HTTP connection closed (session {}): {}", id, e);
        }
    });

    let (body_tx, body_rx) = mpsc::channel(relay::BODY_CHANNEL_CAPACITY);
    let body = StreamBody::new(ReceiverStream::new(body_rx));

    let request = Request::builder()
        .method(Method::PUT)
        .uri(ctx.remote.path_and_query.as_str())
        .header(hyper::header::HOST, ctx.remote.host_header.as_str())
        .body(body)?;

    // The client token goes out optimistically, before the remote has
    // confirmed anything.
    relay::send_chunk(&body_tx, ctx.handshake.client.clone()).await?;

    let response = match sender.send_request(request).await {
        Ok(r) => r,
        Err(e) => {
            warn!("Connect failed (http): {} ({})", id, e);
            session.fail();
            return Err(e.into());
        }
    };

    if !relay::is_chunked(response.headers()) {
        warn!("Not chunked: {}", id);
        session.fail();
        return Err(SessionError::NotChunked);
    }

    session.transition(SessionState::Handshaking);
    let mut resp_body = response.into_body();
    let cancel = CancellationToken::new();

    let matcher = TokenMatcher::new(ctx.handshake.server.clone());
    let remainder = match relay::await_token(&mut resp_body, matcher, &cancel).await {
        Ok(r) => r,
        Err(e) => {
            warn!("Handshake failed: {}", id);
            session.fail();
            return Err(e);
        }
    };

    info!("Handshaked: {}", id);
    session.transition(SessionState::Relaying);

    let (tcp_rd, tcp_wr) = conn.into_split();
    let mut uplink = tokio::spawn(relay::copy_tcp_to_body(
        tcp_rd,
        body_tx,
        id,
        cancel.clone(),
    ));
    let mut downlink = tokio::spawn(relay::copy_body_to_tcp(
        resp_body,
        tcp_wr,
        FrameDecoder::new(),
        remainder,
        id,
        cancel.clone(),
    ));

    // Whichever direction ends first tears down the other.
    let result = tokio::select! {
        res = &mut uplink => {
            cancel.cancel();
            let _ = downlink.await;
            info!("Disconnected (tcp): {}", id);
            res
        }
        res = &mut downlink => {
            cancel.cancel();
            let _ = uplink.await;
            info!("Disconnected (http): {}", id);
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
                warn!("Bad packet: {}", id);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_endpoint_from_url() {
        let url = Url::parse("http://relay.example:8080/ssh").unwrap();
        let remote = RemoteEndpoint::from_url(&url).unwrap();
        assert_eq!(remote.addr, "relay.example:8080");
        assert_eq!(remote.host_header, "relay.example:8080");
        assert_eq!(remote.path_and_query, "/ssh");
    }

    #[test]
    fn test_remote_endpoint_default_port() {
        let url = Url::parse("http://relay.example/web?x=1").unwrap();
        let remote = RemoteEndpoint::from_url(&url).unwrap();
        assert_eq!(remote.addr, "relay.example:80");
        assert_eq!(remote.host_header, "relay.example");
        assert_eq!(remote.path_and_query, "/web?x=1");
    }

    #[test]
    fn test_remote_endpoint_rejects_https() {
        let url = Url::parse("https://relay.example/ssh").unwrap();
        assert!(matches!(
            RemoteEndpoint::from_url(&url),
            Err(InitiatorError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn test_bind_reports_local_addr() {
        let config = InitiatorConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            remote_url: Url::parse("http://127.0.0.1:8080/ssh").unwrap(),
            handshake: Handshake::default(),
        };
        let server = InitiatorServer::bind(config).await.unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }
}
