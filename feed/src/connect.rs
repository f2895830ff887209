use crate::adapter::AdapterError;

use bytes::Bytes;
use fastwebsockets::FragmentCollector;
use http_body_util::Empty;
use hyper::{
    Request,
    header::{CONNECTION, UPGRADE},
    upgrade::Upgraded,
};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio_rustls::{
    TlsConnector,
    rustls::{ClientConfig, OwnedTrustAnchor},
};
use url::Url;

use std::{sync::LazyLock, time::Duration};

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const WS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Maximum idle time before considering a WebSocket connection dead.
/// The simulator pushes a reading every few seconds; 45s detects half-open TCP
/// (e.g. after laptop sleep) within one minute without false positives on idle sensors.
pub const WS_READ_TIMEOUT: Duration = Duration::from_secs(45);

pub type WebSocket = FragmentCollector<TokioIo<Upgraded>>;

pub static TLS_CONNECTOR: LazyLock<Result<TlsConnector, AdapterError>> =
    LazyLock::new(tls_connector);

fn tls_connector() -> Result<TlsConnector, AdapterError> {
    let mut root_store = tokio_rustls::rustls::RootCertStore::empty();

    root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(std::sync::Arc::new(config)))
}

/// WebSocket close status as carried by a close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    /// Intentional shutdown: never triggers a reconnect.
    pub const NORMAL: CloseCode = CloseCode(1000);
    pub const GOING_AWAY: CloseCode = CloseCode(1001);
    /// No close frame was received (transport failure, timeout, refused connect).
    pub const ABNORMAL: CloseCode = CloseCode(1006);

    pub fn is_intentional(&self) -> bool {
        *self == CloseCode::NORMAL
    }

    /// Reads the status code from a close frame payload. An empty payload means
    /// the peer closed without a status, which RFC 6455 reports as 1005.
    pub fn from_payload(payload: &[u8]) -> Self {
        match payload {
            [hi, lo, ..] => CloseCode(u16::from_be_bytes([*hi, *lo])),
            _ => CloseCode(1005),
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub enum State {
    Disconnected,
    Connected(WebSocket),
}

pub async fn connect_ws(url: &Url) -> Result<WebSocket, AdapterError> {
    let domain = url
        .host_str()
        .ok_or_else(|| AdapterError::InvalidRequest("Missing host in websocket URL".to_string()))?;

    let target_port = url.port_or_known_default().ok_or_else(|| {
        AdapterError::InvalidRequest("Missing port for websocket URL".to_string())
    })?;

    let stream = setup_tcp(domain, target_port).await?;

    match url.scheme() {
        "wss" => {
            let tls_stream =
                tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, upgrade_to_tls(domain, stream))
                    .await
                    .map_err(|_| {
                        AdapterError::WebsocketError(
                            "TLS handshake to target timed out".to_string(),
                        )
                    })??;

            tokio::time::timeout(
                WS_HANDSHAKE_TIMEOUT,
                upgrade_to_websocket(domain, tls_stream, url),
            )
            .await
            .map_err(|_| {
                AdapterError::WebsocketError("WebSocket handshake timed out".to_string())
            })?
        }
        "ws" => tokio::time::timeout(
            WS_HANDSHAKE_TIMEOUT,
            upgrade_to_websocket(domain, stream, url),
        )
        .await
        .map_err(|_| AdapterError::WebsocketError("WebSocket handshake timed out".to_string()))?,
        _ => Err(AdapterError::InvalidRequest(
            "Invalid scheme for websocket URL".to_string(),
        )),
    }
}

async fn setup_tcp(domain: &str, target_port: u16) -> Result<tokio::net::TcpStream, AdapterError> {
    let addr = format!("{domain}:{target_port}");

    let tcp = tokio::time::timeout(TCP_CONNECT_TIMEOUT, tokio::net::TcpStream::connect(&addr))
        .await
        .map_err(|_| AdapterError::WebsocketError(format!("TCP connect timeout: {addr}")))?
        .map_err(|e| AdapterError::WebsocketError(e.to_string()))?;

    tcp.set_nodelay(true)
        .map_err(|e| AdapterError::WebsocketError(e.to_string()))?;

    Ok(tcp)
}

async fn upgrade_to_tls<S>(
    domain: &str,
    stream: S,
) -> Result<tokio_rustls::client::TlsStream<S>, AdapterError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let domain: tokio_rustls::rustls::ServerName =
        tokio_rustls::rustls::ServerName::try_from(domain)
            .map_err(|_| AdapterError::ParseError("invalid dnsname".to_string()))?;

    let connector = TLS_CONNECTOR
        .as_ref()
        .map_err(|e| AdapterError::WebsocketError(format!("TLS setup failed: {e}")))?;

    connector
        .connect(domain, stream)
        .await
        .map_err(|e| AdapterError::WebsocketError(e.to_string()))
}

async fn upgrade_to_websocket<S>(
    domain: &str,
    stream: S,
    url: &Url,
) -> Result<WebSocket, AdapterError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let mut path_and_query = url.path().to_string();
    if let Some(q) = url.query() {
        path_and_query.push('?');
        path_and_query.push_str(q);
    }
    if path_and_query.is_empty() {
        path_and_query.push('/');
    }

    let host_header = match url.port() {
        Some(explicit_port) => format!("{domain}:{explicit_port}"),
        None => domain.to_string(),
    };

    let req: Request<Empty<Bytes>> = Request::builder()
        .method("GET")
        .uri(path_and_query)
        .header("Host", host_header)
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "upgrade")
        .header(
            "Sec-WebSocket-Key",
            fastwebsockets::handshake::generate_key(),
        )
        .header("Sec-WebSocket-Version", "13")
        .body(Empty::<Bytes>::new())
        .map_err(|e| AdapterError::WebsocketError(e.to_string()))?;

    let exec = TokioExecutor::new();
    let (ws, _) = fastwebsockets::handshake::client(&exec, req, stream)
        .await
        .map_err(|e| AdapterError::WebsocketError(e.to_string()))?;

    Ok(FragmentCollector::new(ws))
}
