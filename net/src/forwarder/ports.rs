//! Host ports exposed into the guest network.
//!
//! Each proxy listens on a host address and relays to an address inside the
//! guest network through the gateway stack.

use crate::error::{NetError, Result};
use crate::forwarder::udp::MAX_DATAGRAM_SIZE;
use crate::stack::{GatewayUdpSocket, Stack};
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::Tcp => write!(f, "tcp"),
            TransportProtocol::Udp => write!(f, "udp"),
        }
    }
}

/// A running proxy as reported by `/all`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyInfo {
    pub local: String,
    pub remote: String,
    pub protocol: TransportProtocol,
}

#[derive(Debug, Deserialize)]
pub struct ExposeRequest {
    pub local: String,
    pub remote: String,
    #[serde(default)]
    pub protocol: TransportProtocol,
}

#[derive(Debug, Deserialize)]
pub struct UnexposeRequest {
    pub local: String,
    #[serde(default)]
    pub protocol: TransportProtocol,
}

struct Proxy {
    info: ProxyInfo,
    cancel: CancellationToken,
}

pub struct PortsForwarder {
    stack: Stack,
    udp_timeout: Duration,
    proxies: tokio::sync::Mutex<HashMap<String, Proxy>>,
    cancel: CancellationToken,
}

fn key(protocol: TransportProtocol, local: &str) -> String {
    format!("{}/{}", protocol, local)
}

fn parse_remote(remote: &str) -> Result<SocketAddrV4> {
    remote
        .parse()
        .map_err(|_| NetError::InvalidRemote(remote.to_string()))
}

impl PortsForwarder {
    pub fn new(stack: Stack, udp_timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            stack,
            udp_timeout,
            proxies: tokio::sync::Mutex::new(HashMap::new()),
            cancel,
        }
    }

    /// Starts relaying `local` on the host to `remote` in the guest network.
    pub async fn expose(&self, protocol: TransportProtocol, local: &str, remote: &str) -> Result<()> {
        let mut proxies = self.proxies.lock().await;
        let key = key(protocol, local);
        if proxies.contains_key(&key) {
            return Err(NetError::ProxyAlreadyRunning);
        }
        let target = parse_remote(remote)?;
        let cancel = self.cancel.child_token();

        match protocol {
            TransportProtocol::Tcp => {
                let listener = TcpListener::bind(local).await?;
                tokio::spawn(serve_tcp(listener, self.stack.clone(), target, cancel.clone()));
            }
            TransportProtocol::Udp => {
                let socket = UdpSocket::bind(local).await?;
                let proxy = UdpProxy {
                    socket: Arc::new(socket),
                    stack: self.stack.clone(),
                    remote: target,
                    timeout: self.udp_timeout,
                    clients: Mutex::new(HashMap::new()),
                };
                tokio::spawn(Arc::new(proxy).run(cancel.clone()));
            }
        }

        info!(protocol = %protocol, local, remote, "exposed port");
        proxies.insert(
            key,
            Proxy {
                info: ProxyInfo {
                    local: local.to_string(),
                    remote: remote.to_string(),
                    protocol,
                },
                cancel,
            },
        );
        Ok(())
    }

    pub async fn unexpose(&self, protocol: TransportProtocol, local: &str) -> Result<()> {
        let proxy = self
            .proxies
            .lock()
            .await
            .remove(&key(protocol, local))
            .ok_or(NetError::ProxyNotFound)?;
        proxy.cancel.cancel();
        info!(protocol = %protocol, local, "unexposed port");
        Ok(())
    }

    /// Running proxies sorted by local address, then protocol.
    pub async fn all(&self) -> Vec<ProxyInfo> {
        let mut all: Vec<ProxyInfo> = self
            .proxies
            .lock()
            .await
            .values()
            .map(|p| p.info.clone())
            .collect();
        all.sort_by(|a, b| {
            a.local
                .cmp(&b.local)
                .then_with(|| a.protocol.to_string().cmp(&b.protocol.to_string()))
        });
        all
    }

    /// Exposes the forwards of the configuration. A `udp:` prefix on the local
    /// address selects UDP.
    pub async fn expose_all(&self, forwards: &HashMap<String, String>) -> Result<()> {
        for (local, remote) in forwards {
            match local.strip_prefix("udp:") {
                Some(local) => self.expose(TransportProtocol::Udp, local, remote).await?,
                None => self.expose(TransportProtocol::Tcp, local, remote).await?,
            }
        }
        Ok(())
    }

    pub fn mux(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/all", get(all_handler))
            .route("/expose", any(expose_handler))
            .route("/unexpose", any(unexpose_handler))
            .with_state(self.clone())
    }
}

async fn serve_tcp(listener: TcpListener, stack: Stack, remote: SocketAddrV4, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            res = listener.accept() => match res {
                Ok((client, peer)) => {
                    let stack = stack.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            res = relay_tcp(client, &stack, remote) => {
                                if let Err(e) = res {
                                    debug!(peer = %peer, remote = %remote, error = %e, "port forward ended");
                                }
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }
}

async fn relay_tcp(mut client: TcpStream, stack: &Stack, remote: SocketAddrV4) -> Result<()> {
    let mut upstream = stack.connect(remote).await?;
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

/// Host UDP socket relaying every client to `remote` over its own gateway
/// port.
struct UdpProxy {
    socket: Arc<UdpSocket>,
    stack: Stack,
    remote: SocketAddrV4,
    timeout: Duration,
    clients: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Vec<u8>>>>,
}

impl UdpProxy {
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok((n, client)) => self.dispatch(client, buf[..n].to_vec(), &cancel),
                    Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {}
                    Err(e) => {
                        error!(error = %e, "udp proxy read failed");
                        break;
                    }
                }
            }
        }
    }

    fn dispatch(self: &Arc<Self>, client: SocketAddr, payload: Vec<u8>, cancel: &CancellationToken) {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        let payload = match clients.get(&client) {
            Some(tx) => match tx.send(payload) {
                Ok(()) => return,
                Err(mpsc::error::SendError(payload)) => payload,
            },
            None => payload,
        };

        let gateway = match self.stack.bind_udp() {
            Ok(s) => s,
            Err(e) => {
                warn!(client = %client, error = %e, "cannot open gateway udp port");
                return;
            }
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(payload);
        clients.insert(client, tx.clone());

        let this = self.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            this.relay(client, gateway, rx, cancel).await;
            let mut clients = this.clients.lock().unwrap_or_else(|e| e.into_inner());
            if clients.get(&client).is_some_and(|current| current.same_channel(&tx)) {
                clients.remove(&client);
            }
        });
    }

    async fn relay(
        &self,
        client: SocketAddr,
        mut gateway: GatewayUdpSocket,
        mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
        cancel: CancellationToken,
    ) {
        debug!(client = %client, remote = %self.remote, port = gateway.port(), "new udp proxy flow");
        let mut deadline = Instant::now() + self.timeout;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(client = %client, "udp proxy flow expired");
                    return;
                }
                payload = rx.recv() => {
                    let Some(payload) = payload else { return };
                    gateway.send_to(&payload, self.remote).await;
                    deadline = Instant::now() + self.timeout;
                }
                dgram = gateway.recv() => {
                    let Some(dgram) = dgram else { return };
                    if dgram.src != self.remote {
                        continue;
                    }
                    if let Err(e) = self.socket.send_to(&dgram.payload, client).await {
                        debug!(client = %client, error = %e, "udp proxy write failed");
                        return;
                    }
                    deadline = Instant::now() + self.timeout;
                }
            }
        }
    }
}

fn failure(status: StatusCode, msg: impl ToString) -> Response {
    (status, msg.to_string()).into_response()
}

async fn all_handler(State(fw): State<Arc<PortsForwarder>>) -> Json<Vec<ProxyInfo>> {
    Json(fw.all().await)
}

async fn expose_handler(
    State(fw): State<Arc<PortsForwarder>>,
    method: Method,
    client: Option<ConnectInfo<SocketAddr>>,
    body: Bytes,
) -> Response {
    if method != Method::POST {
        return failure(StatusCode::BAD_REQUEST, "post only");
    }
    let req: ExposeRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => return failure(StatusCode::BAD_REQUEST, e),
    };
    let remote = match remote_with_client(&req.remote, client.map(|c| c.0)) {
        Ok(remote) => remote,
        Err(e) => return failure(StatusCode::BAD_REQUEST, e),
    };
    match fw.expose(req.protocol, &req.local, &remote).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn unexpose_handler(State(fw): State<Arc<PortsForwarder>>, method: Method, body: Bytes) -> Response {
    if method != Method::POST {
        return failure(StatusCode::BAD_REQUEST, "post only");
    }
    let req: UnexposeRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => return failure(StatusCode::BAD_REQUEST, e),
    };
    match fw.unexpose(req.protocol, &req.local).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// Fills in the HTTP client's IP when `remote` has no host part.
fn remote_with_client(remote: &str, client: Option<SocketAddr>) -> Result<String> {
    let Some((host, port)) = remote.rsplit_once(':') else {
        return Err(NetError::InvalidRemote(remote.to_string()));
    };
    if !host.is_empty() {
        return Ok(remote.to_string());
    }
    let client = client.ok_or_else(|| NetError::InvalidRemote(format!("{} has no host", remote)))?;
    Ok(format!("{}:{}", client.ip(), port))
}
