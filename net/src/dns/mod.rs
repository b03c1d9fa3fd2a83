//! DNS server of the gateway.
//!
//! Names are answered from the configured zones first, then from the hosts
//! file. Anything else is forwarded verbatim to the host's resolvers.

pub mod hosts;
pub mod message;
pub mod zone;

pub use hosts::HostsFile;
pub use zone::{ZoneAnswer, Zones};

use crate::config::{Configuration, Zone};
use crate::error::{NetError, Result};
use crate::stack::GatewayListener;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use message::{Query, RCODE_NXDOMAIN, RCODE_SERVFAIL, TYPE_A, TYPE_AAAA};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DNS_PORT: u16 = 53;

/// How long each upstream resolver gets to answer.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(2);

const MAX_UPSTREAM_REPLY: usize = 4096;

/// Parses `nameserver` lines of a resolv.conf.
pub fn parse_resolv_conf(contents: &str) -> Vec<SocketAddr> {
    let mut servers = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let mut parts = line.split_whitespace();
        if parts.next() != Some("nameserver") {
            continue;
        }
        let Some(Ok(ip)) = parts.next().map(str::parse::<IpAddr>) else {
            continue;
        };
        let addr = SocketAddr::new(ip, DNS_PORT);
        if !servers.contains(&addr) {
            servers.push(addr);
        }
    }
    servers
}

/// Parses `ip` or `ip:port`.
fn parse_upstream(s: &str) -> Result<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    s.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DNS_PORT))
        .map_err(|_| NetError::Config(format!("invalid dns upstream {:?}", s)))
}

pub struct DnsServer {
    zones: Zones,
    hosts: Option<Arc<HostsFile>>,
    upstreams: Vec<SocketAddr>,
}

impl DnsServer {
    pub fn new(zones: Vec<Zone>, hosts: Option<Arc<HostsFile>>, upstreams: Vec<SocketAddr>) -> Result<Self> {
        Ok(Self {
            zones: Zones::new(zones)?,
            hosts,
            upstreams,
        })
    }

    /// Builds the server from the configuration and starts watching the
    /// hosts file.
    pub fn from_config(config: &Configuration, cancel: &CancellationToken) -> Result<Self> {
        let hosts = match config.hosts_file.as_deref().filter(|p| p.exists()) {
            Some(path) => match HostsFile::load(path) {
                Ok(hosts) => {
                    let hosts = Arc::new(hosts);
                    tokio::spawn(hosts.clone().watch(cancel.child_token()));
                    Some(hosts)
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring hosts file");
                    None
                }
            },
            None => None,
        };

        let upstreams = if config.dns_upstreams.is_empty() {
            config
                .resolv_conf
                .as_deref()
                .map(upstreams_from_resolv_conf)
                .unwrap_or_default()
        } else {
            config
                .dns_upstreams
                .iter()
                .map(|s| parse_upstream(s))
                .collect::<Result<Vec<_>>>()?
        };
        info!(upstreams = ?upstreams, "dns upstreams");

        Self::new(config.dns_zones.clone(), hosts, upstreams)
    }

    pub fn zones(&self) -> &Zones {
        &self.zones
    }

    /// Answers one DNS message. Returns `None` for messages that are not
    /// valid queries.
    pub async fn handle(&self, data: &[u8]) -> Option<Vec<u8>> {
        let query = match Query::parse(data) {
            Ok(q) => q,
            Err(e) => {
                debug!(error = %e, "ignoring dns message");
                return None;
            }
        };

        match self.zones.lookup(&query.name, query.qtype) {
            Some(ZoneAnswer::A(ip)) => return Some(query.answer_a(&[ip])),
            Some(ZoneAnswer::Empty) => return Some(query.empty()),
            Some(ZoneAnswer::NxDomain) => return Some(query.error(RCODE_NXDOMAIN)),
            None => {}
        }

        if let Some(ip) = self.hosts.as_ref().and_then(|h| h.lookup(&query.name)) {
            if query.qtype == TYPE_A {
                return Some(query.answer_a(&[ip]));
            }
            return Some(query.empty());
        }

        if query.qtype == TYPE_AAAA {
            return Some(query.empty());
        }

        match self.forward(data, query.id).await {
            Some(reply) => Some(reply),
            None => {
                debug!(name = %query.name, "no upstream answered");
                Some(query.error(RCODE_SERVFAIL))
            }
        }
    }

    async fn forward(&self, data: &[u8], id: u16) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; MAX_UPSTREAM_REPLY];
        for upstream in &self.upstreams {
            let bind = if upstream.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
            let socket = match UdpSocket::bind(bind).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "cannot bind dns forwarding socket");
                    return None;
                }
            };
            if let Err(e) = socket.send_to(data, upstream).await {
                debug!(upstream = %upstream, error = %e, "dns upstream send failed");
                continue;
            }
            let recv = async {
                loop {
                    let (n, from) = socket.recv_from(&mut buf).await?;
                    if from == *upstream && n >= 2 && buf[..2] == id.to_be_bytes() {
                        return Ok::<_, std::io::Error>(buf[..n].to_vec());
                    }
                }
            };
            match tokio::time::timeout(UPSTREAM_TIMEOUT, recv).await {
                Ok(Ok(reply)) => return Some(reply),
                Ok(Err(e)) => debug!(upstream = %upstream, error = %e, "dns upstream failed"),
                Err(_) => debug!(upstream = %upstream, "dns upstream timed out"),
            }
        }
        None
    }

    /// Serves DNS over TCP to guests connecting to the gateway.
    pub async fn serve_tcp(self: Arc<Self>, mut listener: GatewayListener, cancel: CancellationToken) {
        loop {
            let stream = tokio::select! {
                _ = cancel.cancelled() => return,
                stream = listener.accept() => stream,
            };
            let Some(stream) = stream else { return };
            let this = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    res = this.serve_stream(stream) => {
                        if let Err(e) = res {
                            debug!(error = %e, "dns tcp connection ended");
                        }
                    }
                }
            });
        }
    }

    /// Answers 2-byte length-prefixed messages until the peer closes.
    pub async fn serve_stream<S>(&self, mut stream: S) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let len = match stream.read_u16().await {
                Ok(len) => len as usize,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            };
            let mut msg = vec![0u8; len];
            stream.read_exact(&mut msg).await?;
            let Some(reply) = self.handle(&msg).await else {
                continue;
            };
            let mut out = Vec::with_capacity(2 + reply.len());
            out.extend_from_slice(&(reply.len() as u16).to_be_bytes());
            out.extend_from_slice(&reply);
            stream.write_all(&out).await?;
            stream.flush().await?;
        }
    }

    pub fn mux(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/all", get(all_handler))
            .route("/add", any(add_handler))
            .with_state(self.clone())
    }
}

fn upstreams_from_resolv_conf(path: &Path) -> Vec<SocketAddr> {
    match std::fs::read_to_string(path) {
        Ok(contents) => parse_resolv_conf(&contents),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read resolv.conf");
            Vec::new()
        }
    }
}

async fn all_handler(State(dns): State<Arc<DnsServer>>) -> Json<Vec<Zone>> {
    Json(dns.zones.all())
}

async fn add_handler(State(dns): State<Arc<DnsServer>>, method: Method, body: Bytes) -> Response {
    if method != Method::POST {
        return (StatusCode::BAD_REQUEST, "post only").into_response();
    }
    let zone: Zone = match serde_json::from_slice(&body) {
        Ok(zone) => zone,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    match dns.zones.add_zone(zone) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Record;
    use axum::body::Body;
    use axum::http::Request;
    use message::{answer_count, build_query, rcode};
    use std::io::Write;
    use std::net::Ipv4Addr;
    use tower::ServiceExt;

    fn zone() -> Zone {
        Zone {
            name: "ross.internal.".to_string(),
            records: vec![Record {
                name: "gateway".to_string(),
                ip: Some(Ipv4Addr::new(192, 168, 127, 1)),
                regexp: None,
            }],
            default_ip: None,
        }
    }

    #[test]
    fn test_parse_resolv_conf() {
        let servers = parse_resolv_conf(
            "# generated\nsearch lan\nnameserver 1.1.1.1\nnameserver 1.1.1.1\n; x\nnameserver 2001:db8::1\nnameserver bogus\n",
        );
        assert_eq!(
            servers,
            vec![
                "1.1.1.1:53".parse::<SocketAddr>().unwrap(),
                "[2001:db8::1]:53".parse::<SocketAddr>().unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn test_resolution_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "10.1.1.1 db.lan gateway.ross.internal").unwrap();
        let hosts = Arc::new(HostsFile::load(file.path()).unwrap());
        let dns = DnsServer::new(vec![zone()], Some(hosts), vec![]).unwrap();

        // Zones win over the hosts file.
        let reply = dns.handle(&build_query(1, "gateway.ross.internal", TYPE_A)).await.unwrap();
        assert_eq!(&reply[reply.len() - 4..], &[192, 168, 127, 1]);

        let reply = dns.handle(&build_query(2, "db.lan", TYPE_A)).await.unwrap();
        assert_eq!(&reply[reply.len() - 4..], &[10, 1, 1, 1]);

        let reply = dns.handle(&build_query(3, "example.com", TYPE_AAAA)).await.unwrap();
        assert_eq!(rcode(&reply), Some(0));
        assert_eq!(answer_count(&reply), Some(0));

        // No upstream to ask.
        let reply = dns.handle(&build_query(4, "example.com", TYPE_A)).await.unwrap();
        assert_eq!(rcode(&reply), Some(RCODE_SERVFAIL));

        assert!(dns.handle(&[1, 2, 3]).await.is_none());
    }

    #[tokio::test]
    async fn test_forward_to_upstream() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, peer) = upstream.recv_from(&mut buf).await.unwrap();
            let query = Query::parse(&buf[..n]).unwrap();
            upstream
                .send_to(&query.answer_a(&[Ipv4Addr::new(93, 184, 216, 34)]), peer)
                .await
                .unwrap();
        });

        let dns = DnsServer::new(vec![], None, vec![addr]).unwrap();
        let reply = dns.handle(&build_query(9, "example.com", TYPE_A)).await.unwrap();
        assert_eq!(&reply[..2], &9u16.to_be_bytes());
        assert_eq!(&reply[reply.len() - 4..], &[93, 184, 216, 34]);
    }

    #[tokio::test]
    async fn test_serve_stream() {
        let dns = Arc::new(DnsServer::new(vec![zone()], None, vec![]).unwrap());
        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn({
            let dns = dns.clone();
            async move { dns.serve_stream(server).await }
        });

        let query = build_query(5, "nothing.ross.internal", TYPE_A);
        client.write_u16(query.len() as u16).await.unwrap();
        client.write_all(&query).await.unwrap();
        let len = client.read_u16().await.unwrap() as usize;
        let mut reply = vec![0u8; len];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(rcode(&reply), Some(RCODE_NXDOMAIN));

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_http_handlers() {
        let dns = Arc::new(DnsServer::new(vec![zone()], None, vec![]).unwrap());
        let app = dns.mux();

        let res = app
            .clone()
            .oneshot(Request::get("/add").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = app
            .clone()
            .oneshot(Request::post("/add").body(Body::from("{")).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = app
            .clone()
            .oneshot(
                Request::post("/add")
                    .body(Body::from(r#"{"name":"dev.","records":[{"name":"api","IP":"10.0.0.9"}]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res = app
            .oneshot(Request::get("/all").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let zones: Vec<Zone> = serde_json::from_slice(&body).unwrap();
        assert_eq!(zones[0].name, "dev.");
        assert_eq!(zones[1].name, "ross.internal.");

        let reply = dns.handle(&build_query(1, "api.dev", TYPE_A)).await.unwrap();
        assert_eq!(&reply[reply.len() - 4..], &[10, 0, 0, 9]);
    }
}
