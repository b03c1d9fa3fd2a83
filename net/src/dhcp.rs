//! DHCP server handing out leases from the IP pool.

use crate::eth::format_mac;
use crate::ip_pool::IpPool;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use smoltcp::wire::EthernetAddress;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, error, info};

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

/// Lease time advertised to clients.
pub const LEASE_TIME_SECS: u32 = 3600;

const BOOTREQUEST: u8 = 1;
const BOOTREPLY: u8 = 2;
const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const OPTIONS_OFFSET: usize = 240;

const OPT_PAD: u8 = 0;
const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS: u8 = 6;
const OPT_MTU: u8 = 26;
const OPT_LEASE_TIME: u8 = 51;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_DOMAIN_SEARCH: u8 = 119;
const OPT_END: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Ack = 5,
}

pub struct DhcpServer {
    pool: Arc<IpPool>,
    gateway_ip: Ipv4Addr,
    mtu: u16,
    search_domains: Vec<String>,
}

fn find_option(options: &[u8], code: u8) -> Option<&[u8]> {
    let mut i = 0;
    while i < options.len() {
        match options[i] {
            OPT_END => break,
            OPT_PAD => {
                i += 1;
                continue;
            }
            _ => {}
        }
        let len = *options.get(i + 1)? as usize;
        let value = options.get(i + 2..i + 2 + len)?;
        if options[i] == code {
            return Some(value);
        }
        i += 2 + len;
    }
    None
}

/// Encodes domain names for the search option, without compression.
fn encode_search(domains: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for domain in domains {
        for label in domain.trim_end_matches('.').split('.').filter(|l| !l.is_empty()) {
            out.push(label.len().min(63) as u8);
            out.extend_from_slice(&label.as_bytes()[..label.len().min(63)]);
        }
        out.push(0);
    }
    out
}

fn push_option(out: &mut Vec<u8>, code: u8, value: &[u8]) {
    // Values longer than one option are split over several instances.
    for chunk in value.chunks(255) {
        out.push(code);
        out.push(chunk.len() as u8);
        out.extend_from_slice(chunk);
    }
}

impl DhcpServer {
    pub fn new(pool: Arc<IpPool>, gateway_ip: Ipv4Addr, mtu: u16, search_domains: Vec<String>) -> Self {
        Self {
            pool,
            gateway_ip,
            mtu,
            search_domains,
        }
    }

    /// Answers a BOOTP message. Returns the reply payload, or `None` when the
    /// message is ignored.
    pub fn handle(&self, payload: &[u8]) -> Option<Vec<u8>> {
        if payload.len() < OPTIONS_OFFSET || payload[0] != BOOTREQUEST {
            return None;
        }
        if payload[236..240] != MAGIC_COOKIE {
            debug!("dhcp: missing magic cookie");
            return None;
        }

        let msg_type = find_option(&payload[OPTIONS_OFFSET..], OPT_MESSAGE_TYPE)
            .and_then(|v| v.first().copied());
        let reply_type = match msg_type {
            Some(t) if t == MessageType::Discover as u8 => MessageType::Offer,
            Some(t) if t == MessageType::Request as u8 => MessageType::Ack,
            other => {
                error!(msg_type = ?other, "dhcp: unhandled message type");
                return None;
            }
        };

        let mut mac = [0u8; 6];
        mac.copy_from_slice(&payload[28..34]);
        let mac = EthernetAddress(mac);
        let ip = match self.pool.get_or_assign(&format_mac(&mac)) {
            Ok(ip) => ip,
            Err(e) => {
                error!(mac = %format_mac(&mac), error = %e, "dhcp: cannot assign ip");
                return None;
            }
        };

        info!(
            reply = ?reply_type,
            mac = %format_mac(&mac),
            ip = %ip,
            "dhcp reply"
        );
        Some(self.build_reply(payload, reply_type, ip))
    }

    fn build_reply(&self, request: &[u8], reply_type: MessageType, ip: Ipv4Addr) -> Vec<u8> {
        let mut reply = vec![0u8; OPTIONS_OFFSET];
        reply[0] = BOOTREPLY;
        reply[1] = request[1];
        reply[2] = request[2];
        reply[4..8].copy_from_slice(&request[4..8]); // xid
        reply[10..12].copy_from_slice(&request[10..12]); // flags
        reply[12..16].copy_from_slice(&request[12..16]); // ciaddr
        reply[16..20].copy_from_slice(&ip.octets()); // yiaddr
        reply[20..24].copy_from_slice(&self.gateway_ip.octets()); // siaddr
        reply[24..28].copy_from_slice(&request[24..28]); // giaddr
        reply[28..44].copy_from_slice(&request[28..44]); // chaddr
        reply[236..240].copy_from_slice(&MAGIC_COOKIE);

        let mask = u32::MAX
            .checked_shl(32 - self.pool.mask() as u32)
            .unwrap_or(0);
        push_option(&mut reply, OPT_MESSAGE_TYPE, &[reply_type as u8]);
        push_option(&mut reply, OPT_SERVER_ID, &self.gateway_ip.octets());
        push_option(&mut reply, OPT_LEASE_TIME, &LEASE_TIME_SECS.to_be_bytes());
        push_option(&mut reply, OPT_SUBNET_MASK, &mask.to_be_bytes());
        push_option(&mut reply, OPT_ROUTER, &self.gateway_ip.octets());
        push_option(&mut reply, OPT_DNS, &self.gateway_ip.octets());
        push_option(&mut reply, OPT_MTU, &self.mtu.to_be_bytes());
        if !self.search_domains.is_empty() {
            push_option(&mut reply, OPT_DOMAIN_SEARCH, &encode_search(&self.search_domains));
        }
        reply.push(OPT_END);
        reply
    }

    pub fn leases(&self) -> HashMap<String, String> {
        self.pool.leases()
    }

    pub fn mux(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/leases", get(leases_handler))
            .route("/all", get(leases_handler))
            .with_state(self.clone())
    }
}

async fn leases_handler(State(dhcp): State<Arc<DhcpServer>>) -> Json<HashMap<String, String>> {
    Json(dhcp.leases())
}

/// Builds a client message, used by tests.
#[cfg(test)]
pub(crate) fn build_request(mac: EthernetAddress, xid: u32, msg_type: MessageType) -> Vec<u8> {
    let mut msg = vec![0u8; OPTIONS_OFFSET];
    msg[0] = BOOTREQUEST;
    msg[1] = 1;
    msg[2] = 6;
    msg[4..8].copy_from_slice(&xid.to_be_bytes());
    msg[10] = 0x80;
    msg[28..34].copy_from_slice(mac.as_bytes());
    msg[236..240].copy_from_slice(&MAGIC_COOKIE);
    msg.extend_from_slice(&[OPT_MESSAGE_TYPE, 1, msg_type as u8, OPT_END]);
    msg
}

/// Reads an option of a reply, used by tests.
#[cfg(test)]
pub(crate) fn reply_option(reply: &[u8], code: u8) -> Option<Vec<u8>> {
    find_option(reply.get(OPTIONS_OFFSET..)?, code).map(<[u8]>::to_vec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use smoltcp::wire::Ipv4Cidr;
    use tower::ServiceExt;

    const CLIENT: EthernetAddress = EthernetAddress([0x52, 0x54, 0, 0, 0, 1]);

    fn server() -> Arc<DhcpServer> {
        let pool = Arc::new(IpPool::new(Ipv4Cidr::new(Ipv4Addr::new(192, 168, 127, 0), 24)));
        pool.reserve(Ipv4Addr::new(192, 168, 127, 1), "02:52:4f:53:53:01");
        Arc::new(DhcpServer::new(
            pool,
            Ipv4Addr::new(192, 168, 127, 1),
            1500,
            vec!["ross.internal".to_string()],
        ))
    }

    #[test]
    fn test_discover_offer() {
        let dhcp = server();
        let reply = dhcp.handle(&build_request(CLIENT, 0xdeadbeef, MessageType::Discover)).unwrap();
        assert_eq!(reply[0], BOOTREPLY);
        assert_eq!(&reply[4..8], &0xdeadbeefu32.to_be_bytes());
        assert_eq!(&reply[16..20], &[192, 168, 127, 2]);
        assert_eq!(&reply[28..34], CLIENT.as_bytes());
        assert_eq!(reply_option(&reply, OPT_MESSAGE_TYPE), Some(vec![MessageType::Offer as u8]));
        assert_eq!(reply_option(&reply, OPT_SERVER_ID), Some(vec![192, 168, 127, 1]));
        assert_eq!(reply_option(&reply, OPT_LEASE_TIME), Some(3600u32.to_be_bytes().to_vec()));
        assert_eq!(reply_option(&reply, OPT_SUBNET_MASK), Some(vec![255, 255, 255, 0]));
        assert_eq!(reply_option(&reply, OPT_ROUTER), Some(vec![192, 168, 127, 1]));
        assert_eq!(reply_option(&reply, OPT_DNS), Some(vec![192, 168, 127, 1]));
        assert_eq!(reply_option(&reply, OPT_MTU), Some(1500u16.to_be_bytes().to_vec()));
        assert_eq!(
            reply_option(&reply, OPT_DOMAIN_SEARCH),
            Some(b"\x04ross\x08internal\x00".to_vec())
        );
    }

    #[test]
    fn test_request_ack_keeps_lease() {
        let dhcp = server();
        dhcp.handle(&build_request(CLIENT, 1, MessageType::Discover)).unwrap();
        let reply = dhcp.handle(&build_request(CLIENT, 2, MessageType::Request)).unwrap();
        assert_eq!(reply_option(&reply, OPT_MESSAGE_TYPE), Some(vec![MessageType::Ack as u8]));
        assert_eq!(&reply[16..20], &[192, 168, 127, 2]);
        assert_eq!(
            dhcp.leases().get("192.168.127.2").map(String::as_str),
            Some("52:54:00:00:00:01")
        );
    }

    #[test]
    fn test_ignored_messages() {
        let dhcp = server();
        let mut release = build_request(CLIENT, 1, MessageType::Discover);
        release[OPTIONS_OFFSET + 2] = 7;
        assert!(dhcp.handle(&release).is_none());
        assert!(dhcp.handle(&[0u8; 100]).is_none());
        let mut reply = build_request(CLIENT, 1, MessageType::Discover);
        reply[0] = BOOTREPLY;
        assert!(dhcp.handle(&reply).is_none());
        assert!(dhcp.leases().get("192.168.127.2").is_none());
    }

    #[test]
    fn test_exhausted_pool_denies_lease() {
        let pool = Arc::new(IpPool::new(Ipv4Cidr::new(Ipv4Addr::new(10, 0, 0, 0), 30)));
        pool.reserve(Ipv4Addr::new(10, 0, 0, 1), "gateway");
        pool.reserve(Ipv4Addr::new(10, 0, 0, 2), "other");
        let dhcp = DhcpServer::new(pool, Ipv4Addr::new(10, 0, 0, 1), 1500, vec![]);
        assert!(dhcp.handle(&build_request(CLIENT, 1, MessageType::Discover)).is_none());
    }

    #[tokio::test]
    async fn test_leases_handler() {
        let dhcp = server();
        dhcp.handle(&build_request(CLIENT, 1, MessageType::Discover)).unwrap();
        let res = dhcp
            .mux()
            .oneshot(Request::get("/leases").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let leases: HashMap<String, String> = serde_json::from_slice(&body).unwrap();
        assert_eq!(leases.len(), 2);
    }
}
