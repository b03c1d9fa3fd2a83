//! The virtual network: switch, gateway stack and services wired together.

use crate::config::Configuration;
use crate::dhcp::DhcpServer;
use crate::dns::{DnsServer, DNS_PORT};
use crate::error::Result;
use crate::eth::format_mac;
use crate::forwarder::{NatTable, PortsForwarder, UdpForwarder};
use crate::ip_pool::IpPool;
use crate::link::{Capture, LinkEndpoint};
use crate::protocol::{Conn, PacketConn, Protocol};
use crate::services::{self, Stats};
use crate::stack::{GatewayListener, Services, Stack};
use crate::switch::{NetworkSwitch, Switch, VirtualDevice};
use crate::vpnkit;
use axum::Router;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct VirtualNetwork {
    config: Configuration,
    gateway_ip: Ipv4Addr,
    pool: Arc<IpPool>,
    switch: Arc<Switch>,
    stack: Stack,
    udp: Arc<UdpForwarder>,
    dhcp: Arc<DhcpServer>,
    dns: Arc<DnsServer>,
    ports: Arc<PortsForwarder>,
    mux: Router,
    cancel: CancellationToken,
}

impl VirtualNetwork {
    /// Builds the network and starts the gateway. Must be called inside a
    /// tokio runtime.
    pub async fn new(config: Configuration) -> Result<Self> {
        config.validate()?;
        let subnet = config.subnet()?;
        let gateway_ip = config.gateway_ip()?;
        let gateway_mac = config.gateway_mac()?;

        let pool = Arc::new(IpPool::new(subnet));
        pool.reserve(gateway_ip, &format_mac(&gateway_mac));
        for (ip, mac) in config.static_leases()? {
            pool.reserve(ip, &format_mac(&mac));
        }

        let link = Arc::new(LinkEndpoint::new(
            config.debug,
            config.mtu,
            gateway_mac,
            gateway_ip,
            config.virtual_ips()?,
        ));
        let switch = Arc::new(Switch::new(config.debug, config.mtu));
        switch.connect(link.clone() as Arc<dyn VirtualDevice>);
        let as_switch: Arc<dyn NetworkSwitch> = switch.clone();
        link.connect(&as_switch);

        if let Some(path) = &config.capture_file {
            link.set_capture(Capture::create(path)?);
            info!(path = %path.display(), "capturing frames");
        }

        let cancel = CancellationToken::new();
        let (stack, runner) = Stack::new(link.clone(), subnet);

        let nat = Arc::new(NatTable::new(config.nat_table()?));
        let udp = Arc::new(UdpForwarder::new(
            nat.clone(),
            link.clone(),
            gateway_mac,
            subnet,
            config.udp_timeout(),
            cancel.child_token(),
        ));
        let dns = Arc::new(DnsServer::from_config(&config, &cancel)?);
        let dhcp = Arc::new(DhcpServer::new(
            pool.clone(),
            gateway_ip,
            config.mtu as u16,
            config.dns_search_domains.clone(),
        ));

        tokio::spawn(runner.run(
            Services {
                dhcp: dhcp.clone(),
                dns: dns.clone(),
                udp: udp.clone(),
                nat,
            },
            cancel.child_token(),
        ));

        let dns_listener = stack.listen(DNS_PORT)?;
        tokio::spawn(dns.clone().serve_tcp(dns_listener, cancel.child_token()));

        let ports = Arc::new(PortsForwarder::new(
            stack.clone(),
            config.udp_timeout(),
            cancel.child_token(),
        ));
        if let Err(e) = ports.expose_all(&config.forwards).await {
            cancel.cancel();
            return Err(e);
        }

        let mux = services::mux(switch.clone(), udp.clone(), &dhcp, &dns, &ports);
        info!(
            subnet = %config.subnet,
            gateway = %gateway_ip,
            mtu = config.mtu,
            "virtual network ready"
        );

        Ok(Self {
            config,
            gateway_ip,
            pool,
            switch,
            stack,
            udp,
            dhcp,
            dns,
            ports,
            mux,
            cancel,
        })
    }

    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    /// Serves a client connection until it ends or the network shuts down.
    pub async fn accept(&self, conn: Conn) -> Result<()> {
        self.switch.accept(self.cancel.child_token(), conn).await
    }

    /// Like [`accept`](Self::accept), but the client first receives its
    /// address in a JSON handshake frame.
    pub async fn accept_with_handshake(&self, conn: Conn) -> Result<()> {
        self.switch
            .accept_with_handshake(
                self.cancel.child_token(),
                conn,
                self.pool.clone(),
                self.gateway_ip,
                self.config.mtu,
            )
            .await
    }

    pub async fn accept_qemu<S>(&self, stream: S, peer: impl Into<String>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.accept(Conn::stream(stream, Protocol::Qemu, self.config.mtu, peer)).await
    }

    pub async fn accept_hyperkit<S>(&self, stream: S, peer: impl Into<String>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.accept(Conn::stream(stream, Protocol::Hyperkit, self.config.mtu, peer)).await
    }

    pub async fn accept_stdio<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.accept(Conn::from_halves(
            reader,
            writer,
            Protocol::Stdio,
            self.config.mtu,
            "stdio",
        ))
        .await
    }

    pub async fn accept_bess(&self, conn: Arc<dyn PacketConn>, peer: impl Into<String>) -> Result<()> {
        self.accept(Conn::datagram(conn, Protocol::Bess, peer)).await
    }

    pub async fn accept_vfkit(&self, conn: Arc<dyn PacketConn>, peer: impl Into<String>) -> Result<()> {
        self.accept(Conn::datagram(conn, Protocol::Vfkit, peer)).await
    }

    /// Runs the VPNKit handshake, then serves the stream with hyperkit
    /// framing.
    pub async fn accept_vpnkit<S>(&self, mut stream: S, peer: impl Into<String>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let peer = peer.into();
        let mac = vpnkit::handshake(
            &mut stream,
            self.config.mtu as u16,
            &self.config.vpnkit_uuid_mac_addresses,
        )
        .await?;
        info!(peer = %peer, mac = %format_mac(&mac), "vpnkit handshake done");
        self.accept_hyperkit(stream, peer).await
    }

    /// Listens for guest TCP connections to `port` on the gateway address.
    pub fn listen(&self, port: u16) -> Result<GatewayListener> {
        self.stack.listen(port)
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn ports(&self) -> &Arc<PortsForwarder> {
        &self.ports
    }

    pub fn dns(&self) -> &Arc<DnsServer> {
        &self.dns
    }

    pub fn bytes_sent(&self) -> u64 {
        self.switch.bytes_sent()
    }

    pub fn bytes_received(&self) -> u64 {
        self.switch.bytes_received()
    }

    pub fn stats(&self) -> Stats {
        services::stats(&self.switch, &self.udp)
    }

    pub fn leases(&self) -> HashMap<String, String> {
        self.dhcp.leases()
    }

    pub fn cam(&self) -> HashMap<String, u64> {
        self.switch.cam()
    }

    /// HTTP API of the network.
    pub fn mux(&self) -> Router {
        self.mux.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops client connections, the stack and every proxy.
    pub fn shutdown(&self) {
        info!("shutting down virtual network");
        self.cancel.cancel();
    }
}

impl Drop for VirtualNetwork {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dhcp::{build_request, reply_option, MessageType};
    use crate::dns::message::{answer_count, build_query, rcode, TYPE_A};
    use crate::eth::{self, UdpFrameAddrs};
    use crate::protocol::{FrameReader, FrameWriter};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use smoltcp::wire::{
        ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol, IpProtocol,
        Ipv4Packet, TcpPacket, UdpPacket,
    };
    use std::net::SocketAddrV4;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tower::ServiceExt;

    const CLIENT_MAC: EthernetAddress = EthernetAddress([0x52, 0x54, 0x00, 0x00, 0x00, 0x01]);
    const GATEWAY_MAC: EthernetAddress = EthernetAddress([0x02, 0x52, 0x4f, 0x53, 0x53, 0x01]);
    const GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 127, 1);
    const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 127, 2);
    const HOST: Ipv4Addr = Ipv4Addr::new(192, 168, 127, 254);

    const FIN: u8 = 0x01;
    const SYN: u8 = 0x02;
    const PSH: u8 = 0x08;
    const ACK: u8 = 0x10;

    /// Default network without static leases or host resolver files.
    fn config() -> Configuration {
        Configuration {
            hosts_file: None,
            resolv_conf: None,
            dhcp_static_leases: HashMap::new(),
            ..Configuration::default()
        }
    }

    fn attach(vn: &Arc<VirtualNetwork>) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        let (client, server) = tokio::io::duplex(256 * 1024);
        tokio::spawn({
            let vn = vn.clone();
            async move { vn.accept_qemu(server, "test").await }
        });
        let Conn { reader, writer, .. } = Conn::stream(client, Protocol::Qemu, 1500, "client");
        (reader, writer)
    }

    fn arp_request() -> Vec<u8> {
        let repr = ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Request,
            source_hardware_addr: CLIENT_MAC,
            source_protocol_addr: CLIENT_IP,
            target_hardware_addr: EthernetAddress([0; 6]),
            target_protocol_addr: GATEWAY,
        };
        let mut frame = eth::build_eth_header(EthernetAddress([0xff; 6]), CLIENT_MAC, eth::ETHERTYPE_ARP).to_vec();
        let start = frame.len();
        frame.resize(start + repr.buffer_len(), 0);
        repr.emit(&mut ArpPacket::new_unchecked(&mut frame[start..]));
        frame
    }

    /// A segment from the client to `dst`.
    fn tcp_frame(dst: SocketAddrV4, src_port: u16, seq: u32, ack: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut tcp = vec![0u8; 20];
        tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
        tcp[2..4].copy_from_slice(&dst.port().to_be_bytes());
        tcp[4..8].copy_from_slice(&seq.to_be_bytes());
        tcp[8..12].copy_from_slice(&ack.to_be_bytes());
        tcp[12] = 5 << 4;
        tcp[13] = flags;
        tcp[14..16].copy_from_slice(&64240u16.to_be_bytes());
        tcp.extend_from_slice(payload);
        let cksum = eth::tcp_udp_checksum(CLIENT_IP, *dst.ip(), eth::IP_PROTO_TCP, &tcp);
        tcp[16..18].copy_from_slice(&cksum.to_be_bytes());

        let mut frame = eth::build_eth_header(GATEWAY_MAC, CLIENT_MAC, eth::ETHERTYPE_IPV4).to_vec();
        frame.extend_from_slice(&eth::build_ip_header(CLIENT_IP, *dst.ip(), eth::IP_PROTO_TCP, tcp.len()));
        frame.extend_from_slice(&tcp);
        frame
    }

    struct Segment {
        src: SocketAddrV4,
        dst_port: u16,
        seq: u32,
        ack: u32,
        syn: bool,
        has_ack: bool,
        rst: bool,
        payload: Vec<u8>,
    }

    fn parse_segment(frame: &[u8]) -> Option<Segment> {
        let eth = EthernetFrame::new_checked(frame).ok()?;
        if eth.ethertype() != EthernetProtocol::Ipv4 || eth.dst_addr() != CLIENT_MAC {
            return None;
        }
        let ip = Ipv4Packet::new_checked(eth.payload()).ok()?;
        if ip.next_header() != IpProtocol::Tcp {
            return None;
        }
        let tcp = TcpPacket::new_checked(ip.payload()).ok()?;
        Some(Segment {
            src: SocketAddrV4::new(ip.src_addr(), tcp.src_port()),
            dst_port: tcp.dst_port(),
            seq: tcp.seq_number().0 as u32,
            ack: tcp.ack_number().0 as u32,
            syn: tcp.syn(),
            has_ack: tcp.ack(),
            rst: tcp.rst(),
            payload: tcp.payload().to_vec(),
        })
    }

    /// Reads frames until `pick` accepts one.
    async fn read_until<T>(reader: &mut Box<dyn FrameReader>, mut pick: impl FnMut(&[u8]) -> Option<T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let frame = reader.read_frame().await.unwrap();
                if let Some(found) = pick(&frame) {
                    return found;
                }
            }
        })
        .await
        .unwrap()
    }

    /// Opens a connection from `src_port` to `dst` and returns the next
    /// sequence number expected from the remote side.
    async fn tcp_handshake(
        reader: &mut Box<dyn FrameReader>,
        writer: &mut Box<dyn FrameWriter>,
        dst: SocketAddrV4,
        src_port: u16,
        seq: u32,
    ) -> u32 {
        writer.write_frame(&tcp_frame(dst, src_port, seq, 0, SYN, &[])).await.unwrap();
        let syn_ack = read_until(reader, |frame| {
            parse_segment(frame).filter(|s| s.src == dst && s.dst_port == src_port && s.syn && s.has_ack)
        })
        .await;
        assert_eq!(syn_ack.ack, seq.wrapping_add(1));

        let remote_next = syn_ack.seq.wrapping_add(1);
        writer
            .write_frame(&tcp_frame(dst, src_port, seq.wrapping_add(1), remote_next, ACK, &[]))
            .await
            .unwrap();
        remote_next
    }

    /// Payload of the next data segment from `src` to `dst_port`.
    async fn read_data(reader: &mut Box<dyn FrameReader>, src: SocketAddrV4, dst_port: u16) -> Vec<u8> {
        read_until(reader, |frame| {
            parse_segment(frame)
                .filter(|s| s.src == src && s.dst_port == dst_port && !s.payload.is_empty())
                .map(|s| s.payload)
        })
        .await
    }

    #[tokio::test]
    async fn test_dhcp_then_dns_query_over_tcp() {
        let config = config();
        assert!(config.dhcp_static_leases.is_empty());
        let vn = Arc::new(VirtualNetwork::new(config).await.unwrap());
        let (mut reader, mut writer) = attach(&vn);

        // DHCP: the first free address of the subnet is offered.
        let discover = eth::build_udp_frame(
            &UdpFrameAddrs {
                src_mac: CLIENT_MAC,
                dst_mac: EthernetAddress([0xff; 6]),
                src_ip: Ipv4Addr::UNSPECIFIED,
                dst_ip: Ipv4Addr::BROADCAST,
                src_port: 68,
                dst_port: 67,
            },
            &build_request(CLIENT_MAC, 0x1234, MessageType::Discover),
        );
        writer.write_frame(&discover).await.unwrap();
        let offer = read_until(&mut reader, |frame| {
            let eth = EthernetFrame::new_checked(frame).ok()?;
            let ip = Ipv4Packet::new_checked(eth.payload()).ok()?;
            let udp = UdpPacket::new_checked(ip.payload()).ok()?;
            (udp.dst_port() == 68).then(|| udp.payload().to_vec())
        })
        .await;
        assert_eq!(&offer[16..20], &CLIENT_IP.octets());
        assert_eq!(reply_option(&offer, 53), Some(vec![MessageType::Offer as u8]));

        // ARP so the gateway learns the client, then DNS over TCP to
        // gateway:53.
        writer.write_frame(&arp_request()).await.unwrap();
        let dns = SocketAddrV4::new(GATEWAY, 53);
        let remote_next = tcp_handshake(&mut reader, &mut writer, dns, 40000, 1000).await;

        let query = build_query(0xbeef, "gateway.ross.internal.", TYPE_A);
        let mut msg = (query.len() as u16).to_be_bytes().to_vec();
        msg.extend_from_slice(&query);
        writer
            .write_frame(&tcp_frame(dns, 40000, 1001, remote_next, PSH | ACK, &msg))
            .await
            .unwrap();

        let data = read_data(&mut reader, dns, 40000).await;
        assert_eq!(u16::from_be_bytes([data[0], data[1]]) as usize, data.len() - 2);
        let reply = &data[2..];
        assert_eq!(&reply[..2], &0xbeefu16.to_be_bytes());
        assert_eq!(rcode(reply), Some(0));
        assert_eq!(answer_count(reply), Some(1));
        assert_eq!(&reply[reply.len() - 4..], &GATEWAY.octets());

        assert_eq!(vn.cam().get(&format_mac(&CLIENT_MAC)), Some(&0));
        assert!(vn.bytes_received() > 0);
        assert!(vn.bytes_sent() > 0);
        assert_eq!(
            vn.leases().get("192.168.127.2").map(String::as_str),
            Some(format_mac(&CLIENT_MAC).as_str())
        );

        let res = vn
            .mux()
            .oneshot(Request::get("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats["Connections"], 1);

        let res = vn
            .mux()
            .oneshot(Request::get("/dhcp/leases").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        vn.shutdown();
    }

    #[tokio::test]
    async fn test_tcp_to_nat_address_is_dialed_on_host() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(b"world").await.unwrap();
            buf
        });

        let vn = Arc::new(VirtualNetwork::new(config()).await.unwrap());
        let (mut reader, mut writer) = attach(&vn);
        writer.write_frame(&arp_request()).await.unwrap();

        let target = SocketAddrV4::new(HOST, port);
        let remote_next = tcp_handshake(&mut reader, &mut writer, target, 40001, 5000).await;
        writer
            .write_frame(&tcp_frame(target, 40001, 5001, remote_next, PSH | ACK, b"hello"))
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&received, b"hello");
        assert_eq!(read_data(&mut reader, target, 40001).await, b"world");

        writer
            .write_frame(&tcp_frame(target, 40001, 5006, remote_next.wrapping_add(5), FIN | ACK, &[]))
            .await
            .unwrap();
        vn.shutdown();
    }

    #[tokio::test]
    async fn test_tcp_to_unreachable_nat_address_is_reset() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let vn = Arc::new(VirtualNetwork::new(config()).await.unwrap());
        let (mut reader, mut writer) = attach(&vn);
        writer.write_frame(&arp_request()).await.unwrap();

        let target = SocketAddrV4::new(HOST, port);
        writer
            .write_frame(&tcp_frame(target, 40002, 7000, 0, SYN, &[]))
            .await
            .unwrap();
        let rst = read_until(&mut reader, |frame| {
            parse_segment(frame).filter(|s| s.src == target && s.dst_port == 40002 && s.rst)
        })
        .await;
        assert!(rst.has_ack);
        assert_eq!(rst.ack, 7001);
        vn.shutdown();
    }

    #[tokio::test]
    async fn test_invalid_configuration() {
        let mut config = config();
        config.mtu = 10;
        assert!(VirtualNetwork::new(config).await.is_err());

        let mut config = self::config();
        config.subnet = "192.168.127.0".to_string();
        assert!(VirtualNetwork::new(config).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_forward_fails() {
        let mut config = config();
        config.forwards = HashMap::from([("127.0.0.1:0".to_string(), "not-an-address".to_string())]);
        assert!(VirtualNetwork::new(config).await.is_err());
    }
}
