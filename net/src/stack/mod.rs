//! Userspace TCP/IP stack of the gateway.
//!
//! A single task owns the smoltcp interface. Frames delivered by the switch
//! are classified first: DHCP, DNS and forwarded UDP never reach smoltcp, and
//! TCP SYNs are held until the host side of the connection is ready. Everything
//! else (ARP for the gateway, ICMP, established TCP segments) goes through
//! smoltcp.

mod device;

pub use device::GatewayDevice;

use crate::arp;
use crate::dhcp::DhcpServer;
use crate::dns::DnsServer;
use crate::error::{NetError, Result};
use crate::eth::{self, UdpFrameAddrs};
use crate::forwarder::nat::NatTable;
use crate::forwarder::tcp::{SynInfo, TcpForwarder};
use crate::forwarder::udp::UdpForwarder;
use crate::link::LinkEndpoint;
use smoltcp::iface::{Config, Interface, SocketSet};
use smoltcp::time::Instant;
use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, IpAddress, IpCidr, IpProtocol, Ipv4Cidr, Ipv4Packet,
    TcpPacket, UdpPacket,
};
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Buffer of the in-process pipes handed to gateway listeners.
pub const PIPE_BUF_SIZE: usize = 64 * 1024;

/// Backlog of a gateway TCP listener.
const LISTEN_BACKLOG: usize = 128;

/// How long a connection into the guest may take to establish.
pub const GUEST_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound of the idle wait between interface polls.
const MAX_POLL_DELAY: Duration = Duration::from_millis(100);

const EPHEMERAL_START: u16 = 49152;

const BROADCAST_MAC: EthernetAddress = EthernetAddress([0xff; 6]);

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Host side of a forwarded TCP connection.
pub type BoxedStream = Box<dyn AsyncStream>;

/// A UDP datagram sent by a guest.
#[derive(Debug, Clone)]
pub struct UdpDatagram {
    pub src_mac: EthernetAddress,
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub payload: Vec<u8>,
}

pub(crate) enum Command {
    /// Outcome of dialing the host for a held SYN.
    SynResult {
        syn: SynInfo,
        upstream: Option<BoxedStream>,
    },
    /// Opens a TCP connection from the gateway into the guest network.
    ConnectGuest {
        remote: SocketAddrV4,
        reply: oneshot::Sender<io::Result<DuplexStream>>,
    },
}

/// Services frames are dispatched to.
pub struct Services {
    pub dhcp: Arc<DhcpServer>,
    pub dns: Arc<DnsServer>,
    pub udp: Arc<UdpForwarder>,
    pub nat: Arc<NatTable>,
}

pub(crate) enum GatewayAccept {
    NoListener,
    Accepted(DuplexStream),
    Refused,
}

/// State shared between the stack task and its handles.
pub(crate) struct Shared {
    pub gateway_ip: Ipv4Addr,
    pub gateway_mac: EthernetAddress,
    pub subnet: Ipv4Cidr,
    neighbors: RwLock<HashMap<Ipv4Addr, EthernetAddress>>,
    tcp_listeners: Mutex<HashMap<u16, mpsc::Sender<DuplexStream>>>,
    udp_ports: Mutex<HashMap<u16, mpsc::UnboundedSender<UdpDatagram>>>,
    next_udp_port: Mutex<u16>,
}

impl Shared {
    fn learn(&self, ip: Ipv4Addr, mac: EthernetAddress) {
        if ip.is_unspecified() || !mac.is_unicast() {
            return;
        }
        let mut neighbors = self.neighbors.write().unwrap_or_else(|e| e.into_inner());
        if neighbors.get(&ip) != Some(&mac) {
            debug!(ip = %ip, mac = %eth::format_mac(&mac), "learned neighbor");
            neighbors.insert(ip, mac);
        }
    }

    pub fn neighbor(&self, ip: Ipv4Addr) -> Option<EthernetAddress> {
        self.neighbors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&ip)
            .copied()
    }

    pub fn accept_gateway(&self, port: u16) -> GatewayAccept {
        let mut listeners = lock(&self.tcp_listeners);
        let Some(tx) = listeners.get(&port) else {
            return GatewayAccept::NoListener;
        };
        let (ours, theirs) = tokio::io::duplex(PIPE_BUF_SIZE);
        match tx.try_send(theirs) {
            Ok(()) => GatewayAccept::Accepted(ours),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(port, "gateway listener backlog is full");
                GatewayAccept::Refused
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                listeners.remove(&port);
                GatewayAccept::NoListener
            }
        }
    }

    fn udp_port(&self, port: u16) -> Option<mpsc::UnboundedSender<UdpDatagram>> {
        lock(&self.udp_ports).get(&port).cloned()
    }
}

/// Handle to the gateway stack.
#[derive(Clone)]
pub struct Stack {
    shared: Arc<Shared>,
    link: Arc<LinkEndpoint>,
    commands: mpsc::UnboundedSender<Command>,
}

/// The stack task. Created by [`Stack::new`] and driven by [`StackRunner::run`].
pub struct StackRunner {
    iface: Interface,
    device: GatewayDevice,
    sockets: SocketSet<'static>,
    frames: mpsc::UnboundedReceiver<Vec<u8>>,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_tx: mpsc::UnboundedSender<Command>,
    notify: Arc<Notify>,
    link: Arc<LinkEndpoint>,
    shared: Arc<Shared>,
}

impl Stack {
    /// Builds the interface on top of `link` and attaches to it.
    pub fn new(link: Arc<LinkEndpoint>, subnet: Ipv4Cidr) -> (Stack, StackRunner) {
        use crate::switch::VirtualDevice;

        let gateway_ip = link.ip();
        let gateway_mac = link.link_address();

        let mut device = GatewayDevice::new(link.capabilities());
        let mut config = Config::new(gateway_mac.into());
        config.random_seed = rand::random();
        let mut iface = Interface::new(config, &mut device, Instant::now());
        iface.update_ip_addrs(|addrs| {
            if addrs
                .push(IpCidr::new(IpAddress::Ipv4(gateway_ip), subnet.prefix_len()))
                .is_err()
            {
                warn!("cannot add gateway address to the interface");
            }
        });
        // Accept traffic for every destination so flows can be terminated
        // locally and forwarded.
        iface.set_any_ip(true);
        if iface.routes_mut().add_default_ipv4_route(gateway_ip).is_err() {
            warn!("cannot add default route to the interface");
        }

        let (frames_tx, frames) = mpsc::unbounded_channel();
        link.attach(frames_tx);
        let (commands_tx, commands) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            gateway_ip,
            gateway_mac,
            subnet,
            neighbors: RwLock::new(HashMap::new()),
            tcp_listeners: Mutex::new(HashMap::new()),
            udp_ports: Mutex::new(HashMap::new()),
            next_udp_port: Mutex::new(EPHEMERAL_START),
        });

        let stack = Stack {
            shared: shared.clone(),
            link: link.clone(),
            commands: commands_tx.clone(),
        };
        let runner = StackRunner {
            iface,
            device,
            sockets: SocketSet::new(vec![]),
            frames,
            commands,
            commands_tx,
            notify: Arc::new(Notify::new()),
            link,
            shared,
        };
        (stack, runner)
    }

    pub fn gateway_ip(&self) -> Ipv4Addr {
        self.shared.gateway_ip
    }

    pub fn gateway_mac(&self) -> EthernetAddress {
        self.shared.gateway_mac
    }

    pub fn link(&self) -> &Arc<LinkEndpoint> {
        &self.link
    }

    /// Listens for guest TCP connections to the gateway address on `port`.
    pub fn listen(&self, port: u16) -> Result<GatewayListener> {
        let mut listeners = lock(&self.shared.tcp_listeners);
        if listeners.get(&port).is_some_and(|tx| !tx.is_closed()) {
            return Err(NetError::Stack(format!("port {} is already in use", port)));
        }
        let (tx, rx) = mpsc::channel(LISTEN_BACKLOG);
        listeners.insert(port, tx);
        debug!(port, "gateway listener registered");
        Ok(GatewayListener {
            port,
            rx,
            shared: self.shared.clone(),
        })
    }

    /// Binds an ephemeral UDP port on the gateway address.
    pub fn bind_udp(&self) -> Result<GatewayUdpSocket> {
        let mut ports = lock(&self.shared.udp_ports);
        let mut next = lock(&self.shared.next_udp_port);
        let span = (u16::MAX - EPHEMERAL_START) as u32 + 1;
        for _ in 0..span {
            let port = *next;
            *next = if port == u16::MAX { EPHEMERAL_START } else { port + 1 };
            if ports.contains_key(&port) {
                continue;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            ports.insert(port, tx);
            return Ok(GatewayUdpSocket {
                port,
                rx,
                shared: self.shared.clone(),
                link: self.link.clone(),
            });
        }
        Err(NetError::Stack("no free gateway UDP port".to_string()))
    }

    /// Opens a TCP connection from the gateway to `remote` in the guest
    /// network.
    pub async fn connect(&self, remote: SocketAddrV4) -> Result<DuplexStream> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::ConnectGuest { remote, reply })
            .map_err(|_| NetError::Stack("network stack is not running".to_string()))?;
        match tokio::time::timeout(GUEST_CONNECT_TIMEOUT, rx).await {
            Ok(Ok(Ok(stream))) => Ok(stream),
            Ok(Ok(Err(e))) => Err(e.into()),
            Ok(Err(_)) => Err(NetError::Stack("network stack is not running".to_string())),
            Err(_) => Err(NetError::Stack(format!("connection to {} timed out", remote))),
        }
    }
}

impl StackRunner {
    /// Runs the stack until `cancel` fires or the link endpoint goes away.
    pub async fn run(mut self, services: Services, cancel: CancellationToken) {
        let mut tcp = TcpForwarder::new(
            services.nat.clone(),
            self.shared.clone(),
            self.commands_tx.clone(),
            self.notify.clone(),
        );
        info!(gateway = %self.shared.gateway_ip, "network stack started");

        loop {
            self.iface.poll(Instant::now(), &mut self.device, &mut self.sockets);
            tcp.poll(&mut self.sockets);
            self.iface.poll(Instant::now(), &mut self.device, &mut self.sockets);
            self.flush().await;

            let delay = self
                .iface
                .poll_delay(Instant::now(), &self.sockets)
                .map(|d| Duration::from_micros(d.total_micros()))
                .unwrap_or(MAX_POLL_DELAY)
                .min(MAX_POLL_DELAY);

            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = self.frames.recv() => {
                    let Some(frame) = frame else { break };
                    self.dispatch(frame, &services, &mut tcp).await;
                    while let Ok(frame) = self.frames.try_recv() {
                        self.dispatch(frame, &services, &mut tcp).await;
                    }
                }
                Some(command) = self.commands.recv() => {
                    self.command(command, &mut tcp).await;
                }
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!("network stack stopped");
    }

    async fn flush(&mut self) {
        for frame in self.device.drain_tx() {
            self.link.write_packet(frame).await;
        }
    }

    async fn command(&mut self, command: Command, tcp: &mut TcpForwarder) {
        match command {
            Command::SynResult { syn, upstream } => {
                if let Some(rst) = tcp.on_syn_result(syn, upstream, &mut self.sockets, &mut self.device) {
                    self.link.write_packet(rst).await;
                }
            }
            Command::ConnectGuest { remote, reply } => {
                tcp.connect_guest(&mut self.iface, &mut self.sockets, remote, reply);
            }
        }
    }

    async fn dispatch(&mut self, frame: Vec<u8>, services: &Services, tcp: &mut TcpForwarder) {
        match classify(&frame, &self.shared, self.link.virtual_ips()) {
            Inbound::Reply(reply) => {
                self.link.write_packet(reply).await;
            }
            Inbound::Dhcp(dgram) => {
                if let Some(reply) = services.dhcp.handle(&dgram.payload) {
                    let addrs = UdpFrameAddrs {
                        src_mac: self.shared.gateway_mac,
                        dst_mac: BROADCAST_MAC,
                        src_ip: self.shared.gateway_ip,
                        dst_ip: Ipv4Addr::BROADCAST,
                        src_port: 67,
                        dst_port: 68,
                    };
                    self.link.write_packet(eth::build_udp_frame(&addrs, &reply)).await;
                }
            }
            Inbound::Dns(dgram) => {
                let dns = services.dns.clone();
                let link = self.link.clone();
                let gateway_mac = self.shared.gateway_mac;
                tokio::spawn(async move {
                    let Some(reply) = dns.handle(&dgram.payload).await else {
                        return;
                    };
                    let addrs = UdpFrameAddrs {
                        src_mac: gateway_mac,
                        dst_mac: dgram.src_mac,
                        src_ip: *dgram.dst.ip(),
                        dst_ip: *dgram.src.ip(),
                        src_port: dgram.dst.port(),
                        dst_port: dgram.src.port(),
                    };
                    link.write_packet(eth::build_udp_frame(&addrs, &reply)).await;
                });
            }
            Inbound::GatewayUdp(dgram) => match self.shared.udp_port(dgram.dst.port()) {
                Some(tx) => {
                    if tx.send(dgram).is_err() {
                        debug!("gateway UDP socket closed, dropping datagram");
                    }
                }
                None => services.udp.forward(dgram),
            },
            Inbound::Udp(dgram) => services.udp.forward(dgram),
            Inbound::TcpSyn(syn) => {
                if let Some(rst) = tcp.on_syn(syn, &mut self.sockets, &mut self.device) {
                    self.link.write_packet(rst).await;
                }
            }
            Inbound::Stack => self.device.inject_rx(frame),
            Inbound::Drop => {}
        }
    }
}

pub(crate) enum Inbound {
    /// Answered directly by the gateway.
    Reply(Vec<u8>),
    Dhcp(UdpDatagram),
    Dns(UdpDatagram),
    GatewayUdp(UdpDatagram),
    Udp(UdpDatagram),
    TcpSyn(SynInfo),
    Stack,
    Drop,
}

/// Decides where an inbound frame goes, learning the sender on the way.
pub(crate) fn classify(frame: &[u8], shared: &Shared, virtual_ips: &[Ipv4Addr]) -> Inbound {
    let Ok(eth_frame) = EthernetFrame::new_checked(frame) else {
        return Inbound::Drop;
    };
    let src_mac = eth_frame.src_addr();

    match eth_frame.ethertype() {
        EthernetProtocol::Arp => {
            if let Some((ip, mac)) = arp::sender(eth_frame.payload()) {
                shared.learn(ip, mac);
            }
            match arp::reply_for_virtual_ip(eth_frame.payload(), shared.gateway_mac, virtual_ips) {
                Some(reply) => Inbound::Reply(reply),
                None => Inbound::Stack,
            }
        }
        EthernetProtocol::Ipv4 => {
            let Ok(ip) = Ipv4Packet::new_checked(eth_frame.payload()) else {
                return Inbound::Drop;
            };
            let (src_ip, dst_ip) = (ip.src_addr(), ip.dst_addr());
            shared.learn(src_ip, src_mac);

            match ip.next_header() {
                IpProtocol::Udp => {
                    let Ok(udp) = UdpPacket::new_checked(ip.payload()) else {
                        return Inbound::Drop;
                    };
                    let dgram = UdpDatagram {
                        src_mac,
                        src: SocketAddrV4::new(src_ip, udp.src_port()),
                        dst: SocketAddrV4::new(dst_ip, udp.dst_port()),
                        payload: udp.payload().to_vec(),
                    };
                    if udp.dst_port() == 67 {
                        Inbound::Dhcp(dgram)
                    } else if dst_ip == shared.gateway_ip && udp.dst_port() == 53 {
                        Inbound::Dns(dgram)
                    } else if dst_ip == shared.gateway_ip {
                        Inbound::GatewayUdp(dgram)
                    } else {
                        Inbound::Udp(dgram)
                    }
                }
                IpProtocol::Tcp => {
                    let Ok(tcp) = TcpPacket::new_checked(ip.payload()) else {
                        return Inbound::Drop;
                    };
                    if tcp.syn() && !tcp.ack() {
                        Inbound::TcpSyn(SynInfo {
                            guest_mac: src_mac,
                            src: SocketAddrV4::new(src_ip, tcp.src_port()),
                            dst: SocketAddrV4::new(dst_ip, tcp.dst_port()),
                            seq: tcp.seq_number().0 as u32,
                            frame: frame.to_vec(),
                        })
                    } else {
                        Inbound::Stack
                    }
                }
                _ => Inbound::Stack,
            }
        }
        _ => Inbound::Drop,
    }
}

/// Guest TCP connections to one port of the gateway address.
pub struct GatewayListener {
    port: u16,
    rx: mpsc::Receiver<DuplexStream>,
    shared: Arc<Shared>,
}

impl GatewayListener {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Waits for the next guest connection. Returns `None` once the stack
    /// is gone.
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.rx.recv().await
    }
}

impl Drop for GatewayListener {
    fn drop(&mut self) {
        lock(&self.shared.tcp_listeners).remove(&self.port);
    }
}

/// A UDP port bound on the gateway address.
pub struct GatewayUdpSocket {
    port: u16,
    rx: mpsc::UnboundedReceiver<UdpDatagram>,
    shared: Arc<Shared>,
    link: Arc<LinkEndpoint>,
}

impl GatewayUdpSocket {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn recv(&mut self) -> Option<UdpDatagram> {
        self.rx.recv().await
    }

    /// Sends `payload` from the gateway to `remote`. Returns false when the
    /// frame was dropped.
    pub async fn send_to(&self, payload: &[u8], remote: SocketAddrV4) -> bool {
        let dst_mac = self.shared.neighbor(*remote.ip()).unwrap_or(BROADCAST_MAC);
        let addrs = UdpFrameAddrs {
            src_mac: self.shared.gateway_mac,
            dst_mac,
            src_ip: self.shared.gateway_ip,
            dst_ip: *remote.ip(),
            src_port: self.port,
            dst_port: remote.port(),
        };
        self.link.write_packet(eth::build_udp_frame(&addrs, payload)).await
    }
}

impl Drop for GatewayUdpSocket {
    fn drop(&mut self) {
        lock(&self.shared.udp_ports).remove(&self.port);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eth::UdpFrameAddrs;

    const GUEST_MAC: EthernetAddress = EthernetAddress([0x52, 0x54, 0, 0, 0, 1]);
    const GW_MAC: EthernetAddress = EthernetAddress([0x02, 0x52, 0x4f, 0x53, 0x53, 0x01]);

    fn shared() -> Shared {
        Shared {
            gateway_ip: Ipv4Addr::new(192, 168, 127, 1),
            gateway_mac: GW_MAC,
            subnet: Ipv4Cidr::new(Ipv4Addr::new(192, 168, 127, 0), 24),
            neighbors: RwLock::new(HashMap::new()),
            tcp_listeners: Mutex::new(HashMap::new()),
            udp_ports: Mutex::new(HashMap::new()),
            next_udp_port: Mutex::new(EPHEMERAL_START),
        }
    }

    fn udp(dst_ip: Ipv4Addr, dst_port: u16) -> Vec<u8> {
        eth::build_udp_frame(
            &UdpFrameAddrs {
                src_mac: GUEST_MAC,
                dst_mac: GW_MAC,
                src_ip: Ipv4Addr::new(192, 168, 127, 2),
                dst_ip,
                src_port: 40000,
                dst_port,
            },
            b"payload",
        )
    }

    #[test]
    fn test_classify_udp() {
        let shared = shared();
        let gw = Ipv4Addr::new(192, 168, 127, 1);
        assert!(matches!(classify(&udp(Ipv4Addr::BROADCAST, 67), &shared, &[]), Inbound::Dhcp(_)));
        assert!(matches!(classify(&udp(gw, 53), &shared, &[]), Inbound::Dns(_)));
        assert!(matches!(classify(&udp(gw, 5000), &shared, &[]), Inbound::GatewayUdp(_)));
        match classify(&udp(Ipv4Addr::new(8, 8, 8, 8), 53), &shared, &[]) {
            Inbound::Udp(d) => {
                assert_eq!(d.dst, SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53));
                assert_eq!(d.payload, b"payload");
            }
            _ => panic!("expected forwarded UDP"),
        }
        assert_eq!(shared.neighbor(Ipv4Addr::new(192, 168, 127, 2)), Some(GUEST_MAC));
    }

    #[test]
    fn test_classify_garbage_is_dropped() {
        let shared = shared();
        assert!(matches!(classify(&[0u8; 8], &shared, &[]), Inbound::Drop));
    }

    #[test]
    fn test_gateway_accept_without_listener() {
        let shared = shared();
        assert!(matches!(shared.accept_gateway(80), GatewayAccept::NoListener));
    }
}
