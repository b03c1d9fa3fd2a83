//! TCP forwarding between smoltcp sockets and host streams.
//!
//! A guest SYN is held back until the host side is ready: a gateway listener
//! hands out an in-process pipe, any other destination is dialed on the host.
//! Only then is a listening socket created and the SYN fed to smoltcp, so a
//! refused host connection turns into a RST instead of an accepted and
//! immediately closed guest connection.

use crate::eth::{self, ETHERTYPE_IPV4, IP_PROTO_TCP};
use crate::forwarder::nat::{is_link_local, NatTable};
use crate::stack::{BoxedStream, Command, GatewayAccept, Shared, PIPE_BUF_SIZE};
use smoltcp::iface::{Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp;
use smoltcp::wire::{EthernetAddress, IpAddress, IpEndpoint, IpListenEndpoint};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, warn};

const SOCKET_BUF_SIZE: usize = 64 * 1024;
const RELAY_CHANNEL: usize = 64;
const READ_BUF_SIZE: usize = 32 * 1024;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// How long an accepted host connection waits for smoltcp to take the SYN.
const READY_TTL: Duration = Duration::from_secs(10);

const EPHEMERAL_START: u16 = 49152;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
}

/// A SYN held until the host side of the connection is known.
#[derive(Debug, Clone)]
pub struct SynInfo {
    pub guest_mac: EthernetAddress,
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub seq: u32,
    pub frame: Vec<u8>,
}

impl SynInfo {
    pub fn key(&self) -> FlowKey {
        FlowKey {
            src: self.src,
            dst: self.dst,
        }
    }
}

struct Ready {
    upstream: BoxedStream,
    created: Instant,
}

struct Flow {
    label: String,
    h2g_rx: mpsc::Receiver<Vec<u8>>,
    g2h_tx: Option<mpsc::Sender<Vec<u8>>>,
    pending_send: Option<Vec<u8>>,
    host_eof: bool,
    host_disconnected: bool,
    /// Connections opened by the gateway are handed out once established.
    established: Option<(oneshot::Sender<io::Result<DuplexStream>>, DuplexStream)>,
}

pub struct TcpForwarder {
    nat: Arc<NatTable>,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    notify: Arc<Notify>,
    /// Flows being dialed, with the sequence number of their SYN.
    pending: HashMap<FlowKey, u32>,
    ready: HashMap<FlowKey, Ready>,
    listeners: HashMap<SocketHandle, SocketAddrV4>,
    flows: HashMap<SocketHandle, Flow>,
    next_port: u16,
}

impl TcpForwarder {
    pub(crate) fn new(
        nat: Arc<NatTable>,
        shared: Arc<Shared>,
        commands: mpsc::UnboundedSender<Command>,
        notify: Arc<Notify>,
    ) -> Self {
        Self {
            nat,
            shared,
            commands,
            notify,
            pending: HashMap::new(),
            ready: HashMap::new(),
            listeners: HashMap::new(),
            flows: HashMap::new(),
            next_port: EPHEMERAL_START,
        }
    }

    pub fn active(&self) -> usize {
        self.flows.len()
    }

    /// Handles a guest SYN. Returns a RST to send back when the connection is
    /// rejected right away.
    pub(crate) fn on_syn(
        &mut self,
        syn: SynInfo,
        sockets: &mut SocketSet<'static>,
        device: &mut crate::stack::GatewayDevice,
    ) -> Option<Vec<u8>> {
        let key = syn.key();
        let dst_ip = *syn.dst.ip();

        if is_link_local(dst_ip) {
            debug!(dst = %syn.dst, "rejecting connection to link-local address");
            return Some(build_rst(&syn, self.shared.gateway_mac));
        }
        if self.pending.get(&key) == Some(&syn.seq) || self.ready.contains_key(&key) {
            debug!(src = %syn.src, dst = %syn.dst, "retransmitted SYN dropped");
            return None;
        }

        if dst_ip == self.shared.gateway_ip {
            match self.shared.accept_gateway(syn.dst.port()) {
                GatewayAccept::Accepted(upstream) => {
                    return self.accept(syn, Box::new(upstream), sockets, device);
                }
                GatewayAccept::Refused => return Some(build_rst(&syn, self.shared.gateway_mac)),
                GatewayAccept::NoListener => {}
            }
        }

        self.pending.insert(key, syn.seq);
        let target = SocketAddrV4::new(self.nat.translate(dst_ip), syn.dst.port());
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let upstream = match tokio::time::timeout(DIAL_TIMEOUT, tokio::net::TcpStream::connect(target)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    debug!(target = %target, "connected");
                    Some(Box::new(stream) as BoxedStream)
                }
                Ok(Err(e)) => {
                    debug!(target = %target, error = %e, "connect failed");
                    None
                }
                Err(_) => {
                    debug!(target = %target, "connect timed out");
                    None
                }
            };
            let _ = commands.send(Command::SynResult { syn, upstream });
        });
        None
    }

    /// Completes a held SYN once its dial finished.
    pub(crate) fn on_syn_result(
        &mut self,
        syn: SynInfo,
        upstream: Option<BoxedStream>,
        sockets: &mut SocketSet<'static>,
        device: &mut crate::stack::GatewayDevice,
    ) -> Option<Vec<u8>> {
        let key = syn.key();
        if self.pending.get(&key) != Some(&syn.seq) {
            debug!(src = %syn.src, dst = %syn.dst, "stale connect result");
            return None;
        }
        self.pending.remove(&key);

        match upstream {
            Some(upstream) => self.accept(syn, upstream, sockets, device),
            None => Some(build_rst(&syn, self.shared.gateway_mac)),
        }
    }

    fn accept(
        &mut self,
        syn: SynInfo,
        upstream: BoxedStream,
        sockets: &mut SocketSet<'static>,
        device: &mut crate::stack::GatewayDevice,
    ) -> Option<Vec<u8>> {
        let mut socket = new_socket();
        let endpoint = IpListenEndpoint {
            addr: Some(IpAddress::Ipv4(*syn.dst.ip())),
            port: syn.dst.port(),
        };
        if let Err(e) = socket.listen(endpoint) {
            warn!(dst = %syn.dst, error = ?e, "cannot listen");
            return Some(build_rst(&syn, self.shared.gateway_mac));
        }
        let handle = sockets.add(socket);
        self.listeners.insert(handle, syn.dst);
        self.ready.insert(
            syn.key(),
            Ready {
                upstream,
                created: Instant::now(),
            },
        );
        device.inject_rx(syn.frame);
        None
    }

    /// Opens a connection from the gateway address to `remote`.
    pub(crate) fn connect_guest(
        &mut self,
        iface: &mut Interface,
        sockets: &mut SocketSet<'static>,
        remote: SocketAddrV4,
        reply: oneshot::Sender<io::Result<DuplexStream>>,
    ) {
        let local_port = self.next_ephemeral();
        let mut socket = new_socket();
        if let Err(e) = socket.connect(
            iface.context(),
            (IpAddress::Ipv4(*remote.ip()), remote.port()),
            (IpAddress::Ipv4(self.shared.gateway_ip), local_port),
        ) {
            let _ = reply.send(Err(io::Error::other(format!("cannot connect to {}: {:?}", remote, e))));
            return;
        }
        let handle = sockets.add(socket);
        let (ours, theirs) = tokio::io::duplex(PIPE_BUF_SIZE);
        self.start_flow(handle, remote.to_string(), Box::new(ours), Some((reply, theirs)));
    }

    fn next_ephemeral(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = if port == u16::MAX { EPHEMERAL_START } else { port + 1 };
        port
    }

    fn start_flow(
        &mut self,
        handle: SocketHandle,
        label: String,
        upstream: BoxedStream,
        established: Option<(oneshot::Sender<io::Result<DuplexStream>>, DuplexStream)>,
    ) {
        let (h2g_tx, h2g_rx) = mpsc::channel(RELAY_CHANNEL);
        let (g2h_tx, g2h_rx) = mpsc::channel(RELAY_CHANNEL);
        tokio::spawn(relay(upstream, label.clone(), h2g_tx, g2h_rx, self.notify.clone()));
        self.flows.insert(
            handle,
            Flow {
                label,
                h2g_rx,
                g2h_tx: Some(g2h_tx),
                pending_send: None,
                host_eof: false,
                host_disconnected: false,
                established,
            },
        );
    }

    /// Moves data between sockets and host streams.
    pub fn poll(&mut self, sockets: &mut SocketSet<'static>) {
        self.detect_accepted(sockets);
        self.expire_ready(sockets);
        self.relay_all(sockets);
        self.cleanup(sockets);
    }

    fn detect_accepted(&mut self, sockets: &mut SocketSet<'static>) {
        let accepted: Vec<(SocketHandle, FlowKey)> = self
            .listeners
            .keys()
            .filter_map(|&handle| {
                let socket = sockets.get::<tcp::Socket>(handle);
                if !socket.is_active() {
                    return None;
                }
                let key = FlowKey {
                    src: to_v4(socket.remote_endpoint()?),
                    dst: to_v4(socket.local_endpoint()?),
                };
                Some((handle, key))
            })
            .collect();

        for (handle, key) in accepted {
            self.listeners.remove(&handle);
            match self.ready.remove(&key) {
                Some(ready) => {
                    debug!(src = %key.src, dst = %key.dst, "connection accepted");
                    self.start_flow(handle, key.dst.to_string(), ready.upstream, None);
                }
                None => {
                    debug!(src = %key.src, dst = %key.dst, "no host connection for accepted socket");
                    sockets.get_mut::<tcp::Socket>(handle).abort();
                    let (h2g_tx, h2g_rx) = mpsc::channel(1);
                    drop(h2g_tx);
                    self.flows.insert(
                        handle,
                        Flow {
                            label: key.dst.to_string(),
                            h2g_rx,
                            g2h_tx: None,
                            pending_send: None,
                            host_eof: false,
                            host_disconnected: true,
                            established: None,
                        },
                    );
                }
            }
        }
    }

    fn expire_ready(&mut self, sockets: &mut SocketSet<'static>) {
        let expired: Vec<FlowKey> = self
            .ready
            .iter()
            .filter(|(_, ready)| ready.created.elapsed() > READY_TTL)
            .map(|(key, _)| *key)
            .collect();
        for key in expired {
            debug!(src = %key.src, dst = %key.dst, "guest never completed the handshake");
            self.ready.remove(&key);
            let idle = self
                .listeners
                .iter()
                .find(|(handle, dst)| {
                    **dst == key.dst && sockets.get::<tcp::Socket>(**handle).state() == tcp::State::Listen
                })
                .map(|(handle, _)| *handle);
            if let Some(handle) = idle {
                self.listeners.remove(&handle);
                sockets.remove(handle);
            }
        }
    }

    fn relay_all(&mut self, sockets: &mut SocketSet<'static>) {
        for (&handle, flow) in self.flows.iter_mut() {
            let socket = sockets.get_mut::<tcp::Socket>(handle);

            if let Some((reply, stream)) = flow.established.take() {
                match socket.state() {
                    tcp::State::Established => {
                        let _ = reply.send(Ok(stream));
                    }
                    tcp::State::SynSent => flow.established = Some((reply, stream)),
                    _ => {
                        let _ = reply.send(Err(io::Error::new(
                            io::ErrorKind::ConnectionRefused,
                            format!("connection to {} refused", flow.label),
                        )));
                    }
                }
            }

            // Host to guest.
            while socket.can_send() {
                if let Some(pending) = flow.pending_send.take() {
                    match socket.send_slice(&pending) {
                        Ok(sent) if sent < pending.len() => {
                            flow.pending_send = Some(pending[sent..].to_vec());
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            debug!(flow = %flow.label, error = ?e, "send failed");
                            flow.pending_send = Some(pending);
                            break;
                        }
                    }
                }

                match flow.h2g_rx.try_recv() {
                    Ok(data) if data.is_empty() => {
                        flow.host_eof = true;
                        break;
                    }
                    Ok(data) => match socket.send_slice(&data) {
                        Ok(sent) if sent < data.len() => {
                            flow.pending_send = Some(data[sent..].to_vec());
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            debug!(flow = %flow.label, error = ?e, "send failed");
                            break;
                        }
                    },
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        flow.host_disconnected = true;
                        break;
                    }
                }
            }

            if !flow.host_disconnected && !flow.host_eof && flow.pending_send.is_none() && !socket.can_send() {
                match flow.h2g_rx.try_recv() {
                    Ok(data) if data.is_empty() => flow.host_eof = true,
                    Ok(data) => flow.pending_send = Some(data),
                    Err(mpsc::error::TryRecvError::Disconnected) => flow.host_disconnected = true,
                    Err(mpsc::error::TryRecvError::Empty) => {}
                }
            }

            // FIN once everything the host sent is queued.
            if flow.host_eof && flow.pending_send.is_none() && socket.may_send() {
                socket.close();
                flow.host_eof = false;
            }

            if flow.host_disconnected && !flow.host_eof {
                match socket.state() {
                    tcp::State::SynSent | tcp::State::SynReceived => {
                        socket.abort();
                        continue;
                    }
                    tcp::State::Closed | tcp::State::TimeWait => {}
                    _ => socket.close(),
                }
            }

            // Guest to host.
            if socket.may_recv() {
                if let Some(tx) = &flow.g2h_tx {
                    let label = &flow.label;
                    let _ = socket.recv(|buf| {
                        if buf.is_empty() {
                            return (0, ());
                        }
                        match tx.try_send(buf.to_vec()) {
                            Ok(()) => (buf.len(), ()),
                            // Leave the bytes in the socket, the window shrinks.
                            Err(mpsc::error::TrySendError::Full(_)) => (0, ()),
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                debug!(flow = %label, "host writer gone, discarding data");
                                (buf.len(), ())
                            }
                        }
                    });
                }
            }

            let guest_fin = matches!(
                socket.state(),
                tcp::State::CloseWait
                    | tcp::State::LastAck
                    | tcp::State::Closing
                    | tcp::State::TimeWait
                    | tcp::State::Closed
            );
            if guest_fin && socket.recv_queue() == 0 {
                flow.g2h_tx = None;
            }
        }
    }

    fn cleanup(&mut self, sockets: &mut SocketSet<'static>) {
        let closed: Vec<SocketHandle> = self
            .flows
            .keys()
            .copied()
            .filter(|&handle| !sockets.get::<tcp::Socket>(handle).is_open())
            .collect();
        for handle in closed {
            if let Some(flow) = self.flows.remove(&handle) {
                debug!(flow = %flow.label, "connection closed");
            }
            sockets.remove(handle);
        }
    }
}

fn new_socket() -> tcp::Socket<'static> {
    let rx = tcp::SocketBuffer::new(vec![0u8; SOCKET_BUF_SIZE]);
    let tx = tcp::SocketBuffer::new(vec![0u8; SOCKET_BUF_SIZE]);
    let mut socket = tcp::Socket::new(rx, tx);
    socket.set_nagle_enabled(false);
    socket.set_ack_delay(None);
    socket
}

fn to_v4(ep: IpEndpoint) -> SocketAddrV4 {
    let IpAddress::Ipv4(ip) = ep.addr;
    SocketAddrV4::new(ip, ep.port)
}

/// Copies bytes between a host stream and the channels of one flow. An empty
/// message on `h2g_tx` signals EOF from the host.
async fn relay(
    upstream: BoxedStream,
    label: String,
    h2g_tx: mpsc::Sender<Vec<u8>>,
    mut g2h_rx: mpsc::Receiver<Vec<u8>>,
    notify: Arc<Notify>,
) {
    let (mut reader, mut writer) = tokio::io::split(upstream);

    let read_notify = notify.clone();
    let read_label = label.clone();
    let read = async move {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    let _ = h2g_tx.send(Vec::new()).await;
                    break;
                }
                Ok(n) => {
                    if h2g_tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(flow = %read_label, error = %e, "host read failed");
                    break;
                }
            }
            read_notify.notify_one();
        }
        drop(h2g_tx);
        read_notify.notify_one();
    };

    let write = async move {
        while let Some(data) = g2h_rx.recv().await {
            if let Err(e) = writer.write_all(&data).await {
                debug!(flow = %label, error = %e, "host write failed");
                break;
            }
            notify.notify_one();
        }
        let _ = writer.shutdown().await;
    };

    tokio::join!(read, write);
}

/// RST|ACK answering `syn`, sent from its destination.
pub fn build_rst(syn: &SynInfo, gateway_mac: EthernetAddress) -> Vec<u8> {
    let mut segment = [0u8; 20];
    segment[0..2].copy_from_slice(&syn.dst.port().to_be_bytes());
    segment[2..4].copy_from_slice(&syn.src.port().to_be_bytes());
    segment[8..12].copy_from_slice(&syn.seq.wrapping_add(1).to_be_bytes());
    segment[12] = 0x50;
    segment[13] = 0x14;
    let cksum = eth::tcp_udp_checksum(*syn.dst.ip(), *syn.src.ip(), IP_PROTO_TCP, &segment);
    segment[16..18].copy_from_slice(&cksum.to_be_bytes());

    let mut frame = Vec::with_capacity(eth::ETH_HEADER_LEN + eth::IPV4_HEADER_LEN + segment.len());
    frame.extend_from_slice(&eth::build_eth_header(syn.guest_mac, gateway_mac, ETHERTYPE_IPV4));
    frame.extend_from_slice(&eth::build_ip_header(*syn.dst.ip(), *syn.src.ip(), IP_PROTO_TCP, segment.len()));
    frame.extend_from_slice(&segment);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::wire::{EthernetFrame, Ipv4Packet, TcpPacket};
    use std::net::Ipv4Addr;

    #[test]
    fn test_rst_answers_syn() {
        let syn = SynInfo {
            guest_mac: EthernetAddress([0x52, 0x54, 0, 0, 0, 1]),
            src: SocketAddrV4::new(Ipv4Addr::new(192, 168, 127, 2), 40000),
            dst: SocketAddrV4::new(Ipv4Addr::new(169, 254, 169, 254), 80),
            seq: 1000,
            frame: Vec::new(),
        };
        let gw = EthernetAddress([0x02, 0x52, 0x4f, 0x53, 0x53, 0x01]);
        let frame = build_rst(&syn, gw);

        let eth = EthernetFrame::new_checked(&frame[..]).unwrap();
        assert_eq!(eth.dst_addr(), syn.guest_mac);
        assert_eq!(eth.src_addr(), gw);
        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        assert!(ip.verify_checksum());
        assert_eq!(ip.src_addr(), Ipv4Addr::new(169, 254, 169, 254));
        let tcp = TcpPacket::new_checked(ip.payload()).unwrap();
        assert!(tcp.rst() && tcp.ack());
        assert_eq!(tcp.ack_number().0 as u32, 1001);
        assert_eq!(tcp.src_port(), 80);
        assert_eq!(tcp.dst_port(), 40000);
        assert!(tcp.verify_checksum(&ip.src_addr().into(), &ip.dst_addr().into()));
    }

    #[test]
    fn test_flow_key() {
        let syn = SynInfo {
            guest_mac: EthernetAddress([0x52, 0x54, 0, 0, 0, 1]),
            src: SocketAddrV4::new(Ipv4Addr::new(192, 168, 127, 2), 40000),
            dst: SocketAddrV4::new(Ipv4Addr::new(10, 0, 2, 2), 80),
            seq: 1,
            frame: Vec::new(),
        };
        assert_eq!(syn.key().dst.port(), 80);
        assert_eq!(syn.key(), syn.clone().key());
    }
}
