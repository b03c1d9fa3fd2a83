//! Connection-tracking UDP forwarder.
//!
//! Every guest `(src, dst)` pair gets its own host socket connected to the
//! translated destination. Replies are wrapped back into frames that appear
//! to come from the original destination.

use crate::eth::{self, UdpFrameAddrs};
use crate::forwarder::nat::{is_link_local, NatTable};
use crate::link::LinkEndpoint;
use crate::stack::UdpDatagram;
use smoltcp::wire::{EthernetAddress, Ipv4Cidr};
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65507;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FlowKey {
    src: SocketAddrV4,
    dst: SocketAddrV4,
}

pub struct UdpForwarder {
    nat: Arc<NatTable>,
    link: Arc<LinkEndpoint>,
    gateway_mac: EthernetAddress,
    subnet: Ipv4Cidr,
    timeout: Duration,
    flows: Mutex<HashMap<FlowKey, mpsc::UnboundedSender<Vec<u8>>>>,
    cancel: CancellationToken,
}

impl UdpForwarder {
    pub fn new(
        nat: Arc<NatTable>,
        link: Arc<LinkEndpoint>,
        gateway_mac: EthernetAddress,
        subnet: Ipv4Cidr,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            nat,
            link,
            gateway_mac,
            subnet,
            timeout,
            flows: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    pub fn active(&self) -> usize {
        self.lock().len()
    }

    /// True for destinations that are never forwarded.
    pub fn is_dropped(&self, dst: Ipv4Addr) -> bool {
        is_link_local(dst)
            || dst.is_broadcast()
            || dst.is_multicast()
            || self.subnet.broadcast() == Some(dst)
    }

    /// Sends a guest datagram to its destination, creating the flow on first
    /// use.
    pub fn forward(self: &Arc<Self>, dgram: UdpDatagram) {
        if self.is_dropped(*dgram.dst.ip()) {
            debug!(dst = %dgram.dst, "dropping UDP datagram");
            return;
        }
        let key = FlowKey {
            src: dgram.src,
            dst: dgram.dst,
        };

        let mut flows = self.lock();
        if let Some(tx) = flows.get(&key) {
            match tx.send(dgram.payload) {
                Ok(()) => return,
                Err(mpsc::error::SendError(payload)) => {
                    flows.remove(&key);
                    self.spawn_flow(&mut flows, key, dgram.src_mac, payload);
                }
            }
        } else {
            self.spawn_flow(&mut flows, key, dgram.src_mac, dgram.payload);
        }
    }

    fn spawn_flow(
        self: &Arc<Self>,
        flows: &mut HashMap<FlowKey, mpsc::UnboundedSender<Vec<u8>>>,
        key: FlowKey,
        guest_mac: EthernetAddress,
        first: Vec<u8>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(first);
        flows.insert(key, tx.clone());
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run_flow(key, guest_mac, rx).await {
                debug!(src = %key.src, dst = %key.dst, error = %e, "UDP flow failed");
            }
            let mut flows = this.lock();
            if flows.get(&key).is_some_and(|current| current.same_channel(&tx)) {
                flows.remove(&key);
            }
        });
    }

    async fn run_flow(
        &self,
        key: FlowKey,
        guest_mac: EthernetAddress,
        mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> io::Result<()> {
        let target = SocketAddrV4::new(self.nat.translate(*key.dst.ip()), key.dst.port());
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(target).await?;
        debug!(src = %key.src, dst = %key.dst, target = %target, "new UDP flow");

        let addrs = UdpFrameAddrs {
            src_mac: self.gateway_mac,
            dst_mac: guest_mac,
            src_ip: *key.dst.ip(),
            dst_ip: *key.src.ip(),
            src_port: key.dst.port(),
            dst_port: key.src.port(),
        };
        let max_payload = self.link.mtu().saturating_sub(eth::IPV4_HEADER_LEN + eth::UDP_HEADER_LEN);
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut deadline = Instant::now() + self.timeout;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(src = %key.src, dst = %key.dst, "UDP flow expired");
                    return Ok(());
                }
                payload = rx.recv() => {
                    let Some(payload) = payload else { return Ok(()) };
                    if let Err(e) = socket.send(&payload).await {
                        debug!(target = %target, error = %e, "UDP send failed");
                    }
                    deadline = Instant::now() + self.timeout;
                }
                res = socket.recv(&mut buf) => {
                    match res {
                        Ok(n) => {
                            if n > max_payload {
                                debug!(len = n, "UDP reply larger than the MTU, dropping");
                                continue;
                            }
                            self.link.write_packet(eth::build_udp_frame(&addrs, &buf[..n])).await;
                            deadline = Instant::now() + self.timeout;
                        }
                        // ICMP port unreachable from an earlier send.
                        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {}
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<FlowKey, mpsc::UnboundedSender<Vec<u8>>>> {
        self.flows.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::switch::NetworkSwitch;
    use smoltcp::wire::{EthernetFrame, Ipv4Packet, UdpPacket};

    const GW_MAC: EthernetAddress = EthernetAddress([0x02, 0x52, 0x4f, 0x53, 0x53, 0x01]);
    const GUEST_MAC: EthernetAddress = EthernetAddress([0x52, 0x54, 0, 0, 0, 1]);

    /// Captures every frame the link endpoint writes.
    struct Recorder(mpsc::UnboundedSender<Vec<u8>>);

    #[async_trait::async_trait]
    impl NetworkSwitch for Recorder {
        async fn deliver_network_packet(&self, frame: Vec<u8>) {
            let _ = self.0.send(frame);
        }
    }

    fn forwarder(
        nat: HashMap<Ipv4Addr, Ipv4Addr>,
    ) -> (Arc<UdpForwarder>, mpsc::UnboundedReceiver<Vec<u8>>, Arc<dyn NetworkSwitch>) {
        let link = Arc::new(LinkEndpoint::new(false, 1500, GW_MAC, Ipv4Addr::new(192, 168, 127, 1), vec![]));
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder: Arc<dyn NetworkSwitch> = Arc::new(Recorder(tx));
        link.connect(&recorder);
        let fwd = Arc::new(UdpForwarder::new(
            Arc::new(NatTable::new(nat)),
            link,
            GW_MAC,
            Ipv4Cidr::new(Ipv4Addr::new(192, 168, 127, 0), 24),
            Duration::from_secs(5),
            CancellationToken::new(),
        ));
        (fwd, rx, recorder)
    }

    #[test]
    fn test_dropped_destinations() {
        let fwd = UdpForwarder::new(
            Arc::new(NatTable::new(HashMap::new())),
            Arc::new(LinkEndpoint::new(false, 1500, GW_MAC, Ipv4Addr::new(192, 168, 127, 1), vec![])),
            GW_MAC,
            Ipv4Cidr::new(Ipv4Addr::new(192, 168, 127, 0), 24),
            Duration::from_secs(5),
            CancellationToken::new(),
        );
        assert!(fwd.is_dropped(Ipv4Addr::new(169, 254, 1, 1)));
        assert!(fwd.is_dropped(Ipv4Addr::BROADCAST));
        assert!(fwd.is_dropped(Ipv4Addr::new(192, 168, 127, 255)));
        assert!(fwd.is_dropped(Ipv4Addr::new(224, 0, 0, 251)));
        assert!(!fwd.is_dropped(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[tokio::test]
    async fn test_forward_through_nat_and_reply() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, peer) = echo.recv_from(&mut buf).await.unwrap();
            echo.send_to(&buf[..n], peer).await.unwrap();
        });

        let virtual_host = Ipv4Addr::new(192, 168, 127, 254);
        let (fwd, mut frames, _keep) = forwarder(HashMap::from([(virtual_host, Ipv4Addr::LOCALHOST)]));
        fwd.forward(UdpDatagram {
            src_mac: GUEST_MAC,
            src: SocketAddrV4::new(Ipv4Addr::new(192, 168, 127, 2), 40000),
            dst: SocketAddrV4::new(virtual_host, port),
            payload: b"ping".to_vec(),
        });
        assert_eq!(fwd.active(), 1);

        let frame = tokio::time::timeout(Duration::from_secs(2), frames.recv())
            .await
            .unwrap()
            .unwrap();
        let eth = EthernetFrame::new_checked(&frame[..]).unwrap();
        assert_eq!(eth.dst_addr(), GUEST_MAC);
        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        assert_eq!(ip.src_addr(), virtual_host);
        assert_eq!(ip.dst_addr(), Ipv4Addr::new(192, 168, 127, 2));
        let udp = UdpPacket::new_checked(ip.payload()).unwrap();
        assert_eq!(udp.src_port(), port);
        assert_eq!(udp.dst_port(), 40000);
        assert_eq!(udp.payload(), b"ping");
    }
}
