//! Gateway link endpoint sitting between the switch and the network stack.

use crate::error::Result;
use crate::eth;
use crate::switch::{NetworkSwitch, VirtualDevice};
use smoltcp::phy::{Checksum, DeviceCapabilities, Medium, PcapLinkType, PcapSink};
use smoltcp::time::Instant;
use smoltcp::wire::{ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol};
use std::fs::File;
use std::io::BufWriter;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tokio::sync::mpsc;
use tracing::debug;

/// pcap recorder for frames crossing the link endpoint.
pub struct Capture {
    sink: Mutex<BufWriter<File>>,
}

impl Capture {
    /// Creates the capture file, replacing any previous one.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let mut sink = BufWriter::new(File::create(path)?);
        sink.global_header(PcapLinkType::Ethernet);
        PcapSink::flush(&mut sink);
        Ok(Self {
            sink: Mutex::new(sink),
        })
    }

    pub fn record(&self, frame: &[u8]) {
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        sink.packet(Instant::now(), frame);
        PcapSink::flush(&mut *sink);
    }
}

pub struct LinkEndpoint {
    debug: bool,
    mtu: usize,
    mac: EthernetAddress,
    ip: Ipv4Addr,
    virtual_ips: Vec<Ipv4Addr>,
    switch: OnceLock<Weak<dyn NetworkSwitch>>,
    dispatcher: OnceLock<mpsc::UnboundedSender<Vec<u8>>>,
    capture: OnceLock<Capture>,
}

impl LinkEndpoint {
    pub fn new(debug: bool, mtu: usize, mac: EthernetAddress, ip: Ipv4Addr, virtual_ips: Vec<Ipv4Addr>) -> Self {
        Self {
            debug,
            mtu,
            mac,
            ip,
            virtual_ips,
            switch: OnceLock::new(),
            dispatcher: OnceLock::new(),
            capture: OnceLock::new(),
        }
    }

    pub fn connect(&self, switch: &Arc<dyn NetworkSwitch>) {
        if self.switch.set(Arc::downgrade(switch)).is_err() {
            debug!("link endpoint already connected to a switch");
        }
    }

    /// Routes frames delivered by the switch into `dispatcher`.
    pub fn attach(&self, dispatcher: mpsc::UnboundedSender<Vec<u8>>) {
        if self.dispatcher.set(dispatcher).is_err() {
            debug!("link endpoint already attached");
        }
    }

    pub fn set_capture(&self, capture: Capture) {
        if self.capture.set(capture).is_err() {
            debug!("capture already enabled");
        }
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn virtual_ips(&self) -> &[Ipv4Addr] {
        &self.virtual_ips
    }

    pub fn is_gateway_address(&self, ip: Ipv4Addr) -> bool {
        ip == self.ip || self.virtual_ips.contains(&ip)
    }

    /// Ethernet with ARP resolution. Checksums of received packets are not
    /// verified, outgoing ones are computed.
    pub fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ethernet;
        caps.max_transmission_unit = self.mtu + eth::ETH_HEADER_LEN;
        caps.checksum.ipv4 = Checksum::Tx;
        caps.checksum.tcp = Checksum::Tx;
        caps.checksum.udp = Checksum::Tx;
        caps.checksum.icmpv4 = Checksum::Tx;
        caps
    }

    /// Sends a frame produced by the gateway to the switch. Returns false when
    /// the frame was dropped.
    pub async fn write_packet(&self, mut frame: Vec<u8>) -> bool {
        if frame.len() < eth::ETH_HEADER_LEN {
            return false;
        }
        if frame[6..12] == [0u8; 6] {
            frame[6..12].copy_from_slice(self.mac.as_bytes());
        }

        if let Some(ip) = self.spoofed_arp_sender(&frame) {
            debug!("dropping spoofing packets from the gateway about IP {}", ip);
            return false;
        }

        if self.debug {
            debug!("tx {}", eth::pretty(&frame));
        }
        if let Some(capture) = self.capture.get() {
            capture.record(&frame);
        }

        let Some(switch) = self.switch.get().and_then(Weak::upgrade) else {
            debug!("no switch connected, dropping frame");
            return false;
        };
        switch.deliver_network_packet(frame).await;
        true
    }

    pub async fn write_packets(&self, frames: Vec<Vec<u8>>) -> usize {
        let mut written = 0;
        for frame in frames {
            if self.write_packet(frame).await {
                written += 1;
            }
        }
        written
    }

    /// Sender address of an ARP reply claiming an address the gateway does
    /// not own.
    fn spoofed_arp_sender(&self, frame: &[u8]) -> Option<Ipv4Addr> {
        let eth = EthernetFrame::new_checked(frame).ok()?;
        if eth.ethertype() != EthernetProtocol::Arp {
            return None;
        }
        let arp = ArpPacket::new_checked(eth.payload()).ok()?;
        match ArpRepr::parse(&arp).ok()? {
            ArpRepr::EthernetIpv4 {
                operation: ArpOperation::Reply,
                source_protocol_addr,
                ..
            } if !self.is_gateway_address(source_protocol_addr) => Some(source_protocol_addr),
            _ => None,
        }
    }
}

impl VirtualDevice for LinkEndpoint {
    fn deliver_network_packet(&self, frame: Vec<u8>) {
        if self.debug {
            debug!("rx {}", eth::pretty(&frame));
        }
        if let Some(capture) = self.capture.get() {
            capture.record(&frame);
        }
        match self.dispatcher.get() {
            Some(dispatcher) => {
                if dispatcher.send(frame).is_err() {
                    debug!("network stack is gone, dropping frame");
                }
            }
            None => debug!("no dispatcher attached, dropping frame"),
        }
    }

    fn link_address(&self) -> EthernetAddress {
        self.mac
    }

    fn ip(&self) -> Ipv4Addr {
        self.ip
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::switch::Switch;

    const GW_MAC: EthernetAddress = EthernetAddress([0x02, 0x52, 0x4f, 0x53, 0x53, 0x01]);

    fn arp_reply(sender_ip: Ipv4Addr) -> Vec<u8> {
        let repr = ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Reply,
            source_hardware_addr: GW_MAC,
            source_protocol_addr: sender_ip,
            target_hardware_addr: EthernetAddress([0x52, 0x54, 0, 0, 0, 1]),
            target_protocol_addr: Ipv4Addr::new(192, 168, 127, 2),
        };
        let mut frame =
            eth::build_eth_header(EthernetAddress([0x52, 0x54, 0, 0, 0, 1]), GW_MAC, eth::ETHERTYPE_ARP).to_vec();
        let mut arp = vec![0u8; repr.buffer_len()];
        repr.emit(&mut ArpPacket::new_unchecked(&mut arp[..]));
        frame.extend_from_slice(&arp);
        frame
    }

    fn endpoint() -> (Arc<LinkEndpoint>, Arc<Switch>) {
        let link = Arc::new(LinkEndpoint::new(
            true,
            1500,
            GW_MAC,
            Ipv4Addr::new(192, 168, 127, 1),
            vec![Ipv4Addr::new(192, 168, 127, 254)],
        ));
        let switch = Arc::new(Switch::new(true, 1500));
        let as_switch: Arc<dyn NetworkSwitch> = switch.clone();
        link.connect(&as_switch);
        switch.connect(link.clone());
        (link, switch)
    }

    #[tokio::test]
    async fn test_spoofed_arp_reply_is_dropped() {
        let (link, _switch) = endpoint();
        assert!(!link.write_packet(arp_reply(Ipv4Addr::new(192, 168, 127, 99))).await);
        assert!(link.write_packet(arp_reply(Ipv4Addr::new(192, 168, 127, 1))).await);
        assert!(link.write_packet(arp_reply(Ipv4Addr::new(192, 168, 127, 254))).await);
    }

    #[tokio::test]
    async fn test_write_packets_counts_delivered() {
        let (link, _switch) = endpoint();
        let frames = vec![
            arp_reply(Ipv4Addr::new(10, 0, 0, 1)),
            arp_reply(Ipv4Addr::new(192, 168, 127, 1)),
            vec![0u8; 4],
        ];
        assert_eq!(link.write_packets(frames).await, 1);
    }

    #[tokio::test]
    async fn test_delivered_frames_reach_dispatcher() {
        let (link, _switch) = endpoint();
        let (tx, mut rx) = mpsc::unbounded_channel();
        link.attach(tx);
        link.deliver_network_packet(vec![1, 2, 3]);
        assert_eq!(rx.recv().await.unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_capabilities() {
        let (link, _switch) = endpoint();
        let caps = link.capabilities();
        assert_eq!(caps.medium, Medium::Ethernet);
        assert_eq!(caps.max_transmission_unit, 1514);
    }

    #[tokio::test]
    async fn test_capture_records_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.pcap");
        std::fs::write(&path, b"stale").unwrap();

        let (link, _switch) = endpoint();
        link.set_capture(Capture::create(&path).unwrap());
        let frame = arp_reply(Ipv4Addr::new(192, 168, 127, 1));
        let len = frame.len();
        link.write_packet(frame).await;
        link.deliver_network_packet(vec![0u8; 60]);

        let data = std::fs::read(&path).unwrap();
        // Global header, then a 16 byte record header per frame.
        assert_eq!(data.len(), 24 + 16 + len + 16 + 60);
    }
}
