//! Traffic leaving or entering the guest network through the gateway.

pub mod nat;
pub mod ports;
pub mod tcp;
pub mod udp;

pub use nat::NatTable;
pub use ports::{PortsForwarder, ProxyInfo, TransportProtocol};
pub use tcp::TcpForwarder;
pub use udp::UdpForwarder;
