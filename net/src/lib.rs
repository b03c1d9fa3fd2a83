mod arp;
pub mod config;
pub mod dhcp;
pub mod dns;
mod error;
pub mod eth;
pub mod forwarder;
pub mod ip_pool;
pub mod link;
pub mod protocol;
pub mod services;
pub mod stack;
pub mod switch;
mod virtual_network;
pub mod vpnkit;

pub use config::Configuration;
pub use error::{NetError, Result};
pub use forwarder::{PortsForwarder, TransportProtocol};
pub use ip_pool::IpPool;
pub use protocol::{Conn, PacketConn, Protocol};
pub use stack::{GatewayListener, GatewayUdpSocket, Stack};
pub use switch::Switch;
pub use virtual_network::VirtualNetwork;
