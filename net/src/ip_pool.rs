//! IPv4 lease allocator for the virtual subnet.

use crate::error::{NetError, Result};
use smoltcp::wire::Ipv4Cidr;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

/// Tracks which owner holds each address of the subnet.
///
/// Owners are opaque strings: a MAC address for DHCP clients, a connection id
/// for clients that receive their address through the switch handshake.
pub struct IpPool {
    base: Ipv4Cidr,
    count: u64,
    leases: Mutex<HashMap<Ipv4Addr, String>>,
}

impl IpPool {
    pub fn new(base: Ipv4Cidr) -> Self {
        let base = Ipv4Cidr::new(base.network().address(), base.prefix_len());
        Self {
            base,
            count: 1u64 << (32 - base.prefix_len() as u32),
            leases: Mutex::new(HashMap::new()),
        }
    }

    pub fn mask(&self) -> u8 {
        self.base.prefix_len()
    }

    pub fn cidr(&self) -> Ipv4Cidr {
        self.base
    }

    /// Snapshot of the current leases, keyed by address.
    pub fn leases(&self) -> HashMap<String, String> {
        self.lock()
            .iter()
            .map(|(ip, owner)| (ip.to_string(), owner.clone()))
            .collect()
    }

    /// Returns the address already leased to `owner`, or leases the first
    /// free host address of the subnet.
    ///
    /// The network and broadcast addresses of the subnet are never handed out.
    pub fn get_or_assign(&self, owner: &str) -> Result<Ipv4Addr> {
        let mut leases = self.lock();

        if let Some((ip, _)) = leases.iter().find(|(_, o)| o.as_str() == owner) {
            return Ok(*ip);
        }

        let network = u32::from(self.base.address());
        // Offset 0 is the network address, the last one is broadcast.
        let last = if self.count > 2 { self.count - 1 } else { self.count };
        for offset in 1..last {
            let candidate = Ipv4Addr::from(network.wrapping_add(offset as u32));
            if !leases.contains_key(&candidate) {
                leases.insert(candidate, owner.to_string());
                return Ok(candidate);
            }
        }
        Err(NetError::PoolExhausted)
    }

    /// Leases an address to a switch connection.
    pub fn assign(&self, owner: &str) -> Result<Ipv4Addr> {
        self.get_or_assign(owner)
    }

    /// Records a lease unconditionally, replacing any previous owner.
    pub fn reserve(&self, ip: Ipv4Addr, owner: &str) {
        self.lock().insert(ip, owner.to_string());
    }

    /// Drops the lease held by `owner`, if any.
    pub fn release(&self, owner: &str) {
        let mut leases = self.lock();
        let found = leases
            .iter()
            .find(|(_, o)| o.as_str() == owner)
            .map(|(ip, _)| *ip);
        if let Some(ip) = found {
            leases.remove(&ip);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Ipv4Addr, String>> {
        // A poisoned map is still consistent: every mutation is a single insert or remove.
        self.leases.lock().unwrap_or_else(|e| e.into_inner())
    }
}
