//! Destination address rewriting for forwarded flows.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

pub struct NatTable {
    table: Mutex<HashMap<Ipv4Addr, Ipv4Addr>>,
}

impl NatTable {
    pub fn new(table: HashMap<Ipv4Addr, Ipv4Addr>) -> Self {
        Self {
            table: Mutex::new(table),
        }
    }

    /// Address a flow to `addr` is actually dialed at on the host.
    pub fn translate(&self, addr: Ipv4Addr) -> Ipv4Addr {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&addr)
            .copied()
            .unwrap_or(addr)
    }

    pub fn insert(&self, from: Ipv4Addr, to: Ipv4Addr) {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(from, to);
    }
}

/// Addresses in 169.254.0.0/16 are never forwarded.
pub fn is_link_local(addr: Ipv4Addr) -> bool {
    addr.is_link_local()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate() {
        let nat = NatTable::new(HashMap::from([(
            Ipv4Addr::new(10, 0, 2, 2),
            Ipv4Addr::new(192, 168, 1, 50),
        )]));
        assert_eq!(nat.translate(Ipv4Addr::new(10, 0, 2, 2)), Ipv4Addr::new(192, 168, 1, 50));
        assert_eq!(nat.translate(Ipv4Addr::new(1, 1, 1, 1)), Ipv4Addr::new(1, 1, 1, 1));

        nat.insert(Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::LOCALHOST);
        assert_eq!(nat.translate(Ipv4Addr::new(1, 1, 1, 1)), Ipv4Addr::LOCALHOST);
    }

    #[test]
    fn test_link_local() {
        assert!(is_link_local(Ipv4Addr::new(169, 254, 169, 254)));
        assert!(!is_link_local(Ipv4Addr::new(192, 168, 127, 1)));
    }
}
