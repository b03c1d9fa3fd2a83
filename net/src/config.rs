//! Virtual network configuration.

use crate::error::{NetError, Result};
use crate::protocol::Protocol;
use regex::Regex;
use serde::{Deserialize, Serialize};
use smoltcp::wire::{EthernetAddress, Ipv4Cidr};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SUBNET: &str = "192.168.127.0/24";
pub const GATEWAY_IP: &str = "192.168.127.1";
pub const GATEWAY_MAC: &str = "02:52:4f:53:53:01";
pub const GUEST_IP: &str = "192.168.127.2";
pub const GUEST_MAC: &str = "02:52:4f:53:53:00";

/// Address the guest uses to reach the host's loopback.
pub const HOST_IP: &str = "192.168.127.254";

pub const DEFAULT_MTU: usize = 1500;
pub const DEFAULT_DOMAIN: &str = "ross.internal.";

/// Idle time after which a UDP flow is forgotten.
pub const UDP_CONN_TRACK_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Configuration {
    /// Log every frame crossing the switch.
    pub debug: bool,
    /// Write every frame to this pcap file.
    pub capture_file: Option<PathBuf>,
    pub mtu: usize,
    pub subnet: String,
    #[serde(rename = "gatewayIP")]
    pub gateway_ip: String,
    pub gateway_mac_address: String,
    /// IP → MAC of leases known in advance.
    pub dhcp_static_leases: HashMap<String, String>,
    /// Host listen address → guest address. A `udp:` prefix on the host
    /// address selects UDP.
    pub forwards: HashMap<String, String>,
    pub nat: HashMap<String, String>,
    /// Additional addresses the gateway answers ARP for.
    #[serde(rename = "gatewayVirtualIPs")]
    pub gateway_virtual_ips: Vec<String>,
    #[serde(rename = "dns")]
    pub dns_zones: Vec<Zone>,
    pub dns_search_domains: Vec<String>,
    #[serde(rename = "vpnKitUUIDMacAddresses")]
    pub vpnkit_uuid_mac_addresses: HashMap<String, String>,
    pub protocol: Protocol,
    /// Seconds a UDP flow may stay idle.
    pub udp_conn_track_timeout: u64,
    pub hosts_file: Option<PathBuf>,
    pub resolv_conf: Option<PathBuf>,
    /// Explicit upstream resolvers, used instead of `resolvConf`.
    pub dns_upstreams: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Zone {
    pub name: String,
    #[serde(default)]
    pub records: Vec<Record>,
    #[serde(rename = "defaultIP", default, skip_serializing_if = "Option::is_none")]
    pub default_ip: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "IP", default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regexp: Option<String>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            debug: false,
            capture_file: None,
            mtu: DEFAULT_MTU,
            subnet: DEFAULT_SUBNET.to_string(),
            gateway_ip: GATEWAY_IP.to_string(),
            gateway_mac_address: GATEWAY_MAC.to_string(),
            dhcp_static_leases: HashMap::from([(GUEST_IP.to_string(), GUEST_MAC.to_string())]),
            forwards: HashMap::new(),
            nat: HashMap::from([(HOST_IP.to_string(), "127.0.0.1".to_string())]),
            gateway_virtual_ips: vec![HOST_IP.to_string()],
            dns_zones: vec![Zone {
                name: DEFAULT_DOMAIN.to_string(),
                records: vec![
                    Record {
                        name: "gateway".to_string(),
                        ip: Some(Ipv4Addr::new(192, 168, 127, 1)),
                        regexp: None,
                    },
                    Record {
                        name: "host".to_string(),
                        ip: Some(Ipv4Addr::new(192, 168, 127, 254)),
                        regexp: None,
                    },
                ],
                default_ip: None,
            }],
            dns_search_domains: Vec::new(),
            vpnkit_uuid_mac_addresses: HashMap::new(),
            protocol: Protocol::default(),
            udp_conn_track_timeout: UDP_CONN_TRACK_TIMEOUT.as_secs(),
            hosts_file: Some(PathBuf::from("/etc/hosts")),
            resolv_conf: Some(PathBuf::from("/etc/resolv.conf")),
            dns_upstreams: Vec::new(),
        }
    }
}

impl Configuration {
    /// Loads a JSON configuration. Missing keys take their default value.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        let config: Configuration = serde_json::from_slice(&data)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let subnet = self.subnet()?;
        let gateway = self.gateway_ip()?;
        if !subnet.contains_addr(&gateway) {
            return Err(NetError::Config(format!(
                "gateway {} is outside of subnet {}",
                gateway, self.subnet
            )));
        }
        if !(68..=65535).contains(&self.mtu) {
            return Err(NetError::MtuOutOfRange);
        }
        self.gateway_mac()?;
        self.static_leases()?;
        self.nat_table()?;
        self.virtual_ips()?;
        for mac in self.vpnkit_uuid_mac_addresses.values() {
            parse_mac(mac)?;
        }
        for zone in &self.dns_zones {
            for record in &zone.records {
                if let Some(re) = &record.regexp {
                    Regex::new(re)?;
                }
            }
        }
        Ok(())
    }

    pub fn subnet(&self) -> Result<Ipv4Cidr> {
        parse_cidr(&self.subnet)
    }

    pub fn gateway_ip(&self) -> Result<Ipv4Addr> {
        parse_ip(&self.gateway_ip)
    }

    pub fn gateway_mac(&self) -> Result<EthernetAddress> {
        parse_mac(&self.gateway_mac_address)
    }

    pub fn static_leases(&self) -> Result<Vec<(Ipv4Addr, EthernetAddress)>> {
        self.dhcp_static_leases
            .iter()
            .map(|(ip, mac)| Ok((parse_ip(ip)?, parse_mac(mac)?)))
            .collect()
    }

    pub fn nat_table(&self) -> Result<HashMap<Ipv4Addr, Ipv4Addr>> {
        self.nat
            .iter()
            .map(|(from, to)| Ok((parse_ip(from)?, parse_ip(to)?)))
            .collect()
    }

    pub fn virtual_ips(&self) -> Result<Vec<Ipv4Addr>> {
        self.gateway_virtual_ips.iter().map(|ip| parse_ip(ip)).collect()
    }

    pub fn udp_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_conn_track_timeout)
    }
}

pub fn parse_ip(s: &str) -> Result<Ipv4Addr> {
    s.parse()
        .map_err(|_| NetError::Config(format!("invalid IPv4 address {:?}", s)))
}

/// Parses `a.b.c.d/n`.
pub fn parse_cidr(s: &str) -> Result<Ipv4Cidr> {
    let (addr, prefix) = s
        .split_once('/')
        .ok_or_else(|| NetError::InvalidCidr(s.to_string()))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| NetError::InvalidCidr(s.to_string()))?;
    let prefix: u8 = prefix
        .parse()
        .ok()
        .filter(|p| *p <= 32)
        .ok_or_else(|| NetError::InvalidCidr(s.to_string()))?;
    Ok(Ipv4Cidr::new(addr, prefix))
}

/// Parses `aa:bb:cc:dd:ee:ff` (also accepts `-` as separator).
pub fn parse_mac(s: &str) -> Result<EthernetAddress> {
    let parts: Vec<&str> = s.split([':', '-']).collect();
    if parts.len() != 6 {
        return Err(NetError::InvalidMac(s.to_string()));
    }
    let mut mac = [0u8; 6];
    for (byte, part) in mac.iter_mut().zip(parts) {
        if part.len() != 2 {
            return Err(NetError::InvalidMac(s.to_string()));
        }
        *byte = u8::from_str_radix(part, 16).map_err(|_| NetError::InvalidMac(s.to_string()))?;
    }
    Ok(EthernetAddress(mac))
}
