//! Authoritative zones served by the gateway.

use crate::config::Zone;
use crate::dns::message::TYPE_A;
use crate::error::Result;
use regex::Regex;
use std::net::Ipv4Addr;
use std::sync::RwLock;

/// Outcome of looking a name up in the zones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneAnswer {
    A(Ipv4Addr),
    /// The name belongs to a zone but has no answer of the queried type.
    Empty,
    NxDomain,
}

struct CompiledZone {
    zone: Zone,
    suffix: String,
    regexps: Vec<Option<Regex>>,
}

impl CompiledZone {
    fn new(zone: Zone) -> Result<Self> {
        let regexps = zone
            .records
            .iter()
            .map(|r| r.regexp.as_deref().map(Regex::new).transpose())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self {
            suffix: format!(".{}", zone.name.to_ascii_lowercase()),
            zone,
            regexps,
        })
    }

    fn answer(&self, host: &str, qtype: u16) -> ZoneAnswer {
        if qtype != TYPE_A {
            return ZoneAnswer::Empty;
        }
        for (record, re) in self.zone.records.iter().zip(&self.regexps) {
            let by_name = !record.name.is_empty() && record.name.eq_ignore_ascii_case(host);
            let by_regexp = re.as_ref().is_some_and(|re| re.is_match(host));
            if by_name || by_regexp {
                return match record.ip {
                    Some(ip) => ZoneAnswer::A(ip),
                    None => ZoneAnswer::Empty,
                };
            }
        }
        match self.zone.default_ip {
            Some(ip) => ZoneAnswer::A(ip),
            None => ZoneAnswer::NxDomain,
        }
    }
}

pub struct Zones {
    zones: RwLock<Vec<CompiledZone>>,
}

impl Zones {
    pub fn new(zones: Vec<Zone>) -> Result<Self> {
        let zones = zones.into_iter().map(CompiledZone::new).collect::<Result<Vec<_>>>()?;
        Ok(Self {
            zones: RwLock::new(zones),
        })
    }

    pub fn all(&self) -> Vec<Zone> {
        self.zones
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|z| z.zone.clone())
            .collect()
    }

    /// Merges `zone` into the zone of the same name, or puts it in front of
    /// the others.
    pub fn add_zone(&self, zone: Zone) -> Result<()> {
        let mut zones = self.zones.write().unwrap_or_else(|e| e.into_inner());
        let existing = zones
            .iter()
            .position(|z| z.zone.name.eq_ignore_ascii_case(&zone.name));
        match existing {
            Some(i) => {
                let mut merged = zones[i].zone.clone();
                merged.records.extend(zone.records);
                if zone.default_ip.is_some() {
                    merged.default_ip = zone.default_ip;
                }
                zones[i] = CompiledZone::new(merged)?;
            }
            None => zones.insert(0, CompiledZone::new(zone)?),
        }
        Ok(())
    }

    /// Looks `name` (fully qualified) up in the first zone it belongs to.
    /// Returns `None` when no zone matches.
    pub fn lookup(&self, name: &str, qtype: u16) -> Option<ZoneAnswer> {
        let zones = self.zones.read().unwrap_or_else(|e| e.into_inner());
        let name = name.to_ascii_lowercase();
        zones.iter().find_map(|z| {
            let host = name.strip_suffix(&z.suffix)?;
            Some(z.answer(host, qtype))
        })
    }
}
