//! Minimal DNS wire format: the first question of a query and the replies the
//! gateway builds itself.

use crate::error::{NetError, Result};
use std::net::Ipv4Addr;

pub const TYPE_A: u16 = 1;
pub const TYPE_AAAA: u16 = 28;
pub const CLASS_IN: u16 = 1;

pub const RCODE_SERVFAIL: u8 = 2;
pub const RCODE_NXDOMAIN: u8 = 3;

const HEADER_LEN: usize = 12;

/// First question of a DNS query.
#[derive(Debug, Clone)]
pub struct Query {
    pub id: u16,
    /// Fully qualified, lowercase, with a trailing dot.
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
    flags: u16,
    question: Vec<u8>,
}

impl Query {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(NetError::Dns("query too short".to_string()));
        }
        let id = u16::from_be_bytes([data[0], data[1]]);
        let flags = u16::from_be_bytes([data[2], data[3]]);
        if flags & 0x8000 != 0 {
            return Err(NetError::Dns("not a query".to_string()));
        }
        if u16::from_be_bytes([data[4], data[5]]) == 0 {
            return Err(NetError::Dns("no question".to_string()));
        }

        let mut offset = HEADER_LEN;
        let mut name = String::new();
        loop {
            let len = *data
                .get(offset)
                .ok_or_else(|| NetError::Dns("name truncated".to_string()))? as usize;
            offset += 1;
            if len == 0 {
                break;
            }
            if len & 0xc0 != 0 {
                return Err(NetError::Dns("compressed question name".to_string()));
            }
            let label = data
                .get(offset..offset + len)
                .ok_or_else(|| NetError::Dns("name truncated".to_string()))?;
            name.push_str(&String::from_utf8_lossy(label).to_ascii_lowercase());
            name.push('.');
            offset += len;
        }
        if name.is_empty() {
            name.push('.');
        }

        let tail = data
            .get(offset..offset + 4)
            .ok_or_else(|| NetError::Dns("question truncated".to_string()))?;
        Ok(Self {
            id,
            name,
            qtype: u16::from_be_bytes([tail[0], tail[1]]),
            qclass: u16::from_be_bytes([tail[2], tail[3]]),
            flags,
            question: data[HEADER_LEN..offset + 4].to_vec(),
        })
    }

    fn header(&self, rcode: u8, answers: u16) -> Vec<u8> {
        // QR, echo opcode and RD, RA.
        let flags = 0x8000 | (self.flags & 0x7900) | 0x0080 | (rcode as u16 & 0x0f);
        let mut out = Vec::with_capacity(512);
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&flags.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&answers.to_be_bytes());
        out.extend_from_slice(&[0, 0, 0, 0]);
        out.extend_from_slice(&self.question);
        out
    }

    /// A records for the question name, TTL 0.
    pub fn answer_a(&self, ips: &[Ipv4Addr]) -> Vec<u8> {
        let mut out = self.header(0, ips.len() as u16);
        for ip in ips {
            out.extend_from_slice(&[0xc0, 0x0c]);
            out.extend_from_slice(&TYPE_A.to_be_bytes());
            out.extend_from_slice(&CLASS_IN.to_be_bytes());
            out.extend_from_slice(&0u32.to_be_bytes());
            out.extend_from_slice(&4u16.to_be_bytes());
            out.extend_from_slice(&ip.octets());
        }
        out
    }

    pub fn empty(&self) -> Vec<u8> {
        self.header(0, 0)
    }

    pub fn error(&self, rcode: u8) -> Vec<u8> {
        self.header(rcode, 0)
    }
}

/// Response code of a reply.
pub fn rcode(reply: &[u8]) -> Option<u8> {
    reply.get(3).map(|b| b & 0x0f)
}

/// Number of answers in a reply.
pub fn answer_count(reply: &[u8]) -> Option<u16> {
    Some(u16::from_be_bytes([*reply.get(6)?, *reply.get(7)?]))
}

/// Builds a recursive query for `name`.
pub fn build_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&0x0100u16.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    for label in name.trim_end_matches('.').split('.').filter(|l| !l.is_empty()) {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out.extend_from_slice(&qtype.to_be_bytes());
    out.extend_from_slice(&CLASS_IN.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query() {
        let q = Query::parse(&build_query(0x1234, "Gateway.Ross.Internal", TYPE_A)).unwrap();
        assert_eq!(q.id, 0x1234);
        assert_eq!(q.name, "gateway.ross.internal.");
        assert_eq!(q.qtype, TYPE_A);
        assert_eq!(q.qclass, CLASS_IN);
    }

    #[test]
    fn test_parse_rejects_truncated() {
        assert!(Query::parse(&[0u8; 5]).is_err());
        let mut data = build_query(1, "example.com", TYPE_A);
        data.truncate(data.len() - 2);
        assert!(Query::parse(&data).is_err());
    }

    #[test]
    fn test_answer_layout() {
        let q = Query::parse(&build_query(7, "host.ross.internal", TYPE_A)).unwrap();
        let reply = q.answer_a(&[Ipv4Addr::new(192, 168, 127, 254)]);
        assert_eq!(&reply[..2], &7u16.to_be_bytes());
        // QR and RD from the query, RA set.
        assert_eq!(reply[2], 0x81);
        assert_eq!(reply[3], 0x80);
        assert_eq!(answer_count(&reply), Some(1));
        let answer = &reply[reply.len() - 16..];
        assert_eq!(&answer[..2], &[0xc0, 0x0c]);
        // TTL 0
        assert_eq!(&answer[6..10], &[0, 0, 0, 0]);
        assert_eq!(&answer[12..], &[192, 168, 127, 254]);
    }

    #[test]
    fn test_error_reply() {
        let q = Query::parse(&build_query(7, "nope.ross.internal", TYPE_A)).unwrap();
        let reply = q.error(RCODE_NXDOMAIN);
        assert_eq!(rcode(&reply), Some(RCODE_NXDOMAIN));
        assert_eq!(answer_count(&reply), Some(0));
        assert_eq!(rcode(&q.empty()), Some(0));
    }
}
