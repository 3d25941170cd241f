//! Minimal DNS message codec: address queries and their answers

use super::DnsError;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const HEADER_LEN: usize = 12;
const CLASS_IN: u16 = 1;

/// Address record types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RecordType {
    A = 1,
    AAAA = 28,
}

/// Build a recursive query for `qname`
pub fn build_query(id: u16, qname: &str, qtype: RecordType) -> Result<Vec<u8>, DnsError> {
    let qname = qname.trim_end_matches('.');
    if qname.is_empty() || qname.len() > 253 {
        return Err(DnsError::InvalidName(qname.to_string()));
    }

    let mut packet = Vec::with_capacity(HEADER_LEN + qname.len() + 6);
    packet.extend_from_slice(&id.to_be_bytes());
    // Flags: standard query, recursion desired
    packet.extend_from_slice(&[0x01, 0x00]);
    // QDCOUNT 1, ANCOUNT/NSCOUNT/ARCOUNT 0
    packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);

    for label in qname.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(DnsError::InvalidName(qname.to_string()));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);

    packet.extend_from_slice(&(qtype as u16).to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());
    Ok(packet)
}

fn read_u16(packet: &[u8], pos: usize) -> Result<u16, DnsError> {
    packet
        .get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| DnsError::Malformed("truncated".to_string()))
}

/// Position just past the (possibly compressed) name at `pos`
fn skip_name(packet: &[u8], mut pos: usize) -> Result<usize, DnsError> {
    loop {
        let len = *packet
            .get(pos)
            .ok_or_else(|| DnsError::Malformed("name runs past end".to_string()))?;
        match len {
            0 => return Ok(pos + 1),
            l if l & 0xC0 == 0xC0 => return Ok(pos + 2),
            l => pos += l as usize + 1,
        }
    }
}

/// Extract A/AAAA answers from a response to query `id`
pub fn parse_response(packet: &[u8], id: u16) -> Result<Vec<IpAddr>, DnsError> {
    if packet.len() < HEADER_LEN {
        return Err(DnsError::Malformed("response too short".to_string()));
    }
    if read_u16(packet, 0)? != id {
        return Err(DnsError::IdMismatch);
    }
    let rcode = packet[3] & 0x0F;
    if rcode != 0 {
        return Err(DnsError::Rcode(rcode));
    }

    let qdcount = read_u16(packet, 4)?;
    let ancount = read_u16(packet, 6)?;

    let mut pos = HEADER_LEN;
    for _ in 0..qdcount {
        pos = skip_name(packet, pos)? + 4;
    }

    let mut addrs = Vec::new();
    for _ in 0..ancount {
        pos = skip_name(packet, pos)?;
        let rtype = read_u16(packet, pos)?;
        let rdlength = read_u16(packet, pos + 8)? as usize;
        pos += 10;

        let rdata = packet
            .get(pos..pos + rdlength)
            .ok_or_else(|| DnsError::Malformed("record runs past end".to_string()))?;
        match (rtype, rdlength) {
            (t, 4) if t == RecordType::A as u16 => {
                addrs.push(IpAddr::V4(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3])));
            }
            (t, 16) if t == RecordType::AAAA as u16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                addrs.push(IpAddr::V6(Ipv6Addr::from(octets)));
            }
            // CNAMEs and friends
            _ => {}
        }
        pos += rdlength;
    }

    Ok(addrs)
}

/// SERVFAIL answer for `query`, echoing its id and question
pub fn servfail_reply(query: &[u8]) -> Option<Vec<u8>> {
    if query.len() < HEADER_LEN {
        return None;
    }
    let mut reply = query.to_vec();
    reply[2] |= 0x80;
    reply[3] = (reply[3] & 0xF0) | 0x02;
    // no answer, authority or additional records
    reply[6..12].fill(0);
    Some(reply)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Turn `query` into a response carrying `addrs`
    pub(crate) fn answer(query: &[u8], addrs: &[IpAddr]) -> Vec<u8> {
        let mut reply = query.to_vec();
        reply[2] = 0x81;
        reply[3] = 0x80;
        reply[6..8].copy_from_slice(&(addrs.len() as u16).to_be_bytes());
        for addr in addrs {
            // pointer to the question name
            reply.extend_from_slice(&[0xC0, 0x0C]);
            let (rtype, rdata) = match addr {
                IpAddr::V4(v4) => (RecordType::A, v4.octets().to_vec()),
                IpAddr::V6(v6) => (RecordType::AAAA, v6.octets().to_vec()),
            };
            reply.extend_from_slice(&(rtype as u16).to_be_bytes());
            reply.extend_from_slice(&CLASS_IN.to_be_bytes());
            reply.extend_from_slice(&300u32.to_be_bytes());
            reply.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            reply.extend_from_slice(&rdata);
        }
        reply
    }

    #[test]
    fn test_build_query() {
        let packet = build_query(0x1234, "example.com", RecordType::A).unwrap();

        assert_eq!(&packet[0..2], &[0x12, 0x34]);
        assert_eq!(&packet[2..4], &[0x01, 0x00]);
        assert_eq!(&packet[4..6], &[0x00, 0x01]);
        assert_eq!(&packet[12..25], b"\x07example\x03com\x00");
        assert_eq!(&packet[25..], &[0x00, 0x01, 0x00, 0x01]);
    }

    #[test]
    fn test_invalid_names() {
        assert!(build_query(1, "", RecordType::A).is_err());
        assert!(build_query(1, "a..b", RecordType::A).is_err());
        assert!(build_query(1, &"x".repeat(64), RecordType::A).is_err());
    }

    #[test]
    fn test_parse_answers() {
        let query = build_query(7, "example.com", RecordType::A).unwrap();
        let addrs: Vec<IpAddr> = vec!["93.184.216.34".parse().unwrap(), "2001:db8::1".parse().unwrap()];
        let reply = answer(&query, &addrs);

        assert_eq!(parse_response(&reply, 7).unwrap(), addrs);
        assert!(matches!(parse_response(&reply, 8), Err(DnsError::IdMismatch)));
        assert!(matches!(
            parse_response(&reply[..reply.len() - 3], 7),
            Err(DnsError::Malformed(_))
        ));
    }

    #[test]
    fn test_servfail() {
        let query = build_query(9, "example.com", RecordType::AAAA).unwrap();
        let reply = servfail_reply(&query).unwrap();
        assert!(matches!(parse_response(&reply, 9), Err(DnsError::Rcode(2))));
        assert!(servfail_reply(&[0u8; 4]).is_none());
    }
}
