//! Route rule lists
//!
//! One entry per line. Blank lines and `#` comments are ignored. An entry is
//! an IPv4/IPv6 address, a CIDR block, or a domain suffix (`example.com`,
//! `.example.com` and `*.example.com` all match the domain and every
//! subdomain).

use super::FilterError;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cidr {
    V4 { net: u32, prefix: u8 },
    V6 { net: u128, prefix: u8 },
}

impl Cidr {
    fn v4(addr: Ipv4Addr, prefix: u8) -> Self {
        Cidr::V4 {
            net: u32::from(addr) & mask_v4(prefix),
            prefix,
        }
    }

    fn v6(addr: Ipv6Addr, prefix: u8) -> Self {
        Cidr::V6 {
            net: u128::from(addr) & mask_v6(prefix),
            prefix,
        }
    }

    fn parse(entry: &str) -> Option<Self> {
        let (addr, prefix) = match entry.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix.parse::<u8>().ok()?)),
            None => (entry, None),
        };
        match addr.parse::<IpAddr>().ok()? {
            IpAddr::V4(v4) => {
                let prefix = prefix.unwrap_or(32);
                (prefix <= 32).then(|| Cidr::v4(v4, prefix))
            }
            IpAddr::V6(v6) => {
                let prefix = prefix.unwrap_or(128);
                (prefix <= 128).then(|| Cidr::v6(v6, prefix))
            }
        }
    }

    fn contains(&self, ip: IpAddr) -> bool {
        // v4-mapped v6 addresses are compared as v4
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };
        match (*self, ip) {
            (Cidr::V4 { net, prefix }, IpAddr::V4(v4)) => u32::from(v4) & mask_v4(prefix) == net,
            (Cidr::V6 { net, prefix }, IpAddr::V6(v6)) => u128::from(v6) & mask_v6(prefix) == net,
            _ => false,
        }
    }
}

fn mask_v4(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix as u32)
    }
}

fn mask_v6(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - prefix as u32)
    }
}

fn valid_domain(domain: &str) -> bool {
    !domain.is_empty()
        && domain.len() <= 253
        && domain.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
}

fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// A loaded rule list
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    cidrs: Vec<Cidr>,
    domains: Vec<String>,
}

impl RuleSet {
    /// Parse rule text; `name` labels errors
    pub fn parse(content: &str, name: &str) -> Result<Self, FilterError> {
        let mut rules = RuleSet::default();

        for (index, raw) in content.lines().enumerate() {
            let entry = raw.split('#').next().unwrap_or_default().trim();
            if entry.is_empty() {
                continue;
            }

            if let Some(cidr) = Cidr::parse(entry) {
                rules.cidrs.push(cidr);
                continue;
            }

            let domain = entry.trim_start_matches("*.").trim_start_matches('.');
            let domain = normalize_host(domain);
            if entry.contains('/') || entry.contains(':') || !valid_domain(&domain) {
                return Err(FilterError::InvalidRule {
                    file: name.to_string(),
                    line: index + 1,
                    entry: entry.to_string(),
                });
            }
            rules.domains.push(domain);
        }

        Ok(rules)
    }

    /// Load a rule file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, FilterError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|error| FilterError::Read {
            file: path.display().to_string(),
            error,
        })?;
        Self::parse(&content, &path.display().to_string())
    }

    /// Whether `ip` falls in any address rule
    pub fn matches_ip(&self, ip: IpAddr) -> bool {
        self.cidrs.iter().any(|cidr| cidr.contains(ip))
    }

    /// Whether `host` equals or is a subdomain of any domain rule
    pub fn matches_domain(&self, host: &str) -> bool {
        let host = normalize_host(host);
        self.domains.iter().any(|domain| {
            host == *domain
                || (host.len() > domain.len()
                    && host.ends_with(domain.as_str())
                    && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
        })
    }

    /// Whether the list has any address rules
    pub fn has_ip_rules(&self) -> bool {
        !self.cidrs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cidrs.len() + self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
