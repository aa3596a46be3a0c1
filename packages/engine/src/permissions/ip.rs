use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::QueryError;

/// One entry of a policy's ip allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpRule {
    Exact(IpAddr),
    Cidr { network: IpAddr, prefix: u8 },
    Range { start: IpAddr, end: IpAddr },
}

impl IpRule {
    /// Accepts `10.0.0.7`, `10.0.0.0/8`, `fe80::/10` and `10.0.0.1-10.0.0.9`. IPv4-mapped
    /// IPv6 entries are stored in their IPv4 form, a mapped CIDR prefix rebased onto 32 bits.
    pub fn parse(entry: &str) -> Result<IpRule, QueryError> {
        let entry = entry.trim();
        let invalid = || QueryError::Configuration(format!("invalid ip_access entry '{entry}'"));

        if let Some((network, prefix)) = entry.split_once('/') {
            let written: IpAddr = network.trim().parse().map_err(|_| invalid())?;
            let prefix: u8 = prefix.trim().parse().map_err(|_| invalid())?;
            if prefix > max_prefix(written) {
                return Err(invalid());
            }
            let network = canonical(written);
            let prefix = if network.is_ipv4() && !written.is_ipv4() {
                // `::ffff:0:0/96` is the whole mapped block
                prefix.checked_sub(96).ok_or_else(invalid)?
            } else {
                prefix
            };
            return Ok(IpRule::Cidr { network, prefix });
        }
        if let Some((start, end)) = entry.split_once('-') {
            let start = canonical(start.trim().parse().map_err(|_| invalid())?);
            let end = canonical(end.trim().parse().map_err(|_| invalid())?);
            if start.is_ipv4() != end.is_ipv4() || to_bits(start) > to_bits(end) {
                return Err(invalid());
            }
            return Ok(IpRule::Range { start, end });
        }
        entry
            .parse()
            .map(|ip| IpRule::Exact(canonical(ip)))
            .map_err(|_| invalid())
    }

    pub fn matches(&self, ip: &IpAddr) -> bool {
        let ip = canonical(*ip);
        match *self {
            IpRule::Exact(expected) => canonical(expected) == ip,
            IpRule::Cidr { network, prefix } => {
                let network = canonical(network);
                if network.is_ipv4() != ip.is_ipv4() {
                    return false;
                }
                let width = u32::from(max_prefix(network));
                let Some(shift) = width.checked_sub(u32::from(prefix)) else {
                    return false;
                };
                let mask = if shift >= 128 { 0 } else { u128::MAX << shift };
                to_bits(network) & mask == to_bits(ip) & mask
            }
            IpRule::Range { start, end } => {
                let (start, end) = (canonical(start), canonical(end));
                start.is_ipv4() == ip.is_ipv4()
                    && to_bits(start) <= to_bits(ip)
                    && to_bits(ip) <= to_bits(end)
            }
        }
    }
}

impl fmt::Display for IpRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpRule::Exact(ip) => write!(f, "{ip}"),
            IpRule::Cidr { network, prefix } => write!(f, "{network}/{prefix}"),
            IpRule::Range { start, end } => write!(f, "{start}-{end}"),
        }
    }
}

impl Serialize for IpRule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IpRule {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entry = String::deserialize(deserializer)?;
        IpRule::parse(&entry).map_err(serde::de::Error::custom)
    }
}

/// Parses the comma separated column form used by SQL policy tables.
pub fn parse_ip_list(value: &str) -> Result<Vec<IpRule>, QueryError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(IpRule::parse)
        .collect()
}

fn max_prefix(ip: IpAddr) -> u8 {
    if ip.is_ipv4() {
        32
    } else {
        128
    }
}

// IPv4-mapped IPv6 addresses compare as their IPv4 form.
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        IpAddr::V4(_) => ip,
    }
}

fn to_bits(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}
