//! IP prefix type with canonical form and safe parsing.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Number of bits an IPv4 address is shifted by when it is represented as an
/// IPv4-mapped IPv6 address (`::ffff:a.b.c.d`).
pub const IPV4_MAPPED_OFFSET_BITS: u8 = 96;

/// An IP network prefix (e.g. `10.0.0.0/8` or `2001:db8::/32`).
///
/// Prefixes are always held in canonical form:
///
/// - host bits beyond `prefix_len` are zero
/// - an IPv4-mapped IPv6 prefix covering at least the mapping (`::ffff:0:0/96`)
///   is stored as the equivalent IPv4 prefix
///
/// Two prefixes describing the same set of addresses therefore compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpPrefix {
    address: IpAddr,
    prefix_len: u8,
}

impl IpPrefix {
    /// Creates a new IP prefix in canonical form.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix length is invalid for the address type
    /// (>32 for IPv4, >128 for IPv6).
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, ParseError> {
        let max_len = max_len_of(&address);
        if prefix_len > max_len {
            return Err(ParseError::InvalidIpPrefix(format!(
                "prefix length {} exceeds maximum {} for {}",
                prefix_len, max_len, address
            )));
        }

        Ok(canonical(address, prefix_len))
    }

    /// Creates a prefix covering exactly one address (/32 or /128).
    pub fn host(address: IpAddr) -> Self {
        canonical(address, max_len_of(&address))
    }

    /// Returns the network address of this prefix.
    pub const fn address(&self) -> &IpAddr {
        &self.address
    }

    /// Returns the prefix length in bits.
    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Returns the address width in bits (32 or 128).
    pub fn max_len(&self) -> u8 {
        max_len_of(&self.address)
    }

    /// Returns true if this is an IPv4 prefix.
    pub const fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }

    /// Returns true if this is an IPv6 prefix.
    pub const fn is_ipv6(&self) -> bool {
        self.address.is_ipv6()
    }

    /// Returns true if this is a host route (/32 for IPv4, /128 for IPv6).
    pub fn is_host_route(&self) -> bool {
        self.prefix_len == self.max_len()
    }

    /// Returns true if this is the default route (0.0.0.0/0 or ::/0).
    pub fn is_default(&self) -> bool {
        self.prefix_len == 0
    }

    /// Returns the address as 16 bytes, IPv4 in IPv4-mapped form.
    pub fn mapped_octets(&self) -> [u8; 16] {
        match self.address {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        }
    }

    /// Returns true if every address in `other` is also in `self`.
    pub fn contains(&self, other: &IpPrefix) -> bool {
        self.is_ipv4() == other.is_ipv4()
            && self.prefix_len <= other.prefix_len
            && mask(other.address, self.prefix_len) == self.address
    }

    /// Returns true if the two prefixes share at least one address.
    ///
    /// For CIDR prefixes this is the case exactly when one contains the other.
    pub fn overlaps(&self, other: &IpPrefix) -> bool {
        self.contains(other) || other.contains(self)
    }

    /// Compares the network addresses of two prefixes.
    ///
    /// IPv4 addresses order before IPv6 addresses; within a family the
    /// comparison is lexicographic over the address bytes.
    pub fn cmp_address(&self, other: &IpPrefix) -> Ordering {
        self.address.cmp(&other.address)
    }
}

fn max_len_of(address: &IpAddr) -> u8 {
    match address {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

// Callers guarantee prefix_len <= max_len_of(&address).
fn canonical(address: IpAddr, prefix_len: u8) -> IpPrefix {
    let (address, prefix_len) = match address {
        IpAddr::V6(v6) if prefix_len >= IPV4_MAPPED_OFFSET_BITS => match v6.to_ipv4_mapped() {
            Some(v4) => (IpAddr::V4(v4), prefix_len - IPV4_MAPPED_OFFSET_BITS),
            None => (address, prefix_len),
        },
        _ => (address, prefix_len),
    };

    IpPrefix {
        address: mask(address, prefix_len),
        prefix_len,
    }
}

fn mask(address: IpAddr, prefix_len: u8) -> IpAddr {
    match address {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let mask = u32::MAX.checked_shl(32 - u32::from(prefix_len)).unwrap_or(0);
            IpAddr::V4(Ipv4Addr::from(bits & mask))
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let mask = u128::MAX.checked_shl(128 - u32::from(prefix_len)).unwrap_or(0);
            IpAddr::V6(Ipv6Addr::from(bits & mask))
        }
    }
}

/// Parses a prefix with an optional mask.
///
/// A bare address is interpreted as a /32 (IPv4) or /128 (IPv6) prefix, so
/// `::1` is equivalent to `::1/128`.
pub fn parse_prefix(s: &str) -> Result<IpPrefix, ParseError> {
    match s.parse::<IpAddr>() {
        Ok(address) => Ok(IpPrefix::host(address)),
        Err(_) => s.parse(),
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for IpPrefix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_str, len_str) = s
            .rsplit_once('/')
            .ok_or_else(|| ParseError::InvalidIpPrefix(s.to_string()))?;

        let address: IpAddr = addr_str
            .parse()
            .map_err(|_| ParseError::InvalidIpAddress(addr_str.to_string()))?;
        let prefix_len: u8 = len_str
            .parse()
            .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;

        IpPrefix::new(address, prefix_len)
    }
}

impl TryFrom<String> for IpPrefix {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        parse_prefix(&s)
    }
}

impl From<IpPrefix> for String {
    fn from(prefix: IpPrefix) -> Self {
        prefix.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn p(s: &str) -> IpPrefix {
        parse_prefix(s).unwrap()
    }

    #[test]
    fn test_ip_prefix_parse() {
        let prefix: IpPrefix = "10.0.0.0/24".parse().unwrap();
        assert!(prefix.is_ipv4());
        assert_eq!(prefix.prefix_len(), 24);

        let v6_prefix: IpPrefix = "2001:db8::/32".parse().unwrap();
        assert!(v6_prefix.is_ipv6());
        assert_eq!(v6_prefix.prefix_len(), 32);
    }

    #[test]
    fn test_bare_address_is_host_prefix() {
        assert_eq!(p("::1"), p("::1/128"));
        assert_eq!(p("127.0.0.1"), p("127.0.0.1/32"));
        assert!(p("::1").is_host_route());
    }

    #[test]
    fn test_invalid_prefix() {
        assert!(parse_prefix("10.0.0.0/33").is_err());
        assert!(parse_prefix("2001:db8::/129").is_err());
        assert!(parse_prefix("not-an-ip").is_err());
        assert!(parse_prefix("10.0.0.0/").is_err());
        assert!(parse_prefix("").is_err());
    }

    #[test]
    fn test_host_bits_are_masked() {
        assert_eq!(p("fd::1/64").to_string(), "fd::/64");
        assert_eq!(p("192.168.1.77/16").to_string(), "192.168.0.0/16");
        assert_eq!(p("10.1.2.3/0").to_string(), "0.0.0.0/0");
    }

    #[test]
    fn test_ipv4_mapped_is_unmapped() {
        assert_eq!(p("::ffff:1.2.3.4"), p("1.2.3.4/32"));
        assert_eq!(p("::ffff:10.0.0.0/104"), p("10.0.0.0/8"));
        // Shorter than the mapping itself stays IPv6.
        assert!(p("::ffff:0:0/80").is_ipv6());
    }

    #[test]
    fn test_contains_and_overlaps() {
        let wide = p("fd::/64");
        let narrow = p("fd::1");
        let other = p("fe::/64");

        assert!(wide.contains(&narrow));
        assert!(!narrow.contains(&wide));
        assert!(wide.overlaps(&narrow));
        assert!(narrow.overlaps(&wide));
        assert!(!wide.overlaps(&other));
        assert!(!p("10.0.0.0/8").overlaps(&p("::/0")));
        assert!(p("::/0").contains(&p("2001:db8::/32")));
    }

    #[test]
    fn test_mapped_octets() {
        let v4 = p("127.0.0.1");
        assert_eq!(
            v4.mapped_octets(),
            [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 127, 0, 0, 1]
        );
        assert_eq!(p("::1").mapped_octets()[15], 1);
    }

    #[test]
    fn test_display() {
        let prefix: IpPrefix = "192.168.0.0/16".parse().unwrap();
        assert_eq!(prefix.to_string(), "192.168.0.0/16");
        assert_eq!(String::from(p("::1")), "::1/128");
    }
}
