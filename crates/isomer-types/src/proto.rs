//! Transport protocol and address family definitions.
//!
//! Both enums carry the integer values used by the kernel (`IPPROTO_*` and
//! `AF_*`). The binding key layout and the precedence order depend on them.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transport protocol of a binding or destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u16)]
pub enum Protocol {
    /// IPPROTO_TCP
    Tcp = 6,
    /// IPPROTO_UDP
    Udp = 17,
}

impl Protocol {
    /// Returns the kernel protocol number.
    pub const fn as_raw(self) -> u16 {
        self as u16
    }

    /// Converts a kernel protocol number.
    ///
    /// Returns `None` for protocols the dispatcher does not support.
    pub const fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            6 => Some(Protocol::Tcp),
            17 => Some(Protocol::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        };
        f.pad(s)
    }
}

impl FromStr for Protocol {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            _ => Err(ParseError::InvalidProtocol(s.to_string())),
        }
    }
}

/// Address family of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u16)]
pub enum Domain {
    /// AF_INET
    #[serde(rename = "ipv4")]
    Inet = 2,
    /// AF_INET6
    #[serde(rename = "ipv6")]
    Inet6 = 10,
}

impl Domain {
    /// Returns the kernel address family number.
    pub const fn as_raw(self) -> u16 {
        self as u16
    }

    /// Converts a kernel address family number.
    pub const fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            2 => Some(Domain::Inet),
            10 => Some(Domain::Inet6),
            _ => None,
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Domain::Inet => "ipv4",
            Domain::Inet6 => "ipv6",
        };
        f.pad(s)
    }
}

impl FromStr for Domain {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ipv4" | "inet" | "4" => Ok(Domain::Inet),
            "ipv6" | "inet6" | "6" => Ok(Domain::Inet6),
            _ => Err(ParseError::InvalidDomain(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pinned_values() {
        assert_eq!(Protocol::Tcp.as_raw(), 6);
        assert_eq!(Protocol::Udp.as_raw(), 17);
        assert_eq!(Domain::Inet.as_raw(), 2);
        assert_eq!(Domain::Inet6.as_raw(), 10);
    }

    #[test]
    fn test_from_raw() {
        assert_eq!(Protocol::from_raw(6), Some(Protocol::Tcp));
        assert_eq!(Protocol::from_raw(17), Some(Protocol::Udp));
        assert_eq!(Protocol::from_raw(1), None);
        assert_eq!(Domain::from_raw(10), Some(Domain::Inet6));
        assert_eq!(Domain::from_raw(0), None);
    }

    #[test]
    fn test_order_follows_kernel_values() {
        assert!(Protocol::Tcp < Protocol::Udp);
        assert!(Domain::Inet < Domain::Inet6);
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!("TCP".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("udp".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert!("sctp".parse::<Protocol>().is_err());

        assert_eq!("ipv4".parse::<Domain>().unwrap(), Domain::Inet);
        assert_eq!("inet6".parse::<Domain>().unwrap(), Domain::Inet6);
        assert!("ipx".parse::<Domain>().is_err());

        assert_eq!(Protocol::Udp.to_string(), "udp");
        assert_eq!(Domain::Inet6.to_string(), "ipv6");
    }
}
