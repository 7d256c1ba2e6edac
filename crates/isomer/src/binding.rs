//! Bindings and the precedence order used by the data plane.
//!
//! A [`Binding`] selects which connections are steered to a destination.
//! Bindings are ordered from most to least specific, mirroring the choice
//! the kernel's longest-prefix-match trie makes:
//!
//! 1. protocol, by kernel protocol number (groups bindings, no specificity)
//! 2. IPv4 before IPv6
//! 3. for overlapping prefixes of different length, the longer prefix
//! 4. network address, lexicographically
//! 5. port: any concrete port before the wildcard `0`, then lower ports first
//! 6. label, lexicographically
//!
//! The order is total: two bindings compare equal only if every field is equal.

use isomer_types::{parse_prefix, Domain, IpPrefix, Protocol};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use crate::destination::{validate_label, Destination};
use crate::error::Result;

/// A routing rule: steer `protocol` traffic for `prefix`:`port` to `label`.
///
/// A port of `0` matches any port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    label: String,
    protocol: Protocol,
    prefix: IpPrefix,
    port: u16,
}

impl Binding {
    /// Creates a binding from a textual prefix.
    ///
    /// `prefix` may either be in CIDR notation (`::1/128`) or a plain IP
    /// address; `::1` is equivalent to `::1/128`.
    pub fn new(
        label: impl Into<String>,
        protocol: Protocol,
        prefix: &str,
        port: u16,
    ) -> Result<Self> {
        let prefix = parse_prefix(prefix)?;
        Self::from_prefix(label, protocol, prefix, port)
    }

    /// Creates a binding from an already parsed prefix.
    pub fn from_prefix(
        label: impl Into<String>,
        protocol: Protocol,
        prefix: IpPrefix,
        port: u16,
    ) -> Result<Self> {
        let label = label.into();
        validate_label(&label)?;
        Ok(Self {
            label,
            protocol,
            prefix,
            port,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn prefix(&self) -> &IpPrefix {
        &self.prefix
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the address family of the prefix.
    pub fn domain(&self) -> Domain {
        if self.prefix.is_ipv4() {
            Domain::Inet
        } else {
            Domain::Inet6
        }
    }

    /// Returns the destination this binding steers traffic to.
    pub fn destination(&self) -> Destination {
        Destination {
            label: self.label.clone(),
            domain: self.domain(),
            protocol: self.protocol,
        }
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}:[{}]:{}",
            self.label, self.protocol, self.prefix, self.port
        )
    }
}

impl Ord for Binding {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b) = (self, other);

        if a.protocol != b.protocol {
            return a.protocol.as_raw().cmp(&b.protocol.as_raw());
        }

        if a.prefix.is_ipv4() != b.prefix.is_ipv4() {
            return if a.prefix.is_ipv4() {
                Ordering::Less
            } else {
                Ordering::Greater
            };
        }

        // Only sort on overlap if the prefix length differs. Both prefixes
        // overlap, like fd::/64 and fd::1: the longer one is more specific.
        if a.prefix.prefix_len() != b.prefix.prefix_len() && a.prefix.overlaps(&b.prefix) {
            return b.prefix.prefix_len().cmp(&a.prefix.prefix_len());
        }

        match a.prefix.cmp_address(&b.prefix) {
            Ordering::Equal => {}
            ord => return ord,
        }

        // Prefixes are identical, discern by port.
        if a.port != b.port {
            if a.port == 0 || b.port == 0 {
                // Wildcard is less specific than a real port.
                return b.port.cmp(&a.port);
            }
            return a.port.cmp(&b.port);
        }

        a.label.cmp(&b.label)
    }
}

impl PartialOrd for Binding {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Sorts bindings from most to least specific.
pub fn sort_bindings(bindings: &mut [Binding]) {
    bindings.sort();
}

/// Counts bindings per destination.
pub fn binding_counts(bindings: &[Binding]) -> BTreeMap<Destination, u64> {
    let mut counts = BTreeMap::new();
    for binding in bindings {
        *counts.entry(binding.destination()).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn b(label: &str, protocol: Protocol, prefix: &str, port: u16) -> Binding {
        Binding::new(label, protocol, prefix, port).unwrap()
    }

    fn sorted(mut bindings: Vec<Binding>) -> Vec<String> {
        sort_bindings(&mut bindings);
        bindings.iter().map(|b| b.to_string()).collect()
    }

    #[test]
    fn test_display() {
        assert_eq!(b("foo", Protocol::Tcp, "::1", 80).to_string(), "foo#tcp:[::1/128]:80");
        assert_eq!(
            b("bar", Protocol::Udp, "10.0.0.0/8", 0).to_string(),
            "bar#udp:[10.0.0.0/8]:0"
        );
    }

    #[test]
    fn test_invalid_input() {
        assert!(Binding::new("foo", Protocol::Tcp, "::1/129", 80).is_err());
        assert!(Binding::new("foo", Protocol::Tcp, "garbage", 80).is_err());
        assert!(Binding::new("", Protocol::Tcp, "::1", 80).is_err());
    }

    #[test]
    fn test_longest_prefix_first() {
        let order = sorted(vec![
            b("foo", Protocol::Tcp, "::/0", 0),
            b("foo", Protocol::Tcp, "::1", 80),
        ]);
        assert_eq!(order, vec!["foo#tcp:[::1/128]:80", "foo#tcp:[::/0]:0"]);
    }

    #[test]
    fn test_precedence_rules() {
        let order = sorted(vec![
            b("z", Protocol::Udp, "::/0", 0),
            b("a", Protocol::Tcp, "fd::/64", 0),
            b("a", Protocol::Tcp, "fd::1", 0),
            b("a", Protocol::Tcp, "127.0.0.0/8", 0),
            b("a", Protocol::Tcp, "fc::/64", 0),
            b("a", Protocol::Tcp, "fd::1", 443),
            b("a", Protocol::Tcp, "fd::1", 80),
            b("b", Protocol::Tcp, "fd::1", 80),
        ]);

        assert_eq!(
            order,
            vec![
                "a#tcp:[127.0.0.0/8]:0",
                "a#tcp:[fc::/64]:0",
                "a#tcp:[fd::1/128]:80",
                "b#tcp:[fd::1/128]:80",
                "a#tcp:[fd::1/128]:443",
                "a#tcp:[fd::1/128]:0",
                "a#tcp:[fd::/64]:0",
                "z#udp:[::/0]:0",
            ]
        );
    }

    #[test]
    fn test_total_order() {
        let bindings = vec![
            b("foo", Protocol::Tcp, "::1", 80),
            b("foo", Protocol::Tcp, "::1", 0),
            b("bar", Protocol::Tcp, "::1", 80),
            b("foo", Protocol::Udp, "::1", 80),
            b("foo", Protocol::Tcp, "::/0", 80),
            b("foo", Protocol::Tcp, "127.0.0.1", 80),
            b("foo", Protocol::Tcp, "127.0.0.0/8", 80),
            b("foo", Protocol::Tcp, "10.0.0.0/8", 80),
            b("foo", Protocol::Tcp, "10.1.0.0/16", 1),
            b("foo", Protocol::Tcp, "0.0.0.0/0", 0),
        ];

        for (i, x) in bindings.iter().enumerate() {
            for (j, y) in bindings.iter().enumerate() {
                let forward = x.cmp(y);
                let backward = y.cmp(x);
                assert_eq!(forward, backward.reverse(), "{} vs {}", x, y);
                assert_eq!(forward == Ordering::Equal, i == j, "{} vs {}", x, y);

                // Transitivity against every third binding.
                for z in &bindings {
                    if x < y && y < z {
                        assert!(x < z, "{} < {} < {}", x, y, z);
                    }
                }
            }
        }
    }

    #[test]
    fn test_sort_is_deterministic() {
        let input = vec![
            b("foo", Protocol::Tcp, "::/0", 0),
            b("foo", Protocol::Tcp, "::1", 80),
            b("bar", Protocol::Udp, "10.0.0.0/8", 53),
            b("baz", Protocol::Tcp, "10.0.0.1", 0),
        ];

        let mut reversed = input.clone();
        reversed.reverse();

        assert_eq!(sorted(input), sorted(reversed));
    }

    #[test]
    fn test_destination() {
        let dest = b("foo", Protocol::Udp, "127.0.0.1", 53).destination();
        assert_eq!(dest.label, "foo");
        assert_eq!(dest.domain, Domain::Inet);
        assert_eq!(dest.protocol, Protocol::Udp);
    }

    #[test]
    fn test_binding_counts() {
        let counts = binding_counts(&[
            b("foo", Protocol::Tcp, "::1", 80),
            b("foo", Protocol::Tcp, "::2", 80),
            b("foo", Protocol::Tcp, "127.0.0.1", 80),
        ]);

        let v6 = Destination::new("foo", Domain::Inet6, Protocol::Tcp).unwrap();
        let v4 = Destination::new("foo", Domain::Inet, Protocol::Tcp).unwrap();
        assert_eq!(counts.get(&v6), Some(&2));
        assert_eq!(counts.get(&v4), Some(&1));
    }
}
