//! Human readable summary of bindings and destinations.
//!
//! ```text
//! Bindings:
//!  protocol   prefix port label
//!       tcp ::1/128   80   foo
//!
//! Destinations:
//!  label domain protocol socket lookups misses errors
//!    foo   ipv6      tcp  sk:2a       0      0      0
//! ```
//!
//! Every cell is right-aligned to the widest cell of its column plus one
//! space of padding.

use std::collections::BTreeMap;
use std::fmt;

use crate::binding::Binding;
use crate::destination::{Destination, SocketCookie};
use crate::metrics::{DestinationMetrics, Metrics};

/// One row of the destinations table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationStatus {
    pub destination: Destination,
    pub socket: Option<SocketCookie>,
    pub metrics: DestinationMetrics,
}

/// Point-in-time view of the dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    /// Most specific first.
    pub bindings: Vec<Binding>,
    /// Sorted by (label, domain, protocol).
    pub destinations: Vec<DestinationStatus>,
}

impl StatusReport {
    /// Assembles a report, keeping only entries for `label` if given.
    pub fn new(
        mut bindings: Vec<Binding>,
        mut destinations: Vec<Destination>,
        sockets: &BTreeMap<Destination, SocketCookie>,
        metrics: &Metrics,
        label: Option<&str>,
    ) -> Self {
        if let Some(label) = label {
            bindings.retain(|b| b.label() == label);
            destinations.retain(|d| d.label == label);
        }
        bindings.sort();
        destinations.sort();

        let destinations = destinations
            .into_iter()
            .map(|destination| DestinationStatus {
                socket: sockets.get(&destination).copied(),
                metrics: metrics.for_destination(&destination),
                destination,
            })
            .collect();

        Self {
            bindings,
            destinations,
        }
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bindings = Table::new(&["protocol", "prefix", "port", "label"]);
        for b in &self.bindings {
            bindings.row(vec![
                b.protocol().to_string(),
                b.prefix().to_string(),
                b.port().to_string(),
                b.label().to_string(),
            ]);
        }

        let mut dests = Table::new(&[
            "label", "domain", "protocol", "socket", "lookups", "misses", "errors",
        ]);
        for d in &self.destinations {
            let socket = match d.socket {
                Some(cookie) => cookie.to_string(),
                None => "sk:-".to_string(),
            };
            dests.row(vec![
                d.destination.label.clone(),
                d.destination.domain.to_string(),
                d.destination.protocol.to_string(),
                socket,
                d.metrics.lookups.to_string(),
                d.metrics.misses.to_string(),
                d.metrics.total_errors().to_string(),
            ]);
        }

        writeln!(f, "Bindings:")?;
        bindings.fmt(f)?;
        writeln!(f, "\nDestinations:")?;
        dests.fmt(f)
    }
}

struct Table {
    rows: Vec<Vec<String>>,
}

impl Table {
    const PADDING: usize = 1;

    fn new(header: &[&str]) -> Self {
        Self {
            rows: vec![header.iter().map(|h| h.to_string()).collect()],
        }
    }

    fn row(&mut self, cells: Vec<String>) {
        self.rows.push(cells);
    }

    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let columns = self.rows.iter().map(Vec::len).max().unwrap_or(0);
        let widths: Vec<usize> = (0..columns)
            .map(|i| {
                self.rows
                    .iter()
                    .filter_map(|row| row.get(i))
                    .map(|cell| cell.chars().count())
                    .max()
                    .unwrap_or(0)
                    + Self::PADDING
            })
            .collect();

        for row in &self.rows {
            for (cell, width) in row.iter().zip(&widths) {
                write!(f, "{:>width$}", cell, width = width)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isomer_types::{Domain, Protocol};
    use pretty_assertions::assert_eq;

    fn foo() -> Destination {
        Destination::new("foo", Domain::Inet6, Protocol::Tcp).unwrap()
    }

    #[test]
    fn test_render() {
        let bindings = vec![Binding::new("foo", Protocol::Tcp, "::1", 80).unwrap()];
        let mut sockets = BTreeMap::new();
        sockets.insert(foo(), SocketCookie(0x2a));

        let report = StatusReport::new(bindings, vec![foo()], &sockets, &Metrics::default(), None);
        assert_eq!(
            report.to_string(),
            concat!(
                "Bindings:\n",
                " protocol  prefix port label\n",
                "      tcp ::1/128   80   foo\n",
                "\n",
                "Destinations:\n",
                " label domain protocol socket lookups misses errors\n",
                "   foo   ipv6      tcp  sk:2a       0      0      0\n",
            )
        );
    }

    #[test]
    fn test_missing_socket() {
        let report = StatusReport::new(vec![], vec![foo()], &BTreeMap::new(), &Metrics::default(), None);
        let rendered = report.to_string();
        assert!(rendered.contains(" sk:-"), "{}", rendered);
    }

    #[test]
    fn test_label_filter() {
        let bindings = vec![
            Binding::new("foo", Protocol::Tcp, "::1", 80).unwrap(),
            Binding::new("bar", Protocol::Tcp, "::2", 80).unwrap(),
        ];
        let bar = Destination::new("bar", Domain::Inet6, Protocol::Tcp).unwrap();

        let report = StatusReport::new(
            bindings,
            vec![foo(), bar],
            &BTreeMap::new(),
            &Metrics::default(),
            Some("bar"),
        );
        assert_eq!(report.bindings.len(), 1);
        assert_eq!(report.bindings[0].label(), "bar");
        assert_eq!(report.destinations.len(), 1);
        assert_eq!(report.destinations[0].destination.label, "bar");
    }

    #[test]
    fn test_counters() {
        let mut metrics = Metrics::default();
        metrics.destinations.insert(
            foo(),
            DestinationMetrics {
                lookups: 1200,
                misses: 3,
                errors_bad_socket: 7,
            },
        );

        let report = StatusReport::new(vec![], vec![foo()], &BTreeMap::new(), &metrics, None);
        let last = report.to_string().lines().last().unwrap().to_string();
        assert_eq!(last, "   foo   ipv6      tcp   sk:-    1200      3      7");
    }
}
