//! Per-destination counters maintained by the kernel side.

use byteorder::{ByteOrder, NetworkEndian};
use std::collections::BTreeMap;

use crate::destination::Destination;
use crate::error::{IsomerError, Result};

/// Length of an encoded [`DestinationMetrics`] record.
///
/// Layout: `lookups u64 | misses u64 | errors_bad_socket u64`, big-endian.
pub const DESTINATION_METRICS_LEN: usize = 24;

const MISSES_OFFSET: usize = 8;
const ERRORS_BAD_SOCKET_OFFSET: usize = 16;

/// Counters for a single destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DestinationMetrics {
    /// Packets that matched a binding for this destination.
    pub lookups: u64,
    /// Lookups that found no registered socket.
    pub misses: u64,
    /// Lookups that found a socket which could not accept the packet.
    pub errors_bad_socket: u64,
}

impl DestinationMetrics {
    /// Sums all error categories.
    pub fn total_errors(&self) -> u64 {
        self.errors_bad_socket
    }

    pub fn to_bytes(&self) -> [u8; DESTINATION_METRICS_LEN] {
        let mut buf = [0u8; DESTINATION_METRICS_LEN];
        NetworkEndian::write_u64(&mut buf[..MISSES_OFFSET], self.lookups);
        NetworkEndian::write_u64(&mut buf[MISSES_OFFSET..ERRORS_BAD_SOCKET_OFFSET], self.misses);
        NetworkEndian::write_u64(&mut buf[ERRORS_BAD_SOCKET_OFFSET..], self.errors_bad_socket);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != DESTINATION_METRICS_LEN {
            return Err(IsomerError::MalformedKey(format!(
                "metrics record is {} bytes, expected {}",
                buf.len(),
                DESTINATION_METRICS_LEN
            )));
        }

        Ok(Self {
            lookups: NetworkEndian::read_u64(&buf[..MISSES_OFFSET]),
            misses: NetworkEndian::read_u64(&buf[MISSES_OFFSET..ERRORS_BAD_SOCKET_OFFSET]),
            errors_bad_socket: NetworkEndian::read_u64(&buf[ERRORS_BAD_SOCKET_OFFSET..]),
        })
    }
}

/// Snapshot of binding counts and counters for every live destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metrics {
    pub bindings: BTreeMap<Destination, u64>,
    pub destinations: BTreeMap<Destination, DestinationMetrics>,
}

impl Metrics {
    /// Counters for `dest`, zero if it is unknown.
    pub fn for_destination(&self, dest: &Destination) -> DestinationMetrics {
        self.destinations.get(dest).copied().unwrap_or_default()
    }
}
