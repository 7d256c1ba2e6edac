//! Destinations, destination identifiers and socket cookies.
//!
//! A [`Destination`] is the routing target a binding resolves to. Distinct
//! bindings that only differ by prefix or port share a destination. Each
//! destination is named in the kernel tables by a [`DestinationId`].

use byteorder::{ByteOrder, NetworkEndian};
use isomer_types::{Domain, Protocol};
use std::fmt;

use crate::error::{IsomerError, Result};

/// Maximum length of a label in bytes.
pub const MAX_LABEL_LEN: usize = 255;

/// Length of an encoded [`Destination`] record.
///
/// Layout: `label_len u8 | label [255] | domain u16 | protocol u16`.
pub const DESTINATION_RECORD_LEN: usize = 1 + MAX_LABEL_LEN + 2 + 2;

/// Length of an encoded [`DestinationId`] table key.
pub const DESTINATION_ID_LEN: usize = 4;

/// Length of an encoded [`SocketCookie`] table value.
pub const SOCKET_COOKIE_LEN: usize = 8;

const RECORD_DOMAIN_OFFSET: usize = 1 + MAX_LABEL_LEN;
const RECORD_PROTOCOL_OFFSET: usize = RECORD_DOMAIN_OFFSET + 2;

/// Checks that a label can be stored in the kernel tables.
pub fn validate_label(label: &str) -> Result<()> {
    if label.is_empty() {
        return Err(IsomerError::InvalidLabel {
            label: label.to_string(),
            reason: "label is empty",
        });
    }
    if label.len() > MAX_LABEL_LEN {
        return Err(IsomerError::InvalidLabel {
            label: label.to_string(),
            reason: "label exceeds 255 bytes",
        });
    }
    Ok(())
}

/// Dense identifier of a destination.
///
/// Identifiers are allocated monotonically by the registry and are never
/// reused while the registry is alive. They are not stable across restarts
/// and must not be persisted outside the kernel tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DestinationId(pub u32);

impl DestinationId {
    /// Encodes the identifier as a table key.
    pub fn to_bytes(self) -> [u8; DESTINATION_ID_LEN] {
        let mut buf = [0u8; DESTINATION_ID_LEN];
        NetworkEndian::write_u32(&mut buf, self.0);
        buf
    }

    /// Decodes a table key.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != DESTINATION_ID_LEN {
            return Err(IsomerError::MalformedKey(format!(
                "destination id is {} bytes, expected {}",
                buf.len(),
                DESTINATION_ID_LEN
            )));
        }
        Ok(DestinationId(NetworkEndian::read_u32(buf)))
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kernel-assigned identity of a socket instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketCookie(pub u64);

impl SocketCookie {
    pub fn to_bytes(self) -> [u8; SOCKET_COOKIE_LEN] {
        let mut buf = [0u8; SOCKET_COOKIE_LEN];
        NetworkEndian::write_u64(&mut buf, self.0);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != SOCKET_COOKIE_LEN {
            return Err(IsomerError::MalformedKey(format!(
                "socket cookie is {} bytes, expected {}",
                buf.len(),
                SOCKET_COOKIE_LEN
            )));
        }
        Ok(SocketCookie(NetworkEndian::read_u64(buf)))
    }
}

impl fmt::Display for SocketCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&format!("sk:{:x}", self.0))
    }
}

/// A resolved routing target.
///
/// The derived order (label, domain, protocol) is the order destination
/// listings are rendered in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Destination {
    pub label: String,
    pub domain: Domain,
    pub protocol: Protocol,
}

impl Destination {
    /// Creates a destination, validating the label.
    pub fn new(label: impl Into<String>, domain: Domain, protocol: Protocol) -> Result<Self> {
        let label = label.into();
        validate_label(&label)?;
        Ok(Self {
            label,
            domain,
            protocol,
        })
    }

    /// Encodes the destination as a fixed-width table record.
    pub fn to_record(&self) -> Result<Vec<u8>> {
        validate_label(&self.label)?;

        let mut buf = vec![0u8; DESTINATION_RECORD_LEN];
        let label = self.label.as_bytes();
        // validate_label bounds the length to 255.
        buf[0] = label.len() as u8;
        buf[1..1 + label.len()].copy_from_slice(label);
        NetworkEndian::write_u16(&mut buf[RECORD_DOMAIN_OFFSET..], self.domain.as_raw());
        NetworkEndian::write_u16(&mut buf[RECORD_PROTOCOL_OFFSET..], self.protocol.as_raw());
        Ok(buf)
    }

    /// Decodes a fixed-width table record.
    pub fn from_record(buf: &[u8]) -> Result<Self> {
        if buf.len() != DESTINATION_RECORD_LEN {
            return Err(IsomerError::MalformedKey(format!(
                "destination record is {} bytes, expected {}",
                buf.len(),
                DESTINATION_RECORD_LEN
            )));
        }

        let len = usize::from(buf[0]);
        let label = std::str::from_utf8(&buf[1..1 + len])
            .map_err(|_| IsomerError::MalformedKey("destination label is not UTF-8".into()))?;
        if label.is_empty() {
            return Err(IsomerError::MalformedKey("destination label is empty".into()));
        }

        let raw_domain = NetworkEndian::read_u16(&buf[RECORD_DOMAIN_OFFSET..]);
        let domain = Domain::from_raw(raw_domain).ok_or_else(|| {
            IsomerError::MalformedKey(format!("unknown address family {}", raw_domain))
        })?;

        let raw_protocol = NetworkEndian::read_u16(&buf[RECORD_PROTOCOL_OFFSET..]);
        let protocol = Protocol::from_raw(raw_protocol).ok_or_else(|| {
            IsomerError::MalformedKey(format!("unknown protocol {}", raw_protocol))
        })?;

        Ok(Self {
            label: label.to_string(),
            domain,
            protocol,
        })
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.domain, self.protocol, self.label)
    }
}
