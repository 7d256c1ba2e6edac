//! Binary encoding of bindings for the kernel lookup trie.
//!
//! # Key layout
//!
//! ```text
//! offset  width  field
//!      0      4  prefix_len   header bits + prefix bits (+96 for IPv4)
//!      4      2  protocol     kernel protocol number
//!      6      2  port         0 matches any port
//!      8     16  address      IPv6, or IPv4-mapped IPv6 for IPv4
//! ```
//!
//! # Value layout
//!
//! ```text
//! offset  width  field
//!      0      8  destination  destination identifier
//!      8      4  prefix_len   prefix length of the matched key
//! ```
//!
//! All fields are big-endian. The trie matches `prefix_len` bits starting at
//! the protocol field, so protocol and port always match exactly and the
//! address matches on its prefix. IPv4 prefixes are pushed past the 96 bit
//! IPv4-mapping prefix.

use byteorder::{ByteOrder, NetworkEndian};
use isomer_types::{IpPrefix, Protocol, IPV4_MAPPED_OFFSET_BITS};
use std::fmt;
use std::net::{IpAddr, Ipv6Addr};

use crate::binding::Binding;
use crate::destination::DestinationId;
use crate::error::{IsomerError, Result};

/// Bits of the key covered by the protocol and port fields.
pub const BINDING_KEY_HEADER_BITS: u32 = 32;

/// Largest valid `prefix_len`: header plus a full IPv6 address.
pub const BINDING_KEY_MAX_PREFIX_LEN: u32 = BINDING_KEY_HEADER_BITS + 128;

/// Length of an encoded [`BindingKey`].
pub const BINDING_KEY_LEN: usize = 24;

/// Length of an encoded [`BindingValue`].
pub const BINDING_VALUE_LEN: usize = 12;

const KEY_PROTOCOL_OFFSET: usize = 4;
const KEY_PORT_OFFSET: usize = 6;
const KEY_ADDRESS_OFFSET: usize = 8;

const VALUE_PREFIX_LEN_OFFSET: usize = 8;

/// Trie key of a binding. The label is not part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingKey {
    pub prefix_len: u32,
    pub protocol: Protocol,
    pub port: u16,
    pub address: [u8; 16],
}

impl BindingKey {
    /// Encodes the key into its fixed-width form.
    pub fn to_bytes(&self) -> [u8; BINDING_KEY_LEN] {
        let mut buf = [0u8; BINDING_KEY_LEN];
        NetworkEndian::write_u32(&mut buf[..KEY_PROTOCOL_OFFSET], self.prefix_len);
        NetworkEndian::write_u16(
            &mut buf[KEY_PROTOCOL_OFFSET..KEY_PORT_OFFSET],
            self.protocol.as_raw(),
        );
        NetworkEndian::write_u16(&mut buf[KEY_PORT_OFFSET..KEY_ADDRESS_OFFSET], self.port);
        buf[KEY_ADDRESS_OFFSET..].copy_from_slice(&self.address);
        buf
    }

    /// Decodes a fixed-width key.
    ///
    /// Only the field widths and the protocol are checked here; prefix
    /// semantics are validated by [`BindingKey::to_binding`].
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != BINDING_KEY_LEN {
            return Err(IsomerError::MalformedKey(format!(
                "binding key is {} bytes, expected {}",
                buf.len(),
                BINDING_KEY_LEN
            )));
        }

        let raw_protocol = NetworkEndian::read_u16(&buf[KEY_PROTOCOL_OFFSET..KEY_PORT_OFFSET]);
        let protocol = Protocol::from_raw(raw_protocol).ok_or_else(|| {
            IsomerError::MalformedKey(format!("unknown protocol {}", raw_protocol))
        })?;

        let mut address = [0u8; 16];
        address.copy_from_slice(&buf[KEY_ADDRESS_OFFSET..]);

        Ok(Self {
            prefix_len: NetworkEndian::read_u32(&buf[..KEY_PROTOCOL_OFFSET]),
            protocol,
            port: NetworkEndian::read_u16(&buf[KEY_PORT_OFFSET..KEY_ADDRESS_OFFSET]),
            address,
        })
    }

    /// Decodes the key back into a binding under `label`.
    ///
    /// The kernel value does not carry the label, so the caller resolves it
    /// separately (usually through the destination registry).
    ///
    /// # Errors
    ///
    /// [`IsomerError::MalformedKey`] if the prefix length is shorter than the
    /// header or longer than the address allows, or if the key is not the
    /// canonical encoding of any binding.
    pub fn to_binding(&self, label: &str) -> Result<Binding> {
        if self.prefix_len < BINDING_KEY_HEADER_BITS {
            return Err(IsomerError::MalformedKey(format!(
                "prefix length {} is shorter than the {} bit header",
                self.prefix_len, BINDING_KEY_HEADER_BITS
            )));
        }
        if self.prefix_len > BINDING_KEY_MAX_PREFIX_LEN {
            return Err(IsomerError::MalformedKey(format!(
                "prefix length {} exceeds {}",
                self.prefix_len, BINDING_KEY_MAX_PREFIX_LEN
            )));
        }

        // At most 128 after the checks above.
        let ones = (self.prefix_len - BINDING_KEY_HEADER_BITS) as u8;
        let v6 = Ipv6Addr::from(self.address);

        let prefix = match v6.to_ipv4_mapped() {
            Some(v4) => {
                if ones < IPV4_MAPPED_OFFSET_BITS {
                    return Err(IsomerError::MalformedKey(format!(
                        "IPv4 key {} has only {} address bits",
                        v4, ones
                    )));
                }
                IpPrefix::new(IpAddr::V4(v4), ones - IPV4_MAPPED_OFFSET_BITS)
            }
            None => IpPrefix::new(IpAddr::V6(v6), ones),
        }
        .map_err(|e| IsomerError::MalformedKey(e.to_string()))?;

        let binding = Binding::from_prefix(label, self.protocol, prefix, self.port)?;

        // Host bits beyond the prefix are never produced by encoding.
        if BindingKey::from(&binding) != *self {
            return Err(IsomerError::MalformedKey(format!(
                "key for {} has bits set beyond its prefix",
                binding
            )));
        }

        Ok(binding)
    }
}

impl From<&Binding> for BindingKey {
    fn from(binding: &Binding) -> Self {
        let prefix = binding.prefix();

        let mut bits = u32::from(prefix.prefix_len());
        if prefix.is_ipv4() {
            bits += u32::from(IPV4_MAPPED_OFFSET_BITS);
        }

        Self {
            prefix_len: BINDING_KEY_HEADER_BITS + bits,
            protocol: binding.protocol(),
            port: binding.port(),
            address: prefix.mapped_octets(),
        }
    }
}

impl fmt::Display for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:[{}]:{}/{}",
            self.protocol,
            Ipv6Addr::from(self.address),
            self.port,
            self.prefix_len
        )
    }
}

/// Trie value of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingValue {
    pub destination: DestinationId,
    /// `prefix_len` of the key this value is stored under.
    pub prefix_len: u32,
}

impl BindingValue {
    pub fn new(destination: DestinationId, key: &BindingKey) -> Self {
        Self {
            destination,
            prefix_len: key.prefix_len,
        }
    }

    pub fn to_bytes(&self) -> [u8; BINDING_VALUE_LEN] {
        let mut buf = [0u8; BINDING_VALUE_LEN];
        NetworkEndian::write_u64(
            &mut buf[..VALUE_PREFIX_LEN_OFFSET],
            u64::from(self.destination.0),
        );
        NetworkEndian::write_u32(&mut buf[VALUE_PREFIX_LEN_OFFSET..], self.prefix_len);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != BINDING_VALUE_LEN {
            return Err(IsomerError::MalformedKey(format!(
                "binding value is {} bytes, expected {}",
                buf.len(),
                BINDING_VALUE_LEN
            )));
        }

        let raw_id = NetworkEndian::read_u64(&buf[..VALUE_PREFIX_LEN_OFFSET]);
        let id = u32::try_from(raw_id).map_err(|_| {
            IsomerError::MalformedKey(format!("destination id {} out of range", raw_id))
        })?;

        Ok(Self {
            destination: DestinationId(id),
            prefix_len: NetworkEndian::read_u32(&buf[VALUE_PREFIX_LEN_OFFSET..]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn b(prefix: &str, port: u16) -> Binding {
        Binding::new("foo", Protocol::Tcp, prefix, port).unwrap()
    }

    #[test]
    fn test_ipv6_layout() {
        let key = BindingKey::from(&b("::1", 80));
        assert_eq!(key.prefix_len, 32 + 128);

        let bytes = key.to_bytes();
        assert_eq!(&bytes[0..4], &[0, 0, 0, 160]);
        assert_eq!(&bytes[4..6], &[0, 6]);
        assert_eq!(&bytes[6..8], &[0, 80]);
        assert_eq!(&bytes[8..], &Ipv6Addr::LOCALHOST.octets());
    }

    #[test]
    fn test_ipv4_layout() {
        let key = BindingKey::from(&b("127.0.0.0/8", 0));
        assert_eq!(key.prefix_len, 32 + 96 + 8);

        let bytes = key.to_bytes();
        assert_eq!(
            &bytes[8..],
            &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 127, 0, 0, 0]
        );
    }

    #[test]
    fn test_round_trip() {
        for (prefix, port) in [
            ("::1", 80),
            ("::/0", 0),
            ("fd::/64", 443),
            ("2001:db8::/32", 65535),
            ("127.0.0.1", 53),
            ("0.0.0.0/0", 0),
            ("10.0.0.0/8", 8080),
            ("::ffff:0:0/80", 1),
        ] {
            let binding = b(prefix, port);
            let key = BindingKey::from(&binding);
            let decoded = BindingKey::from_bytes(&key.to_bytes()).unwrap();
            assert_eq!(decoded, key);
            assert_eq!(decoded.to_binding("foo").unwrap(), binding);
        }
    }

    #[test]
    fn test_decode_rejects_short_prefix() {
        let mut key = BindingKey::from(&b("::/0", 0));
        key.prefix_len = 31;
        assert!(matches!(key.to_binding("foo"), Err(IsomerError::MalformedKey(_))));
    }

    #[test]
    fn test_decode_rejects_long_prefix() {
        let mut key = BindingKey::from(&b("::1", 0));
        key.prefix_len = 161;
        assert!(matches!(key.to_binding("foo"), Err(IsomerError::MalformedKey(_))));
    }

    #[test]
    fn test_decode_rejects_truncated_ipv4() {
        let mut key = BindingKey::from(&b("127.0.0.1", 0));
        key.prefix_len = 32 + 64;
        assert!(matches!(key.to_binding("foo"), Err(IsomerError::MalformedKey(_))));
    }

    #[test]
    fn test_decode_rejects_host_bits() {
        let mut key = BindingKey::from(&b("fd::/64", 0));
        key.address[15] = 1;
        assert!(matches!(key.to_binding("foo"), Err(IsomerError::MalformedKey(_))));
    }

    #[test]
    fn test_from_bytes_rejects_bad_input() {
        assert!(BindingKey::from_bytes(&[0u8; 23]).is_err());

        let mut bytes = BindingKey::from(&b("::1", 0)).to_bytes();
        bytes[5] = 1;
        assert!(BindingKey::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_value_round_trip() {
        let key = BindingKey::from(&b("::1", 80));
        let value = BindingValue::new(DestinationId(3), &key);
        let bytes = value.to_bytes();

        assert_eq!(&bytes[..8], &[0, 0, 0, 0, 0, 0, 0, 3]);
        assert_eq!(&bytes[8..], &[0, 0, 0, 160]);
        assert_eq!(BindingValue::from_bytes(&bytes).unwrap(), value);
        assert!(BindingValue::from_bytes(&bytes[..8]).is_err());
    }

    #[test]
    fn test_value_rejects_wide_id() {
        let mut bytes = [0u8; BINDING_VALUE_LEN];
        bytes[0] = 1;
        assert!(BindingValue::from_bytes(&bytes).is_err());
    }
}
