//! Network primitives shared by the isomer control plane.
//!
//! This crate provides type-safe representations of the values that make up
//! a binding:
//!
//! - [`IpPrefix`]: canonical IPv4/IPv6 network prefixes
//! - [`Protocol`]: transport protocols with pinned kernel values
//! - [`Domain`]: address families with pinned kernel values
//!
//! The integer values of [`Protocol`] and [`Domain`] are part of the kernel
//! table layout and must never change.

mod ip;
mod proto;

pub use ip::{parse_prefix, IpPrefix, IPV4_MAPPED_OFFSET_BITS};
pub use proto::{Domain, Protocol};

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),

    #[error("invalid protocol: {0}")]
    InvalidProtocol(String),

    #[error("invalid address family: {0}")]
    InvalidDomain(String),
}
