//! Error types for the isomer control plane.

use isomer_types::ParseError;
use std::fmt;
use thiserror::Error;

use crate::table::TableError;

/// Kernel table operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableOp {
    Get,
    Set,
    Delete,
    Iterate,
}

impl fmt::Display for TableOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TableOp::Get => "get",
            TableOp::Set => "set",
            TableOp::Delete => "delete",
            TableOp::Iterate => "iterate",
        };
        write!(f, "{}", s)
    }
}

/// Errors that can occur while managing bindings and destinations.
#[derive(Debug, Error)]
pub enum IsomerError {
    /// Malformed address, CIDR, protocol or family text.
    #[error("{0}")]
    InvalidPrefix(#[from] ParseError),

    /// A kernel table record could not be decoded.
    ///
    /// Indicates corruption or version skew. Fatal to the operation that
    /// encountered it, not to the process.
    #[error("malformed key: {0}")]
    MalformedKey(String),

    /// The targeted binding, destination or registration does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The kernel table interface reported a failure.
    #[error("{table}: {op} {key} failed: {source}")]
    KernelTable {
        table: String,
        op: TableOp,
        key: String,
        #[source]
        source: TableError,
    },

    #[error("invalid label {label:?}: {reason}")]
    InvalidLabel { label: String, reason: &'static str },

    #[error("unsupported socket: {0}")]
    UnsupportedSocket(String),

    /// Two desired bindings map to the same key under different labels.
    #[error("binding {binding} conflicts with label {other}")]
    ConflictingBinding { binding: String, other: String },

    #[error("dispatcher is open read-only")]
    ReadOnly,

    #[error("identifier space exhausted")]
    IdentifiersExhausted,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IsomerError {
    /// Wraps a table failure with the offending operation and key.
    pub(crate) fn table(table: &str, op: TableOp, key: &[u8], source: TableError) -> Self {
        IsomerError::KernelTable {
            table: table.to_string(),
            op,
            key: hex(key),
            source,
        }
    }

    /// Returns true for [`IsomerError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, IsomerError::NotFound(_))
    }
}

fn hex(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "-".to_string();
    }
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Result type alias for isomer operations.
pub type Result<T> = std::result::Result<T, IsomerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_error_carries_context() {
        let err = IsomerError::table("bindings", TableOp::Delete, &[0x00, 0xab], TableError::KeyNotFound);
        assert_eq!(err.to_string(), "bindings: delete 00ab failed: key not found");
    }

    #[test]
    fn test_parse_error_is_caller_visible() {
        let err: IsomerError = ParseError::InvalidIpPrefix("::1/129".to_string()).into();
        assert_eq!(err.to_string(), "invalid IP prefix format: ::1/129");
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_not_found() {
        let err = IsomerError::NotFound("socket for foo".to_string());
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "not found: socket for foo");
    }
}
