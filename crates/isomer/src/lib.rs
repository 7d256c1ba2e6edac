//! Control plane of the isomer socket dispatcher.
//!
//! Operators declare bindings (steer TCP traffic for `::1/128` port 80 to
//! label `foo`), services register listening sockets under a label, and the
//! kernel picks the registered socket for each new connection. This crate
//! provides:
//!
//! - [`Binding`]: routing rules and their precedence order
//! - [`BindingKey`]: bit-exact encoding for the kernel's longest-prefix-match trie
//! - [`diff_bindings`]: reconciliation of desired against live bindings
//! - [`DestinationRegistry`]: destination identifiers, sockets and reference counts
//! - [`Dispatcher`]: the handle tying the above to a set of [`KernelTables`]
//!
//! # Example
//!
//! ```
//! use isomer::{Binding, Dispatcher, IsomerConfig, KernelTables, OpenMode, Protocol};
//!
//! let config = IsomerConfig::default();
//! let tables = KernelTables::in_memory(&config.tables);
//! let dispatcher = Dispatcher::open(tables, OpenMode::ReadWrite)?;
//!
//! let binding = Binding::new("foo", Protocol::Tcp, "::1", 80)?;
//! dispatcher.add_binding(&binding)?;
//! assert_eq!(dispatcher.bindings()?, vec![binding]);
//! # Ok::<(), isomer::IsomerError>(())
//! ```

mod binding;
mod config;
mod destination;
mod dispatcher;
mod error;
mod key;
mod logging;
mod metrics;
mod reconcile;
mod registry;
mod socket;
mod status;
mod table;

pub use isomer_types::{parse_prefix, Domain, IpPrefix, ParseError, Protocol};

pub use binding::{binding_counts, sort_bindings, Binding};
pub use config::{
    BindingConfig, IsomerConfig, LogFormat, LoggingConfig, TablesConfig, DEFAULT_CONFIG_PATH,
};
pub use destination::{
    validate_label, Destination, DestinationId, SocketCookie, DESTINATION_RECORD_LEN,
    MAX_LABEL_LEN,
};
pub use dispatcher::{Dispatcher, OpenMode};
pub use error::{IsomerError, Result, TableOp};
pub use key::{
    BindingKey, BindingValue, BINDING_KEY_HEADER_BITS, BINDING_KEY_LEN, BINDING_VALUE_LEN,
};
pub use logging::{env_filter, init_logging};
pub use metrics::{DestinationMetrics, Metrics, DESTINATION_METRICS_LEN};
pub use reconcile::{
    desired_keys, diff_bindings, reconcile, BindingDiff, KeyLabels, ReconcileOp, ReconcileReport,
};
pub use registry::{DestinationRegistry, RegisterOutcome};
pub use socket::{SocketDetails, SocketIdentity};
#[cfg(target_os = "linux")]
pub use socket::FdSocket;
pub use status::{DestinationStatus, StatusReport};
pub use table::{KernelMap, KernelTables, MemoryMap, TableError};
