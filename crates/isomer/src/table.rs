//! Map-like interface to the kernel tables.
//!
//! The kernel side owns four maps: bindings (the lookup trie), destinations
//! (identifier to destination record), sockets (identifier to socket) and
//! metrics (identifier to counters). The control plane only ever sees them
//! through [`KernelMap`]: get, set, delete and iterate over fixed-width
//! binary keys and values. Every call is individually atomic; nothing here
//! offers multi-key transactions.
//!
//! Handles cloned from the same [`KernelTables`] share one writer lock, so
//! mutations made through different dispatchers never interleave.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::config::TablesConfig;
use crate::destination::{DESTINATION_ID_LEN, DESTINATION_RECORD_LEN, SOCKET_COOKIE_LEN};
use crate::key::{BINDING_KEY_LEN, BINDING_VALUE_LEN};
use crate::metrics::DESTINATION_METRICS_LEN;

/// Failure reported by a kernel table.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("key not found")]
    KeyNotFound,

    #[error("table full ({max_entries} entries)")]
    Full { max_entries: usize },

    #[error("key is {actual} bytes, expected {expected}")]
    KeySize { expected: usize, actual: usize },

    #[error("value is {actual} bytes, expected {expected}")]
    ValueSize { expected: usize, actual: usize },

    #[error("{0}")]
    Os(#[from] std::io::Error),
}

/// A kernel map with fixed-width binary keys and values.
pub trait KernelMap: Send + Sync {
    /// Name of the map, used in error context.
    fn name(&self) -> &str;

    /// Looks up `key`. Returns `Ok(None)` if it is not present.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TableError>;

    /// Creates or replaces the entry for `key`.
    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), TableError>;

    /// Deletes `key`, failing with [`TableError::KeyNotFound`] if absent.
    fn delete(&self, key: &[u8]) -> Result<(), TableError>;

    /// Returns a snapshot of every entry.
    fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, TableError>;
}

/// In-process [`KernelMap`] with the same size and capacity checks the
/// kernel applies.
#[derive(Debug)]
pub struct MemoryMap {
    name: String,
    key_size: usize,
    value_size: usize,
    max_entries: usize,
    inner: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryMap {
    pub fn new(
        name: impl Into<String>,
        key_size: usize,
        value_size: usize,
        max_entries: usize,
    ) -> Self {
        Self {
            name: name.into(),
            key_size,
            value_size,
            max_entries,
            inner: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    fn check_key(&self, key: &[u8]) -> Result<(), TableError> {
        if key.len() != self.key_size {
            return Err(TableError::KeySize {
                expected: self.key_size,
                actual: key.len(),
            });
        }
        Ok(())
    }
}

impl KernelMap for MemoryMap {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TableError> {
        self.check_key(key)?;
        Ok(self.inner.read().get(key).cloned())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), TableError> {
        self.check_key(key)?;
        if value.len() != self.value_size {
            return Err(TableError::ValueSize {
                expected: self.value_size,
                actual: value.len(),
            });
        }

        let mut inner = self.inner.write();
        if !inner.contains_key(key) && inner.len() >= self.max_entries {
            return Err(TableError::Full {
                max_entries: self.max_entries,
            });
        }
        inner.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), TableError> {
        self.check_key(key)?;
        match self.inner.write().remove(key) {
            Some(_) => Ok(()),
            None => Err(TableError::KeyNotFound),
        }
    }

    fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, TableError> {
        Ok(self
            .inner
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Handles to the four kernel tables backing a dispatcher.
///
/// Clones share the tables and the writer lock.
#[derive(Clone)]
pub struct KernelTables {
    pub bindings: Arc<dyn KernelMap>,
    pub destinations: Arc<dyn KernelMap>,
    pub sockets: Arc<dyn KernelMap>,
    pub metrics: Arc<dyn KernelMap>,
    /// Next unused destination identifier.
    writers: Arc<RwLock<u32>>,
}

impl KernelTables {
    pub fn new(
        bindings: Arc<dyn KernelMap>,
        destinations: Arc<dyn KernelMap>,
        sockets: Arc<dyn KernelMap>,
        metrics: Arc<dyn KernelMap>,
    ) -> Self {
        Self {
            bindings,
            destinations,
            sockets,
            metrics,
            writers: Arc::new(RwLock::new(0)),
        }
    }

    /// Creates in-process tables sized according to `config`.
    pub fn in_memory(config: &TablesConfig) -> Self {
        Self::new(
            Arc::new(MemoryMap::new(
                "bindings",
                BINDING_KEY_LEN,
                BINDING_VALUE_LEN,
                config.max_bindings,
            )),
            Arc::new(MemoryMap::new(
                "destinations",
                DESTINATION_ID_LEN,
                DESTINATION_RECORD_LEN,
                config.max_destinations,
            )),
            Arc::new(MemoryMap::new(
                "sockets",
                DESTINATION_ID_LEN,
                SOCKET_COOKIE_LEN,
                config.max_destinations,
            )),
            Arc::new(MemoryMap::new(
                "metrics",
                DESTINATION_ID_LEN,
                DESTINATION_METRICS_LEN,
                config.max_destinations,
            )),
        )
    }

    /// Excludes every other writer and reader on these tables.
    ///
    /// The guarded value is the next destination identifier nobody has
    /// handed out yet.
    pub(crate) fn lock_writer(&self) -> RwLockWriteGuard<'_, u32> {
        self.writers.write()
    }

    /// Excludes writers while a consistent view of the tables is read.
    pub(crate) fn lock_reader(&self) -> RwLockReadGuard<'_, u32> {
        self.writers.read()
    }
}

impl std::fmt::Debug for KernelTables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelTables")
            .field("bindings", &self.bindings.name())
            .field("destinations", &self.destinations.name())
            .field("sockets", &self.sockets.name())
            .field("metrics", &self.metrics.name())
            .finish()
    }
}
