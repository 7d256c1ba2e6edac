//! Destination registry.
//!
//! Maps `(label, domain, protocol)` to dense [`DestinationId`]s and tracks
//! which socket is registered for each destination. The registry mirrors
//! the destinations, sockets and metrics kernel tables: every allocation
//! writes a destination record and a zeroed metrics record, every retirement
//! deletes them again.
//!
//! Bindings and a registered socket each hold one reference on their
//! destination. When the last reference goes away the destination is
//! retired. Its identifier is never handed out again: a registry allocates
//! after the highest identifier it has seen, and [`DestinationRegistry::reserve`]
//! carries that mark across registries loaded from the same tables.

use isomer_types::{Domain, Protocol};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use crate::destination::{Destination, DestinationId, SocketCookie};
use crate::error::{IsomerError, Result, TableOp};
use crate::key::BindingValue;
use crate::metrics::DestinationMetrics;
use crate::table::{KernelMap, KernelTables, TableError};

/// Result of registering a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// The destination had no socket before.
    Created,
    /// A different socket was registered and has been replaced.
    Replaced,
    /// The same socket was already registered.
    Unchanged,
}

#[derive(Debug, Clone)]
struct DestinationEntry {
    destination: Destination,
    socket: Option<SocketCookie>,
    /// Bindings plus the registered socket, if any.
    refs: u32,
}

impl DestinationEntry {
    fn unreferenced(destination: Destination) -> Self {
        Self {
            destination,
            socket: None,
            refs: 0,
        }
    }
}

/// In-memory view of the destinations known to the kernel tables.
#[derive(Debug)]
pub struct DestinationRegistry {
    tables: KernelTables,
    ids: HashMap<Destination, DestinationId>,
    entries: BTreeMap<DestinationId, DestinationEntry>,
    next_id: u32,
}

impl DestinationRegistry {
    /// Creates an empty registry on top of `tables` without reading them.
    pub fn new(tables: KernelTables) -> Self {
        Self {
            tables,
            ids: HashMap::new(),
            entries: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Rebuilds the registry from the current kernel table contents.
    ///
    /// Reference counts are recomputed from the bindings and sockets tables.
    /// Allocation continues after the highest identifier found.
    pub fn load(tables: &KernelTables) -> Result<Self> {
        let mut registry = Self::new(tables.clone());

        for (key, value) in entries(tables.destinations.as_ref())? {
            let id = DestinationId::from_bytes(&key)?;
            let destination = Destination::from_record(&value)?;

            registry.next_id = registry.next_id.max(id.0.saturating_add(1));
            registry.ids.insert(destination.clone(), id);
            registry
                .entries
                .insert(id, DestinationEntry::unreferenced(destination));
        }

        for (key, value) in entries(tables.sockets.as_ref())? {
            let id = DestinationId::from_bytes(&key)?;
            let cookie = SocketCookie::from_bytes(&value)?;
            match registry.entries.get_mut(&id) {
                Some(entry) => {
                    entry.socket = Some(cookie);
                    entry.refs += 1;
                }
                None => {
                    warn!(id = %id, cookie = %cookie, "Socket registered for unknown destination")
                }
            }
        }

        for (_, value) in entries(tables.bindings.as_ref())? {
            let value = BindingValue::from_bytes(&value)?;
            match registry.entries.get_mut(&value.destination) {
                Some(entry) => entry.refs += 1,
                None => {
                    return Err(IsomerError::MalformedKey(format!(
                        "binding refers to unknown destination {}",
                        value.destination
                    )))
                }
            }
        }

        debug!(
            destinations = registry.entries.len(),
            next_id = registry.next_id,
            "Loaded destination registry"
        );
        Ok(registry)
    }

    /// The identifier the next allocation will use.
    pub fn next_id(&self) -> DestinationId {
        DestinationId(self.next_id)
    }

    /// Never allocates an identifier below `next`.
    ///
    /// Identifiers retired by other handles on the same tables no longer
    /// show up in them; this keeps them from being handed out again.
    pub fn reserve(&mut self, next: DestinationId) {
        self.next_id = self.next_id.max(next.0);
    }

    /// Returns the identifier for a destination, allocating it if needed.
    ///
    /// A fresh destination starts without references; callers take one with
    /// [`DestinationRegistry::acquire`] or drop it with
    /// [`DestinationRegistry::retire_if_unused`].
    pub fn resolve(
        &mut self,
        label: &str,
        domain: Domain,
        protocol: Protocol,
    ) -> Result<DestinationId> {
        let destination = Destination::new(label, domain, protocol)?;
        if let Some(id) = self.ids.get(&destination) {
            return Ok(*id);
        }

        let id = DestinationId(self.next_id);
        let next_id = self
            .next_id
            .checked_add(1)
            .ok_or(IsomerError::IdentifiersExhausted)?;

        let key = id.to_bytes();
        set(self.tables.destinations.as_ref(), &key, &destination.to_record()?)?;
        if let Err(e) = set(
            self.tables.metrics.as_ref(),
            &key,
            &DestinationMetrics::default().to_bytes(),
        ) {
            if let Err(undo) = delete_if_present(self.tables.destinations.as_ref(), &key) {
                warn!(id = %id, error = %undo, "Failed to remove half-allocated destination");
            }
            return Err(e);
        }

        self.next_id = next_id;
        info!(id = %id, destination = %destination, "Allocated destination");
        self.ids.insert(destination.clone(), id);
        self.entries
            .insert(id, DestinationEntry::unreferenced(destination));
        Ok(id)
    }

    /// Takes a reference on `id`.
    pub fn acquire(&mut self, id: DestinationId) -> Result<u32> {
        let entry = self.entry_mut(id)?;
        entry.refs = entry.refs.saturating_add(1);
        Ok(entry.refs)
    }

    /// Drops a reference on `id`, retiring it when none are left.
    pub fn release(&mut self, id: DestinationId) -> Result<u32> {
        let entry = self.entry_mut(id)?;
        entry.refs = entry.refs.checked_sub(1).ok_or_else(|| {
            IsomerError::MalformedKey(format!("destination {} released too often", id))
        })?;
        let refs = entry.refs;
        if refs == 0 {
            self.retire(id)?;
        }
        Ok(refs)
    }

    /// Retires `id` if nothing references it.
    pub fn retire_if_unused(&mut self, id: DestinationId) -> Result<()> {
        match self.ref_count(id) {
            Some(0) => self.retire(id),
            _ => Ok(()),
        }
    }

    fn entry_mut(&mut self, id: DestinationId) -> Result<&mut DestinationEntry> {
        self.entries
            .get_mut(&id)
            .ok_or_else(|| IsomerError::NotFound(format!("destination {}", id)))
    }

    fn retire(&mut self, id: DestinationId) -> Result<()> {
        let key = id.to_bytes();
        delete_if_present(self.tables.metrics.as_ref(), &key)?;
        delete_if_present(self.tables.destinations.as_ref(), &key)?;

        if let Some(entry) = self.entries.remove(&id) {
            info!(id = %id, destination = %entry.destination, "Retired destination");
            self.ids.remove(&entry.destination);
        }
        Ok(())
    }

    /// Registers `cookie` as the socket for `id`.
    ///
    /// A destination has at most one socket: registering a different cookie
    /// replaces the previous one. If `cookie` is registered for another
    /// destination it is moved. The new sockets entry is written before the
    /// old one is deleted; if that delete fails the new entry is restored
    /// to what it was, so the socket stays registered where it was. An error
    /// retiring the destination the socket left is returned after the move
    /// has taken effect.
    pub fn register_socket(
        &mut self,
        id: DestinationId,
        cookie: SocketCookie,
    ) -> Result<RegisterOutcome> {
        let previous = self.entry_mut(id)?.socket;
        if previous == Some(cookie) {
            return Ok(RegisterOutcome::Unchanged);
        }

        let elsewhere: Vec<DestinationId> = self
            .entries
            .iter()
            .filter(|(other, entry)| **other != id && entry.socket == Some(cookie))
            .map(|(other, _)| *other)
            .collect();

        let sockets = self.tables.sockets.as_ref();
        let key = id.to_bytes();
        set(sockets, &key, &cookie.to_bytes())?;

        for other in &elsewhere {
            debug!(from = %other, to = %id, cookie = %cookie, "Moving socket");
            if let Err(e) = delete_if_present(sockets, &other.to_bytes()) {
                let undo = match previous {
                    Some(previous) => set(sockets, &key, &previous.to_bytes()),
                    None => delete_if_present(sockets, &key),
                };
                if let Err(undo) = undo {
                    warn!(id = %id, error = %undo, "Failed to restore socket entry");
                }
                return Err(e);
            }
            if let Some(entry) = self.entries.get_mut(other) {
                entry.socket = None;
            }
        }

        let entry = self.entry_mut(id)?;
        entry.socket = Some(cookie);
        let outcome = if previous.is_some() {
            RegisterOutcome::Replaced
        } else {
            entry.refs = entry.refs.saturating_add(1);
            RegisterOutcome::Created
        };
        info!(
            id = %id,
            destination = %entry.destination,
            cookie = %cookie,
            ?outcome,
            "Registered socket"
        );

        // The socket has moved; drop the references it held elsewhere.
        for other in elsewhere {
            self.release(other)?;
        }
        Ok(outcome)
    }

    /// Removes the socket registered for `id` and returns its cookie.
    pub fn unregister_socket(&mut self, id: DestinationId) -> Result<SocketCookie> {
        let cookie = self
            .entries
            .get(&id)
            .and_then(|entry| entry.socket)
            .ok_or_else(|| IsomerError::NotFound(format!("socket for destination {}", id)))?;

        delete_if_present(self.tables.sockets.as_ref(), &id.to_bytes())?;
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.socket = None;
        }
        info!(id = %id, cookie = %cookie, "Unregistered socket");

        self.release(id)?;
        Ok(cookie)
    }

    pub fn id_of(&self, destination: &Destination) -> Option<DestinationId> {
        self.ids.get(destination).copied()
    }

    pub fn destination(&self, id: DestinationId) -> Option<&Destination> {
        self.entries.get(&id).map(|entry| &entry.destination)
    }

    pub fn ref_count(&self, id: DestinationId) -> Option<u32> {
        self.entries.get(&id).map(|entry| entry.refs)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All live destinations, sorted by (label, domain, protocol).
    pub fn destinations(&self) -> Vec<Destination> {
        let mut dests: Vec<Destination> = self
            .entries
            .values()
            .map(|entry| entry.destination.clone())
            .collect();
        dests.sort();
        dests
    }

    /// Registered sockets by destination.
    pub fn sockets(&self) -> BTreeMap<Destination, SocketCookie> {
        self.entries
            .values()
            .filter_map(|entry| entry.socket.map(|cookie| (entry.destination.clone(), cookie)))
            .collect()
    }

    /// Reads the kernel counters for `destination`.
    ///
    /// A destination without a metrics record reports zero.
    pub fn counters_for(&self, destination: &Destination) -> Result<DestinationMetrics> {
        let id = self
            .id_of(destination)
            .ok_or_else(|| IsomerError::NotFound(format!("destination {}", destination)))?;
        self.counters_for_id(id)
    }

    fn counters_for_id(&self, id: DestinationId) -> Result<DestinationMetrics> {
        let key = id.to_bytes();
        let metrics = self.tables.metrics.as_ref();
        match metrics.get(&key) {
            Ok(Some(value)) => DestinationMetrics::from_bytes(&value),
            Ok(None) => Ok(DestinationMetrics::default()),
            Err(e) => Err(IsomerError::table(metrics.name(), TableOp::Get, &key, e)),
        }
    }

    /// Counters for every live destination.
    pub fn counters(&self) -> Result<BTreeMap<Destination, DestinationMetrics>> {
        let mut counters = BTreeMap::new();
        for (id, entry) in self.entries.iter() {
            counters.insert(entry.destination.clone(), self.counters_for_id(*id)?);
        }
        Ok(counters)
    }
}

pub(crate) fn entries(map: &dyn KernelMap) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    map.entries()
        .map_err(|e| IsomerError::table(map.name(), TableOp::Iterate, &[], e))
}

pub(crate) fn set(map: &dyn KernelMap, key: &[u8], value: &[u8]) -> Result<()> {
    map.set(key, value)
        .map_err(|e| IsomerError::table(map.name(), TableOp::Set, key, e))
}

fn delete_if_present(map: &dyn KernelMap, key: &[u8]) -> Result<()> {
    match map.delete(key) {
        Ok(()) | Err(TableError::KeyNotFound) => Ok(()),
        Err(e) => Err(IsomerError::table(map.name(), TableOp::Delete, key, e)),
    }
}
