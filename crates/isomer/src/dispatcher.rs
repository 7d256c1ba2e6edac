//! The dispatcher: bindings, sockets and metrics behind one handle.
//!
//! A [`Dispatcher`] holds the kernel table handles. The tables are the only
//! shared state: any number of dispatchers may be opened on clones of the
//! same [`KernelTables`], and each call rebuilds the destination registry
//! from the tables before using it.
//!
//! Mutations hold the tables' writer lock for their whole duration and are
//! expressed as individual kernel table operations. Reads hold the reader
//! lock once per call; a status report consists of several independent reads
//! and may observe a concurrent reconciliation half way through.

use isomer_types::{Domain, Protocol};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

use crate::binding::{binding_counts, Binding};
use crate::destination::{Destination, DestinationId, SocketCookie};
use crate::error::{IsomerError, Result, TableOp};
use crate::key::{BindingKey, BindingValue};
use crate::metrics::{DestinationMetrics, Metrics};
use crate::reconcile::{desired_keys, diff_bindings, KeyLabels, ReconcileOp, ReconcileReport};
use crate::registry::{entries, set, DestinationRegistry, RegisterOutcome};
use crate::socket::SocketIdentity;
use crate::status::StatusReport;
use crate::table::{KernelMap, KernelTables, TableError};

/// Whether a dispatcher may modify the kernel tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadWrite,
    /// Every mutating call fails with [`IsomerError::ReadOnly`].
    ReadOnly,
}

#[derive(Debug)]
pub struct Dispatcher {
    tables: KernelTables,
    mode: OpenMode,
}

impl Dispatcher {
    /// Opens a dispatcher on `tables`.
    ///
    /// Fails if the tables hold records that cannot be decoded.
    #[instrument(skip(tables))]
    pub fn open(tables: KernelTables, mode: OpenMode) -> Result<Self> {
        let destinations = {
            let _reader = tables.lock_reader();
            DestinationRegistry::load(&tables)?.len()
        };
        info!(destinations, "Opened dispatcher");
        Ok(Self { tables, mode })
    }

    /// Closes the dispatcher and drops its table handles.
    ///
    /// Dropping the dispatcher has the same effect; `close` marks the end of
    /// a handle's use at the call site. Other handles on the same tables are
    /// not affected.
    pub fn close(self) {
        debug!(mode = ?self.mode, "Closing dispatcher");
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    fn check_writable(&self) -> Result<()> {
        match self.mode {
            OpenMode::ReadWrite => Ok(()),
            OpenMode::ReadOnly => Err(IsomerError::ReadOnly),
        }
    }

    /// Runs `f` on a registry loaded from the tables under the writer lock.
    fn write<T>(&self, f: impl FnOnce(&mut DestinationRegistry) -> Result<T>) -> Result<T> {
        self.check_writable()?;
        let mut next_id = self.tables.lock_writer();
        let mut registry = DestinationRegistry::load(&self.tables)?;
        registry.reserve(DestinationId(*next_id));

        let result = f(&mut registry);
        *next_id = registry.next_id().0;
        result
    }

    /// Runs `f` on a registry loaded from the tables under the reader lock.
    fn read<T>(&self, f: impl FnOnce(&DestinationRegistry) -> Result<T>) -> Result<T> {
        let _reader = self.tables.lock_reader();
        let registry = DestinationRegistry::load(&self.tables)?;
        f(&registry)
    }

    /// Adds a binding, replacing any binding with the same key.
    ///
    /// Adding a binding that already exists is a no-op. When the key was
    /// bound to another label, an error retiring that label's destination is
    /// returned after the binding has been replaced.
    #[instrument(skip(self, binding), fields(binding = %binding))]
    pub fn add_binding(&self, binding: &Binding) -> Result<()> {
        self.write(|registry| self.add_locked(registry, binding))
    }

    fn add_locked(&self, registry: &mut DestinationRegistry, binding: &Binding) -> Result<()> {
        let key = BindingKey::from(binding);
        let key_bytes = key.to_bytes();
        let bindings: &dyn KernelMap = self.tables.bindings.as_ref();

        let existing = match bindings.get(&key_bytes) {
            Ok(Some(value)) => Some(BindingValue::from_bytes(&value)?),
            Ok(None) => None,
            Err(e) => {
                return Err(IsomerError::table(bindings.name(), TableOp::Get, &key_bytes, e))
            }
        };

        let id = registry.resolve(binding.label(), binding.domain(), binding.protocol())?;
        if existing.map(|v| v.destination) == Some(id) {
            debug!("Binding already present");
            return Ok(());
        }

        let value = BindingValue::new(id, &key);
        if let Err(e) = set(bindings, &key_bytes, &value.to_bytes()) {
            registry.retire_if_unused(id)?;
            return Err(e);
        }
        registry.acquire(id)?;
        info!(id = %id, replaced = existing.is_some(), "Added binding");

        if let Some(old) = existing {
            registry.release(old.destination)?;
        }
        Ok(())
    }

    /// Removes a binding.
    ///
    /// Fails with [`IsomerError::NotFound`] if the key is absent or bound to
    /// another label.
    #[instrument(skip(self, binding), fields(binding = %binding))]
    pub fn remove_binding(&self, binding: &Binding) -> Result<()> {
        self.write(|registry| self.remove_locked(registry, binding))
    }

    fn remove_locked(&self, registry: &mut DestinationRegistry, binding: &Binding) -> Result<()> {
        let key_bytes = BindingKey::from(binding).to_bytes();
        let bindings: &dyn KernelMap = self.tables.bindings.as_ref();
        let not_found = || IsomerError::NotFound(format!("binding {}", binding));

        let value = match bindings.get(&key_bytes) {
            Ok(Some(value)) => BindingValue::from_bytes(&value)?,
            Ok(None) => return Err(not_found()),
            Err(e) => {
                return Err(IsomerError::table(bindings.name(), TableOp::Get, &key_bytes, e))
            }
        };

        match registry.destination(value.destination) {
            Some(dest) if dest.label == binding.label() => {}
            _ => return Err(not_found()),
        }

        match bindings.delete(&key_bytes) {
            Ok(()) => {}
            Err(TableError::KeyNotFound) => return Err(not_found()),
            Err(e) => {
                return Err(IsomerError::table(bindings.name(), TableOp::Delete, &key_bytes, e))
            }
        }

        registry.release(value.destination)?;
        info!(id = %value.destination, "Removed binding");
        Ok(())
    }

    /// All bindings, most specific first.
    pub fn bindings(&self) -> Result<Vec<Binding>> {
        let live = self.read(|registry| self.live_keys(registry))?;

        let mut bindings = live
            .iter()
            .map(|(key, label)| key.to_binding(label))
            .collect::<Result<Vec<_>>>()?;
        bindings.sort();
        debug!(count = bindings.len(), "Read bindings");
        Ok(bindings)
    }

    fn live_keys(&self, registry: &DestinationRegistry) -> Result<KeyLabels> {
        let mut live = KeyLabels::new();
        for (key, value) in entries(self.tables.bindings.as_ref())? {
            let key = BindingKey::from_bytes(&key)?;
            let value = BindingValue::from_bytes(&value)?;
            let dest = registry.destination(value.destination).ok_or_else(|| {
                IsomerError::MalformedKey(format!(
                    "binding {} refers to unknown destination {}",
                    key, value.destination
                ))
            })?;
            live.insert(key, dest.label.clone());
        }
        Ok(live)
    }

    /// Makes `desired` the complete set of bindings.
    ///
    /// Removals are applied before additions. Failed operations are reported
    /// and not rolled back. Conflicting desired bindings are rejected before
    /// anything is changed.
    #[instrument(skip(self, desired), fields(desired = desired.len()))]
    pub fn replace_bindings(&self, desired: &[Binding]) -> Result<ReconcileReport> {
        self.check_writable()?;
        let desired = desired_keys(desired)?;
        self.write(|registry| self.reconcile_locked(registry, &desired))
    }

    fn reconcile_locked(
        &self,
        registry: &mut DestinationRegistry,
        desired: &KeyLabels,
    ) -> Result<ReconcileReport> {
        let live = self.live_keys(registry)?;
        let diff = diff_bindings(&live, desired)?;

        let mut report = ReconcileReport::default();
        for op in diff.operations() {
            let result = match &op {
                ReconcileOp::Remove(binding) => self.remove_locked(registry, binding),
                ReconcileOp::Add(binding) => self.add_locked(registry, binding),
            };
            match result {
                Ok(()) => report.succeeded.push(op),
                Err(e) => {
                    warn!(op = %op, error = %e, "Reconciliation step failed");
                    report.failed.push((op, e));
                }
            }
        }

        info!(
            added = report.added().count(),
            removed = report.removed().count(),
            failed = report.failed.len(),
            "Replaced bindings"
        );
        Ok(report)
    }

    /// Registers `socket` as the destination for `label`.
    ///
    /// The destination's domain and protocol are taken from the socket. TCP
    /// sockets must be listening.
    #[instrument(skip(self, socket))]
    pub fn register_socket(
        &self,
        label: &str,
        socket: &impl SocketIdentity,
    ) -> Result<(Destination, RegisterOutcome)> {
        self.check_writable()?;
        let details = socket.describe()?;
        if details.protocol == Protocol::Tcp && !details.listening {
            return Err(IsomerError::UnsupportedSocket(format!(
                "{} is not listening",
                details.cookie
            )));
        }

        let destination = Destination::new(label, details.domain, details.protocol)?;

        self.write(|registry| {
            let id = registry.resolve(label, details.domain, details.protocol)?;
            match registry.register_socket(id, details.cookie) {
                Ok(outcome) => Ok((destination, outcome)),
                Err(e) => {
                    registry.retire_if_unused(id)?;
                    Err(e)
                }
            }
        })
    }

    /// Unregisters the socket of a destination and returns its cookie.
    #[instrument(skip(self))]
    pub fn unregister_socket(
        &self,
        label: &str,
        domain: Domain,
        protocol: Protocol,
    ) -> Result<SocketCookie> {
        self.check_writable()?;
        let destination = Destination::new(label, domain, protocol)?;

        self.write(|registry| {
            let id = registry
                .id_of(&destination)
                .ok_or_else(|| IsomerError::NotFound(format!("socket for {}", destination)))?;
            registry.unregister_socket(id)
        })
    }

    /// Live destinations and the sockets registered for them.
    pub fn destinations(&self) -> Result<(Vec<Destination>, BTreeMap<Destination, SocketCookie>)> {
        self.read(|registry| Ok((registry.destinations(), registry.sockets())))
    }

    pub fn counters_for(&self, destination: &Destination) -> Result<DestinationMetrics> {
        self.read(|registry| registry.counters_for(destination))
    }

    /// Binding counts and kernel counters per destination.
    pub fn metrics(&self) -> Result<Metrics> {
        let bindings = self.bindings()?;
        let destinations = self.read(|registry| registry.counters())?;
        Ok(Metrics {
            bindings: binding_counts(&bindings),
            destinations,
        })
    }

    /// Summary of bindings and destinations, optionally limited to `label`.
    pub fn status(&self, label: Option<&str>) -> Result<StatusReport> {
        let bindings = self.bindings()?;
        let (destinations, sockets) = self.destinations()?;
        let metrics = self.metrics()?;
        Ok(StatusReport::new(bindings, destinations, &sockets, &metrics, label))
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        debug!(mode = ?self.mode, "Closed dispatcher");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TablesConfig;
    use crate::socket::SocketDetails;
    use pretty_assertions::assert_eq;

    fn dispatcher() -> Dispatcher {
        let tables = KernelTables::in_memory(&TablesConfig::default());
        Dispatcher::open(tables, OpenMode::ReadWrite).unwrap()
    }

    fn b(label: &str, prefix: &str, port: u16) -> Binding {
        Binding::new(label, Protocol::Tcp, prefix, port).unwrap()
    }

    fn listener(cookie: u64) -> SocketDetails {
        SocketDetails {
            cookie: SocketCookie(cookie),
            domain: Domain::Inet6,
            protocol: Protocol::Tcp,
            listening: true,
        }
    }

    #[test]
    fn test_dispatcher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Dispatcher>();
    }

    #[test]
    fn test_add_binding_is_idempotent() {
        let dp = dispatcher();
        dp.add_binding(&b("foo", "::1", 80)).unwrap();
        dp.add_binding(&b("foo", "::1", 80)).unwrap();

        assert_eq!(dp.bindings().unwrap(), vec![b("foo", "::1", 80)]);
        let (dests, _) = dp.destinations().unwrap();
        assert_eq!(dests.len(), 1);
    }

    #[test]
    fn test_add_binding_replaces_label() {
        let dp = dispatcher();
        dp.add_binding(&b("foo", "::1", 80)).unwrap();
        dp.add_binding(&b("bar", "::1", 80)).unwrap();

        assert_eq!(dp.bindings().unwrap(), vec![b("bar", "::1", 80)]);

        // foo lost its only reference.
        let (dests, _) = dp.destinations().unwrap();
        assert_eq!(dests, vec![b("bar", "::1", 80).destination()]);
    }

    #[test]
    fn test_remove_binding() {
        let dp = dispatcher();
        dp.add_binding(&b("foo", "::1", 80)).unwrap();

        assert!(dp.remove_binding(&b("bar", "::1", 80)).unwrap_err().is_not_found());
        assert!(dp.remove_binding(&b("foo", "::2", 80)).unwrap_err().is_not_found());

        dp.remove_binding(&b("foo", "::1", 80)).unwrap();
        assert!(dp.bindings().unwrap().is_empty());
        assert!(dp.destinations().unwrap().0.is_empty());
    }

    #[test]
    fn test_socket_keeps_destination_alive() {
        let dp = dispatcher();
        dp.add_binding(&b("foo", "::1", 80)).unwrap();
        dp.register_socket("foo", &listener(1)).unwrap();
        dp.remove_binding(&b("foo", "::1", 80)).unwrap();

        let (dests, sockets) = dp.destinations().unwrap();
        assert_eq!(dests.len(), 1);
        assert_eq!(sockets.get(&dests[0]), Some(&SocketCookie(1)));

        dp.unregister_socket("foo", Domain::Inet6, Protocol::Tcp).unwrap();
        assert!(dp.destinations().unwrap().0.is_empty());
    }

    #[test]
    fn test_register_rejects_non_listening_tcp() {
        let dp = dispatcher();
        let mut socket = listener(1);
        socket.listening = false;

        assert!(matches!(
            dp.register_socket("foo", &socket),
            Err(IsomerError::UnsupportedSocket(_))
        ));
        assert!(dp.destinations().unwrap().0.is_empty());

        let udp = SocketDetails {
            protocol: Protocol::Udp,
            ..socket
        };
        let (dest, outcome) = dp.register_socket("foo", &udp).unwrap();
        assert_eq!(dest.protocol, Protocol::Udp);
        assert_eq!(outcome, RegisterOutcome::Created);
    }

    #[test]
    fn test_metrics_counts_bindings() {
        let dp = dispatcher();
        dp.add_binding(&b("foo", "::1", 80)).unwrap();
        dp.add_binding(&b("foo", "::2", 80)).unwrap();

        let metrics = dp.metrics().unwrap();
        let foo = b("foo", "::1", 80).destination();
        assert_eq!(metrics.bindings.get(&foo), Some(&2));
        assert_eq!(metrics.for_destination(&foo), DestinationMetrics::default());
        assert_eq!(dp.counters_for(&foo).unwrap(), DestinationMetrics::default());
    }

    #[test]
    fn test_replace_bindings_rejects_conflicts_up_front() {
        let dp = dispatcher();
        dp.add_binding(&b("foo", "::1", 80)).unwrap();

        let err = dp
            .replace_bindings(&[b("bar", "::2", 80), b("baz", "::2", 80)])
            .unwrap_err();
        assert!(matches!(err, IsomerError::ConflictingBinding { .. }));
        assert_eq!(dp.bindings().unwrap(), vec![b("foo", "::1", 80)]);
    }
}
