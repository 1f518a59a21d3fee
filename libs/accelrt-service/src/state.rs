// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Thread-safe handle tables and client liveness for the proxy service.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use accelrt::{AccelError, CoreOpPtr, InputVStream, OutputVStream, Result};
use parking_lot::Mutex;

use crate::proto::{NetworkGroupIdentifier, VStreamIdentifier};

struct HandleEntry<T> {
    object: Arc<T>,
    refs_by_pid: HashMap<u32, usize>,
}

/// Objects published to remote clients, addressed by handle.
///
/// Each handle keeps a reference count per client pid. The object is
/// dropped once every pid released all of its references.
pub struct HandleTable<T> {
    kind: &'static str,
    next_handle: u32,
    entries: BTreeMap<u32, HandleEntry<T>>,
}

impl<T> HandleTable<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            next_handle: 1,
            entries: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, object: Arc<T>, pid: u32) -> u32 {
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        self.entries.insert(
            handle,
            HandleEntry {
                object,
                refs_by_pid: HashMap::from([(pid, 1)]),
            },
        );
        handle
    }

    /// Add one reference held by `pid`. The handle itself is unchanged.
    pub fn dup(&mut self, handle: u32, pid: u32) -> Result<u32> {
        let entry = self.entry_mut(handle)?;
        *entry.refs_by_pid.entry(pid).or_default() += 1;
        Ok(handle)
    }

    /// Drop one reference held by `pid`.
    ///
    /// Returns the object when this was the last reference of any pid.
    pub fn release(&mut self, handle: u32, pid: u32) -> Result<Option<Arc<T>>> {
        let kind = self.kind;
        let entry = self.entry_mut(handle)?;
        let refs = entry.refs_by_pid.get_mut(&pid).ok_or_else(|| {
            AccelError::NotFound(format!("{} handle {} is not held by pid {}", kind, handle, pid))
        })?;
        *refs -= 1;
        if *refs == 0 {
            entry.refs_by_pid.remove(&pid);
        }
        Ok(self.remove_if_unreferenced(handle))
    }

    /// Drop every reference held by `pid`. Returns the objects that lost
    /// their last reference.
    pub fn release_all(&mut self, pid: u32) -> Vec<Arc<T>> {
        self.handles_owned_by(pid)
            .into_iter()
            .filter_map(|handle| {
                if let Some(entry) = self.entries.get_mut(&handle) {
                    entry.refs_by_pid.remove(&pid);
                }
                self.remove_if_unreferenced(handle)
            })
            .collect()
    }

    pub fn get(&self, handle: u32) -> Result<Arc<T>> {
        self.entries
            .get(&handle)
            .map(|entry| entry.object.clone())
            .ok_or_else(|| AccelError::NotFound(format!("unknown {} handle {}", self.kind, handle)))
    }

    pub fn handles_owned_by(&self, pid: u32) -> Vec<u32> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.refs_by_pid.contains_key(&pid))
            .map(|(handle, _)| *handle)
            .collect()
    }

    pub fn references(&self, handle: u32) -> usize {
        self.entries
            .get(&handle)
            .map_or(0, |entry| entry.refs_by_pid.values().sum())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry_mut(&mut self, handle: u32) -> Result<&mut HandleEntry<T>> {
        let kind = self.kind;
        self.entries
            .get_mut(&handle)
            .ok_or_else(|| AccelError::NotFound(format!("unknown {} handle {}", kind, handle)))
    }

    fn remove_if_unreferenced(&mut self, handle: u32) -> Option<Arc<T>> {
        if self
            .entries
            .get(&handle)
            .is_some_and(|entry| entry.refs_by_pid.is_empty())
        {
            self.entries.remove(&handle).map(|entry| entry.object)
        } else {
            None
        }
    }
}

/// A core-op published under a virtual-device handle.
pub struct RegisteredNetworkGroup {
    pub vdevice_handle: u32,
    pub core_op: CoreOpPtr,
}

/// A vstream together with the network group it was created from.
pub struct RegisteredVStream<V> {
    pub network_group_handle: u32,
    pub vdevice_handle: u32,
    pub vstream: V,
}

impl<V> RegisteredVStream<V> {
    fn matches(&self, identifier: &VStreamIdentifier) -> bool {
        self.network_group_handle == identifier.network_group_handle
            && self.vdevice_handle == identifier.vdevice_handle
    }
}

pub type InputVStreamEntry = RegisteredVStream<InputVStream>;
pub type OutputVStreamEntry = RegisteredVStream<OutputVStream>;

struct Tables {
    clients: HashMap<u32, Instant>,
    network_groups: HandleTable<RegisteredNetworkGroup>,
    input_vstreams: HandleTable<InputVStreamEntry>,
    output_vstreams: HandleTable<OutputVStreamEntry>,
}

/// Shared state of the proxy service.
///
/// One lock guards the liveness table, the handle tables and the abort
/// sweep, so an explicit release never races a reap of the same pid.
#[derive(Clone)]
pub struct ServiceState {
    inner: Arc<ServiceStateInner>,
}

struct ServiceStateInner {
    tables: Mutex<Tables>,
    started_at: Instant,
}

impl Default for ServiceState {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ServiceStateInner {
                tables: Mutex::new(Tables {
                    clients: HashMap::new(),
                    network_groups: HandleTable::new("network group"),
                    input_vstreams: HandleTable::new("input vstream"),
                    output_vstreams: HandleTable::new("output vstream"),
                }),
                started_at: Instant::now(),
            }),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started_at.elapsed()
    }

    // ----- liveness -----

    /// Record a heartbeat from `pid`.
    pub fn update_client_timestamp(&self, pid: u32) {
        self.inner.tables.lock().clients.insert(pid, Instant::now());
    }

    pub fn is_client_alive(&self, pid: u32) -> bool {
        self.inner.tables.lock().clients.contains_key(&pid)
    }

    pub fn client_count(&self) -> usize {
        self.inner.tables.lock().clients.len()
    }

    /// Reap every pid whose last heartbeat is older than `window`.
    ///
    /// Each vstream a reaped pid holds is aborted once, then all of that
    /// pid's handle references are dropped. Returns the reaped pids.
    pub fn remove_disconnected_clients(&self, window: Duration) -> Vec<u32> {
        let now = Instant::now();
        let mut tables = self.inner.tables.lock();

        let mut reaped: Vec<u32> = tables
            .clients
            .iter()
            .filter(|(_, last_seen)| now.saturating_duration_since(**last_seen) > window)
            .map(|(pid, _)| *pid)
            .collect();
        reaped.sort_unstable();

        for pid in &reaped {
            tables.clients.remove(pid);
            tracing::warn!(pid, "[Service] Client stopped sending keep-alives, aborting its vstreams");

            for handle in tables.input_vstreams.handles_owned_by(*pid) {
                if let Ok(entry) = tables.input_vstreams.get(handle) {
                    if let Err(e) = entry.vstream.abort() {
                        tracing::error!(pid, handle, error = %e, "[Service] Failed to abort input vstream");
                    }
                }
            }
            for handle in tables.output_vstreams.handles_owned_by(*pid) {
                if let Ok(entry) = tables.output_vstreams.get(handle) {
                    if let Err(e) = entry.vstream.abort() {
                        tracing::error!(pid, handle, error = %e, "[Service] Failed to abort output vstream");
                    }
                }
            }

            let inputs = tables.input_vstreams.release_all(*pid).len();
            let outputs = tables.output_vstreams.release_all(*pid).len();
            let groups = tables.network_groups.release_all(*pid).len();
            tracing::debug!(pid, inputs, outputs, groups, "[Service] Dropped objects of reaped client");
        }
        reaped
    }

    // ----- network groups -----

    /// Publish a configured core-op on behalf of `pid`.
    pub fn register_network_group(
        &self,
        vdevice_handle: u32,
        core_op: CoreOpPtr,
        pid: u32,
    ) -> NetworkGroupIdentifier {
        let mut tables = self.inner.tables.lock();
        tables.clients.entry(pid).or_insert_with(Instant::now);
        let name = core_op.name().to_string();
        let handle = tables.network_groups.register(
            Arc::new(RegisteredNetworkGroup {
                vdevice_handle,
                core_op,
            }),
            pid,
        );
        tracing::info!(core_op = %name, handle, vdevice_handle, pid, "[Service] Registered network group");
        NetworkGroupIdentifier {
            network_group_handle: handle,
            vdevice_handle,
        }
    }

    pub fn network_group(&self, identifier: &NetworkGroupIdentifier) -> Result<CoreOpPtr> {
        let entry = self
            .inner
            .tables
            .lock()
            .network_groups
            .get(identifier.network_group_handle)?;
        if entry.vdevice_handle != identifier.vdevice_handle {
            return Err(AccelError::NotFound(format!(
                "network group {} does not belong to vdevice {}",
                identifier.network_group_handle, identifier.vdevice_handle
            )));
        }
        Ok(entry.core_op.clone())
    }

    pub fn dup_network_group(&self, identifier: &NetworkGroupIdentifier, pid: u32) -> Result<u32> {
        self.network_group(identifier)?;
        self.inner
            .tables
            .lock()
            .network_groups
            .dup(identifier.network_group_handle, pid)
    }

    pub fn release_network_group(&self, identifier: &NetworkGroupIdentifier, pid: u32) -> Result<()> {
        let released = self
            .inner
            .tables
            .lock()
            .network_groups
            .release(identifier.network_group_handle, pid)?;
        if let Some(entry) = released {
            tracing::info!(
                core_op = %entry.core_op.name(),
                handle = identifier.network_group_handle,
                "[Service] Network group released by its last client"
            );
        }
        Ok(())
    }

    pub fn network_group_references(&self, handle: u32) -> usize {
        self.inner.tables.lock().network_groups.references(handle)
    }

    // ----- vstreams -----

    pub fn register_input_vstreams(
        &self,
        identifier: &NetworkGroupIdentifier,
        vstreams: Vec<InputVStream>,
        pid: u32,
    ) -> Vec<u32> {
        let mut tables = self.inner.tables.lock();
        vstreams
            .into_iter()
            .map(|vstream| {
                tables.input_vstreams.register(
                    Arc::new(RegisteredVStream {
                        network_group_handle: identifier.network_group_handle,
                        vdevice_handle: identifier.vdevice_handle,
                        vstream,
                    }),
                    pid,
                )
            })
            .collect()
    }

    pub fn register_output_vstreams(
        &self,
        identifier: &NetworkGroupIdentifier,
        vstreams: Vec<OutputVStream>,
        pid: u32,
    ) -> Vec<u32> {
        let mut tables = self.inner.tables.lock();
        vstreams
            .into_iter()
            .map(|vstream| {
                tables.output_vstreams.register(
                    Arc::new(RegisteredVStream {
                        network_group_handle: identifier.network_group_handle,
                        vdevice_handle: identifier.vdevice_handle,
                        vstream,
                    }),
                    pid,
                )
            })
            .collect()
    }

    pub fn input_vstream(&self, identifier: &VStreamIdentifier) -> Result<Arc<InputVStreamEntry>> {
        let entry = self
            .inner
            .tables
            .lock()
            .input_vstreams
            .get(identifier.vstream_handle)?;
        check_vstream_owner(&entry, identifier)?;
        Ok(entry)
    }

    pub fn output_vstream(&self, identifier: &VStreamIdentifier) -> Result<Arc<OutputVStreamEntry>> {
        let entry = self
            .inner
            .tables
            .lock()
            .output_vstreams
            .get(identifier.vstream_handle)?;
        check_vstream_owner(&entry, identifier)?;
        Ok(entry)
    }

    pub fn dup_input_vstream(&self, identifier: &VStreamIdentifier, pid: u32) -> Result<u32> {
        self.input_vstream(identifier)?;
        self.inner
            .tables
            .lock()
            .input_vstreams
            .dup(identifier.vstream_handle, pid)
    }

    pub fn dup_output_vstream(&self, identifier: &VStreamIdentifier, pid: u32) -> Result<u32> {
        self.output_vstream(identifier)?;
        self.inner
            .tables
            .lock()
            .output_vstreams
            .dup(identifier.vstream_handle, pid)
    }

    pub fn release_input_vstream(&self, identifier: &VStreamIdentifier, pid: u32) -> Result<()> {
        self.inner
            .tables
            .lock()
            .input_vstreams
            .release(identifier.vstream_handle, pid)
            .map(drop)
    }

    pub fn release_output_vstream(&self, identifier: &VStreamIdentifier, pid: u32) -> Result<()> {
        self.inner
            .tables
            .lock()
            .output_vstreams
            .release(identifier.vstream_handle, pid)
            .map(drop)
    }

    pub fn vstream_count(&self) -> usize {
        let tables = self.inner.tables.lock();
        tables.input_vstreams.len() + tables.output_vstreams.len()
    }
}

fn check_vstream_owner<V>(entry: &RegisteredVStream<V>, identifier: &VStreamIdentifier) -> Result<()> {
    if entry.matches(identifier) {
        Ok(())
    } else {
        Err(AccelError::NotFound(format!(
            "vstream {} does not belong to network group {}",
            identifier.vstream_handle, identifier.network_group_handle
        )))
    }
}
