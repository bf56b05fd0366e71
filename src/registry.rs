//! Ownership of physical resources.
//!
//! Each resource id binds to at most one executor. Callers take leases on a
//! binding in an [`AccessMode`]; the registry lock is only held while
//! bindings or leases change, never while commands run.

use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::warn;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::AppError;
use crate::executor::ExecutorHandle;
use crate::resource::{AccessMode, ResourceId};

struct Binding {
    handle: Arc<ExecutorHandle>,
    leases: FxHashMap<u64, AccessMode>,
    /// Last lease gone, executor draining. Kept until its thread is joined.
    closing: bool,
}

impl Binding {
    fn check(&self, id: &ResourceId, mode: AccessMode) -> Result<(), AppError> {
        if self.closing {
            return Err(AppError::ResourceBusy(format!("{id} is being released")));
        }
        match self.leases.values().find(|held| held.conflicts_with(mode)) {
            Some(held) => Err(AppError::ResourceBusy(format!(
                "{id} is leased in {held:?} mode, {mode:?} requested"
            ))),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct Registry {
    bindings: RwLock<FxHashMap<ResourceId, Binding>>,
    next_lease: AtomicU64,
    closed: AtomicBool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Takes a lease, spawning the executor on first use.
    pub fn acquire(
        &self,
        id: &ResourceId,
        mode: AccessMode,
        spawn: impl FnOnce() -> Result<Arc<ExecutorHandle>, AppError>,
    ) -> Result<(u64, Arc<ExecutorHandle>), AppError> {
        let mut bindings = self.bindings.write();
        if self.is_closed() {
            return Err(AppError::ShutdownInProgress);
        }

        let binding = Self::bind(&mut bindings, id, spawn)?;
        binding.check(id, mode)?;

        let lease_id = self.next_lease.fetch_add(1, Ordering::Relaxed);
        binding.leases.insert(lease_id, mode);
        Ok((lease_id, binding.handle.clone()))
    }

    /// Looks up the executor for a caller without a lease.
    pub fn resolve(
        &self,
        id: &ResourceId,
        mode: AccessMode,
        spawn: impl FnOnce() -> Result<Arc<ExecutorHandle>, AppError>,
    ) -> Result<Arc<ExecutorHandle>, AppError> {
        {
            let bindings = self.bindings.read();
            if self.is_closed() {
                return Err(AppError::ShutdownInProgress);
            }
            if let Some(binding) = bindings.get(id)
                && !binding.handle.has_exited()
            {
                binding.check(id, mode)?;
                return Ok(binding.handle.clone());
            }
        }

        let mut bindings = self.bindings.write();
        if self.is_closed() {
            return Err(AppError::ShutdownInProgress);
        }
        let binding = Self::bind(&mut bindings, id, spawn)?;
        binding.check(id, mode)?;
        Ok(binding.handle.clone())
    }

    /// Handle a lease submits through. A lease outlives an executor that
    /// died under it; the binding then gets a fresh one.
    pub fn leased(
        &self,
        id: &ResourceId,
        lease_id: u64,
        spawn: impl FnOnce() -> Result<Arc<ExecutorHandle>, AppError>,
    ) -> Result<Arc<ExecutorHandle>, AppError> {
        {
            let bindings = self.bindings.read();
            if let Some(binding) = bindings.get(id)
                && !binding.handle.has_exited()
                && binding.leases.contains_key(&lease_id)
            {
                return Ok(binding.handle.clone());
            }
        }

        let mut bindings = self.bindings.write();
        if self.is_closed() {
            return Err(AppError::ShutdownInProgress);
        }
        match bindings.get(id) {
            Some(binding) if binding.leases.contains_key(&lease_id) => {}
            _ => {
                return Err(AppError::InvalidState(format!(
                    "lease #{lease_id} on {id} was released"
                )));
            }
        }
        Ok(Self::bind(&mut bindings, id, spawn)?.handle.clone())
    }

    /// Drops a lease. When it was the last one the binding turns to closing
    /// and its executor is handed back for teardown; see [`Registry::unbind`].
    pub fn release(&self, id: &ResourceId, lease_id: u64) -> Option<Arc<ExecutorHandle>> {
        let mut bindings = self.bindings.write();
        let binding = bindings.get_mut(id)?;
        binding.leases.remove(&lease_id)?;

        if binding.leases.is_empty() && !binding.closing {
            binding.closing = true;
            Some(binding.handle.clone())
        } else {
            None
        }
    }

    /// Removes a closing binding once its executor thread has been joined.
    pub fn unbind(&self, id: &ResourceId, handle: &Arc<ExecutorHandle>) {
        let mut bindings = self.bindings.write();
        if let Some(binding) = bindings.get(id)
            && binding.closing
            && Arc::ptr_eq(&binding.handle, handle)
        {
            bindings.remove(id);
        }
    }

    pub fn get(&self, id: &ResourceId) -> Option<Arc<ExecutorHandle>> {
        self.bindings.read().get(id).map(|b| b.handle.clone())
    }

    pub fn lease_modes(&self, id: &ResourceId) -> Vec<AccessMode> {
        self.bindings
            .read()
            .get(id)
            .map(|b| b.leases.values().copied().collect())
            .unwrap_or_default()
    }

    /// Refuses further bindings and hands back every live executor.
    /// Returns nothing if the registry was already closed.
    pub fn close(&self) -> Vec<Arc<ExecutorHandle>> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        self.bindings
            .write()
            .drain()
            .map(|(_, binding)| binding.handle)
            .collect()
    }

    fn bind<'a>(
        bindings: &'a mut FxHashMap<ResourceId, Binding>,
        id: &ResourceId,
        spawn: impl FnOnce() -> Result<Arc<ExecutorHandle>, AppError>,
    ) -> Result<&'a mut Binding, AppError> {
        Ok(match bindings.entry(id.clone()) {
            Entry::Occupied(entry) => {
                let binding = entry.into_mut();
                if binding.handle.has_exited() {
                    // Leases survive a crashed executor; a finished teardown does not linger.
                    if !binding.closing {
                        warn!("{id}: executor exited unexpectedly, respawning");
                    }
                    binding.handle = spawn()?;
                    binding.closing = false;
                }
                binding
            }
            Entry::Vacant(entry) => entry.insert(Binding {
                handle: spawn()?,
                leases: FxHashMap::default(),
                closing: false,
            }),
        })
    }
}
