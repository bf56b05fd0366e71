//! Fan-out of state changes to independent subscribers.
//!
//! Every subscription owns a coalescing slot holding at most one pending
//! event per resource. Publishing replaces a stale pending event instead of
//! queueing behind it, so a stalled subscriber costs bounded memory and never
//! holds up the publisher or other subscribers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tokio::sync::Notify;

use crate::resource::{ResourceId, Value};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum EventKind {
    Changed { value: Value },
    Degraded { failures: u32 },
    Recovered,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateEvent {
    pub resource: ResourceId,
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp_ms: u64,
}

impl StateEvent {
    pub fn new(resource: ResourceId, kind: EventKind) -> Self {
        Self {
            resource,
            kind,
            timestamp_ms: epoch_millis(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Interest {
    All,
    Only(FxHashSet<ResourceId>),
}

impl Interest {
    pub fn one(id: ResourceId) -> Self {
        Interest::Only(std::iter::once(id).collect())
    }

    fn accepts(&self, id: &ResourceId) -> bool {
        match self {
            Interest::All => true,
            Interest::Only(ids) => ids.contains(id),
        }
    }
}

#[derive(Default)]
struct SlotState {
    pending: Vec<StateEvent>,
    coalesced: u64,
    closed: bool,
}

struct Slot {
    id: u64,
    interest: Interest,
    state: Mutex<SlotState>,
    ready: Condvar,
    notify: Notify,
}

impl Slot {
    fn deliver(&self, event: &StateEvent) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            match state
                .pending
                .iter_mut()
                .find(|pending| pending.resource == event.resource)
            {
                Some(stale) => {
                    *stale = event.clone();
                    state.coalesced += 1;
                }
                None => state.pending.push(event.clone()),
            }
        }
        self.ready.notify_one();
        self.notify.notify_one();
    }

    fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.pending.clear();
        }
        self.ready.notify_all();
        self.notify.notify_one();
    }
}

pub struct EventBus {
    next_id: AtomicU64,
    subscribers: RwLock<FxHashMap<u64, Arc<Slot>>>,
    history: FxHashMap<ResourceId, RwLock<VecDeque<StateEvent>>>,
    history_capacity: usize,
}

impl EventBus {
    pub fn new(resources: impl IntoIterator<Item = ResourceId>, history_capacity: usize) -> Self {
        let history = resources
            .into_iter()
            .map(|id| (id, RwLock::new(VecDeque::new())))
            .collect();

        Self {
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(FxHashMap::default()),
            history,
            history_capacity,
        }
    }

    pub fn subscribe(self: &Arc<Self>, interest: Interest) -> Subscription {
        let slot = Arc::new(Slot {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            interest,
            state: Mutex::new(SlotState::default()),
            ready: Condvar::new(),
            notify: Notify::new(),
        });
        self.subscribers.write().insert(slot.id, slot.clone());

        Subscription {
            slot,
            bus: Arc::downgrade(self),
        }
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.remove(subscription.slot.id);
    }

    fn remove(&self, id: u64) {
        let removed = self.subscribers.write().remove(&id);
        if let Some(slot) = removed {
            slot.close();
        }
    }

    pub fn publish(&self, event: StateEvent) {
        if let Some(history_lock) = self.history.get(&event.resource) {
            let mut history = history_lock.write();
            while history.len() >= self.history_capacity.max(1) {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        let subscribers = self.subscribers.read();
        for slot in subscribers.values() {
            if slot.interest.accepts(&event.resource) {
                slot.deliver(&event);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Most recent events for a resource, oldest first.
    pub fn history(&self, id: &ResourceId, limit: Option<usize>) -> Vec<StateEvent> {
        self.history
            .get(id)
            .map(|d| {
                let d = d.read();
                let skip = limit.map(|lim| d.len().saturating_sub(lim)).unwrap_or(0);
                d.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn last_event(&self, id: &ResourceId) -> Option<StateEvent> {
        self.history.get(id).and_then(|d| d.read().back().cloned())
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        for slot in self.subscribers.get_mut().values() {
            slot.close();
        }
    }
}

/// Caller-owned registration; dropping it unsubscribes.
pub struct Subscription {
    slot: Arc<Slot>,
    bus: Weak<EventBus>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.slot.id
    }

    pub fn is_closed(&self) -> bool {
        self.slot.state.lock().closed
    }

    /// Number of events replaced before this subscriber picked them up.
    pub fn coalesced(&self) -> u64 {
        self.slot.state.lock().coalesced
    }

    pub fn try_recv(&self) -> Option<StateEvent> {
        let mut state = self.slot.state.lock();
        take_next(&mut state)
    }

    /// Blocks until an event arrives, the timeout elapses or the
    /// subscription is closed.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<StateEvent> {
        let deadline = Instant::now() + timeout;
        let mut state = self.slot.state.lock();
        loop {
            if let Some(event) = take_next(&mut state) {
                return Some(event);
            }
            if state.closed {
                return None;
            }
            if self.slot.ready.wait_until(&mut state, deadline).timed_out() {
                return take_next(&mut state);
            }
        }
    }

    /// Resolves to `None` once the subscription is closed.
    pub async fn recv(&self) -> Option<StateEvent> {
        loop {
            let notified = self.slot.notify.notified();
            {
                let mut state = self.slot.state.lock();
                if let Some(event) = take_next(&mut state) {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        match self.bus.upgrade() {
            Some(bus) => bus.remove(self.slot.id),
            None => self.slot.close(),
        }
    }
}

fn take_next(state: &mut SlotState) -> Option<StateEvent> {
    if state.closed || state.pending.is_empty() {
        None
    } else {
        Some(state.pending.remove(0))
    }
}

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
