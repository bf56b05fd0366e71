//! Debounced per-resource state.
//!
//! A raw sample that differs from the previous raw sample (re)starts the
//! settle window of its resource. When the window elapses without another
//! raw change the sample is published, unless it equals the published value
//! or, for numeric values, lies within the hysteresis band around it.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::bus::{EventBus, EventKind, StateEvent, epoch_millis};
use crate::resource::{ResourceId, Value};

/// Snapshot of a resource's cached state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedState {
    pub resource: ResourceId,
    pub value: Option<Value>,
    pub raw: Option<Value>,
    pub raw_changed_ms: Option<u64>,
    pub published_ms: Option<u64>,
    pub settling: bool,
}

#[derive(Default)]
struct Entry {
    published: Option<Value>,
    published_ms: Option<u64>,
    raw: Option<Value>,
    raw_changed_ms: Option<u64>,
    deadline: Option<Instant>,
    hysteresis: f64,
}

impl Entry {
    fn settle(&mut self, id: &ResourceId) -> Option<StateEvent> {
        self.deadline = None;
        let candidate = self.raw.clone()?;

        if let Some(published) = &self.published {
            if *published == candidate {
                return None;
            }
            if let Some(delta) = candidate.delta(published)
                && delta <= self.hysteresis
            {
                debug!("{id}: change of {delta} within hysteresis {}", self.hysteresis);
                return None;
            }
        }

        self.published = Some(candidate.clone());
        self.published_ms = Some(epoch_millis());
        Some(StateEvent::new(
            id.clone(),
            EventKind::Changed { value: candidate },
        ))
    }
}

#[derive(Default)]
struct TimerState {
    stopped: bool,
}

pub struct StateCache {
    entries: RwLock<FxHashMap<ResourceId, Mutex<Entry>>>,
    bus: Arc<EventBus>,
    timer: Mutex<TimerState>,
    wake: Condvar,
}

impl StateCache {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            bus,
            timer: Mutex::new(TimerState::default()),
            wake: Condvar::new(),
        }
    }

    /// Feeds a raw sample taken at `at`. Returns the event published by
    /// this call, which only happens for a zero settle window.
    pub fn observe(
        &self,
        id: &ResourceId,
        value: Value,
        window: Duration,
        hysteresis: f64,
        at: Instant,
    ) -> Option<StateEvent> {
        if !value.is_state() {
            return None;
        }

        let (published, armed) = self.with_entry(id, |entry| {
            entry.hysteresis = hysteresis;

            let mut armed = false;
            if entry.raw.as_ref() != Some(&value) {
                entry.raw = Some(value);
                entry.raw_changed_ms = Some(epoch_millis());
                entry.deadline = Some(at + window);
                armed = true;
            }

            match entry.deadline {
                Some(deadline) if deadline <= at => (entry.settle(id), false),
                _ => (None, armed),
            }
        });

        if armed {
            let _guard = self.timer.lock();
            self.wake.notify_all();
        }
        if let Some(event) = &published {
            self.bus.publish(event.clone());
        }
        published
    }

    /// Publishes every pending sample whose settle window has elapsed by `now`.
    pub fn settle_due(&self, now: Instant) -> Vec<StateEvent> {
        let events: Vec<StateEvent> = {
            let entries = self.entries.read();
            entries
                .iter()
                .filter_map(|(id, entry)| {
                    let mut entry = entry.lock();
                    match entry.deadline {
                        Some(deadline) if deadline <= now => entry.settle(id),
                        _ => None,
                    }
                })
                .collect()
        };

        for event in &events {
            self.bus.publish(event.clone());
        }
        events
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .read()
            .values()
            .filter_map(|entry| entry.lock().deadline)
            .min()
    }

    pub fn snapshot(&self, id: &ResourceId) -> Option<CachedState> {
        let entries = self.entries.read();
        let entry = entries.get(id)?.lock();

        Some(CachedState {
            resource: id.clone(),
            value: entry.published.clone(),
            raw: entry.raw.clone(),
            raw_changed_ms: entry.raw_changed_ms,
            published_ms: entry.published_ms,
            settling: entry.deadline.is_some(),
        })
    }

    /// Spawns the thread that publishes samples once their window elapses.
    pub fn start_timer(self: &Arc<Self>) -> Result<SettleTimer, std::io::Error> {
        self.timer.lock().stopped = false;
        let cache = self.clone();

        let handle = std::thread::Builder::new()
            .name("debounce-timer".into())
            .spawn(move || {
                loop {
                    cache.settle_due(Instant::now());

                    let mut timer = cache.timer.lock();
                    if timer.stopped {
                        break;
                    }
                    match cache.next_deadline() {
                        Some(deadline) => {
                            cache.wake.wait_until(&mut timer, deadline);
                        }
                        None => cache.wake.wait(&mut timer),
                    }
                }
            })?;

        Ok(SettleTimer {
            cache: self.clone(),
            handle: Some(handle),
        })
    }

    fn with_entry<R>(&self, id: &ResourceId, f: impl FnOnce(&mut Entry) -> R) -> R {
        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(id) {
                return f(&mut entry.lock());
            }
        }
        let mut entries = self.entries.write();
        let entry = entries.entry(id.clone()).or_default();
        f(entry.get_mut())
    }
}

pub struct SettleTimer {
    cache: Arc<StateCache>,
    handle: Option<JoinHandle<()>>,
}

impl SettleTimer {
    pub fn stop(&mut self) {
        {
            let mut timer = self.cache.timer.lock();
            timer.stopped = true;
            self.cache.wake.notify_all();
        }
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("debounce timer thread panicked");
        }
    }
}

impl Drop for SettleTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
