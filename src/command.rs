//! Commands, their bounded per-resource queue and the caller-side handle.
//!
//! The queue is a plain FIFO behind a mutex so that a cancelled command can
//! be taken out of it and stop counting against the capacity. The executor
//! learns about new work through a one-slot doorbell channel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;

use crate::error::AppError;
use crate::resource::{Operation, Outcome, ResourceId};

pub type ExecutionResult = Result<Outcome, AppError>;

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;

/// A queued request against one resource. Immutable once enqueued.
pub struct Command {
    operation: Operation,
    seq: u64,
    submitted_at: Instant,
    state: Arc<AtomicU8>,
    sink: Sender<ExecutionResult>,
}

impl Command {
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    /// Claims the command for execution; fails if it was cancelled first.
    pub(crate) fn begin(&self) -> bool {
        self.state
            .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn complete(self, result: ExecutionResult) {
        // The caller may have dropped its handle.
        let _ = self.sink.try_send(result);
    }

    /// Fails a command that will never run, keeping `Cancelled` for
    /// commands the caller gave up on.
    pub(crate) fn abandon(self, reason: AppError) {
        if self.begin() {
            self.complete(Err(reason));
        } else {
            self.complete(Err(AppError::Cancelled));
        }
    }
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<Command>,
    next_seq: u64,
    closed: bool,
}

pub(crate) struct CommandQueue {
    resource: ResourceId,
    capacity: usize,
    state: Mutex<QueueState>,
    doorbell: Sender<()>,
}

impl CommandQueue {
    pub(crate) fn new(resource: ResourceId, capacity: usize) -> (Arc<Self>, Receiver<()>) {
        let (doorbell, ring) = crossbeam_channel::bounded(1);
        let queue = Arc::new(Self {
            resource,
            capacity,
            state: Mutex::new(QueueState::default()),
            doorbell,
        });
        (queue, ring)
    }

    /// Non-blocking enqueue; a full queue is reported as `Overloaded`.
    pub(crate) fn push(self: &Arc<Self>, operation: Operation) -> Result<Pending, AppError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(AppError::ShutdownInProgress);
        }
        if state.items.len() >= self.capacity {
            return Err(AppError::Overloaded(format!(
                "{} queue is full ({} commands)",
                self.resource, self.capacity
            )));
        }

        let seq = state.next_seq;
        state.next_seq += 1;

        let (sink, rx) = crossbeam_channel::bounded(1);
        let flag = Arc::new(AtomicU8::new(QUEUED));
        let pending = Pending {
            resource: self.resource.clone(),
            operation: operation.name(),
            seq,
            state: flag.clone(),
            queue: Arc::downgrade(self),
            rx,
            result: Mutex::new(None),
        };
        state.items.push_back(Command {
            operation,
            seq,
            submitted_at: Instant::now(),
            state: flag,
            sink,
        });
        drop(state);

        // A full doorbell already guarantees a wake-up.
        let _ = self.doorbell.try_send(());
        Ok(pending)
    }

    pub(crate) fn pop(&self) -> Option<Command> {
        self.state.lock().items.pop_front()
    }

    fn remove(&self, seq: u64) -> Option<Command> {
        let mut state = self.state.lock();
        let index = state.items.iter().position(|c| c.seq == seq)?;
        state.items.remove(index)
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Refuses new commands. Already queued ones stay for the drain.
    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
    }

    pub(crate) fn take_all(&self) -> Vec<Command> {
        self.state.lock().items.drain(..).collect()
    }
}

/// Caller side of a submitted command.
pub struct Pending {
    resource: ResourceId,
    operation: &'static str,
    seq: u64,
    state: Arc<AtomicU8>,
    queue: Weak<CommandQueue>,
    rx: Receiver<ExecutionResult>,
    result: Mutex<Option<ExecutionResult>>,
}

impl Pending {
    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Takes the command out of its queue if the executor has not picked it
    /// up yet. Its result then resolves to [`AppError::Cancelled`].
    pub fn cancel(&self) -> bool {
        if self
            .state
            .compare_exchange(QUEUED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        // The executor may have popped it already; it then skips it itself.
        if let Some(command) = self.queue.upgrade().and_then(|q| q.remove(self.seq)) {
            command.complete(Err(AppError::Cancelled));
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    pub fn try_result(&self) -> Option<ExecutionResult> {
        let mut result = self.result.lock();
        if result.is_none() {
            *result = match self.rx.try_recv() {
                Ok(r) => Some(r),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => Some(Err(AppError::ShutdownInProgress)),
            };
        }
        result.clone()
    }

    /// Blocks for at most `timeout`. A timeout leaves the command running.
    pub fn wait(&self, timeout: Duration) -> ExecutionResult {
        let mut result = self.result.lock();
        if let Some(r) = result.as_ref() {
            return r.clone();
        }

        let r = match self.rx.recv_timeout(timeout) {
            Ok(r) => r,
            Err(RecvTimeoutError::Timeout) => {
                return Err(AppError::Timeout(format!(
                    "{} #{} on {}",
                    self.operation, self.seq, self.resource
                )));
            }
            Err(RecvTimeoutError::Disconnected) => Err(AppError::ShutdownInProgress),
        };
        *result = Some(r.clone());
        r
    }
}
