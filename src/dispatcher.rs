use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::bus::{EventBus, Interest, StateEvent, Subscription};
use crate::command::{ExecutionResult, Pending};
use crate::config::{AppConfig, Framing};
use crate::debounce::{CachedState, SettleTimer, StateCache};
use crate::error::AppError;
use crate::executor::{ExecutorContext, ExecutorHandle, Target};
use crate::hardware::HardwareBackend;
use crate::registry::Registry;
use crate::resource::{AccessMode, GpioState, Operation, ResourceId};

#[derive(Debug, Clone, Serialize)]
pub struct ResourceStatus {
    pub resource: ResourceId,
    pub name: String,
    pub active: bool,
    pub degraded: bool,
    pub consecutive_failures: u32,
    pub queued: usize,
    pub leases: Vec<AccessMode>,
    pub state: Option<CachedState>,
}

struct Shared {
    config: Arc<AppConfig>,
    backend: Arc<dyn HardwareBackend>,
    registry: Registry,
    cache: Arc<StateCache>,
    bus: Arc<EventBus>,
}

impl Shared {
    fn spawn(&self, id: &ResourceId) -> Result<Arc<ExecutorHandle>, AppError> {
        let target = match id {
            ResourceId::Pin(pin_id) => Target::Pin(*pin_id, self.config.pin(*pin_id)?.clone()),
            ResourceId::Serial(name) => {
                Target::Serial(name.clone(), self.config.serial(name)?.clone())
            }
            ResourceId::Pwm(name) => Target::Pwm(name.clone(), self.config.pwm(name)?.clone()),
        };

        debug!("{id}: spawning executor");
        ExecutorHandle::spawn(ExecutorContext {
            id: id.clone(),
            target,
            tuning: self.config.tuning_for(id)?,
            degrade_after: self.config.dispatcher.degrade_after,
            backend: self.backend.clone(),
            cache: self.cache.clone(),
            bus: self.bus.clone(),
        })
    }

    fn validate(&self, id: &ResourceId, operation: &Operation) -> Result<(), AppError> {
        if !self.config.contains(id) {
            return Err(AppError::NotFound(id.to_string()));
        }
        if !operation.targets(id) {
            return Err(AppError::InvalidValue(format!(
                "{} is not valid for {id}",
                operation.name()
            )));
        }

        match (id, operation) {
            (_, Operation::WritePin(value)) if *value > 1 => {
                Err(AppError::InvalidValue("Value must be 0 or 1".into()))
            }
            (ResourceId::Pin(pin_id), Operation::ConfigurePin(settings)) => {
                let caps = &self.config.pin(*pin_id)?.capabilities;
                if capability_matches(settings.state, caps) {
                    Ok(())
                } else {
                    Err(AppError::InvalidState(format!(
                        "State not supported by pin {pin_id}"
                    )))
                }
            }
            (_, Operation::ReadSerial { max_len: 0 }) => {
                Err(AppError::InvalidValue("max_len must be > 0".into()))
            }
            (_, Operation::ReadSerial { max_len }) => {
                let limit = self.config.tuning_for(id)?.max_read_len;
                if *max_len > limit {
                    Err(AppError::InvalidValue(format!(
                        "max_len must be <= {limit} for {id}"
                    )))
                } else {
                    Ok(())
                }
            }
            (_, Operation::WriteSerial(data)) if data.is_empty() => {
                Err(AppError::InvalidValue("Empty serial payload".into()))
            }
            (_, Operation::ConfigureSerial(settings)) if settings.baud_rate == 0 => {
                Err(AppError::InvalidValue("baud_rate must be > 0".into()))
            }
            (ResourceId::Serial(name), Operation::ReadFrame) => {
                if self.config.serial(name)?.framing == Framing::Controller {
                    Ok(())
                } else {
                    Err(AppError::InvalidState(format!(
                        "serial {name} has no frame decoder"
                    )))
                }
            }
            (_, Operation::WritePwm { duty }) if !(0.0..=1.0).contains(duty) => Err(
                AppError::InvalidValue("Duty cycle must be between 0 and 1".into()),
            ),
            (ResourceId::Pwm(name), Operation::ConfigurePwm(settings)) => {
                if settings.frequency_hz == 0 {
                    return Err(AppError::InvalidValue("frequency_hz must be > 0".into()));
                }
                match &self.config.pwm(name)?.servo {
                    Some(servo) if !servo.fits(settings.frequency_hz) => {
                        Err(AppError::InvalidValue(format!(
                            "servo pulse does not fit a period at {} Hz",
                            settings.frequency_hz
                        )))
                    }
                    _ => Ok(()),
                }
            }
            (ResourceId::Pwm(name), Operation::WriteServo { angle }) => {
                match &self.config.pwm(name)?.servo {
                    Some(servo) if servo.contains_angle(*angle) => Ok(()),
                    Some(servo) => Err(AppError::InvalidValue(format!(
                        "Angle must be between {} and {}",
                        servo.min_angle, servo.max_angle
                    ))),
                    None => Err(AppError::InvalidState(format!("pwm {name} drives no servo"))),
                }
            }
            _ => Ok(()),
        }
    }

    fn enqueue(
        &self,
        handle: &ExecutorHandle,
        operation: Operation,
    ) -> Result<Pending, AppError> {
        if handle.is_degraded() && !operation.is_configure() {
            return Err(AppError::ResourceDegraded(format!(
                "{} after {} consecutive failures",
                handle.id(),
                handle.consecutive_failures()
            )));
        }
        handle.enqueue(operation)
    }

    /// Drains and joins a released executor. Its binding stays closing, and
    /// so refuses new work, until the thread is gone.
    fn teardown(&self, handle: &Arc<ExecutorHandle>) {
        let deadline = Instant::now() + self.config.dispatcher.shutdown_deadline();
        handle.stop(deadline);
        if handle.join_until(deadline) {
            self.registry.unbind(handle.id(), handle);
            info!("{}: released", handle.id());
        } else {
            warn!("{}: released while a device call is still running", handle.id());
        }
    }
}

fn capability_matches(state: GpioState, caps: &HashSet<GpioState>) -> bool {
    match state {
        GpioState::Error => false,
        GpioState::Disabled => true,
        _ => caps.contains(&state),
    }
}

/// Entry point for request handlers.
pub struct Dispatcher {
    shared: Arc<Shared>,
    accepting: AtomicBool,
    timer: Mutex<Option<SettleTimer>>,
}

impl Dispatcher {
    pub fn new(config: Arc<AppConfig>, backend: Arc<dyn HardwareBackend>) -> Result<Self, AppError> {
        let bus = Arc::new(EventBus::new(
            config.resource_ids(),
            config.dispatcher.event_history_capacity,
        ));
        let cache = Arc::new(StateCache::new(bus.clone()));
        let timer = cache
            .start_timer()
            .map_err(|e| AppError::Config(format!("Failed to start debounce timer: {e}")))?;

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                backend,
                registry: Registry::new(),
                cache,
                bus,
            }),
            accepting: AtomicBool::new(true),
            timer: Mutex::new(Some(timer)),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.shared.config
    }

    fn ensure_accepting(&self) -> Result<(), AppError> {
        if self.accepting.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(AppError::ShutdownInProgress)
        }
    }

    fn ensure_known(&self, id: &ResourceId) -> Result<(), AppError> {
        if self.shared.config.contains(id) {
            Ok(())
        } else {
            Err(AppError::NotFound(id.to_string()))
        }
    }

    pub fn acquire(&self, id: &ResourceId, mode: AccessMode) -> Result<Lease, AppError> {
        self.ensure_accepting()?;
        self.ensure_known(id)?;

        let shared = &self.shared;
        let (lease_id, _) = shared.registry.acquire(id, mode, || shared.spawn(id))?;
        debug!("{id}: lease #{lease_id} acquired in {mode:?} mode");

        Ok(Lease {
            id: id.clone(),
            mode,
            lease_id,
            shared: shared.clone(),
            released: AtomicBool::new(false),
        })
    }

    /// Queues `operation` and returns without waiting for the hardware.
    pub fn submit(&self, id: &ResourceId, operation: Operation) -> Result<Pending, AppError> {
        self.ensure_accepting()?;
        let shared = &self.shared;
        shared.validate(id, &operation)?;

        let mode = operation.access_mode();
        let handle = shared.registry.resolve(id, mode, || shared.spawn(id))?;
        match shared.enqueue(&handle, operation.clone()) {
            // The last lease was released between lookup and enqueue.
            Err(AppError::ShutdownInProgress) if !shared.registry.is_closed() => {
                let handle = shared.registry.resolve(id, mode, || shared.spawn(id))?;
                shared.enqueue(&handle, operation)
            }
            result => result,
        }
    }

    pub fn execute(
        &self,
        id: &ResourceId,
        operation: Operation,
        timeout: Duration,
    ) -> ExecutionResult {
        self.submit(id, operation)?.wait(timeout)
    }

    pub fn current_value(&self, id: &ResourceId) -> Result<CachedState, AppError> {
        self.ensure_known(id)?;
        self.shared
            .cache
            .snapshot(id)
            .ok_or_else(|| AppError::NotFound(format!("no state observed for {id}")))
    }

    pub fn subscribe(&self, interest: Interest) -> Result<Subscription, AppError> {
        if let Interest::Only(ids) = &interest {
            for id in ids {
                self.ensure_known(id)?;
            }
        }
        Ok(self.shared.bus.subscribe(interest))
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.shared.bus.unsubscribe(&subscription);
    }

    /// Clears the degraded flag of a resource.
    pub fn reset(&self, id: &ResourceId) -> Result<bool, AppError> {
        self.ensure_known(id)?;
        Ok(self
            .shared
            .registry
            .get(id)
            .map(|handle| handle.reset())
            .unwrap_or(false))
    }

    pub fn status(&self, id: &ResourceId) -> Result<ResourceStatus, AppError> {
        let name = match id {
            ResourceId::Pin(pin_id) => self.shared.config.pin(*pin_id)?.name.clone(),
            ResourceId::Serial(name) => self.shared.config.serial(name).map(|_| name.clone())?,
            ResourceId::Pwm(name) => self.shared.config.pwm(name)?.name.clone(),
        };
        let handle = self.shared.registry.get(id);

        Ok(ResourceStatus {
            resource: id.clone(),
            name,
            active: handle.is_some(),
            degraded: handle.as_ref().is_some_and(|h| h.is_degraded()),
            consecutive_failures: handle.as_ref().map_or(0, |h| h.consecutive_failures()),
            queued: handle.as_ref().map_or(0, |h| h.queued()),
            leases: self.shared.registry.lease_modes(id),
            state: self.shared.cache.snapshot(id),
        })
    }

    pub fn list_resources(&self) -> Vec<ResourceStatus> {
        self.shared
            .config
            .resource_ids()
            .iter()
            .filter_map(|id| self.status(id).ok())
            .collect()
    }

    pub fn events(&self, id: &ResourceId, limit: Option<usize>) -> Result<Vec<StateEvent>, AppError> {
        self.ensure_known(id)?;
        Ok(self.shared.bus.history(id, limit))
    }

    pub fn last_event(&self, id: &ResourceId) -> Result<Option<StateEvent>, AppError> {
        self.ensure_known(id)?;
        Ok(self.shared.bus.last_event(id))
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Stops accepting commands and drains every executor within the
    /// configured deadline.
    pub fn shutdown(&self) {
        self.shutdown_within(self.shared.config.dispatcher.shutdown_deadline());
    }

    pub fn shutdown_within(&self, grace: Duration) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down, draining executors for up to {grace:?}");

        let deadline = Instant::now() + grace;
        let handles = self.shared.registry.close();
        for handle in &handles {
            handle.stop(deadline);
        }
        let stuck = handles
            .iter()
            .filter(|handle| !handle.join_until(deadline))
            .count();
        if stuck > 0 {
            warn!("{stuck} executors still inside a device call at the deadline");
        }

        if let Some(mut timer) = self.timer.lock().take() {
            timer.stop();
        }
        info!("Shutdown complete, {} executors stopped", handles.len());
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Explicit hold on a resource. Released on drop.
pub struct Lease {
    id: ResourceId,
    mode: AccessMode,
    lease_id: u64,
    shared: Arc<Shared>,
    released: AtomicBool,
}

impl Lease {
    pub fn resource(&self) -> &ResourceId {
        &self.id
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Submits through this lease's own binding; the shared resolve path is skipped.
    pub fn submit(&self, operation: Operation) -> Result<Pending, AppError> {
        if self.released.load(Ordering::Acquire) {
            return Err(AppError::InvalidState(format!(
                "lease #{} on {} was released",
                self.lease_id, self.id
            )));
        }
        if self.mode == AccessMode::Read && operation.access_mode() != AccessMode::Read {
            return Err(AppError::InvalidState(format!(
                "{} needs a write lease on {}",
                operation.name(),
                self.id
            )));
        }
        let shared = &self.shared;
        shared.validate(&self.id, &operation)?;
        let handle = shared
            .registry
            .leased(&self.id, self.lease_id, || shared.spawn(&self.id))?;
        shared.enqueue(&handle, operation)
    }

    /// Idempotent. Releasing the last lease tears the executor down after
    /// it drains its queue.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("{}: lease #{} released", self.id, self.lease_id);
        if let Some(handle) = self.shared.registry.release(&self.id, self.lease_id) {
            self.shared.teardown(&handle);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release();
    }
}
