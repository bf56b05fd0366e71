//! One thread per physical resource.
//!
//! The executor thread is the only code that ever touches a resource's
//! device object. Commands wait in a bounded queue and run strictly in the
//! order they were enqueued.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, select};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::bus::{EventBus, EventKind, StateEvent};
use crate::command::{Command, CommandQueue, ExecutionResult, Pending};
use crate::config::{Framing, PinConfig, PwmConfig, SerialConfig, Tuning};
use crate::debounce::StateCache;
use crate::error::{AppError, DeviceFault};
use crate::frame;
use crate::hardware::{HardwareBackend, PinDevice, PwmDevice, SerialDevice};
use crate::resource::{Operation, Outcome, ResourceId, Value};

/// What an executor drives, with the configuration needed to open it.
#[derive(Debug, Clone)]
pub enum Target {
    Pin(u32, PinConfig),
    Serial(String, SerialConfig),
    Pwm(String, PwmConfig),
}

pub struct ExecutorContext {
    pub id: ResourceId,
    pub target: Target,
    pub tuning: Tuning,
    pub degrade_after: u32,
    pub backend: Arc<dyn HardwareBackend>,
    pub cache: Arc<StateCache>,
    pub bus: Arc<EventBus>,
}

#[derive(Default)]
struct Health {
    degraded: AtomicBool,
    consecutive_failures: AtomicU32,
}

/// Submission side of an executor, shared by the registry and leases.
pub struct ExecutorHandle {
    id: ResourceId,
    queue: Arc<CommandQueue>,
    stop: Sender<Instant>,
    /// Disconnects once the executor thread is gone, panics included.
    done: Receiver<()>,
    health: Arc<Health>,
    bus: Arc<EventBus>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutorHandle {
    pub fn spawn(ctx: ExecutorContext) -> Result<Arc<Self>, AppError> {
        let (queue, doorbell) = CommandQueue::new(ctx.id.clone(), ctx.tuning.queue_capacity);
        let (stop, stop_rx) = crossbeam_channel::bounded(1);
        let (done_tx, done) = crossbeam_channel::bounded(0);
        let health = Arc::new(Health::default());

        let id = ctx.id.clone();
        let bus = ctx.bus.clone();
        let executor = Executor {
            id: ctx.id,
            target: ctx.target,
            tuning: ctx.tuning,
            degrade_after: ctx.degrade_after,
            backend: ctx.backend,
            cache: ctx.cache,
            bus: ctx.bus,
            device: None,
            queue: queue.clone(),
            doorbell,
            stop: stop_rx,
            health: health.clone(),
            _done: done_tx,
        };

        let thread = std::thread::Builder::new()
            .name(format!("exec:{id}"))
            .spawn(move || executor.run())
            .map_err(|e| DeviceFault::Io(format!("spawn executor for {id}: {e}")))?;

        Ok(Arc::new(Self {
            id,
            queue,
            stop,
            done,
            health,
            bus,
            thread: Mutex::new(Some(thread)),
        }))
    }

    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    /// Non-blocking enqueue; a full queue is reported as `Overloaded`.
    pub fn enqueue(&self, operation: Operation) -> Result<Pending, AppError> {
        self.queue.push(operation)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_degraded(&self) -> bool {
        self.health.degraded.load(Ordering::Acquire)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.health.consecutive_failures.load(Ordering::Acquire)
    }

    /// Clears the degraded flag. Returns whether it was set.
    pub fn reset(&self) -> bool {
        self.health.consecutive_failures.store(0, Ordering::Release);
        let was_degraded = self.health.degraded.swap(false, Ordering::AcqRel);
        if was_degraded {
            info!("{}: degraded flag reset", self.id);
            self.bus
                .publish(StateEvent::new(self.id.clone(), EventKind::Recovered));
        }
        was_degraded
    }

    /// Whether the executor thread has finished, normally or not.
    pub fn has_exited(&self) -> bool {
        matches!(self.done.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Stops accepting commands; queued commands run until `deadline`.
    pub fn stop(&self, deadline: Instant) {
        self.queue.close();
        let _ = self.stop.try_send(deadline);
    }

    /// Waits for the executor thread until `deadline`.
    ///
    /// If the thread is still inside a device call by then, every command
    /// left in the queue fails with `ShutdownInProgress` and the thread is
    /// left to finish on its own. Returns whether the thread was joined.
    pub fn join_until(&self, deadline: Instant) -> bool {
        match self.done.recv_deadline(deadline) {
            Err(RecvTimeoutError::Timeout) => {
                self.queue.close();
                let stranded = self.queue.take_all();
                warn!(
                    "{}: executor still busy at the drain deadline, failing {} queued commands",
                    self.id,
                    stranded.len()
                );
                for command in stranded {
                    command.abandon(AppError::ShutdownInProgress);
                }
                false
            }
            _ => {
                self.join();
                true
            }
        }
    }

    fn join(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!("{}: executor thread panicked", self.id);
        }
    }
}

enum Device {
    Pin(Box<dyn PinDevice>),
    Serial(Box<dyn SerialDevice>),
    Pwm(Box<dyn PwmDevice>),
}

enum Event {
    Command(Command),
    Wake,
    Stop(Instant),
    Idle,
}

struct Executor {
    id: ResourceId,
    target: Target,
    tuning: Tuning,
    degrade_after: u32,
    backend: Arc<dyn HardwareBackend>,
    cache: Arc<StateCache>,
    bus: Arc<EventBus>,
    device: Option<Device>,
    queue: Arc<CommandQueue>,
    doorbell: Receiver<()>,
    stop: Receiver<Instant>,
    health: Arc<Health>,
    _done: Sender<()>,
}

impl Executor {
    fn run(mut self) {
        info!("{}: executor started", self.id);

        let deadline = loop {
            match self.next_event() {
                Event::Command(command) => self.process(command),
                Event::Wake => {}
                Event::Idle => self.sample(),
                Event::Stop(deadline) => break deadline,
            }
        };

        self.drain(deadline);
        info!("{}: executor stopped", self.id);
    }

    fn next_event(&self) -> Event {
        // Queued commands past this point belong to the drain.
        if let Ok(deadline) = self.stop.try_recv() {
            return Event::Stop(deadline);
        }
        if let Some(command) = self.queue.pop() {
            return Event::Command(command);
        }

        // A disconnected stop channel means the handle is gone.
        match self.tuning.poll_interval() {
            Some(idle) => select! {
                recv(self.doorbell) -> _ => Event::Wake,
                recv(self.stop) -> msg => Event::Stop(msg.unwrap_or_else(|_| Instant::now())),
                default(idle) => Event::Idle,
            },
            None => select! {
                recv(self.doorbell) -> _ => Event::Wake,
                recv(self.stop) -> msg => Event::Stop(msg.unwrap_or_else(|_| Instant::now())),
            },
        }
    }

    fn drain(&mut self, deadline: Instant) {
        self.queue.close();
        let mut expired = 0usize;
        while let Some(command) = self.queue.pop() {
            if Instant::now() < deadline {
                self.process(command);
            } else {
                expired += 1;
                command.abandon(AppError::ShutdownInProgress);
            }
        }
        if expired > 0 {
            warn!(
                "{}: {expired} commands still queued past the drain deadline",
                self.id
            );
        }
    }

    fn process(&mut self, command: Command) {
        if !command.begin() {
            debug!("{}: skipping cancelled command #{}", self.id, command.seq());
            command.complete(Err(AppError::Cancelled));
            return;
        }

        debug!(
            "{}: {} #{} after {:?} in queue",
            self.id,
            command.operation().name(),
            command.seq(),
            command.submitted_at().elapsed()
        );

        let result = self.execute(command.operation());
        self.record(&result);
        if let Ok(Outcome::Value(value)) = &result {
            self.forward(value.clone());
        }
        command.complete(result);
    }

    /// Samples inputs while no commands arrive.
    fn sample(&mut self) {
        if self.health.degraded.load(Ordering::Acquire) {
            return;
        }

        let operation = match (&self.target, &self.device) {
            (Target::Pin(..), Some(Device::Pin(pin))) if pin.settings().state.is_input() => {
                Operation::ReadPin
            }
            (Target::Serial(_, serial), _) if serial.framing == Framing::Controller => {
                Operation::ReadFrame
            }
            _ => return,
        };

        let result = self.execute(&operation);
        if let Err(AppError::HardwareFailure(DeviceFault::TimedOut(_))) = &result {
            // Nothing arrived while idle. Partial frames surface as protocol errors.
            return;
        }
        self.record(&result);
        if let Ok(Outcome::Value(value)) = result {
            self.forward(value);
        }
    }

    fn forward(&self, value: Value) {
        self.cache.observe(
            &self.id,
            value,
            self.tuning.debounce(),
            self.tuning.hysteresis,
            Instant::now(),
        );
    }

    fn execute(&mut self, operation: &Operation) -> ExecutionResult {
        let started = Instant::now();
        let result = self.call_device(operation);

        let elapsed = started.elapsed();
        if elapsed > self.tuning.call_timeout() {
            warn!(
                "{}: {} took {elapsed:?}, limit is {:?}",
                self.id,
                operation.name(),
                self.tuning.call_timeout()
            );
        }

        if let Err(DeviceFault::Disconnected(_)) = &result {
            // Reopen on the next command.
            self.device = None;
        }
        result.map_err(AppError::from)
    }

    fn call_device(&mut self, operation: &Operation) -> Result<Outcome, DeviceFault> {
        let id = self.id.clone();
        let servo = match &self.target {
            Target::Pwm(_, pwm) => pwm.servo,
            _ => None,
        };
        let device = self.device()?;

        match (device, operation) {
            (Device::Pin(pin), Operation::ReadPin) => {
                pin.read_pin().map(|v| Outcome::Value(Value::Digital(v)))
            }
            (Device::Pin(pin), Operation::WritePin(value)) => {
                pin.write_pin(*value).map(|_| Outcome::Ack)
            }
            (Device::Pin(pin), Operation::ConfigurePin(settings)) => {
                pin.configure_pin(settings).map(|_| Outcome::Ack)
            }
            (Device::Serial(port), Operation::ReadSerial { max_len }) => {
                let mut buf = vec![0u8; *max_len];
                let n = match port.read_serial(&mut buf) {
                    Ok(n) => n,
                    Err(DeviceFault::TimedOut(_)) => 0,
                    Err(e) => return Err(e),
                };
                buf.truncate(n);
                Ok(Outcome::Value(Value::Bytes(buf)))
            }
            (Device::Serial(port), Operation::WriteSerial(data)) => {
                let mut written = 0;
                while written < data.len() {
                    match port.write_serial(&data[written..])? {
                        0 => {
                            return Err(DeviceFault::TimedOut(format!(
                                "wrote {written} of {} bytes",
                                data.len()
                            )));
                        }
                        n => written += n,
                    }
                }
                Ok(Outcome::Ack)
            }
            (Device::Serial(port), Operation::ConfigureSerial(settings)) => {
                port.configure_serial(settings).map(|_| Outcome::Ack)
            }
            (Device::Serial(port), Operation::ReadFrame) => {
                frame::read_controller_frame(port.as_mut())
                    .map(|channels| Outcome::Value(Value::Channels(channels)))
            }
            (Device::Pwm(pwm), Operation::ReadPwm) => {
                pwm.read_duty().map(|duty| Outcome::Value(Value::Analog(duty)))
            }
            (Device::Pwm(pwm), Operation::WritePwm { duty }) => {
                pwm.write_duty(*duty).map(|_| Outcome::Ack)
            }
            (Device::Pwm(pwm), Operation::ConfigurePwm(settings)) => {
                pwm.configure_pwm(settings).map(|_| Outcome::Ack)
            }
            (Device::Pwm(pwm), Operation::WriteServo { angle }) => {
                let Some(servo) = servo else {
                    return Err(DeviceFault::Unsupported(format!("{id} drives no servo")));
                };
                let duty = servo.duty_for(*angle, pwm.settings().frequency_hz);
                pwm.write_duty(duty).map(|_| Outcome::Ack)
            }
            (_, operation) => Err(DeviceFault::Unsupported(format!(
                "{} on {id}",
                operation.name()
            ))),
        }
    }

    fn device(&mut self) -> Result<&mut Device, DeviceFault> {
        if self.device.is_none() {
            let timeout = self.tuning.call_timeout();
            let device = match &self.target {
                Target::Pin(pin_id, pin) => {
                    Device::Pin(self.backend.open_pin(*pin_id, pin, timeout)?)
                }
                Target::Serial(name, serial) => {
                    Device::Serial(self.backend.open_serial(name, serial, timeout)?)
                }
                Target::Pwm(name, pwm) => Device::Pwm(self.backend.open_pwm(name, pwm, timeout)?),
            };
            info!("{}: device opened", self.id);
            self.device = Some(device);
        }

        self.device
            .as_mut()
            .ok_or_else(|| DeviceFault::Disconnected(format!("{} is not open", self.id)))
    }

    fn record(&self, result: &ExecutionResult) {
        match result {
            Ok(_) => {
                self.health.consecutive_failures.store(0, Ordering::Release);
                if self.health.degraded.swap(false, Ordering::AcqRel) {
                    info!("{}: recovered", self.id);
                    self.bus
                        .publish(StateEvent::new(self.id.clone(), EventKind::Recovered));
                }
            }
            Err(AppError::HardwareFailure(fault)) if fault.is_device_fault() => {
                let failures = self
                    .health
                    .consecutive_failures
                    .fetch_add(1, Ordering::AcqRel)
                    + 1;
                warn!("{}: hardware failure #{failures}: {fault}", self.id);

                if failures >= self.degrade_after
                    && !self.health.degraded.swap(true, Ordering::AcqRel)
                {
                    warn!("{}: marked degraded after {failures} failures", self.id);
                    self.bus.publish(StateEvent::new(
                        self.id.clone(),
                        EventKind::Degraded { failures },
                    ));
                }
            }
            Err(e) => debug!("{}: command failed: {e}", self.id),
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // Also reached when a device call panics: nothing queued may hang.
        self.queue.close();
        for command in self.queue.take_all() {
            command.abandon(AppError::ShutdownInProgress);
        }
    }
}
