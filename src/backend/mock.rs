use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::{PinConfig, PwmConfig, SerialConfig};
use crate::error::DeviceFault;
use crate::hardware::{HardwareBackend, PinDevice, PwmDevice, SerialDevice};
use crate::resource::{GpioState, PinSettings, PwmSettings, ResourceId, SerialSettings};

/// In-memory hardware for tests and hardware-less builds.
///
/// Clones share state, so a test can keep one clone to drive inputs and
/// inspect outputs while the dispatcher owns another.
#[derive(Default, Clone)]
pub struct MockBackend {
    shared: Arc<MockShared>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub resource: ResourceId,
    pub call: String,
}

#[derive(Default)]
struct MockShared {
    state: Mutex<MockState>,
    gate: Mutex<GateState>,
    gate_cv: Condvar,
}

#[derive(Default)]
struct MockState {
    pins: FxHashMap<u32, MockPin>,
    serials: FxHashMap<String, MockSerial>,
    pwms: FxHashMap<String, MockPwm>,
    faults: FxHashMap<ResourceId, VecDeque<DeviceFault>>,
    disconnected: FxHashSet<ResourceId>,
    calls: Vec<MockCall>,
}

#[derive(Default, Clone)]
struct MockPin {
    settings: PinSettings,
    value: u8,
}

#[derive(Default)]
struct MockSerial {
    baud_rate: u32,
    rx: VecDeque<u8>,
    tx: Vec<u8>,
}

#[derive(Default, Clone, Copy)]
struct MockPwm {
    settings: PwmSettings,
    duty: f64,
}

#[derive(Default)]
struct GateState {
    held: FxHashSet<ResourceId>,
    waiting: FxHashSet<ResourceId>,
}

impl MockShared {
    /// Common prologue of every device call: gate, log, scripted faults.
    fn enter(&self, id: &ResourceId, call: String) -> Result<(), DeviceFault> {
        {
            let mut gate = self.gate.lock();
            while gate.held.contains(id) {
                gate.waiting.insert(id.clone());
                self.gate_cv.notify_all();
                self.gate_cv.wait(&mut gate);
            }
            if gate.waiting.remove(id) {
                self.gate_cv.notify_all();
            }
        }

        let mut state = self.state.lock();
        state.calls.push(MockCall {
            resource: id.clone(),
            call,
        });
        if state.disconnected.contains(id) {
            return Err(DeviceFault::Disconnected(format!("{id} unplugged")));
        }
        if let Some(fault) = state.faults.get_mut(id).and_then(|q| q.pop_front()) {
            return Err(fault);
        }
        Ok(())
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drives the level seen on an input pin.
    pub fn set_input(&self, pin_id: u32, value: u8) {
        let mut state = self.shared.state.lock();
        state.pins.entry(pin_id).or_default().value = value;
    }

    pub fn pin_value(&self, pin_id: u32) -> Option<u8> {
        self.shared.state.lock().pins.get(&pin_id).map(|p| p.value)
    }

    pub fn pin_settings(&self, pin_id: u32) -> Option<PinSettings> {
        self.shared.state.lock().pins.get(&pin_id).map(|p| p.settings)
    }

    pub fn push_serial_input(&self, name: &str, bytes: &[u8]) {
        let mut state = self.shared.state.lock();
        state
            .serials
            .entry(name.to_string())
            .or_default()
            .rx
            .extend(bytes);
    }

    pub fn serial_output(&self, name: &str) -> Vec<u8> {
        self.shared
            .state
            .lock()
            .serials
            .get(name)
            .map(|s| s.tx.clone())
            .unwrap_or_default()
    }

    pub fn serial_baud_rate(&self, name: &str) -> Option<u32> {
        self.shared.state.lock().serials.get(name).map(|s| s.baud_rate)
    }

    pub fn pwm_duty(&self, name: &str) -> Option<f64> {
        self.shared.state.lock().pwms.get(name).map(|p| p.duty)
    }

    pub fn pwm_settings(&self, name: &str) -> Option<PwmSettings> {
        self.shared.state.lock().pwms.get(name).map(|p| p.settings)
    }

    /// The next `count` device calls on `id` fail with `fault`.
    pub fn fail_next(&self, id: &ResourceId, fault: DeviceFault, count: usize) {
        let mut state = self.shared.state.lock();
        let queue = state.faults.entry(id.clone()).or_default();
        queue.extend(std::iter::repeat_n(fault, count));
    }

    pub fn set_disconnected(&self, id: &ResourceId, disconnected: bool) {
        let mut state = self.shared.state.lock();
        if disconnected {
            state.disconnected.insert(id.clone());
        } else {
            state.disconnected.remove(id);
        }
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.shared.state.lock().calls.clone()
    }

    pub fn calls_for(&self, id: &ResourceId) -> Vec<String> {
        self.shared
            .state
            .lock()
            .calls
            .iter()
            .filter(|c| &c.resource == id)
            .map(|c| c.call.clone())
            .collect()
    }

    /// Device calls on `id` block until [`MockBackend::release`].
    pub fn hold(&self, id: &ResourceId) {
        self.shared.gate.lock().held.insert(id.clone());
    }

    pub fn release(&self, id: &ResourceId) {
        self.shared.gate.lock().held.remove(id);
        self.shared.gate_cv.notify_all();
    }

    /// Waits until a device call on `id` is parked at the gate.
    pub fn wait_blocked(&self, id: &ResourceId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut gate = self.shared.gate.lock();
        while !gate.waiting.contains(id) {
            if self
                .shared
                .gate_cv
                .wait_until(&mut gate, deadline)
                .timed_out()
            {
                return gate.waiting.contains(id);
            }
        }
        true
    }
}

impl HardwareBackend for MockBackend {
    fn open_pin(
        &self,
        pin_id: u32,
        _pin: &PinConfig,
        _call_timeout: Duration,
    ) -> Result<Box<dyn PinDevice>, DeviceFault> {
        let id = ResourceId::Pin(pin_id);
        self.shared.enter(&id, "open".into())?;
        self.shared.state.lock().pins.entry(pin_id).or_default();

        Ok(Box::new(MockPinDevice {
            pin_id,
            id,
            shared: self.shared.clone(),
        }))
    }

    fn open_serial(
        &self,
        name: &str,
        serial: &SerialConfig,
        _call_timeout: Duration,
    ) -> Result<Box<dyn SerialDevice>, DeviceFault> {
        let id = ResourceId::Serial(name.to_string());
        self.shared.enter(&id, "open".into())?;
        self.shared
            .state
            .lock()
            .serials
            .entry(name.to_string())
            .or_default()
            .baud_rate = serial.baud_rate;

        Ok(Box::new(MockSerialDevice {
            name: name.to_string(),
            id,
            shared: self.shared.clone(),
        }))
    }

    fn open_pwm(
        &self,
        name: &str,
        pwm: &PwmConfig,
        _call_timeout: Duration,
    ) -> Result<Box<dyn PwmDevice>, DeviceFault> {
        let id = ResourceId::Pwm(name.to_string());
        self.shared.enter(&id, "open".into())?;
        self.shared
            .state
            .lock()
            .pwms
            .entry(name.to_string())
            .or_default()
            .settings
            .frequency_hz = pwm.frequency_hz;

        Ok(Box::new(MockPwmDevice {
            name: name.to_string(),
            id,
            shared: self.shared.clone(),
        }))
    }
}

struct MockPinDevice {
    pin_id: u32,
    id: ResourceId,
    shared: Arc<MockShared>,
}

impl MockPinDevice {
    fn with_pin<R>(&self, f: impl FnOnce(&mut MockPin) -> R) -> R {
        let mut state = self.shared.state.lock();
        f(state.pins.entry(self.pin_id).or_default())
    }
}

impl PinDevice for MockPinDevice {
    fn read_pin(&mut self) -> Result<u8, DeviceFault> {
        self.shared.enter(&self.id, "read".into())?;
        self.with_pin(|pin| {
            if pin.settings.state == GpioState::Disabled {
                return Err(DeviceFault::Unsupported(
                    "pin is disabled and cannot be read".into(),
                ));
            }
            Ok(pin.value)
        })
    }

    fn write_pin(&mut self, value: u8) -> Result<(), DeviceFault> {
        self.shared.enter(&self.id, format!("write {value}"))?;
        self.with_pin(|pin| {
            if !pin.settings.state.is_writable() {
                return Err(DeviceFault::Unsupported(
                    "pin must be in output mode to set value".into(),
                ));
            }
            pin.value = value;
            Ok(())
        })
    }

    fn configure_pin(&mut self, settings: &PinSettings) -> Result<(), DeviceFault> {
        self.shared
            .enter(&self.id, format!("configure {:?}", settings.state))?;
        self.with_pin(|pin| {
            pin.settings = *settings;
            if settings.state == GpioState::Disabled {
                pin.value = 0;
            }
        });
        Ok(())
    }

    fn settings(&self) -> PinSettings {
        self.with_pin(|pin| pin.settings)
    }
}

struct MockSerialDevice {
    name: String,
    id: ResourceId,
    shared: Arc<MockShared>,
}

impl MockSerialDevice {
    fn with_port<R>(&self, f: impl FnOnce(&mut MockSerial) -> R) -> R {
        let mut state = self.shared.state.lock();
        f(state.serials.entry(self.name.clone()).or_default())
    }
}

impl SerialDevice for MockSerialDevice {
    fn read_serial(&mut self, buf: &mut [u8]) -> Result<usize, DeviceFault> {
        self.shared.enter(&self.id, format!("read {}", buf.len()))?;
        self.with_port(|port| {
            if port.rx.is_empty() {
                return Err(DeviceFault::TimedOut("no data available".into()));
            }
            let n = buf.len().min(port.rx.len());
            for (slot, byte) in buf.iter_mut().zip(port.rx.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        })
    }

    fn write_serial(&mut self, data: &[u8]) -> Result<usize, DeviceFault> {
        self.shared.enter(&self.id, format!("write {data:?}"))?;
        self.with_port(|port| {
            port.tx.extend_from_slice(data);
            Ok(data.len())
        })
    }

    fn configure_serial(&mut self, settings: &SerialSettings) -> Result<(), DeviceFault> {
        self.shared
            .enter(&self.id, format!("configure {}", settings.baud_rate))?;
        self.with_port(|port| port.baud_rate = settings.baud_rate);
        Ok(())
    }
}

struct MockPwmDevice {
    name: String,
    id: ResourceId,
    shared: Arc<MockShared>,
}

impl MockPwmDevice {
    fn with_channel<R>(&self, f: impl FnOnce(&mut MockPwm) -> R) -> R {
        let mut state = self.shared.state.lock();
        f(state.pwms.entry(self.name.clone()).or_default())
    }
}

impl PwmDevice for MockPwmDevice {
    fn read_duty(&mut self) -> Result<f64, DeviceFault> {
        self.shared.enter(&self.id, "read".into())?;
        Ok(self.with_channel(|pwm| pwm.duty))
    }

    fn write_duty(&mut self, duty: f64) -> Result<(), DeviceFault> {
        self.shared.enter(&self.id, format!("duty {duty:.4}"))?;
        self.with_channel(|pwm| {
            if !pwm.settings.enabled {
                return Err(DeviceFault::Unsupported(
                    "pwm output must be enabled to set duty cycle".into(),
                ));
            }
            pwm.duty = duty;
            Ok(())
        })
    }

    fn configure_pwm(&mut self, settings: &PwmSettings) -> Result<(), DeviceFault> {
        self.shared.enter(
            &self.id,
            format!("configure {} Hz enabled={}", settings.frequency_hz, settings.enabled),
        )?;
        self.with_channel(|pwm| {
            pwm.settings = *settings;
            if !settings.enabled {
                pwm.duty = 0.0;
            }
        });
        Ok(())
    }

    fn settings(&self) -> PwmSettings {
        self.with_channel(|pwm| pwm.settings)
    }
}
