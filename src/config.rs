use std::{collections::HashSet, fs, path::Path, time::Duration};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::resource::ResourceId;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    pub unix_socket: Option<String>,
    pub host: Option<String>,
    pub path: String,
    pub timeout: u64,
}

impl HttpConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.unix_socket.is_none() && self.host.is_none() {
            return Err(AppError::Config(
                "http: either 'unix_socket' or 'host' must be specified".into(),
            ));
        }
        if self.timeout == 0 {
            return Err(AppError::Config("http: timeout must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum GpioCapability {
    Error,
    Disabled,
    PushPull,
    OpenDrain,
    OpenSource,
    Floating,
    PullUp,
    PullDown,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    #[default]
    Raw,
    Controller,
}

/// Fully resolved per-resource tuning.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Tuning {
    pub debounce_ms: u64,
    pub hysteresis: f64,
    pub queue_capacity: usize,
    pub call_timeout_ms: u64,
    /// Upper bound for a single serial read.
    pub max_read_len: usize,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
}

impl Tuning {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval_ms.map(Duration::from_millis)
    }

    fn merged(&self, overrides: Option<&TuningOverrides>) -> Tuning {
        let Some(o) = overrides else {
            return self.clone();
        };
        Tuning {
            debounce_ms: o.debounce_ms.unwrap_or(self.debounce_ms),
            hysteresis: o.hysteresis.unwrap_or(self.hysteresis),
            queue_capacity: o.queue_capacity.unwrap_or(self.queue_capacity),
            call_timeout_ms: o.call_timeout_ms.unwrap_or(self.call_timeout_ms),
            max_read_len: o.max_read_len.unwrap_or(self.max_read_len),
            poll_interval_ms: o.poll_interval_ms.or(self.poll_interval_ms),
        }
    }

    fn validate(&self, owner: &str) -> Result<(), AppError> {
        if self.queue_capacity == 0 {
            return Err(AppError::Config(format!("{owner}: queue_capacity must be > 0")));
        }
        if self.call_timeout_ms == 0 {
            return Err(AppError::Config(format!("{owner}: call_timeout_ms must be > 0")));
        }
        if self.max_read_len == 0 {
            return Err(AppError::Config(format!("{owner}: max_read_len must be > 0")));
        }
        if !(self.hysteresis >= 0.0) {
            return Err(AppError::Config(format!("{owner}: hysteresis must be >= 0")));
        }
        if self.poll_interval_ms == Some(0) {
            return Err(AppError::Config(format!("{owner}: poll_interval_ms must be > 0")));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct TuningOverrides {
    pub debounce_ms: Option<u64>,
    pub hysteresis: Option<f64>,
    pub queue_capacity: Option<usize>,
    pub call_timeout_ms: Option<u64>,
    pub max_read_len: Option<usize>,
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PinConfig {
    pub name: String,
    pub chip: String,
    pub line: u32,
    pub capabilities: HashSet<GpioCapability>,
    #[serde(default)]
    pub tuning: Option<TuningOverrides>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SerialConfig {
    pub path: String,
    pub baud_rate: u32,
    #[serde(default)]
    pub framing: Framing,
    #[serde(default)]
    pub tuning: Option<TuningOverrides>,
}

/// Pulse range of a hobby servo driven from a PWM channel.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
pub struct ServoConfig {
    pub min_angle: f64,
    pub max_angle: f64,
    pub min_pulse_us: u32,
    pub max_pulse_us: u32,
}

impl ServoConfig {
    pub fn contains_angle(&self, angle: f64) -> bool {
        (self.min_angle..=self.max_angle).contains(&angle)
    }

    /// Whether the longest pulse fits in one period.
    pub fn fits(&self, frequency_hz: u32) -> bool {
        u64::from(self.max_pulse_us) * u64::from(frequency_hz) <= 1_000_000
    }

    /// Duty cycle that holds the servo at `angle` degrees.
    ///
    /// The pulse width is interpolated linearly between the two ends of the
    /// range and divided by the period. Angles outside the range are clamped.
    pub fn duty_for(&self, angle: f64, frequency_hz: u32) -> f64 {
        let angle = angle.clamp(self.min_angle, self.max_angle);
        let fraction = (angle - self.min_angle) / (self.max_angle - self.min_angle);
        let min = f64::from(self.min_pulse_us);
        let pulse_us = min + (f64::from(self.max_pulse_us) - min) * fraction;
        (pulse_us * f64::from(frequency_hz) / 1_000_000.0).min(1.0)
    }

    fn validate(&self, owner: &str, frequency_hz: u32) -> Result<(), AppError> {
        if !(self.min_angle < self.max_angle) {
            return Err(AppError::Config(format!("{owner}: min_angle must be < max_angle")));
        }
        if self.min_pulse_us >= self.max_pulse_us {
            return Err(AppError::Config(format!(
                "{owner}: min_pulse_us must be < max_pulse_us"
            )));
        }
        if !self.fits(frequency_hz) {
            return Err(AppError::Config(format!(
                "{owner}: max_pulse_us does not fit in one period at {frequency_hz} Hz"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PwmConfig {
    pub name: String,
    /// sysfs directory of the PWM chip, e.g. `/sys/class/pwm/pwmchip0`.
    pub chip: String,
    pub channel: u32,
    pub frequency_hz: u32,
    #[serde(default)]
    pub servo: Option<ServoConfig>,
    #[serde(default)]
    pub tuning: Option<TuningOverrides>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DispatcherConfig {
    pub defaults: Tuning,
    pub degrade_after: u32,
    pub shutdown_deadline_ms: u64,
    pub event_history_capacity: usize,
}

impl DispatcherConfig {
    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_millis(self.shutdown_deadline_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub gpios: FxHashMap<u32, PinConfig>,
    #[serde(default)]
    pub serials: FxHashMap<String, SerialConfig>,
    #[serde(default)]
    pub pwms: FxHashMap<String, PwmConfig>,
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, AppError> {
        let config: AppConfig = serde_json::from_str(contents)
            .map_err(|e| AppError::Config(format!("Invalid config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        self.http.validate()?;
        if self.dispatcher.degrade_after == 0 {
            return Err(AppError::Config("degrade_after must be > 0".into()));
        }
        self.dispatcher.defaults.validate("defaults")?;
        for (id, pin) in &self.gpios {
            self.dispatcher
                .defaults
                .merged(pin.tuning.as_ref())
                .validate(&format!("gpio {id}"))?;
        }
        for (name, serial) in &self.serials {
            self.dispatcher
                .defaults
                .merged(serial.tuning.as_ref())
                .validate(&format!("serial {name}"))?;
        }
        for (name, pwm) in &self.pwms {
            let owner = format!("pwm {name}");
            if pwm.frequency_hz == 0 {
                return Err(AppError::Config(format!("{owner}: frequency_hz must be > 0")));
            }
            if let Some(servo) = &pwm.servo {
                servo.validate(&owner, pwm.frequency_hz)?;
            }
            self.dispatcher
                .defaults
                .merged(pwm.tuning.as_ref())
                .validate(&owner)?;
        }
        Ok(())
    }

    pub fn pin(&self, pin_id: u32) -> Result<&PinConfig, AppError> {
        self.gpios
            .get(&pin_id)
            .ok_or_else(|| AppError::NotFound(format!("pin {pin_id}")))
    }

    pub fn serial(&self, name: &str) -> Result<&SerialConfig, AppError> {
        self.serials
            .get(name)
            .ok_or_else(|| AppError::NotFound(format!("serial {name}")))
    }

    pub fn pwm(&self, name: &str) -> Result<&PwmConfig, AppError> {
        self.pwms
            .get(name)
            .ok_or_else(|| AppError::NotFound(format!("pwm {name}")))
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        match id {
            ResourceId::Pin(pin_id) => self.gpios.contains_key(pin_id),
            ResourceId::Serial(name) => self.serials.contains_key(name),
            ResourceId::Pwm(name) => self.pwms.contains_key(name),
        }
    }

    pub fn tuning_for(&self, id: &ResourceId) -> Result<Tuning, AppError> {
        let overrides = match id {
            ResourceId::Pin(pin_id) => self.pin(*pin_id)?.tuning.as_ref(),
            ResourceId::Serial(name) => self.serial(name)?.tuning.as_ref(),
            ResourceId::Pwm(name) => self.pwm(name)?.tuning.as_ref(),
        };
        Ok(self.dispatcher.defaults.merged(overrides))
    }

    pub fn resource_ids(&self) -> Vec<ResourceId> {
        let mut ids: Vec<ResourceId> = self.gpios.keys().map(|id| ResourceId::Pin(*id)).collect();
        ids.extend(self.serials.keys().map(|name| ResourceId::Serial(name.clone())));
        ids.extend(self.pwms.keys().map(|name| ResourceId::Pwm(name.clone())));
        ids.sort();
        ids
    }
}
