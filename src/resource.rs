use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::GpioCapability;

/// Identity of a physical line or device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceId {
    Pin(u32),
    Serial(String),
    Pwm(String),
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Pin(id) => write!(f, "pin {id}"),
            ResourceId::Serial(name) => write!(f, "serial {name}"),
            ResourceId::Pwm(name) => write!(f, "pwm {name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMode {
    /// Shared access, e.g. readers of cached state.
    Read,
    /// Single writer; readers may coexist.
    Write,
    /// Sole owner of the device.
    Exclusive,
}

impl AccessMode {
    pub fn conflicts_with(self, other: AccessMode) -> bool {
        match (self, other) {
            (AccessMode::Exclusive, _) | (_, AccessMode::Exclusive) => true,
            (AccessMode::Write, AccessMode::Write) => true,
            _ => false,
        }
    }
}

pub type GpioState = GpioCapability;

impl GpioState {
    pub fn is_writable(&self) -> bool {
        matches!(
            self,
            GpioState::PushPull | GpioState::OpenDrain | GpioState::OpenSource
        )
    }

    pub fn is_input(&self) -> bool {
        matches!(
            self,
            GpioState::Floating | GpioState::PullUp | GpioState::PullDown
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinSettings {
    pub state: GpioState,
}

impl Default for PinSettings {
    fn default() -> Self {
        Self {
            state: GpioState::Disabled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    pub baud_rate: u32,
}

/// Period and enable state of a PWM channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PwmSettings {
    pub frequency_hz: u32,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Value {
    Digital(u8),
    Analog(f64),
    Channels(Vec<u16>),
    Bytes(Vec<u8>),
}

impl Value {
    /// Whether the value describes resource state (as opposed to a payload).
    pub fn is_state(&self) -> bool {
        !matches!(self, Value::Bytes(_))
    }

    /// Magnitude of change between two numeric values of the same shape.
    pub fn delta(&self, other: &Value) -> Option<f64> {
        match (self, other) {
            (Value::Analog(a), Value::Analog(b)) => Some((a - b).abs()),
            (Value::Channels(a), Value::Channels(b)) if a.len() == b.len() => Some(
                a.iter()
                    .zip(b)
                    .map(|(x, y)| (f64::from(*x) - f64::from(*y)).abs())
                    .fold(0.0, f64::max),
            ),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    ReadPin,
    WritePin(u8),
    ConfigurePin(PinSettings),
    ReadSerial { max_len: usize },
    WriteSerial(Vec<u8>),
    ConfigureSerial(SerialSettings),
    ReadFrame,
    ReadPwm,
    /// Duty cycle as a fraction of the period, `0.0..=1.0`.
    WritePwm { duty: f64 },
    ConfigurePwm(PwmSettings),
    /// Servo position in degrees, converted to a duty cycle on the channel.
    WriteServo { angle: f64 },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::ReadPin => "read-pin",
            Operation::WritePin(_) => "write-pin",
            Operation::ConfigurePin(_) => "configure-pin",
            Operation::ReadSerial { .. } => "read-serial",
            Operation::WriteSerial(_) => "write-serial",
            Operation::ConfigureSerial(_) => "configure-serial",
            Operation::ReadFrame => "read-frame",
            Operation::ReadPwm => "read-pwm",
            Operation::WritePwm { .. } => "write-pwm",
            Operation::ConfigurePwm(_) => "configure-pwm",
            Operation::WriteServo { .. } => "write-servo",
        }
    }

    /// Mode implied by the operation for callers that hold no lease.
    pub fn access_mode(&self) -> AccessMode {
        match self {
            Operation::ReadPin
            | Operation::ReadSerial { .. }
            | Operation::ReadFrame
            | Operation::ReadPwm => AccessMode::Read,
            _ => AccessMode::Write,
        }
    }

    pub fn is_configure(&self) -> bool {
        matches!(
            self,
            Operation::ConfigurePin(_)
                | Operation::ConfigureSerial(_)
                | Operation::ConfigurePwm(_)
        )
    }

    pub fn targets(&self, id: &ResourceId) -> bool {
        match id {
            ResourceId::Pin(_) => matches!(
                self,
                Operation::ReadPin | Operation::WritePin(_) | Operation::ConfigurePin(_)
            ),
            ResourceId::Serial(_) => matches!(
                self,
                Operation::ReadSerial { .. }
                    | Operation::WriteSerial(_)
                    | Operation::ConfigureSerial(_)
                    | Operation::ReadFrame
            ),
            ResourceId::Pwm(_) => matches!(
                self,
                Operation::ReadPwm
                    | Operation::WritePwm { .. }
                    | Operation::ConfigurePwm(_)
                    | Operation::WriteServo { .. }
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Ack,
    Value(Value),
}

impl Outcome {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Outcome::Ack => None,
            Outcome::Value(v) => Some(v),
        }
    }
}
