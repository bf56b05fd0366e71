//! Boundary to the hardware-abstraction layer.
//!
//! A backend opens one device object per physical resource. The object is
//! created on the resource's executor thread and never leaves it, so device
//! implementations need `Send` but not `Sync` and take `&mut self`.

use std::time::Duration;

use crate::config::{PinConfig, PwmConfig, SerialConfig};
use crate::error::DeviceFault;
use crate::resource::{PinSettings, PwmSettings, SerialSettings};

pub trait PinDevice: Send {
    fn read_pin(&mut self) -> Result<u8, DeviceFault>;
    fn write_pin(&mut self, value: u8) -> Result<(), DeviceFault>;
    fn configure_pin(&mut self, settings: &PinSettings) -> Result<(), DeviceFault>;
    fn settings(&self) -> PinSettings;
}

pub trait SerialDevice: Send {
    /// Reads at most `buf.len()` bytes, blocking up to the device timeout.
    fn read_serial(&mut self, buf: &mut [u8]) -> Result<usize, DeviceFault>;
    fn write_serial(&mut self, data: &[u8]) -> Result<usize, DeviceFault>;
    fn configure_serial(&mut self, settings: &SerialSettings) -> Result<(), DeviceFault>;

    fn read_exact_serial(&mut self, buf: &mut [u8]) -> Result<(), DeviceFault> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read_serial(&mut buf[filled..])? {
                0 => {
                    return Err(DeviceFault::TimedOut(format!(
                        "short read: {filled} of {} bytes",
                        buf.len()
                    )));
                }
                n => filled += n,
            }
        }
        Ok(())
    }
}

/// A PWM output channel. Duty cycles are fractions of the period.
pub trait PwmDevice: Send {
    fn read_duty(&mut self) -> Result<f64, DeviceFault>;
    fn write_duty(&mut self, duty: f64) -> Result<(), DeviceFault>;
    fn configure_pwm(&mut self, settings: &PwmSettings) -> Result<(), DeviceFault>;
    fn settings(&self) -> PwmSettings;
}

pub trait HardwareBackend: Send + Sync {
    fn open_pin(
        &self,
        pin_id: u32,
        pin: &PinConfig,
        call_timeout: Duration,
    ) -> Result<Box<dyn PinDevice>, DeviceFault>;

    fn open_serial(
        &self,
        name: &str,
        serial: &SerialConfig,
        call_timeout: Duration,
    ) -> Result<Box<dyn SerialDevice>, DeviceFault>;

    fn open_pwm(
        &self,
        name: &str,
        pwm: &PwmConfig,
        call_timeout: Duration,
    ) -> Result<Box<dyn PwmDevice>, DeviceFault>;
}
