#[cfg(feature = "hardware-gpio")]
pub mod libgpiod;
pub mod mock;
#[cfg(feature = "hardware-serial")]
pub mod serial;
pub mod sysfs_pwm;

use std::time::Duration;

use crate::config::{PinConfig, PwmConfig, SerialConfig};
use crate::error::DeviceFault;
use crate::hardware::{HardwareBackend, PinDevice, PwmDevice, SerialDevice};

#[cfg(feature = "hardware-gpio")]
pub use libgpiod::GpiodPin;
pub use mock::{MockBackend, MockCall};
#[cfg(feature = "hardware-serial")]
pub use serial::SerialPortDevice;
pub use sysfs_pwm::SysfsPwm;

/// Real hardware: GPIO through libgpiod, serial through `serialport`, PWM
/// through sysfs. GPIO and serial report `Unsupported` when their feature is
/// disabled.
#[derive(Default)]
pub struct SystemBackend;

impl HardwareBackend for SystemBackend {
    #[allow(unused_variables)]
    fn open_pin(
        &self,
        pin_id: u32,
        pin: &PinConfig,
        call_timeout: Duration,
    ) -> Result<Box<dyn PinDevice>, DeviceFault> {
        #[cfg(feature = "hardware-gpio")]
        {
            Ok(Box::new(GpiodPin::open(pin_id, pin)?))
        }
        #[cfg(not(feature = "hardware-gpio"))]
        {
            Err(DeviceFault::Unsupported(format!(
                "pin {pin_id}: built without hardware-gpio"
            )))
        }
    }

    #[allow(unused_variables)]
    fn open_serial(
        &self,
        name: &str,
        serial: &SerialConfig,
        call_timeout: Duration,
    ) -> Result<Box<dyn SerialDevice>, DeviceFault> {
        #[cfg(feature = "hardware-serial")]
        {
            Ok(Box::new(SerialPortDevice::open(serial, call_timeout)?))
        }
        #[cfg(not(feature = "hardware-serial"))]
        {
            Err(DeviceFault::Unsupported(format!(
                "serial {name}: built without hardware-serial"
            )))
        }
    }

    fn open_pwm(
        &self,
        _name: &str,
        pwm: &PwmConfig,
        call_timeout: Duration,
    ) -> Result<Box<dyn PwmDevice>, DeviceFault> {
        Ok(Box::new(SysfsPwm::open(pwm, call_timeout)?))
    }
}
