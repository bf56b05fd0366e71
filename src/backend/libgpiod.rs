use std::path::PathBuf;

use libgpiod::{chip::Chip, line, request};
use log::debug;

use crate::config::PinConfig;
use crate::error::DeviceFault;
use crate::hardware::PinDevice;
use crate::resource::{GpioState, PinSettings};

/// One GPIO line requested through the character device.
///
/// A disabled pin holds no line request, so the line stays available to
/// other consumers until it is configured.
pub struct GpiodPin {
    pin_id: u32,
    chip: String,
    line: u32,
    settings: PinSettings,
    request: Option<request::Request>,
}

impl GpiodPin {
    pub fn open(pin_id: u32, pin: &PinConfig) -> Result<Self, DeviceFault> {
        // Fail early on a missing chip instead of on first configure.
        Self::open_chip(&pin.chip)?;

        Ok(Self {
            pin_id,
            chip: pin.chip.clone(),
            line: pin.line,
            settings: PinSettings::default(),
            request: None,
        })
    }

    fn open_chip(path: &str) -> Result<Chip, DeviceFault> {
        let p = PathBuf::from(path);
        Chip::open(&p).map_err(|e| gpio_fault(format!("open chip {path}: {e}")))
    }

    fn request_lines(chip: &Chip, line_cfg: &line::Config) -> Result<request::Request, DeviceFault> {
        let mut req_cfg =
            request::Config::new().map_err(|e| gpio_fault(format!("request config: {e}")))?;
        req_cfg
            .set_consumer(env!("CARGO_PKG_NAME"))
            .map_err(|e| gpio_fault(format!("request consumer: {e}")))?;
        chip.request_lines(Some(&req_cfg), line_cfg)
            .map_err(|e| gpio_fault(format!("request lines: {e}")))
    }

    fn make_line_settings(settings: &PinSettings) -> Result<line::Settings, DeviceFault> {
        let mut ls =
            line::Settings::new().map_err(|e| gpio_fault(format!("libgpiod settings: {e}")))?;

        let (direction, drive, bias) = match settings.state {
            GpioState::Error | GpioState::Disabled => {
                return Err(DeviceFault::Unsupported(
                    "cannot create settings for error or disabled state".into(),
                ));
            }
            GpioState::PushPull => (line::Direction::Output, Some(line::Drive::PushPull), None),
            GpioState::OpenDrain => (line::Direction::Output, Some(line::Drive::OpenDrain), None),
            GpioState::OpenSource => {
                (line::Direction::Output, Some(line::Drive::OpenSource), None)
            }
            GpioState::Floating => (line::Direction::Input, None, None),
            GpioState::PullUp => (line::Direction::Input, None, Some(line::Bias::PullUp)),
            GpioState::PullDown => (line::Direction::Input, None, Some(line::Bias::PullDown)),
        };

        ls.set_direction(direction)
            .map_err(|e| gpio_fault(format!("set direction: {e}")))?;
        match drive {
            Some(drive) => {
                ls.set_drive(drive)
                    .map_err(|e| gpio_fault(format!("set drive: {e}")))?;
            }
            None => {
                ls.set_bias(bias)
                    .map_err(|e| gpio_fault(format!("set bias: {e}")))?;
            }
        }

        Ok(ls)
    }

    fn make_line_config(offset: u32, settings: line::Settings) -> Result<line::Config, DeviceFault> {
        let mut cfg =
            line::Config::new().map_err(|e| gpio_fault(format!("line config: {e}")))?;
        cfg.add_line_settings(&[offset], settings)
            .map_err(|e| gpio_fault(format!("line config add settings: {e}")))?;
        Ok(cfg)
    }

    fn request(&mut self) -> Result<&mut request::Request, DeviceFault> {
        self.request.as_mut().ok_or_else(|| {
            DeviceFault::Unsupported("pin not configured, set state first".into())
        })
    }
}

impl PinDevice for GpiodPin {
    fn read_pin(&mut self) -> Result<u8, DeviceFault> {
        let offset = self.line;
        let value = self
            .request()?
            .value(offset)
            .map_err(|e| gpio_fault(format!("get value: {e}")))?;

        Ok(match value {
            line::Value::InActive => 0,
            line::Value::Active => 1,
        })
    }

    fn write_pin(&mut self, value: u8) -> Result<(), DeviceFault> {
        if !self.settings.state.is_writable() {
            return Err(DeviceFault::Unsupported(
                "pin must be in output mode to set value".into(),
            ));
        }

        let offset = self.line;
        self.request()?
            .set_value(
                offset,
                match value {
                    0 => line::Value::InActive,
                    _ => line::Value::Active,
                },
            )
            .map_err(|e| gpio_fault(format!("set value: {e}")))?;
        Ok(())
    }

    fn configure_pin(&mut self, settings: &PinSettings) -> Result<(), DeviceFault> {
        if settings.state == GpioState::Disabled {
            // Dropping the request releases the line.
            self.request = None;
            self.settings = *settings;
            debug!("pin {}: line released", self.pin_id);
            return Ok(());
        }

        let line_settings = Self::make_line_settings(settings)?;
        let line_cfg = Self::make_line_config(self.line, line_settings)?;

        match self.request.as_mut() {
            Some(req) => {
                req.reconfigure_lines(&line_cfg)
                    .map_err(|e| gpio_fault(format!("reconfigure lines: {e}")))?;
            }
            None => {
                let chip = Self::open_chip(&self.chip)?;
                self.request = Some(Self::request_lines(&chip, &line_cfg)?);
            }
        }

        self.settings = *settings;
        Ok(())
    }

    fn settings(&self) -> PinSettings {
        self.settings
    }
}

fn gpio_fault(msg: String) -> DeviceFault {
    let lower = msg.to_ascii_lowercase();
    if lower.contains("permission") {
        DeviceFault::PermissionDenied(msg)
    } else if lower.contains("no such") || lower.contains("no device") {
        DeviceFault::Disconnected(msg)
    } else {
        DeviceFault::Io(msg)
    }
}
