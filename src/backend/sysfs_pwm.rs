use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use crate::config::PwmConfig;
use crate::error::DeviceFault;
use crate::hardware::PwmDevice;
use crate::resource::PwmSettings;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// PWM channel driven through the kernel's `/sys/class/pwm` interface.
pub struct SysfsPwm {
    dir: PathBuf,
    settings: PwmSettings,
    period_ns: u64,
}

impl SysfsPwm {
    pub fn open(pwm: &PwmConfig, call_timeout: Duration) -> Result<Self, DeviceFault> {
        let chip = Path::new(&pwm.chip);
        let dir = chip.join(format!("pwm{}", pwm.channel));

        if !dir.exists() {
            write_attr(&chip.join("export"), &pwm.channel.to_string())?;
            // udev creates the channel directory asynchronously.
            let deadline = Instant::now() + call_timeout;
            while !dir.join("period").exists() {
                if Instant::now() >= deadline {
                    return Err(DeviceFault::TimedOut(format!(
                        "{} did not appear after export",
                        dir.display()
                    )));
                }
                thread::sleep(Duration::from_millis(10));
            }
            debug!("{}: exported", dir.display());
        }

        let mut device = Self {
            dir,
            settings: PwmSettings::default(),
            period_ns: 0,
        };
        device.configure_pwm(&PwmSettings {
            frequency_hz: pwm.frequency_hz,
            enabled: false,
        })?;
        Ok(device)
    }

    fn attr(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl PwmDevice for SysfsPwm {
    fn read_duty(&mut self) -> Result<f64, DeviceFault> {
        if self.period_ns == 0 {
            return Ok(0.0);
        }
        let raw = fs::read_to_string(self.attr("duty_cycle"))?;
        let duty_ns: u64 = raw
            .trim()
            .parse()
            .map_err(|e| DeviceFault::Protocol(format!("duty_cycle {raw:?}: {e}")))?;
        Ok(duty_ns as f64 / self.period_ns as f64)
    }

    fn write_duty(&mut self, duty: f64) -> Result<(), DeviceFault> {
        if !self.settings.enabled {
            return Err(DeviceFault::Unsupported(
                "pwm output must be enabled to set duty cycle".into(),
            ));
        }
        let duty_ns = (duty * self.period_ns as f64).round() as u64;
        write_attr(&self.attr("duty_cycle"), &duty_ns.to_string())
    }

    fn configure_pwm(&mut self, settings: &PwmSettings) -> Result<(), DeviceFault> {
        let period_ns = NANOS_PER_SEC / u64::from(settings.frequency_hz.max(1));
        if period_ns != self.period_ns {
            // The kernel rejects a period shorter than the current duty cycle.
            write_attr(&self.attr("duty_cycle"), "0")?;
            write_attr(&self.attr("period"), &period_ns.to_string())?;
            self.period_ns = period_ns;
        }
        write_attr(
            &self.attr("enable"),
            if settings.enabled { "1" } else { "0" },
        )?;
        self.settings = *settings;
        debug!(
            "{}: {} Hz, enabled={}",
            self.dir.display(),
            settings.frequency_hz,
            settings.enabled
        );
        Ok(())
    }

    fn settings(&self) -> PwmSettings {
        self.settings
    }
}

fn write_attr(path: &Path, value: &str) -> Result<(), DeviceFault> {
    fs::write(path, value).map_err(|e| match DeviceFault::from(e) {
        DeviceFault::Io(detail) => DeviceFault::Io(format!("{}: {detail}", path.display())),
        fault => fault,
    })
}
