#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use hwmux::{AppConfig, Dispatcher, MockBackend};

pub const WAIT: Duration = Duration::from_secs(2);

pub fn sample_config() -> AppConfig {
    AppConfig::from_json(
        r#"
        {
            "http": {
                "host": "localhost:8080",
                "path": "/api/v1",
                "timeout": 5
            },
            "dispatcher": {
                "defaults": {
                    "debounce_ms": 0,
                    "hysteresis": 0.0,
                    "queue_capacity": 4,
                    "call_timeout_ms": 1000,
                    "max_read_len": 4096
                },
                "degrade_after": 3,
                "shutdown_deadline_ms": 500,
                "event_history_capacity": 32
            },
            "gpios": {
                "1": {
                    "name": "LED 1",
                    "chip": "/dev/gpiochip0",
                    "line": 2,
                    "capabilities": [
                        "push-pull"
                    ]
                },
                "2": {
                    "name": "BUTTON 1",
                    "chip": "/dev/gpiochip0",
                    "line": 3,
                    "capabilities": [
                        "floating",
                        "pull-up",
                        "pull-down"
                    ]
                },
                "7": {
                    "name": "SENSOR 1",
                    "chip": "/dev/gpiochip0",
                    "line": 7,
                    "capabilities": [
                        "floating",
                        "pull-up",
                        "pull-down"
                    ],
                    "tuning": {
                        "poll_interval_ms": 10
                    }
                },
                "42": {
                    "name": "General IO 1",
                    "chip": "/dev/gpiochip1",
                    "line": 5,
                    "capabilities": [
                        "push-pull",
                        "open-drain",
                        "open-source",
                        "floating",
                        "pull-up",
                        "pull-down"
                    ],
                    "tuning": {
                        "debounce_ms": 200
                    }
                }
            },
            "serials": {
                "uart0": {
                    "path": "/dev/ttyS0",
                    "baud_rate": 115200
                },
                "remote": {
                    "path": "/dev/ttyUSB0",
                    "baud_rate": 115200,
                    "framing": "controller"
                },
                "telemetry": {
                    "path": "/dev/ttyUSB1",
                    "baud_rate": 115200,
                    "framing": "controller",
                    "tuning": {
                        "poll_interval_ms": 10
                    }
                }
            },
            "pwms": {
                "servo": {
                    "name": "PAN SERVO",
                    "chip": "/sys/class/pwm/pwmchip0",
                    "channel": 0,
                    "frequency_hz": 50,
                    "servo": {
                        "min_angle": 0.0,
                        "max_angle": 180.0,
                        "min_pulse_us": 1000,
                        "max_pulse_us": 2000
                    }
                },
                "fan": {
                    "name": "FAN",
                    "chip": "/sys/class/pwm/pwmchip0",
                    "channel": 1,
                    "frequency_hz": 25000
                }
            }
        }
        "#,
    )
    .expect("valid sample config")
}

pub fn mock_dispatcher() -> (Arc<Dispatcher>, MockBackend) {
    let backend = MockBackend::new();
    let dispatcher = Dispatcher::new(Arc::new(sample_config()), Arc::new(backend.clone()))
        .expect("dispatcher starts");
    (Arc::new(dispatcher), backend)
}
