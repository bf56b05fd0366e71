pub mod backend;
pub mod bus;
pub mod command;
pub mod config;
pub mod debounce;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod frame;
pub mod hardware;
pub mod registry;
pub mod resource;
pub mod routes;

pub use backend::{MockBackend, SystemBackend};
pub use bus::{EventKind, Interest, StateEvent, Subscription};
pub use command::{ExecutionResult, Pending};
pub use config::{
    AppConfig, Framing, HttpConfig, PinConfig, PwmConfig, SerialConfig, ServoConfig, Tuning,
};
pub use debounce::CachedState;
pub use dispatcher::{Dispatcher, Lease, ResourceStatus};
pub use error::{AppError, DeviceFault};
pub use resource::{
    AccessMode, GpioState, Operation, Outcome, PinSettings, PwmSettings, ResourceId,
    SerialSettings, Value,
};
pub use routes::AppState;
