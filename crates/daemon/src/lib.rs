pub mod bridge;
pub mod clock;
pub mod config;

pub use bridge::{
    Bridge, BridgeError, BridgeOptions, BridgeState, DeviceLink, DeviceStats, RunSummary, StopReason, MAX_TICK,
};
pub use clock::{Clock, SystemClock};
pub use config::{check_distinct, load_device_config, parse_device_config, ConfigError, DeviceConfig};
