//! Device roster state: records parsed from the bridge and the monitor
//! that keeps them current.

pub mod device;
pub mod monitor;

pub use device::{DeviceKind, DeviceRecord, DeviceState, parse_device_list};
pub use monitor::{
    DeviceMonitor, MonitorListener, MonitorPhase, MonitorRegistry, MonitorSettings, RosterEvent,
    Sleeper, ThreadSleeper, diff_rosters,
};
