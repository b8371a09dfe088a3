//! Device records and the `list targets` reply format.
//!
//! One device per line, tab separated:
//!
//! ```text
//! <serial>\t<state>
//! <serial>\t<kind>\t<state>[\t<extra>...]
//! [Empty]
//! ```

use std::fmt;

/// Connection state reported by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceState {
    Offline,
    Online,
    Unauthorized,
    #[default]
    Unknown,
}

impl DeviceState {
    pub fn parse(text: &str) -> Self {
        match text.trim().to_ascii_lowercase().as_str() {
            "connected" | "online" | "device" | "ready" => DeviceState::Online,
            "offline" | "disconnected" => DeviceState::Offline,
            "unauthorized" => DeviceState::Unauthorized,
            _ => DeviceState::Unknown,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How the device is attached to the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceKind {
    Usb,
    Tcp,
    Uart,
    Bluetooth,
    #[default]
    Unknown,
}

impl DeviceKind {
    pub fn parse(text: &str) -> Self {
        match text.trim().to_ascii_uppercase().as_str() {
            "USB" => DeviceKind::Usb,
            "TCP" => DeviceKind::Tcp,
            "UART" => DeviceKind::Uart,
            "BT" => DeviceKind::Bluetooth,
            _ => DeviceKind::Unknown,
        }
    }
}

/// A device as seen by the monitor. Listeners receive copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub serial: String,
    pub kind: DeviceKind,
    pub host: String,
    pub port: u16,
    pub state: DeviceState,
    /// Set by callers after connecting, e.g. the kernel flavour.
    pub kernel_type: Option<String>,
}

impl DeviceRecord {
    pub fn new(serial: impl Into<String>, state: DeviceState) -> Self {
        Self {
            serial: serial.into(),
            kind: DeviceKind::Unknown,
            host: String::new(),
            port: 0,
            state,
            kernel_type: None,
        }
    }

    pub fn with_kind(mut self, kind: DeviceKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Identity used when diffing rosters.
    pub fn identity(&self) -> (&str, DeviceKind) {
        (&self.serial, self.kind)
    }
}

impl fmt::Display for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {})", self.serial, self.kind, self.state)
    }
}

/// Parse a device-list reply. Records take `host`/`port` of the bridge
/// they were reported by.
pub fn parse_device_list(text: &str, host: &str, port: u16) -> Vec<DeviceRecord> {
    let mut devices = Vec::new();
    for line in text.lines() {
        let line = line.trim_matches(|c: char| c == '\r' || c == '\0' || c == ' ');
        if line.is_empty() || is_empty_sentinel(line) {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
        let record = match fields.as_slice() {
            [serial] => DeviceRecord::new(*serial, DeviceState::Unknown),
            [serial, state] => DeviceRecord::new(*serial, DeviceState::parse(state)),
            [serial, kind, state, ..] => {
                DeviceRecord::new(*serial, DeviceState::parse(state)).with_kind(DeviceKind::parse(kind))
            }
            [] => continue,
        };
        if record.serial.is_empty() {
            continue;
        }
        devices.push(record.with_endpoint(host, port));
    }
    devices
}

fn is_empty_sentinel(line: &str) -> bool {
    line.eq_ignore_ascii_case("[empty]") || line.eq_ignore_ascii_case("empty")
}
