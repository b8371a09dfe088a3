//! Background device monitor.
//!
//! One monitor per bridge host keeps a live roster by polling the bridge's
//! device list over a long-lived connection and diffing each answer with
//! the previous one.
//!
//! ```text
//!  Stopped ──► Connecting ──► Polling
//!     ▲            │  ▲          │
//!     │            │  └──────────┘  (poll failed: reconnect)
//!     └────────────┘                (max attempts reached, or stop())
//! ```

use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::codec::control::decode_text;
use crate::error::{BridgeError, Result};
use crate::network::{ConnectionInfo, Transport};
use crate::protocol::control;
use crate::state::device::{DeviceRecord, parse_device_list};

/// Request that asks the bridge for its device list.
pub const LIST_TARGETS_COMMAND: &str = "list targets";

pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

// ── Listener ─────────────────────────────────────────────────────

/// Receives roster changes. Records are copies; mutating them has no
/// effect on the monitor.
pub trait MonitorListener: Send + Sync {
    fn on_connected(&self, device: &DeviceRecord);
    fn on_disconnected(&self, device: &DeviceRecord);
    fn on_changed(&self, device: &DeviceRecord);
}

// ── Sleeper ──────────────────────────────────────────────────────

/// Source of delays, swapped out in tests.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Sleeps the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

// ── Diff ─────────────────────────────────────────────────────────

/// A single roster change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterEvent {
    Connected(DeviceRecord),
    Disconnected(DeviceRecord),
    Changed(DeviceRecord),
}

/// Compare two rosters by `(serial, kind)`.
///
/// Disconnections come first (in `previous` order), then connections and
/// state changes (in `current` order).
pub fn diff_rosters(previous: &[DeviceRecord], current: &[DeviceRecord]) -> Vec<RosterEvent> {
    let mut events = Vec::new();

    for old in previous {
        if !current.iter().any(|d| d.identity() == old.identity()) {
            events.push(RosterEvent::Disconnected(old.clone()));
        }
    }
    for new in current {
        match previous.iter().find(|d| d.identity() == new.identity()) {
            None => events.push(RosterEvent::Connected(new.clone())),
            Some(old) if old.state != new.state => events.push(RosterEvent::Changed(new.clone())),
            Some(_) => {}
        }
    }
    events
}

// ── Settings / Phase ─────────────────────────────────────────────

/// Tunables of one monitor.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Consecutive failed connects before giving up.
    pub max_attempts: u32,
    /// Pause after each failed connect.
    pub retry_delay: Duration,
    /// Pause between polls.
    pub poll_interval: Duration,
    /// Socket timeout for connect, handshake and each poll.
    pub timeout: Duration,
    /// Key sent in the handshake.
    pub connect_key: String,
    /// Device list request.
    pub poll_command: String,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: Duration::from_millis(40_000),
            connect_key: String::new(),
            poll_command: LIST_TARGETS_COMMAND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitorPhase {
    #[default]
    Stopped,
    Connecting,
    Polling,
}

type MonitorMap = Mutex<HashMap<String, Arc<DeviceMonitor>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── DeviceMonitor ────────────────────────────────────────────────

pub struct DeviceMonitor {
    info: ConnectionInfo,
    settings: MonitorSettings,
    sleeper: Arc<dyn Sleeper>,
    /// Keep-running flag of the current worker. Every start gets a fresh
    /// one, so a worker that was stopped can never be revived.
    run_flag: Mutex<Arc<AtomicBool>>,
    phase: Mutex<MonitorPhase>,
    roster: Mutex<Vec<DeviceRecord>>,
    listeners: Mutex<Vec<Arc<dyn MonitorListener>>>,
    socket: Mutex<Option<TcpStream>>,
    worker: Mutex<Option<JoinHandle<Result<()>>>>,
    registry: Weak<MonitorMap>,
}

impl std::fmt::Debug for DeviceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMonitor")
            .field("info", &self.info)
            .field("phase", &self.phase())
            .field("devices", &lock(&self.roster).len())
            .finish()
    }
}

impl DeviceMonitor {
    /// A stand-alone monitor not tracked by any registry.
    pub fn new(info: ConnectionInfo, settings: MonitorSettings, sleeper: Arc<dyn Sleeper>) -> Arc<Self> {
        Arc::new(Self::build(info, settings, sleeper, Weak::new()))
    }

    fn build(
        info: ConnectionInfo,
        settings: MonitorSettings,
        sleeper: Arc<dyn Sleeper>,
        registry: Weak<MonitorMap>,
    ) -> Self {
        Self {
            info,
            settings,
            sleeper,
            run_flag: Mutex::new(Arc::new(AtomicBool::new(false))),
            phase: Mutex::new(MonitorPhase::Stopped),
            roster: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            socket: Mutex::new(None),
            worker: Mutex::new(None),
            registry,
        }
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn phase(&self) -> MonitorPhase {
        *lock(&self.phase)
    }

    pub fn is_running(&self) -> bool {
        lock(&self.run_flag).load(Ordering::SeqCst)
    }

    /// Snapshot of the current roster.
    pub fn devices(&self) -> Vec<DeviceRecord> {
        lock(&self.roster).clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn MonitorListener>) {
        lock(&self.listeners).push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn MonitorListener>) {
        lock(&self.listeners).retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Spawn the polling thread and (re)enter the registry. Calling it on
    /// a running monitor does nothing.
    ///
    /// A worker left over from an earlier `stop()` is joined first, so at
    /// most one thread polls per monitor.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut worker = lock(&self.worker);
        if worker.is_some() && self.is_running() {
            return Ok(());
        }
        if let Some(stale) = worker.take() {
            if stale.thread().id() != thread::current().id() {
                if let Ok(Err(e)) = stale.join() {
                    debug!(bridge = %self.info, error = %e, "previous monitor run ended with error");
                }
            }
        }
        self.register()?;

        let running = Arc::new(AtomicBool::new(true));
        *lock(&self.run_flag) = Arc::clone(&running);
        self.set_phase(MonitorPhase::Connecting);

        let monitor = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("device-monitor-{}", self.info.host()))
            .spawn(move || {
                let result = monitor.run(&running);
                let was_stopped = !running.swap(false, Ordering::SeqCst);
                monitor.set_phase(MonitorPhase::Stopped);
                if let Err(e) = &result {
                    error!(bridge = %monitor.info, error = %e, "device monitor stopped");
                    if !was_stopped {
                        monitor.unregister();
                    }
                }
                result
            })?;
        *worker = Some(handle);
        info!(bridge = %self.info, "device monitor started");
        Ok(())
    }

    /// Stop polling, close the connection and leave the registry. Safe to
    /// call from any thread, any number of times.
    pub fn stop(&self) {
        let was_running = lock(&self.run_flag).swap(false, Ordering::SeqCst);
        if let Some(socket) = lock(&self.socket).take() {
            let _ = socket.shutdown(Shutdown::Both);
        }
        self.unregister();
        if was_running {
            info!(bridge = %self.info, "device monitor stopping");
        }
    }

    /// Wait for the polling thread and return its result. A monitor that
    /// gave up reports [`BridgeError::MonitorUnreachable`] here.
    pub fn join(&self) -> Result<()> {
        let handle = lock(&self.worker).take();
        match handle {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(BridgeError::Transport(io::Error::other("monitor thread panicked")))),
            None => Ok(()),
        }
    }

    // ── Loop ─────────────────────────────────────────────────────

    fn run(&self, running: &AtomicBool) -> Result<()> {
        let mut failures = 0u32;
        let mut transport: Option<Transport> = None;

        while running.load(Ordering::SeqCst) {
            if transport.is_none() {
                self.set_phase(MonitorPhase::Connecting);
                match self.connect() {
                    Ok(conn) => {
                        *lock(&self.socket) = conn.shutdown_handle().ok();
                        transport = Some(conn);
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                        self.set_phase(MonitorPhase::Polling);
                        info!(bridge = %self.info, "monitor connected");
                    }
                    Err(e) => {
                        warn!(bridge = %self.info, attempt = failures + 1, error = %e, "monitor connect failed");
                        self.record_failure(&mut failures)?;
                        continue;
                    }
                }
            }
            let Some(conn) = transport.as_mut() else {
                continue;
            };

            match self.poll(conn) {
                Ok(devices) => {
                    failures = 0;
                    self.apply(devices);
                    self.sleeper.sleep(self.settings.poll_interval);
                }
                Err(e) => {
                    transport = None;
                    lock(&self.socket).take();
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!(bridge = %self.info, attempt = failures + 1, error = %e, "poll failed, reconnecting");
                    self.record_failure(&mut failures)?;
                }
            }
        }

        if let Some(mut conn) = transport {
            conn.close();
        }
        debug!(bridge = %self.info, "monitor loop exited");
        Ok(())
    }

    /// Count a failed connect or poll and wait before the next attempt.
    /// Only a successful poll resets the count.
    fn record_failure(&self, failures: &mut u32) -> Result<()> {
        *failures += 1;
        self.sleeper.sleep(self.settings.retry_delay);
        if *failures >= self.settings.max_attempts {
            return Err(BridgeError::MonitorUnreachable {
                host: self.info.host().to_string(),
                attempts: *failures,
            });
        }
        Ok(())
    }

    fn connect(&self) -> Result<Transport> {
        let mut transport = Transport::open(&self.info, Some(self.settings.timeout))?;
        control::handshake(&mut transport, &self.settings.connect_key, self.settings.timeout)?;
        Ok(transport)
    }

    fn poll(&self, transport: &mut Transport) -> Result<Vec<DeviceRecord>> {
        control::send_request(transport, &self.settings.poll_command, self.settings.timeout)?;
        let payload = control::read_frame(transport, self.settings.timeout)?.ok_or_else(|| {
            BridgeError::Transport(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "bridge closed the monitor connection",
            ))
        })?;
        Ok(parse_device_list(
            &decode_text(&payload),
            self.info.host(),
            self.info.port(),
        ))
    }

    /// Replace the roster and notify listeners of the differences.
    fn apply(&self, devices: Vec<DeviceRecord>) {
        let events = {
            let mut roster = lock(&self.roster);
            let events = diff_rosters(&roster, &devices);
            *roster = devices;
            events
        };
        if events.is_empty() {
            return;
        }

        let listeners = lock(&self.listeners).clone();
        for event in &events {
            match event {
                RosterEvent::Connected(d) => {
                    info!(device = %d, "device connected");
                    listeners.iter().for_each(|l| l.on_connected(d));
                }
                RosterEvent::Disconnected(d) => {
                    info!(device = %d, "device disconnected");
                    listeners.iter().for_each(|l| l.on_disconnected(d));
                }
                RosterEvent::Changed(d) => {
                    info!(device = %d, "device state changed");
                    listeners.iter().for_each(|l| l.on_changed(d));
                }
            }
        }
    }

    fn set_phase(&self, phase: MonitorPhase) {
        *lock(&self.phase) = phase;
    }

    /// Enter the registry this monitor came from, unless a different
    /// monitor already holds the host.
    fn register(self: &Arc<Self>) -> Result<()> {
        let Some(map) = self.registry.upgrade() else {
            return Ok(());
        };
        let mut map = lock(&map);
        let entry = map
            .entry(self.info.host().to_string())
            .or_insert_with(|| Arc::clone(self));
        if Arc::ptr_eq(entry, self) {
            Ok(())
        } else {
            Err(BridgeError::Config(format!(
                "another monitor is registered for {}",
                self.info.host()
            )))
        }
    }

    fn unregister(&self) {
        let Some(map) = self.registry.upgrade() else {
            return;
        };
        let mut map = lock(&map);
        let is_self = map
            .get(self.info.host())
            .is_some_and(|m| std::ptr::eq(Arc::as_ptr(m), self));
        if is_self {
            map.remove(self.info.host());
        }
    }
}

// ── MonitorRegistry ──────────────────────────────────────────────

/// Process-wide table of monitors keyed by bridge host. One mutex guards
/// get-or-create and removal. Construct one per process (or per test) and
/// hand it to whoever needs monitors.
#[derive(Clone)]
pub struct MonitorRegistry {
    monitors: Arc<MonitorMap>,
    sleeper: Arc<dyn Sleeper>,
}

impl Default for MonitorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::with_sleeper(Arc::new(ThreadSleeper))
    }

    /// Monitors created by this registry use `sleeper` for every delay.
    pub fn with_sleeper(sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            monitors: Arc::new(Mutex::new(HashMap::new())),
            sleeper,
        }
    }

    /// The monitor for `host`, created if absent. `port` and `settings`
    /// only apply on creation.
    pub fn get_or_create(&self, host: &str, port: u16, settings: MonitorSettings) -> Arc<DeviceMonitor> {
        let mut map = lock(&self.monitors);
        if let Some(existing) = map.get(host) {
            return Arc::clone(existing);
        }
        let monitor = Arc::new(DeviceMonitor::build(
            ConnectionInfo::new(host, port),
            settings,
            Arc::clone(&self.sleeper),
            Arc::downgrade(&self.monitors),
        ));
        map.insert(host.to_string(), Arc::clone(&monitor));
        monitor
    }

    pub fn get(&self, host: &str) -> Option<Arc<DeviceMonitor>> {
        lock(&self.monitors).get(host).cloned()
    }

    /// Remove and stop the monitor for `host`.
    pub fn remove(&self, host: &str) -> Option<Arc<DeviceMonitor>> {
        let removed = lock(&self.monitors).remove(host);
        if let Some(monitor) = &removed {
            monitor.stop();
        }
        removed
    }

    /// Stop every registered monitor.
    pub fn stop_all(&self) {
        let monitors: Vec<_> = lock(&self.monitors).drain().map(|(_, m)| m).collect();
        for monitor in monitors {
            monitor.stop();
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.monitors).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
