//! In-process fake bridge for integration tests.
//!
//! Speaks the wire protocol over localhost TCP on plain threads: the
//! handshake banner, control frames, device selection, shell commands
//! against an in-memory filesystem, the sync sub-protocol and the device
//! list.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use devlink_core::handshake::{HostHandshake, PeerHandshake};
use devlink_core::{BridgeConfig, BridgeClient, ConnectionInfo};

pub const SERIAL: &str = "SER123";

pub const DIR_MODE: u32 = 16877;
pub const FILE_MODE: u32 = 33188;
pub const SPECIAL_MODE: u32 = 41471;

// ── Remote filesystem ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Dir,
    File(Vec<u8>),
    Special,
}

/// How a scripted shell command behaves.
#[derive(Debug, Clone, Default)]
pub struct ShellScript {
    /// Output frames, sent in order.
    pub chunks: Vec<String>,
    /// Pause before each frame.
    pub gap: Duration,
    /// Keep the socket open after the last frame until the client leaves.
    pub hold_open: bool,
    /// Repeat the chunks until the client goes away.
    pub endless: bool,
    /// Send a frame header that promises more bytes than follow.
    pub truncated_frame: bool,
}

#[derive(Debug, Default)]
pub struct BridgeState {
    pub fs: BTreeMap<String, Node>,
    pub devices: HashSet<String>,
    pub scripts: HashMap<String, ShellScript>,
    /// Device list answers; the last one repeats.
    pub rosters: Vec<String>,
    pub roster_polls: usize,
    /// Remote paths whose RECV advertises an oversized chunk.
    pub oversized: HashSet<String>,
    /// Remote paths whose RECV answers FAIL with an absurd text length.
    pub oversized_failure: HashSet<String>,
    /// Remote paths whose RECV fails after the first chunk.
    pub fail_mid_pull: HashSet<String>,
    /// Close the connection after answering each device list request.
    pub hang_up_after_poll: bool,
    /// Close the connection instead of answering device list requests.
    pub drop_polls: bool,
    /// Every control request received, in order.
    pub requests: Vec<String>,
    pub connect_keys: Vec<String>,
    /// Every shell command received.
    pub shell_commands: Vec<String>,
    /// `(tag, length)` of each frame that followed a SEND.
    pub push_frames: Vec<(String, u32)>,
    /// Raw `SEND` payloads.
    pub send_specs: Vec<String>,
    pub reboots: usize,
}

impl BridgeState {
    fn seeded() -> Self {
        let mut state = Self::default();
        for dir in ["/", "/data", "/data/local", "/data/local/tmp"] {
            state.fs.insert(dir.to_string(), Node::Dir);
        }
        state.devices.insert(SERIAL.to_string());
        state.rosters.push("[Empty]".to_string());
        state
    }

    fn mode_of(&self, path: &str) -> (u32, u32) {
        match self.fs.get(&normalize(path)) {
            Some(Node::Dir) => (DIR_MODE, 4096),
            Some(Node::File(data)) => (FILE_MODE, data.len() as u32),
            Some(Node::Special) => (SPECIAL_MODE, 0),
            None => (0, 0),
        }
    }

    fn children(&self, dir: &str) -> Vec<String> {
        let dir = normalize(dir);
        self.fs
            .keys()
            .filter(|k| k.as_str() != "/" && parent(k) == dir)
            .map(|k| basename(k).to_string())
            .collect()
    }

    fn mkdir_p(&mut self, path: &str) {
        let path = normalize(path);
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            self.fs.entry(current.clone()).or_insert(Node::Dir);
        }
    }
}

pub fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() }
}

fn parent(path: &str) -> String {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/".to_string(),
        Some((head, _)) => head.to_string(),
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn unquote(arg: &str) -> String {
    let arg = arg.trim();
    match arg.strip_prefix('\'').and_then(|a| a.strip_suffix('\'')) {
        Some(inner) => inner.replace(r"'\''", "'"),
        None => arg.to_string(),
    }
}

// ── FakeBridge ───────────────────────────────────────────────────

pub struct FakeBridge {
    port: u16,
    state: Arc<Mutex<BridgeState>>,
    stopped: Arc<AtomicBool>,
}

impl FakeBridge {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(BridgeState::seeded()));
        let stopped = Arc::new(AtomicBool::new(false));

        let accept_state = Arc::clone(&state);
        let accept_stopped = Arc::clone(&stopped);
        thread::Builder::new()
            .name("fake-bridge".into())
            .spawn(move || {
                for stream in listener.incoming() {
                    if accept_stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    let Ok(stream) = stream else { continue };
                    let state = Arc::clone(&accept_state);
                    thread::spawn(move || {
                        let _ = serve(stream, &state);
                    });
                }
            })
            .unwrap();

        Self { port, state, stopped }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo::new("127.0.0.1", self.port)
    }

    /// Configuration pointing at this bridge with short timeouts.
    pub fn config(&self) -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.bridge.port = self.port;
        config.timeouts.command_ms = 5_000;
        config.timeouts.transfer_ms = 5_000;
        config.timeouts.write_pacing_ms = 0;
        config.monitor.poll_interval_ms = 20;
        config
    }

    pub fn client(&self) -> BridgeClient {
        BridgeClient::new(self.config())
    }

    pub fn state(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap()
    }

    pub fn put_file(&self, path: &str, data: &[u8]) {
        let mut state = self.state();
        state.mkdir_p(&parent(&normalize(path)));
        state.fs.insert(normalize(path), Node::File(data.to_vec()));
    }

    pub fn put_special(&self, path: &str) {
        let mut state = self.state();
        state.mkdir_p(&parent(&normalize(path)));
        state.fs.insert(normalize(path), Node::Special);
    }

    pub fn mkdir(&self, path: &str) {
        self.state().mkdir_p(path);
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.state().fs.get(&normalize(path)) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn script(&self, command: &str, script: ShellScript) {
        self.state().scripts.insert(command.to_string(), script);
    }

    pub fn set_rosters(&self, rosters: &[&str]) {
        let mut state = self.state();
        state.rosters = rosters.iter().map(|r| r.to_string()).collect();
        state.roster_polls = 0;
    }
}

impl Drop for FakeBridge {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = TcpStream::connect(("127.0.0.1", self.port));
    }
}

// ── Connection handling ──────────────────────────────────────────

fn serve(mut stream: TcpStream, state: &Mutex<BridgeState>) -> io::Result<()> {
    stream.set_nodelay(true)?;
    stream.write_all(&PeerHandshake::new("OHOS HDC", "fake-bridge").encode())?;
    let mut reply = [0u8; HostHandshake::SIZE];
    stream.read_exact(&mut reply)?;
    if let Ok(host) = HostHandshake::decode(&reply) {
        state.lock().unwrap().connect_keys.push(host.key);
    }

    loop {
        let Some(request) = read_control(&mut stream)? else {
            return Ok(());
        };
        state.lock().unwrap().requests.push(request.clone());

        if let Some(serial) = request.strip_prefix("host:transport:") {
            if state.lock().unwrap().devices.contains(serial) {
                stream.write_all(b"OKAY")?;
            } else {
                write_fail(&mut stream, &format!("device '{serial}' not found"))?;
            }
        } else if request == "list targets" {
            if state.lock().unwrap().drop_polls {
                return Ok(());
            }
            let text = {
                let mut s = state.lock().unwrap();
                let index = s.roster_polls.min(s.rosters.len().saturating_sub(1));
                s.roster_polls += 1;
                s.rosters.get(index).cloned().unwrap_or_default()
            };
            write_frame(&mut stream, text.as_bytes())?;
            if state.lock().unwrap().hang_up_after_poll {
                return Ok(());
            }
        } else if request == "target boot" {
            state.lock().unwrap().reboots += 1;
            stream.write_all(b"OKAY")?;
        } else if request == "sync:" {
            stream.write_all(b"OKAY")?;
            return serve_sync(&mut stream, state);
        } else if let Some(command) = request.strip_prefix("shell ") {
            stream.write_all(b"OKAY")?;
            return serve_shell(&mut stream, state, command);
        } else {
            write_fail(&mut stream, "unknown command")?;
        }
    }
}

fn read_control(stream: &mut TcpStream) -> io::Result<Option<String>> {
    let mut header = [0u8; 4];
    if stream.read_exact(&mut header).is_err() {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_be_bytes(header) as usize];
    stream.read_exact(&mut payload)?;
    while payload.last() == Some(&0) {
        payload.pop();
    }
    Ok(Some(String::from_utf8_lossy(&payload).into_owned()))
}

fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> io::Result<()> {
    stream.write_all(&(payload.len() as u32).to_be_bytes())?;
    stream.write_all(payload)
}

fn write_fail(stream: &mut TcpStream, message: &str) -> io::Result<()> {
    stream.write_all(b"FAIL")?;
    stream.write_all(format!("{:04x}", message.len()).as_bytes())?;
    stream.write_all(message.as_bytes())
}

// ── Shell ────────────────────────────────────────────────────────

fn serve_shell(stream: &mut TcpStream, state: &Mutex<BridgeState>, command: &str) -> io::Result<()> {
    let script = {
        let mut s = state.lock().unwrap();
        s.shell_commands.push(command.to_string());
        s.scripts.get(command).cloned()
    };
    if let Some(script) = script {
        return run_script(stream, &script);
    }

    let output = {
        let mut s = state.lock().unwrap();
        builtin_shell(&mut s, command)
    };
    if !output.is_empty() {
        write_frame(stream, output.as_bytes())?;
    }
    stream.shutdown(Shutdown::Both)
}

fn builtin_shell(state: &mut BridgeState, command: &str) -> String {
    let (verb, rest) = command.split_once(' ').unwrap_or((command, ""));
    match verb {
        "ls" => {
            let path = unquote(rest);
            match state.fs.get(&normalize(&path)) {
                Some(Node::Dir) => state.children(&path).iter().map(|c| format!("{c}\n")).collect(),
                Some(_) => format!("{path}\n"),
                None => format!("ls: {path}: No such file or directory\n"),
            }
        }
        "mkdir" => {
            state.mkdir_p(&unquote(rest.trim_start_matches("-p ")));
            String::new()
        }
        "rm" => {
            state.fs.remove(&normalize(&unquote(rest.trim_start_matches("-f "))));
            String::new()
        }
        "echo" => format!("{rest}\n"),
        "bm" if rest.starts_with("install") => "install bundle successfully.\n".to_string(),
        "bm" if rest.contains("'com.missing'") => {
            "error: failed to uninstall bundle, bundle not installed\n".to_string()
        }
        "bm" => format!(
            "uninstall bundle successfully. bundle: {}\n",
            unquote(rest.trim_start_matches("uninstall -n "))
        ),
        _ => format!("/bin/sh: {verb}: not found\n"),
    }
}

fn run_script(stream: &mut TcpStream, script: &ShellScript) -> io::Result<()> {
    if script.truncated_frame {
        stream.write_all(&100u32.to_be_bytes())?;
        stream.write_all(b"only ten b")?;
        return stream.shutdown(Shutdown::Both);
    }

    loop {
        for chunk in &script.chunks {
            thread::sleep(script.gap);
            if write_frame(stream, chunk.as_bytes()).is_err() {
                return Ok(());
            }
        }
        if !script.endless {
            break;
        }
    }

    if script.hold_open {
        let mut sink = [0u8; 64];
        while matches!(stream.read(&mut sink), Ok(n) if n > 0) {}
    }
    stream.shutdown(Shutdown::Both)
}

// ── Sync ─────────────────────────────────────────────────────────

fn le32(bytes: &[u8]) -> u32 {
    u32::from(bytes[0]) | u32::from(bytes[1]) << 8 | u32::from(bytes[2]) << 16 | u32::from(bytes[3]) << 24
}

fn write_sync(stream: &mut TcpStream, tag: &[u8; 4], value: u32, body: &[u8]) -> io::Result<()> {
    stream.write_all(tag)?;
    stream.write_all(&value.to_le_bytes())?;
    stream.write_all(body)
}

fn sync_fail(stream: &mut TcpStream, message: &str) -> io::Result<()> {
    write_sync(stream, b"FAIL", message.len() as u32, message.as_bytes())
}

fn serve_sync(stream: &mut TcpStream, state: &Mutex<BridgeState>) -> io::Result<()> {
    loop {
        let mut head = [0u8; 8];
        if stream.read_exact(&mut head).is_err() {
            return Ok(());
        }
        let mut body = vec![0u8; le32(&head[4..8]) as usize];
        stream.read_exact(&mut body)?;
        let arg = String::from_utf8_lossy(&body).into_owned();

        match &head[0..4] {
            b"STAT" => {
                let (mode, size) = state.lock().unwrap().mode_of(&arg);
                stream.write_all(b"STAT")?;
                stream.write_all(&mode.to_le_bytes())?;
                stream.write_all(&size.to_le_bytes())?;
                stream.write_all(&0u32.to_le_bytes())?;
            }
            b"RECV" => serve_recv(stream, state, &arg)?,
            b"SEND" => serve_send(stream, state, &arg)?,
            b"LIST" => {
                let (entries, found) = {
                    let s = state.lock().unwrap();
                    let found = matches!(s.fs.get(&normalize(&arg)), Some(Node::Dir));
                    let mut names = vec![".".to_string(), "..".to_string()];
                    names.extend(s.children(&arg));
                    let entries: Vec<(String, u32, u32)> = names
                        .into_iter()
                        .map(|n| {
                            let full = if n == "." || n == ".." {
                                normalize(&arg)
                            } else {
                                format!("{}/{n}", normalize(&arg).trim_end_matches('/'))
                            };
                            let (mode, size) = s.mode_of(&full);
                            (n, mode, size)
                        })
                        .collect();
                    (entries, found)
                };
                if !found {
                    sync_fail(stream, "No such file or directory")?;
                    continue;
                }
                for (name, mode, size) in entries {
                    stream.write_all(b"DENT")?;
                    stream.write_all(&mode.to_le_bytes())?;
                    stream.write_all(&size.to_le_bytes())?;
                    stream.write_all(&0u32.to_le_bytes())?;
                    stream.write_all(&(name.len() as u32).to_le_bytes())?;
                    stream.write_all(name.as_bytes())?;
                }
                stream.write_all(b"DONE")?;
                stream.write_all(&[0u8; 16])?;
            }
            b"QUIT" => return Ok(()),
            _ => sync_fail(stream, "unknown sync request")?,
        }
    }
}

fn serve_recv(stream: &mut TcpStream, state: &Mutex<BridgeState>, path: &str) -> io::Result<()> {
    let (node, oversized, oversized_failure, fail_mid_pull) = {
        let s = state.lock().unwrap();
        let path = normalize(path);
        (
            s.fs.get(&path).cloned(),
            s.oversized.contains(&path),
            s.oversized_failure.contains(&path),
            s.fail_mid_pull.contains(&path),
        )
    };
    if oversized {
        return write_sync(stream, b"DATA", 65_537, &[]);
    }
    if oversized_failure {
        return write_sync(stream, b"FAIL", u32::MAX, &[]);
    }
    match node {
        Some(Node::File(data)) => {
            for chunk in data.chunks(65_536) {
                write_sync(stream, b"DATA", chunk.len() as u32, chunk)?;
                if fail_mid_pull {
                    return sync_fail(stream, "I/O error while reading");
                }
            }
            write_sync(stream, b"DONE", 0, &[])
        }
        _ => sync_fail(stream, "No such file or directory"),
    }
}

fn serve_send(stream: &mut TcpStream, state: &Mutex<BridgeState>, spec: &str) -> io::Result<()> {
    let path = spec.rsplit_once(',').map(|(p, _)| p).unwrap_or(spec).to_string();
    state.lock().unwrap().send_specs.push(spec.to_string());

    let mut data = Vec::new();
    loop {
        let mut head = [0u8; 8];
        stream.read_exact(&mut head)?;
        let tag = String::from_utf8_lossy(&head[0..4]).into_owned();
        let value = le32(&head[4..8]);
        state.lock().unwrap().push_frames.push((tag.clone(), value));
        match tag.as_str() {
            "DATA" => {
                let mut chunk = vec![0u8; value as usize];
                stream.read_exact(&mut chunk)?;
                data.extend_from_slice(&chunk);
            }
            "DONE" => break,
            _ => return sync_fail(stream, "unexpected frame during SEND"),
        }
    }

    let mut s = state.lock().unwrap();
    if matches!(s.fs.get(&parent(&normalize(&path))), Some(Node::Dir)) {
        s.fs.insert(normalize(&path), Node::File(data));
        drop(s);
        write_sync(stream, b"OKAY", 0, &[])
    } else {
        drop(s);
        sync_fail(stream, "No such file or directory")
    }
}

// ── Receivers ────────────────────────────────────────────────────

/// Counts callbacks; optionally cancels a token after the first chunk.
#[derive(Default)]
pub struct CountingReceiver {
    pub chunks: Vec<String>,
    pub done: usize,
    pub errors: Vec<String>,
    pub cancel_after_first: Option<devlink_core::CancellationToken>,
}

impl devlink_core::Receiver for CountingReceiver {
    fn on_data(&mut self, text: &str) {
        self.chunks.push(text.to_string());
        if let Some(token) = &self.cancel_after_first {
            token.cancel();
        }
    }

    fn on_done(&mut self) {
        self.done += 1;
    }

    fn on_error(&mut self, message: &str) {
        self.errors.push(message.to_string());
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
