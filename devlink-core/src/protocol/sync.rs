//! File sync sub-protocol: STAT, RECV, SEND, LIST over a selected device.
//!
//! # Wire Protocol
//!
//! ```text
//! Host   ──[u32_be len | "sync:\0"]──────────────────► Bridge
//! Bridge ──["OKAY"]──────────────────────────────────► Host
//!
//! ## STAT
//! Host   ──["STAT" | len | path]─────────────────────► Bridge
//! Bridge ──["STAT" | mode | size | mtime]────────────► Host
//!
//! ## Pull
//! Host   ──["RECV" | len | path]─────────────────────► Bridge
//! Bridge ──["DATA" | len | bytes]────────────────────► Host   (repeated, len ≤ 64 KiB)
//! Bridge ──["DONE" | 0]──────────────────────────────► Host
//!
//! ## Push
//! Host   ──["SEND" | len | "path,mode"]──────────────► Bridge
//! Host   ──["DATA" | len | bytes]────────────────────► Bridge (repeated, len ≤ 64 KiB)
//! Host   ──["DONE" | mtime]──────────────────────────► Bridge
//! Bridge ──["OKAY" | 0] or ["FAIL" | len | text]─────► Host
//! ```
//!
//! Lengths after a sync tag are least-significant byte first. A failed pull
//! leaves whatever was already written on disk; callers that need atomic
//! results write to a temporary name and rename.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, BytesMut};
use tracing::{debug, info, trace};

use crate::codec::control::decode_text;
use crate::codec::sync::{StatReply, encode_data_frame, encode_path_request};
use crate::codec::{
    ModeValue, REMOTE_PATH_MAX_LENGTH, SYNC_DATA_MAX, SYNC_DIAGNOSTIC_MAX, SyncHeader, SyncTag,
    decode_sync_le32, word_at,
};
use crate::error::{BridgeError, Result};
use crate::network::{ConnectionInfo, Transport};
use crate::protocol::control;
use crate::protocol::shell::{CollectingReceiver, DEFAULT_COMMAND_TIMEOUT, ShellRequest, ShellSession};

/// Default timeout for transfers.
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_millis(120_000);

/// Request that switches a selected connection into sync mode.
pub const SYNC_REQUEST: &str = "sync:";

/// Mode announced for pushed files (regular file, rw-r--r--).
pub const DEFAULT_PUSH_MODE: u32 = 0o100_644;

// ── TransferPlan ──────────────────────────────────────────────────

/// One step of a push or pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    pub local: PathBuf,
    pub remote: String,
    /// Nest the source's name under the destination.
    pub is_create: bool,
}

// ── RemoteEntry ───────────────────────────────────────────────────

/// A directory entry reported by `LIST`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub mode: u32,
    pub size: u32,
    pub mtime: u32,
}

impl RemoteEntry {
    /// Wire size of a `DENT`/`DONE` record before the name.
    pub const HEADER_SIZE: usize = 20;

    pub fn kind(&self) -> ModeValue {
        ModeValue::classify(self.mode)
    }
}

// ── SyncChannel ───────────────────────────────────────────────────

/// A sync session on its own connection.
#[derive(Debug)]
pub struct SyncChannel {
    info: ConnectionInfo,
    serial: String,
    connect_key: String,
    transport: Transport,
    timeout: Duration,
    shell_timeout: Duration,
}

impl SyncChannel {
    /// Connect, select `serial` and enter sync mode. The serial doubles as
    /// the handshake connect key.
    pub fn open(info: &ConnectionInfo, serial: &str, timeout: Duration) -> Result<Self> {
        Self::open_with_key(info, serial, serial, timeout)
    }

    pub fn open_with_key(
        info: &ConnectionInfo,
        serial: &str,
        connect_key: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let mut transport = control::connect_device(info, serial, connect_key, timeout)?;
        control::send_request(&mut transport, SYNC_REQUEST, timeout)?;
        control::read_response(&mut transport, false, timeout)?.into_result()?;
        debug!(serial, "sync session open");

        Ok(Self {
            info: info.clone(),
            serial: serial.to_string(),
            connect_key: connect_key.to_string(),
            transport,
            timeout,
            shell_timeout: DEFAULT_COMMAND_TIMEOUT,
        })
    }

    /// Timeout for the helper shell commands (`ls`, `mkdir -p`).
    pub fn with_shell_timeout(mut self, timeout: Duration) -> Self {
        self.shell_timeout = timeout;
        self
    }

    /// End the session and close the connection.
    pub fn close(mut self) {
        self.transport.close();
    }

    // ── STAT ─────────────────────────────────────────────────────

    /// Ask the device what `remote` is.
    pub fn read_mode(&mut self, remote: &str) -> Result<ModeValue> {
        let request = encode_path_request(SyncTag::Stat, remote)?;
        self.transport.write_all(&request, self.timeout)?;

        let mut reply = self.read_reply_head()?;
        let rest = self
            .transport
            .read_exact(StatReply::SIZE - SyncHeader::SIZE, self.timeout, "stat reply")?;
        reply.extend_from_slice(&rest);
        let stat = StatReply::decode(&reply)?;
        trace!(remote, mode = stat.mode, "stat");
        Ok(ModeValue::classify(stat.mode))
    }

    // ── Pull ─────────────────────────────────────────────────────

    /// Copy `remote` (file or directory) to `local`.
    ///
    /// With `create_top`, the remote basename is created under `local`.
    /// Special files are skipped.
    pub fn pull_file(&mut self, remote: &str, local: &Path, create_top: bool) -> Result<()> {
        self.pull(TransferPlan {
            local: local.to_path_buf(),
            remote: remote.to_string(),
            is_create: create_top,
        })
    }

    fn pull(&mut self, plan: TransferPlan) -> Result<()> {
        match self.read_mode(&plan.remote)? {
            ModeValue::Missing => Err(BridgeError::RemoteNotFound(plan.remote)),
            ModeValue::Special => {
                info!(remote = %plan.remote, "skipping special file");
                Ok(())
            }
            ModeValue::Directory(_) => {
                let target = if plan.is_create {
                    plan.local.join(remote_basename(&plan.remote))
                } else {
                    plan.local.clone()
                };
                fs::create_dir_all(&target).map_err(|e| BridgeError::local(&target, e))?;

                for child in self.list_names(&plan.remote)? {
                    self.pull(TransferPlan {
                        local: target.clone(),
                        remote: join_remote(&plan.remote, &child),
                        is_create: true,
                    })?;
                }
                Ok(())
            }
            ModeValue::Regular(_) => {
                let target = if plan.is_create || plan.local.is_dir() {
                    plan.local.join(remote_basename(&plan.remote))
                } else {
                    plan.local.clone()
                };
                self.receive_file(&plan.remote, &target)
            }
        }
    }

    fn receive_file(&mut self, remote: &str, local: &Path) -> Result<()> {
        let request = encode_path_request(SyncTag::Recv, remote)?;
        self.transport.write_all(&request, self.timeout)?;

        let mut file = File::create(local).map_err(|e| BridgeError::local(local, e))?;
        let mut total = 0usize;

        loop {
            let raw = self.transport.read(SyncHeader::SIZE, self.timeout)?;
            if raw.len() < SyncHeader::SIZE {
                return Err(BridgeError::sync("truncated sync header during pull", raw));
            }
            let header = SyncHeader::decode(&raw)?;
            match header.tag {
                SyncTag::Data => {
                    let len = header.length as usize;
                    if len > SYNC_DATA_MAX {
                        return Err(BridgeError::sync(
                            format!("DATA chunk of {len} bytes exceeds {SYNC_DATA_MAX}"),
                            raw,
                        ));
                    }
                    let chunk = self.transport.read_exact(len, self.timeout, "sync data")?;
                    file.write_all(&chunk).map_err(|e| BridgeError::local(local, e))?;
                    total += len;
                }
                SyncTag::Done => break,
                SyncTag::Fail => {
                    let message = self.read_message(header.length as usize)?;
                    return Err(remote_failure(message));
                }
                other => {
                    return Err(BridgeError::sync(format!("unexpected {other} during pull"), raw));
                }
            }
        }

        file.flush().map_err(|e| BridgeError::local(local, e))?;
        debug!(remote, local = %local.display(), bytes = total, "pulled");
        Ok(())
    }

    // ── Push ─────────────────────────────────────────────────────

    /// Copy `local` (file or directory) to `remote`.
    ///
    /// With `create_top`, the local basename is created under `remote`.
    /// A file pushed onto an existing remote directory lands inside it.
    pub fn push_file(&mut self, local: &Path, remote: &str, create_top: bool) -> Result<()> {
        self.push(TransferPlan {
            local: local.to_path_buf(),
            remote: remote.to_string(),
            is_create: create_top,
        })
    }

    fn push(&mut self, plan: TransferPlan) -> Result<()> {
        let meta = fs::metadata(&plan.local).map_err(|e| BridgeError::local(&plan.local, e))?;
        let name = local_basename(&plan.local);

        if meta.is_dir() {
            let root = if plan.is_create {
                join_remote(&plan.remote, &name)
            } else {
                plan.remote.clone()
            };
            self.make_remote_dir(&root)?;

            let mut children = fs::read_dir(&plan.local)
                .map_err(|e| BridgeError::local(&plan.local, e))?
                .map(|entry| entry.map(|e| e.path()))
                .collect::<std::io::Result<Vec<_>>>()
                .map_err(|e| BridgeError::local(&plan.local, e))?;
            children.sort();

            for child in children {
                let meta = fs::metadata(&child).map_err(|e| BridgeError::local(&child, e))?;
                if meta.is_dir() {
                    self.push(TransferPlan {
                        local: child,
                        remote: root.clone(),
                        is_create: true,
                    })?;
                } else if meta.is_file() {
                    let target = join_remote(&root, &local_basename(&child));
                    self.send_file(&child, &target)?;
                } else {
                    info!(local = %child.display(), "skipping special file");
                }
            }
            Ok(())
        } else {
            let target = if plan.is_create || self.read_mode(&plan.remote)?.is_directory() {
                join_remote(&plan.remote, &name)
            } else {
                plan.remote.clone()
            };
            self.send_file(&plan.local, &target)
        }
    }

    fn send_file(&mut self, local: &Path, remote: &str) -> Result<()> {
        let request = encode_send_request(remote, DEFAULT_PUSH_MODE)?;
        let mut file = File::open(local).map_err(|e| BridgeError::local(local, e))?;
        self.transport.write_all(&request, self.timeout)?;

        let mut buf = vec![0u8; SYNC_DATA_MAX];
        let mut chunks = 0usize;
        loop {
            let n = fill_chunk(&mut file, &mut buf).map_err(|e| BridgeError::local(local, e))?;
            if n == 0 {
                break;
            }
            self.transport.write_all(&encode_data_frame(&buf[..n]), self.timeout)?;
            chunks += 1;
        }

        let mtime = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        self.transport
            .write_all(&SyncHeader::new(SyncTag::Done, mtime).encode(), self.timeout)?;

        let raw = self.transport.read(SyncHeader::SIZE, self.timeout)?;
        if raw.len() < SyncHeader::SIZE {
            return Err(BridgeError::sync("no acknowledgement after push", raw));
        }
        let header = SyncHeader::decode(&raw)?;
        match header.tag {
            SyncTag::Okay => {
                debug!(local = %local.display(), remote, chunks, "pushed");
                Ok(())
            }
            SyncTag::Fail => {
                let message = self.read_message(header.length as usize)?;
                Err(remote_failure(message))
            }
            other => Err(BridgeError::sync(format!("unexpected {other} after push"), raw)),
        }
    }

    // ── LIST ─────────────────────────────────────────────────────

    /// List a remote directory through the sync `LIST` request.
    pub fn list_dir(&mut self, remote: &str) -> Result<Vec<RemoteEntry>> {
        let request = encode_path_request(SyncTag::List, remote)?;
        self.transport.write_all(&request, self.timeout)?;

        let mut entries = Vec::new();
        loop {
            let mut raw = self.read_reply_head()?;
            let rest = self.transport.read_exact(
                RemoteEntry::HEADER_SIZE - SyncHeader::SIZE,
                self.timeout,
                "directory entry",
            )?;
            raw.extend_from_slice(&rest);
            match SyncTag::try_from(word_at(&raw, 0)) {
                Ok(SyncTag::Dent) => {
                    let name_len = decode_sync_le32(word_at(&raw, 16)) as usize;
                    if name_len > REMOTE_PATH_MAX_LENGTH {
                        return Err(BridgeError::sync(
                            format!("entry name of {name_len} bytes exceeds {REMOTE_PATH_MAX_LENGTH}"),
                            raw,
                        ));
                    }
                    let name = self.transport.read_exact(name_len, self.timeout, "entry name")?;
                    let name = decode_text(&name);
                    if name == "." || name == ".." {
                        continue;
                    }
                    entries.push(RemoteEntry {
                        name,
                        mode: decode_sync_le32(word_at(&raw, 4)),
                        size: decode_sync_le32(word_at(&raw, 8)),
                        mtime: decode_sync_le32(word_at(&raw, 12)),
                    });
                }
                Ok(SyncTag::Done) => break,
                _ => return Err(BridgeError::sync("unexpected tag in directory listing", raw)),
            }
        }
        Ok(entries)
    }

    // ── Helpers ──────────────────────────────────────────────────

    /// Child names of a remote directory, via a shell `ls` on a fresh
    /// connection.
    fn list_names(&mut self, remote: &str) -> Result<Vec<String>> {
        let output = self.run_shell(&format!("ls {}", shell_quote(remote)))?;
        Ok(parse_ls_output(&output))
    }

    fn make_remote_dir(&mut self, remote: &str) -> Result<()> {
        self.run_shell(&format!("mkdir -p {}", shell_quote(remote)))?;
        Ok(())
    }

    fn run_shell(&self, command: &str) -> Result<String> {
        let mut receiver = CollectingReceiver::new();
        let request = ShellRequest::new(command).with_timeout(self.shell_timeout);
        ShellSession::new(self.info.clone(), self.serial.clone())
            .with_connect_key(self.connect_key.clone())
            .execute(&request, &mut receiver)?;
        Ok(receiver.into_output())
    }

    /// Read the first 8 bytes of a fixed-size reply. A FAIL is consumed
    /// whole and returned as an error.
    fn read_reply_head(&mut self) -> Result<Vec<u8>> {
        let head = self.transport.read(SyncHeader::SIZE, self.timeout)?;
        if head.len() < SyncHeader::SIZE {
            return Err(BridgeError::sync("truncated sync reply", head));
        }
        if head.starts_with(SyncTag::Fail.as_bytes()) {
            let len = decode_sync_le32(word_at(&head, 4)) as usize;
            let message = self.read_message(len)?;
            return Err(remote_failure(message));
        }
        Ok(head)
    }

    fn read_message(&mut self, len: usize) -> Result<Vec<u8>> {
        if len > SYNC_DIAGNOSTIC_MAX {
            return Err(BridgeError::sync(
                format!("failure text of {len} bytes exceeds {SYNC_DIAGNOSTIC_MAX}"),
                Vec::new(),
            ));
        }
        self.transport.read_exact(len, self.timeout, "failure text")
    }
}

// ── Free helpers ──────────────────────────────────────────────────

/// Build the `SEND` request: `"<remote>,<mode>"`.
pub fn encode_send_request(remote: &str, mode: u32) -> Result<bytes::Bytes> {
    if remote.len() > REMOTE_PATH_MAX_LENGTH {
        return Err(BridgeError::RemotePathTooLong {
            len: remote.len(),
            max: REMOTE_PATH_MAX_LENGTH,
        });
    }
    let spec = format!("{remote},{mode}");
    let mut buf = BytesMut::with_capacity(SyncHeader::SIZE + spec.len());
    buf.put_slice(&SyncHeader::new(SyncTag::Send, spec.len() as u32).encode());
    buf.put_slice(spec.as_bytes());
    Ok(buf.freeze())
}

fn remote_failure(message: Vec<u8>) -> BridgeError {
    let text = decode_text(&message);
    BridgeError::sync(format!("device reported failure: {text}"), message)
}

/// Read until `buf` is full or the file ends.
fn fill_chunk(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Last path component of a remote (always `/`-separated) path.
pub fn remote_basename(remote: &str) -> &str {
    remote
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(remote)
}

/// Join a remote directory and a child name with exactly one `/`.
pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

fn local_basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Single-quote `arg` for the device shell.
pub fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Child names from `ls` output, one per line, without `.` and `..`.
pub fn parse_ls_output(output: &str) -> Vec<String> {
    output
        .lines()
        .map(|line| line.trim_end_matches('\r').trim())
        .filter(|line| !line.is_empty() && *line != "." && *line != "..")
        .map(str::to_string)
        .collect()
}
