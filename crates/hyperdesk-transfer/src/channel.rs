//! Framed TCP channel for bulk bytes.
//!
//! Wire format, all integers big-endian:
//!
//! ```text
//! [4 bytes]            name_length (u32)
//! [name_length bytes]  UTF-8 filename
//! [8 bytes]            total_size (u64)
//! [total_size bytes]   raw file bytes
//! ```
//!
//! The sender hashes the bytes as they leave; the receiver hashes as they
//! land. When nothing was lost the two checksums agree with the local
//! engine's destination hash.

use crate::limiter::pacing_delay;
use crate::{DEFAULT_CHUNK_SIZE, ProgressFn, TransferError, TransferResult};
use hyperdesk_core::models::ConflictRule;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Ceiling for the filename field; anything larger is a corrupt header.
const MAX_NAME_LEN: u32 = 4096;

/// Receive pull size ceiling (1 MiB).
const RECV_CHUNK: usize = 1024 * 1024;

/// Single-shot sender: binds an ephemeral port, serves exactly one transfer.
pub struct FileSender {
    host: String,
    port: u16,
    chunk_size: usize,
    listener: Option<TcpListener>,
}

impl FileSender {
    /// Create a sender that will bind `host` on an ephemeral port.
    #[must_use]
    pub fn new(host: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            host: host.into(),
            port: 0,
            chunk_size: chunk_size.max(1),
            listener: None,
        }
    }

    /// Create a sender on all interfaces with the default chunk size.
    #[must_use]
    pub fn ephemeral() -> Self {
        Self::new("0.0.0.0", DEFAULT_CHUNK_SIZE)
    }

    /// Bind the listener and return the assigned port.
    ///
    /// # Errors
    ///
    /// Returns an error if the bind fails.
    pub fn open(&mut self) -> Result<u16, TransferError> {
        let listener = TcpListener::bind((self.host.as_str(), self.port))?;
        self.port = listener.local_addr()?.port();
        self.listener = Some(listener);
        Ok(self.port)
    }

    /// The bound port, zero before `open()`.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept one connection and stream `source` through it.
    ///
    /// Returns the byte count and the SHA-256 of the bytes as sent.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::NotOpen`] before `open()`, or any socket or
    /// disk failure during the stream.
    pub fn send_file(
        &mut self,
        source: &Path,
        on_progress: Option<&ProgressFn>,
        max_bandwidth: Option<u64>,
    ) -> Result<TransferResult, TransferError> {
        let listener = self.listener.as_ref().ok_or(TransferError::NotOpen)?;
        let total_size = fs::metadata(source)?.len();
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or(TransferError::InvalidFilename)?;

        let (mut conn, addr) = listener.accept()?;
        tracing::debug!("bulk connection from {addr}");

        let name_bytes = name.as_bytes();
        conn.write_all(&(name_bytes.len() as u32).to_be_bytes())?;
        conn.write_all(name_bytes)?;
        conn.write_all(&total_size.to_be_bytes())?;

        let mut file = File::open(source)?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; self.chunk_size];
        let mut bytes_sent = 0u64;
        let start_time = Instant::now();
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            conn.write_all(&buffer[..read])?;
            hasher.update(&buffer[..read]);
            bytes_sent += read as u64;
            if let Some(callback) = on_progress {
                callback(bytes_sent, total_size);
            }
            if let Some(delay) = pacing_delay(bytes_sent, start_time.elapsed(), max_bandwidth) {
                std::thread::sleep(delay);
            }
        }
        conn.flush()?;

        Ok(TransferResult {
            bytes_copied: bytes_sent,
            checksum: hex::encode(hasher.finalize()),
        })
    }

    /// Release the listener. The sender is single-shot.
    pub fn close(&mut self) {
        self.listener = None;
    }
}

/// Outcome of a receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveResult {
    /// Where the bytes were written (the temp path when skipped)
    pub path: PathBuf,
    /// Bytes pulled off the socket
    pub bytes_received: u64,
    /// Lowercase hex SHA-256 of the received bytes, empty when skipped
    pub checksum: String,
    /// True when the conflict rule discarded the incoming file
    pub skipped: bool,
}

/// Connect to a sender and receive one framed file into `dest_dir`.
///
/// Conflict handling when `dest_dir/<filename>` already exists:
/// `PreferHost` overwrites, `PreferPeer` consumes the stream into a temp file
/// and deletes it (returning `skipped=true` with an empty checksum), and
/// `KeepBoth` lands the incoming file under a `_conflict_<timestamp>` name.
///
/// # Errors
///
/// Returns an error on connect failure, a corrupt header, or the peer
/// closing the stream before `total_size` bytes arrive.
pub fn receive_file(
    host: &str,
    port: u16,
    dest_dir: &Path,
    on_progress: Option<&ProgressFn>,
    conflict_rule: ConflictRule,
) -> Result<ReceiveResult, TransferError> {
    fs::create_dir_all(dest_dir)?;
    let mut conn = TcpStream::connect((host, port))?;

    let mut len_buf = [0u8; 4];
    read_exact(&mut conn, &mut len_buf)?;
    let name_len = u32::from_be_bytes(len_buf);
    if name_len == 0 || name_len > MAX_NAME_LEN {
        return Err(TransferError::InvalidFilename);
    }

    let mut name_buf = vec![0u8; name_len as usize];
    read_exact(&mut conn, &mut name_buf)?;
    let raw_name = String::from_utf8(name_buf).map_err(|_| TransferError::InvalidFilename)?;
    // Take the final component only so a hostile header cannot escape dest_dir.
    let filename = Path::new(&raw_name)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(TransferError::InvalidFilename)?
        .to_string();

    let mut size_buf = [0u8; 8];
    read_exact(&mut conn, &mut size_buf)?;
    let total_size = u64::from_be_bytes(size_buf);

    let (dest_path, discard) = match conflict_destination(&dest_dir.join(&filename), conflict_rule)
    {
        Some(path) => (path, false),
        None => (dest_dir.join(format!(".incoming_{filename}")), true),
    };

    let mut out = File::create(&dest_path)?;
    let mut hasher = Sha256::new();
    let mut bytes_received = 0u64;
    let mut buffer = vec![0u8; RECV_CHUNK];
    while bytes_received < total_size {
        let want = ((total_size - bytes_received) as usize).min(RECV_CHUNK);
        let read = conn.read(&mut buffer[..want])?;
        if read == 0 {
            drop(out);
            let _ = fs::remove_file(&dest_path);
            return Err(TransferError::Truncated {
                expected: total_size,
                received: bytes_received,
            });
        }
        out.write_all(&buffer[..read])?;
        hasher.update(&buffer[..read]);
        bytes_received += read as u64;
        if let Some(callback) = on_progress {
            callback(bytes_received, total_size);
        }
    }
    out.flush()?;
    drop(out);

    if discard {
        let _ = fs::remove_file(&dest_path);
        return Ok(ReceiveResult {
            path: dest_path,
            bytes_received,
            checksum: String::new(),
            skipped: true,
        });
    }
    Ok(ReceiveResult {
        path: dest_path,
        bytes_received,
        checksum: hex::encode(hasher.finalize()),
        skipped: false,
    })
}

/// Resolve where an incoming file should land, or `None` when the conflict
/// rule says the incoming bytes must not be retained.
#[must_use]
pub fn conflict_destination(
    dest_path: &Path,
    conflict_rule: ConflictRule,
) -> Option<PathBuf> {
    if !dest_path.exists() {
        return Some(dest_path.to_path_buf());
    }
    match conflict_rule {
        ConflictRule::PreferHost => Some(dest_path.to_path_buf()),
        ConflictRule::PreferPeer => None,
        ConflictRule::KeepBoth => Some(conflict_sibling(dest_path)),
    }
}

/// `name.ext` -> `name_conflict_<YYYYMMDD-HHMMSS>.ext` next to the original.
#[must_use]
pub fn conflict_sibling(dest_path: &Path) -> PathBuf {
    let stem = dest_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let suffix = dest_path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    dest_path.with_file_name(format!("{stem}_conflict_{timestamp}{suffix}"))
}

fn read_exact(conn: &mut TcpStream, buf: &mut [u8]) -> Result<(), TransferError> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = conn.read(&mut buf[filled..])?;
        if read == 0 {
            return Err(TransferError::Truncated {
                expected: buf.len() as u64,
                received: filled as u64,
            });
        }
        filled += read;
    }
    Ok(())
}
