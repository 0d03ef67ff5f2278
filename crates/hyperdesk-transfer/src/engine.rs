//! Chunked local copy with resume, pacing, retry, and a destination
//! checksum.

use crate::limiter::{RetryPolicy, pacing_delay, retry_delay};
use crate::{DEFAULT_CHUNK_SIZE, ProgressFn, TransferError, TransferResult};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Instant;

/// Knobs for a local copy.
#[derive(Debug, Clone)]
pub struct CopyOptions {
    /// Read/write chunk size in bytes
    pub chunk_size: usize,
    /// Continue a partial destination instead of truncating it
    pub resume: bool,
    /// Pacing ceiling in bytes/second, `None` for unlimited
    pub max_bandwidth: Option<u64>,
    /// What to do when an attempt fails
    pub retry_policy: RetryPolicy,
    /// Retries allowed after the first attempt
    pub max_retries: u32,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            resume: false,
            max_bandwidth: None,
            retry_policy: RetryPolicy::Exponential,
            max_retries: 3,
        }
    }
}

/// Copy `source` to `dest` in chunks, returning the byte count and the
/// SHA-256 of the finalized destination.
///
/// With `resume`, copying restarts at the destination's current length
/// (clipped to zero when the partial file is longer than the source, which
/// means the source shrank and the copy starts over). The progress callback
/// fires after every chunk with `(bytes_copied, total_size)`; `bytes_copied`
/// includes any resumed prefix and is monotonically non-decreasing within one
/// attempt.
///
/// Failures are retried per `options.retry_policy` until `max_retries` is
/// exhausted.
///
/// # Errors
///
/// Returns the last attempt's error once retries are exhausted, or
/// immediately under [`RetryPolicy::None`].
pub fn copy_with_checksum(
    source: &Path,
    dest: &Path,
    options: &CopyOptions,
    on_progress: Option<&ProgressFn>,
) -> Result<TransferResult, TransferError> {
    let mut attempt = 0u32;
    loop {
        match copy_once(source, dest, options, on_progress) {
            Ok(result) => return Ok(result),
            Err(error) => {
                attempt += 1;
                if options.retry_policy == RetryPolicy::None || attempt > options.max_retries {
                    return Err(error);
                }
                let delay = retry_delay(attempt, options.retry_policy);
                tracing::debug!(
                    "copy attempt {attempt} failed ({error}), retrying in {:.1}s",
                    delay.as_secs_f64()
                );
                std::thread::sleep(delay);
            }
        }
    }
}

fn copy_once(
    source: &Path,
    dest: &Path,
    options: &CopyOptions,
    on_progress: Option<&ProgressFn>,
) -> Result<TransferResult, TransferError> {
    let total_size = fs::metadata(source)?.len();

    let mut offset = 0u64;
    if options.resume {
        if let Ok(meta) = fs::metadata(dest) {
            offset = meta.len();
            if offset > total_size {
                offset = 0;
            }
        }
    }

    let mut source_file = File::open(source)?;
    let mut dest_file = if options.resume && offset > 0 {
        OpenOptions::new().append(true).open(dest)?
    } else {
        File::create(dest)?
    };
    if offset > 0 {
        source_file.seek(SeekFrom::Start(offset))?;
    }

    let mut bytes_copied = offset;
    let start_time = Instant::now();
    let mut buffer = vec![0u8; options.chunk_size];
    loop {
        let read = source_file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        dest_file.write_all(&buffer[..read])?;
        bytes_copied += read as u64;
        if let Some(callback) = on_progress {
            callback(bytes_copied, total_size);
        }
        if let Some(delay) = pacing_delay(bytes_copied, start_time.elapsed(), options.max_bandwidth)
        {
            std::thread::sleep(delay);
        }
    }
    dest_file.flush()?;
    drop(dest_file);

    let checksum = compute_sha256(dest, options.chunk_size)?;
    Ok(TransferResult {
        bytes_copied,
        checksum,
    })
}

/// Lowercase hex SHA-256 of a file, read end-to-end in `chunk_size` pulls.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn compute_sha256(path: &Path, chunk_size: usize) -> Result<String, TransferError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; chunk_size.max(1)];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn random_file(dir: &Path, name: &str, size: usize) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut payload = vec![0u8; size];
        rand::thread_rng().fill_bytes(&mut payload);
        fs::write(&path, &payload).unwrap();
        path
    }

    #[test]
    fn test_plain_copy_matches_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = random_file(dir.path(), "src.bin", 3 * 1024 * 1024 + 17);
        let dest = dir.path().join("dst.bin");

        let result =
            copy_with_checksum(&source, &dest, &CopyOptions::default(), None).unwrap();

        assert_eq!(result.bytes_copied, 3 * 1024 * 1024 + 17);
        assert_eq!(fs::read(&source).unwrap(), fs::read(&dest).unwrap());
        assert_eq!(
            result.checksum,
            compute_sha256(&source, DEFAULT_CHUNK_SIZE).unwrap()
        );
        assert_eq!(result.checksum.len(), 64);
    }

    #[test]
    fn test_resume_completes_partial_destination() {
        let dir = tempfile::tempdir().unwrap();
        let source = random_file(dir.path(), "src.bin", 5 * 1024 * 1024);
        let dest = dir.path().join("dst.bin");

        // First 3 MiB already landed.
        let partial = &fs::read(&source).unwrap()[..3 * 1024 * 1024];
        fs::write(&dest, partial).unwrap();

        let options = CopyOptions {
            resume: true,
            ..CopyOptions::default()
        };
        let result = copy_with_checksum(&source, &dest, &options, None).unwrap();

        assert_eq!(result.bytes_copied, 5 * 1024 * 1024);
        assert_eq!(fs::read(&source).unwrap(), fs::read(&dest).unwrap());
        assert_eq!(
            result.checksum,
            compute_sha256(&source, DEFAULT_CHUNK_SIZE).unwrap()
        );
    }

    #[test]
    fn test_resume_restarts_when_destination_outgrew_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = random_file(dir.path(), "src.bin", 1024);
        let dest = dir.path().join("dst.bin");
        fs::write(&dest, vec![0xAA; 4096]).unwrap();

        let options = CopyOptions {
            resume: true,
            ..CopyOptions::default()
        };
        let result = copy_with_checksum(&source, &dest, &options, None).unwrap();
        assert_eq!(result.bytes_copied, 1024);
        assert_eq!(fs::read(&source).unwrap(), fs::read(&dest).unwrap());
    }

    #[test]
    fn test_progress_is_monotonic_and_reaches_total() {
        let dir = tempfile::tempdir().unwrap();
        let source = random_file(dir.path(), "src.bin", 2 * 1024 * 1024 + 5);
        let dest = dir.path().join("dst.bin");

        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let options = CopyOptions {
            chunk_size: 512 * 1024,
            ..CopyOptions::default()
        };
        let seen_cb = seen.clone();
        copy_with_checksum(
            &source,
            &dest,
            &options,
            Some(&move |bytes, total| seen_cb.lock().unwrap().push((bytes, total))),
        )
        .unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0));
        assert_eq!(seen.last().unwrap().0, 2 * 1024 * 1024 + 5);
    }

    #[test]
    fn test_missing_source_fails_fast_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let options = CopyOptions {
            retry_policy: RetryPolicy::None,
            ..CopyOptions::default()
        };
        let err = copy_with_checksum(
            &dir.path().join("absent.bin"),
            &dir.path().join("dst.bin"),
            &options,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
    }

    #[test]
    fn test_bandwidth_limit_extends_elapsed_time() {
        let dir = tempfile::tempdir().unwrap();
        let source = random_file(dir.path(), "src.bin", 512 * 1024);
        let dest = dir.path().join("dst.bin");

        let options = CopyOptions {
            chunk_size: 128 * 1024,
            max_bandwidth: Some(1024 * 1024),
            ..CopyOptions::default()
        };
        let started = Instant::now();
        copy_with_checksum(&source, &dest, &options, None).unwrap();
        // 512 KiB at 1 MiB/s: at least half a second.
        assert!(started.elapsed().as_secs_f64() >= 0.45);
    }
}
