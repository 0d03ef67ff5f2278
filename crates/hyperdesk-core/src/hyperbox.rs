//! Hyperbox layout: the directory tree partitioning a device's shared
//! surface.
//!
//! ```text
//! <root>/
//!   inbox/      received files land here
//!   outbox/     local files here are auto-shared in mirror/copy modes
//!   requests/   files here create local-originated requests in approval mode
//!   demo_payload.bin
//! ```

use rand::RngCore;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Size of the reproducible demo payload.
pub const DEMO_PAYLOAD_SIZE: u64 = 2 * 1024 * 1024;

/// Owns the hyperbox root and its three subtrees.
#[derive(Debug, Clone)]
pub struct HyperboxManager {
    root: PathBuf,
    inbox: PathBuf,
    outbox: PathBuf,
    requests: PathBuf,
}

impl HyperboxManager {
    /// Open (and create if needed) a hyperbox at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the directories cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        let manager = Self {
            inbox: root.join("inbox"),
            outbox: root.join("outbox"),
            requests: root.join("requests"),
            root,
        };
        fs::create_dir_all(&manager.root)?;
        fs::create_dir_all(&manager.inbox)?;
        fs::create_dir_all(&manager.outbox)?;
        fs::create_dir_all(&manager.requests)?;
        Ok(manager)
    }

    /// Open the default hyperbox at `<cwd>/hyperbox`.
    ///
    /// # Errors
    ///
    /// Returns an error if the working directory is unavailable or the tree
    /// cannot be created.
    pub fn default_location() -> io::Result<Self> {
        Self::new(std::env::current_dir()?.join("hyperbox"))
    }

    /// The hyperbox root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where received files land.
    #[must_use]
    pub fn inbox(&self) -> &Path {
        &self.inbox
    }

    /// Auto-shared local files.
    #[must_use]
    pub fn outbox(&self) -> &Path {
        &self.outbox
    }

    /// Local request drop zone.
    #[must_use]
    pub fn requests(&self) -> &Path {
        &self.requests
    }

    /// Write a 2 MiB random demo payload if absent or size-mismatched, and
    /// return its path. Used for reproducible transfer testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be written.
    pub fn ensure_demo_file(&self) -> io::Result<PathBuf> {
        let demo_path = self.root.join("demo_payload.bin");
        if let Ok(meta) = fs::metadata(&demo_path) {
            if meta.len() == DEMO_PAYLOAD_SIZE {
                return Ok(demo_path);
            }
        }
        let mut payload = vec![0u8; DEMO_PAYLOAD_SIZE as usize];
        rand::thread_rng().fill_bytes(&mut payload);
        fs::write(&demo_path, &payload)?;
        Ok(demo_path)
    }
}
