//! File handshake with the downstream system
//!
//! The drop directory is shared with a consumer that has no native locking
//! primitive, so exclusivity is negotiated through marker files: the
//! remote raises `WaitERP` while it reads, we raise `WaitCIS` while we
//! write, and `ReadyCIS` tells the consumer a complete handoff is waiting.
//! Every transition is bounded; the wait for the remote to go idle polls
//! with an interval instead of spinning.

pub mod remote;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::error::{SyncError, SyncResult};
pub use remote::{RemoteStore, SftpStore};

/// Raised by the downstream system while it is reading the drop.
pub const WAIT_REMOTE_MARKER: &str = "WaitERP";
/// Raised by us to claim exclusive access while uploading.
pub const BUSY_MARKER: &str = "WaitCIS";
/// Signals a complete handoff to the downstream system.
pub const READY_MARKER: &str = "ReadyCIS";

/// Path segment substitution deriving the orders drop from the master-data
/// drop.
const MASTER_SEGMENT: &str = "MasterData";
const ORDERS_SEGMENT: &str = "Orders";

/// Files with this basename prefix route to the orders drop.
const ORDER_FILE_PREFIX: &str = "ORD";

const DATA_FILE_SUFFIX: &str = ".csv";

#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Wall-clock budget for the remote to clear its busy marker.
    pub ready_timeout: Duration,
    /// Delay between marker polls.
    pub poll_interval: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Protocol position, mostly for logging and post-mortem assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    Idle,
    WaitingForRemoteReady,
    MarkingBusy,
    Uploading,
    MarkingReady,
    Done,
    Failed,
}

#[derive(Debug, Default)]
pub struct HandshakeReport {
    pub uploaded: Vec<String>,
    pub skipped: Vec<String>,
    pub waited: Duration,
}

pub struct HandshakeUploader<R> {
    remote: R,
    config: HandshakeConfig,
    phase: HandshakePhase,
}

impl<R: RemoteStore> HandshakeUploader<R> {
    pub fn new(remote: R) -> Self {
        Self::with_config(remote, HandshakeConfig::default())
    }

    pub fn with_config(remote: R, config: HandshakeConfig) -> Self {
        Self {
            remote,
            config,
            phase: HandshakePhase::Idle,
        }
    }

    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// Run the full handshake: wait for the remote to go idle, claim the
    /// drop, upload the run's files, release the claim and signal ready.
    pub fn run(&mut self, local_drop: &Path, master_path: &str) -> SyncResult<HandshakeReport> {
        match self.drive(local_drop, master_path) {
            Ok(report) => {
                self.phase = HandshakePhase::Done;
                Ok(report)
            }
            Err(err) => {
                self.phase = HandshakePhase::Failed;
                Err(err)
            }
        }
    }

    fn drive(&mut self, local_drop: &Path, master_path: &str) -> SyncResult<HandshakeReport> {
        let orders_path = master_path.replace(MASTER_SEGMENT, ORDERS_SEGMENT);
        let mut report = HandshakeReport::default();

        self.phase = HandshakePhase::WaitingForRemoteReady;
        report.waited = self.wait_for_remote(master_path)?;

        self.phase = HandshakePhase::MarkingBusy;
        self.put_marker(master_path, BUSY_MARKER)?;
        self.put_marker(&orders_path, BUSY_MARKER)?;

        self.phase = HandshakePhase::Uploading;
        for file in data_files(local_drop)? {
            let name = file
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            let dest_base = if name.starts_with(ORDER_FILE_PREFIX) {
                &orders_path
            } else {
                master_path
            };
            let dest = format!("{dest_base}{name}");

            match self.remote.upload_file(&file, &dest) {
                Ok(()) => {
                    info!("{} Loaded", name);
                    report.uploaded.push(name);
                }
                Err(e) => {
                    // Deliberately non-fatal: one bad file must not leave
                    // the drop claimed forever.
                    let err = SyncError::HandshakeUpload {
                        file: name.clone(),
                        message: e.to_string(),
                    };
                    warn!("{}", err);
                    report.skipped.push(name);
                }
            }
        }

        self.phase = HandshakePhase::MarkingReady;
        self.drop_marker(master_path, BUSY_MARKER)?;
        self.drop_marker(&orders_path, BUSY_MARKER)?;
        self.put_marker(master_path, READY_MARKER)?;
        self.put_marker(&orders_path, READY_MARKER)?;

        info!(
            "Handshake complete: {} uploaded, {} skipped",
            report.uploaded.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    /// Poll until the remote's busy marker is gone or the wall-clock budget
    /// runs out.
    fn wait_for_remote(&self, master_path: &str) -> SyncResult<Duration> {
        let marker = format!("{master_path}{WAIT_REMOTE_MARKER}");
        let start = Instant::now();
        loop {
            let busy = self
                .remote
                .exists(&marker)
                .map_err(|e| SyncError::HandshakeMarker {
                    marker: marker.clone(),
                    message: e.to_string(),
                })?;
            if !busy {
                return Ok(start.elapsed());
            }
            if start.elapsed() >= self.config.ready_timeout {
                warn!("unable to upload, remote still busy");
                return Err(SyncError::HandshakeTimeout {
                    waited_secs: start.elapsed().as_secs(),
                });
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }

    fn put_marker(&self, base: &str, marker: &str) -> SyncResult<()> {
        let path = format!("{base}{marker}");
        self.remote
            .upload_bytes(b"", &path)
            .map_err(|e| SyncError::HandshakeMarker {
                marker: path.clone(),
                message: e.to_string(),
            })
    }

    fn drop_marker(&self, base: &str, marker: &str) -> SyncResult<()> {
        let path = format!("{base}{marker}");
        self.remote
            .delete(&path)
            .map_err(|e| SyncError::HandshakeMarker {
                marker: path.clone(),
                message: e.to_string(),
            })
    }
}

/// Data files for the current run, sorted by name for deterministic upload
/// order. Only `.csv` files take part in the handoff.
fn data_files(local_drop: &Path) -> SyncResult<Vec<PathBuf>> {
    let entries = std::fs::read_dir(local_drop).map_err(|e| {
        SyncError::config(format!(
            "cannot enumerate local drop {}: {e}",
            local_drop.display()
        ))
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.ends_with(DATA_FILE_SUFFIX))
                    .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}
