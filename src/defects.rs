//! Defect log.
//!
//! Duplicate keys, skipped records, and unresolved references do not
//! abort ingestion; they are appended as JSON lines to the sibling
//! `.log` file next to the snapshot, echoed at WARN, and counted.
//! Logging never fails ingestion: a write error downgrades to a counter.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

/// One defect observation.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Defect {
    /// Two entities claimed the same index key; the later writer won.
    DuplicateKey {
        index: &'static str,
        key: String,
        winner_dn: String,
        loser_dn: String,
    },
    /// A raw record could not be parsed and was skipped.
    RecordSkipped { dn: String, reason: String },
    /// A forward reference never resolved during a full pass.
    UnresolvedReference {
        referrer_dn: String,
        target_dn: String,
        link: &'static str,
    },
}

impl Defect {
    fn kind(&self) -> &'static str {
        match self {
            Defect::DuplicateKey { .. } => "duplicate_key",
            Defect::RecordSkipped { .. } => "record_skipped",
            Defect::UnresolvedReference { .. } => "unresolved_reference",
        }
    }
}

/// Append-only JSON-lines defect sink.
pub struct DefectLog {
    file: Mutex<Option<File>>,
    path: Option<PathBuf>,
    reported: AtomicU64,
    write_failures: AtomicU64,
}

impl DefectLog {
    /// Open (append) the defect file; an unopenable file degrades to a
    /// memory-only counter rather than failing startup.
    pub fn open(path: &Path) -> Self {
        let file = OpenOptions::new().create(true).append(true).open(path);
        match file {
            Ok(file) => Self {
                file: Mutex::new(Some(file)),
                path: Some(path.to_path_buf()),
                reported: AtomicU64::new(0),
                write_failures: AtomicU64::new(0),
            },
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "defect log unavailable");
                Self::disabled()
            }
        }
    }

    /// Counter-only log (tests, embedders without a data dir).
    pub fn disabled() -> Self {
        Self {
            file: Mutex::new(None),
            path: None,
            reported: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
        }
    }

    pub fn report(&self, defect: Defect) {
        self.reported.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(kind = defect.kind(), defect = ?defect, "directory defect");

        let mut guard = self.file.lock().expect("defect log lock poisoned");
        if let Some(file) = guard.as_mut() {
            let mut line = match serde_json::to_vec(&defect) {
                Ok(line) => line,
                Err(err) => {
                    tracing::warn!(%err, "defect serialization failed");
                    self.write_failures.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            };
            line.push(b'\n');
            if let Err(err) = file.write_all(&line) {
                self.write_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%err, "defect log write failed");
            }
        }
    }

    pub fn reported_count(&self) -> u64 {
        self.reported.load(Ordering::Relaxed)
    }

    pub fn write_failure_count(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
