//! The snapshot registry: enumerating snapshot directories under a backup
//! root, parsing their timestamps, and yielding them in chronological order.

use crate::error::BiuError;
use crate::log::{LogReader, Operation};
use crate::parsing::parse_snapshot_name;
use chrono::{DateTime, Local};
use std::cell::Cell;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const LOG_FILE_NAME: &str = "backup.log";

/// A dated snapshot directory. Immutable after construction except for the
/// `should_keep` flag, which the retention planner sets on its single pass
/// (see spec's design note on keeping Snapshot itself value-like).
#[derive(Debug, Clone)]
pub struct Snapshot {
    directory: PathBuf,
    creation_time: DateTime<Local>,
    should_keep: Cell<bool>,
}

impl Snapshot {
    pub fn new(directory: PathBuf, creation_time: DateTime<Local>) -> Self {
        Self {
            directory,
            creation_time,
            should_keep: Cell::new(false),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn creation_time(&self) -> DateTime<Local> {
        self.creation_time
    }

    pub fn log_path(&self) -> PathBuf {
        self.directory.join(LOG_FILE_NAME)
    }

    /// A snapshot is *complete* iff its log exists; whether it's well-formed
    /// is only discovered by actually reading it (surfaced as
    /// `BiuError::CorruptLog` from the reader).
    pub fn has_log(&self) -> bool {
        self.log_path().is_file()
    }

    pub fn open_log(&self, filter: Option<Operation>) -> LogReader {
        LogReader::new(self.directory.clone(), filter)
    }

    pub fn should_keep(&self) -> bool {
        self.should_keep.get()
    }

    pub fn mark_keep(&self) {
        self.should_keep.set(true);
    }

    pub fn name(&self) -> &str {
        self.directory.file_name().and_then(|n| n.to_str()).unwrap_or_default()
    }
}

/// Scans the direct children of `root`: directories not starting with `.`
/// whose name parses per the snapshot timestamp grammar become `Snapshot`s,
/// sorted ascending by creation time (ties broken by directory name).
/// Unparseable names are reported as warnings, not fatal errors.
pub fn list_snapshots(root: &Path) -> io::Result<(Vec<Snapshot>, Vec<BiuError>)> {
    let mut snapshots = Vec::new();
    let mut warnings = Vec::new();

    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => continue,
        };
        if name.starts_with('.') {
            continue;
        }

        match parse_snapshot_name(&name) {
            Some(creation_time) => snapshots.push(Snapshot::new(path, creation_time)),
            None => {
                log::warn!(
                    "directory {:?} in the backup path can't be parsed to a date/time; ignoring",
                    name
                );
                warnings.push(BiuError::UnparseableSnapshotName { name });
            }
        }
    }

    snapshots.sort_by(|a, b| {
        a.creation_time
            .cmp(&b.creation_time)
            .then_with(|| a.directory.cmp(&b.directory))
    });

    Ok((snapshots, warnings))
}
