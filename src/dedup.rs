//! The dedup engine: streams a new snapshot's content log against every
//! older snapshot's, hard-linking byte-identical files together.
//!
//! The new snapshot's `+` entries are consumed in hash-sorted batches
//! (`NewBatchIter`) so only a bounded slice of the log lives in memory at
//! once; each batch is then checked against every older snapshot in turn.

use crate::compare;
use crate::log::{LogEntry, LogReader, Operation};
use crate::runner::Runner;
use crate::snapshot::Snapshot;
use std::collections::HashMap;
use std::path::PathBuf;

/// Matches the original tool's fixed batch size (`batched_as_dict(log, 5000)`
/// in the Python implementation); not currently exposed as a CLI knob since
/// nothing in the spec calls for tuning it per run.
pub const DEFAULT_BATCH_SIZE: usize = 5000;

/// One hash-contiguous slice of the new snapshot's write log: every `+`
/// entry whose hash falls in `[min_hash, max_hash]`, grouped by
/// `(hash, mtime)`. Batches from successive calls to `NewBatchIter::next_batch`
/// are hash-disjoint and strictly increasing, since the log is hash-sorted.
pub struct Batch {
    pub by_key: HashMap<(u64, String), Vec<PathBuf>>,
    pub min_hash: u64,
    pub max_hash: u64,
}

/// Walks a `+`-filtered `LogReader`, grouping consecutive entries by
/// `dedup_key` and emitting a `Batch` once `batch_size` distinct keys have
/// accumulated *and* the hash has moved on to a new value — batch
/// boundaries only ever fall between hashes, never inside one, so a single
/// hash's entries (which may carry several distinct mtimes) always land in
/// the same batch.
pub struct NewBatchIter {
    reader: LogReader,
    batch_size: usize,
    pending: Option<LogEntry>,
    done: bool,
}

impl NewBatchIter {
    pub fn new(reader: LogReader, batch_size: usize) -> Self {
        Self { reader, batch_size, pending: None, done: false }
    }

    pub fn next_batch(&mut self) -> Result<Option<Batch>, crate::error::BiuError> {
        if self.done {
            return Ok(None);
        }

        let first = match self.pending.take() {
            Some(e) => e,
            None => match self.reader.next()? {
                Some(e) => e,
                None => {
                    self.done = true;
                    return Ok(None);
                }
            },
        };

        let min_hash = first.hash.expect("NewBatchIter only sees write entries");
        let mut max_hash = min_hash;
        let mut current_hash = min_hash;
        let mut by_key: HashMap<(u64, String), Vec<PathBuf>> = HashMap::new();
        by_key.entry((min_hash, first.mtime.clone())).or_default().push(first.path);

        loop {
            let entry = match self.reader.next()? {
                Some(e) => e,
                None => {
                    self.done = true;
                    break;
                }
            };
            let hash = entry.hash.expect("NewBatchIter only sees write entries");

            if hash != current_hash && by_key.len() >= self.batch_size {
                self.pending = Some(entry);
                return Ok(Some(Batch { by_key, min_hash, max_hash }));
            }

            current_hash = hash;
            max_hash = hash;
            by_key.entry((hash, entry.mtime.clone())).or_default().push(entry.path);
        }

        Ok(Some(Batch { by_key, min_hash, max_hash }))
    }
}

/// Dedups `new_snapshot` against `old_snapshots` (oldest-first order
/// doesn't matter; every older snapshot is scanned against every batch
/// regardless), issuing `Runner::link` calls for every verified duplicate.
///
/// For each batch: every older snapshot's `+` entries with `hash` in
/// `[min_hash, max_hash]` are matched first by exact `dedup_key`
/// (`hash`+`mtime`), then — for candidates that survive a content
/// comparison unmatched — by bare `hash` alone, since `mtime` was only ever
/// a memory-bounding heuristic, not a correctness requirement. Whatever is
/// left in the batch once every older snapshot has been scanned is content
/// this dedup run has never seen before; `compare::group_duplicates` finds
/// duplicates among those paths themselves.
pub fn run_dedup(
    new_snapshot: &Snapshot,
    old_snapshots: &[&Snapshot],
    batch_size: usize,
    runner: &mut dyn Runner,
) -> anyhow::Result<()> {
    runner.comment(&format!(
        "deduping {} against {} earlier snapshot(s)",
        new_snapshot.name(),
        old_snapshots.len()
    ));

    let mut batcher = NewBatchIter::new(new_snapshot.open_log(Some(Operation::Write)), batch_size);
    let mut old_readers: Vec<LogReader> = old_snapshots
        .iter()
        .map(|s| s.open_log(Some(Operation::Write)))
        .collect();

    let mut batch_no = 0usize;
    while let Some(batch) = batcher.next_batch()? {
        batch_no += 1;
        log::debug!(
            "batch {}: {} distinct keys, hash range [{:016x}, {:016x}]",
            batch_no,
            batch.by_key.len(),
            batch.min_hash,
            batch.max_hash
        );

        let mut by_key = batch.by_key;
        let mut leftover_by_hash: HashMap<u64, Vec<PathBuf>> = HashMap::new();

        for reader in old_readers.iter_mut() {
            loop {
                let hash = match reader.peek()? {
                    Some(entry) => entry.hash.expect("old reader only sees write entries"),
                    None => break,
                };
                if hash > batch.max_hash {
                    break;
                }
                if hash < batch.min_hash {
                    reader.next()?;
                    continue;
                }

                let old_entry = reader.next()?.expect("peek just returned Some");
                let hash = old_entry.hash.expect("old reader only sees write entries");
                let key = (hash, old_entry.mtime.clone());

                let candidates = by_key.remove(&key).or_else(|| leftover_by_hash.remove(&hash));
                if let Some(candidates) = candidates {
                    let result = compare::find_duplicates_of(&old_entry.path, candidates)?;
                    for dup in &result.dups {
                        runner.link(&old_entry.path, dup)?;
                    }
                    if !result.non_dups.is_empty() {
                        leftover_by_hash.entry(hash).or_default().extend(result.non_dups);
                    }
                }
            }
            reader.suspend();
        }

        for paths in by_key.into_values().chain(leftover_by_hash.into_values()) {
            if paths.len() < 2 {
                continue;
            }
            for group in compare::group_duplicates(paths)? {
                if group.len() < 2 {
                    continue;
                }
                let hero = &group[0];
                for dup in &group[1..] {
                    runner.link(hero, dup)?;
                }
            }
        }
    }

    Ok(())
}
