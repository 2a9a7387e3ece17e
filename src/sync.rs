//! The snapshot creation collaborator: seeds a new snapshot directory from
//! the previous one, runs rsync to bring it up to date, and normalizes
//! rsync's own change vocabulary into this crate's `backup.log` grammar.
//!
//! This module's own correctness isn't re-litigated by the dedup engine:
//! the engine trusts the log's hash column and re-verifies byte-for-byte
//! before ever linking anything.

use crate::parsing::format_snapshot_name;
use crate::runner::Runner;
use crate::snapshot::{Snapshot, LOG_FILE_NAME};
use anyhow::{bail, Context, Result};
use chrono::Local;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub backup_path: PathBuf,
    pub source_paths: Vec<PathBuf>,
    /// Whether to pass `--archive` to rsync. Off by default: archive mode
    /// preserves ownership/permissions this crate has no use for and
    /// copies symlinks instead of following them.
    pub archive_mode: bool,
}

/// Creates a new snapshot under `opts.backup_path`, named for the current
/// instant, hard-link-seeded from `previous` when one exists, then runs
/// rsync and writes the resulting `backup.log`. Returns the new snapshot's
/// directory.
pub fn create_snapshot(opts: &BackupOptions, previous: Option<&Snapshot>, runner: &mut dyn Runner) -> Result<PathBuf> {
    let target = opts.backup_path.join(format_snapshot_name(Local::now()));
    if target.is_dir() {
        bail!("backup target directory {:?} already exists", target);
    }

    match previous {
        Some(prev) => {
            runner
                .run("cp", &["-al", &prev.directory().to_string_lossy(), &target.to_string_lossy()])
                .with_context(|| format!("seeding {:?} from {:?}", target, prev.directory()))?;
            // The seed carries the previous snapshot's log; it describes
            // the previous tree, not this one, so it must go.
            runner.remove(&target.join(LOG_FILE_NAME))?;
        }
        None => {
            runner
                .run("mkdir", &[&target.to_string_lossy()])
                .with_context(|| format!("creating {:?}", target))?;
        }
    }

    let target_str = target.to_string_lossy().into_owned();
    let mut argv: Vec<String> = vec![
        "--delete".into(),
        "--whole-file".into(),
        "--out-format".into(),
        "%o;%C;%M;%n".into(),
        "--checksum-choice=xxh3".into(),
    ];
    if opts.archive_mode {
        argv.push("--archive".into());
    } else {
        // Equivalent to archive minus permissions(p)/owner(o)/group(g);
        // symlinks are followed(no l) rather than copied, and no devices
        // or special files are carried (none should be in the source).
        argv.extend(["--recursive", "--copy-links", "--times", "--xattrs"].map(String::from));
    }
    argv.extend(opts.source_paths.iter().map(|p| p.to_string_lossy().into_owned()));
    argv.push(target_str.clone());

    let args: Vec<&str> = argv.iter().map(String::as_str).collect();
    let rsync_output = runner.run("rsync", &args).with_context(|| format!("rsync into {:?}", target))?;

    let normalized = normalize_log(&rsync_output);
    runner.write_file(&target.join(LOG_FILE_NAME), &normalized)?;

    Ok(target)
}

/// Turns rsync's `--out-format '%o;%C;%M;%n'` lines into this crate's
/// `op;hash;mtime;path` grammar: `send`/`del.` become `+`/`-`, directory
/// entries (rsync lists those too) are dropped, and the result is sorted
/// lexicographically to match `backup.log`'s expected ordering.
fn normalize_log(rsync_output: &str) -> String {
    let mut lines: Vec<String> = rsync_output.lines().filter_map(normalize_rsync_line).collect();
    lines.sort();
    if lines.is_empty() {
        String::new()
    } else {
        lines.join("\n") + "\n"
    }
}

fn normalize_rsync_line(line: &str) -> Option<String> {
    let mut fields = line.splitn(4, ';');
    let op = fields.next()?;
    let checksum = fields.next()?;
    let mtime = fields.next()?;
    let name = fields.next()?;

    if name.ends_with('/') {
        return None;
    }

    if op.starts_with("send") {
        let hash_field = format!("{:0>width$}", checksum.trim(), width = crate::log::HASH_HEX_WIDTH);
        Some(format!("+;{};{};{}", hash_field, mtime, name))
    } else if op.starts_with("del.") {
        let hash_field = " ".repeat(crate::log::HASH_HEX_WIDTH);
        Some(format!("-;{};{};{}", hash_field, mtime, name))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{DryRunRecorder, Intent};
    use tempfile::tempdir;

    #[test]
    fn create_snapshot_with_no_previous_skips_seeding_and_runs_plain_flags() {
        let root = tempdir().unwrap();
        let source = tempdir().unwrap();
        let opts = BackupOptions {
            backup_path: root.path().to_path_buf(),
            source_paths: vec![source.path().to_path_buf()],
            archive_mode: false,
        };

        let mut runner = DryRunRecorder::new();
        let target = create_snapshot(&opts, None, &mut runner).unwrap();

        // No previous snapshot: seeded via `mkdir`, not `cp -al`, and no
        // stale log removal.
        let run_intents: Vec<&Intent> = runner
            .intents
            .iter()
            .filter(|i| matches!(i, Intent::Run { .. }))
            .collect();
        assert_eq!(run_intents.len(), 2, "expected an mkdir and an rsync invocation");
        match run_intents[0] {
            Intent::Run { argv } => assert_eq!(argv[0], "mkdir"),
            _ => unreachable!(),
        }
        match run_intents[1] {
            Intent::Run { argv } => {
                assert_eq!(argv[0], "rsync");
                assert!(argv.contains(&"--delete".to_string()));
                assert!(argv.contains(&"--recursive".to_string()));
                assert!(!argv.contains(&"--archive".to_string()));
                assert!(argv.contains(&source.path().to_string_lossy().into_owned()));
                assert!(argv.last().unwrap() == &target.to_string_lossy().into_owned());
            }
            _ => unreachable!(),
        }
        assert!(!runner.intents.iter().any(|i| matches!(i, Intent::Remove { .. })));

        // The (empty, since DryRunRecorder never really runs rsync)
        // normalized log is still written through the runner.
        assert!(runner
            .intents
            .iter()
            .any(|i| matches!(i, Intent::WriteFile { path, .. } if path == &target.join(LOG_FILE_NAME))));
    }

    #[test]
    fn create_snapshot_with_a_previous_seeds_via_cp_al_and_drops_its_stale_log() {
        let root = tempdir().unwrap();
        let source = tempdir().unwrap();
        let prev_dir = root.path().join("2023-05-04_03-00-00");
        std::fs::create_dir(&prev_dir).unwrap();
        let previous = Snapshot::new(prev_dir.clone(), chrono::Local::now());

        let opts = BackupOptions {
            backup_path: root.path().to_path_buf(),
            source_paths: vec![source.path().to_path_buf()],
            archive_mode: true,
        };

        let mut runner = DryRunRecorder::new();
        let target = create_snapshot(&opts, Some(&previous), &mut runner).unwrap();

        match &runner.intents[0] {
            Intent::Run { argv } => {
                assert_eq!(argv[0], "cp");
                assert!(argv.contains(&"-al".to_string()));
                assert!(argv.contains(&prev_dir.to_string_lossy().into_owned()));
            }
            other => panic!("expected cp -al seeding first, got {:?}", other),
        }
        assert!(matches!(
            &runner.intents[1],
            Intent::Remove { path } if path == &target.join(LOG_FILE_NAME)
        ));
        match &runner.intents[2] {
            Intent::Run { argv } => {
                assert_eq!(argv[0], "rsync");
                assert!(argv.contains(&"--archive".to_string()));
            }
            other => panic!("expected rsync next, got {:?}", other),
        }
    }

    #[test]
    fn normalizes_send_and_delete_lines_and_sorts() {
        let raw = "send;000000000000002a;2023-05-04T03:00:00;z.txt\ndel.;;2023-05-04T03:00:01;a.txt\n";
        let normalized = normalize_log(raw);
        let lines: Vec<&str> = normalized.lines().collect();
        assert_eq!(lines.len(), 2);
        // sorted lexicographically; ASCII '+' (0x2B) sorts before '-' (0x2D),
        // so the write line precedes the delete line regardless of path.
        assert!(lines[0].starts_with('+'));
        assert!(lines[0].ends_with("z.txt"));
        assert!(lines[1].starts_with('-'));
        assert!(lines[1].ends_with("a.txt"));
    }

    #[test]
    fn drops_directory_only_lines() {
        let raw = "send;000000000000002a;2023-05-04T03:00:00;some/dir/\n";
        assert_eq!(normalize_log(raw), "");
    }

    #[test]
    fn ignores_unrecognized_operations() {
        let raw = "*deleting;;2023-05-04T03:00:00;stale.txt\n";
        assert_eq!(normalize_log(raw), "");
    }

    #[test]
    fn empty_output_yields_empty_log() {
        assert_eq!(normalize_log(""), "");
    }
}
