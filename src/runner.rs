//! Side effects, abstracted behind a trait so the same call sites drive
//! either the real filesystem/process world or a dry-run recorder. Mirrors
//! the Python original's `Runner` split (`cmd.py`) rather than threading a
//! `dry_run: bool` through every function.

use crate::error::BiuError;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use uuid::Uuid;


// Argument lists here are dynamic (rsync's argv varies with the number of
// source paths), unlike the teacher's fixed-arity external commands, so
// this takes the whole slice as one argument rather than the variadic
// `$arg:expr` repetition the teacher's own macro uses. The mocked command
// shells out to `sh -c <data>` rather than `echo <data>` so tests can
// exercise both captured stdout *and* nonzero-exit/stderr behavior by
// returning a small shell snippet from `FakeCmd::data`.
#[cfg(test)]
macro_rules! duct_cmd {
    ( $program:expr, $args:expr ) => {{
        use crate::runner::mocks::FakeCmd;
        let _ = ($program, $args);
        duct::cmd!("sh", "-c", crate::runner::mocks::MockFakeCmd::data())
    }};
}

#[cfg(not(test))]
macro_rules! duct_cmd {
    ( $program:expr, $args:expr ) => {
        duct::cmd($program, $args)
    };
}

/// A side effect the dry-run recorder captures instead of performing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Run { argv: Vec<String> },
    Link { target: PathBuf, link: PathBuf },
    Replace { target: PathBuf, link: PathBuf },
    Remove { path: PathBuf },
    RemoveTree { path: PathBuf },
    WriteFile { path: PathBuf, contents: String },
}

/// Everything the higher-level modules (`sync`, `dedup`, the cleanup
/// command) need to mutate the world, kept behind a trait so tests and
/// `--dry-run` can swap in a recorder that touches nothing.
pub trait Runner {
    /// Runs an external command to completion, failing on non-zero exit.
    fn run(&mut self, program: &str, args: &[&str]) -> Result<String>;

    /// Replaces `link` with a hard link to `target`, atomically (via a
    /// temp-name-then-rename so a crash mid-link never leaves `link`
    /// missing or half-written).
    fn link(&mut self, target: &Path, link: &Path) -> Result<()>;

    /// Like `link`, but `link` is expected to already exist (the snapshot
    /// creation path seeds new snapshots by hard-linking the previous
    /// one's entire tree, then lets rsync rewrite the files that changed).
    fn replace(&mut self, target: &Path, link: &Path) -> Result<()>;

    fn remove(&mut self, path: &Path) -> Result<()>;

    /// Removes an entire snapshot directory (used by cleanup to drop
    /// snapshots the retention planner no longer wants).
    fn remove_tree(&mut self, path: &Path) -> Result<()>;

    /// Writes `contents` to `path`, replacing whatever was there. Used by
    /// the snapshot-creation collaborator for the normalized `backup.log`
    /// it derives from rsync's output — routed through `Runner` rather
    /// than a bare `std::fs::write` so `--dry-run` never touches disk.
    fn write_file(&mut self, path: &Path, contents: &str) -> Result<()>;

    /// Narrates an action the other methods don't otherwise surface (a
    /// plan summary line, a "nothing to do" note).
    fn comment(&mut self, text: &str);
}

/// Drives the real filesystem and real subprocesses.
#[derive(Debug, Default)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }

    fn atomic_link(&self, target: &Path, link: &Path) -> Result<()> {
        let parent = link.parent().unwrap_or_else(|| Path::new("."));
        let tmp = parent.join(format!(".biu-{}", Uuid::new_v4()));
        std::fs::hard_link(target, &tmp).map_err(|e| BiuError::LinkFailed {
            target: target.to_path_buf(),
            link: tmp.clone(),
            cause: e.to_string(),
        })?;
        std::fs::rename(&tmp, link).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            BiuError::LinkFailed {
                target: target.to_path_buf(),
                link: link.to_path_buf(),
                cause: e.to_string(),
            }
        })?;
        Ok(())
    }
}

impl Runner for ShellRunner {
    fn run(&mut self, program: &str, args: &[&str]) -> Result<String> {
        log::debug!("running {} {:?}", program, args);
        let expr = duct_cmd!(program, args.iter().copied());
        let output = expr
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .run()
            .with_context(|| format!("running {} {:?}", program, args))?;

        if !output.status.success() {
            let argv = std::iter::once(program.to_string())
                .chain(args.iter().map(|s| s.to_string()))
                .collect();
            return Err(BiuError::ExecFailed {
                argv,
                exit: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }
            .into());
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn link(&mut self, target: &Path, link: &Path) -> Result<()> {
        log::debug!("linking {:?} -> {:?}", link, target);
        self.atomic_link(target, link).map_err(Into::into)
    }

    fn replace(&mut self, target: &Path, link: &Path) -> Result<()> {
        log::debug!("replacing {:?} with a link to {:?}", link, target);
        self.atomic_link(target, link).map_err(Into::into)
    }

    fn remove(&mut self, path: &Path) -> Result<()> {
        log::debug!("removing {:?}", path);
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BiuError::LinkFailed {
                target: PathBuf::new(),
                link: path.to_path_buf(),
                cause: e.to_string(),
            }
            .into()),
        }
    }

    fn remove_tree(&mut self, path: &Path) -> Result<()> {
        log::debug!("removing tree {:?}", path);
        match std::fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BiuError::LinkFailed {
                target: PathBuf::new(),
                link: path.to_path_buf(),
                cause: e.to_string(),
            }
            .into()),
        }
    }

    fn write_file(&mut self, path: &Path, contents: &str) -> Result<()> {
        log::debug!("writing {:?} ({} bytes)", path, contents.len());
        std::fs::write(path, contents).with_context(|| format!("writing {:?}", path))
    }

    fn comment(&mut self, text: &str) {
        log::info!("{}", text);
    }
}

/// Records every would-be side effect without touching the filesystem or
/// spawning anything. `run` echoes back an empty string, since nothing in
/// this crate depends on captured command output for control flow.
#[derive(Debug, Default)]
pub struct DryRunRecorder {
    pub intents: Vec<Intent>,
    pub comments: Vec<String>,
}

impl DryRunRecorder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Runner for DryRunRecorder {
    fn run(&mut self, program: &str, args: &[&str]) -> Result<String> {
        let argv = std::iter::once(program.to_string())
            .chain(args.iter().map(|s| s.to_string()))
            .collect();
        self.intents.push(Intent::Run { argv });
        Ok(String::new())
    }

    fn link(&mut self, target: &Path, link: &Path) -> Result<()> {
        self.intents.push(Intent::Link {
            target: target.to_path_buf(),
            link: link.to_path_buf(),
        });
        Ok(())
    }

    fn replace(&mut self, target: &Path, link: &Path) -> Result<()> {
        self.intents.push(Intent::Replace {
            target: target.to_path_buf(),
            link: link.to_path_buf(),
        });
        Ok(())
    }

    fn remove(&mut self, path: &Path) -> Result<()> {
        self.intents.push(Intent::Remove { path: path.to_path_buf() });
        Ok(())
    }

    fn remove_tree(&mut self, path: &Path) -> Result<()> {
        self.intents.push(Intent::RemoveTree { path: path.to_path_buf() });
        Ok(())
    }

    fn write_file(&mut self, path: &Path, contents: &str) -> Result<()> {
        self.intents.push(Intent::WriteFile { path: path.to_path_buf(), contents: contents.to_string() });
        Ok(())
    }

    fn comment(&mut self, text: &str) {
        self.comments.push(text.to_string());
    }
}
