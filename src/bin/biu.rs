//! `biu` — back it up! CLI entry point: parses arguments, wires the
//! requested subcommand's collaborators together, and reports failures the
//! way the rest of this crate's ecosystem does.

use anyhow::{Context, Result};
use biu::dedup::{run_dedup, DEFAULT_BATCH_SIZE};
use biu::parsing::{non_negative_int, parse_retention_plan, RetentionRule};
use biu::retention::{evaluate_retention, partition_by_keep};
use biu::runner::{DryRunRecorder, Runner, ShellRunner};
use biu::snapshot::{self, Snapshot};
use biu::sync::{create_snapshot, BackupOptions};
use biu::validate::Validation;
use clap::{ArgAction, Parser, Subcommand};
use comfy_table::{Cell, Table};
use human_panic::setup_panic;
use log::{debug, error, info, trace, LevelFilter};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "biu", version, author = "opensource@rebeagle.com")]
struct CliOptions {
    /// Increase log verbosity. Pass twice for trace-level logs.
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Print what would happen without touching the filesystem. This is
    /// the default; pass --no-dry-run to actually act.
    #[arg(long, action = ArgAction::SetTrue, overrides_with = "no_dry_run")]
    dry_run: bool,

    #[arg(long = "no-dry-run", action = ArgAction::SetTrue, overrides_with = "dry_run")]
    no_dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

impl CliOptions {
    fn dry_run(&self) -> bool {
        !self.no_dry_run
    }
}

#[derive(Subcommand)]
enum Command {
    /// Creates a new snapshot, seeded from the previous one, via rsync.
    Backup {
        #[arg(long)]
        backup_path: PathBuf,
        /// A source directory to back up. May be repeated.
        #[arg(long = "source", required = true)]
        source_paths: Vec<PathBuf>,
        /// Pass --archive to rsync instead of this crate's narrower default flag set.
        #[arg(long)]
        archive: bool,
    },
    /// Applies a retention plan, marking which snapshots survive.
    Cleanup {
        #[arg(long)]
        backup_path: PathBuf,
        /// Comma-separated `<duration>:<count>` pairs, e.g. "1d:7,1w:4".
        #[arg(long, value_parser = retention_plan_arg)]
        retention_plan: RetentionPlanArg,
        /// How many snapshots may be deleted even if the plan wants more kept.
        #[arg(long, value_parser = non_negative_int_arg, default_value = "0")]
        force_delete: u32,
    },
    /// Hard-links byte-identical files across every snapshot under a backup path.
    Dedup {
        #[arg(long)]
        backup_path: PathBuf,
        #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,
    },
}

#[derive(Clone)]
struct RetentionPlanArg(Vec<RetentionRule>);

fn retention_plan_arg(text: &str) -> Result<RetentionPlanArg, String> {
    parse_retention_plan(text).map(RetentionPlanArg).map_err(|e| e.to_string())
}

fn non_negative_int_arg(text: &str) -> Result<u32, String> {
    non_negative_int(text).map_err(|e| e.to_string())
}

fn main() {
    setup_panic!();

    let options = CliOptions::parse();
    let level = match options.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    pretty_env_logger::formatted_builder().filter_level(level).init();

    debug!("debug verbosity enabled");
    trace!("trace verbosity enabled");

    let started = std::time::Instant::now();
    let result = run(options);
    info!("finished in {}", humantime::format_duration(started.elapsed()));

    if let Err(e) = result {
        error!("{}", e);
        for cause in e.chain().skip(1) {
            debug!("caused by: {}", cause);
        }
        std::process::exit(1);
    }
}

fn run(options: CliOptions) -> Result<()> {
    let dry_run = options.dry_run();
    let mut recorder;
    let mut shell;
    let runner: &mut dyn Runner = if dry_run {
        recorder = DryRunRecorder::new();
        &mut recorder
    } else {
        shell = ShellRunner::new();
        &mut shell
    };

    match options.command {
        Command::Backup { backup_path, source_paths, archive } => {
            run_backup(&backup_path, source_paths, archive, runner)
        }
        Command::Cleanup { backup_path, retention_plan, force_delete } => {
            run_cleanup(&backup_path, &retention_plan.0, force_delete, runner)
        }
        Command::Dedup { backup_path, batch_size } => run_dedup_command(&backup_path, batch_size, runner),
    }
}

fn run_backup(backup_path: &PathBuf, source_paths: Vec<PathBuf>, archive: bool, runner: &mut dyn Runner) -> Result<()> {
    let mut validation = Validation::new("backup");
    validation.require("backup path exists and is a directory", backup_path.is_dir());
    for source in &source_paths {
        validation.require(&format!("source path {:?} exists", source), source.exists());
    }
    validation.validate()?;

    let (snapshots, warnings) = snapshot::list_snapshots(backup_path)
        .with_context(|| format!("listing snapshots under {:?}", backup_path))?;
    log_warnings(&warnings);

    let opts = BackupOptions { backup_path: backup_path.clone(), source_paths, archive_mode: archive };
    let previous = snapshots.last();
    let created = create_snapshot(&opts, previous, runner)?;
    info!("created snapshot {:?}", created);
    Ok(())
}

fn run_cleanup(backup_path: &PathBuf, plan: &[RetentionRule], force_delete: u32, runner: &mut dyn Runner) -> Result<()> {
    let mut validation = Validation::new("cleanup");
    validation.require("backup path exists and is a directory", backup_path.is_dir());
    validation.validate()?;

    let (snapshots, warnings) = snapshot::list_snapshots(backup_path)
        .with_context(|| format!("listing snapshots under {:?}", backup_path))?;
    log_warnings(&warnings);

    let retention_warnings = evaluate_retention(&snapshots, plan, force_delete, chrono::Local::now())?;
    log_warnings(&retention_warnings);

    let (keep, drop) = partition_by_keep(&snapshots);
    print_retention_table(&keep, &drop);

    for snapshot in drop {
        runner.remove_tree(snapshot.directory())?;
    }

    Ok(())
}

fn run_dedup_command(backup_path: &PathBuf, batch_size: usize, runner: &mut dyn Runner) -> Result<()> {
    let mut validation = Validation::new("dedup");
    validation.require("backup path exists and is a directory", backup_path.is_dir());
    validation.validate()?;

    let (all_snapshots, warnings) = snapshot::list_snapshots(backup_path)
        .with_context(|| format!("listing snapshots under {:?}", backup_path))?;
    log_warnings(&warnings);

    // Incomplete snapshots (no backup.log) can neither be scanned for new
    // content nor matched against, so they're dropped from both roles.
    let mut snapshots = Vec::with_capacity(all_snapshots.len());
    for snapshot in all_snapshots {
        if snapshot.has_log() {
            snapshots.push(snapshot);
        } else {
            log::warn!("{}", biu::error::BiuError::MissingLog { snapshot: snapshot.directory().to_path_buf() });
        }
    }

    for i in 0..snapshots.len() {
        let (older, rest) = snapshots.split_at(i);
        let newest = &rest[0];
        let older_refs: Vec<&Snapshot> = older.iter().collect();
        run_dedup(newest, &older_refs, batch_size, runner)?;
    }

    Ok(())
}

fn log_warnings(warnings: &[biu::error::BiuError]) {
    for warning in warnings {
        log::warn!("{}", warning);
    }
}

fn print_retention_table(keep: &[&Snapshot], drop: &[&Snapshot]) {
    let mut table = Table::new();
    table.set_header(vec![Cell::new("snapshot"), Cell::new("decision")]);
    for snapshot in keep {
        table.add_row(vec![snapshot.name(), "keep"]);
    }
    for snapshot in drop {
        table.add_row(vec![snapshot.name(), "delete"]);
    }
    println!("{}", table);
}
