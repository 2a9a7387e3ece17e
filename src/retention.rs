//! The calendar-stride retention planner: given an ordered list of
//! `(interval, count)` rules and a clock, marks which snapshots must be
//! kept and which may be deleted.

use crate::error::BiuError;
use crate::parsing::RetentionRule;
use crate::snapshot::Snapshot;
use chrono::{DateTime, Local};

/// Evaluates `plan` against `snapshots` (must be sorted oldest-first,
/// non-empty is the interesting case but an empty slice is a no-op),
/// marking each snapshot's `should_keep` flag in place. Returns any
/// warnings raised along the way (`MissingLog` for incomplete snapshots,
/// `BudgetExceeded` if the plan can't be fully applied within budget);
/// fails with `RetentionRefused` if `force_delete` would require deleting
/// every snapshot.
pub fn evaluate_retention(
    snapshots: &[Snapshot],
    plan: &[RetentionRule],
    force_delete: u32,
    now: DateTime<Local>,
) -> Result<Vec<BiuError>, BiuError> {
    if snapshots.is_empty() {
        return Ok(vec![]);
    }

    let total = snapshots.len();
    if force_delete as usize >= total {
        return Err(BiuError::RetentionRefused {
            force_delete: force_delete as usize,
            available: total,
        });
    }
    let budget = total - force_delete as usize;

    // The newest snapshot is always kept.
    snapshots
        .last()
        .expect("checked non-empty above")
        .mark_keep();

    let mut warnings = Vec::new();

    // Incomplete snapshots (no backup.log) can't be deduped, and deleting
    // them would silently drop a tree the dedup engine never looked at;
    // per spec.md §7 MissingLog they're always kept.
    for snapshot in snapshots {
        if !snapshot.has_log() {
            snapshot.mark_keep();
            warnings.push(BiuError::MissingLog { snapshot: snapshot.directory().to_path_buf() });
        }
    }

    for rule in plan {
        for i in 0..=rule.count {
            let desired = now - rule.interval * (i as i32);

            // Walk chronologically, keep the first (youngest) snapshot that
            // is still at least `desired`-stale.
            for snapshot in snapshots {
                if snapshot.creation_time() > desired {
                    snapshot.mark_keep();
                    break;
                }
            }

            let kept = snapshots.iter().filter(|s| s.should_keep()).count();
            if kept == total {
                return Ok(warnings);
            }
            if kept >= budget {
                warnings.push(BiuError::BudgetExceeded { keep: kept, budget });
                return Ok(warnings);
            }
        }
    }

    Ok(warnings)
}

/// Splits snapshots into (keep, drop) references per their `should_keep`
/// flag, for callers that drive the actual deletion.
pub fn partition_by_keep(snapshots: &[Snapshot]) -> (Vec<&Snapshot>, Vec<&Snapshot>) {
    snapshots.iter().partition(|s| s.should_keep())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsing::parse_duration;
    use chrono::Duration;
    use tempfile::tempdir;

    fn snapshot_at(now: DateTime<Local>, days_ago: i64) -> Snapshot {
        Snapshot::new(
            std::path::PathBuf::from(format!("D-{}", days_ago)),
            now - Duration::days(days_ago),
        )
    }

    #[test]
    fn empty_list_is_a_no_op() {
        let snapshots: Vec<Snapshot> = vec![];
        let warnings = evaluate_retention(&snapshots, &[], 0, Local::now()).unwrap();
        assert!(warnings.is_empty());
    }

    #[test]
    fn single_snapshot_always_kept() {
        let now = Local::now();
        let snapshots = vec![snapshot_at(now, 0)];
        evaluate_retention(&snapshots, &[], 0, now).unwrap();
        assert!(snapshots[0].should_keep());
    }

    #[test]
    fn force_delete_covering_everything_is_refused() {
        let now = Local::now();
        let snapshots = vec![snapshot_at(now, 1), snapshot_at(now, 0)];
        let err = evaluate_retention(&snapshots, &[], 2, now).unwrap_err();
        assert!(matches!(err, BiuError::RetentionRefused { .. }));
    }

    #[test]
    fn twelve_daily_snapshots_scenario_s5() {
        // D1..D12, D12 newest. now = D12 + 1h (all days distinguishable).
        let now = Local::now();
        let d12 = now - Duration::hours(1);
        let mut snapshots = Vec::new();
        for i in 1..=12 {
            // D_k is (12 - k) days before D12.
            let days_before_d12 = 12 - i;
            snapshots.push(Snapshot::new(
                std::path::PathBuf::from(format!("D{}", i)),
                d12 - Duration::days(days_before_d12),
            ));
        }

        let plan = vec![
            crate::parsing::RetentionRule { interval: parse_duration("1d").unwrap(), count: 3 },
            crate::parsing::RetentionRule { interval: parse_duration("1w").unwrap(), count: 2 },
        ];

        let warnings = evaluate_retention(&snapshots, &plan, 0, now).unwrap();
        assert!(warnings.is_empty());

        let kept_names: Vec<&str> = snapshots.iter().filter(|s| s.should_keep()).map(|s| s.name()).collect();
        // D12 (newest), D11, D10, D9 from the daily stride; D12 and D5 (>= now-1w)
        // and D12 again (>= now-2w, same snapshot) from the weekly stride.
        assert!(kept_names.contains(&"D12"));
        assert!(kept_names.contains(&"D11"));
        assert!(kept_names.contains(&"D10"));
        assert!(kept_names.contains(&"D9"));
    }

    #[test]
    fn budget_exceeded_stops_processing_remaining_rules() {
        let now = Local::now();
        let snapshots = vec![snapshot_at(now, 2), snapshot_at(now, 1), snapshot_at(now, 0)];
        // force_delete=2 leaves a budget of 1: only the newest can be kept.
        let plan = vec![crate::parsing::RetentionRule {
            interval: parse_duration("1d").unwrap(),
            count: 5,
        }];
        let warnings = evaluate_retention(&snapshots, &plan, 2, now).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(matches!(warnings[0], BiuError::BudgetExceeded { .. }));
    }

    #[test]
    fn incomplete_snapshot_is_always_kept_and_warned_about() {
        let root = tempdir().unwrap();
        let now = Local::now();
        let complete = Snapshot::new(root.path().join("complete"), now - Duration::days(5));
        std::fs::create_dir(complete.directory()).unwrap();
        std::fs::write(complete.directory().join("backup.log"), "").unwrap();
        let incomplete = Snapshot::new(root.path().join("incomplete"), now - Duration::days(3));
        std::fs::create_dir(incomplete.directory()).unwrap();
        let newest = Snapshot::new(root.path().join("newest"), now);
        std::fs::create_dir(newest.directory()).unwrap();
        std::fs::write(newest.directory().join("backup.log"), "").unwrap();

        let snapshots = vec![complete, incomplete, newest];
        // A tight plan that would otherwise only keep the newest.
        let plan = vec![];
        let warnings = evaluate_retention(&snapshots, &plan, 2, now).unwrap();

        assert!(snapshots[1].should_keep(), "incomplete snapshot must always be kept");
        assert!(warnings.iter().any(|w| matches!(w, BiuError::MissingLog { .. })));
    }

    #[test]
    fn newest_is_always_among_kept() {
        let now = Local::now();
        let snapshots = vec![snapshot_at(now, 30), snapshot_at(now, 15), snapshot_at(now, 0)];
        evaluate_retention(&snapshots, &[], 0, now).unwrap();
        assert!(snapshots.last().unwrap().should_keep());
    }
}
