//! READY/EXCLUDED partitioning of the task board.
//!
//! One invocation takes a board snapshot, the reconciled worker records, and
//! the owner→scope map, and decides which TODO tasks are safe to start right
//! now. Everything that is not safe gets an explicit reason so an operator can
//! see exactly why a task is being held back. The computation is single-pass,
//! read-only, and rebuilt from scratch on every call.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use tracing::debug;

use crate::board::{Board, deps_ready};
use crate::config::owner_key;
use crate::task_spec::SpecProbe;
use crate::worker::WorkerRecord;

/// Why a TODO task was not scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    ActiveSignalConflict,
    ActiveWorker,
    ActiveLock,
    OwnerBusy,
    MissingTaskSpec,
    InvalidTaskSpec,
    DepsNotReady,
}

impl ExclusionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExclusionReason::ActiveSignalConflict => "active_signal_conflict",
            ExclusionReason::ActiveWorker => "active_worker",
            ExclusionReason::ActiveLock => "active_lock",
            ExclusionReason::OwnerBusy => "owner_busy",
            ExclusionReason::MissingTaskSpec => "missing_task_spec",
            ExclusionReason::InvalidTaskSpec => "invalid_task_spec",
            ExclusionReason::DepsNotReady => "deps_not_ready",
        }
    }
}

/// Which evidence produced the exclusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    Scheduler,
    Pid,
    Lock,
}

impl SignalSource {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalSource::Scheduler => "scheduler",
            SignalSource::Pid => "pid",
            SignalSource::Lock => "lock",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadyTask {
    pub task_id: String,
    pub title: String,
    pub owner: String,
    pub owner_key: String,
    pub scope: String,
    pub deps: String,
    pub status: String,
    pub spec_rel_path: String,
    pub goal_summary: String,
    pub in_scope_summary: String,
    pub acceptance_summary: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExcludedTask {
    pub task_id: String,
    pub title: String,
    pub owner: String,
    pub scope: String,
    pub deps: String,
    pub status: String,
    pub reason: ExclusionReason,
    pub source: SignalSource,
}

/// A currently held mutual-exclusion lock, for display.
#[derive(Debug, Clone, Serialize)]
pub struct HeldLock {
    pub task_id: String,
    pub owner: String,
    pub scope: String,
}

/// One scheduler invocation's full result.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulePlan {
    pub trigger: String,
    pub max_start: usize,
    pub running_locks: Vec<HeldLock>,
    pub ready_tasks: Vec<ReadyTask>,
    pub excluded_tasks: Vec<ExcludedTask>,
}

#[derive(Debug, Clone, Copy)]
struct ActiveSignal {
    reason: ExclusionReason,
    source: SignalSource,
}

/// Aggregated view of the active worker records.
#[derive(Debug, Default)]
struct ActiveMaps {
    by_task: BTreeMap<String, ActiveSignal>,
    busy_owner_keys: HashSet<String>,
    conflicted_tasks: HashSet<String>,
}

/// Pre-pass over worker records: who is busy, which task ids carry an active
/// signal, and which task ids have conflicting evidence.
fn active_maps(records: &[WorkerRecord]) -> ActiveMaps {
    let mut maps = ActiveMaps::default();
    let mut active_by_task: BTreeMap<&str, Vec<&WorkerRecord>> = BTreeMap::new();

    for record in records {
        if record.task_id.is_empty() || !record.state.is_active() {
            continue;
        }
        active_by_task
            .entry(record.task_id.as_str())
            .or_default()
            .push(record);

        if !record.owner.is_empty() {
            maps.busy_owner_keys.insert(owner_key(&record.owner));
        }

        // A live process is the strongest signal; a held lock only counts
        // when nothing stronger has been seen for this task id.
        if record.pid_alive {
            maps.by_task.insert(
                record.task_id.clone(),
                ActiveSignal {
                    reason: ExclusionReason::ActiveWorker,
                    source: SignalSource::Pid,
                },
            );
        } else if record.lock_file.is_some() {
            maps.by_task
                .entry(record.task_id.clone())
                .or_insert(ActiveSignal {
                    reason: ExclusionReason::ActiveLock,
                    source: SignalSource::Lock,
                });
        }
    }

    // Conservative by intent: more than one active record for a task id with
    // both lock and live-pid evidence across the group is flagged even when
    // the records agree on owner and scope. Duplicated launch evidence is
    // suspicious enough to hold the task for a human.
    for (task_id, rows) in active_by_task {
        if rows.len() <= 1 {
            continue;
        }
        let has_lock = rows.iter().any(|r| r.lock_file.is_some());
        let has_live_pid = rows.iter().any(|r| r.pid_alive);
        if has_lock && has_live_pid {
            maps.conflicted_tasks.insert(task_id.to_string());
        }
    }

    maps
}

/// Inputs that vary per invocation.
pub struct ScheduleRequest<'a> {
    pub trigger: &'a str,
    /// 0 disables the limit.
    pub max_start: usize,
    /// Normalized owner key → scope. Owners missing here are not scheduling
    /// candidates at all.
    pub owners_by_key: &'a BTreeMap<String, String>,
}

pub fn compute_plan(
    board: &Board,
    records: &[WorkerRecord],
    probe: &dyn SpecProbe,
    request: &ScheduleRequest<'_>,
) -> SchedulePlan {
    let task_status = board.status_index();
    let maps = active_maps(records);

    let running_locks = records
        .iter()
        .filter(|r| r.lock_file.is_some())
        .map(|r| HeldLock {
            // Lock-only orphans carry their synthetic key as the display
            // task id; the lock snapshot shows them as unowned instead.
            task_id: if r.task_id == r.key && r.key.starts_with("LOCKONLY:") {
                String::new()
            } else {
                r.task_id.clone()
            },
            owner: r.owner.clone(),
            scope: r.scope.clone(),
        })
        .collect();

    let mut ready_tasks: Vec<ReadyTask> = Vec::new();
    let mut excluded_tasks: Vec<ExcludedTask> = Vec::new();
    let mut scheduled_owner_keys: HashSet<String> = HashSet::new();

    for task in &board.tasks {
        if task.status != "TODO" {
            continue;
        }

        let task_owner_key = owner_key(&task.owner);
        let Some(scope) = request.owners_by_key.get(&task_owner_key) else {
            // Unmapped owners are deliberately invisible to scheduling.
            debug!(task_id = %task.id, owner = %task.owner, "owner not mapped; skipping");
            continue;
        };

        let exclude = |reason: ExclusionReason, source: SignalSource| ExcludedTask {
            task_id: task.id.clone(),
            title: task.title.clone(),
            owner: task.owner.clone(),
            scope: scope.clone(),
            deps: task.deps.clone(),
            status: task.status.clone(),
            reason,
            source,
        };

        if maps.conflicted_tasks.contains(&task.id) {
            excluded_tasks.push(exclude(
                ExclusionReason::ActiveSignalConflict,
                SignalSource::Scheduler,
            ));
            continue;
        }

        if let Some(signal) = maps.by_task.get(&task.id) {
            excluded_tasks.push(exclude(signal.reason, signal.source));
            continue;
        }

        if maps.busy_owner_keys.contains(&task_owner_key)
            || scheduled_owner_keys.contains(&task_owner_key)
        {
            excluded_tasks.push(exclude(ExclusionReason::OwnerBusy, SignalSource::Scheduler));
            continue;
        }

        let spec = probe.evaluate(&task.id);
        if !spec.exists {
            excluded_tasks.push(exclude(
                ExclusionReason::MissingTaskSpec,
                SignalSource::Scheduler,
            ));
            continue;
        }
        if !spec.valid {
            excluded_tasks.push(exclude(
                ExclusionReason::InvalidTaskSpec,
                SignalSource::Scheduler,
            ));
            continue;
        }

        if !deps_ready(&task.deps, &task_status, &board.gates) {
            excluded_tasks.push(exclude(
                ExclusionReason::DepsNotReady,
                SignalSource::Scheduler,
            ));
            continue;
        }

        ready_tasks.push(ReadyTask {
            task_id: task.id.clone(),
            title: task.title.clone(),
            owner: task.owner.clone(),
            owner_key: task_owner_key.clone(),
            scope: scope.clone(),
            deps: task.deps.clone(),
            status: task.status.clone(),
            spec_rel_path: spec.spec_rel_path,
            goal_summary: spec.goal_summary,
            in_scope_summary: spec.in_scope_summary,
            acceptance_summary: spec.acceptance_summary,
        });
        scheduled_owner_keys.insert(task_owner_key);

        if request.max_start > 0 && ready_tasks.len() >= request.max_start {
            break;
        }
    }

    SchedulePlan {
        trigger: request.trigger.to_string(),
        max_start: request.max_start,
        running_locks,
        ready_tasks,
        excluded_tasks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::parse_board_text;
    use crate::config::Config;
    use crate::task_spec::{SpecEvaluation, spec_rel_path};
    use crate::worker::{LockEntry, PidEntry, WorkerKey, classify_records_with};
    use std::collections::HashSet as StdHashSet;
    use std::path::PathBuf;

    /// Probe that accepts everything, like a repo with no spec tree.
    struct OpenProbe;

    impl SpecProbe for OpenProbe {
        fn evaluate(&self, task_id: &str) -> SpecEvaluation {
            SpecEvaluation {
                exists: true,
                valid: true,
                spec_rel_path: spec_rel_path(task_id),
                goal_summary: format!("goal for {task_id}"),
                ..SpecEvaluation::default()
            }
        }
    }

    /// Probe with a fixed verdict per task id.
    struct TableProbe {
        missing: StdHashSet<&'static str>,
        invalid: StdHashSet<&'static str>,
    }

    impl SpecProbe for TableProbe {
        fn evaluate(&self, task_id: &str) -> SpecEvaluation {
            SpecEvaluation {
                exists: !self.missing.contains(task_id),
                valid: !self.missing.contains(task_id) && !self.invalid.contains(task_id),
                ..SpecEvaluation::default()
            }
        }
    }

    fn board_text(rows: &[(&str, &str, &str, &str)]) -> String {
        let mut text = String::from(
            "| ID | Title | Owner | Deps | Notes | Status |\n|---|---|---|---|---|---|\n",
        );
        for (id, owner, deps, status) in rows {
            text.push_str(&format!(
                "| {id} | title | {owner} | {deps} | n | {status} |\n"
            ));
        }
        text
    }

    fn owners() -> BTreeMap<String, String> {
        Config::default_config().owners_by_key()
    }

    fn schema_board(rows: &[(&str, &str, &str, &str)]) -> Board {
        // This test table has no leading Area column, so shift the default
        // schema left by one.
        let mut schema = Config::default_config().board_schema().unwrap();
        schema.id_col = 1;
        schema.title_col = 2;
        schema.owner_col = 3;
        schema.deps_col = 4;
        schema.status_col = 6;
        parse_board_text(&board_text(rows), &schema)
    }

    fn pid_entry(task_id: &str, owner: &str, scope: &str, pid: &str) -> PidEntry {
        PidEntry {
            key: WorkerKey::Task(task_id.to_string()),
            task_id: task_id.to_string(),
            owner: owner.to_string(),
            scope: scope.to_string(),
            pid: pid.to_string(),
            pid_file: PathBuf::from(format!("{task_id}.pid")),
            worktree: String::new(),
            tmux_session: String::new(),
            launch_backend: String::new(),
            log_file: String::new(),
        }
    }

    fn lock_entry(task_id: &str, owner: &str, scope: &str) -> LockEntry {
        LockEntry {
            key: WorkerKey::Task(task_id.to_string()),
            task_id: task_id.to_string(),
            owner: owner.to_string(),
            scope: scope.to_string(),
            lock_file: PathBuf::from(format!("{scope}.lock")),
            worktree: String::new(),
        }
    }

    fn request(max_start: usize, owners: &BTreeMap<String, String>) -> ScheduleRequest<'_> {
        ScheduleRequest {
            trigger: "test",
            max_start,
            owners_by_key: owners,
        }
    }

    #[test]
    fn active_worker_excludes_task_and_owner() {
        let board = schema_board(&[
            ("T1-001", "AgentA", "-", "TODO"),
            ("T1-002", "AgentA", "-", "TODO"),
            ("T1-003", "AgentB", "T9-999", "TODO"),
            ("T1-004", "AgentC", "-", "TODO"),
        ]);
        let pid_rows = vec![pid_entry("T1-001", "AgentA", "app-shell", "101")];
        let lock_rows = vec![lock_entry("T1-001", "AgentA", "app-shell")];
        let records = classify_records_with(&pid_rows, &lock_rows, |_| true);

        let owners = owners();
        let plan = compute_plan(&board, &records, &OpenProbe, &request(0, &owners));

        let ready: Vec<&str> = plan
            .ready_tasks
            .iter()
            .map(|t| t.task_id.as_str())
            .collect();
        assert_eq!(ready, ["T1-004"]);

        let excluded: BTreeMap<&str, &ExcludedTask> = plan
            .excluded_tasks
            .iter()
            .map(|t| (t.task_id.as_str(), t))
            .collect();
        assert_eq!(excluded["T1-001"].reason, ExclusionReason::ActiveWorker);
        assert_eq!(excluded["T1-001"].source, SignalSource::Pid);
        assert_eq!(excluded["T1-002"].reason, ExclusionReason::OwnerBusy);
        assert_eq!(excluded["T1-003"].reason, ExclusionReason::DepsNotReady);
    }

    #[test]
    fn stale_signals_do_not_block() {
        let board = schema_board(&[("T1-005", "AgentD", "-", "TODO")]);
        let pid_rows = vec![pid_entry("T1-005", "AgentD", "ui-popover", "424242")];
        let lock_rows = vec![lock_entry("T1-005", "AgentD", "ui-popover")];
        // Dead pid: the pair reconciles to LOCK_STALE, which is not active.
        let records = classify_records_with(&pid_rows, &lock_rows, |_| false);

        let owners = owners();
        let plan = compute_plan(&board, &records, &OpenProbe, &request(0, &owners));
        assert_eq!(plan.ready_tasks.len(), 1);
        assert_eq!(plan.ready_tasks[0].task_id, "T1-005");
        assert!(plan.excluded_tasks.is_empty());
    }

    #[test]
    fn lock_only_signal_excludes_with_lock_source() {
        let board = schema_board(&[("T1-001", "AgentA", "-", "TODO")]);
        let lock_rows = vec![lock_entry("T1-001", "AgentA", "app-shell")];
        let records = classify_records_with(&[], &lock_rows, |_| false);

        let owners = owners();
        let plan = compute_plan(&board, &records, &OpenProbe, &request(0, &owners));
        assert_eq!(plan.excluded_tasks[0].reason, ExclusionReason::ActiveLock);
        assert_eq!(plan.excluded_tasks[0].source, SignalSource::Lock);
    }

    #[test]
    fn duplicated_signals_flag_a_conflict() {
        let board = schema_board(&[("T1-001", "AgentA", "-", "TODO")]);
        // Two independent active records for one task id: a lock+pid pair
        // plus a second liveness file with a live process.
        let mut retry = pid_entry("T1-001", "AgentA", "app-shell", "102");
        retry.key = WorkerKey::PidOnly("retry".to_string());
        let pid_rows = vec![pid_entry("T1-001", "AgentA", "app-shell", "101"), retry];
        let lock_rows = vec![lock_entry("T1-001", "AgentA", "app-shell")];
        let records = classify_records_with(&pid_rows, &lock_rows, |_| true);

        let owners = owners();
        let plan = compute_plan(&board, &records, &OpenProbe, &request(0, &owners));
        assert_eq!(
            plan.excluded_tasks[0].reason,
            ExclusionReason::ActiveSignalConflict
        );
        assert_eq!(plan.excluded_tasks[0].source, SignalSource::Scheduler);
    }

    #[test]
    fn non_todo_and_unmapped_owners_are_omitted() {
        let board = schema_board(&[
            ("T1-001", "AgentA", "-", "DONE"),
            ("T1-002", "AgentA", "-", "IN_PROGRESS"),
            ("T1-003", "Nobody", "-", "TODO"),
            ("T1-004", "AgentB", "-", "TODO"),
        ]);
        let owners = owners();
        let plan = compute_plan(&board, &[], &OpenProbe, &request(0, &owners));
        assert_eq!(plan.ready_tasks.len(), 1);
        assert_eq!(plan.ready_tasks[0].task_id, "T1-004");
        assert!(plan.excluded_tasks.is_empty());
    }

    #[test]
    fn spec_probe_verdicts_map_to_reasons() {
        let board = schema_board(&[
            ("T1-001", "AgentA", "-", "TODO"),
            ("T1-002", "AgentB", "-", "TODO"),
            ("T1-003", "AgentC", "-", "TODO"),
        ]);
        let probe = TableProbe {
            missing: ["T1-001"].into(),
            invalid: ["T1-002"].into(),
        };
        let owners = owners();
        let plan = compute_plan(&board, &[], &probe, &request(0, &owners));

        let excluded: BTreeMap<&str, &ExcludedTask> = plan
            .excluded_tasks
            .iter()
            .map(|t| (t.task_id.as_str(), t))
            .collect();
        assert_eq!(excluded["T1-001"].reason, ExclusionReason::MissingTaskSpec);
        assert_eq!(excluded["T1-002"].reason, ExclusionReason::InvalidTaskSpec);
        assert_eq!(plan.ready_tasks[0].task_id, "T1-003");
    }

    #[test]
    fn owner_appears_at_most_once_in_ready() {
        let board = schema_board(&[
            ("T1-001", "AgentA", "-", "TODO"),
            ("T1-002", "AgentA", "-", "TODO"),
            ("T1-003", "agent a", "-", "TODO"),
        ]);
        let owners = owners();
        let plan = compute_plan(&board, &[], &OpenProbe, &request(0, &owners));
        // "agent a" normalizes to the same owner key as "AgentA".
        assert_eq!(plan.ready_tasks.len(), 1);
        assert_eq!(plan.ready_tasks[0].task_id, "T1-001");
        assert!(
            plan.excluded_tasks
                .iter()
                .all(|t| t.reason == ExclusionReason::OwnerBusy)
        );
    }

    #[test]
    fn max_start_caps_the_ready_list() {
        let board = schema_board(&[
            ("T1-001", "AgentA", "-", "TODO"),
            ("T1-002", "AgentB", "-", "TODO"),
            ("T1-003", "AgentC", "-", "TODO"),
        ]);
        let owners = owners();
        let plan = compute_plan(&board, &[], &OpenProbe, &request(2, &owners));
        assert_eq!(plan.ready_tasks.len(), 2);
        assert_eq!(plan.max_start, 2);

        let unlimited = compute_plan(&board, &[], &OpenProbe, &request(0, &owners));
        assert_eq!(unlimited.ready_tasks.len(), 3);
    }

    #[test]
    fn ready_rows_carry_spec_summaries() {
        let board = schema_board(&[("T1-001", "AgentA", "-", "TODO")]);
        let owners = owners();
        let plan = compute_plan(&board, &[], &OpenProbe, &request(0, &owners));
        assert_eq!(plan.ready_tasks[0].spec_rel_path, "tasks/T1-001.md");
        assert_eq!(plan.ready_tasks[0].goal_summary, "goal for T1-001");
    }

    #[test]
    fn held_locks_are_snapshotted() {
        let board = schema_board(&[]);
        let lock_rows = vec![lock_entry("T1-001", "AgentA", "app-shell")];
        let records = classify_records_with(&[], &lock_rows, |_| false);
        let owners = owners();
        let plan = compute_plan(&board, &records, &OpenProbe, &request(0, &owners));
        assert_eq!(plan.running_locks.len(), 1);
        assert_eq!(plan.running_locks[0].scope, "app-shell");
        assert_eq!(plan.running_locks[0].task_id, "T1-001");
    }

    #[test]
    fn plan_serializes_with_stable_field_names() {
        let board = schema_board(&[("T1-001", "AgentA", "-", "TODO")]);
        let owners = owners();
        let plan = compute_plan(&board, &[], &OpenProbe, &request(0, &owners));
        let json = serde_json::to_value(&plan).unwrap();
        assert!(json.get("ready_tasks").is_some());
        assert!(json.get("excluded_tasks").is_some());
        assert!(json.get("running_locks").is_some());
        assert_eq!(json["ready_tasks"][0]["task_id"], "T1-001");
        assert_eq!(json["trigger"], "test");
    }
}
