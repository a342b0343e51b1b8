//! Unified status payloads.
//!
//! Each payload is one atomic snapshot assembled from the board, the
//! reconciled worker records, and the scheduler plan. Field names are stable
//! regardless of the rendering format; the text renderer below is the only
//! non-JSON view this crate produces.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{Context as _, Result};
use chrono::Utc;
use serde::Serialize;

use crate::board::{self, Board};
use crate::config::{RunContext, owner_key};
use crate::scheduler::{self, SchedulePlan, ScheduleRequest};
use crate::task_spec::FsSpecProbe;
use crate::updates::{self, DEFAULT_UPDATES_LIMIT, UpdateEntry};
use crate::worker::{
    self, InventorySummary, WorkerRecord, classify_records, load_lock_inventory,
    load_pid_inventory,
};

#[derive(Debug, Serialize)]
pub struct ReadyPayload {
    pub repo_root: PathBuf,
    pub state_dir: PathBuf,
    #[serde(flatten)]
    pub plan: SchedulePlan,
}

#[derive(Debug, Serialize)]
pub struct InventoryPayload {
    pub repo_root: PathBuf,
    pub state_dir: PathBuf,
    pub workers: Vec<WorkerRecord>,
    pub summary: InventorySummary,
}

#[derive(Debug, Serialize)]
pub struct BoardTaskRow {
    pub task_id: String,
    pub title: String,
    pub owner: String,
    pub scope: String,
    pub deps: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct BoardSummary {
    pub total: usize,
    pub status_counts: BTreeMap<String, usize>,
}

#[derive(Debug, Serialize)]
pub struct BoardPayload {
    pub tasks: Vec<BoardTaskRow>,
    pub summary: BoardSummary,
}

#[derive(Debug, Serialize)]
pub struct UpdatesPayload {
    pub updates_file: PathBuf,
    pub entries: Vec<UpdateEntry>,
    pub summary: UpdatesSummary,
}

#[derive(Debug, Serialize)]
pub struct UpdatesSummary {
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct SchedulerSection {
    pub trigger: String,
    pub max_start: usize,
    pub ready_tasks: Vec<scheduler::ReadyTask>,
    pub excluded_tasks: Vec<scheduler::ExcludedTask>,
    pub summary: SchedulerSummary,
}

#[derive(Debug, Serialize)]
pub struct SchedulerSummary {
    pub ready: usize,
    pub excluded: usize,
}

#[derive(Debug, Serialize)]
pub struct RuntimeSection {
    pub summary: RuntimeSummary,
    pub workers: Vec<WorkerRecord>,
}

#[derive(Debug, Serialize)]
pub struct RuntimeSummary {
    pub total: usize,
    pub active: usize,
    pub stale: usize,
    pub state_counts: BTreeMap<&'static str, usize>,
}

#[derive(Debug, Serialize)]
pub struct CoordinationSection {
    pub active_locks: Vec<scheduler::HeldLock>,
    pub summary: CoordinationSummary,
}

#[derive(Debug, Serialize)]
pub struct CoordinationSummary {
    pub locks: usize,
}

#[derive(Debug, Serialize)]
pub struct StatusPayload {
    pub repo_root: PathBuf,
    pub state_dir: PathBuf,
    pub generated_at: String,
    pub scheduler: SchedulerSection,
    pub runtime: RuntimeSection,
    pub coordination: CoordinationSection,
    pub task_board: BoardPayload,
    pub updates: UpdatesPayload,
}

fn load_board(ctx: &RunContext) -> Result<Board> {
    board::ensure_board_file(&ctx.board_file).with_context(|| {
        format!(
            "failed to bootstrap task board at {}",
            ctx.board_file.display()
        )
    })?;
    Ok(board::parse_board_file(&ctx.board_file, &ctx.board_schema)?)
}

fn scan_workers(ctx: &RunContext) -> Vec<WorkerRecord> {
    let pid_rows = load_pid_inventory(&ctx.worker_dir);
    let lock_rows = load_lock_inventory(&ctx.lock_dir);
    classify_records(&pid_rows, &lock_rows)
}

fn compute_plan(
    ctx: &RunContext,
    board: &Board,
    records: &[WorkerRecord],
    trigger: &str,
    max_start_override: Option<usize>,
) -> SchedulePlan {
    let probe = FsSpecProbe::new(&ctx.repo_root);
    let request = ScheduleRequest {
        trigger,
        max_start: max_start_override.unwrap_or(ctx.runtime.max_start),
        owners_by_key: &ctx.owners_by_key,
    };
    scheduler::compute_plan(board, records, &probe, &request)
}

/// Scheduler plan plus the paths it was computed against.
pub fn ready_payload(
    ctx: &RunContext,
    trigger: &str,
    max_start_override: Option<usize>,
) -> Result<ReadyPayload> {
    let board = load_board(ctx)?;
    let records = scan_workers(ctx);
    Ok(ReadyPayload {
        repo_root: ctx.repo_root.clone(),
        state_dir: ctx.state_dir.clone(),
        plan: compute_plan(ctx, &board, &records, trigger, max_start_override),
    })
}

pub fn inventory_payload(ctx: &RunContext) -> InventoryPayload {
    let records = scan_workers(ctx);
    let summary = worker::summarize(&records);
    InventoryPayload {
        repo_root: ctx.repo_root.clone(),
        state_dir: ctx.state_dir.clone(),
        workers: records,
        summary,
    }
}

pub fn board_payload(ctx: &RunContext) -> Result<BoardPayload> {
    let board = load_board(ctx)?;
    let mut status_counts: BTreeMap<String, usize> = BTreeMap::new();
    let tasks: Vec<BoardTaskRow> = board
        .tasks
        .iter()
        .map(|task| {
            *status_counts.entry(task.status.clone()).or_default() += 1;
            BoardTaskRow {
                task_id: task.id.clone(),
                title: task.title.clone(),
                owner: task.owner.clone(),
                scope: ctx
                    .owners_by_key
                    .get(&owner_key(&task.owner))
                    .cloned()
                    .unwrap_or_default(),
                deps: task.deps.clone(),
                status: task.status.clone(),
            }
        })
        .collect();
    Ok(BoardPayload {
        summary: BoardSummary {
            total: tasks.len(),
            status_counts,
        },
        tasks,
    })
}

pub fn updates_payload(ctx: &RunContext) -> UpdatesPayload {
    let entries = updates::load_updates(&ctx.updates_file, DEFAULT_UPDATES_LIMIT);
    UpdatesPayload {
        updates_file: ctx.updates_file.clone(),
        summary: UpdatesSummary {
            total: entries.len(),
        },
        entries,
    }
}

/// The full dashboard snapshot: scheduler, runtime, coordination, board,
/// and recent updates in one pass.
pub fn status_payload(
    ctx: &RunContext,
    trigger: &str,
    max_start_override: Option<usize>,
) -> Result<StatusPayload> {
    let board = load_board(ctx)?;
    let records = scan_workers(ctx);
    let plan = compute_plan(ctx, &board, &records, trigger, max_start_override);
    let inv_summary = worker::summarize(&records);

    let active = records.iter().filter(|r| r.state.is_active()).count();
    let stale = records.iter().filter(|r| r.stale).count();

    Ok(StatusPayload {
        repo_root: ctx.repo_root.clone(),
        state_dir: ctx.state_dir.clone(),
        generated_at: Utc::now().to_rfc3339(),
        scheduler: SchedulerSection {
            trigger: plan.trigger.clone(),
            max_start: plan.max_start,
            summary: SchedulerSummary {
                ready: plan.ready_tasks.len(),
                excluded: plan.excluded_tasks.len(),
            },
            ready_tasks: plan.ready_tasks,
            excluded_tasks: plan.excluded_tasks,
        },
        runtime: RuntimeSection {
            summary: RuntimeSummary {
                total: inv_summary.total,
                active,
                stale,
                state_counts: inv_summary.state_counts,
            },
            workers: records,
        },
        coordination: CoordinationSection {
            summary: CoordinationSummary {
                locks: plan.running_locks.len(),
            },
            active_locks: plan.running_locks,
        },
        task_board: board_payload(ctx)?,
        updates: updates_payload(ctx),
    })
}

/// Fixed-layout text rendering of the status snapshot.
pub fn render_status_text(payload: &StatusPayload) -> String {
    let mut out = String::new();
    let scheduler = &payload.scheduler;
    let runtime = &payload.runtime;
    let coordination = &payload.coordination;

    let _ = writeln!(out, "Repo: {}", payload.repo_root.display());
    let _ = writeln!(out, "State dir: {}", payload.state_dir.display());
    let _ = writeln!(out, "Trigger: {}", scheduler.trigger);
    let _ = writeln!(out, "Max start: {}", scheduler.max_start);
    out.push('\n');

    let _ = writeln!(
        out,
        "Scheduler: ready={} excluded={}",
        scheduler.summary.ready, scheduler.summary.excluded
    );
    for item in &scheduler.ready_tasks {
        let _ = writeln!(
            out,
            "  [READY] {} owner={} deps={}",
            item.task_id, item.owner, item.deps
        );
    }
    for item in &scheduler.excluded_tasks {
        let _ = writeln!(
            out,
            "  [EXCLUDED] {} owner={} reason={} source={}",
            item.task_id,
            item.owner,
            item.reason.as_str(),
            item.source.as_str()
        );
    }

    out.push('\n');
    let _ = writeln!(
        out,
        "Runtime: total={} active={} stale={}",
        runtime.summary.total, runtime.summary.active, runtime.summary.stale
    );
    if !runtime.summary.state_counts.is_empty() {
        let states: Vec<String> = runtime
            .summary
            .state_counts
            .iter()
            .map(|(state, count)| format!("{state}:{count}"))
            .collect();
        let _ = writeln!(out, "  states={}", states.join(", "));
    }

    out.push('\n');
    let _ = writeln!(out, "Coordination: locks={}", coordination.summary.locks);
    for lock in &coordination.active_locks {
        let _ = writeln!(
            out,
            "  [LOCK] scope={} owner={} task={}",
            lock.scope, lock.owner, lock.task_id
        );
    }

    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, resolve_context};
    use std::path::Path;

    fn write_board(repo: &Path, rows: &[(&str, &str, &str, &str)]) {
        let mut text = String::from(
            "# Task Board\n\n| Area | ID | Title | Owner | Deps | Notes | Status |\n|---|---|---|---|---|---|---|\n",
        );
        for (id, owner, deps, status) in rows {
            text.push_str(&format!(
                "| core | {id} | title | {owner} | {deps} | n | {status} |\n"
            ));
        }
        std::fs::write(repo.join("BOARD.md"), text).unwrap();
    }

    fn context(repo: &Path) -> RunContext {
        let (config, cfg_path) = Config::load(repo, None).unwrap();
        resolve_context(repo, &config, &cfg_path, Some(".crew")).unwrap()
    }

    fn write_lock(ctx: &RunContext, name: &str, owner: &str, scope: &str, task_id: &str) {
        std::fs::create_dir_all(&ctx.lock_dir).unwrap();
        std::fs::write(
            ctx.lock_dir.join(name),
            format!("owner={owner}\nscope={scope}\ntask_id={task_id}\n"),
        )
        .unwrap();
    }

    fn write_pid(ctx: &RunContext, name: &str, owner: &str, scope: &str, task_id: &str, pid: u32) {
        std::fs::create_dir_all(&ctx.worker_dir).unwrap();
        std::fs::write(
            ctx.worker_dir.join(name),
            format!("owner={owner}\nscope={scope}\ntask_id={task_id}\npid={pid}\n"),
        )
        .unwrap();
    }

    #[test]
    fn ready_payload_partitions_the_board() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        let ctx = context(&repo);
        write_board(
            &repo,
            &[
                ("T1-001", "AgentA", "-", "TODO"),
                ("T1-002", "AgentA", "-", "TODO"),
                ("T1-003", "AgentB", "T9-999", "TODO"),
                ("T1-004", "AgentC", "-", "TODO"),
                ("T1-005", "AgentD", "-", "TODO"),
            ],
        );

        // A live worker pair for T1-001 and a stale pair for T1-005.
        write_lock(&ctx, "app-shell.lock", "AgentA", "app-shell", "T1-001");
        write_pid(
            &ctx,
            "worker-active.pid",
            "AgentA",
            "app-shell",
            "T1-001",
            std::process::id(),
        );
        write_lock(&ctx, "ui-popover.lock", "AgentD", "ui-popover", "T1-005");
        write_pid(
            &ctx,
            "worker-stale.pid",
            "AgentD",
            "ui-popover",
            "T1-005",
            99_999_999,
        );

        let payload = ready_payload(&ctx, "manual", None).unwrap();
        let ready: Vec<&str> = payload
            .plan
            .ready_tasks
            .iter()
            .map(|t| t.task_id.as_str())
            .collect();
        assert!(ready.contains(&"T1-004"));
        assert!(ready.contains(&"T1-005"));

        let excluded: BTreeMap<&str, (&str, &str)> = payload
            .plan
            .excluded_tasks
            .iter()
            .map(|t| (t.task_id.as_str(), (t.reason.as_str(), t.source.as_str())))
            .collect();
        assert_eq!(excluded["T1-001"], ("active_worker", "pid"));
        assert_eq!(excluded["T1-002"], ("owner_busy", "scheduler"));
        assert_eq!(excluded["T1-003"], ("deps_not_ready", "scheduler"));
    }

    #[test]
    fn ready_payload_bootstraps_missing_board() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        let ctx = context(&repo);

        let payload = ready_payload(&ctx, "manual", None).unwrap();
        assert!(payload.plan.ready_tasks.is_empty());
        assert!(ctx.board_file.exists());
    }

    #[test]
    fn status_payload_contains_unified_sections() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        let ctx = context(&repo);
        write_board(&repo, &[("T2-001", "AgentA", "-", "TODO")]);

        let payload = status_payload(&ctx, "manual", None).unwrap();
        assert_eq!(payload.scheduler.summary.ready, 1);
        assert_eq!(payload.scheduler.summary.excluded, 0);
        assert_eq!(payload.runtime.summary.active, 0);
        assert_eq!(payload.coordination.summary.locks, 0);
        assert_eq!(payload.task_board.summary.total, 1);
        assert_eq!(payload.task_board.tasks[0].scope, "app-shell");
        assert_eq!(payload.updates.summary.total, 0);

        let json = serde_json::to_value(&payload).unwrap();
        for section in ["scheduler", "runtime", "coordination", "task_board", "updates"] {
            assert!(json.get(section).is_some(), "missing section {section}");
        }
    }

    #[test]
    fn status_text_lists_partitions_and_locks() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        let ctx = context(&repo);
        write_board(
            &repo,
            &[
                ("T1-001", "AgentA", "-", "TODO"),
                ("T1-002", "AgentB", "G9", "TODO"),
            ],
        );
        write_lock(&ctx, "ci-release.lock", "AgentE", "ci-release", "T1-009");

        let payload = status_payload(&ctx, "cron", None).unwrap();
        let text = render_status_text(&payload);
        assert!(text.contains("Trigger: cron"));
        assert!(text.contains("[READY] T1-001 owner=AgentA deps=-"));
        assert!(text.contains("reason=deps_not_ready source=scheduler"));
        assert!(text.contains("Coordination: locks=1"));
        assert!(text.contains("[LOCK] scope=ci-release owner=AgentE task=T1-009"));
        assert!(text.contains("states=LOCKED:1"));
    }

    #[test]
    fn inventory_payload_summarizes_states() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        let ctx = context(&repo);
        write_lock(&ctx, "a.lock", "AgentA", "app-shell", "T1-001");

        let payload = inventory_payload(&ctx);
        assert_eq!(payload.summary.total, 1);
        assert_eq!(payload.summary.state_counts["LOCKED"], 1);
        assert_eq!(payload.workers[0].task_id, "T1-001");
    }

    #[test]
    fn max_start_override_wins_over_config() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        let ctx = context(&repo);
        write_board(
            &repo,
            &[
                ("T1-001", "AgentA", "-", "TODO"),
                ("T1-002", "AgentB", "-", "TODO"),
            ],
        );

        let payload = ready_payload(&ctx, "manual", Some(1)).unwrap();
        assert_eq!(payload.plan.ready_tasks.len(), 1);
        assert_eq!(payload.plan.max_start, 1);
    }
}
