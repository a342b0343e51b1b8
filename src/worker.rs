//! Worker state reconciliation.
//!
//! Two independently written signal sources describe what the fleet is doing:
//! liveness files (one per worker launch) and lock files (one per held
//! mutual-exclusion scope). Neither is transactional, so any snapshot may be
//! half-updated — a lock deleted a moment ago, a pid whose process just
//! exited. Reconciliation merges both inventories into one explicit state
//! machine per worker key instead of a lossy "running" boolean.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

/// Identity of one worker slot within a scan.
///
/// A record without a task id still needs a key so orphaned signals are never
/// silently dropped; the synthetic variants are namespaced by origin file, so
/// they can never collide with a real task id or with each other.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkerKey {
    Task(String),
    PidOnly(String),
    LockOnly {
        scope: String,
        owner: String,
        file: String,
    },
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerKey::Task(id) => write!(f, "{id}"),
            WorkerKey::PidOnly(stem) => write!(f, "PIDONLY:{stem}"),
            WorkerKey::LockOnly { scope, owner, file } => {
                write!(f, "LOCKONLY:{scope}:{owner}:{file}")
            }
        }
    }
}

/// Reconciled state of one worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    Running,
    LockStale,
    Finalizing,
    FinalizingExited,
    Locked,
    OrphanLock,
    OrphanPid,
    MissingWorktree,
    Unknown,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Running => "RUNNING",
            WorkerState::LockStale => "LOCK_STALE",
            WorkerState::Finalizing => "FINALIZING",
            WorkerState::FinalizingExited => "FINALIZING_EXITED",
            WorkerState::Locked => "LOCKED",
            WorkerState::OrphanLock => "ORPHAN_LOCK",
            WorkerState::OrphanPid => "ORPHAN_PID",
            WorkerState::MissingWorktree => "MISSING_WORKTREE",
            WorkerState::Unknown => "UNKNOWN",
        }
    }

    /// A worker in an active state holds real claims the scheduler must
    /// respect.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            WorkerState::Running | WorkerState::Locked | WorkerState::Finalizing
        )
    }

    /// A stale state means on-disk evidence has diverged from reality and
    /// needs operator cleanup.
    pub fn is_stale(self) -> bool {
        matches!(
            self,
            WorkerState::LockStale
                | WorkerState::FinalizingExited
                | WorkerState::OrphanLock
                | WorkerState::OrphanPid
                | WorkerState::MissingWorktree
        )
    }
}

/// One raw liveness file, as written by the launcher.
#[derive(Debug, Clone)]
pub struct PidEntry {
    pub key: WorkerKey,
    pub task_id: String,
    pub owner: String,
    pub scope: String,
    pub pid: String,
    pub pid_file: PathBuf,
    pub worktree: String,
    pub tmux_session: String,
    pub launch_backend: String,
    pub log_file: String,
}

/// One raw lock file, as written by the scope claimant.
#[derive(Debug, Clone)]
pub struct LockEntry {
    pub key: WorkerKey,
    pub task_id: String,
    pub owner: String,
    pub scope: String,
    pub lock_file: PathBuf,
    pub worktree: String,
}

/// Reconciled view of one worker slot.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerRecord {
    pub key: String,
    pub task_id: String,
    pub owner: String,
    pub scope: String,
    pub state: WorkerState,
    pub pid: Option<i32>,
    pub pid_alive: bool,
    pub pid_file: Option<PathBuf>,
    pub lock_file: Option<PathBuf>,
    pub worktree: Option<String>,
    pub tmux_session: Option<String>,
    pub launch_backend: Option<String>,
    pub log_file: Option<String>,
    pub worktree_exists: bool,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct InventorySummary {
    pub total: usize,
    pub state_counts: BTreeMap<&'static str, usize>,
}

/// Read one `key=value` field from a flat metadata file. Missing files and
/// missing keys both read as empty.
pub fn read_field(path: &Path, key: &str) -> String {
    let Ok(text) = std::fs::read_to_string(path) else {
        return String::new();
    };
    for line in text.lines() {
        let Some((lhs, rhs)) = line.split_once('=') else {
            continue;
        };
        if lhs.trim() == key {
            return rhs.trim().to_string();
        }
    }
    String::new()
}

/// Probe a pid with a no-op signal.
///
/// Permission denied still proves the process exists; only "no such process"
/// (or a malformed pid) reads as dead.
#[cfg(unix)]
pub fn is_pid_alive(pid_value: &str) -> bool {
    let Ok(pid) = pid_value.parse::<i32>() else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Safety: kill with signal 0 performs no action beyond the existence and
    // permission checks.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_pid_alive(_pid_value: &str) -> bool {
    false
}

fn sorted_entries(dir: &Path, extension: &str) -> Vec<PathBuf> {
    let Ok(read_dir) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = read_dir
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == extension))
        .collect();
    paths.sort();
    paths
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Scan the liveness directory. A missing directory is an empty inventory.
pub fn load_pid_inventory(worker_dir: &Path) -> Vec<PidEntry> {
    let mut rows = Vec::new();
    for path in sorted_entries(worker_dir, "pid") {
        let task_id = read_field(&path, "task_id");
        let key = if task_id.is_empty() {
            WorkerKey::PidOnly(file_stem(&path))
        } else {
            WorkerKey::Task(task_id.clone())
        };
        rows.push(PidEntry {
            key,
            task_id,
            owner: read_field(&path, "owner"),
            scope: read_field(&path, "scope"),
            pid: read_field(&path, "pid"),
            worktree: read_field(&path, "worktree"),
            tmux_session: read_field(&path, "tmux_session"),
            launch_backend: read_field(&path, "launch_backend"),
            log_file: read_field(&path, "log_file"),
            pid_file: path,
        });
    }
    rows
}

/// Scan the lock directory. A missing directory is an empty inventory.
pub fn load_lock_inventory(lock_dir: &Path) -> Vec<LockEntry> {
    let mut rows = Vec::new();
    for path in sorted_entries(lock_dir, "lock") {
        let task_id = read_field(&path, "task_id");
        let owner = read_field(&path, "owner");
        let scope = read_field(&path, "scope");
        let key = if task_id.is_empty() {
            WorkerKey::LockOnly {
                scope: scope.clone(),
                owner: owner.clone(),
                file: file_name(&path),
            }
        } else {
            WorkerKey::Task(task_id.clone())
        };
        rows.push(LockEntry {
            key,
            task_id,
            owner,
            scope,
            worktree: read_field(&path, "worktree"),
            lock_file: path,
        });
    }
    rows
}

fn first_nonempty(a: &str, b: &str) -> String {
    if a.is_empty() { b } else { a }.to_string()
}

fn classify_state(
    has_pid_file: bool,
    has_lock_file: bool,
    pid_alive: bool,
    worktree: &str,
    worktree_exists: bool,
) -> WorkerState {
    // A recorded-but-missing worktree dominates everything else: whatever the
    // signals say, the work area is gone.
    if !worktree.is_empty() && !worktree_exists {
        return if has_lock_file && !has_pid_file {
            WorkerState::OrphanLock
        } else if has_pid_file && !has_lock_file {
            WorkerState::OrphanPid
        } else {
            WorkerState::MissingWorktree
        };
    }
    match (has_pid_file, has_lock_file, pid_alive) {
        (true, true, true) => WorkerState::Running,
        (true, true, false) => WorkerState::LockStale,
        (true, false, true) => WorkerState::Finalizing,
        (true, false, false) => WorkerState::FinalizingExited,
        (false, true, _) => WorkerState::Locked,
        (false, false, _) => WorkerState::Unknown,
    }
}

/// Merge both inventories into one record per key, sorted by key.
pub fn classify_records(pid_rows: &[PidEntry], lock_rows: &[LockEntry]) -> Vec<WorkerRecord> {
    classify_records_with(pid_rows, lock_rows, is_pid_alive)
}

/// Classification with an injectable liveness probe, so tests can pin which
/// pids count as alive.
pub fn classify_records_with(
    pid_rows: &[PidEntry],
    lock_rows: &[LockEntry],
    alive: impl Fn(&str) -> bool,
) -> Vec<WorkerRecord> {
    let mut by_key: BTreeMap<&WorkerKey, (Option<&PidEntry>, Option<&LockEntry>)> = BTreeMap::new();
    for row in pid_rows {
        by_key.entry(&row.key).or_default().0 = Some(row);
    }
    for row in lock_rows {
        by_key.entry(&row.key).or_default().1 = Some(row);
    }

    let mut records = Vec::with_capacity(by_key.len());
    for (key, (pid_row, lock_row)) in by_key {
        let pid_task = pid_row.map(|r| r.task_id.as_str()).unwrap_or("");
        let lock_task = lock_row.map(|r| r.task_id.as_str()).unwrap_or("");
        let task_id = if pid_task.is_empty() && lock_task.is_empty() {
            key.to_string()
        } else {
            first_nonempty(pid_task, lock_task)
        };

        let owner = first_nonempty(
            pid_row.map(|r| r.owner.as_str()).unwrap_or(""),
            lock_row.map(|r| r.owner.as_str()).unwrap_or(""),
        );
        let scope = first_nonempty(
            pid_row.map(|r| r.scope.as_str()).unwrap_or(""),
            lock_row.map(|r| r.scope.as_str()).unwrap_or(""),
        );
        let worktree = first_nonempty(
            pid_row.map(|r| r.worktree.as_str()).unwrap_or(""),
            lock_row.map(|r| r.worktree.as_str()).unwrap_or(""),
        );

        let pid_value = pid_row.map(|r| r.pid.as_str()).unwrap_or("");
        let pid_alive = pid_row.is_some() && alive(pid_value);
        let worktree_exists = !worktree.is_empty() && Path::new(&worktree).exists();

        let state = classify_state(
            pid_row.is_some(),
            lock_row.is_some(),
            pid_alive,
            &worktree,
            worktree_exists,
        );
        debug!(key = %key, state = state.as_str(), "classified worker record");

        records.push(WorkerRecord {
            key: key.to_string(),
            task_id,
            owner,
            scope,
            state,
            pid: pid_value.parse::<i32>().ok().filter(|p| *p > 0),
            pid_alive,
            pid_file: pid_row.map(|r| r.pid_file.clone()),
            lock_file: lock_row.map(|r| r.lock_file.clone()),
            worktree: (!worktree.is_empty()).then_some(worktree),
            tmux_session: pid_row
                .map(|r| r.tmux_session.clone())
                .filter(|s| !s.is_empty()),
            launch_backend: pid_row
                .map(|r| r.launch_backend.clone())
                .filter(|s| !s.is_empty()),
            log_file: pid_row.map(|r| r.log_file.clone()).filter(|s| !s.is_empty()),
            worktree_exists,
            stale: state.is_stale(),
        });
    }
    records
}

pub fn summarize(records: &[WorkerRecord]) -> InventorySummary {
    let mut state_counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for record in records {
        *state_counts.entry(record.state.as_str()).or_default() += 1;
    }
    InventorySummary {
        total: records.len(),
        state_counts,
    }
}
