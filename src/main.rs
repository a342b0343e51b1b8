use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde_json::json;
use tracing::info;

use crew_cli::cli::{Cli, Command, DataFormat, PathsFormat, SelectCommand, SessionFormat, StatusFormat};
use crew_cli::config::{Config, RunContext, owner_key, resolve_context};
use crew_cli::session::{self, DEFAULT_TAIL_BYTES};
use crew_cli::shell_completion;
use crew_cli::status;
use crew_cli::worker::WorkerRecord;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // The lib target is crew_cli; the bin target is crew. Filter both.
    let filter = match cli.verbose {
        0 => "crew=info,crew_cli=info",
        1 => "crew=debug,crew_cli=debug",
        _ => "crew=trace,crew_cli=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Command::Completions { shell } = cli.command {
        return shell_completion::print(shell);
    }

    if let Command::Session {
        ref log,
        ref capture,
        max_blocks,
        max_lines,
        format,
    } = cli.command
    {
        return run_session(log.as_deref(), capture.as_deref(), max_blocks, max_lines, format);
    }

    let repo_root = resolve_repo_root(cli.repo.as_deref())?;
    let (config, config_path) = Config::load(&repo_root, cli.config.as_deref())?;
    let ctx = resolve_context(&repo_root, &config, &config_path, cli.state_dir.as_deref())?;
    info!(
        repo = %ctx.repo_root.display(),
        config = %ctx.config_path.display(),
        "resolved context"
    );

    match cli.command {
        Command::Ready {
            trigger,
            max_start,
            format,
        } => run_ready(&ctx, &trigger, max_start, format),
        Command::Inventory { format } => run_inventory(&ctx, format),
        Command::Status {
            trigger,
            max_start,
            format,
        } => run_status(&ctx, &trigger, max_start, format),
        Command::Select(select) => run_select(&ctx, select),
        Command::Paths { format } => run_paths(&ctx, format),
        Command::Session { .. } | Command::Completions { .. } => unreachable!("handled above"),
    }
}

/// Resolve the repository root with git; any path inside the repo works.
fn resolve_repo_root(repo_arg: Option<&Path>) -> Result<PathBuf> {
    let mut cmd = std::process::Command::new("git");
    if let Some(repo) = repo_arg {
        cmd.arg("-C").arg(repo);
    }
    cmd.args(["rev-parse", "--show-toplevel"]);

    let output = cmd.output().context("failed to run git")?;
    if !output.status.success() {
        match repo_arg {
            Some(repo) => bail!("--repo is not a git repository: {}", repo.display()),
            None => bail!("unable to detect a git repository; run inside one or pass --repo"),
        }
    }
    Ok(PathBuf::from(
        String::from_utf8_lossy(&output.stdout).trim(),
    ))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to serialize payload")?
    );
    Ok(())
}

fn run_ready(
    ctx: &RunContext,
    trigger: &str,
    max_start: Option<usize>,
    format: DataFormat,
) -> Result<()> {
    let payload = status::ready_payload(ctx, trigger, max_start)?;
    match format {
        DataFormat::Json => print_json(&payload),
        DataFormat::Tsv => {
            for task in &payload.plan.ready_tasks {
                println!(
                    "{}",
                    [
                        task.task_id.as_str(),
                        task.title.as_str(),
                        task.owner.as_str(),
                        task.scope.as_str(),
                        task.deps.as_str(),
                        task.status.as_str(),
                        task.spec_rel_path.as_str(),
                        task.goal_summary.as_str(),
                        task.in_scope_summary.as_str(),
                        task.acceptance_summary.as_str(),
                    ]
                    .join("\t")
                );
            }
            Ok(())
        }
    }
}

fn worker_tsv_row(record: &WorkerRecord) -> String {
    let flag = |b: bool| if b { "1" } else { "0" };
    [
        record.key.clone(),
        record.task_id.clone(),
        record.owner.clone(),
        record.scope.clone(),
        record.state.as_str().to_string(),
        record.pid.map(|p| p.to_string()).unwrap_or_default(),
        flag(record.pid_alive).to_string(),
        record
            .pid_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        record
            .lock_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        record.worktree.clone().unwrap_or_default(),
        record.tmux_session.clone().unwrap_or_default(),
        flag(record.worktree_exists).to_string(),
        flag(record.stale).to_string(),
    ]
    .join("\t")
}

fn print_workers(workers: &[WorkerRecord], format: DataFormat) -> Result<()> {
    match format {
        DataFormat::Json => print_json(&json!({ "workers": workers })),
        DataFormat::Tsv => {
            for record in workers {
                println!("{}", worker_tsv_row(record));
            }
            Ok(())
        }
    }
}

fn run_inventory(ctx: &RunContext, format: DataFormat) -> Result<()> {
    let payload = status::inventory_payload(ctx);
    match format {
        DataFormat::Json => print_json(&payload),
        DataFormat::Tsv => print_workers(&payload.workers, DataFormat::Tsv),
    }
}

fn run_status(
    ctx: &RunContext,
    trigger: &str,
    max_start: Option<usize>,
    format: StatusFormat,
) -> Result<()> {
    let payload = status::status_payload(ctx, trigger, max_start)?;
    match format {
        StatusFormat::Json => print_json(&payload),
        StatusFormat::Text => {
            println!("{}", status::render_status_text(&payload));
            Ok(())
        }
    }
}

fn run_select(ctx: &RunContext, select: SelectCommand) -> Result<()> {
    let payload = status::inventory_payload(ctx);
    match select {
        SelectCommand::Stop {
            task,
            owner,
            all,
            format,
        } => {
            let selectors = [task.is_some(), owner.is_some(), all];
            if selectors.iter().filter(|s| **s).count() != 1 {
                bail!("select stop requires exactly one of --task, --owner, --all");
            }
            let selected: Vec<WorkerRecord> = payload
                .workers
                .into_iter()
                .filter(|record| {
                    if let Some(ref task_id) = task {
                        record.task_id == *task_id
                    } else if let Some(ref owner) = owner {
                        owner_key(&record.owner) == owner_key(owner)
                    } else {
                        true
                    }
                })
                .collect();
            print_workers(&selected, format)
        }
        SelectCommand::Stale { format } => {
            let selected: Vec<WorkerRecord> =
                payload.workers.into_iter().filter(|r| r.stale).collect();
            print_workers(&selected, format)
        }
    }
}

fn run_session(
    log: Option<&Path>,
    capture: Option<&Path>,
    max_blocks: usize,
    max_lines: usize,
    format: SessionFormat,
) -> Result<()> {
    if log.is_none() && capture.is_none() {
        bail!("session requires --log and/or --capture");
    }

    let log_tail = log
        .map(|path| session::read_tail_text(path, DEFAULT_TAIL_BYTES))
        .unwrap_or_default();
    let raw_capture = match capture {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read capture {}", path.display()))?,
        None => String::new(),
    };

    let view = session::parse_session(&raw_capture, &log_tail, max_blocks, max_lines);
    match format {
        SessionFormat::Json => print_json(&view),
        SessionFormat::Markdown => {
            println!("{}", session::blocks_to_markdown(&view.blocks));
            Ok(())
        }
    }
}

/// POSIX single-quote escaping, for `paths --format env` output meant to be
/// eval'd by a shell.
fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':'))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn run_paths(ctx: &RunContext, format: PathsFormat) -> Result<()> {
    match format {
        PathsFormat::Json => print_json(&json!({
            "repo_root": ctx.repo_root,
            "repo_name": ctx.repo_name,
            "base_branch": ctx.base_branch,
            "board_file": ctx.board_file,
            "state_dir": ctx.state_dir,
            "lock_dir": ctx.lock_dir,
            "worker_dir": ctx.worker_dir,
            "updates_file": ctx.updates_file,
            "worktree_parent": ctx.worktree_parent,
            "runtime": ctx.runtime,
            "owners": ctx.owners,
            "owners_by_key": ctx.owners_by_key,
            "config_path": ctx.config_path,
        })),
        PathsFormat::Env => {
            let owners_json =
                serde_json::to_string(&ctx.owners).context("failed to serialize owners")?;
            let owners_by_key_json = serde_json::to_string(&ctx.owners_by_key)
                .context("failed to serialize owner keys")?;
            let pairs = [
                ("REPO_ROOT", ctx.repo_root.display().to_string()),
                ("REPO_NAME", ctx.repo_name.clone()),
                ("BASE_BRANCH", ctx.base_branch.clone()),
                ("BOARD_FILE", ctx.board_file.display().to_string()),
                ("STATE_DIR", ctx.state_dir.display().to_string()),
                ("LOCK_DIR", ctx.lock_dir.display().to_string()),
                ("WORKER_DIR", ctx.worker_dir.display().to_string()),
                ("UPDATES_FILE", ctx.updates_file.display().to_string()),
                (
                    "WORKTREE_PARENT_DIR",
                    ctx.worktree_parent.display().to_string(),
                ),
                ("MAX_START", ctx.runtime.max_start.to_string()),
                ("LAUNCH_BACKEND", ctx.runtime.launch_backend.clone()),
                (
                    "AUTO_NO_LAUNCH",
                    if ctx.runtime.auto_no_launch { "1" } else { "0" }.to_string(),
                ),
                ("AGENT_FLAGS", ctx.runtime.agent_flags.clone()),
                ("CONFIG_PATH", ctx.config_path.display().to_string()),
                ("OWNERS_JSON", owners_json),
                ("OWNERS_BY_KEY_JSON", owners_by_key_json),
            ];
            for (key, value) in pairs {
                println!("{key}={}", shell_quote(&value));
            }
            Ok(())
        }
    }
}
