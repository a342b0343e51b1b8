//! Task board parsing — pipe-delimited markdown tables plus inline gate
//! markers.
//!
//! The board is the shared source of truth for what work exists, who owns it,
//! and what it depends on. Parsing is a pure function of the file text and the
//! column schema; every call rebuilds the rows from scratch.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::config::BoardSchema;

#[derive(Debug, Error)]
pub enum BoardError {
    #[error("task board not found: {path}")]
    NotFound { path: PathBuf },
    #[error("failed to read task board {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// One data row of the board table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRow {
    pub id: String,
    pub title: String,
    pub owner: String,
    pub deps: String,
    pub status: String,
}

/// Gate display state, derived from the marker's parenthesized text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateState {
    Done,
    Pending,
}

/// Parsed board: row order follows first appearance in the file.
#[derive(Debug, Clone)]
pub struct Board {
    pub tasks: Vec<TaskRow>,
    pub gates: BTreeMap<String, GateState>,
}

impl Board {
    /// Task id → status, for dependency resolution.
    pub fn status_index(&self) -> BTreeMap<&str, &str> {
        self.tasks
            .iter()
            .map(|t| (t.id.as_str(), t.status.as_str()))
            .collect()
    }
}

/// Split a board line into cells, or None when the line is not a table row.
///
/// A row must start and end with `|` after trimming. `\|` inside a cell is a
/// literal pipe; any other backslash is preserved. The returned vector carries
/// the implied empty leading/trailing cells so 1-based schema columns index
/// directly.
pub fn split_table_row(line: &str) -> Option<Vec<String>> {
    let text = line.trim();
    if !text.starts_with('|') || !text.ends_with('|') || text.len() < 2 {
        return None;
    }

    let mut cells = Vec::new();
    let mut buf = String::new();
    let mut escaped = false;
    for ch in text[1..text.len() - 1].chars() {
        if escaped {
            if ch != '|' {
                buf.push('\\');
            }
            buf.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '|' => {
                cells.push(buf.trim().to_string());
                buf.clear();
            }
            _ => buf.push(ch),
        }
    }
    if escaped {
        buf.push('\\');
    }
    cells.push(buf.trim().to_string());

    let mut padded = Vec::with_capacity(cells.len() + 2);
    padded.push(String::new());
    padded.extend(cells);
    padded.push(String::new());
    Some(padded)
}

fn field<'a>(cells: &'a [String], col: usize) -> &'a str {
    col.checked_sub(1)
        .and_then(|idx| cells.get(idx))
        .map(String::as_str)
        .unwrap_or("")
}

/// A skipped row is a header or separator: empty id, the literal header
/// token, or a run of dashes.
fn is_header_or_separator(id: &str) -> bool {
    id.is_empty() || id == "ID" || id.chars().all(|c| c == '-')
}

static GATE_STATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([^)]*)\)").unwrap());

/// Parse the board text against a column schema and gate marker pattern.
pub fn parse_board_text(text: &str, schema: &BoardSchema) -> Board {
    let mut tasks = Vec::new();

    for line in text.lines() {
        let Some(cells) = split_table_row(line) else {
            continue;
        };
        let id = field(&cells, schema.id_col);
        if is_header_or_separator(id) {
            continue;
        }
        tasks.push(TaskRow {
            id: id.to_string(),
            title: field(&cells, schema.title_col).to_string(),
            owner: field(&cells, schema.owner_col).to_string(),
            deps: field(&cells, schema.deps_col).to_string(),
            status: field(&cells, schema.status_col).to_string(),
        });
    }

    // Gates live anywhere in the document, not just inside the table. A later
    // marker for the same gate id overrides an earlier one.
    let mut gates = BTreeMap::new();
    for line in text.lines() {
        let Some(caps) = schema.gate_regex.captures(line) else {
            continue;
        };
        let Some(token) = caps.get(1).map(|m| m.as_str()) else {
            continue;
        };
        let gate_id = token.split(' ').next().unwrap_or(token).to_string();
        let state_text = GATE_STATE_RE
            .captures(token)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_lowercase())
            .unwrap_or_default();
        let state = if schema.done_keywords.contains(&state_text) {
            GateState::Done
        } else {
            GateState::Pending
        };
        gates.insert(gate_id, state);
    }

    Board { tasks, gates }
}

/// Parse the board from a file. A missing file is a `NotFound` error — the
/// caller decides whether to bootstrap a fresh board instead.
pub fn parse_board_file(path: &Path, schema: &BoardSchema) -> Result<Board, BoardError> {
    if !path.exists() {
        return Err(BoardError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let text = std::fs::read_to_string(path).map_err(|source| BoardError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_board_text(&text, schema))
}

static GATE_DEP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^G\d+$").unwrap());
static TASK_DEP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^T\d+-\d+$").unwrap());

fn is_vacuous_deps(raw: &str) -> bool {
    raw.is_empty() || raw == "-" || raw.eq_ignore_ascii_case("none")
}

/// Check whether every dependency token is satisfied.
///
/// Gate tokens (`G<n>`) must be DONE in the gate map; task tokens
/// (`T<n>-<n>`) must have the literal DONE status on the board. Any other
/// token shape can never be satisfied.
pub fn deps_ready(
    deps: &str,
    task_status: &BTreeMap<&str, &str>,
    gates: &BTreeMap<String, GateState>,
) -> bool {
    let raw = deps.trim();
    if is_vacuous_deps(raw) {
        return true;
    }

    for token in raw.split(',') {
        let dep = token.trim();
        if dep.is_empty() {
            continue;
        }
        if GATE_DEP_RE.is_match(dep) {
            if gates.get(dep) != Some(&GateState::Done) {
                return false;
            }
        } else if TASK_DEP_RE.is_match(dep) {
            if task_status.get(dep).copied() != Some("DONE") {
                return false;
            }
        } else {
            return false;
        }
    }
    true
}

/// Default contents written when the board file is missing.
pub const BOARD_TEMPLATE: &str = "\
# Task Board

| Area | ID | Title | Owner | Deps | Notes | Status |
|---|---|---|---|---|---|---|
";

/// Create the board file with the default header when it does not exist yet.
pub fn ensure_board_file(path: &Path) -> std::io::Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, BOARD_TEMPLATE)
}
