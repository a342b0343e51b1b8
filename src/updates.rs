//! Agent progress log — the append-only `UPDATES.md` pipe table.
//!
//! Agents append one row per status change. The file is display-only input
//! here: rows that do not parse are skipped, and only a bounded window of the
//! most recent entries is kept.

use std::path::Path;

use serde::Serialize;

use crate::board::split_table_row;

pub const DEFAULT_UPDATES_LIMIT: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateEntry {
    pub timestamp: String,
    pub agent: String,
    pub task_id: String,
    pub status: String,
    pub summary: String,
}

/// Parse the updates log, newest entry first. A missing or unreadable file
/// is an empty log.
pub fn load_updates(path: &Path, limit: usize) -> Vec<UpdateEntry> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    parse_updates_text(&text, limit)
}

pub fn parse_updates_text(text: &str, limit: usize) -> Vec<UpdateEntry> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let Some(cells) = split_table_row(line) else {
            continue;
        };
        // Padded row: cells[0] is the implied empty leading cell.
        let cells = &cells[1..cells.len().saturating_sub(1)];
        if cells.len() < 5 {
            continue;
        }
        if cells[0].to_lowercase().starts_with("timestamp") {
            continue;
        }
        if cells
            .iter()
            .all(|cell| cell.is_empty() || cell.chars().all(|c| c == '-'))
        {
            continue;
        }
        entries.push(UpdateEntry {
            timestamp: cells[0].clone(),
            agent: cells[1].clone(),
            task_id: cells[2].clone(),
            status: cells[3].clone(),
            summary: cells[4].clone(),
        });
    }

    if limit > 0 && entries.len() > limit {
        entries.drain(..entries.len() - limit);
    }
    entries.reverse();
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
| Timestamp (UTC) | Agent | Task | Status | Summary |
|---|---|---|---|---|
| 2026-08-01T10:00:00Z | AgentA | T1-001 | DONE | merged |
| 2026-08-01T11:00:00Z | AgentB | T1-002 | IN_PROGRESS | wiring tests |
";

    #[test]
    fn parses_rows_newest_first() {
        let entries = parse_updates_text(SAMPLE, 200);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].task_id, "T1-002");
        assert_eq!(entries[0].status, "IN_PROGRESS");
        assert_eq!(entries[1].agent, "AgentA");
    }

    #[test]
    fn header_separator_and_short_rows_are_skipped() {
        let text = "\
| Timestamp | Agent | Task | Status | Summary |
|---|---|---|---|---|
| only | four | cells | here |
prose line
";
        assert!(parse_updates_text(text, 200).is_empty());
    }

    #[test]
    fn limit_keeps_most_recent_entries() {
        let mut text = String::from("| Timestamp | Agent | Task | Status | Summary |\n");
        for i in 0..10 {
            text.push_str(&format!("| t{i} | a | T1-00{i} | DONE | s |\n"));
        }
        let entries = parse_updates_text(&text, 3);
        assert_eq!(entries.len(), 3);
        // Newest first within the kept window.
        assert_eq!(entries[0].timestamp, "t9");
        assert_eq!(entries[2].timestamp, "t7");
    }

    #[test]
    fn missing_file_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(load_updates(&tmp.path().join("UPDATES.md"), 200).is_empty());
    }
}
