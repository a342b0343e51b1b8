//! Task specification probing.
//!
//! The scheduler only needs a yes/no signal per task — does a spec document
//! exist, and does it pass validation — plus short summaries for display.
//! Everything else about spec documents (authoring, scaffolding, review)
//! belongs to other tooling, so the probe sits behind a trait and the
//! filesystem implementation stays deliberately small.

use std::path::{Path, PathBuf};

use serde::Serialize;

const SPEC_DIR: &str = "tasks";
const SUMMARY_MAX_CHARS: usize = 240;

/// Result of probing one task's spec document.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SpecEvaluation {
    pub exists: bool,
    pub valid: bool,
    pub errors: Vec<String>,
    pub spec_path: Option<PathBuf>,
    pub spec_rel_path: String,
    pub goal_summary: String,
    pub in_scope_summary: String,
    pub acceptance_summary: String,
}

impl SpecEvaluation {
    fn passing() -> Self {
        Self {
            exists: true,
            valid: true,
            ..Self::default()
        }
    }
}

/// Seam between the scheduler and the spec tooling.
pub trait SpecProbe {
    fn evaluate(&self, task_id: &str) -> SpecEvaluation;
}

/// Repo-relative path where a task's spec document lives.
pub fn spec_rel_path(task_id: &str) -> String {
    format!("{SPEC_DIR}/{task_id}.md")
}

/// Filesystem probe rooted at the repository.
///
/// Spec enforcement only applies once the repo has adopted the spec tree: a
/// repo without a `tasks/` directory schedules freely.
pub struct FsSpecProbe {
    repo_root: PathBuf,
}

impl FsSpecProbe {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
        }
    }
}

impl SpecProbe for FsSpecProbe {
    fn evaluate(&self, task_id: &str) -> SpecEvaluation {
        if !self.repo_root.join(SPEC_DIR).is_dir() {
            return SpecEvaluation::passing();
        }

        let rel = spec_rel_path(task_id);
        let path = self.repo_root.join(&rel);
        if !path.is_file() {
            return SpecEvaluation {
                spec_rel_path: rel,
                spec_path: Some(path),
                ..SpecEvaluation::default()
            };
        }

        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) => {
                return SpecEvaluation {
                    exists: true,
                    valid: false,
                    errors: vec![format!("unreadable spec: {err}")],
                    spec_rel_path: rel,
                    spec_path: Some(path),
                    ..SpecEvaluation::default()
                };
            }
        };

        let mut evaluation = evaluate_spec_text(&text);
        evaluation.spec_rel_path = rel;
        evaluation.spec_path = Some(path);
        evaluation
    }
}

/// Validate spec text and extract the section summaries.
pub fn evaluate_spec_text(text: &str) -> SpecEvaluation {
    let mut errors = Vec::new();

    let goal = section_summary(text, "Goal");
    let in_scope =
        section_summary(text, "In Scope").or_else(|| section_summary(text, "Scope"));
    let acceptance = section_summary(text, "Acceptance");

    if goal.is_none() {
        errors.push("missing or empty section: ## Goal".to_string());
    }
    if in_scope.is_none() {
        errors.push("missing or empty section: ## In Scope".to_string());
    }
    if acceptance.is_none() {
        errors.push("missing or empty section: ## Acceptance".to_string());
    }

    SpecEvaluation {
        exists: true,
        valid: errors.is_empty(),
        errors,
        goal_summary: goal.unwrap_or_default(),
        in_scope_summary: in_scope.unwrap_or_default(),
        acceptance_summary: acceptance.unwrap_or_default(),
        ..SpecEvaluation::default()
    }
}

/// First paragraph under `## <heading>`, flattened to one bounded line.
fn section_summary(text: &str, heading: &str) -> Option<String> {
    let mut in_section = false;
    let mut collected: Vec<&str> = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("##") {
            let title = rest.trim_start_matches('#').trim();
            if in_section {
                break;
            }
            in_section = title.eq_ignore_ascii_case(heading);
            continue;
        }
        if !in_section {
            continue;
        }
        if trimmed.is_empty() {
            if collected.is_empty() {
                continue;
            }
            break;
        }
        collected.push(trimmed);
    }

    if collected.is_empty() {
        return None;
    }
    let mut summary = collected.join(" ");
    if summary.chars().count() > SUMMARY_MAX_CHARS {
        summary = summary.chars().take(SUMMARY_MAX_CHARS).collect();
        summary.push_str("...");
    }
    Some(summary)
}
