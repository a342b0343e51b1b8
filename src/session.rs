//! Session output normalization.
//!
//! Agents emit a JSONL event log when they can and a raw terminal transcript
//! always. This module turns either into one ordered sequence of typed display
//! blocks: the event log is authoritative when at least one line parses, the
//! transcript is the fallback. Classification never aborts on a bad line —
//! unparseable lines are skipped one at a time.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

/// Bodies are previews, not archives.
pub const MAX_PREVIEW_CHARS: usize = 1200;

/// Default byte window when tailing an event log file.
pub const DEFAULT_TAIL_BYTES: u64 = 180_000;

const NO_OUTPUT_PLACEHOLDER: &str = "(No output yet)";
const DEFAULT_STREAM: &str = "__default__";

static CODE_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```([^\n`]*)\n(.*?)```").unwrap());
static SHELL_WRAP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:/bin/(?:ba|z)sh|bash|zsh)\s+-lc\s+(.+)$").unwrap());
// CSI sequences, OSC sequences, and simple two-byte escapes.
static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[^\[\]]").unwrap()
});

const REASONING_TOKENS: [&str; 4] = ["reasoning", "thinking", "thought", "analysis"];
const MESSAGE_ITEM_TYPES: [&str; 4] =
    ["message", "agent_message", "assistant_message", "user_message"];
const REASONING_ITEM_TYPES: [&str; 4] = ["reasoning", "analysis", "thinking", "thought"];
const COMMAND_ITEM_TYPES: [&str; 3] = ["command_execution", "command", "shell_command"];
const CALL_ITEM_TYPES: [&str; 5] = [
    "function_call",
    "tool_call",
    "web_search_call",
    "computer_call",
    "mcp_call",
];
const OUTPUT_ITEM_TYPES: [&str; 3] = ["function_call_output", "tool_result", "output"];

/// One displayable unit of agent activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionBlock {
    pub kind: BlockKind,
    pub label: String,
    pub body: String,
    pub event_type: String,
    pub timestamp: String,
    pub item_type: String,
    pub role: String,
    pub item_id: String,
    pub item_status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    ChatAgent,
    ChatCodex,
    Think,
    Code,
    ToolCall,
    ToolResult,
    Error,
    Status,
    Event,
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewSource {
    Jsonl,
    Transcript,
}

/// Final normalized view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub source: ViewSource,
    pub parsed_events: usize,
    pub blocks: Vec<SessionBlock>,
}

impl SessionBlock {
    fn new(kind: BlockKind, label: &str, body: String) -> Self {
        Self {
            kind,
            label: label.to_string(),
            body,
            event_type: String::new(),
            timestamp: String::new(),
            item_type: String::new(),
            role: String::new(),
            item_id: String::new(),
            item_status: String::new(),
        }
    }
}

/// Remove terminal escape sequences and carriage returns.
pub fn strip_ansi(text: &str) -> String {
    ANSI_RE.replace_all(&text.replace('\r', ""), "").to_string()
}

/// Read at most the trailing `max_bytes` of a file; missing files read empty.
pub fn read_tail_text(path: &Path, max_bytes: u64) -> String {
    let Ok(mut file) = std::fs::File::open(path) else {
        return String::new();
    };
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);
    let start = size.saturating_sub(max_bytes);
    if file.seek(SeekFrom::Start(start)).is_err() {
        return String::new();
    }
    let mut raw = Vec::new();
    if file.read_to_end(&mut raw).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&raw).to_string()
}

fn iter_json_objects(text: &str) -> Vec<Map<String, Value>> {
    let mut parsed = Vec::new();
    for raw_line in text.lines() {
        let line = raw_line.trim();
        if !line.starts_with('{') {
            continue;
        }
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(line) {
            parsed.push(map);
        }
    }
    parsed
}

fn normalize_fragment(text: &str) -> String {
    strip_ansi(text).trim().to_string()
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_PREVIEW_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(MAX_PREVIEW_CHARS).collect();
    out.push_str("...");
    out
}

fn format_payload(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => truncate(&normalize_fragment(s)),
        other => {
            let rendered =
                serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string());
            truncate(strip_ansi(&rendered).trim())
        }
    }
}

fn unwrap_shell_command(command: &str) -> String {
    let cleaned = normalize_fragment(command);
    if cleaned.is_empty() {
        return cleaned;
    }
    let Some(caps) = SHELL_WRAP_RE.captures(&cleaned) else {
        return cleaned;
    };
    let mut payload = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
    let bytes = payload.as_bytes();
    if payload.len() >= 2
        && bytes[0] == bytes[payload.len() - 1]
        && (bytes[0] == b'\'' || bytes[0] == b'"')
    {
        payload = &payload[1..payload.len() - 1];
    }
    let inner = normalize_fragment(payload);
    if inner.is_empty() { cleaned } else { inner }
}

/// Strip bold markers that wrap the whole fragment, repeatedly.
fn strip_wrapped_bold(text: &str) -> String {
    let mut cleaned = normalize_fragment(text);
    while cleaned.starts_with("**") && cleaned.ends_with("**") && cleaned.chars().count() > 4 {
        let inner = cleaned[2..cleaned.len() - 2].trim();
        if inner.is_empty() {
            break;
        }
        cleaned = inner.to_string();
    }
    cleaned
}

/// Role-scoped text walk over an arbitrary event payload.
///
/// Explicit worklist instead of recursion — payload depth is attacker
/// controlled. Each frame carries the role inherited from its enclosing
/// object; a `role` field re-scopes everything beneath it.
fn collect_role_text(root: &Value, role_filter: Option<&str>) -> Vec<String> {
    let mut fragments = Vec::new();
    let mut stack: Vec<(&Value, String)> = vec![(root, String::new())];

    while let Some((node, inherited_role)) = stack.pop() {
        match node {
            Value::String(s) => {
                if role_filter.is_none_or(|want| inherited_role == want) {
                    fragments.push(s.clone());
                }
            }
            Value::Array(items) => {
                for item in items.iter().rev() {
                    stack.push((item, inherited_role.clone()));
                }
            }
            Value::Object(map) => {
                let mut current_role = inherited_role;
                if let Some(Value::String(role)) = map.get("role") {
                    let trimmed = role.trim();
                    if !trimmed.is_empty() {
                        current_role = trimmed.to_lowercase();
                    }
                }
                for key in ["text", "output_text"] {
                    if let Some(Value::String(value)) = map.get(key)
                        && role_filter.is_none_or(|want| current_role == want)
                    {
                        fragments.push(value.clone());
                    }
                }
                let mut children: Vec<&Value> = Vec::new();
                if let Some(content) = map.get("content")
                    && (content.is_object() || content.is_array())
                {
                    children.push(content);
                }
                for (key, value) in map {
                    if matches!(key.as_str(), "role" | "text" | "output_text" | "content") {
                        continue;
                    }
                    if value.is_object() || value.is_array() {
                        children.push(value);
                    }
                }
                for child in children.into_iter().rev() {
                    stack.push((child, current_role.clone()));
                }
            }
            _ => {}
        }
    }
    fragments
}

/// Clean fragments, drop empties, collapse duplicates, and let a fragment
/// that merely grew (streaming re-emit) replace its shorter prefix.
fn normalize_fragments(fragments: Vec<String>) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::new();
    for fragment in fragments {
        let cleaned = normalize_fragment(&fragment);
        if cleaned.is_empty() {
            continue;
        }
        if let Some(last) = normalized.last() {
            if cleaned == *last {
                continue;
            }
            if last.len() > 24 && cleaned.len() > last.len() && cleaned.starts_with(last.as_str()) {
                *normalized.last_mut().unwrap() = cleaned;
                continue;
            }
        }
        normalized.push(cleaned);
    }
    normalized
}

fn extract_role_fragments(event: &Map<String, Value>, role: &str) -> Vec<String> {
    normalize_fragments(collect_role_text(&Value::Object(event.clone()), Some(role)))
}

fn event_type_of(event: &Map<String, Value>) -> String {
    for key in ["type", "event"] {
        if let Some(Value::String(value)) = event.get(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return trimmed.to_lowercase();
            }
        }
    }
    String::new()
}

fn pick_nested<'a>(node: &'a Map<String, Value>, path: &[&str]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut current = node.get(*first)?;
    for key in rest {
        current = current.as_object()?.get(*key)?;
    }
    Some(current)
}

fn nonempty_str(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

fn first_nonempty(values: &[Option<&Value>]) -> String {
    values
        .iter()
        .find_map(|v| nonempty_str(*v))
        .unwrap_or_default()
}

fn event_timestamp(event: &Map<String, Value>) -> String {
    first_nonempty(&[
        event.get("timestamp"),
        event.get("time"),
        event.get("created_at"),
        event.get("ts"),
        pick_nested(event, &["response", "created_at"]),
    ])
}

fn tool_name_from_event(event: &Map<String, Value>) -> String {
    first_nonempty(&[
        event.get("tool_name"),
        pick_nested(event, &["tool", "name"]),
        pick_nested(event, &["tool_call", "name"]),
        pick_nested(event, &["call", "name"]),
        pick_nested(event, &["function", "name"]),
        pick_nested(event, &["function_call", "name"]),
    ])
}

fn lower_str(value: Option<&Value>) -> String {
    value
        .and_then(Value::as_str)
        .map(|s| s.trim().to_lowercase())
        .unwrap_or_default()
}

fn item_id_from_item(item: &Map<String, Value>) -> String {
    first_nonempty(&[
        item.get("id"),
        item.get("item_id"),
        item.get("output_item_id"),
        item.get("call_id"),
        item.get("tool_call_id"),
        pick_nested(item, &["call", "id"]),
        pick_nested(item, &["function", "call_id"]),
    ])
}

fn stream_id_from_event(event: &Map<String, Value>) -> String {
    first_nonempty(&[
        event.get("item_id"),
        event.get("output_item_id"),
        event.get("call_id"),
        event.get("tool_call_id"),
        pick_nested(event, &["item", "id"]),
        pick_nested(event, &["delta", "id"]),
    ])
}

fn extract_text_from_content_part(part: &Map<String, Value>) -> String {
    for key in [
        "text",
        "output_text",
        "input_text",
        "summary_text",
        "reasoning",
        "delta",
    ] {
        if let Some(Value::String(value)) = part.get(key)
            && !value.trim().is_empty()
        {
            return value.clone();
        }
    }
    match part.get("content") {
        Some(Value::String(payload)) if !payload.trim().is_empty() => payload.clone(),
        Some(payload @ (Value::Object(_) | Value::Array(_))) => format_payload(payload),
        _ => String::new(),
    }
}

fn iter_output_items<'a>(event: &'a Map<String, Value>) -> Vec<&'a Map<String, Value>> {
    let mut items = Vec::new();
    if let Some(Value::Object(item)) = event.get("item") {
        items.push(item);
    }
    if let Some(Value::Array(entries)) = pick_nested(event, &["response", "output"]) {
        items.extend(entries.iter().filter_map(Value::as_object));
    }
    if let Some(Value::Array(entries)) = event.get("output") {
        items.extend(entries.iter().filter_map(Value::as_object));
    }
    items
}

struct BlockContext<'a> {
    event_type: &'a str,
    timestamp: &'a str,
}

/// Split chat text at fenced code regions into alternating chat/code blocks.
#[allow(clippy::too_many_arguments)]
fn split_chat_and_code_blocks(
    text: &str,
    chat_kind: BlockKind,
    chat_label: &str,
    ctx: &BlockContext<'_>,
    item_type: &str,
    role: &str,
    item_id: &str,
) -> Vec<SessionBlock> {
    let make_chat = |body: String| SessionBlock {
        kind: chat_kind,
        label: chat_label.to_string(),
        body,
        event_type: ctx.event_type.to_string(),
        timestamp: ctx.timestamp.to_string(),
        item_type: item_type.to_string(),
        role: role.to_string(),
        item_id: item_id.to_string(),
        item_status: String::new(),
    };

    let mut blocks = Vec::new();
    let mut cursor = 0;

    for caps in CODE_FENCE_RE.captures_iter(text) {
        let whole = caps.get(0).unwrap();
        let before = normalize_fragment(&text[cursor..whole.start()]);
        if !before.is_empty() {
            blocks.push(make_chat(truncate(&before)));
        }

        let language = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        let code_body = normalize_fragment(caps.get(2).map(|m| m.as_str()).unwrap_or(""));
        if !code_body.is_empty() {
            let label = if language.is_empty() {
                "Code".to_string()
            } else {
                format!("Code · {language}")
            };
            blocks.push(SessionBlock {
                kind: BlockKind::Code,
                label,
                body: truncate(&code_body),
                event_type: ctx.event_type.to_string(),
                timestamp: ctx.timestamp.to_string(),
                item_type: "code".to_string(),
                role: role.to_string(),
                item_id: item_id.to_string(),
                item_status: String::new(),
            });
        }
        cursor = whole.end();
    }

    let tail = normalize_fragment(&text[cursor..]);
    if !tail.is_empty() {
        blocks.push(make_chat(truncate(&tail)));
    }

    if blocks.is_empty() {
        let body = normalize_fragment(text);
        if !body.is_empty() {
            blocks.push(make_chat(truncate(&body)));
        }
    }

    blocks
}

fn is_reasoning_type(event_type: &str) -> bool {
    REASONING_TOKENS.iter().any(|t| event_type.contains(t))
}

fn extract_reasoning_fragments(event: &Map<String, Value>, event_type: &str) -> Vec<String> {
    let mut fragments = Vec::new();
    if let Some(Value::String(delta)) = event.get("delta") {
        fragments.push(delta.clone());
    }
    for key in ["summary", "reasoning", "analysis", "thought", "text"] {
        if let Some(Value::String(value)) = event.get(key) {
            fragments.push(value.clone());
        }
    }
    if is_reasoning_type(event_type) {
        fragments.extend(collect_role_text(
            &Value::Object(event.clone()),
            Some("assistant"),
        ));
    }
    normalize_fragments(fragments)
        .into_iter()
        .map(|f| strip_wrapped_bold(&f))
        .filter(|f| !f.is_empty())
        .collect()
}

/// Most informative single field of an otherwise-unclassified payload.
fn event_detail(event: &Map<String, Value>) -> String {
    for key in ["message", "status", "summary", "detail", "error", "reason"] {
        if let Some(value) = event.get(key) {
            let detail = format_payload(value);
            if !detail.is_empty() {
                return detail;
            }
        }
    }

    let mut preview = Map::new();
    for key in ["id", "model", "role", "finish_reason"] {
        if let Some(value) = event.get(key) {
            preview.insert(key.to_string(), value.clone());
        }
    }
    if !preview.is_empty() {
        let detail = format_payload(&Value::Object(preview));
        if !detail.is_empty() {
            return detail;
        }
    }

    format_payload(&Value::Object(event.clone()))
}

fn chat_kind_for_role(role: &str) -> (BlockKind, &'static str) {
    if role == "assistant" {
        (BlockKind::ChatCodex, "Codex")
    } else {
        (BlockKind::ChatAgent, "Agent")
    }
}

fn message_item_blocks(
    item: &Map<String, Value>,
    item_type: &str,
    role: &str,
    item_id: &str,
    ctx: &BlockContext<'_>,
) -> Vec<SessionBlock> {
    let message_role = match item_type {
        "agent_message" | "user_message" => "user",
        "assistant_message" => "assistant",
        _ if role.is_empty() => "assistant",
        _ => role,
    };
    let (chat_kind, chat_label) = chat_kind_for_role(message_role);
    let mut blocks = Vec::new();

    if let Some(Value::Array(parts)) = item.get("content") {
        for part in parts.iter().filter_map(Value::as_object) {
            let part_type = {
                let t = lower_str(part.get("type"));
                if t.is_empty() { item_type.to_string() } else { t }
            };
            let text = extract_text_from_content_part(part);
            if text.is_empty() {
                continue;
            }
            blocks.extend(split_chat_and_code_blocks(
                &text, chat_kind, chat_label, ctx, &part_type, message_role, item_id,
            ));
        }
    }

    if blocks.is_empty() {
        let fallback_text = first_nonempty(&[
            item.get("text"),
            item.get("output_text"),
            item.get("input_text"),
            pick_nested(item, &["message", "text"]),
        ]);
        if !fallback_text.is_empty() {
            let fallback_type = if item_type.is_empty() { "message" } else { item_type };
            blocks.extend(split_chat_and_code_blocks(
                &fallback_text,
                chat_kind,
                chat_label,
                ctx,
                fallback_type,
                message_role,
                item_id,
            ));
        }
    }

    blocks
}

fn event_items_to_blocks(event: &Map<String, Value>, ctx: &BlockContext<'_>) -> Vec<SessionBlock> {
    let mut blocks = Vec::new();

    for item in iter_output_items(event) {
        let item_type = lower_str(item.get("type"));
        let role = lower_str(item.get("role"));
        let status = lower_str(item.get("status"));
        let item_id = item_id_from_item(item);

        if MESSAGE_ITEM_TYPES.contains(&item_type.as_str()) {
            blocks.extend(message_item_blocks(item, &item_type, &role, &item_id, ctx));
            continue;
        }

        if REASONING_ITEM_TYPES.contains(&item_type.as_str()) {
            let mut reasoning_text = first_nonempty(&[
                item.get("summary"),
                item.get("reasoning"),
                item.get("analysis"),
                item.get("text"),
                pick_nested(item, &["summary", "text"]),
            ]);
            if reasoning_text.is_empty() {
                reasoning_text = event_detail(item);
            }
            let reasoning_text = strip_wrapped_bold(&reasoning_text);
            if !reasoning_text.is_empty() {
                blocks.push(SessionBlock {
                    kind: BlockKind::Think,
                    label: "Think".to_string(),
                    body: truncate(&reasoning_text),
                    event_type: ctx.event_type.to_string(),
                    timestamp: ctx.timestamp.to_string(),
                    item_type: item_type.clone(),
                    role: if role.is_empty() {
                        "assistant".to_string()
                    } else {
                        role
                    },
                    item_id,
                    item_status: String::new(),
                });
            }
            continue;
        }

        if COMMAND_ITEM_TYPES.contains(&item_type.as_str()) {
            let command_value = first_nonempty(&[
                item.get("command"),
                pick_nested(item, &["input", "command"]),
            ]);
            let command_value = unwrap_shell_command(&command_value);
            let command_state = if status.is_empty() {
                "in_progress".to_string()
            } else {
                status
            };
            if !command_value.is_empty() || !item_id.is_empty() {
                let mut label = "Command".to_string();
                if matches!(command_state.as_str(), "failed" | "error")
                    && let Some(exit_code) = item.get("exit_code").and_then(Value::as_i64)
                {
                    label = format!("Command · exit {exit_code}");
                }
                let body = if command_value.is_empty() {
                    "(command unavailable)".to_string()
                } else {
                    command_value
                };
                blocks.push(SessionBlock {
                    kind: BlockKind::ToolCall,
                    label,
                    body: truncate(&body),
                    event_type: ctx.event_type.to_string(),
                    timestamp: ctx.timestamp.to_string(),
                    item_type: item_type.clone(),
                    role: "assistant".to_string(),
                    item_id,
                    item_status: command_state,
                });
            }
            continue;
        }

        let tool_name = first_nonempty(&[
            item.get("name"),
            item.get("tool_name"),
            pick_nested(item, &["call", "name"]),
            pick_nested(item, &["function", "name"]),
        ]);

        if item_type.ends_with("_call") || CALL_ITEM_TYPES.contains(&item_type.as_str()) {
            let label = if tool_name.is_empty() {
                "Tool Call".to_string()
            } else {
                format!("Tool Call · {tool_name}")
            };
            let payload = item
                .get("arguments")
                .or_else(|| item.get("input"))
                .cloned()
                .unwrap_or_else(|| Value::Object(item.clone()));
            let body = format_payload(&payload);
            blocks.push(SessionBlock {
                kind: BlockKind::ToolCall,
                label,
                body: if body.is_empty() {
                    "(no payload)".to_string()
                } else {
                    body
                },
                event_type: ctx.event_type.to_string(),
                timestamp: ctx.timestamp.to_string(),
                item_type: item_type.clone(),
                role: if role.is_empty() {
                    "assistant".to_string()
                } else {
                    role
                },
                item_id,
                item_status: String::new(),
            });
            continue;
        }

        if item_type.ends_with("_output") || OUTPUT_ITEM_TYPES.contains(&item_type.as_str()) {
            let label = if tool_name.is_empty() {
                "Tool Result".to_string()
            } else {
                format!("Tool Result · {tool_name}")
            };
            let payload = item
                .get("output")
                .or_else(|| item.get("result"))
                .cloned()
                .unwrap_or_else(|| Value::Object(item.clone()));
            let body = format_payload(&payload);
            blocks.push(SessionBlock {
                kind: BlockKind::ToolResult,
                label,
                body: if body.is_empty() {
                    "(no payload)".to_string()
                } else {
                    body
                },
                event_type: ctx.event_type.to_string(),
                timestamp: ctx.timestamp.to_string(),
                item_type: item_type.clone(),
                role: if role.is_empty() {
                    "assistant".to_string()
                } else {
                    role
                },
                item_id,
                item_status: String::new(),
            });
            continue;
        }

        if matches!(item_type.as_str(), "error" | "exception") {
            let detail = event_detail(item);
            blocks.push(SessionBlock {
                kind: BlockKind::Error,
                label: "Error".to_string(),
                body: if detail.is_empty() {
                    "(unknown error)".to_string()
                } else {
                    detail
                },
                event_type: ctx.event_type.to_string(),
                timestamp: ctx.timestamp.to_string(),
                item_type: item_type.clone(),
                role,
                item_id,
                item_status: String::new(),
            });
            continue;
        }

        if !item_type.is_empty() {
            let detail = event_detail(item);
            blocks.push(SessionBlock {
                kind: BlockKind::Event,
                label: format!("Item · {item_type}"),
                body: if detail.is_empty() {
                    "(no detail)".to_string()
                } else {
                    detail
                },
                event_type: ctx.event_type.to_string(),
                timestamp: ctx.timestamp.to_string(),
                item_type: item_type.clone(),
                role,
                item_id,
                item_status: String::new(),
            });
        }
    }

    blocks
}

fn truthy(value: Option<&Value>) -> Option<&Value> {
    match value {
        Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(Value::Array(a)) if a.is_empty() => None,
        Some(Value::Object(o)) if o.is_empty() => None,
        Some(Value::Bool(false)) => None,
        other => other,
    }
}

/// Classify one event into blocks, trying the most structured interpretation
/// first and falling back towards a generic event block.
fn event_to_blocks(event: &Map<String, Value>) -> Vec<SessionBlock> {
    let event_type = event_type_of(event);
    let timestamp = event_timestamp(event);
    let ctx = BlockContext {
        event_type: &event_type,
        timestamp: &timestamp,
    };

    let item_blocks = event_items_to_blocks(event, &ctx);
    if !item_blocks.is_empty() {
        return item_blocks;
    }

    if is_reasoning_type(&event_type) {
        let fragments = extract_reasoning_fragments(event, &event_type);
        if !fragments.is_empty() {
            let stream_id = stream_id_from_event(event);
            return fragments
                .into_iter()
                .map(|fragment| SessionBlock {
                    kind: BlockKind::Think,
                    label: "Think".to_string(),
                    body: fragment,
                    event_type: event_type.clone(),
                    timestamp: timestamp.clone(),
                    item_type: "reasoning".to_string(),
                    role: "assistant".to_string(),
                    item_id: stream_id.clone(),
                    item_status: String::new(),
                })
                .collect();
        }
    }

    let mut blocks = Vec::new();
    let stream_id = stream_id_from_event(event);

    let mut agent_fragments = extract_role_fragments(event, "user");
    agent_fragments.extend(extract_role_fragments(event, "system"));
    for fragment in normalize_fragments(agent_fragments) {
        blocks.extend(split_chat_and_code_blocks(
            &fragment,
            BlockKind::ChatAgent,
            "Agent",
            &ctx,
            "message",
            "user",
            &stream_id,
        ));
    }

    for fragment in extract_role_fragments(event, "assistant") {
        blocks.extend(split_chat_and_code_blocks(
            &fragment,
            BlockKind::ChatCodex,
            "Codex",
            &ctx,
            "output_text",
            "assistant",
            &stream_id,
        ));
    }

    if !blocks.is_empty() {
        return blocks;
    }

    let tool_name = tool_name_from_event(event);
    let has_tool_signal = event_type.contains("tool")
        || event_type.contains("function_call")
        || !tool_name.is_empty()
        || event.contains_key("tool")
        || event.contains_key("tool_call");
    if has_tool_signal {
        let (kind, base_label) = if event_type.contains("result") || event_type.contains("output") {
            (BlockKind::ToolResult, "Tool Result")
        } else if event_type.contains("error") || event_type.contains("fail") {
            (BlockKind::Error, "Tool Error")
        } else {
            (BlockKind::ToolCall, "Tool Call")
        };
        let label = if tool_name.is_empty() {
            base_label.to_string()
        } else {
            format!("{base_label} · {tool_name}")
        };

        let payload = [
            "arguments",
            "input",
            "result",
            "output",
            "content",
            "message",
            "error",
        ]
        .iter()
        .find_map(|key| event.get(*key));
        let body = match payload {
            Some(value) if !value.is_null() => format_payload(value),
            _ => event_detail(event),
        };
        blocks.push(SessionBlock {
            kind,
            label,
            body: if body.is_empty() {
                "(no payload)".to_string()
            } else {
                body
            },
            event_type: event_type.clone(),
            timestamp: timestamp.clone(),
            item_type: if kind == BlockKind::ToolResult {
                "tool_result".to_string()
            } else {
                "tool_call".to_string()
            },
            role: "assistant".to_string(),
            item_id: stream_id.clone(),
            item_status: String::new(),
        });

        let command_value = first_nonempty(&[
            pick_nested(event, &["arguments", "command"]),
            pick_nested(event, &["input", "command"]),
            event.get("command"),
        ]);
        if !command_value.is_empty() {
            blocks.push(SessionBlock {
                kind: BlockKind::Code,
                label: "Code · command".to_string(),
                body: truncate(&normalize_fragment(&command_value)),
                event_type: event_type.clone(),
                timestamp: timestamp.clone(),
                item_type: "code".to_string(),
                role: "assistant".to_string(),
                item_id: stream_id,
                item_status: String::new(),
            });
        }
        return blocks;
    }

    if event_type.contains("error")
        || event_type.contains("fail")
        || event_type.contains("exception")
        || event.contains_key("error")
    {
        let payload = truthy(event.get("error"))
            .or_else(|| truthy(event.get("message")))
            .cloned()
            .unwrap_or_else(|| Value::String(event_detail(event)));
        let body = format_payload(&payload);
        return vec![SessionBlock {
            kind: BlockKind::Error,
            label: "Error".to_string(),
            body: if body.is_empty() {
                "(unknown error)".to_string()
            } else {
                body
            },
            event_type,
            timestamp,
            item_type: "error".to_string(),
            role: String::new(),
            item_id: stream_id_from_event(event),
            item_status: String::new(),
        }];
    }

    if event_type.contains("response.")
        || event_type.contains("session")
        || event_type.contains("status")
        || matches!(event_type.as_str(), "started" | "completed")
    {
        let detail = event_detail(event);
        let body = if !detail.is_empty() {
            detail
        } else if !event_type.is_empty() {
            event_type.clone()
        } else {
            "status".to_string()
        };
        return vec![SessionBlock {
            kind: BlockKind::Status,
            label: "Status".to_string(),
            body,
            event_type,
            timestamp,
            item_type: "status".to_string(),
            role: String::new(),
            item_id: stream_id_from_event(event),
            item_status: String::new(),
        }];
    }

    if event_type.is_empty() {
        return Vec::new();
    }

    let detail = event_detail(event);
    vec![SessionBlock {
        kind: BlockKind::Event,
        label: "Event".to_string(),
        body: if detail.is_empty() {
            event_type.clone()
        } else {
            detail
        },
        event_type,
        timestamp,
        item_type: "event".to_string(),
        role: String::new(),
        item_id: stream_id_from_event(event),
        item_status: String::new(),
    }]
}

/// Collapse a block identical to its predecessor.
fn append_unique(blocks: &mut Vec<SessionBlock>, block: SessionBlock) {
    if let Some(last) = blocks.last()
        && last.kind == block.kind
        && last.body == block.body
        && last.event_type == block.event_type
        && last.item_type == block.item_type
        && last.role == block.role
        && last.item_id == block.item_id
        && last.item_status == block.item_status
    {
        return;
    }
    blocks.push(block);
}

/// Per-stream delta accumulators, kept in first-seen order so flushes
/// preserve stream arrival ordering.
#[derive(Default)]
struct DeltaBuffers {
    text: Vec<(String, String)>,
    think: Vec<(String, String)>,
}

impl DeltaBuffers {
    fn push(buffers: &mut Vec<(String, String)>, stream_id: &str, delta: &str) {
        if let Some((_, buffered)) = buffers.iter_mut().find(|(id, _)| id == stream_id) {
            buffered.push_str(delta);
        } else {
            buffers.push((stream_id.to_string(), delta.to_string()));
        }
    }

    fn is_empty(&self) -> bool {
        self.text.is_empty() && self.think.is_empty()
    }

    fn flush(&mut self, blocks: &mut Vec<SessionBlock>, timestamp: &str) {
        let ctx = BlockContext {
            event_type: "response.output_text.delta",
            timestamp,
        };
        for (stream_id, buffered) in self.text.drain(..) {
            let flushed = normalize_fragment(&buffered);
            if flushed.is_empty() {
                continue;
            }
            let normalized_id = if stream_id == DEFAULT_STREAM {
                ""
            } else {
                stream_id.as_str()
            };
            for block in split_chat_and_code_blocks(
                &flushed,
                BlockKind::ChatCodex,
                "Codex",
                &ctx,
                "output_text",
                "assistant",
                normalized_id,
            ) {
                append_unique(blocks, block);
            }
        }

        for (stream_id, buffered) in self.think.drain(..) {
            let flushed = normalize_fragment(&buffered);
            if flushed.is_empty() {
                continue;
            }
            let normalized_id = if stream_id == DEFAULT_STREAM {
                String::new()
            } else {
                stream_id
            };
            append_unique(
                blocks,
                SessionBlock {
                    kind: BlockKind::Think,
                    label: "Think".to_string(),
                    body: strip_wrapped_bold(&buffered),
                    event_type: "response.reasoning.delta".to_string(),
                    timestamp: timestamp.to_string(),
                    item_type: "reasoning".to_string(),
                    role: "assistant".to_string(),
                    item_id: normalized_id,
                    item_status: String::new(),
                },
            );
        }
    }
}

/// First pass: ordered events → raw block sequence with delta coalescing.
fn render_from_json_events(
    events: &[Map<String, Value>],
    max_blocks: usize,
) -> Vec<SessionBlock> {
    let mut blocks: Vec<SessionBlock> = Vec::new();
    let mut buffers = DeltaBuffers::default();

    for event in events {
        let event_type = event_type_of(event);
        let delta = event.get("delta").and_then(Value::as_str);
        let stream_raw = stream_id_from_event(event);
        let stream_id = if stream_raw.is_empty() {
            DEFAULT_STREAM
        } else {
            stream_raw.as_str()
        };

        if let Some(delta) = delta {
            if event_type.contains("assistant") || event_type.contains("output_text") {
                DeltaBuffers::push(&mut buffers.text, stream_id, delta);
                continue;
            }
            if is_reasoning_type(&event_type) {
                DeltaBuffers::push(&mut buffers.think, stream_id, delta);
                continue;
            }
        }

        if !buffers.is_empty() {
            buffers.flush(&mut blocks, &event_timestamp(event));
        }

        for block in event_to_blocks(event) {
            append_unique(&mut blocks, block);
        }
    }

    buffers.flush(&mut blocks, "");

    let cut = blocks.len().saturating_sub(max_blocks);
    blocks.split_off(cut)
}

fn is_command_item_type(item_type: &str) -> bool {
    COMMAND_ITEM_TYPES.contains(&item_type)
}

/// Second pass: the displayable view. Transport noise is dropped, adjacent
/// conversational blocks merge, and a later command-execution block amends
/// the earlier one with the same item id instead of duplicating it.
fn normalize_cli_view(blocks: &[SessionBlock], max_blocks: usize) -> Vec<SessionBlock> {
    if blocks.is_empty() {
        return Vec::new();
    }

    let mut merged: Vec<SessionBlock> = Vec::new();
    // item id → index of its most recent command block in `merged`.
    let mut command_index: HashMap<String, usize> = HashMap::new();

    for block in blocks {
        let allowed = matches!(
            block.kind,
            BlockKind::ChatAgent
                | BlockKind::ChatCodex
                | BlockKind::Think
                | BlockKind::Code
                | BlockKind::ToolCall
                | BlockKind::ToolResult
                | BlockKind::Error
                | BlockKind::Terminal
        );
        if !allowed {
            continue;
        }
        let body = normalize_fragment(&block.body);
        if body.is_empty() {
            continue;
        }

        if block.kind == BlockKind::ToolCall
            && is_command_item_type(&block.item_type)
            && !block.item_id.is_empty()
            && let Some(&idx) = command_index.get(&block.item_id)
        {
            let existing = &mut merged[idx];
            if body != "(command unavailable)" {
                existing.body = truncate(&body);
            }
            if !block.item_status.is_empty() {
                existing.item_status = block.item_status.clone();
            }
            if !block.label.is_empty() {
                existing.label = block.label.clone();
            }
            if !block.timestamp.is_empty() {
                existing.timestamp = block.timestamp.clone();
            }
            continue;
        }

        let mergeable = matches!(
            block.kind,
            BlockKind::ChatAgent | BlockKind::ChatCodex | BlockKind::Think | BlockKind::Terminal
        );
        if mergeable
            && let Some(last) = merged.last_mut()
            && last.kind == block.kind
            && last.label == block.label
            && last.item_type == block.item_type
            && last.role == block.role
            && last.item_id == block.item_id
        {
            last.body = truncate(&format!("{}\n\n{body}", last.body));
            if last.timestamp.is_empty() && !block.timestamp.is_empty() {
                last.timestamp = block.timestamp.clone();
            }
            continue;
        }

        merged.push(SessionBlock {
            kind: block.kind,
            label: block.label.clone(),
            body: truncate(&body),
            event_type: String::new(),
            timestamp: block.timestamp.clone(),
            item_type: block.item_type.clone(),
            role: block.role.clone(),
            item_id: block.item_id.clone(),
            item_status: block.item_status.clone(),
        });
        if block.kind == BlockKind::ToolCall
            && is_command_item_type(&block.item_type)
            && !block.item_id.is_empty()
        {
            command_index.insert(block.item_id.clone(), merged.len() - 1);
        }
    }

    if merged.is_empty() {
        // Everything was filtered; surface the most recent raw block as
        // terminal output rather than showing nothing.
        let tail = &blocks[blocks.len() - 1];
        let body = normalize_fragment(&tail.body);
        return vec![SessionBlock {
            kind: BlockKind::Terminal,
            label: "Terminal".to_string(),
            body: truncate(if body.is_empty() {
                NO_OUTPUT_PLACEHOLDER
            } else {
                &body
            }),
            event_type: String::new(),
            timestamp: tail.timestamp.clone(),
            item_type: if tail.item_type.is_empty() {
                "terminal".to_string()
            } else {
                tail.item_type.clone()
            },
            role: tail.role.clone(),
            item_id: tail.item_id.clone(),
            item_status: tail.item_status.clone(),
        }];
    }

    let cut = merged.len().saturating_sub(max_blocks);
    merged.split_off(cut)
}

/// Transcript fallback: strip escapes, bound the tail, and compact blank
/// runs to at most two.
fn render_transcript(text: &str, max_lines: usize) -> String {
    let cleaned = strip_ansi(text);
    let lines: Vec<&str> = cleaned.lines().collect();
    let start = if max_lines > 0 {
        lines.len().saturating_sub(max_lines)
    } else {
        0
    };

    let mut compact: Vec<String> = Vec::new();
    let mut blank_seen = 0;
    for line in &lines[start..] {
        if !line.trim().is_empty() {
            compact.push(line.trim_end().to_string());
            blank_seen = 0;
            continue;
        }
        blank_seen += 1;
        if blank_seen <= 2 {
            compact.push(String::new());
        }
    }

    let body = compact.join("\n").trim().to_string();
    if body.is_empty() {
        NO_OUTPUT_PLACEHOLDER.to_string()
    } else {
        body
    }
}

/// Normalize one session snapshot.
///
/// The event-log tail is authoritative when it contains at least one
/// parseable JSON object; otherwise the raw capture is rendered as a
/// terminal transcript.
pub fn parse_session(
    raw_capture: &str,
    log_tail: &str,
    max_blocks: usize,
    max_lines: usize,
) -> SessionView {
    let source_text = if log_tail.trim().is_empty() {
        raw_capture
    } else {
        log_tail
    };

    let events = iter_json_objects(source_text);
    if !events.is_empty() {
        let raw_blocks = render_from_json_events(&events, usize::max(64, max_blocks * 4));
        if !raw_blocks.is_empty() {
            return SessionView {
                source: ViewSource::Jsonl,
                parsed_events: events.len(),
                blocks: normalize_cli_view(&raw_blocks, max_blocks),
            };
        }
    }

    let fallback = if source_text.trim().is_empty() {
        raw_capture
    } else {
        source_text
    };
    let body = render_transcript(fallback, max_lines);
    let ctx = BlockContext {
        event_type: "capture",
        timestamp: "",
    };
    let mut blocks =
        split_chat_and_code_blocks(&body, BlockKind::Terminal, "Terminal", &ctx, "", "", "");
    if blocks.is_empty() {
        let mut placeholder = SessionBlock::new(
            BlockKind::Terminal,
            "Terminal",
            NO_OUTPUT_PLACEHOLDER.to_string(),
        );
        placeholder.event_type = "capture".to_string();
        placeholder.item_type = "terminal".to_string();
        blocks.push(placeholder);
    }

    SessionView {
        source: ViewSource::Transcript,
        parsed_events: 0,
        blocks,
    }
}

/// Render a block sequence as plain markdown for non-interactive display.
pub fn blocks_to_markdown(blocks: &[SessionBlock]) -> String {
    if blocks.is_empty() {
        return NO_OUTPUT_PLACEHOLDER.to_string();
    }
    let mut lines: Vec<String> = Vec::new();
    for block in blocks {
        lines.push(format!("### {}", block.label));
        if !block.event_type.is_empty() {
            lines.push(format!("`{}`", block.event_type));
        }
        if !block.item_type.is_empty() {
            lines.push(format!("`item.type: {}`", block.item_type));
        }
        if !block.item_id.is_empty() {
            lines.push(format!("`item.id: {}`", block.item_id));
        }
        if !block.timestamp.is_empty() {
            lines.push(format!("_time: {}_", block.timestamp));
        }
        lines.push(String::new());
        lines.push(if block.body.is_empty() {
            "(no content)".to_string()
        } else {
            block.body.clone()
        });
        lines.push(String::new());
    }
    lines.join("\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(view: &SessionView) -> Vec<BlockKind> {
        view.blocks.iter().map(|b| b.kind).collect()
    }

    #[test]
    fn strip_ansi_removes_escape_sequences() {
        assert_eq!(strip_ansi("\x1b[31merror\x1b[0m line"), "error line");
        assert_eq!(strip_ansi("\x1b]0;title\x07text"), "text");
        assert_eq!(strip_ansi("plain\r\n"), "plain\n");
    }

    #[test]
    fn deltas_coalesce_into_one_chat_block() {
        let log = concat!(
            r#"{"type":"response.output_text.delta","delta":"Hello"}"#,
            "\n",
            r#"{"type":"response.output_text.delta","delta":" world"}"#,
            "\n",
        );
        let view = parse_session("", log, 12, 260);
        assert_eq!(view.source, ViewSource::Jsonl);
        assert_eq!(view.parsed_events, 2);
        assert_eq!(kinds(&view), [BlockKind::ChatCodex]);
        assert!(view.blocks[0].body.contains("Hello world"));
    }

    #[test]
    fn deltas_buffer_per_stream_id() {
        let log = concat!(
            r#"{"type":"response.output_text.delta","item_id":"a","delta":"first"}"#,
            "\n",
            r#"{"type":"response.output_text.delta","item_id":"b","delta":"second"}"#,
            "\n",
            r#"{"type":"response.output_text.delta","item_id":"a","delta":" stream"}"#,
            "\n",
        );
        let view = parse_session("", log, 12, 260);
        // Streams flush independently in first-seen order; different item ids
        // stay separate blocks.
        assert_eq!(view.blocks.len(), 2);
        assert_eq!(view.blocks[0].body, "first stream");
        assert_eq!(view.blocks[0].item_id, "a");
        assert_eq!(view.blocks[1].body, "second");
    }

    #[test]
    fn status_noise_is_hidden_and_chat_merges() {
        let log = concat!(
            r#"{"type":"response.output_text.delta","delta":"Hello"}"#,
            "\n",
            r#"{"type":"response.output_text.delta","delta":" world"}"#,
            "\n",
            r#"{"type":"response.status","status":"running"}"#,
            "\n",
            r#"{"type":"response.output_text.delta","delta":"\nMore"}"#,
            "\n",
        );
        let view = parse_session("", log, 8, 260);
        assert_eq!(kinds(&view), [BlockKind::ChatCodex]);
        assert!(view.blocks[0].body.contains("Hello world"));
        assert!(view.blocks[0].body.contains("More"));
        assert_eq!(view.blocks[0].item_type, "output_text");
        assert_eq!(view.blocks[0].event_type, "");
    }

    #[test]
    fn message_reasoning_and_fences_map_to_blocks() {
        let log = concat!(
            r#"{"type":"response.reasoning.delta","delta":"plan first"}"#,
            "\n",
            r#"{"type":"response.output_item.added","item":{"type":"message","role":"assistant","content":[{"type":"output_text","text":"I will do this.\n```python\nprint(123)\n```"}]}}"#,
            "\n",
            r#"{"type":"response.output_item.added","item":{"type":"message","role":"user","content":[{"type":"input_text","text":"please continue"}]}}"#,
            "\n",
        );
        let view = parse_session("", log, 12, 260);
        let ks = kinds(&view);
        assert!(ks.contains(&BlockKind::Think));
        assert!(ks.contains(&BlockKind::ChatCodex));
        assert!(ks.contains(&BlockKind::Code));
        assert!(ks.contains(&BlockKind::ChatAgent));

        let code = view
            .blocks
            .iter()
            .find(|b| b.kind == BlockKind::Code)
            .unwrap();
        assert_eq!(code.label, "Code · python");
        assert_eq!(code.body, "print(123)");

        let item_types: Vec<&str> = view.blocks.iter().map(|b| b.item_type.as_str()).collect();
        assert!(item_types.contains(&"reasoning"));
        assert!(item_types.contains(&"output_text"));
        assert!(item_types.contains(&"input_text"));
        assert!(item_types.contains(&"code"));
    }

    #[test]
    fn tool_call_and_result_items_stay_distinct() {
        let log = concat!(
            r#"{"type":"response.output_item.added","item":{"id":"fc_1","type":"function_call","name":"shell","arguments":{"command":"ls -la"}}}"#,
            "\n",
            r#"{"type":"response.output_item.added","item":{"id":"fc_1_out","type":"function_call_output","name":"shell","output":{"stdout":"ok"}}}"#,
            "\n",
        );
        let view = parse_session("", log, 12, 260);
        assert_eq!(kinds(&view), [BlockKind::ToolCall, BlockKind::ToolResult]);
        assert_eq!(view.blocks[0].label, "Tool Call · shell");
        assert!(view.blocks[0].body.contains("ls -la"));
        assert_eq!(view.blocks[1].label, "Tool Result · shell");
        assert!(view.blocks[1].body.contains("stdout"));
    }

    #[test]
    fn command_completion_amends_in_place() {
        let log = concat!(
            r#"{"type":"item.started","item":{"id":"cmd_1","type":"command_execution","command":"bash -lc 'cargo test'","status":"in_progress"}}"#,
            "\n",
            r#"{"type":"item.completed","item":{"id":"cmd_1","type":"command_execution","command":"bash -lc 'cargo test'","status":"completed"}}"#,
            "\n",
        );
        let view = parse_session("", log, 12, 260);
        assert_eq!(kinds(&view), [BlockKind::ToolCall]);
        assert_eq!(view.blocks[0].body, "cargo test");
        assert_eq!(view.blocks[0].item_status, "completed");
    }

    #[test]
    fn failed_command_gets_exit_code_label() {
        let log = concat!(
            r#"{"type":"item.completed","item":{"id":"cmd_2","type":"command_execution","command":"false","status":"failed","exit_code":1}}"#,
            "\n",
        );
        let view = parse_session("", log, 12, 260);
        assert_eq!(view.blocks[0].label, "Command · exit 1");
        assert_eq!(view.blocks[0].item_status, "failed");
    }

    #[test]
    fn wrapped_bold_reasoning_is_unwrapped() {
        let log = concat!(
            r#"{"type":"response.output_item.added","item":{"type":"reasoning","summary":"**Weighing options**"}}"#,
            "\n",
        );
        let view = parse_session("", log, 12, 260);
        assert_eq!(kinds(&view), [BlockKind::Think]);
        assert_eq!(view.blocks[0].body, "Weighing options");
    }

    #[test]
    fn error_items_become_error_blocks() {
        let log = concat!(
            r#"{"type":"response.output_item.added","item":{"type":"error","message":"boom"}}"#,
            "\n",
        );
        let view = parse_session("", log, 12, 260);
        assert_eq!(kinds(&view), [BlockKind::Error]);
        assert_eq!(view.blocks[0].body, "boom");
    }

    #[test]
    fn bad_lines_are_skipped_individually() {
        let log = concat!(
            "not json\n",
            "{broken json\n",
            "[1,2,3]\n",
            r#"{"type":"response.output_text.delta","delta":"ok"}"#,
            "\n",
        );
        let view = parse_session("", log, 12, 260);
        assert_eq!(view.source, ViewSource::Jsonl);
        assert_eq!(view.parsed_events, 1);
        assert_eq!(view.blocks[0].body, "ok");
    }

    #[test]
    fn only_noise_synthesizes_terminal_fallback() {
        let log = concat!(
            r#"{"type":"session.created","status":"ready"}"#,
            "\n",
            r#"{"type":"response.status","status":"running"}"#,
            "\n",
        );
        let view = parse_session("", log, 12, 260);
        assert_eq!(view.source, ViewSource::Jsonl);
        assert_eq!(kinds(&view), [BlockKind::Terminal]);
        assert_eq!(view.blocks[0].body, "running");
    }

    #[test]
    fn raw_capture_fallback_strips_ansi_and_cr() {
        let raw = "\x1b[32mline one\x1b[0m\r\nline two\r\n\n\n\n\nline three\n";
        let view = parse_session(raw, "", 12, 260);
        assert_eq!(view.source, ViewSource::Transcript);
        assert_eq!(view.parsed_events, 0);
        assert_eq!(kinds(&view), [BlockKind::Terminal]);
        let body = &view.blocks[0].body;
        assert!(body.contains("line one"));
        assert!(body.contains("line two"));
        assert!(!body.contains('\x1b'));
        assert!(!body.contains('\r'));
        // Blank runs collapse to at most two blank lines.
        assert!(!body.contains("\n\n\n\n"));
    }

    #[test]
    fn transcript_bounds_trailing_lines() {
        let raw: String = (0..50).map(|i| format!("line {i}\n")).collect();
        let view = parse_session(&raw, "", 12, 10);
        let body = &view.blocks[0].body;
        assert!(!body.contains("line 39"));
        assert!(body.contains("line 40"));
        assert!(body.contains("line 49"));
    }

    #[test]
    fn empty_input_yields_placeholder() {
        let view = parse_session("", "", 12, 260);
        assert_eq!(view.source, ViewSource::Transcript);
        assert_eq!(view.blocks.len(), 1);
        assert_eq!(view.blocks[0].body, NO_OUTPUT_PLACEHOLDER);
    }

    #[test]
    fn fallback_splits_fenced_capture() {
        let raw = "intro\n```rust\nfn main() {}\n```\noutro\n";
        let view = parse_session(raw, "", 12, 260);
        assert_eq!(
            kinds(&view),
            [BlockKind::Terminal, BlockKind::Code, BlockKind::Terminal]
        );
        assert_eq!(view.blocks[1].label, "Code · rust");
    }

    #[test]
    fn output_bound_keeps_most_recent_blocks() {
        let mut log = String::new();
        for i in 0..20 {
            log.push_str(&format!(
                "{{\"type\":\"response.output_item.added\",\"item\":{{\"id\":\"fc_{i}\",\"type\":\"function_call\",\"name\":\"t{i}\",\"arguments\":{{\"n\":{i}}}}}}}\n",
            ));
        }
        let view = parse_session("", &log, 5, 260);
        assert_eq!(view.blocks.len(), 5);
        assert_eq!(view.blocks[4].label, "Tool Call · t19");
    }

    #[test]
    fn consecutive_identical_blocks_deduplicate() {
        let line = r#"{"type":"response.output_item.added","item":{"type":"message","role":"assistant","content":[{"type":"output_text","text":"same text"}]}}"#;
        let log = format!("{line}\n{line}\n");
        let view = parse_session("", &log, 12, 260);
        assert_eq!(kinds(&view), [BlockKind::ChatCodex]);
        assert_eq!(view.blocks[0].body, "same text");
    }

    #[test]
    fn role_walk_respects_inheritance() {
        let log = concat!(
            r#"{"type":"conversation.item","content":{"role":"user","content":[{"text":"from the operator"}]}}"#,
            "\n",
        );
        let view = parse_session("", log, 12, 260);
        assert_eq!(kinds(&view), [BlockKind::ChatAgent]);
        assert_eq!(view.blocks[0].body, "from the operator");
    }

    #[test]
    fn generic_tool_event_emits_call_and_command_code() {
        let log = concat!(
            r#"{"type":"tool_use","tool_name":"shell","input":{"command":"cargo build"}}"#,
            "\n",
        );
        let view = parse_session("", log, 12, 260);
        assert_eq!(kinds(&view), [BlockKind::ToolCall, BlockKind::Code]);
        assert_eq!(view.blocks[0].label, "Tool Call · shell");
        assert_eq!(view.blocks[1].body, "cargo build");
    }

    #[test]
    fn long_bodies_are_truncated() {
        let long = "x".repeat(MAX_PREVIEW_CHARS * 2);
        let log = format!(
            "{{\"type\":\"response.output_item.added\",\"item\":{{\"type\":\"message\",\"role\":\"assistant\",\"content\":[{{\"type\":\"output_text\",\"text\":\"{long}\"}}]}}}}\n",
        );
        let view = parse_session("", &log, 12, 260);
        assert!(view.blocks[0].body.ends_with("..."));
        assert!(view.blocks[0].body.chars().count() <= MAX_PREVIEW_CHARS + 3);
    }

    #[test]
    fn unwrap_shell_command_unwraps_known_wrappers() {
        assert_eq!(unwrap_shell_command("bash -lc 'ls -la'"), "ls -la");
        assert_eq!(unwrap_shell_command("/bin/zsh -lc \"pwd\""), "pwd");
        assert_eq!(unwrap_shell_command("plain command"), "plain command");
    }

    #[test]
    fn markdown_rendering_includes_labels_and_tags() {
        let log = concat!(
            r#"{"type":"response.output_item.added","item":{"id":"fc_9","type":"function_call","name":"shell","arguments":{"command":"ls"}}}"#,
            "\n",
        );
        let view = parse_session("", log, 12, 260);
        let markdown = blocks_to_markdown(&view.blocks);
        assert!(markdown.contains("### Tool Call · shell"));
        assert!(markdown.contains("`item.id: fc_9`"));
        assert_eq!(blocks_to_markdown(&[]), NO_OUTPUT_PLACEHOLDER);
    }

    #[test]
    fn read_tail_text_bounds_and_tolerates_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("events.jsonl");
        assert_eq!(read_tail_text(&path, 100), "");

        std::fs::write(&path, "abcdefghij").unwrap();
        assert_eq!(read_tail_text(&path, 4), "ghij");
        assert_eq!(read_tail_text(&path, 100), "abcdefghij");
    }
}
