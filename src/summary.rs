//! `messages/create`: a deterministic chat answer about the bound run.

use crate::error::{RpcError, RpcResult};
use crate::model::FileUsage;
use crate::narrator::Narrator;
use crate::repository::Repository;
use crate::resources::CATALOG;
use crate::session::SessionCache;
use serde_json::{Value, json};
use std::fmt::Write as _;
use tracing::{debug, warn};

const TOP_DEPENDENCIES: usize = 5;
pub const MODEL_NAME: &str = "insights-summary";

/// Text of the last user-authored message in `params.messages[]`.
///
/// `content` may be a plain string, a `{type: "text", text}` block, or an
/// array of such blocks.
pub fn last_user_text(params: &Value) -> Option<String> {
    params
        .get("messages")?
        .as_array()?
        .iter()
        .rev()
        .filter(|message| message.get("role").and_then(Value::as_str) == Some("user"))
        .find_map(|message| message.get("content").and_then(content_text))
}

fn content_text(content: &Value) -> Option<String> {
    match content {
        Value::String(text) => Some(text.clone()),
        Value::Object(block) => {
            if block.get("type").and_then(Value::as_str) != Some("text") {
                return None;
            }
            block.get("text").and_then(Value::as_str).map(str::to_string)
        }
        Value::Array(blocks) => {
            let parts: Vec<String> = blocks.iter().filter_map(content_text).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("\n"))
            }
        }
        _ => None,
    }
}

/// Summary of the session's run: status, metrics, insight, top dependencies
/// and where to look next.
pub fn compose_summary(repo: &Repository, cache: &mut SessionCache) -> RpcResult<String> {
    let Some(run_id) = cache.run_id() else {
        return Ok("No analysis runs are available yet.".to_string());
    };

    let mut text = String::new();
    {
        let summary = cache.summary(repo, run_id)?;
        let run = &summary.run;
        let _ = write!(text, "Run {} is {} (started {}", run.id, run.status, run.started_at);
        if let Some(completed) = &run.completed_at {
            let _ = write!(text, ", completed {completed}");
        }
        let _ = writeln!(text, ").");
        let _ = writeln!(text, "Source: {}", run.source_path);
        let _ = writeln!(
            text,
            "Files: {} ({} programs, {} copybooks); analyses: {} ({} fallback); dependencies: {}.",
            summary.file_count,
            summary.file_count - summary.copybook_count,
            summary.copybook_count,
            summary.analysis_count,
            summary.fallback_analyses,
            summary.dependency_count,
        );
        match &summary.metrics {
            Some(metrics) => {
                let _ = writeln!(text, "Insight: {}", metrics.insight);
                match &metrics.circular_summary {
                    Some(cycles) => {
                        let _ = writeln!(text, "Circular dependencies: {cycles}");
                    }
                    None => text.push_str("Circular dependencies: none detected\n"),
                }
            }
            None => text.push_str("Metrics have not been computed for this run.\n"),
        }
    }

    match cache.dependencies(repo, run_id) {
        Ok(map) => {
            text.push_str("Top dependencies:\n");
            for usage in top_usage(&map.usage) {
                let _ = writeln!(
                    text,
                    "  - {}: {} references from {} files",
                    usage.file_name, usage.usage_count, usage.dependent_count
                );
            }
        }
        Err(RpcError::NoData(_)) => text.push_str("No dependencies were recorded.\n"),
        Err(err) => return Err(err),
    }

    text.push_str("Resources:\n");
    for template in &CATALOG {
        let _ = writeln!(
            text,
            "  - {}",
            template.uri.replace("{runId}", &run_id.to_string())
        );
    }
    Ok(text)
}

fn top_usage(usage: &[FileUsage]) -> impl Iterator<Item = &FileUsage> {
    usage.iter().take(TOP_DEPENDENCIES)
}

/// Build the `messages/create` result. The narrator only ever adds to the
/// deterministic summary; its failure is logged and ignored.
pub fn create_message(
    repo: &Repository,
    cache: &mut SessionCache,
    narrator: Option<&dyn Narrator>,
    params: &Value,
) -> RpcResult<Value> {
    let question = last_user_text(params).unwrap_or_default();
    let summary = compose_summary(repo, cache)?;

    let mut text = String::new();
    if !question.trim().is_empty() {
        let _ = writeln!(text, "Question: {}\n", question.trim());
    }
    text.push_str(&summary);

    if let Some(narrator) = narrator {
        let prompt = format!("{question}\n\nContext:\n{summary}");
        match narrator.narrate(&prompt) {
            Ok(narration) => {
                debug!(bytes = narration.len(), "narration appended");
                let _ = write!(text, "\n{narration}\n");
            }
            Err(err) => warn!(kind = %err.kind, error = %err.message, "narrator failed"),
        }
    }

    Ok(json!({
        "role": "assistant",
        "content": { "type": "text", "text": text },
        "model": MODEL_NAME,
        "stopReason": "endTurn",
    }))
}
