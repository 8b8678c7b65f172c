//! Workflow source loading
//!
//! A workflow definition deserializes from either JSON or YAML with one
//! logical schema. The format is picked by file extension when present,
//! otherwise sniffed from content. Malformed input in either format
//! surfaces as a single "Failed to load workflow file" error class, not a
//! parser-specific one.

use std::path::Path;

use tracing::debug;

use crate::error::{Result, WeftError};
use crate::workflow::WorkflowDefinition;

/// Load a workflow definition from a JSON or YAML file
pub fn load_workflow(path: impl AsRef<Path>) -> Result<WorkflowDefinition> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(WeftError::WorkflowNotFound {
            path: path.display().to_string(),
        });
    }

    let content = std::fs::read_to_string(path)?;
    let def = parse_workflow(&content, extension_hint(path)).map_err(|details| {
        WeftError::WorkflowLoad {
            path: path.display().to_string(),
            details,
        }
    })?;
    debug!(path = %path.display(), name = %def.name, tasks = def.tasks.len(), "workflow loaded");
    Ok(def)
}

/// Parse workflow source from a string, optionally hinted by extension
pub fn parse_workflow(content: &str, hint: Option<Format>) -> std::result::Result<WorkflowDefinition, String> {
    match hint.unwrap_or_else(|| sniff_format(content)) {
        Format::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
        // serde_yaml parses JSON too, so the YAML path doubles as the
        // fallback for hint-less content.
        Format::Yaml => serde_yaml::from_str(content).map_err(|e| e.to_string()),
    }
}

/// Source format for a workflow definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Yaml,
}

fn extension_hint(path: &Path) -> Option<Format> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Some(Format::Json),
        Some("yaml") | Some("yml") => Some(Format::Yaml),
        _ => None,
    }
}

/// Content sniffing when no extension is present: a leading `{` or `[`
/// means JSON.
fn sniff_format(content: &str) -> Format {
    match content.trim_start().chars().next() {
        Some('{') | Some('[') => Format::Json,
        _ => Format::Yaml,
    }
}
