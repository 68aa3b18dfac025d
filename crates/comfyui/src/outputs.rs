//! Output artifact references and history parsing.
//!
//! ComfyUI reports node outputs as
//! `{"images": [{"filename", "subfolder", "type"}], "gifs": [...]}` both in
//! `executed` frames and in `GET /history/{id}`.

use serde::{Deserialize, Serialize};

/// Output list keys that carry downloadable files.
const OUTPUT_KEYS: &[&str] = &["images", "gifs", "videos"];

/// `type` of artifacts stored in the server's output folder. Only these are
/// materialized; `temp` artifacts are previews.
pub const OUTPUT_TYPE: &str = "output";

/// A handle to a result file on the server, fetchable via `GET /view`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// Storage area on the server: `output`, `temp` or `input`.
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    /// Node that produced the artifact, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

fn default_kind() -> String {
    OUTPUT_TYPE.to_string()
}

impl ArtifactRef {
    pub fn is_output(&self) -> bool {
        self.kind == OUTPUT_TYPE
    }

    /// Same file on the server, regardless of the producing node.
    pub fn same_file(&self, other: &ArtifactRef) -> bool {
        self.filename == other.filename && self.subfolder == other.subfolder && self.kind == other.kind
    }
}

/// Artifacts listed in one node's output object.
pub fn parse_node_output(node_id: &str, output: &serde_json::Value) -> Vec<ArtifactRef> {
    OUTPUT_KEYS
        .iter()
        .filter_map(|key| output.get(*key).and_then(|v| v.as_array()))
        .flatten()
        .filter_map(|item| serde_json::from_value::<ArtifactRef>(item.clone()).ok())
        .map(|mut artifact| {
            artifact.node_id = Some(node_id.to_string());
            artifact
        })
        .collect()
}

/// Outcome recorded in a history entry.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryOutcome {
    Success(Vec<ArtifactRef>),
    Error(String),
}

/// Parse the body of `GET /history/{id}` for `prompt_id`.
///
/// Returns `None` when the server has no record of the prompt.
pub fn parse_history(prompt_id: &str, body: &serde_json::Value) -> Option<HistoryOutcome> {
    let entry = body.get(prompt_id)?;

    let status = entry.get("status");
    let status_str = status
        .and_then(|s| s.get("status_str"))
        .and_then(|s| s.as_str());

    if status_str == Some("error") {
        return Some(HistoryOutcome::Error(history_error_message(status)));
    }

    let mut artifacts = Vec::new();
    if let Some(outputs) = entry.get("outputs").and_then(|o| o.as_object()) {
        for (node_id, output) in outputs {
            artifacts.extend(parse_node_output(node_id, output));
        }
    }
    Some(HistoryOutcome::Success(artifacts))
}

/// Pull the exception message out of the history status `messages` list
/// (`[["execution_error", {...}], ...]`).
fn history_error_message(status: Option<&serde_json::Value>) -> String {
    status
        .and_then(|s| s.get("messages"))
        .and_then(|m| m.as_array())
        .and_then(|messages| {
            messages.iter().find_map(|m| {
                let pair = m.as_array()?;
                if pair.first()?.as_str()? != "execution_error" {
                    return None;
                }
                pair.get(1)?
                    .get("exception_message")?
                    .as_str()
                    .map(str::to_string)
            })
        })
        .unwrap_or_else(|| "execution failed".to_string())
}
