//! Output naming conventions.
//!
//! Artifacts land in a per-day directory under the output root:
//!
//! ```text
//! {root}/{YYYY-MM-DD}/{YYYYMMDDHHMMSS}-{counter}.{ext}
//! {root}/{YYYY-MM-DD}/{YYYYMMDDHHMMSS}-{counter}.swarm.json
//! ```
//!
//! The counter starts at 1; the caller picks the first free one.

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;

/// Suffix of the JSON metadata sidecar written next to each artifact.
pub const SIDECAR_SUFFIX: &str = ".swarm.json";

/// Extension used when the server's file name carries none.
pub const DEFAULT_EXTENSION: &str = "png";

/// Per-day directory name: `YYYY-MM-DD`.
pub fn date_directory(at: &NaiveDateTime) -> String {
    at.format("%Y-%m-%d").to_string()
}

/// Artifact file name: `YYYYMMDDHHMMSS-{counter}.{ext}`.
///
/// # Examples
///
/// ```
/// use bowser_core::naming::artifact_file_name;
/// use chrono::NaiveDate;
///
/// let at = NaiveDate::from_ymd_opt(2026, 1, 29).unwrap().and_hms_opt(17, 31, 27).unwrap();
/// assert_eq!(artifact_file_name(&at, 1, "png"), "20260129173127-1.png");
/// ```
pub fn artifact_file_name(at: &NaiveDateTime, counter: u32, extension: &str) -> String {
    format!("{}-{counter}.{extension}", at.format("%Y%m%d%H%M%S"))
}

/// Full artifact path for a given counter.
pub fn artifact_path(root: &Path, at: &NaiveDateTime, counter: u32, extension: &str) -> PathBuf {
    root.join(date_directory(at))
        .join(artifact_file_name(at, counter, extension))
}

/// Sidecar path for an artifact: the extension is replaced by `.swarm.json`.
pub fn sidecar_path(artifact: &Path) -> PathBuf {
    let stem = artifact
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    artifact.with_file_name(format!("{stem}{SIDECAR_SUFFIX}"))
}

/// Lower-cased extension of a server file name, without the dot.
pub fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .filter(|e| !e.is_empty())
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

/// Key used for a parameter title in sidecar metadata: lower-cased with
/// spaces removed (`"CFG Scale"` becomes `"cfgscale"`).
pub fn sidecar_key(title: &str) -> String {
    title.to_lowercase().replace(' ', "")
}
