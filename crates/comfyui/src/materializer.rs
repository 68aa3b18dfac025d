//! Writing finished artifacts to the output directory.
//!
//! Each output artifact of a completed entry is downloaded and stored under
//! `{root}/{YYYY-MM-DD}/{YYYYMMDDHHMMSS}-{counter}.{ext}` with a
//! `.swarm.json` sidecar. Names are claimed with create-if-absent, so two
//! writers racing for the same name never overwrite each other; the loser
//! moves on to the next counter.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bowser_core::naming::{artifact_path, date_directory, extension_of, sidecar_key, sidecar_path};
use bowser_core::params::ParamValue;
use chrono::NaiveDateTime;
use tokio::io::AsyncWriteExt;

use crate::api::TransportError;
use crate::entry::{JobEntry, MaterializedArtifact};
use crate::outputs::ArtifactRef;
use crate::transport::{RemoteStatus, Transport};

/// Per-artifact materialization failure. Never rolls back other artifacts
/// and never changes the entry's terminal state.
#[derive(Debug, thiserror::Error)]
pub enum MaterializationError {
    #[error("Failed to fetch artifact '{filename}': {source}")]
    FetchFailed {
        filename: String,
        source: TransportError,
    },

    #[error("Failed to write '{}': {source}", path.display())]
    WriteFailed {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Result of materializing one entry.
#[derive(Debug, Default)]
pub struct MaterializationReport {
    pub written: Vec<MaterializedArtifact>,
    pub failures: Vec<MaterializationError>,
}

pub struct ResultMaterializer {
    transport: Arc<dyn Transport>,
    output_root: PathBuf,
}

impl ResultMaterializer {
    pub fn new(transport: Arc<dyn Transport>, output_root: PathBuf) -> Self {
        Self {
            transport,
            output_root,
        }
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Download and store every output artifact of `entry`.
    pub async fn materialize(&self, entry: &JobEntry) -> MaterializationReport {
        let mut report = MaterializationReport::default();
        let artifacts = self.resolve_outputs(entry).await;
        if artifacts.is_empty() {
            tracing::info!(entry_id = %entry.id, "No output artifacts to materialize");
            return report;
        }

        let at = chrono::Local::now().naive_local();
        let mut counter = 1u32;

        for artifact in artifacts {
            let bytes = match self.transport.fetch_artifact(&artifact).await {
                Ok(bytes) => bytes,
                Err(source) => {
                    tracing::warn!(
                        entry_id = %entry.id,
                        filename = %artifact.filename,
                        error = %source,
                        "Artifact download failed",
                    );
                    report.failures.push(MaterializationError::FetchFailed {
                        filename: artifact.filename.clone(),
                        source,
                    });
                    continue;
                }
            };

            match self.store(entry, &artifact, &bytes, &at, &mut counter).await {
                Ok((written, sidecar_error)) => {
                    tracing::info!(
                        entry_id = %entry.id,
                        path = %written.path.display(),
                        "Artifact written",
                    );
                    report.written.push(written);
                    report.failures.extend(sidecar_error);
                }
                Err(e) => {
                    tracing::error!(entry_id = %entry.id, error = %e, "Artifact write failed");
                    report.failures.push(e);
                }
            }
        }
        report
    }

    /// Output-type artifacts of the entry. The server's history is
    /// consulted when no `executed` frames were seen, or when the event
    /// connection dropped while the job was on the server; history outputs
    /// are merged in after the streamed ones.
    async fn resolve_outputs(&self, entry: &JobEntry) -> Vec<ArtifactRef> {
        let mut outputs: Vec<ArtifactRef> =
            entry.outputs.iter().filter(|a| a.is_output()).cloned().collect();
        if !outputs.is_empty() && !entry.missed_events {
            return outputs;
        }
        let Some(server_id) = &entry.server_id else {
            return outputs;
        };

        match self.transport.fetch_status(server_id).await {
            Ok(RemoteStatus::Completed { outputs: history }) => {
                for artifact in history.into_iter().filter(|a| a.is_output()) {
                    if !outputs.iter().any(|o| o.same_file(&artifact)) {
                        outputs.push(artifact);
                    }
                }
            }
            Ok(other) => {
                tracing::debug!(entry_id = %entry.id, status = ?other, "History has no outputs");
            }
            Err(e) => {
                tracing::warn!(entry_id = %entry.id, error = %e, "History lookup failed");
            }
        }
        outputs
    }

    /// Claim a free name, write the artifact, then its sidecar.
    ///
    /// The sidecar path is claimed first because it is shared by every
    /// extension of a stem.
    async fn store(
        &self,
        entry: &JobEntry,
        artifact: &ArtifactRef,
        bytes: &[u8],
        at: &NaiveDateTime,
        counter: &mut u32,
    ) -> Result<(MaterializedArtifact, Option<MaterializationError>), MaterializationError> {
        let dir = self.output_root.join(date_directory(at));
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| MaterializationError::WriteFailed {
                path: dir.clone(),
                source,
            })?;

        let extension = extension_of(&artifact.filename);
        let (path, sidecar, mut sidecar_file) = loop {
            let path = artifact_path(&self.output_root, at, *counter, &extension);
            let sidecar = sidecar_path(&path);
            *counter += 1;

            let sidecar_file = match create_new(&sidecar).await {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(source) => return Err(MaterializationError::WriteFailed { path: sidecar, source }),
            };

            match create_new(&path).await {
                Ok(mut file) => {
                    let written = async {
                        file.write_all(bytes).await?;
                        file.flush().await
                    }
                    .await;
                    if let Err(source) = written {
                        let _ = tokio::fs::remove_file(&path).await;
                        let _ = tokio::fs::remove_file(&sidecar).await;
                        return Err(MaterializationError::WriteFailed { path, source });
                    }
                    break (path, sidecar, sidecar_file);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let _ = tokio::fs::remove_file(&sidecar).await;
                }
                Err(source) => {
                    let _ = tokio::fs::remove_file(&sidecar).await;
                    return Err(MaterializationError::WriteFailed { path, source });
                }
            }
        };

        let dimensions = image_dimensions(bytes);
        let metadata = sidecar_json(entry, artifact, dimensions, at);
        let sidecar_result = async {
            let text = serde_json::to_vec_pretty(&metadata).map_err(std::io::Error::other)?;
            sidecar_file.write_all(&text).await?;
            sidecar_file.flush().await
        }
        .await;

        let (sidecar, sidecar_error) = match sidecar_result {
            Ok(()) => (Some(sidecar), None),
            Err(source) => {
                let _ = tokio::fs::remove_file(&sidecar).await;
                (
                    None,
                    Some(MaterializationError::WriteFailed {
                        path: sidecar,
                        source,
                    }),
                )
            }
        };

        Ok((
            MaterializedArtifact {
                path,
                sidecar,
                source: artifact.clone(),
                dimensions,
            },
            sidecar_error,
        ))
    }
}

async fn create_new(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
}

/// Dimensions from the image header; `None` for videos and unknown formats.
fn image_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

/// Sidecar layout:
///
/// ```json
/// {
///   "sui_image_params": { "<title lowercased, no spaces>": value, "generation_time": secs },
///   "sui_extra_data":   { "date": "YYYY-MM-DD", "generation_time": "4.98 sec" },
///   "bowser_params":    { "workflow_name", "generation_time", "device", "seed", ... }
/// }
/// ```
fn sidecar_json(
    entry: &JobEntry,
    artifact: &ArtifactRef,
    dimensions: Option<(u32, u32)>,
    at: &NaiveDateTime,
) -> serde_json::Value {
    let metadata = &entry.metadata;
    let generation_time = entry.generation_secs();

    let mut image_params = serde_json::Map::new();
    for (title, value) in metadata.parameters.iter() {
        let value = match (value, metadata.seed) {
            (ParamValue::Seed(_), Some(seed)) => seed.into(),
            _ => value.to_json(),
        };
        image_params.insert(sidecar_key(title), value);
    }
    if let Some(secs) = generation_time {
        image_params.insert("generation_time".into(), secs.into());
    }

    let mut extra = serde_json::Map::new();
    extra.insert("date".into(), date_directory(at).into());
    if let Some(secs) = generation_time {
        extra.insert("generation_time".into(), format!("{secs:.2} sec").into());
    }

    let mut bowser = serde_json::json!({
        "workflow_name": metadata.workflow_name,
        "generation_time": generation_time,
        "device": metadata.device,
        "seed": metadata.seed,
        "server_id": entry.server_id.as_ref().map(|s| s.as_str()),
        "correlation_id": entry.correlation_id.as_str(),
        "graph_sha256": metadata.graph_sha256,
        "generated_at": entry.terminated_at.map(|t| t.to_rfc3339()),
        "source": artifact,
    });
    if let Some(prompt) = &metadata.original_prompt {
        bowser["original_prompt"] = prompt.clone().into();
    }
    if let Some((width, height)) = dimensions {
        bowser["width"] = width.into();
        bowser["height"] = height.into();
    }

    serde_json::json!({
        "sui_image_params": image_params,
        "sui_extra_data": extra,
        "bowser_params": bowser,
    })
}
