//! Integration tests for writing artifacts to the output directory.

mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use assert_matches::assert_matches;
use chrono::Utc;

use bowser_comfyui::entry::{JobEntry, JobEvent, JobMetadata, JobState};
use bowser_comfyui::materializer::{MaterializationError, ResultMaterializer};
use bowser_comfyui::outputs::ArtifactRef;
use bowser_comfyui::transport::RemoteStatus;
use bowser_core::params::{ParamValue, ParameterSet, SeedValue};
use bowser_core::types::{CorrelationId, EntryId, ServerId};

use common::{output, png_bytes, FakeTransport};

fn completed(outputs: Vec<ArtifactRef>) -> JobEntry {
    let metadata = Arc::new(JobMetadata {
        workflow_name: "txt2img".into(),
        parameters: ParameterSet::new()
            .with("Steps", ParamValue::Integer(20))
            .with("Seed", ParamValue::Seed(SeedValue::Fixed(1234))),
        seed: Some(1234),
        original_prompt: None,
        graph_sha256: "deadbeef".into(),
        device: Some("cuda:0 NVIDIA GeForce RTX 3090".into()),
    });
    let mut entry = JobEntry::new(
        EntryId(1),
        CorrelationId::from("c-1"),
        metadata,
        None,
        Utc::now(),
    );
    entry.server_id = Some(ServerId::from("c-1"));
    let running = entry.apply(&JobEvent::Started, Utc::now()).unwrap();
    running
        .apply(&JobEvent::Completed { outputs }, Utc::now())
        .unwrap()
}

fn read_json(path: &Path) -> serde_json::Value {
    serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
}

/// Paths the materializer would pick for `counter` in the current or the
/// next second.
fn candidate_paths(root: &Path, counter: u32, ext: &str) -> Vec<PathBuf> {
    let now = chrono::Local::now().naive_local();
    [now, now + chrono::Duration::seconds(1)]
        .iter()
        .map(|at| bowser_core::naming::artifact_path(root, at, counter, ext))
        .collect()
}

// ---------------------------------------------------------------------------
// Test: artifacts and sidecars
// ---------------------------------------------------------------------------

#[tokio::test]
async fn writes_output_artifacts_with_sidecars() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    transport.add_artifact("ComfyUI_00001_.png", png_bytes(4, 3));
    transport.add_artifact("preview.png", png_bytes(1, 1));
    let materializer = ResultMaterializer::new(transport, dir.path().to_path_buf());

    let mut preview = output("preview.png");
    preview.kind = "temp".into();
    let entry = completed(vec![output("ComfyUI_00001_.png"), preview]);
    assert_eq!(entry.state, JobState::Completed);

    let report = materializer.materialize(&entry).await;
    assert!(report.failures.is_empty());
    assert_eq!(report.written.len(), 1);

    let written = &report.written[0];
    assert_eq!(written.dimensions, Some((4, 3)));
    assert!(written.path.exists());
    assert_eq!(written.path.extension().unwrap(), "png");
    let day = written.path.parent().unwrap();
    assert_eq!(day.parent().unwrap(), dir.path());
    let stem = written.path.file_stem().unwrap().to_string_lossy().into_owned();
    assert!(stem.ends_with("-1"), "unexpected stem {stem}");
    assert_eq!(stem.len(), "YYYYMMDDHHMMSS-1".len());

    let sidecar = written.sidecar.as_ref().unwrap();
    assert_eq!(
        sidecar.file_name().unwrap().to_string_lossy(),
        format!("{stem}.swarm.json")
    );
    let json = read_json(sidecar);
    assert_eq!(json["sui_image_params"]["steps"], 20);
    assert_eq!(json["sui_image_params"]["seed"], 1234);
    assert_eq!(
        json["sui_extra_data"]["date"],
        day.file_name().unwrap().to_string_lossy().into_owned()
    );
    assert_eq!(json["bowser_params"]["graph_sha256"], "deadbeef");
    assert_eq!(json["bowser_params"]["height"], 3);
}

#[tokio::test]
async fn fetch_failures_are_per_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    transport.add_artifact("b.png", png_bytes(2, 2));
    let materializer = ResultMaterializer::new(transport, dir.path().to_path_buf());

    let report = materializer
        .materialize(&completed(vec![output("a.png"), output("b.png")]))
        .await;

    assert_eq!(report.written.len(), 1);
    assert_eq!(report.failures.len(), 1);
    assert_matches!(
        &report.failures[0],
        MaterializationError::FetchFailed { filename, .. } if filename == "a.png"
    );
}

#[tokio::test]
async fn existing_files_are_never_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    transport.add_artifact("a.png", png_bytes(2, 2));
    transport.add_artifact("b.png", png_bytes(3, 3));
    let materializer = ResultMaterializer::new(transport, dir.path().to_path_buf());

    // Occupy counter 1 for this second and the next.
    let taken = candidate_paths(dir.path(), 1, "png");
    for path in &taken {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"keep me").unwrap();
    }

    let report = materializer
        .materialize(&completed(vec![output("a.png"), output("b.png")]))
        .await;
    assert!(report.failures.is_empty());
    assert_eq!(report.written.len(), 2);

    for path in &taken {
        assert_eq!(std::fs::read(path).unwrap(), b"keep me");
    }
    let paths: Vec<&PathBuf> = report.written.iter().map(|w| &w.path).collect();
    assert_ne!(paths[0], paths[1]);
    assert!(paths.iter().all(|p| !taken.contains(*p)));
}

#[tokio::test]
async fn concurrent_writers_pick_distinct_names() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    for name in ["a.png", "b.png", "c.png"] {
        transport.add_artifact(name, png_bytes(1, 1));
    }
    let materializer = Arc::new(ResultMaterializer::new(transport, dir.path().to_path_buf()));
    let entry = Arc::new(completed(vec![output("a.png"), output("b.png"), output("c.png")]));

    let runs: Vec<_> = (0..4)
        .map(|_| {
            let materializer = Arc::clone(&materializer);
            let entry = Arc::clone(&entry);
            tokio::spawn(async move { materializer.materialize(&entry).await })
        })
        .collect();

    let mut paths = Vec::new();
    for run in runs {
        let report = run.await.unwrap();
        assert!(report.failures.is_empty());
        paths.extend(report.written.into_iter().map(|w| w.path));
    }
    assert_eq!(paths.len(), 12);
    let mut unique = paths.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 12);
    assert!(paths.iter().all(|p| p.exists()));
}

#[tokio::test]
async fn outputs_fall_back_to_history() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    transport.add_artifact("hist.png", png_bytes(2, 2));
    transport.set_status(
        &ServerId::from("c-1"),
        RemoteStatus::Completed {
            outputs: vec![output("hist.png")],
        },
    );
    let materializer = ResultMaterializer::new(transport, dir.path().to_path_buf());

    let report = materializer.materialize(&completed(Vec::new())).await;
    assert_eq!(report.written.len(), 1);
    assert_eq!(report.written[0].source.filename, "hist.png");
    let path = &report.written[0].path;
    assert!(path.starts_with(dir.path()));
    let day = path.parent().unwrap().file_name().unwrap().to_string_lossy().into_owned();
    assert_eq!(day.len(), "YYYY-MM-DD".len());
}

#[tokio::test]
async fn history_outputs_join_streamed_ones_after_a_stream_gap() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    transport.add_artifact("a.png", png_bytes(2, 2));
    transport.add_artifact("b.png", png_bytes(2, 2));
    transport.set_status(
        &ServerId::from("c-1"),
        RemoteStatus::Completed {
            outputs: vec![output("a.png"), output("b.png")],
        },
    );
    let materializer = ResultMaterializer::new(transport, dir.path().to_path_buf());

    let mut entry = completed(vec![output("a.png")]);
    entry.missed_events = true;
    let report = materializer.materialize(&entry).await;

    assert!(report.failures.is_empty());
    let sources: Vec<&str> = report.written.iter().map(|w| w.source.filename.as_str()).collect();
    assert_eq!(sources, ["a.png", "b.png"]);
}

#[tokio::test]
async fn history_is_not_consulted_without_a_stream_gap() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    transport.add_artifact("a.png", png_bytes(2, 2));
    transport.add_artifact("b.png", png_bytes(2, 2));
    transport.set_status(
        &ServerId::from("c-1"),
        RemoteStatus::Completed {
            outputs: vec![output("a.png"), output("b.png")],
        },
    );
    let materializer = ResultMaterializer::new(transport, dir.path().to_path_buf());

    let report = materializer.materialize(&completed(vec![output("a.png")])).await;
    assert_eq!(report.written.len(), 1);
    assert_eq!(report.written[0].source.filename, "a.png");
}
