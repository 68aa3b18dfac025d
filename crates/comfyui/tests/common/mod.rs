#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use bowser_comfyui::api::{SubmissionAck, TransportError};
use bowser_comfyui::entry::JobMetadata;
use bowser_comfyui::outputs::ArtifactRef;
use bowser_comfyui::queue::{QueueView, Submission};
use bowser_comfyui::stats::{DeviceInfo, SystemStats};
use bowser_comfyui::transport::{RemoteStatus, Transport};
use bowser_core::graph::{BuildOptions, GraphBuilder};
use bowser_core::params::ParameterSet;
use bowser_core::template::WorkflowTemplate;
use bowser_core::types::{CorrelationId, ServerId};

/// Scriptable in-memory [`Transport`].
///
/// Submissions are acknowledged with the proposed correlation id as the
/// server id, the way ComfyUI adopts a client-supplied `prompt_id`.
#[derive(Default)]
pub struct FakeTransport {
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    submit_delay: Duration,
    cancel_delay: Duration,
    fail_submit: Option<String>,
    fail_cancel: bool,
    next_number: i64,
    submitted: Vec<CorrelationId>,
    removed: Vec<ServerId>,
    interrupted: Vec<ServerId>,
    uploaded: Vec<PathBuf>,
    statuses: HashMap<ServerId, RemoteStatus>,
    artifacts: HashMap<String, Vec<u8>>,
    device: Option<String>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_submit_delay(&self, delay: Duration) {
        self.state.lock().unwrap().submit_delay = delay;
    }

    pub fn set_cancel_delay(&self, delay: Duration) {
        self.state.lock().unwrap().cancel_delay = delay;
    }

    /// Make every submission fail as unreachable.
    pub fn fail_submissions(&self, message: &str) {
        self.state.lock().unwrap().fail_submit = Some(message.to_string());
    }

    pub fn fail_cancels(&self) {
        self.state.lock().unwrap().fail_cancel = true;
    }

    pub fn set_status(&self, server_id: &ServerId, status: RemoteStatus) {
        self.state
            .lock()
            .unwrap()
            .statuses
            .insert(server_id.clone(), status);
    }

    pub fn add_artifact(&self, filename: &str, bytes: Vec<u8>) {
        self.state
            .lock()
            .unwrap()
            .artifacts
            .insert(filename.to_string(), bytes);
    }

    pub fn set_device(&self, name: &str) {
        self.state.lock().unwrap().device = Some(name.to_string());
    }

    pub fn submitted(&self) -> Vec<CorrelationId> {
        self.state.lock().unwrap().submitted.clone()
    }

    /// Ids dropped from the pending queue.
    pub fn removed(&self) -> Vec<ServerId> {
        self.state.lock().unwrap().removed.clone()
    }

    pub fn interrupted(&self) -> Vec<ServerId> {
        self.state.lock().unwrap().interrupted.clone()
    }

    pub fn uploaded(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().uploaded.clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn submit(
        &self,
        _graph: &bowser_core::graph::ExecutionGraph,
        correlation_id: &CorrelationId,
    ) -> Result<SubmissionAck, TransportError> {
        let (delay, failure) = {
            let mut state = self.state.lock().unwrap();
            state.submitted.push(correlation_id.clone());
            (state.submit_delay, state.fail_submit.clone())
        };
        tokio::time::sleep(delay).await;

        if let Some(message) = failure {
            return Err(TransportError::Unreachable(message));
        }
        let mut state = self.state.lock().unwrap();
        state.next_number += 1;
        Ok(SubmissionAck {
            server_id: ServerId::from(correlation_id.as_str()),
            number: state.next_number,
            node_errors: json!({}),
        })
    }

    async fn remove_pending(&self, server_id: &ServerId) -> Result<(), TransportError> {
        let (delay, fail) = {
            let mut state = self.state.lock().unwrap();
            state.removed.push(server_id.clone());
            (state.cancel_delay, state.fail_cancel)
        };
        tokio::time::sleep(delay).await;
        if fail {
            return Err(TransportError::Unreachable("connection refused".into()));
        }
        Ok(())
    }

    async fn interrupt(&self, server_id: &ServerId) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.interrupted.push(server_id.clone());
        if state.fail_cancel {
            return Err(TransportError::Unreachable("connection refused".into()));
        }
        Ok(())
    }

    async fn fetch_artifact(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, TransportError> {
        self.state
            .lock()
            .unwrap()
            .artifacts
            .get(&artifact.filename)
            .cloned()
            .ok_or_else(|| TransportError::Status {
                status: 404,
                body: format!("no such file: {}", artifact.filename),
            })
    }

    async fn fetch_stats(&self) -> Result<SystemStats, TransportError> {
        let device = self.state.lock().unwrap().device.clone();
        Ok(SystemStats {
            devices: device
                .map(|name| DeviceInfo {
                    name,
                    ..DeviceInfo::default()
                })
                .into_iter()
                .collect(),
            ..SystemStats::default()
        })
    }

    async fn fetch_status(&self, server_id: &ServerId) -> Result<RemoteStatus, TransportError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .statuses
            .get(server_id)
            .cloned()
            .unwrap_or(RemoteStatus::Unknown))
    }

    async fn upload_image(&self, path: &Path) -> Result<String, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.uploaded.push(path.to_path_buf());
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(format!("bowser/{name}"))
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn txt2img() -> WorkflowTemplate {
    WorkflowTemplate::from_json(
        "txt2img",
        &json!({
            "3": { "class_type": "KSampler",
                   "inputs": { "seed": ["10", 0], "steps": ["11", 0], "model": ["4", 0] } },
            "4": { "class_type": "CheckpointLoaderSimple",
                   "inputs": { "ckpt_name": "sdxl.safetensors" } },
            "9": { "class_type": "SaveImage",
                   "inputs": { "images": ["3", 0], "filename_prefix": "ComfyUI" } },
            "10": { "class_type": "SwarmInputInteger",
                    "inputs": { "title": "Seed", "value": -1, "view_type": "seed" } },
            "11": { "class_type": "SwarmInputInteger",
                    "inputs": { "title": "Steps", "value": 20, "min": 1, "max": 150 } },
            "12": { "class_type": "SwarmInputText",
                    "inputs": { "title": "Prompt", "value": "a lighthouse", "view_type": "prompt" } },
            "15": { "class_type": "SwarmInputImage",
                    "inputs": { "title": "Reference", "image": "" } }
        }),
    )
    .expect("template should parse")
}

/// A ready-to-enqueue submission built from [`txt2img`].
pub fn submission(seed: u64) -> Submission {
    let template = txt2img();
    let params = template.default_parameters().with(
        "Reference",
        bowser_core::params::ParamValue::Image(bowser_core::params::MediaRef::Server(
            "ref.png".into(),
        )),
    );
    let built = GraphBuilder::new(&template)
        .build(&params, &BuildOptions::batch(seed, 0))
        .expect("graph should build");
    Submission {
        correlation_id: CorrelationId::generate(),
        metadata: JobMetadata {
            workflow_name: template.name().to_string(),
            parameters: built.parameters,
            seed: built.seed,
            original_prompt: built.original_prompt,
            graph_sha256: bowser_core::hashing::graph_digest(&built.graph),
            device: None,
        },
        graph: built.graph,
        estimated_runtime_secs: Some(2.0),
    }
}

pub fn empty_metadata() -> JobMetadata {
    JobMetadata {
        workflow_name: "txt2img".into(),
        parameters: ParameterSet::new(),
        seed: None,
        original_prompt: None,
        graph_sha256: String::new(),
        device: None,
    }
}

pub fn output(filename: &str) -> ArtifactRef {
    ArtifactRef {
        filename: filename.to_string(),
        subfolder: String::new(),
        kind: "output".into(),
        node_id: Some("9".into()),
    }
}

/// A tiny valid PNG.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut bytes = Vec::new();
    image::RgbImage::new(width, height)
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

/// Poll the view until `predicate` holds, or fail after two seconds.
pub async fn wait_for(
    view: &mut tokio::sync::watch::Receiver<QueueView>,
    predicate: impl Fn(&QueueView) -> bool,
) -> QueueView {
    let result = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            {
                let current = view.borrow_and_update();
                if predicate(&current) {
                    return current.clone();
                }
            }
            view.changed().await.expect("queue stopped");
        }
    })
    .await;
    result.expect("condition not reached in time")
}

/// Enqueue a submission and wait for its acknowledgment.
pub async fn enqueue_acked(
    queue: &bowser_comfyui::queue::QueueHandle,
    seed: u64,
) -> (bowser_core::types::EntryId, ServerId) {
    let entry = queue.enqueue(submission(seed)).await.expect("enqueue");
    let mut view = queue.watch();
    let view = wait_for(&mut view, |v| {
        v.get(entry.id).is_some_and(|e| e.server_id.is_some())
    })
    .await;
    let server_id = view
        .get(entry.id)
        .and_then(|e| e.server_id.clone())
        .expect("server id bound");
    (entry.id, server_id)
}

/// A control frame as ComfyUI sends it.
pub fn frame(kind: &str, data: serde_json::Value) -> String {
    json!({ "type": kind, "data": data }).to_string()
}
