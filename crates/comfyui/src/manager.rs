//! ComfyUI session manager.
//!
//! [`ComfyUIManager`] ties one server session together: the transport, the
//! job queue, the result materializer and a connection task that runs
//! connect -> process -> reconnect until shutdown. After every
//! (re)connection it refreshes the server's device info and reconciles the
//! queue against the server.
//!
//! Queue notifications are broadcast; call [`ComfyUIManager::subscribe`]
//! to receive them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bowser_core::error::BuildError;
use bowser_core::estimation::{estimate_ops, gpu_from_device_name, PerformanceTable, UNKNOWN_GPU};
use bowser_core::graph::{BuildOptions, GraphBuilder};
use bowser_core::hashing::graph_digest;
use bowser_core::params::{MediaRef, ParamValue, ParameterSet};
use bowser_core::template::WorkflowTemplate;
use bowser_core::types::{CorrelationId, EntryId};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::api::{ComfyUIApi, TransportError};
use crate::client::ComfyUIClient;
use crate::config::ComfyUIConfig;
use crate::entry::{JobEntry, JobMetadata};
use crate::events::QueueEvent;
use crate::materializer::ResultMaterializer;
use crate::processor::EventDispatcher;
use crate::queue::{CancelOutcome, JobQueue, QueueConfig, QueueError, QueueHandle, QueueView, Submission};
use crate::reconnect::{reconnect_loop, ReconnectConfig};
use crate::stats::SystemStats;
use crate::transport::Transport;

/// How long shutdown waits for the connection task.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from [`ComfyUIManager::submit`]. Nothing is queued when one is
/// returned.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("Failed to upload '{}': {source}", path.display())]
    Upload {
        path: PathBuf,
        source: TransportError,
    },

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// One ComfyUI server session.
///
/// Created once via [`ComfyUIManager::start`] (or [`ComfyUIManager::new`]
/// without a live connection). The returned `Arc` can be cloned freely.
pub struct ComfyUIManager {
    config: ComfyUIConfig,
    transport: Arc<dyn Transport>,
    queue: QueueHandle,
    performance: PerformanceTable,
    /// Device name from the last successful stats refresh.
    device: Arc<RwLock<Option<String>>>,
    /// Master cancellation token, cancelled during shutdown.
    cancel: CancellationToken,
    connection_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ComfyUIManager {
    /// Build a manager over `transport`. No event connection is opened.
    pub fn new(config: ComfyUIConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        let materializer = Arc::new(ResultMaterializer::new(
            Arc::clone(&transport),
            config.output_root.clone(),
        ));
        let queue = JobQueue::spawn(
            Arc::clone(&transport),
            Some(materializer),
            QueueConfig {
                cancel_timeout: config.cancel_timeout,
                ..QueueConfig::default()
            },
        );

        Arc::new(Self {
            config,
            transport,
            queue,
            performance: PerformanceTable::default(),
            device: Arc::new(RwLock::new(None)),
            cancel: CancellationToken::new(),
            connection_task: Mutex::new(None),
        })
    }

    /// Build the HTTP transport from `config` and connect.
    pub async fn start(config: ComfyUIConfig) -> Result<Arc<Self>, TransportError> {
        let api = ComfyUIApi::new(&config)?;
        let manager = Self::new(config, Arc::new(api));
        manager.connect().await;
        Ok(manager)
    }

    /// Spawn the connection task. Does nothing if it is already running.
    pub async fn connect(&self) {
        let mut task = self.connection_task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let client = ComfyUIClient::new(self.config.ws_url.clone(), self.config.client_id.clone());
        let session = Session {
            client,
            reconnect: self.config.reconnect.clone(),
            queue: self.queue.clone(),
            transport: Arc::clone(&self.transport),
            device: Arc::clone(&self.device),
            cancel: self.cancel.child_token(),
        };

        *task = Some(tokio::spawn(async move {
            tracing::info!(url = session.client.ws_url(), "Starting connection task");
            session.run().await;
            tracing::info!("Connection task exited");
        }));
    }

    pub fn config(&self) -> &ComfyUIConfig {
        &self.config
    }

    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    pub fn snapshot(&self) -> QueueView {
        self.queue.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.queue.subscribe()
    }

    /// Device name reported by the server, if stats were fetched.
    pub async fn device(&self) -> Option<String> {
        self.device.read().await.clone()
    }

    /// Fetch `/system_stats` and remember the primary device.
    pub async fn refresh_stats(&self) -> Result<SystemStats, TransportError> {
        refresh_stats(self.transport.as_ref(), &self.device).await
    }

    /// Build and queue `count` runs of `template`.
    ///
    /// Local images and videos are uploaded first. Auto seeds stride from
    /// `start_seed` (or one random start per batch). Every graph is built
    /// before anything is queued, so a build error queues nothing.
    pub async fn submit(
        &self,
        template: &WorkflowTemplate,
        params: &ParameterSet,
        count: u32,
        start_seed: Option<u64>,
    ) -> Result<Vec<Arc<JobEntry>>, SubmitError> {
        let params = self.upload_local_media(params).await?;
        let start_seed = start_seed.unwrap_or_else(rand::random);
        let builder = GraphBuilder::new(template);

        let built = (0..count.max(1))
            .map(|i| builder.build(&params, &BuildOptions::batch(start_seed, i)))
            .collect::<Result<Vec<_>, _>>()?;

        let device = self.device().await;
        let gpu = device.as_deref().map(gpu_from_device_name).unwrap_or(UNKNOWN_GPU);

        let mut entries = Vec::with_capacity(built.len());
        for run in built {
            let ops = estimate_ops(template, &run.graph);
            let estimate = self.performance.estimate_secs(template.name(), gpu, ops);
            let metadata = JobMetadata {
                workflow_name: template.name().to_string(),
                parameters: run.parameters,
                seed: run.seed,
                original_prompt: run.original_prompt,
                graph_sha256: graph_digest(&run.graph),
                device: device.clone(),
            };
            let entry = self
                .queue
                .enqueue(Submission {
                    correlation_id: CorrelationId::generate(),
                    graph: run.graph,
                    metadata,
                    estimated_runtime_secs: Some(estimate),
                })
                .await?;
            entries.push(entry);
        }

        tracing::info!(
            workflow = %template.name(),
            count = entries.len(),
            start_seed,
            gpu,
            "Workflow runs queued",
        );
        Ok(entries)
    }

    pub async fn cancel(&self, id: EntryId) -> Result<CancelOutcome, QueueError> {
        self.queue.cancel(id).await
    }

    pub async fn clear_history(&self) -> Result<usize, QueueError> {
        self.queue.clear_history().await
    }

    /// Stop the connection task.
    ///
    /// Cancels the master token, then waits up to 5 seconds for a clean
    /// exit.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down ComfyUI manager");
        self.cancel.cancel();

        if let Some(task) = self.connection_task.lock().await.take() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await.is_err() {
                tracing::warn!("Connection task did not stop in time");
            }
        }

        tracing::info!("ComfyUI manager shut down complete");
    }

    // ---- private helpers ----

    /// Replace local media references with uploaded server names. Each
    /// distinct path is uploaded once.
    async fn upload_local_media(&self, params: &ParameterSet) -> Result<ParameterSet, SubmitError> {
        let mut params = params.clone();
        let mut uploaded: HashMap<PathBuf, String> = HashMap::new();

        let local: Vec<(String, PathBuf)> = params
            .iter()
            .filter_map(|(name, value)| match value {
                ParamValue::Image(MediaRef::Local(path)) | ParamValue::Video(MediaRef::Local(path)) => {
                    Some((name.clone(), path.clone()))
                }
                _ => None,
            })
            .collect();

        for (name, path) in local {
            let server_name = match uploaded.get(&path) {
                Some(server_name) => server_name.clone(),
                None => {
                    let server_name = self
                        .transport
                        .upload_image(&path)
                        .await
                        .map_err(|source| SubmitError::Upload {
                            path: path.clone(),
                            source,
                        })?;
                    tracing::info!(path = %path.display(), server_name = %server_name, "Uploaded input media");
                    uploaded.insert(path, server_name.clone());
                    server_name
                }
            };
            match params.get_mut(&name) {
                Some(ParamValue::Image(media)) | Some(ParamValue::Video(media)) => {
                    *media = MediaRef::Server(server_name);
                }
                _ => {}
            }
        }
        Ok(params)
    }
}

async fn refresh_stats(
    transport: &dyn Transport,
    device: &RwLock<Option<String>>,
) -> Result<SystemStats, TransportError> {
    let stats = transport.fetch_stats().await?;
    let name = stats.primary_device_name().map(str::to_string);
    tracing::info!(
        device = ?name,
        comfyui_version = %stats.system.comfyui_version,
        "ComfyUI system stats",
    );
    *device.write().await = name;
    Ok(stats)
}

/// State owned by the connection task.
struct Session {
    client: ComfyUIClient,
    reconnect: ReconnectConfig,
    queue: QueueHandle,
    transport: Arc<dyn Transport>,
    device: Arc<RwLock<Option<String>>>,
    cancel: CancellationToken,
}

impl Session {
    /// Core connection loop: connect -> process messages -> reconnect.
    ///
    /// Runs until the cancellation token is triggered or the queue closes.
    async fn run(&self) {
        let first = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = self.client.connect() => result,
        };
        let mut conn = match first {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "Connection failed, entering reconnect loop");
                match reconnect_loop(&self.client, &self.reconnect, &self.cancel).await {
                    Some(conn) => conn,
                    None => return,
                }
            }
        };

        loop {
            if self.queue.set_connected(true).await.is_err() {
                return;
            }
            self.after_connect();

            let mut dispatcher = EventDispatcher::new(self.queue.clone());
            let result = dispatcher
                .process_messages(&mut conn.ws_stream, &self.cancel)
                .await;

            let _ = self.queue.set_connected(false).await;
            if self.cancel.is_cancelled() {
                return;
            }
            match result {
                Ok(()) => return,
                Err(e) => tracing::warn!(error = %e, "Connection lost, entering reconnect loop"),
            }

            conn = match reconnect_loop(&self.client, &self.reconnect, &self.cancel).await {
                Some(conn) => conn,
                None => return,
            };
        }
    }

    /// Refresh device info and reconcile in the background so frames keep
    /// flowing meanwhile.
    fn after_connect(&self) {
        let transport = Arc::clone(&self.transport);
        let device = Arc::clone(&self.device);
        let queue = self.queue.clone();
        tokio::spawn(async move {
            if let Err(e) = refresh_stats(transport.as_ref(), &device).await {
                tracing::warn!(error = %e, "Failed to fetch system stats");
            }
            if let Err(e) = queue.reconcile().await {
                tracing::warn!(error = %e, "Reconciliation aborted");
            }
        });
    }
}
