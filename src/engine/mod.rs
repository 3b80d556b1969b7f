//! Task engine
//!
//! Owns the heartbeat loop, the task-stream consumer, per-task dispatch,
//! chunked model transfer and result reporting. One task directive is
//! processed at a time: the next directive is not read until the previous
//! task's terminal result RPC has returned. The heartbeat runs on its own
//! task and never interferes with the stream consumer.

pub mod context;
pub mod handler;
pub mod transfer;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use tracing::{debug, error, info, warn};

use crate::channel::{AuthedChannel, CombinerChannel};
use crate::pb::{
    self, CombinerClient, ConnectorClient, ModelServiceClient, StatusType, TaskRequest,
};
use crate::scratch;

use context::LoggingContext;
use handler::TaskHandler;
use transfer::TransferError;

/// Default heartbeat cadence.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Task engine errors.
///
/// `ChannelUnavailable` ends the run loop; the per-task variants abandon
/// the current task only.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("combiner channel unavailable: {0}")]
    ChannelUnavailable(#[source] tonic::Status),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("task callback failed: {0:#}")]
    Callback(#[source] anyhow::Error),
    #[error("result report rejected: {0}")]
    Reporting(#[source] tonic::Status),
    #[error("heartbeat rejected: {0}")]
    Heartbeat(#[source] tonic::Status),
    #[error("metric report rejected: {0}")]
    Metric(#[source] tonic::Status),
}

/// Client identity stamped into every `sender` field.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub name: String,
    pub client_id: String,
}

impl ClientIdentity {
    pub fn new(name: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client_id: client_id.into(),
        }
    }

    /// Sender sub-message for outgoing RPCs, composed by value.
    pub fn sender(&self) -> pb::Client {
        pb::Client {
            name: self.name.clone(),
            role: pb::Role::Client as i32,
            client_id: self.client_id.clone(),
        }
    }
}

/// Handle passed to user callbacks for metric emission.
///
/// Metrics are tagged with the running task's logging context. Outside a
/// task the context triple is empty and metrics are emitted with empty
/// correlation ids, matching the server's tolerance for uncorrelated
/// metrics.
#[derive(Clone)]
pub struct TaskSession {
    connector: ConnectorClient<AuthedChannel>,
    identity: ClientIdentity,
    ctx: Arc<Mutex<LoggingContext>>,
}

impl TaskSession {
    /// Emit user metrics via `SendModelMetric`.
    ///
    /// An explicit `step` overrides the context's counter before tagging;
    /// `commit` advances the counter after the emission is composed. The
    /// RPC is awaited before returning, so successive calls are strictly
    /// ordered.
    pub async fn log_metrics(
        &self,
        metrics: &BTreeMap<String, f32>,
        step: Option<u32>,
        commit: bool,
    ) -> Result<(), EngineError> {
        let (model_id, round_id, session_id, logged_step) = {
            let mut ctx = lock_context(&self.ctx);
            if let Some(step) = step {
                ctx.set_step(step);
            }
            let snapshot = (
                ctx.model_id().to_string(),
                ctx.round_id().to_string(),
                ctx.session_id().to_string(),
                ctx.step(),
            );
            if commit {
                ctx.bump_step();
            }
            snapshot
        };

        let metric = pb::ModelMetric {
            sender: Some(self.identity.sender()),
            model_id,
            round_id,
            session_id,
            step: Some(logged_step),
            metrics: metrics
                .iter()
                .map(|(key, value)| pb::NamedMetric {
                    key: key.clone(),
                    value: *value,
                })
                .collect(),
        };

        let mut connector = self.connector.clone();
        connector
            .send_model_metric(metric)
            .await
            .map_err(EngineError::Metric)?;
        Ok(())
    }
}

/// The client's communication and task-dispatch engine.
#[derive(Clone)]
pub struct TaskEngine {
    connector: ConnectorClient<AuthedChannel>,
    combiner: CombinerClient<AuthedChannel>,
    models: ModelServiceClient<AuthedChannel>,
    identity: ClientIdentity,
    handler: Arc<dyn TaskHandler>,
    ctx: Arc<Mutex<LoggingContext>>,
    chunk_size: usize,
    heartbeat_interval: Duration,
    scratch_dir: PathBuf,
}

impl TaskEngine {
    pub fn new(
        channel: &CombinerChannel,
        identity: ClientIdentity,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        let authed = channel.authed();
        Self {
            connector: ConnectorClient::new(authed.clone()),
            combiner: CombinerClient::new(authed.clone()),
            models: ModelServiceClient::new(authed),
            identity,
            handler,
            ctx: Arc::new(Mutex::new(LoggingContext::default())),
            chunk_size: scratch::DEFAULT_CHUNK_SIZE,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            scratch_dir: PathBuf::from("."),
        }
    }

    /// Upload chunk size. Per-client, never negotiated with the server.
    pub fn set_chunk_size(&mut self, chunk_size: usize) {
        self.chunk_size = chunk_size.max(1);
    }

    pub fn set_heartbeat_interval(&mut self, interval: Duration) {
        self.heartbeat_interval = interval;
    }

    /// Directory scratch files are minted under (default `.`).
    pub fn set_scratch_dir(&mut self, dir: impl Into<PathBuf>) {
        self.scratch_dir = dir.into();
    }

    /// Session handle for metric emission, usable inside and outside
    /// callbacks.
    pub fn session(&self) -> TaskSession {
        TaskSession {
            connector: self.connector.clone(),
            identity: self.identity.clone(),
            ctx: Arc::clone(&self.ctx),
        }
    }

    /// Emit user metrics tagged with the current logging context.
    pub async fn log_metrics(
        &self,
        metrics: &BTreeMap<String, f32>,
        step: Option<u32>,
        commit: bool,
    ) -> Result<(), EngineError> {
        self.session().log_metrics(metrics, step, commit).await
    }

    /// Run until the task stream ends or the channel becomes unavailable.
    ///
    /// Spawns the heartbeat ticker, then consumes task directives one at a
    /// time on the calling task. The heartbeat is aborted when the
    /// consumer exits.
    pub async fn run(&self) -> Result<(), EngineError> {
        let heartbeat = {
            let engine = self.clone();
            tokio::spawn(async move { engine.heartbeat_loop().await })
        };

        let result = self.connect_task_stream().await;
        heartbeat.abort();
        result
    }

    /// One-shot heartbeat RPC; returns the controller's response string.
    pub async fn heart_beat(&self) -> Result<String, EngineError> {
        let request = pb::Heartbeat {
            sender: Some(self.identity.sender()),
        };
        let mut connector = self.connector.clone();
        let response = connector
            .send_heartbeat(request)
            .await
            .map_err(EngineError::Heartbeat)?;
        Ok(response.into_inner().response)
    }

    async fn heartbeat_loop(&self) {
        let mut interval = tokio::time::interval(self.heartbeat_interval);
        loop {
            interval.tick().await;
            match self.heart_beat().await {
                Ok(response) => debug!(response = %response, "Heartbeat acknowledged"),
                Err(e) => warn!(error = %e, "Heartbeat failed"),
            }
        }
    }

    /// Open the task stream and process directives in arrival order.
    pub async fn connect_task_stream(&self) -> Result<(), EngineError> {
        let message = pb::ClientAvailableMessage {
            sender: Some(self.identity.sender()),
        };
        let mut request = tonic::Request::new(message);
        match self.identity.name.parse() {
            Ok(value) => {
                request.metadata_mut().insert("client", value);
            }
            Err(_) => {
                warn!(
                    name = %self.identity.name,
                    "Client name is not valid metadata ASCII, omitting 'client' header"
                );
            }
        }

        let mut combiner = self.combiner.clone();
        let mut stream = combiner
            .task_stream(request)
            .await
            .map_err(EngineError::ChannelUnavailable)?
            .into_inner();
        info!(client = %self.identity.name, "Connected to task stream");

        loop {
            match stream.message().await {
                Ok(Some(task)) => self.dispatch(task).await,
                Ok(None) => {
                    info!("Task stream closed by combiner");
                    return Ok(());
                }
                Err(status) => return Err(EngineError::ChannelUnavailable(status)),
            }
        }
    }

    /// Dispatch one directive. Per-task failures are logged here and never
    /// escape; the consumer reads the next directive.
    async fn dispatch(&self, task: TaskRequest) {
        let result = match StatusType::try_from(task.r#type) {
            Ok(StatusType::ModelUpdate) => self.with_context(&task, self.run_update(&task)).await,
            Ok(StatusType::ModelValidation) => {
                self.with_context(&task, self.run_validation(&task)).await
            }
            Ok(StatusType::ModelPrediction) => {
                self.with_context(&task, self.run_prediction(&task)).await
            }
            Ok(StatusType::Default) | Err(_) => {
                warn!(
                    task_id = %task.task_id,
                    task_type = task.r#type,
                    "Unknown task type, skipping"
                );
                return;
            }
        };

        if let Err(e) = result {
            error!(
                task_id = %task.task_id,
                model_id = %task.model_id,
                error = %e,
                "Task failed"
            );
        }
    }

    /// Install the task's logging context for the duration of `flow`,
    /// clearing it on the way out regardless of outcome.
    async fn with_context<F>(&self, task: &TaskRequest, flow: F) -> Result<(), EngineError>
    where
        F: std::future::Future<Output = Result<(), EngineError>>,
    {
        *lock_context(&self.ctx) = LoggingContext::for_task(task);
        let result = flow.await;
        lock_context(&self.ctx).clear();
        result
    }

    async fn run_update(&self, task: &TaskRequest) -> Result<(), EngineError> {
        let model_update_id = scratch::mint_id();
        let in_path = scratch::model_path(&self.scratch_dir, &scratch::mint_id());
        let out_path = scratch::model_path(&self.scratch_dir, &model_update_id);

        info!(model_id = %task.model_id, session_id = %task.session_id, "Updating local model");
        let result = self
            .update_inner(task, &model_update_id, &in_path, &out_path)
            .await;

        scratch::remove(&in_path).await;
        scratch::remove(&out_path).await;
        result
    }

    async fn update_inner(
        &self,
        task: &TaskRequest,
        model_update_id: &str,
        in_path: &Path,
        out_path: &Path,
    ) -> Result<(), EngineError> {
        transfer::download_to_file(&self.models, self.identity.sender(), &task.model_id, in_path)
            .await?;

        let session = self.session();
        let meta = self
            .handler
            .train(&session, in_path, out_path)
            .await
            .map_err(EngineError::Callback)?;

        transfer::upload_from_file(
            &self.models,
            self.identity.sender(),
            model_update_id,
            out_path,
            self.chunk_size,
        )
        .await?;

        let update = pb::ModelUpdate {
            sender: Some(self.identity.sender()),
            receiver: None,
            model_id: task.model_id.clone(),
            model_update_id: model_update_id.to_string(),
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            meta: meta.to_string(),
            config: task.data.clone(),
        };

        let mut combiner = self.combiner.clone();
        let response = combiner
            .send_model_update(update)
            .await
            .map_err(EngineError::Reporting)?;
        debug!(
            model_id = %task.model_id,
            model_update_id = %model_update_id,
            response = %response.into_inner().response,
            "Model update reported"
        );
        Ok(())
    }

    async fn run_validation(&self, task: &TaskRequest) -> Result<(), EngineError> {
        let model_path = scratch::model_path(&self.scratch_dir, &scratch::mint_id());
        let metrics_path = scratch::json_path(&self.scratch_dir, &scratch::mint_id());

        info!(model_id = %task.model_id, session_id = %task.session_id, "Validating global model");
        let result = self
            .validation_inner(task, &model_path, &metrics_path)
            .await;

        scratch::remove(&model_path).await;
        scratch::remove(&metrics_path).await;
        result
    }

    async fn validation_inner(
        &self,
        task: &TaskRequest,
        model_path: &Path,
        metrics_path: &Path,
    ) -> Result<(), EngineError> {
        transfer::download_to_file(
            &self.models,
            self.identity.sender(),
            &task.model_id,
            model_path,
        )
        .await?;

        let session = self.session();
        self.handler
            .validate(&session, model_path, metrics_path)
            .await
            .map_err(EngineError::Callback)?;

        let metrics = read_json(metrics_path).await.map_err(EngineError::Callback)?;

        let validation = pb::ModelValidation {
            sender: Some(self.identity.sender()),
            receiver: None,
            model_id: task.model_id.clone(),
            data: metrics.to_string(),
            session_id: task.session_id.clone(),
            meta: serde_json::json!({ "validation_metadata": {} }).to_string(),
            timestamp: Some(now_timestamp()),
        };

        let mut combiner = self.combiner.clone();
        let response = combiner
            .send_model_validation(validation)
            .await
            .map_err(EngineError::Reporting)?;
        debug!(
            model_id = %task.model_id,
            response = %response.into_inner().response,
            "Model validation reported"
        );
        Ok(())
    }

    async fn run_prediction(&self, task: &TaskRequest) -> Result<(), EngineError> {
        let model_path = scratch::model_path(&self.scratch_dir, &scratch::mint_id());
        let prediction_path = scratch::json_path(&self.scratch_dir, &scratch::mint_id());

        info!(model_id = %task.model_id, session_id = %task.session_id, "Running model prediction");
        let result = self
            .prediction_inner(task, &model_path, &prediction_path)
            .await;

        scratch::remove(&model_path).await;
        scratch::remove(&prediction_path).await;
        result
    }

    async fn prediction_inner(
        &self,
        task: &TaskRequest,
        model_path: &Path,
        prediction_path: &Path,
    ) -> Result<(), EngineError> {
        transfer::download_to_file(
            &self.models,
            self.identity.sender(),
            &task.model_id,
            model_path,
        )
        .await?;

        let session = self.session();
        self.handler
            .predict(&session, model_path, prediction_path)
            .await
            .map_err(EngineError::Callback)?;

        let prediction = read_json(prediction_path)
            .await
            .map_err(EngineError::Callback)?;

        let message = pb::ModelPrediction {
            sender: Some(self.identity.sender()),
            receiver: None,
            model_id: task.model_id.clone(),
            data: prediction.to_string(),
            prediction_id: task.session_id.clone(),
            meta: serde_json::json!({ "prediction_metadata": {} }).to_string(),
            timestamp: Some(now_timestamp()),
        };

        let mut combiner = self.combiner.clone();
        let response = combiner
            .send_model_prediction(message)
            .await
            .map_err(EngineError::Reporting)?;
        debug!(
            model_id = %task.model_id,
            response = %response.into_inner().response,
            "Model prediction reported"
        );
        Ok(())
    }
}

fn lock_context(ctx: &Mutex<LoggingContext>) -> std::sync::MutexGuard<'_, LoggingContext> {
    match ctx.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn read_json(path: &Path) -> anyhow::Result<serde_json::Value> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let value = serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok(value)
}

/// Seconds-resolution wire timestamp for validation and prediction
/// reports. Updates use a formatted string instead; the asymmetry is part
/// of the wire contract.
fn now_timestamp() -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: chrono::Utc::now().timestamp(),
        nanos: 0,
    }
}
