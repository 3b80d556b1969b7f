//! Task flow integration tests
//!
//! Drives the task engine against an in-process combiner built from the
//! generated server stubs: happy-path update, transfer failure, unknown
//! directives, validation/prediction flows, metric ordering and the
//! upload framing invariants.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

use fedn_client::config::{AuthScheme, CombinerConfig};
use fedn_client::engine::{ClientIdentity, TaskEngine};
use fedn_client::pb::combiner_server::{Combiner, CombinerServer};
use fedn_client::pb::connector_server::{Connector, ConnectorServer};
use fedn_client::pb::model_service_server::{ModelService, ModelServiceServer};
use fedn_client::pb::{
    ClientAvailableMessage, Heartbeat, ModelMetric, ModelPrediction, ModelRequest,
    ModelResponse, ModelStatus, ModelUpdate, ModelValidation, Response as FednResponse,
    StatusType, TaskRequest,
};
use fedn_client::{channel, TaskHandler, TaskSession};

// ─── Mock combiner ──────────────────────────────────────────────────────────

#[derive(Default)]
struct MockState {
    /// Directives streamed to the client, in order.
    tasks: Vec<TaskRequest>,
    /// Frame scripts served per Download call, front first.
    downloads: Mutex<VecDeque<Vec<ModelResponse>>>,
    download_calls: AtomicUsize,
    uploads: Mutex<Vec<Vec<ModelRequest>>>,
    updates: Mutex<Vec<ModelUpdate>>,
    validations: Mutex<Vec<ModelValidation>>,
    predictions: Mutex<Vec<ModelPrediction>>,
    metrics: Mutex<Vec<ModelMetric>>,
    heartbeats: AtomicUsize,
    /// RPC arrival order, for cross-call ordering assertions.
    events: Mutex<Vec<String>>,
    /// Keep the task stream open for this long after the scripted tasks.
    hold_open: Option<Duration>,
}

impl MockState {
    fn event(&self, name: impl Into<String>) {
        self.events.lock().unwrap().push(name.into());
    }
}

#[derive(Clone, Default)]
struct MockCombiner {
    state: Arc<MockState>,
}

fn ack() -> Response<FednResponse> {
    Response::new(FednResponse {
        sender: None,
        response: "ack".to_string(),
    })
}

#[tonic::async_trait]
impl Connector for MockCombiner {
    async fn send_heartbeat(
        &self,
        _request: Request<Heartbeat>,
    ) -> Result<Response<FednResponse>, Status> {
        self.state.heartbeats.fetch_add(1, Ordering::SeqCst);
        Ok(ack())
    }

    async fn send_model_metric(
        &self,
        request: Request<ModelMetric>,
    ) -> Result<Response<FednResponse>, Status> {
        let metric = request.into_inner();
        self.state
            .event(format!("metric:{}", metric.step.unwrap_or_default()));
        self.state.metrics.lock().unwrap().push(metric);
        Ok(ack())
    }
}

#[tonic::async_trait]
impl Combiner for MockCombiner {
    type TaskStreamStream = ReceiverStream<Result<TaskRequest, Status>>;

    async fn task_stream(
        &self,
        _request: Request<ClientAvailableMessage>,
    ) -> Result<Response<Self::TaskStreamStream>, Status> {
        let tasks = self.state.tasks.clone();
        let hold_open = self.state.hold_open;
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for task in tasks {
                if tx.send(Ok(task)).await.is_err() {
                    return;
                }
            }
            if let Some(hold) = hold_open {
                tokio::time::sleep(hold).await;
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn send_model_update(
        &self,
        request: Request<ModelUpdate>,
    ) -> Result<Response<FednResponse>, Status> {
        self.state.event("update-report");
        self.state.updates.lock().unwrap().push(request.into_inner());
        Ok(ack())
    }

    async fn send_model_validation(
        &self,
        request: Request<ModelValidation>,
    ) -> Result<Response<FednResponse>, Status> {
        self.state
            .validations
            .lock()
            .unwrap()
            .push(request.into_inner());
        Ok(ack())
    }

    async fn send_model_prediction(
        &self,
        request: Request<ModelPrediction>,
    ) -> Result<Response<FednResponse>, Status> {
        self.state
            .predictions
            .lock()
            .unwrap()
            .push(request.into_inner());
        Ok(ack())
    }
}

#[tonic::async_trait]
impl ModelService for MockCombiner {
    async fn upload(
        &self,
        request: Request<Streaming<ModelRequest>>,
    ) -> Result<Response<ModelResponse>, Status> {
        self.state.event("upload");
        let mut stream = request.into_inner();
        let mut frames = Vec::new();
        while let Some(frame) = stream.message().await? {
            frames.push(frame);
        }
        let id = frames.first().map(|f| f.id.clone()).unwrap_or_default();
        self.state.uploads.lock().unwrap().push(frames);
        Ok(Response::new(ModelResponse {
            data: Vec::new(),
            id,
            status: ModelStatus::Ok as i32,
            message: "upload accepted".to_string(),
        }))
    }

    type DownloadStream = ReceiverStream<Result<ModelResponse, Status>>;

    async fn download(
        &self,
        _request: Request<ModelRequest>,
    ) -> Result<Response<Self::DownloadStream>, Status> {
        self.state.download_calls.fetch_add(1, Ordering::SeqCst);
        let frames = self
            .state
            .downloads
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for frame in frames {
                if tx.send(Ok(frame)).await.is_err() {
                    return;
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

async fn spawn_combiner(mock: MockCombiner) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        Server::builder()
            .add_service(ConnectorServer::new(mock.clone()))
            .add_service(CombinerServer::new(mock.clone()))
            .add_service(ModelServiceServer::new(mock))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });
    addr
}

fn engine_for(
    addr: SocketAddr,
    scratch: &Path,
    handler: Arc<dyn TaskHandler>,
) -> TaskEngine {
    let config = CombinerConfig {
        host: addr.to_string(),
        proxy_host: None,
        token: String::new(),
        auth_scheme: AuthScheme::Bearer,
        insecure: true,
    };
    let built = channel::build(&config).unwrap();
    let mut engine = TaskEngine::new(&built, ClientIdentity::new("alpha", "c1"), handler);
    engine.set_scratch_dir(scratch);
    engine.set_heartbeat_interval(Duration::from_secs(3600));
    engine
}

// ─── Frame and task helpers ─────────────────────────────────────────────────

fn in_progress(data: &[u8]) -> ModelResponse {
    ModelResponse {
        data: data.to_vec(),
        id: "M".to_string(),
        status: ModelStatus::InProgress as i32,
        message: String::new(),
    }
}

fn ok_frame() -> ModelResponse {
    ModelResponse {
        data: Vec::new(),
        id: "M".to_string(),
        status: ModelStatus::Ok as i32,
        message: String::new(),
    }
}

fn failed_frame() -> ModelResponse {
    ModelResponse {
        data: Vec::new(),
        id: "M".to_string(),
        status: ModelStatus::Failed as i32,
        message: String::new(),
    }
}

fn task(kind: StatusType, model_id: &str, data: &str) -> TaskRequest {
    TaskRequest {
        sender: None,
        receiver: None,
        task_id: format!("task-{model_id}"),
        model_id: model_id.to_string(),
        data: data.to_string(),
        session_id: "S1".to_string(),
        r#type: kind as i32,
    }
}

fn scratch_is_empty(dir: &Path) -> bool {
    std::fs::read_dir(dir).unwrap().next().is_none()
}

// ─── Recording handler ──────────────────────────────────────────────────────

/// Train callback that records the downloaded bytes and optionally emits
/// two committed metrics before echoing the model back.
#[derive(Default)]
struct RecordingHandler {
    downloaded: Mutex<Vec<Vec<u8>>>,
    emit_metrics: bool,
}

#[async_trait::async_trait]
impl TaskHandler for RecordingHandler {
    async fn train(
        &self,
        session: &TaskSession,
        model_in: &Path,
        model_out: &Path,
    ) -> anyhow::Result<serde_json::Value> {
        let bytes = tokio::fs::read(model_in).await?;
        self.downloaded.lock().unwrap().push(bytes);

        if self.emit_metrics {
            let mut metrics = BTreeMap::new();
            metrics.insert("loss".to_string(), 0.5_f32);
            session.log_metrics(&metrics, None, true).await?;
            session.log_metrics(&metrics, None, true).await?;
        }

        tokio::fs::copy(model_in, model_out).await?;
        Ok(serde_json::json!({ "training_metadata": { "epochs": 1 } }))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_update_flow() {
    let mut inner = MockState::default();
    inner.tasks = vec![task(
        StatusType::ModelUpdate,
        "M1",
        r#"{"round_id":"R1"}"#,
    )];
    inner.downloads = Mutex::new(VecDeque::from(vec![vec![
        in_progress(b"ab"),
        in_progress(b"cd"),
        ok_frame(),
    ]]));
    let mock = MockCombiner {
        state: Arc::new(inner),
    };

    let addr = spawn_combiner(mock.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let handler = Arc::new(RecordingHandler::default());
    let engine = engine_for(addr, dir.path(), handler.clone());

    engine.run().await.unwrap();

    // The train callback saw the reassembled download.
    assert_eq!(*handler.downloaded.lock().unwrap(), vec![b"abcd".to_vec()]);

    // Upload framing: data frame with sender, one trailing OK frame with
    // empty data and empty sender, last on the wire.
    let uploads = mock.state.uploads.lock().unwrap();
    assert_eq!(uploads.len(), 1);
    let frames = &uploads[0];
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].status(), ModelStatus::InProgress);
    assert_eq!(frames[0].data, b"abcd");
    assert!(frames[0].sender.is_some());
    let last = frames.last().unwrap();
    assert_eq!(last.status(), ModelStatus::Ok);
    assert!(last.data.is_empty());
    assert!(last.sender.is_none());
    assert_eq!(
        frames
            .iter()
            .filter(|f| f.status() == ModelStatus::Ok)
            .count(),
        1
    );

    // The update report references the uploaded artifact.
    let updates = mock.state.updates.lock().unwrap();
    assert_eq!(updates.len(), 1);
    let update = &updates[0];
    assert_eq!(update.model_id, "M1");
    assert_eq!(update.model_update_id.len(), 36);
    assert_eq!(update.model_update_id, frames[0].id);
    assert_eq!(update.config, r#"{"round_id":"R1"}"#);
    assert!(update.meta.contains("training_metadata"));
    assert!(update.sender.is_some());

    // All scratch files are gone (success path).
    assert!(scratch_is_empty(dir.path()));
}

#[tokio::test]
async fn metric_emissions_are_ordered_before_upload() {
    let mut inner = MockState::default();
    inner.tasks = vec![task(
        StatusType::ModelUpdate,
        "M1",
        r#"{"round_id":"R1"}"#,
    )];
    inner.downloads = Mutex::new(VecDeque::from(vec![vec![
        in_progress(b"ab"),
        ok_frame(),
    ]]));
    let mock = MockCombiner {
        state: Arc::new(inner),
    };

    let addr = spawn_combiner(mock.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let handler = Arc::new(RecordingHandler {
        emit_metrics: true,
        ..Default::default()
    });
    let engine = engine_for(addr, dir.path(), handler);

    engine.run().await.unwrap();

    // Two committed emissions, tagged with the task context, steps 0 and 1.
    let metrics = mock.state.metrics.lock().unwrap();
    assert_eq!(metrics.len(), 2);
    for (i, metric) in metrics.iter().enumerate() {
        assert_eq!(metric.model_id, "M1");
        assert_eq!(metric.round_id, "R1");
        assert_eq!(metric.session_id, "S1");
        assert_eq!(metric.step, Some(i as u32));
        assert_eq!(metric.metrics.len(), 1);
        assert_eq!(metric.metrics[0].key, "loss");
    }

    // Both metric RPCs returned before the upload stream was opened.
    let events = mock.state.events.lock().unwrap();
    assert_eq!(
        *events,
        vec!["metric:0", "metric:1", "upload", "update-report"]
    );
}

#[tokio::test]
async fn failed_download_abandons_task_and_consumes_next() {
    let mut inner = MockState::default();
    inner.tasks = vec![
        task(StatusType::ModelUpdate, "M1", r#"{"round_id":"R1"}"#),
        task(StatusType::ModelUpdate, "M2", r#"{"round_id":"R2"}"#),
    ];
    inner.downloads = Mutex::new(VecDeque::from(vec![
        vec![in_progress(b"ab"), failed_frame()],
        vec![in_progress(b"xy"), ok_frame()],
    ]));
    let mock = MockCombiner {
        state: Arc::new(inner),
    };

    let addr = spawn_combiner(mock.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let handler = Arc::new(RecordingHandler::default());
    let engine = engine_for(addr, dir.path(), handler.clone());

    engine.run().await.unwrap();

    // Train never ran for the failed task; no upload was issued for it.
    assert_eq!(*handler.downloaded.lock().unwrap(), vec![b"xy".to_vec()]);
    assert_eq!(mock.state.uploads.lock().unwrap().len(), 1);

    // Only the second task reported an update.
    let updates = mock.state.updates.lock().unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].model_id, "M2");

    // Scratch is clean even on the failure path.
    assert!(scratch_is_empty(dir.path()));
}

#[tokio::test]
async fn unknown_task_type_is_skipped_without_transfer() {
    let mut unknown = task(StatusType::ModelUpdate, "M0", "");
    unknown.r#type = 99;

    let mut inner = MockState::default();
    inner.tasks = vec![
        unknown,
        task(StatusType::ModelUpdate, "M2", r#"{"round_id":"R2"}"#),
    ];
    inner.downloads = Mutex::new(VecDeque::from(vec![vec![
        in_progress(b"xy"),
        ok_frame(),
    ]]));
    let mock = MockCombiner {
        state: Arc::new(inner),
    };

    let addr = spawn_combiner(mock.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let handler = Arc::new(RecordingHandler::default());
    let engine = engine_for(addr, dir.path(), handler.clone());

    engine.run().await.unwrap();

    // The unknown directive consumed no model bytes.
    assert_eq!(mock.state.download_calls.load(Ordering::SeqCst), 1);
    assert_eq!(*handler.downloaded.lock().unwrap(), vec![b"xy".to_vec()]);
    assert_eq!(mock.state.updates.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn empty_model_download_uploads_single_ok_frame() {
    let mut inner = MockState::default();
    inner.tasks = vec![task(
        StatusType::ModelUpdate,
        "M1",
        r#"{"round_id":"R1"}"#,
    )];
    inner.downloads = Mutex::new(VecDeque::from(vec![vec![ok_frame()]]));
    let mock = MockCombiner {
        state: Arc::new(inner),
    };

    let addr = spawn_combiner(mock.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let handler = Arc::new(RecordingHandler::default());
    let engine = engine_for(addr, dir.path(), handler.clone());

    engine.run().await.unwrap();

    // Zero IN_PROGRESS frames then OK is an empty model.
    assert_eq!(*handler.downloaded.lock().unwrap(), vec![Vec::<u8>::new()]);

    // The upload is the bare terminal frame.
    let uploads = mock.state.uploads.lock().unwrap();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].len(), 1);
    assert_eq!(uploads[0][0].status(), ModelStatus::Ok);
    assert!(uploads[0][0].data.is_empty());
    assert_eq!(mock.state.updates.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn chunk_size_does_not_change_uploaded_bytes() {
    async fn uploaded_bytes(chunk_size: usize) -> Vec<u8> {
        let mut inner = MockState::default();
        inner.tasks = vec![task(
            StatusType::ModelUpdate,
            "M1",
            r#"{"round_id":"R1"}"#,
        )];
        inner.downloads = Mutex::new(VecDeque::from(vec![vec![
            in_progress(b"abcdef"),
            ok_frame(),
        ]]));
        let mock = MockCombiner {
            state: Arc::new(inner),
        };

        let addr = spawn_combiner(mock.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let handler = Arc::new(RecordingHandler::default());
        let mut engine = engine_for(addr, dir.path(), handler);
        engine.set_chunk_size(chunk_size);

        engine.run().await.unwrap();

        let uploads = mock.state.uploads.lock().unwrap();
        uploads[0]
            .iter()
            .flat_map(|f| f.data.iter().copied())
            .collect()
    }

    let coarse = uploaded_bytes(1024).await;
    let fine = uploaded_bytes(2).await;
    assert_eq!(coarse, b"abcdef");
    assert_eq!(coarse, fine);
}

#[tokio::test]
async fn validation_flow_reports_metrics_document() {
    struct ValidatingHandler;

    #[async_trait::async_trait]
    impl TaskHandler for ValidatingHandler {
        async fn validate(
            &self,
            _session: &TaskSession,
            _model_in: &Path,
            metrics_out: &Path,
        ) -> anyhow::Result<()> {
            tokio::fs::write(metrics_out, br#"{"accuracy": 0.93}"#).await?;
            Ok(())
        }
    }

    let mut inner = MockState::default();
    inner.tasks = vec![task(StatusType::ModelValidation, "M1", "")];
    inner.downloads = Mutex::new(VecDeque::from(vec![vec![
        in_progress(b"model-bytes"),
        ok_frame(),
    ]]));
    let mock = MockCombiner {
        state: Arc::new(inner),
    };

    let addr = spawn_combiner(mock.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_for(addr, dir.path(), Arc::new(ValidatingHandler));

    engine.run().await.unwrap();

    let validations = mock.state.validations.lock().unwrap();
    assert_eq!(validations.len(), 1);
    let validation = &validations[0];
    assert_eq!(validation.model_id, "M1");
    assert_eq!(validation.session_id, "S1");
    let data: serde_json::Value = serde_json::from_str(&validation.data).unwrap();
    assert_eq!(data["accuracy"], 0.93);
    let ts = validation.timestamp.as_ref().unwrap();
    assert!(ts.seconds > 0);
    assert_eq!(ts.nanos, 0);

    // No upload happens on the validation path.
    assert!(mock.state.uploads.lock().unwrap().is_empty());
    assert!(scratch_is_empty(dir.path()));
}

#[tokio::test]
async fn prediction_flow_uses_session_as_prediction_id() {
    let mut inner = MockState::default();
    inner.tasks = vec![task(StatusType::ModelPrediction, "M1", "")];
    inner.downloads = Mutex::new(VecDeque::from(vec![vec![
        in_progress(b"model-bytes"),
        ok_frame(),
    ]]));
    let mock = MockCombiner {
        state: Arc::new(inner),
    };

    let addr = spawn_combiner(mock.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_for(
        addr,
        dir.path(),
        Arc::new(fedn_client::DefaultTaskHandler),
    );

    engine.run().await.unwrap();

    let predictions = mock.state.predictions.lock().unwrap();
    assert_eq!(predictions.len(), 1);
    let prediction = &predictions[0];
    assert_eq!(prediction.model_id, "M1");
    assert_eq!(prediction.prediction_id, "S1");
    let data: serde_json::Value = serde_json::from_str(&prediction.data).unwrap();
    assert_eq!(data["prediction"], 1);
    assert!(scratch_is_empty(dir.path()));
}

#[tokio::test]
async fn callback_failure_cleans_scratch_and_continues() {
    struct FailingHandler;

    #[async_trait::async_trait]
    impl TaskHandler for FailingHandler {
        async fn train(
            &self,
            _session: &TaskSession,
            _model_in: &Path,
            _model_out: &Path,
        ) -> anyhow::Result<serde_json::Value> {
            anyhow::bail!("model diverged")
        }

        async fn validate(
            &self,
            _session: &TaskSession,
            model_in: &Path,
            metrics_out: &Path,
        ) -> anyhow::Result<()> {
            tokio::fs::copy(model_in, metrics_out).await?;
            Ok(())
        }
    }

    let mut inner = MockState::default();
    inner.tasks = vec![
        task(StatusType::ModelUpdate, "M1", r#"{"round_id":"R1"}"#),
        task(StatusType::ModelValidation, "M2", ""),
    ];
    inner.downloads = Mutex::new(VecDeque::from(vec![
        vec![in_progress(b"ab"), ok_frame()],
        vec![in_progress(br#"{"loss": 1.5}"#), ok_frame()],
    ]));
    let mock = MockCombiner {
        state: Arc::new(inner),
    };

    let addr = spawn_combiner(mock.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_for(addr, dir.path(), Arc::new(FailingHandler));

    engine.run().await.unwrap();

    // The failed update never reached the combiner; the validation did.
    assert!(mock.state.uploads.lock().unwrap().is_empty());
    assert!(mock.state.updates.lock().unwrap().is_empty());
    assert_eq!(mock.state.validations.lock().unwrap().len(), 1);
    assert!(scratch_is_empty(dir.path()));
}

#[tokio::test]
async fn heartbeats_tick_independently_of_the_task_stream() {
    let mut inner = MockState::default();
    inner.hold_open = Some(Duration::from_millis(400));
    let mock = MockCombiner {
        state: Arc::new(inner),
    };

    let addr = spawn_combiner(mock.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let handler = Arc::new(RecordingHandler::default());
    let mut engine = engine_for(addr, dir.path(), handler);
    engine.set_heartbeat_interval(Duration::from_millis(50));

    engine.run().await.unwrap();

    assert!(mock.state.heartbeats.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn one_shot_heartbeat_returns_controller_response() {
    let mock = MockCombiner::default();
    let addr = spawn_combiner(mock.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let handler = Arc::new(RecordingHandler::default());
    let engine = engine_for(addr, dir.path(), handler);

    let response = engine.heart_beat().await.unwrap();
    assert_eq!(response, "ack");
    assert_eq!(mock.state.heartbeats.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn metrics_outside_a_task_carry_empty_context() {
    let mock = MockCombiner::default();
    let addr = spawn_combiner(mock.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let handler = Arc::new(RecordingHandler::default());
    let engine = engine_for(addr, dir.path(), handler);

    let mut metrics = BTreeMap::new();
    metrics.insert("ram_mb".to_string(), 512.0_f32);
    engine.log_metrics(&metrics, None, true).await.unwrap();
    engine.log_metrics(&metrics, None, true).await.unwrap();

    let recorded = mock.state.metrics.lock().unwrap();
    assert_eq!(recorded.len(), 2);
    assert_eq!(recorded[0].model_id, "");
    assert_eq!(recorded[0].round_id, "");
    assert_eq!(recorded[0].session_id, "");
    assert_eq!(recorded[0].step, Some(0));
    assert_eq!(recorded[1].step, Some(1));
}
