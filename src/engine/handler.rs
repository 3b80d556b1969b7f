//! User task callbacks
//!
//! The engine drives three callbacks, any subset of which may be
//! overridden. Each receives plain filesystem paths into the scratch
//! directory and is awaited to completion before the task flow continues,
//! so a callback that never returns stalls the task-stream consumer.
//!
//! The [`TaskSession`] handle lets callbacks emit metrics tagged with the
//! running task's logging context.

use std::path::Path;

use async_trait::async_trait;
use serde_json::json;

use crate::engine::TaskSession;

/// ML callbacks invoked by the task engine.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Train on the seed model at `model_in`, writing the updated model to
    /// `model_out`. Returns the training metadata attached to the update
    /// report. The default echoes the seed model back unchanged.
    async fn train(
        &self,
        _session: &TaskSession,
        model_in: &Path,
        model_out: &Path,
    ) -> anyhow::Result<serde_json::Value> {
        tokio::fs::copy(model_in, model_out).await?;
        Ok(json!({ "training_metadata": {} }))
    }

    /// Validate the model at `model_in`, writing a metrics JSON document to
    /// `metrics_out`. The default echoes the input; meaningful only for
    /// JSON-bodied models.
    async fn validate(
        &self,
        _session: &TaskSession,
        model_in: &Path,
        metrics_out: &Path,
    ) -> anyhow::Result<()> {
        tokio::fs::copy(model_in, metrics_out).await?;
        Ok(())
    }

    /// Run prediction with the model at `model_in`, writing a prediction
    /// JSON document to `prediction_out`.
    async fn predict(
        &self,
        _session: &TaskSession,
        _model_in: &Path,
        prediction_out: &Path,
    ) -> anyhow::Result<()> {
        let prediction = json!({ "prediction": 1, "confidence": 0.95 });
        tokio::fs::write(prediction_out, serde_json::to_vec_pretty(&prediction)?).await?;
        Ok(())
    }
}

/// Pass-through handler using every default callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTaskHandler;

#[async_trait]
impl TaskHandler for DefaultTaskHandler {}
