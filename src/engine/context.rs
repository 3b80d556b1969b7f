//! Per-task logging context
//!
//! Installed when a task directive is read, cleared when the task finishes
//! (success or failure). Metric emissions from user callbacks are tagged
//! with this context; outside a task the triple is empty and `step` is 0.

use serde_json::Value;
use tracing::warn;

use crate::pb::{StatusType, TaskRequest};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggingContext {
    model_id: String,
    round_id: String,
    session_id: String,
    step: u32,
}

impl LoggingContext {
    /// Context for a freshly read task directive. `round_id` is only
    /// carried by UPDATE payloads, inside the JSON `data` field.
    pub fn for_task(task: &TaskRequest) -> Self {
        let round_id = if task.r#type() == StatusType::ModelUpdate {
            parse_round_id(&task.data)
        } else {
            String::new()
        };

        Self {
            model_id: task.model_id.clone(),
            round_id,
            session_id: task.session_id.clone(),
            step: 0,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn round_id(&self) -> &str {
        &self.round_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn step(&self) -> u32 {
        self.step
    }

    pub fn set_step(&mut self, step: u32) {
        self.step = step;
    }

    /// Advance the step after a committed metric emission.
    pub fn bump_step(&mut self) {
        self.step += 1;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

fn parse_round_id(data: &str) -> String {
    let parsed: Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Task data is not valid JSON, round_id unavailable");
            return String::new();
        }
    };

    match parsed.get("round_id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => {
            warn!("Task data carries no round_id");
            String::new()
        }
    }
}
