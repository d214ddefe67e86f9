//! The declarative pipeline: payload schema and the deterministic executor.
//!
//! A task's payload is an ordered sequence of tool invocations plus initial
//! parameters. The executor renders each step's input template against the
//! accumulated environment, invokes the tool through the transport seam, and
//! records the response under the step's id. Execution is strictly
//! sequential; the only timing-dependent inputs are the `${now}`/`${today}`
//! injections resolved at pipeline start.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::RunError;
use crate::tool::{ToolError, ToolTransport};

mod render;

pub use render::{Environment, RenderError};

/// A task's pipeline payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Pipeline {
    /// Initial parameters, available to every step as `${params.…}`.
    #[serde(default = "empty_object")]
    pub params: Value,

    #[serde(rename = "pipeline")]
    pub steps: Vec<Step>,
}

/// One tool invocation in a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    /// Stable identifier; the tool's response is bound at `steps.<id>`.
    pub id: String,

    /// Address of the tool in the external catalog.
    pub uses: String,

    /// Input template with embedded `${…}` expressions.
    #[serde(default = "empty_object", rename = "with")]
    pub input: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    /// Additional binding name for the response, alongside the step id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_as: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("payload is not a valid pipeline: {0}")]
    Shape(String),

    #[error("pipeline has no steps")]
    Empty,

    #[error("step {index} has an empty id")]
    EmptyId { index: usize },

    #[error("step {id:?} has an empty tool address")]
    EmptyTool { id: String },

    #[error("duplicate step binding {name:?}")]
    DuplicateBinding { name: String },

    #[error("step {id:?} has a zero timeout")]
    ZeroTimeout { id: String },
}

impl Pipeline {
    /// Parse and validate a task payload. This runs at task create, so a
    /// malformed pipeline is rejected before it is ever scheduled.
    pub fn from_payload(payload: &Value) -> Result<Self, ValidationError> {
        let pipeline: Pipeline = serde_json::from_value(payload.clone())
            .map_err(|e| ValidationError::Shape(e.to_string()))?;
        pipeline.validate()?;
        Ok(pipeline)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.steps.is_empty() {
            return Err(ValidationError::Empty);
        }

        let mut bindings = std::collections::HashSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            if step.id.is_empty() {
                return Err(ValidationError::EmptyId { index });
            }
            if step.uses.is_empty() {
                return Err(ValidationError::EmptyTool { id: step.id.clone() });
            }
            if step.timeout_seconds == Some(0) {
                return Err(ValidationError::ZeroTimeout { id: step.id.clone() });
            }

            for name in std::iter::once(&step.id).chain(step.save_as.iter()) {
                if !bindings.insert(name.clone()) {
                    return Err(ValidationError::DuplicateBinding { name: name.clone() });
                }
            }
        }

        Ok(())
    }
}

/// Drives a pipeline to completion against a tool transport.
pub struct Executor {
    transport: Arc<dyn ToolTransport>,
    default_step_timeout: Duration,
}

impl Executor {
    pub fn new(transport: Arc<dyn ToolTransport>, default_step_timeout: Duration) -> Self {
        Self { transport, default_step_timeout }
    }

    /// Run every step in order. On success the output is a JSON object with
    /// the final step's response under `output` and the full bindings under
    /// `steps`.
    ///
    /// `started` pins the `${now}`/`${today}` environment; `tz` is the
    /// task's timezone, which determines what day "today" is.
    pub async fn execute(
        &self,
        pipeline: &Pipeline,
        tz: Tz,
        started: DateTime<Utc>,
    ) -> Result<Value, RunError> {
        let mut env = Environment {
            params: pipeline.params.clone(),
            steps: Map::new(),
            now: started.to_rfc3339(),
            today: started.with_timezone(&tz).date_naive().to_string(),
        };

        let mut last = Value::Null;
        for (index, step) in pipeline.steps.iter().enumerate() {
            let input = render::render(&step.input, &env)
                .map_err(|e| RunError::terminal(e.to_string()).at_step(&step.id, index))?;

            let timeout = step
                .timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(self.default_step_timeout);

            tracing::debug!(step = %step.id, tool = %step.uses, "invoking tool");
            let clock = tokio::time::Instant::now();
            let result = match tokio::time::timeout(
                timeout,
                self.transport.invoke(&step.uses, input, timeout),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ToolError::Timeout(timeout)),
            };
            metrics::histogram!("orchestrator_step_duration_seconds")
                .record(clock.elapsed().as_secs_f64());

            let response =
                result.map_err(|e| RunError::from(e).at_step(&step.id, index))?;

            env.steps.insert(step.id.clone(), response.clone());
            if let Some(alias) = &step.save_as {
                env.steps.insert(alias.clone(), response.clone());
            }
            last = response;
        }

        Ok(json!({ "output": last, "steps": Value::Object(env.steps) }))
    }
}
