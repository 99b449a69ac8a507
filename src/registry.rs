use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::artifact::{Artifact, ArtifactId, Metrics};
use crate::error::{PipelineError, Result};
use crate::store::validate_stage_name;

/// Whether a stage is a pure function of its config and inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Determinism {
    #[default]
    Deterministic,
    /// Real hardware submission, wall-clock dependent work and the like.
    NonDeterministic,
}

impl Determinism {
    pub fn is_deterministic(self) -> bool {
        matches!(self, Determinism::Deterministic)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first; 1 disables retries.
    pub max_attempts: u32,
    #[serde(rename = "initial_backoff_ms", with = "millis")]
    pub initial_backoff: Duration,
    pub multiplier: f64,
    #[serde(rename = "max_backoff_ms", with = "millis")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(200),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn attempts(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.min(i32::MAX as u32) as i32);
        let delay = self.initial_backoff.as_nanos() as f64 * factor;
        if !delay.is_finite() || delay >= self.max_backoff.as_nanos() as f64 {
            self.max_backoff
        } else {
            Duration::from_nanos(delay as u64)
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Bool,
    Object,
    Array,
    Any,
}

impl FieldKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
            FieldKind::Any => true,
        }
    }

    fn label(self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Integer => "integer",
            FieldKind::Bool => "bool",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
            FieldKind::Any => "any",
        }
    }
}

/// Required top-level config fields and their kinds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigSchema {
    pub required: BTreeMap<String, FieldKind>,
}

impl ConfigSchema {
    pub fn require(mut self, field: impl Into<String>, kind: FieldKind) -> Self {
        self.required.insert(field.into(), kind);
        self
    }

    pub fn check(&self, stage: &str, config: &Value) -> Result<()> {
        if self.required.is_empty() {
            return Ok(());
        }
        let Some(object) = config.as_object() else {
            return Err(PipelineError::config(format!(
                "stage '{stage}' expects a mapping as configuration"
            )));
        };
        let mut problems = Vec::new();
        for (field, kind) in &self.required {
            match object.get(field) {
                None => problems.push(format!("missing required field '{field}'")),
                Some(value) if !kind.matches(value) => {
                    problems.push(format!("field '{field}' must be {}", kind.label()))
                }
                Some(_) => {}
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::config(format!(
                "stage '{stage}': {}",
                problems.join("; ")
            )))
        }
    }
}

/// Declarative description of a stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSpec {
    pub name: String,
    /// Stage kinds of the expected inputs, in order.
    pub inputs: Vec<String>,
    pub config_schema: ConfigSchema,
    pub determinism: Determinism,
    pub timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl StageSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            config_schema: ConfigSchema::default(),
            determinism: Determinism::Deterministic,
            timeout: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn non_deterministic(mut self) -> Self {
        self.determinism = Determinism::NonDeterministic;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_schema(mut self, schema: ConfigSchema) -> Self {
        self.config_schema = schema;
        self
    }

    /// Check arity and order of resolved inputs against the declaration.
    pub fn check_inputs(&self, inputs: &[Artifact]) -> Result<()> {
        let stages: Vec<(&ArtifactId, &str)> = inputs
            .iter()
            .map(|artifact| (&artifact.id, artifact.stage.as_str()))
            .collect();
        self.check_input_stages(&stages)
    }

    /// Same check on `(id, stage)` pairs, for callers that have not loaded the
    /// artifacts.
    pub fn check_input_stages(&self, inputs: &[(&ArtifactId, &str)]) -> Result<()> {
        if inputs.len() != self.inputs.len() {
            return Err(PipelineError::config(format!(
                "stage '{}' expects {} input(s) [{}], got {}",
                self.name,
                self.inputs.len(),
                self.inputs.join(", "),
                inputs.len()
            )));
        }
        for (position, (expected, (id, stage))) in self.inputs.iter().zip(inputs).enumerate() {
            if *stage != expected.as_str() {
                return Err(PipelineError::config(format!(
                    "stage '{}' input {} must come from '{}', got {} from '{}'",
                    self.name,
                    position + 1,
                    expected,
                    id,
                    stage
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    pub payload: Value,
    pub metrics: Metrics,
}

impl StageOutput {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            metrics: Metrics::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Failure reported by an executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageError {
    pub message: String,
    pub retryable: bool,
}

impl StageError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for StageError {}

/// A pluggable stage implementation.
pub trait StageExecutor: Send + Sync {
    fn run(&self, config: &Value, inputs: &[Artifact]) -> Result<StageOutput, StageError>;
}

impl<F> StageExecutor for F
where
    F: Fn(&Value, &[Artifact]) -> Result<StageOutput, StageError> + Send + Sync,
{
    fn run(&self, config: &Value, inputs: &[Artifact]) -> Result<StageOutput, StageError> {
        self(config, inputs)
    }
}

#[derive(Clone)]
pub struct RegisteredStage {
    pub spec: StageSpec,
    pub executor: Arc<dyn StageExecutor>,
}

impl fmt::Debug for RegisteredStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredStage")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Clone)]
pub struct StageRegistry {
    stages: BTreeMap<String, RegisteredStage>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<E>(&mut self, spec: StageSpec, executor: E) -> Result<()>
    where
        E: StageExecutor + 'static,
    {
        self.register_arc(spec, Arc::new(executor))
    }

    pub fn register_arc(&mut self, spec: StageSpec, executor: Arc<dyn StageExecutor>) -> Result<()> {
        validate_stage_name(&spec.name)?;
        for input in &spec.inputs {
            validate_stage_name(input)?;
        }
        if spec.retry.max_attempts == 0 {
            return Err(PipelineError::config(format!(
                "stage '{}' must allow at least one attempt",
                spec.name
            )));
        }
        if self.stages.contains_key(&spec.name) {
            return Err(PipelineError::config(format!(
                "stage '{}' is registered twice",
                spec.name
            )));
        }
        self.stages
            .insert(spec.name.clone(), RegisteredStage { spec, executor });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&RegisteredStage> {
        self.stages.get(name).ok_or_else(|| {
            PipelineError::config(format!(
                "unknown stage '{}'. Available stages: {}",
                name,
                self.known_stages().join(", ")
            ))
        })
    }

    pub fn spec(&self, name: &str) -> Result<&StageSpec> {
        self.get(name).map(|stage| &stage.spec)
    }

    pub fn known_stages(&self) -> Vec<String> {
        self.stages.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredStage> {
        self.stages.values()
    }
}
