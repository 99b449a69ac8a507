//! Built-in stage executors.
//!
//! Domain work (dataset conversion, circuit construction, backend submission)
//! lives in external programs reached through [`CommandExecutor`]; the other
//! executors cover the pure data stages a pipeline needs around them.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::artifact::{Artifact, MetricValue, Metrics};
use crate::registry::{StageError, StageExecutor, StageOutput};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const STDERR_TAIL: usize = 2048;

/// Which executor a declared stage uses, as written in the pipeline file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "executor", rename_all = "snake_case")]
pub enum ExecutorSpec {
    /// Payload is the config itself.
    Materialize,
    /// Payload bundles the config with every input payload.
    Merge,
    Command {
        command: Vec<String>,
        #[serde(default)]
        retryable_exit_codes: Vec<i32>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        working_dir: Option<PathBuf>,
    },
}

/// Instantiate the executor for `spec`. Relative command paths and working
/// directories resolve against `base_dir`.
pub fn build_executor(
    spec: &ExecutorSpec,
    base_dir: &Path,
    timeout: Option<Duration>,
) -> Result<Arc<dyn StageExecutor>, String> {
    Ok(match spec {
        ExecutorSpec::Materialize => Arc::new(MaterializeStage),
        ExecutorSpec::Merge => Arc::new(MergeStage),
        ExecutorSpec::Command {
            command,
            retryable_exit_codes,
            env,
            working_dir,
        } => {
            let Some((program, args)) = command.split_first() else {
                return Err("command executor needs a non-empty 'command'".to_string());
            };
            Arc::new(CommandExecutor {
                program: program.clone(),
                args: args.to_vec(),
                retryable_exit_codes: retryable_exit_codes.clone(),
                env: env.clone(),
                working_dir: Some(
                    working_dir
                        .as_ref()
                        .map(|dir| base_dir.join(dir))
                        .unwrap_or_else(|| base_dir.to_path_buf()),
                ),
                timeout,
            })
        }
    })
}

pub struct MaterializeStage;

impl StageExecutor for MaterializeStage {
    fn run(&self, config: &Value, _inputs: &[Artifact]) -> Result<StageOutput, StageError> {
        Ok(StageOutput::new(config.clone()))
    }
}

pub struct MergeStage;

impl StageExecutor for MergeStage {
    fn run(&self, config: &Value, inputs: &[Artifact]) -> Result<StageOutput, StageError> {
        let mut metrics = Metrics::new();
        metrics.insert(
            "input_count".to_string(),
            MetricValue::from(inputs.len() as u64),
        );
        Ok(StageOutput::new(json!({
            "config": config,
            "inputs": describe_inputs(inputs),
        }))
        .with_metrics(metrics))
    }
}

fn describe_inputs(inputs: &[Artifact]) -> Vec<Value> {
    inputs
        .iter()
        .map(|artifact| {
            json!({
                "id": artifact.id,
                "stage": artifact.stage,
                "payload": artifact.payload,
            })
        })
        .collect()
}

/// Runs an external program. The child reads
/// `{"config": ..., "inputs": [{"id", "stage", "payload"}]}` on stdin and
/// prints `{"payload": ..., "metrics": {...}}` on stdout.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    pub program: String,
    pub args: Vec<String>,
    pub retryable_exit_codes: Vec<i32>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Kill the child after this long.
    pub timeout: Option<Duration>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            retryable_exit_codes: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn retry_on(mut self, code: i32) -> Self {
        self.retryable_exit_codes.push(code);
        self
    }

    fn spawn(&self) -> Result<Child, StageError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command.spawn().map_err(|err| {
            StageError::fatal(format!("failed to spawn '{}': {err}", self.program))
        })
    }

    fn wait(&self, child: &mut Child) -> Result<ExitStatus, StageError> {
        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(err) => {
                    return Err(StageError::fatal(format!(
                        "failed to wait for '{}': {err}",
                        self.program
                    )));
                }
            }
            if let Some(budget) = self.timeout
                && started.elapsed() >= budget
            {
                let _ = child.kill();
                let _ = child.wait();
                return Err(StageError::fatal(format!(
                    "'{}' killed after exceeding {budget:?}",
                    self.program
                )));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl StageExecutor for CommandExecutor {
    fn run(&self, config: &Value, inputs: &[Artifact]) -> Result<StageOutput, StageError> {
        let request = serde_json::to_vec(&json!({
            "config": config,
            "inputs": describe_inputs(inputs),
        }))
        .map_err(|err| StageError::fatal(format!("failed to encode stage request: {err}")))?;

        let mut child = self.spawn()?;
        debug!(program = %self.program, pid = child.id(), "Spawned stage command");
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        // Fed from its own thread so the budget also covers a child that never reads.
        let stdin = feed(child.stdin.take(), request);

        let status = self.wait(&mut child)?;
        if let Ok(Err(err)) = stdin.join() {
            // A child that exits without reading its input is judged by its exit code.
            warn!(program = %self.program, error = %err, "Stage command closed stdin early");
        }
        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        if !status.success() {
            let code = status.code();
            let retryable = code.is_some_and(|c| self.retryable_exit_codes.contains(&c));
            let message = format!(
                "'{}' exited with {}: {}",
                self.program,
                code.map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                tail(&stderr)
            );
            return Err(StageError { message, retryable });
        }

        parse_output(&stdout)
    }
}

fn feed<W: Write + Send + 'static>(
    stream: Option<W>,
    bytes: Vec<u8>,
) -> thread::JoinHandle<std::io::Result<()>> {
    thread::spawn(move || match stream {
        // Dropping the handle closes the pipe so the child sees end of input.
        Some(mut stream) => stream.write_all(&bytes),
        None => Ok(()),
    })
}

fn drain<R: Read + Send + 'static>(stream: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut stream) = stream {
            let _ = stream.read_to_end(&mut buffer);
        }
        buffer
    })
}

fn tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    let start = trimmed.len().saturating_sub(STDERR_TAIL);
    let start = (start..=trimmed.len())
        .find(|idx| trimmed.is_char_boundary(*idx))
        .unwrap_or(trimmed.len());
    trimmed[start..].to_string()
}

fn parse_output(stdout: &[u8]) -> Result<StageOutput, StageError> {
    let value: Value = serde_json::from_slice(stdout)
        .map_err(|err| StageError::fatal(format!("stage output is not JSON: {err}")))?;
    let Value::Object(mut object) = value else {
        return Err(StageError::fatal("stage output must be a JSON object"));
    };
    let payload = object
        .remove("payload")
        .ok_or_else(|| StageError::fatal("stage output is missing 'payload'"))?;
    let metrics = match object.remove("metrics") {
        None | Some(Value::Null) => Metrics::new(),
        Some(Value::Object(raw)) => parse_metrics(raw)?,
        Some(_) => return Err(StageError::fatal("stage 'metrics' must be an object")),
    };
    Ok(StageOutput::new(payload).with_metrics(metrics))
}

fn parse_metrics(raw: Map<String, Value>) -> Result<Metrics, StageError> {
    raw.into_iter()
        .map(|(key, value)| {
            let metric = match value {
                Value::Number(n) => n.as_f64().map(MetricValue::Number),
                Value::String(s) => Some(MetricValue::Text(s)),
                _ => None,
            }
            .ok_or_else(|| {
                StageError::fatal(format!("metric '{key}' must be a number or a string"))
            })?;
            Ok((key, metric))
        })
        .collect()
}
