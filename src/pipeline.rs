//! Pipeline definition files.
//!
//! A definition declares the stages a project uses (executor, input kinds,
//! determinism, config schema), execution settings, and a named graph of
//! invocations. Node configs are inline mappings or paths to YAML/JSON files;
//! a file is recorded as the artifact's `config_ref` together with the digest
//! of the bytes that were read.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_yaml::Value as YamlValue;
use tracing::debug;

use crate::artifact::ArtifactId;
use crate::error::{PipelineError, Result};
use crate::hashing::sha256_bytes;
use crate::manifest::{CodeRef, ConfigRef};
use crate::orchestrator::{InputRef, StageRequest};
use crate::registry::{ConfigSchema, Determinism, RetryPolicy, StageRegistry, StageSpec};
use crate::stages::{ExecutorSpec, build_executor};
use crate::store::{DEFAULT_STAGING_GRACE, StoreOptions};

pub const DEFINITION_VERSION: u32 = 1;
/// Prefix marking a node input as a literal artifact id.
pub const ARTIFACT_INPUT_PREFIX: char = '@';

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageOverride {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionSettings {
    /// Default per-invocation budget.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub staging_grace_secs: Option<u64>,
    /// Per-stage overrides, winning over the stage declaration.
    #[serde(default)]
    pub stages: BTreeMap<String, StageOverride>,
}

impl ExecutionSettings {
    pub fn staging_grace(&self) -> Duration {
        self.staging_grace_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_STAGING_GRACE)
    }

    pub fn store_options(&self, code_ref: CodeRef) -> StoreOptions {
        StoreOptions {
            code_ref,
            staging_grace: self.staging_grace(),
            ..StoreOptions::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDeclaration {
    pub name: String,
    #[serde(flatten)]
    pub executor: ExecutorSpec,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub determinism: Determinism,
    #[serde(default)]
    pub schema: ConfigSchema,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

/// Where a node's configuration comes from. Inline configs stay in YAML form
/// until resolved so non-finite numbers can still be told apart from `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigSource {
    File(PathBuf),
    Inline(YamlValue),
}

impl Default for ConfigSource {
    fn default() -> Self {
        ConfigSource::Inline(YamlValue::Mapping(Default::default()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeSpec {
    pub name: String,
    pub stage: String,
    #[serde(default)]
    pub config: ConfigSource,
    #[serde(default)]
    pub seeds: Vec<u64>,
    /// Node names, or `@<artifact_id>` for an already stored artifact.
    #[serde(default)]
    pub inputs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDefinition {
    pub version: u32,
    #[serde(default)]
    pub execution: ExecutionSettings,
    #[serde(default)]
    pub stages: Vec<StageDeclaration>,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    /// Directory relative config paths resolve against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl PipelineDefinition {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|err| PipelineError::io(path, err))?;
        let mut definition = Self::from_yaml(&content).map_err(|err| match err {
            PipelineError::Config(message) => {
                PipelineError::config(format!("{}: {message}", path.display()))
            }
            other => other,
        })?;
        definition.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(definition)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let definition: PipelineDefinition = serde_yaml::from_str(content)
            .map_err(|err| PipelineError::config(format!("invalid pipeline definition: {err}")))?;
        definition.check()?;
        Ok(definition)
    }

    fn check(&self) -> Result<()> {
        if self.version != DEFINITION_VERSION {
            return Err(PipelineError::config(format!(
                "unsupported pipeline definition version {} (expected {DEFINITION_VERSION})",
                self.version
            )));
        }

        let mut declared = HashSet::new();
        for stage in &self.stages {
            if !declared.insert(stage.name.as_str()) {
                return Err(PipelineError::config(format!(
                    "stage '{}' is declared twice",
                    stage.name
                )));
            }
        }
        for name in self.execution.stages.keys() {
            if !declared.contains(name.as_str()) {
                return Err(PipelineError::config(format!(
                    "execution override for undeclared stage '{name}'"
                )));
            }
        }

        let mut names = HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name.as_str()) {
                return Err(PipelineError::config(format!(
                    "node '{}' is defined twice",
                    node.name
                )));
            }
        }
        for node in &self.nodes {
            for input in &node.inputs {
                match input.strip_prefix(ARTIFACT_INPUT_PREFIX) {
                    Some(id) => {
                        id.parse::<ArtifactId>().map_err(|err| {
                            PipelineError::config(format!("node '{}': {err}", node.name))
                        })?;
                    }
                    None if !names.contains(input.as_str()) => {
                        return Err(PipelineError::config(format!(
                            "node '{}' consumes unknown node '{input}'",
                            node.name
                        )));
                    }
                    None => {}
                }
            }
        }
        self.check_acyclic()
    }

    fn check_acyclic(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn walk<'a>(
            name: &'a str,
            nodes: &HashMap<&'a str, &'a NodeSpec>,
            marks: &mut HashMap<&'a str, Mark>,
            path: &mut Vec<&'a str>,
        ) -> Result<()> {
            match marks.get(name) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|n| *n == name).unwrap_or(0);
                    let mut cycle: Vec<&str> = path[start..].to_vec();
                    cycle.push(name);
                    return Err(PipelineError::config(format!(
                        "pipeline graph has a cycle: {}",
                        cycle.join(" -> ")
                    )));
                }
                None => {}
            }
            marks.insert(name, Mark::Visiting);
            path.push(name);
            if let Some(node) = nodes.get(name).copied() {
                for input in &node.inputs {
                    if !input.starts_with(ARTIFACT_INPUT_PREFIX) {
                        walk(input, nodes, marks, path)?;
                    }
                }
            }
            path.pop();
            marks.insert(name, Mark::Done);
            Ok(())
        }

        let nodes: HashMap<&str, &NodeSpec> =
            self.nodes.iter().map(|n| (n.name.as_str(), n)).collect();
        let mut marks = HashMap::new();
        for node in &self.nodes {
            walk(&node.name, &nodes, &mut marks, &mut Vec::new())?;
        }
        Ok(())
    }

    pub fn node(&self, name: &str) -> Result<&NodeSpec> {
        self.nodes.iter().find(|n| n.name == name).ok_or_else(|| {
            PipelineError::config(format!(
                "unknown node '{name}'. Available nodes: {}",
                self.node_names().join(", ")
            ))
        })
    }

    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name.as_str()).collect()
    }

    /// Nodes no other node consumes, in declaration order.
    pub fn targets(&self) -> Vec<&str> {
        let consumed: HashSet<&str> = self
            .nodes
            .iter()
            .flat_map(|n| n.inputs.iter().map(String::as_str))
            .collect();
        self.nodes
            .iter()
            .map(|n| n.name.as_str())
            .filter(|name| !consumed.contains(name))
            .collect()
    }

    /// The invocation tree rooted at node `name`.
    pub fn request_for(&self, name: &str) -> Result<StageRequest> {
        let mut memo = HashMap::new();
        self.request_memo(name, &mut memo)
    }

    fn request_memo(
        &self,
        name: &str,
        memo: &mut HashMap<String, StageRequest>,
    ) -> Result<StageRequest> {
        if let Some(request) = memo.get(name) {
            return Ok(request.clone());
        }
        let node = self.node(name)?;
        let (config, config_ref) = self.resolve_config(&node.config)?;
        let mut request = StageRequest::new(node.stage.clone(), config).with_seeds(node.seeds.clone());
        request.config_ref = config_ref;
        for input in &node.inputs {
            let input_ref = match input.strip_prefix(ARTIFACT_INPUT_PREFIX) {
                Some(id) => InputRef::Artifact(id.parse()?),
                None => InputRef::Request(Box::new(self.request_memo(input, memo)?)),
            };
            request.inputs.push(input_ref);
        }
        memo.insert(name.to_string(), request.clone());
        Ok(request)
    }

    fn resolve_config(&self, source: &ConfigSource) -> Result<(Value, Option<ConfigRef>)> {
        match source {
            ConfigSource::Inline(value) => Ok((yaml_to_json(value.clone(), "inline config")?, None)),
            ConfigSource::File(path) => {
                let (value, config_ref) =
                    load_config(&self.base_dir.join(path), path.display().to_string())?;
                Ok((value, Some(config_ref)))
            }
        }
    }

    /// Registry holding every declared stage, with execution settings applied.
    pub fn build_registry(&self) -> Result<StageRegistry> {
        let mut registry = StageRegistry::new();
        for declaration in &self.stages {
            let spec = self.stage_spec(declaration);
            let executor = build_executor(&declaration.executor, &self.base_dir, spec.timeout)
                .map_err(|message| {
                    PipelineError::config(format!("stage '{}': {message}", declaration.name))
                })?;
            debug!(
                stage = %spec.name,
                determinism = ?spec.determinism,
                timeout = ?spec.timeout,
                max_attempts = spec.retry.max_attempts,
                "Registering declared stage"
            );
            registry.register_arc(spec, executor)?;
        }
        Ok(registry)
    }

    fn stage_spec(&self, declaration: &StageDeclaration) -> StageSpec {
        let overrides = self.execution.stages.get(&declaration.name);
        let timeout_secs = overrides
            .and_then(|o| o.timeout_secs)
            .or(declaration.timeout_secs)
            .or(self.execution.timeout_secs);
        let retry = overrides
            .and_then(|o| o.retry.clone())
            .or_else(|| declaration.retry.clone())
            .or_else(|| self.execution.retry.clone())
            .unwrap_or_default();

        let mut spec = StageSpec::new(declaration.name.clone())
            .with_inputs(declaration.inputs.iter().cloned())
            .with_schema(declaration.schema.clone())
            .with_retry(retry);
        spec.determinism = declaration.determinism;
        spec.timeout = timeout_secs.map(Duration::from_secs);
        spec
    }
}

/// Read a stage config from a `.yaml`, `.yml` or `.json` file. The returned
/// reference records the file as `recorded_path` with the SHA-256 of the bytes
/// that were parsed.
pub fn load_config(path: &Path, recorded_path: impl Into<String>) -> Result<(Value, ConfigRef)> {
    let bytes = fs::read(path).map_err(|err| PipelineError::io(path, err))?;
    let config_ref = ConfigRef::new(recorded_path, sha256_bytes(&bytes));
    let content = std::str::from_utf8(&bytes).map_err(|err| {
        PipelineError::config(format!("config {} is not UTF-8: {err}", path.display()))
    })?;
    Ok((parse_config(path, content)?, config_ref))
}

fn parse_config(path: &Path, content: &str) -> Result<Value> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("yaml") | Some("yml") => {
            let value: YamlValue = serde_yaml::from_str(content).map_err(|err| {
                PipelineError::config(format!("invalid YAML config {}: {err}", path.display()))
            })?;
            yaml_to_json(value, &path.display().to_string())
        }
        Some("json") => serde_json::from_str(content).map_err(|err| {
            PipelineError::config(format!("invalid JSON config {}: {err}", path.display()))
        }),
        _ => Err(PipelineError::config(format!(
            "config file {} must end in .yaml, .yml or .json",
            path.display()
        ))),
    }
}

/// JSON has no NaN or infinity, and converting would silently turn them into
/// `null`.
fn yaml_to_json(value: YamlValue, origin: &str) -> Result<Value> {
    check_finite(&value, "config")
        .map_err(|message| PipelineError::config(format!("{origin}: {message}")))?;
    serde_yaml::from_value(value)
        .map_err(|err| PipelineError::config(format!("{origin}: {err}")))
}

fn check_finite(value: &YamlValue, path: &str) -> std::result::Result<(), String> {
    match value {
        YamlValue::Number(n) if n.is_nan() || n.is_infinite() => Err(format!(
            "{path} is {n}; only finite numbers are allowed"
        )),
        YamlValue::Sequence(items) => items
            .iter()
            .enumerate()
            .try_for_each(|(idx, item)| check_finite(item, &format!("{path}[{idx}]"))),
        YamlValue::Mapping(map) => map.iter().try_for_each(|(key, item)| {
            check_finite(key, path)?;
            let key = key
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{key:?}"));
            check_finite(item, &format!("{path}.{key}"))
        }),
        YamlValue::Tagged(tagged) => check_finite(&tagged.value, path),
        _ => Ok(()),
    }
}
