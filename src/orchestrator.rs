//! Builds artifacts on demand: resolves inputs, derives the id, answers from
//! the store when possible and otherwise runs the stage executor and publishes.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt, try_join_all};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::artifact::{Artifact, ArtifactId};
use crate::error::{PipelineError, Result};
use crate::hashing::{config_hash, derive_id_for};
use crate::manifest::{ConfigRef, ManifestExtras};
use crate::observability::MetricsCollector;
use crate::registry::{RegisteredStage, StageError, StageOutput, StageRegistry};
use crate::store::{ArtifactStore, PutRequest};

/// Where a stage input comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum InputRef {
    /// An artifact that must already be published.
    Artifact(ArtifactId),
    /// An upstream invocation, built first if needed.
    Request(Box<StageRequest>),
}

/// One stage invocation: stage name, resolved config, logical inputs, seeds.
#[derive(Debug, Clone, PartialEq)]
pub struct StageRequest {
    pub stage: String,
    pub config: Value,
    pub config_ref: Option<ConfigRef>,
    pub seeds: Vec<u64>,
    pub inputs: Vec<InputRef>,
}

impl StageRequest {
    pub fn new(stage: impl Into<String>, config: Value) -> Self {
        Self {
            stage: stage.into(),
            config,
            config_ref: None,
            seeds: Vec::new(),
            inputs: Vec::new(),
        }
    }

    pub fn with_config_ref(mut self, config_ref: ConfigRef) -> Self {
        self.config_ref = Some(config_ref);
        self
    }

    pub fn with_seeds(mut self, seeds: Vec<u64>) -> Self {
        self.seeds = seeds;
        self
    }

    pub fn with_input(mut self, input: InputRef) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_artifact(self, id: ArtifactId) -> Self {
        self.with_input(InputRef::Artifact(id))
    }

    pub fn with_upstream(self, request: StageRequest) -> Self {
        self.with_input(InputRef::Request(Box::new(request)))
    }

    /// Rebuild the request tree that produced `id` from stored manifests alone.
    pub fn from_lineage(store: &ArtifactStore, id: &ArtifactId) -> Result<Self> {
        let mut memo = HashMap::new();
        lineage_request(store, id, &mut memo)
    }

    /// Whether any node of this tree belongs to `stage`.
    pub fn contains_stage(&self, stage: &str) -> bool {
        self.stage == stage
            || self.inputs.iter().any(|input| match input {
                InputRef::Request(upstream) => upstream.contains_stage(stage),
                InputRef::Artifact(_) => false,
            })
    }
}

fn lineage_request(
    store: &ArtifactStore,
    id: &ArtifactId,
    memo: &mut HashMap<ArtifactId, StageRequest>,
) -> Result<StageRequest> {
    if let Some(request) = memo.get(id) {
        return Ok(request.clone());
    }
    let artifact = store.get(id)?;
    let manifest = artifact.manifest;
    let mut inputs = Vec::with_capacity(manifest.input_ids.len());
    for input_id in &manifest.input_ids {
        let upstream = lineage_request(store, input_id, memo).map_err(|err| match err {
            PipelineError::NotFound { id: missing } => PipelineError::DanglingReference {
                id: id.clone(),
                missing,
            },
            other => other,
        })?;
        inputs.push(InputRef::Request(Box::new(upstream)));
    }
    let request = StageRequest {
        stage: manifest.stage,
        config: manifest.config,
        config_ref: manifest.config_ref,
        seeds: manifest.seeds,
        inputs,
    };
    memo.insert(id.clone(), request.clone());
    Ok(request)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InvocationState {
    Requested,
    ResolvingInputs,
    IdComputed,
    CacheHit,
    Executing,
    Publishing,
    Done,
    Failed,
}

impl fmt::Display for InvocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InvocationState::Requested => "REQUESTED",
            InvocationState::ResolvingInputs => "RESOLVING_INPUTS",
            InvocationState::IdComputed => "ID_COMPUTED",
            InvocationState::CacheHit => "CACHE_HIT",
            InvocationState::Executing => "EXECUTING",
            InvocationState::Publishing => "PUBLISHING",
            InvocationState::Done => "DONE",
            InvocationState::Failed => "FAILED",
        })
    }
}

fn transition(stage: &str, id: Option<&ArtifactId>, state: InvocationState) {
    debug!(
        stage,
        id = id.map(ArtifactId::short).unwrap_or("-"),
        %state,
        "Invocation state changed"
    );
}

fn ensure_live(stage: &str, cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled {
            stage: stage.to_string(),
        })
    } else {
        Ok(())
    }
}

/// Per-id locks so concurrent requests for the same unpublished artifact run
/// the executor once.
#[derive(Debug, Default)]
struct InFlight {
    slots: Mutex<HashMap<ArtifactId, Arc<AsyncMutex<()>>>>,
}

pub(crate) struct InFlightGuard {
    table: Arc<InFlight>,
    id: ArtifactId,
    _held: OwnedMutexGuard<()>,
}

impl InFlight {
    async fn acquire(
        self: &Arc<Self>,
        id: &ArtifactId,
        stage: &str,
        cancel: &CancellationToken,
    ) -> Result<InFlightGuard> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(id.clone()).or_default())
        };
        let held = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(PipelineError::Cancelled { stage: stage.to_string() });
            }
            held = slot.lock_owned() => held,
        };
        Ok(InFlightGuard {
            table: Arc::clone(self),
            id: id.clone(),
            _held: held,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut slots = self.table.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // The map and this guard are the only holders: nobody is waiting.
        if slots
            .get(&self.id)
            .is_some_and(|slot| Arc::strong_count(slot) <= 2)
        {
            slots.remove(&self.id);
        }
    }
}

enum AttemptError {
    Stage(StageError),
    Abort(PipelineError),
}

/// One node of a dry-run plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedNode {
    pub stage: String,
    pub artifact_id: ArtifactId,
    pub config_hash: String,
    pub input_ids: Vec<ArtifactId>,
    pub deterministic: bool,
    /// Already published; building would be a cache hit.
    pub cached: bool,
}

/// Ids a build would produce, upstream first, shared ancestors listed once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildPlan {
    pub target: ArtifactId,
    pub nodes: Vec<PlannedNode>,
}

impl BuildPlan {
    pub fn pending(&self) -> impl Iterator<Item = &PlannedNode> {
        self.nodes.iter().filter(|node| !node.cached)
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<ArtifactStore>,
    registry: Arc<StageRegistry>,
    metrics: MetricsCollector,
    in_flight: Arc<InFlight>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("store", &self.store.root())
            .field("stages", &self.registry.known_stages())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(store: Arc<ArtifactStore>, registry: Arc<StageRegistry>) -> Self {
        Self {
            store,
            registry,
            metrics: MetricsCollector::new(),
            in_flight: Arc::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<StageRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    /// Produce the artifact for `request`, building missing upstream artifacts
    /// first.
    pub async fn build(
        &self,
        request: &StageRequest,
        cancel: &CancellationToken,
    ) -> Result<Artifact> {
        let started = Instant::now();
        let result = self.resolve(request, cancel).await;
        self.metrics.record_total_duration(started.elapsed());
        result
    }

    /// Compute every id the build would produce without executing anything.
    pub fn plan(&self, request: &StageRequest) -> Result<BuildPlan> {
        let mut nodes = Vec::new();
        let mut seen = HashSet::new();
        let target = self.plan_node(request, &mut nodes, &mut seen)?;
        Ok(BuildPlan { target, nodes })
    }

    fn plan_node(
        &self,
        request: &StageRequest,
        nodes: &mut Vec<PlannedNode>,
        seen: &mut HashSet<ArtifactId>,
    ) -> Result<ArtifactId> {
        let registered = self.prepare(request)?;
        let mut inputs: Vec<(ArtifactId, String)> = Vec::with_capacity(request.inputs.len());
        for input in &request.inputs {
            match input {
                InputRef::Artifact(id) => {
                    let stage = self
                        .store
                        .locate(id)
                        .ok_or_else(|| PipelineError::NotFound { id: id.clone() })?;
                    inputs.push((id.clone(), stage));
                }
                InputRef::Request(upstream) => {
                    let id = self.plan_node(upstream, nodes, seen)?;
                    inputs.push((id, upstream.stage.clone()));
                }
            }
        }
        let pairs: Vec<(&ArtifactId, &str)> =
            inputs.iter().map(|(id, stage)| (id, stage.as_str())).collect();
        registered.spec.check_input_stages(&pairs)?;

        let input_ids: Vec<ArtifactId> = inputs.into_iter().map(|(id, _)| id).collect();
        let id = derive_id_for(&request.stage, &request.config, &input_ids, &request.seeds)?;
        if seen.insert(id.clone()) {
            nodes.push(PlannedNode {
                stage: request.stage.clone(),
                artifact_id: id.clone(),
                config_hash: config_hash(&request.config)?,
                input_ids,
                deterministic: registered.spec.determinism.is_deterministic(),
                cached: self.store.exists(&id),
            });
        }
        Ok(id)
    }

    fn resolve<'a>(
        &'a self,
        request: &'a StageRequest,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Artifact>> {
        async move {
            let result = self.resolve_node(request, cancel).await;
            if let Err(err) = &result {
                transition(&request.stage, None, InvocationState::Failed);
                debug!(stage = %request.stage, kind = err.kind(), error = %err, "Invocation failed");
            }
            result
        }
        .boxed()
    }

    async fn resolve_node(
        &self,
        request: &StageRequest,
        cancel: &CancellationToken,
    ) -> Result<Artifact> {
        let stage = request.stage.as_str();
        transition(stage, None, InvocationState::Requested);
        ensure_live(stage, cancel)?;
        let registered = self.prepare(request)?;

        transition(stage, None, InvocationState::ResolvingInputs);
        let inputs = try_join_all(
            request
                .inputs
                .iter()
                .map(|input| self.resolve_input(input, cancel)),
        )
        .await?;
        registered.spec.check_inputs(&inputs)?;

        let input_ids: Vec<ArtifactId> = inputs.iter().map(|a| a.id.clone()).collect();
        let id = derive_id_for(stage, &request.config, &input_ids, &request.seeds)?;
        transition(stage, Some(&id), InvocationState::IdComputed);

        if let Some(hit) = self.cached(stage, &id).await? {
            return Ok(hit);
        }
        let _slot = self.in_flight.acquire(&id, stage, cancel).await?;
        // Another invocation may have published while we waited.
        if let Some(hit) = self.cached(stage, &id).await? {
            return Ok(hit);
        }

        transition(stage, Some(&id), InvocationState::Executing);
        let output = self
            .execute(&registered, &request.config, inputs, cancel)
            .await?;

        ensure_live(stage, cancel)?;
        transition(stage, Some(&id), InvocationState::Publishing);
        let artifact = self
            .publish(put_request(request, input_ids, output, ManifestExtras::default()))
            .await?;
        transition(stage, Some(&artifact.id), InvocationState::Done);
        info!(stage, id = %artifact.id.short(), "Artifact built");
        Ok(artifact)
    }

    fn resolve_input<'a>(
        &'a self,
        input: &'a InputRef,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Artifact>> {
        match input {
            InputRef::Artifact(id) => self.fetch(id.clone()).boxed(),
            InputRef::Request(upstream) => self.resolve(upstream, cancel),
        }
    }

    async fn cached(&self, stage: &str, id: &ArtifactId) -> Result<Option<Artifact>> {
        if !self.exists(id.clone()).await? {
            return Ok(None);
        }
        transition(stage, Some(id), InvocationState::CacheHit);
        self.metrics.record_cache_hit(stage);
        let artifact = self.fetch(id.clone()).await?;
        transition(stage, Some(id), InvocationState::Done);
        Ok(Some(artifact))
    }

    /// Registry lookup plus config schema check.
    pub(crate) fn prepare(&self, request: &StageRequest) -> Result<RegisteredStage> {
        let registered = self.registry.get(&request.stage)?.clone();
        registered
            .spec
            .config_schema
            .check(&request.stage, &request.config)?;
        Ok(registered)
    }

    /// Run the executor with the stage's timeout and retry policy. Nothing is
    /// published here.
    #[instrument(skip_all, fields(stage = %registered.spec.name))]
    pub(crate) async fn execute(
        &self,
        registered: &RegisteredStage,
        config: &Value,
        inputs: Vec<Artifact>,
        cancel: &CancellationToken,
    ) -> Result<StageOutput> {
        let spec = &registered.spec;
        let inputs = Arc::new(inputs);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match self.attempt(registered, config, &inputs, cancel).await {
                Ok(output) => return Ok(output),
                Err(AttemptError::Abort(err)) => {
                    self.metrics.record_failure(&spec.name);
                    return Err(err);
                }
                Err(AttemptError::Stage(err)) => err,
            };

            if err.retryable && attempt < spec.retry.max_attempts {
                let delay = spec.retry.backoff(attempt - 1);
                warn!(
                    stage = %spec.name,
                    attempt,
                    max_attempts = spec.retry.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retryable stage failure; backing off"
                );
                self.metrics.record_retry(&spec.name);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(PipelineError::Cancelled { stage: spec.name.clone() });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }

            self.metrics.record_failure(&spec.name);
            return Err(PipelineError::StageExecution {
                stage: spec.name.clone(),
                message: err.message,
                retryable: err.retryable,
                attempts: attempt,
            });
        }
    }

    async fn attempt(
        &self,
        registered: &RegisteredStage,
        config: &Value,
        inputs: &Arc<Vec<Artifact>>,
        cancel: &CancellationToken,
    ) -> std::result::Result<StageOutput, AttemptError> {
        let name = registered.spec.name.as_str();
        let _timer = self.metrics.start_stage(name);
        let executor = Arc::clone(&registered.executor);
        let config = config.clone();
        let shared = Arc::clone(inputs);
        // Abandoned on timeout or cancel; its output is dropped unpublished.
        let handle = tokio::task::spawn_blocking(move || executor.run(&config, &shared));
        let budget = registered.spec.timeout;
        let run = async move {
            match budget {
                Some(budget) => tokio::time::timeout(budget, handle)
                    .await
                    .map_err(|_| budget),
                None => Ok(handle.await),
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AttemptError::Abort(PipelineError::Cancelled {
                stage: name.to_string(),
            })),
            outcome = run => match outcome {
                Err(budget) => Err(AttemptError::Abort(PipelineError::Timeout {
                    stage: name.to_string(),
                    budget,
                })),
                Ok(Err(join_err)) => Err(AttemptError::Stage(StageError::fatal(format!(
                    "executor panicked: {join_err}"
                )))),
                Ok(Ok(result)) => result.map_err(AttemptError::Stage),
            },
        }
    }

    pub(crate) async fn publish(&self, put: PutRequest) -> Result<Artifact> {
        self.with_store(move |store| store.put(put)).await
    }

    pub(crate) async fn fetch(&self, id: ArtifactId) -> Result<Artifact> {
        self.with_store(move |store| store.get(&id)).await
    }

    pub(crate) async fn exists(&self, id: ArtifactId) -> Result<bool> {
        self.with_store(move |store| Ok(store.exists(&id))).await
    }

    pub(crate) async fn lock(
        &self,
        id: &ArtifactId,
        stage: &str,
        cancel: &CancellationToken,
    ) -> Result<InFlightGuard> {
        self.in_flight.acquire(id, stage, cancel).await
    }

    async fn with_store<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&ArtifactStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let root = store.root().to_path_buf();
        tokio::task::spawn_blocking(move || work(&store))
            .await
            .map_err(|err| PipelineError::io(root, std::io::Error::other(err.to_string())))?
    }
}

pub(crate) fn put_request(
    request: &StageRequest,
    input_ids: Vec<ArtifactId>,
    output: StageOutput,
    extras: ManifestExtras,
) -> PutRequest {
    PutRequest {
        stage: request.stage.clone(),
        config: request.config.clone(),
        config_ref: request.config_ref.clone(),
        input_ids,
        seeds: request.seeds.clone(),
        payload: output.payload,
        metrics: output.metrics,
        extras,
    }
}
