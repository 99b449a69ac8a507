//! Append-only, content-addressed artifact storage on the local filesystem.
//!
//! Layout: `<root>/<stage>/<artifact_id>/{manifest.json,payload.json,metrics.json}`.
//! Writes land in `<root>/.staging/` first and become visible through a single
//! directory rename, so a reader either sees a complete artifact or nothing.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::artifact::{Artifact, ArtifactId, MetricValue, Metrics};
use crate::error::{PipelineError, Result};
use crate::hashing::{canonicalize, config_hash, derive_id, normalize_seeds, sha256_bytes};
use crate::manifest::{
    CodeRef, ConfigRef, MANIFEST_SCHEMA_VERSION, Manifest, ManifestExtras, PRODUCER_VERSION,
};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const PAYLOAD_FILE: &str = "payload.json";
pub const METRICS_FILE: &str = "metrics.json";
const STAGING_DIR: &str = ".staging";

pub const DEFAULT_STAGING_GRACE: Duration = Duration::from_secs(15 * 60);

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub code_ref: CodeRef,
    /// Staging directories younger than this are left alone by the startup sweep,
    /// since another process may still be writing them.
    pub staging_grace: Duration,
    /// Run [`ArtifactStore::gc_staging`] while opening.
    pub sweep_on_open: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            code_ref: CodeRef::default(),
            staging_grace: DEFAULT_STAGING_GRACE,
            sweep_on_open: true,
        }
    }
}

/// Everything needed to publish one artifact.
#[derive(Debug, Clone)]
pub struct PutRequest {
    pub stage: String,
    pub config: Value,
    pub config_ref: Option<ConfigRef>,
    pub input_ids: Vec<ArtifactId>,
    pub seeds: Vec<u64>,
    pub payload: Value,
    pub metrics: Metrics,
    pub extras: ManifestExtras,
}

impl PutRequest {
    pub fn new(stage: impl Into<String>, config: Value, payload: Value) -> Self {
        Self {
            stage: stage.into(),
            config,
            config_ref: None,
            input_ids: Vec::new(),
            seeds: Vec::new(),
            payload,
            metrics: Metrics::new(),
            extras: ManifestExtras::default(),
        }
    }

    pub fn with_inputs(mut self, input_ids: Vec<ArtifactId>) -> Self {
        self.input_ids = input_ids;
        self
    }

    pub fn with_seeds(mut self, seeds: Vec<u64>) -> Self {
        self.seeds = seeds;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }
}

#[derive(Debug, Default)]
struct StoreCounters {
    published: AtomicU64,
    deduplicated: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Artifacts physically written by this handle.
    pub published: u64,
    /// `put` calls answered with an artifact that already existed.
    pub deduplicated: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub removed_staging: usize,
    pub removed_incomplete: usize,
}

#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
    code_ref: CodeRef,
    counters: StoreCounters,
    read_only: bool,
}

impl ArtifactStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with(root, StoreOptions::default())
    }

    pub fn open_with(root: impl Into<PathBuf>, options: StoreOptions) -> Result<Self> {
        let root = root.into();
        let staging = root.join(STAGING_DIR);
        fs::create_dir_all(&staging).map_err(|err| PipelineError::io(&staging, err))?;

        let store = Self {
            root,
            code_ref: options.code_ref,
            counters: StoreCounters::default(),
            read_only: false,
        };
        if !options.sweep_on_open {
            return Ok(store);
        }
        let report = store.gc_staging(options.staging_grace)?;
        if report.removed_staging > 0 || report.removed_incomplete > 0 {
            info!(
                root = %store.root.display(),
                removed_staging = report.removed_staging,
                removed_incomplete = report.removed_incomplete,
                "Removed orphaned artifact writes"
            );
        }
        Ok(store)
    }

    /// Open without creating or removing anything, for inspection and
    /// validation. `put` and `gc_staging` are refused.
    pub fn open_read_only(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            code_ref: CodeRef::default(),
            counters: StoreCounters::default(),
            read_only: true,
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn ensure_writable(&self, operation: &str) -> Result<()> {
        if self.read_only {
            return Err(PipelineError::config(format!(
                "cannot {operation}: store {} is open read-only",
                self.root.display()
            )));
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn code_ref(&self) -> &CodeRef {
        &self.code_ref
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            published: self.counters.published.load(Ordering::SeqCst),
            deduplicated: self.counters.deduplicated.load(Ordering::SeqCst),
        }
    }

    pub fn exists(&self, id: &ArtifactId) -> bool {
        self.locate(id).is_some()
    }

    /// Stage directory holding `id`, if the artifact is published.
    pub fn locate(&self, id: &ArtifactId) -> Option<String> {
        self.stages().ok()?.into_iter().find(|stage| {
            self.artifact_dir(stage, id)
                .join(MANIFEST_FILE)
                .is_file()
        })
    }

    pub fn get(&self, id: &ArtifactId) -> Result<Artifact> {
        let (stage, raw) = self.read_manifest_value(id)?;
        let location = format!("{stage}/{id}");
        let manifest = Manifest::from_value(raw, &location)?;
        if &manifest.artifact_id != id || manifest.stage != stage {
            return Err(PipelineError::schema(
                location,
                format!(
                    "manifest describes {}/{} but is stored under this path",
                    manifest.stage, manifest.artifact_id
                ),
            ));
        }

        let dir = self.artifact_dir(&stage, id);
        let payload: Value = read_json(&dir.join(PAYLOAD_FILE))?;
        let metrics_path = dir.join(METRICS_FILE);
        let metrics: Metrics = if metrics_path.is_file() {
            read_json(&metrics_path)?
        } else {
            Metrics::new()
        };

        Ok(Artifact {
            id: id.clone(),
            stage,
            payload,
            metrics,
            manifest,
        })
    }

    /// Publish an artifact, or return the existing one with the same id.
    pub fn put(&self, request: PutRequest) -> Result<Artifact> {
        self.ensure_writable("publish")?;
        validate_stage_name(&request.stage)?;
        check_metrics(&request.metrics)?;
        let seeds = normalize_seeds(&request.seeds);
        let canonical = canonicalize(&request.config)?;
        let id = derive_id(&request.stage, &canonical, &request.input_ids, &seeds);

        if self.exists(&id) {
            return self.existing(&id);
        }

        let payload_sha256 = sha256_bytes(canonicalize(&request.payload)?.as_bytes());
        let manifest = Manifest {
            schema_version: MANIFEST_SCHEMA_VERSION,
            artifact_id: id.clone(),
            stage: request.stage.clone(),
            input_ids: request.input_ids,
            config_hash: config_hash(&request.config)?,
            config: request.config,
            config_ref: request.config_ref,
            code_ref: self.code_ref.clone(),
            seeds,
            payload_sha256,
            backend_profile_summary: request.extras.backend_profile_summary,
            replay_of: request.extras.replay_of,
            extra: request.extras.extra,
            created_at: Utc::now(),
            producer_version: PRODUCER_VERSION.to_string(),
        };

        let staging = StagingDir::create(&self.root, &request.stage, &id)?;
        write_synced(
            &staging.path.join(PAYLOAD_FILE),
            &to_pretty(&request.payload, "payload")?,
        )?;
        write_synced(
            &staging.path.join(METRICS_FILE),
            &to_pretty(&request.metrics, "metrics")?,
        )?;
        // The manifest goes last: a staging directory without one is never valid.
        write_synced(&staging.path.join(MANIFEST_FILE), &manifest.to_pretty_json()?)?;

        let stage_dir = self.root.join(&request.stage);
        fs::create_dir_all(&stage_dir).map_err(|err| PipelineError::io(&stage_dir, err))?;
        let final_dir = self.artifact_dir(&request.stage, &id);

        if let Err(err) = fs::rename(&staging.path, &final_dir) {
            if final_dir.join(MANIFEST_FILE).is_file() {
                debug!(stage = %request.stage, id = %id.short(), "Lost publish race; keeping existing artifact");
                drop(staging);
                return self.existing(&id);
            }
            return Err(PipelineError::io(&final_dir, err));
        }
        staging.disarm();
        sync_dir(&stage_dir);

        self.counters.published.fetch_add(1, Ordering::SeqCst);
        debug!(stage = %request.stage, id = %id.short(), "Artifact published");

        Ok(Artifact {
            id,
            stage: request.stage,
            payload: request.payload,
            metrics: request.metrics,
            manifest,
        })
    }

    fn existing(&self, id: &ArtifactId) -> Result<Artifact> {
        self.counters.deduplicated.fetch_add(1, Ordering::SeqCst);
        self.get(id)
    }

    /// Published artifact ids of one stage, sorted.
    pub fn list(&self, stage: &str) -> Result<Vec<ArtifactId>> {
        validate_stage_name(stage)?;
        let dir = self.root.join(stage);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|err| PipelineError::io(&dir, err))? {
            let entry = entry.map_err(|err| PipelineError::io(&dir, err))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Ok(id) = name.parse::<ArtifactId>() else {
                continue;
            };
            if entry.path().join(MANIFEST_FILE).is_file() {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Entries under `<stage>/` that are not published artifacts: directories
    /// without a manifest and names that are not artifact ids. A publish
    /// renames a complete directory into place, so none of these are writes
    /// in progress.
    pub fn unpublished(&self, stage: &str) -> Result<Vec<String>> {
        validate_stage_name(stage)?;
        let dir = self.root.join(stage);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|err| PipelineError::io(&dir, err))? {
            let entry = entry.map_err(|err| PipelineError::io(&dir, err))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let published =
                name.parse::<ArtifactId>().is_ok() && entry.path().join(MANIFEST_FILE).is_file();
            if !published {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Stage directories present in the store, sorted.
    pub fn stages(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut stages = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(|err| PipelineError::io(&self.root, err))? {
            let entry = entry.map_err(|err| PipelineError::io(&self.root, err))?;
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if let Some(name) = entry.file_name().to_str()
                && is_dir
                && validate_stage_name(name).is_ok()
            {
                stages.push(name.to_string());
            }
        }
        stages.sort();
        Ok(stages)
    }

    /// Remove staging directories and half-written artifact directories older
    /// than `grace`.
    pub fn gc_staging(&self, grace: Duration) -> Result<GcReport> {
        self.ensure_writable("collect garbage")?;
        let mut report = GcReport::default();
        let staging = self.root.join(STAGING_DIR);
        if staging.is_dir() {
            for entry in fs::read_dir(&staging).map_err(|err| PipelineError::io(&staging, err))? {
                let entry = entry.map_err(|err| PipelineError::io(&staging, err))?;
                if is_older_than(&entry.path(), grace) && remove_tree(&entry.path()) {
                    report.removed_staging += 1;
                }
            }
        }

        for stage in self.stages()? {
            let dir = self.root.join(&stage);
            for entry in fs::read_dir(&dir).map_err(|err| PipelineError::io(&dir, err))? {
                let entry = entry.map_err(|err| PipelineError::io(&dir, err))?;
                let path = entry.path();
                if path.is_dir()
                    && !path.join(MANIFEST_FILE).is_file()
                    && is_older_than(&path, grace)
                    && remove_tree(&path)
                {
                    warn!(path = %path.display(), "Removed incomplete artifact directory");
                    report.removed_incomplete += 1;
                }
            }
        }
        Ok(report)
    }

    pub(crate) fn read_manifest_value(&self, id: &ArtifactId) -> Result<(String, Value)> {
        let stage = self
            .locate(id)
            .ok_or_else(|| PipelineError::NotFound { id: id.clone() })?;
        let raw = read_json(&self.artifact_dir(&stage, id).join(MANIFEST_FILE))
            .map_err(|err| match err {
                PipelineError::Serialization { source, .. } => {
                    PipelineError::schema(format!("{stage}/{id}"), source.to_string())
                }
                other => other,
            })?;
        Ok((stage, raw))
    }

    pub(crate) fn read_payload_value(&self, stage: &str, id: &ArtifactId) -> Result<Value> {
        read_json(&self.artifact_dir(stage, id).join(PAYLOAD_FILE))
    }

    fn artifact_dir(&self, stage: &str, id: &ArtifactId) -> PathBuf {
        self.root.join(stage).join(id.as_str())
    }
}

/// Stage names double as directory names.
pub fn validate_stage_name(stage: &str) -> Result<()> {
    let valid = !stage.is_empty()
        && !stage.starts_with('.')
        && stage
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-' || b == b'.');
    if valid {
        Ok(())
    } else {
        Err(PipelineError::config(format!(
            "invalid stage name '{stage}' (use lowercase letters, digits, '_', '-', '.')"
        )))
    }
}

/// JSON cannot carry NaN or infinity; such a metric would be written as
/// `null` and never read back.
fn check_metrics(metrics: &Metrics) -> Result<()> {
    for (name, value) in metrics {
        if let MetricValue::Number(number) = value
            && !number.is_finite()
        {
            return Err(PipelineError::config(format!(
                "metric '{name}' is {number}; only finite numbers can be stored"
            )));
        }
    }
    Ok(())
}

/// Removes its directory on drop unless published.
struct StagingDir {
    path: PathBuf,
    armed: bool,
}

impl StagingDir {
    fn create(root: &Path, stage: &str, id: &ArtifactId) -> Result<Self> {
        let name = format!(
            "{stage}.{}.{}.{}",
            id.short(),
            std::process::id(),
            STAGING_SEQ.fetch_add(1, Ordering::SeqCst)
        );
        let path = root.join(STAGING_DIR).join(name);
        fs::create_dir_all(&path).map_err(|err| PipelineError::io(&path, err))?;
        Ok(Self { path, armed: true })
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if self.armed && self.path.exists() && !remove_tree(&self.path) {
            warn!(path = %self.path.display(), "Failed to discard staging directory");
        }
    }
}

fn remove_tree(path: &Path) -> bool {
    fs::remove_dir_all(path).is_ok()
}

fn is_older_than(path: &Path, grace: Duration) -> bool {
    if grace.is_zero() {
        return true;
    }
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age >= grace)
}

fn to_pretty<T: Serialize>(value: &T, what: &str) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(value).map_err(|err| PipelineError::serde(what, err))
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path).map_err(|err| PipelineError::io(path, err))?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .map_err(|err| PipelineError::io(path, err))
}

fn sync_dir(path: &Path) {
    #[cfg(unix)]
    if let Ok(dir) = File::open(path) {
        let _ = dir.sync_all();
    }
    #[cfg(not(unix))]
    let _ = path;
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).map_err(|err| PipelineError::io(path, err))?;
    serde_json::from_slice(&bytes)
        .map_err(|err| PipelineError::serde(path.display().to_string(), err))
}
