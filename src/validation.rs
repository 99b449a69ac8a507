//! Provenance validation over stored artifacts.
//!
//! Checks each manifest's structure, its recorded config hash and artifact id
//! against recomputed values, the payload digest, and that every input resolves
//! to a stored artifact. Graph mode validates inputs recursively, once per id.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::artifact::{ArtifactId, Metrics};
use crate::error::{PipelineError, Result};
use crate::hashing::{canonicalize, config_hash, derive_id_for, sha256_bytes};
use crate::manifest::{Manifest, schema_violations};
use crate::store::{ArtifactStore, MANIFEST_FILE, METRICS_FILE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ViolationKind {
    SchemaError,
    HashMismatch,
    DanglingReference,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recorded: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recomputed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing: Option<ArtifactId>,
}

impl Violation {
    fn schema(message: impl Into<String>) -> Self {
        Self {
            kind: ViolationKind::SchemaError,
            message: message.into(),
            field: None,
            recorded: None,
            recomputed: None,
            missing: None,
        }
    }

    fn mismatch(field: &'static str, recorded: String, recomputed: String) -> Self {
        Self {
            kind: ViolationKind::HashMismatch,
            message: format!("{field} recorded {recorded}, recomputed {recomputed}"),
            field: Some(field),
            recorded: Some(recorded),
            recomputed: Some(recomputed),
            missing: None,
        }
    }

    fn dangling(missing: ArtifactId, message: impl Into<String>) -> Self {
        Self {
            kind: ViolationKind::DanglingReference,
            message: message.into(),
            field: None,
            recorded: None,
            recomputed: None,
            missing: Some(missing),
        }
    }

    /// Typed error for this violation on artifact `id`.
    pub fn to_error(&self, id: &ArtifactId, location: &str) -> PipelineError {
        match self.kind {
            ViolationKind::SchemaError => PipelineError::schema(location, self.message.clone()),
            ViolationKind::HashMismatch => PipelineError::HashMismatch {
                id: id.clone(),
                field: self.field.unwrap_or("artifact"),
                recorded: self.recorded.clone().unwrap_or_default(),
                recomputed: self.recomputed.clone().unwrap_or_default(),
            },
            ViolationKind::DanglingReference => PipelineError::DanglingReference {
                id: id.clone(),
                missing: self.missing.clone().unwrap_or_else(|| id.clone()),
            },
        }
    }
}

/// Outcome for one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactReport {
    pub artifact_id: ArtifactId,
    pub stage: String,
    pub passed: bool,
    pub violations: Vec<Violation>,
}

impl ArtifactReport {
    fn location(&self) -> String {
        format!("{}/{}", self.stage, self.artifact_id)
    }
}

/// Something under a stage directory that is not a published artifact, such
/// as a directory left without its manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnpublishedEntry {
    pub stage: String,
    pub name: String,
    pub message: String,
}

impl UnpublishedEntry {
    pub fn to_error(&self) -> PipelineError {
        PipelineError::schema(format!("{}/{}", self.stage, self.name), self.message.clone())
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ValidationReport {
    pub checked: usize,
    /// Failed artifacts plus unpublished entries.
    pub failed: usize,
    pub artifacts: Vec<ArtifactReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unpublished: Vec<UnpublishedEntry>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.failed == 0
    }

    pub fn merge(&mut self, other: ValidationReport) {
        for report in other.artifacts {
            self.push(report);
        }
        for entry in other.unpublished {
            self.push_unpublished(entry);
        }
        self.warnings.extend(other.warnings);
    }

    fn push(&mut self, report: ArtifactReport) {
        self.checked += 1;
        if !report.passed {
            self.failed += 1;
        }
        self.artifacts.push(report);
    }

    fn push_unpublished(&mut self, entry: UnpublishedEntry) {
        self.failed += 1;
        self.unpublished.push(entry);
    }

    pub fn get(&self, id: &ArtifactId) -> Option<&ArtifactReport> {
        self.artifacts.iter().find(|report| &report.artifact_id == id)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ArtifactReport> {
        self.artifacts.iter().filter(|report| !report.passed)
    }

    /// Typed error for the first violation found, if any.
    pub fn first_error(&self) -> Option<PipelineError> {
        self.failures()
            .find_map(|report| {
                report
                    .violations
                    .first()
                    .map(|violation| violation.to_error(&report.artifact_id, &report.location()))
            })
            .or_else(|| self.unpublished.first().map(UnpublishedEntry::to_error))
    }

    pub fn into_result(self) -> Result<Self> {
        match self.first_error() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| PipelineError::serde("validation report", err))
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_json()?).map_err(|err| PipelineError::io(path, err))
    }
}

/// Checks a manifest on its own: structure, config hash and artifact id.
pub fn validate_manifest(raw: &Value) -> Vec<Violation> {
    let problems = schema_violations(raw);
    if !problems.is_empty() {
        return problems.into_iter().map(Violation::schema).collect();
    }
    match Manifest::from_value(raw.clone(), "manifest") {
        Ok(manifest) => check_hashes(&manifest),
        Err(err) => vec![Violation::schema(err.to_string())],
    }
}

fn check_hashes(manifest: &Manifest) -> Vec<Violation> {
    let mut violations = Vec::new();
    match config_hash(&manifest.config) {
        Ok(recomputed) if recomputed != manifest.config_hash => violations.push(
            Violation::mismatch("config_hash", manifest.config_hash.clone(), recomputed),
        ),
        Ok(_) => {}
        Err(err) => violations.push(Violation::schema(format!(
            "config cannot be canonicalized: {err}"
        ))),
    }
    match derive_id_for(
        &manifest.stage,
        &manifest.config,
        &manifest.input_ids,
        &manifest.seeds,
    ) {
        Ok(recomputed) if recomputed != manifest.artifact_id => violations.push(
            Violation::mismatch(
                "artifact_id",
                manifest.artifact_id.to_string(),
                recomputed.to_string(),
            ),
        ),
        Ok(_) => {}
        Err(_) => {} // already reported through config_hash
    }
    violations
}

/// Walks stored artifacts. Results are memoized per id, so a shared ancestor
/// is checked once however many descendants reference it.
pub struct Validator<'a> {
    store: &'a ArtifactStore,
    graph: bool,
    verdicts: HashMap<ArtifactId, bool>,
    visiting: HashSet<ArtifactId>,
}

impl<'a> Validator<'a> {
    pub fn new(store: &'a ArtifactStore) -> Self {
        Self {
            store,
            graph: true,
            verdicts: HashMap::new(),
            visiting: HashSet::new(),
        }
    }

    /// Only check references exist; do not descend into inputs.
    pub fn shallow(mut self) -> Self {
        self.graph = false;
        self
    }

    /// Validate one artifact and, in graph mode, its whole lineage.
    pub fn validate_artifact(&mut self, id: &ArtifactId) -> Result<ValidationReport> {
        if !self.store.exists(id) {
            return Err(PipelineError::NotFound { id: id.clone() });
        }
        let mut report = ValidationReport::default();
        self.visit(id, &mut report);
        Ok(report)
    }

    /// Validate every artifact of `stage` and report whatever else sits in
    /// the stage directory.
    pub fn validate_stage(&mut self, stage: &str) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();
        for id in self.store.list(stage)? {
            self.visit(&id, &mut report);
        }
        for name in self.store.unpublished(stage)? {
            let message = if name.parse::<ArtifactId>().is_ok() {
                format!("artifact directory has no {MANIFEST_FILE}")
            } else {
                "entry is not an artifact directory".to_string()
            };
            warn!(stage, entry = %name, "{message}");
            report.push_unpublished(UnpublishedEntry {
                stage: stage.to_string(),
                name,
                message,
            });
        }
        Ok(report)
    }

    pub fn validate_all(&mut self) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();
        for stage in self.store.stages()? {
            report.merge(self.validate_stage(&stage)?);
        }
        if report.checked == 0 {
            report.warnings.push(format!(
                "no artifacts found under {}",
                self.store.root().display()
            ));
        }
        Ok(report)
    }

    fn visit(&mut self, id: &ArtifactId, report: &mut ValidationReport) -> bool {
        if let Some(verdict) = self.verdicts.get(id) {
            return *verdict;
        }
        self.visiting.insert(id.clone());
        let checked = self.check(id, report);
        self.visiting.remove(id);

        let passed = checked.violations.is_empty();
        if passed {
            debug!(stage = %checked.stage, id = %id.short(), "Artifact validated");
        } else {
            warn!(
                stage = %checked.stage,
                id = %id.short(),
                violations = checked.violations.len(),
                "Artifact failed validation"
            );
        }
        self.verdicts.insert(id.clone(), passed);
        report.push(ArtifactReport { passed, ..checked });
        passed
    }

    fn check(&mut self, id: &ArtifactId, report: &mut ValidationReport) -> ArtifactReport {
        let mut outcome = ArtifactReport {
            artifact_id: id.clone(),
            stage: String::new(),
            passed: false,
            violations: Vec::new(),
        };

        let (stage, raw) = match self.store.read_manifest_value(id) {
            Ok(found) => found,
            Err(err) => {
                outcome.stage = self.store.locate(id).unwrap_or_default();
                outcome.violations.push(Violation::schema(err.to_string()));
                return outcome;
            }
        };
        outcome.stage = stage.clone();

        let problems = schema_violations(&raw);
        if !problems.is_empty() {
            outcome
                .violations
                .extend(problems.into_iter().map(Violation::schema));
            return outcome;
        }
        let manifest = match Manifest::from_value(raw, &format!("{stage}/{id}")) {
            Ok(manifest) => manifest,
            Err(err) => {
                outcome.violations.push(Violation::schema(err.to_string()));
                return outcome;
            }
        };

        if manifest.stage != stage {
            outcome.violations.push(Violation::schema(format!(
                "manifest names stage '{}' but is stored under '{stage}'",
                manifest.stage
            )));
        }
        if &manifest.artifact_id != id {
            outcome.violations.push(Violation::mismatch(
                "directory",
                id.to_string(),
                manifest.artifact_id.to_string(),
            ));
        }
        outcome.violations.extend(check_hashes(&manifest));
        outcome
            .violations
            .extend(self.check_payload(&stage, id, &manifest.payload_sha256));

        for input in &manifest.input_ids {
            if self.visiting.contains(input) {
                outcome.violations.push(Violation::dangling(
                    input.clone(),
                    format!("input {input} forms a cycle"),
                ));
            } else if !self.store.exists(input) {
                outcome.violations.push(Violation::dangling(
                    input.clone(),
                    format!("input {input} is not in the store"),
                ));
            } else if self.graph && !self.visit(input, report) {
                outcome.violations.push(Violation::dangling(
                    input.clone(),
                    format!("input {input} does not validate"),
                ));
            }
        }
        outcome
    }

    fn check_payload(&self, stage: &str, id: &ArtifactId, recorded: &str) -> Vec<Violation> {
        let mut violations = Vec::new();
        match self.store.read_payload_value(stage, id) {
            Ok(payload) => match canonicalize(&payload) {
                Ok(canonical) => {
                    let recomputed = sha256_bytes(canonical.as_bytes());
                    if recomputed != recorded {
                        violations.push(Violation::mismatch(
                            "payload_sha256",
                            recorded.to_string(),
                            recomputed,
                        ));
                    }
                }
                Err(err) => violations.push(Violation::schema(format!("payload: {err}"))),
            },
            Err(err) => violations.push(Violation::schema(format!("payload: {err}"))),
        }

        let metrics_path = self
            .store
            .root()
            .join(stage)
            .join(id.as_str())
            .join(METRICS_FILE);
        if metrics_path.is_file() {
            let parsed = fs::read(&metrics_path)
                .map_err(|err| err.to_string())
                .and_then(|bytes| {
                    serde_json::from_slice::<Metrics>(&bytes).map_err(|err| err.to_string())
                });
            if let Err(err) = parsed {
                violations.push(Violation::schema(format!("metrics: {err}")));
            }
        }
        violations
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::store::PutRequest;

    #[test]
    fn fresh_artifacts_validate() {
        let temp = tempdir().unwrap();
        let store = ArtifactStore::open(temp.path()).unwrap();
        let dataset = store
            .put(PutRequest::new("datasets", json!({"name": "tpch"}), json!({"rows": 3})))
            .unwrap();
        store
            .put(
                PutRequest::new("plans", json!({"k": 2}), json!({"ok": true}))
                    .with_inputs(vec![dataset.id.clone()]),
            )
            .unwrap();

        let report = Validator::new(&store).validate_all().unwrap();
        assert!(report.is_ok(), "{report:?}");
        assert_eq!(report.checked, 2);
    }

    #[test]
    fn standalone_manifest_check_flags_edited_config() {
        let temp = tempdir().unwrap();
        let store = ArtifactStore::open(temp.path()).unwrap();
        let artifact = store
            .put(PutRequest::new("datasets", json!({"rows": 1}), json!([])))
            .unwrap();
        let mut raw = serde_json::to_value(&artifact.manifest).unwrap();
        assert!(validate_manifest(&raw).is_empty());

        raw["config"] = json!({"rows": 2});
        let kinds: Vec<_> = validate_manifest(&raw).into_iter().map(|v| v.kind).collect();
        assert_eq!(kinds, vec![ViolationKind::HashMismatch, ViolationKind::HashMismatch]);
    }
}
