use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::artifact::ArtifactId;
use crate::error::{PipelineError, Result};

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;
pub const PRODUCER_VERSION: &str = concat!("provenant/", env!("CARGO_PKG_VERSION"));

/// Version of the code that produced an artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeRef {
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub dirty: bool,
}

impl CodeRef {
    pub fn revision(revision: impl Into<String>) -> Self {
        Self {
            revision: Some(revision.into()),
            dirty: false,
        }
    }
}

/// Config file an invocation was loaded from, pinned to the exact bytes read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRef {
    pub path: String,
    pub sha256: String,
}

impl ConfigRef {
    pub fn new(path: impl Into<String>, sha256: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            sha256: sha256.into(),
        }
    }
}

/// Provenance record stored next to every payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub artifact_id: ArtifactId,
    pub stage: String,
    pub input_ids: Vec<ArtifactId>,
    pub config: Value,
    pub config_hash: String,
    #[serde(default)]
    pub config_ref: Option<ConfigRef>,
    pub code_ref: CodeRef,
    pub seeds: Vec<u64>,
    pub payload_sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_profile_summary: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_of: Option<ArtifactId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub producer_version: String,
}

/// Manifest fields a caller may attach at publish time. None of them take part
/// in the artifact id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestExtras {
    pub backend_profile_summary: Option<Value>,
    pub replay_of: Option<ArtifactId>,
    pub extra: BTreeMap<String, Value>,
}

/// JSON type a manifest field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JsonShape {
    String,
    Integer,
    Array,
    Object,
    Any,
}

impl JsonShape {
    fn matches(self, value: &Value) -> bool {
        match self {
            JsonShape::String => value.is_string(),
            JsonShape::Integer => value.is_u64(),
            JsonShape::Array => value.is_array(),
            JsonShape::Object => value.is_object(),
            JsonShape::Any => true,
        }
    }

    fn label(self) -> &'static str {
        match self {
            JsonShape::String => "a string",
            JsonShape::Integer => "a non-negative integer",
            JsonShape::Array => "an array",
            JsonShape::Object => "an object",
            JsonShape::Any => "any value",
        }
    }
}

const REQUIRED_FIELDS: &[(&str, JsonShape)] = &[
    ("schema_version", JsonShape::Integer),
    ("artifact_id", JsonShape::String),
    ("stage", JsonShape::String),
    ("input_ids", JsonShape::Array),
    ("config", JsonShape::Any),
    ("config_hash", JsonShape::String),
    ("code_ref", JsonShape::Object),
    ("seeds", JsonShape::Array),
    ("payload_sha256", JsonShape::String),
    ("created_at", JsonShape::String),
    ("producer_version", JsonShape::String),
];

/// Structural problems in a raw manifest document, one message per problem.
pub fn schema_violations(raw: &Value) -> Vec<String> {
    let Some(object) = raw.as_object() else {
        return vec!["manifest must be a JSON object".to_string()];
    };

    let mut problems = Vec::new();
    for (field, kind) in REQUIRED_FIELDS {
        match object.get(*field) {
            None => problems.push(format!("missing required field '{field}'")),
            Some(value) if !kind.matches(value) => {
                problems.push(format!("field '{field}' must be {}", kind.label()))
            }
            Some(_) => {}
        }
    }

    if let Some(version) = object.get("schema_version").and_then(Value::as_u64)
        && version != u64::from(MANIFEST_SCHEMA_VERSION)
    {
        problems.push(format!("unsupported schema_version {version}"));
    }

    match object.get("config_ref") {
        None | Some(Value::Null) => {}
        Some(Value::Object(reference))
            if reference.get("path").is_some_and(Value::is_string)
                && reference.get("sha256").is_some_and(Value::is_string) => {}
        Some(_) => problems.push(
            "field 'config_ref' must be null or an object with string 'path' and 'sha256'"
                .to_string(),
        ),
    }

    if object
        .get("stage")
        .and_then(Value::as_str)
        .is_some_and(|stage| stage.trim().is_empty())
    {
        problems.push("field 'stage' cannot be empty".to_string());
    }

    problems
}

impl Manifest {
    /// Parse a raw manifest, reporting structural problems as `SchemaError`.
    pub fn from_value(raw: Value, location: &str) -> Result<Self> {
        let problems = schema_violations(&raw);
        if !problems.is_empty() {
            return Err(PipelineError::schema(location, problems.join("; ")));
        }
        serde_json::from_value(raw).map_err(|err| PipelineError::schema(location, err.to_string()))
    }

    pub fn to_pretty_json(&self) -> Result<Vec<u8>> {
        let value = serde_json::to_value(self)
            .map_err(|err| PipelineError::serde(format!("manifest {}", self.artifact_id), err))?;
        serde_json::to_vec_pretty(&value)
            .map_err(|err| PipelineError::serde(format!("manifest {}", self.artifact_id), err))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample() -> Value {
        json!({
            "schema_version": 1,
            "artifact_id": "0".repeat(64),
            "stage": "datasets",
            "input_ids": [],
            "config": {"name": "tpch"},
            "config_hash": "ab",
            "config_ref": null,
            "code_ref": {"revision": "abc123", "dirty": false},
            "seeds": [7],
            "payload_sha256": "cd",
            "created_at": "2024-01-01T00:00:00Z",
            "producer_version": PRODUCER_VERSION,
        })
    }

    #[test]
    fn well_formed_manifest_parses() {
        let manifest = Manifest::from_value(sample(), "datasets/x").unwrap();
        assert_eq!(manifest.stage, "datasets");
        assert_eq!(manifest.seeds, vec![7]);
        assert!(manifest.replay_of.is_none());
    }

    #[test]
    fn missing_and_mistyped_fields_are_reported() {
        let mut raw = sample();
        let object = raw.as_object_mut().unwrap();
        object.remove("config_hash");
        object.insert("seeds".into(), json!("7"));

        let problems = schema_violations(&raw);
        assert!(problems.iter().any(|p| p.contains("'config_hash'")));
        assert!(problems.iter().any(|p| p.contains("'seeds' must be an array")));

        let err = Manifest::from_value(raw, "datasets/x").unwrap_err();
        assert_eq!(err.kind(), "SchemaError");
    }

    #[test]
    fn config_ref_pins_path_and_digest() {
        let mut raw = sample();
        raw["config_ref"] = json!({"path": "configs/tpch.yaml", "sha256": "ef"});
        let manifest = Manifest::from_value(raw.clone(), "datasets/x").unwrap();
        assert_eq!(
            manifest.config_ref,
            Some(ConfigRef::new("configs/tpch.yaml", "ef"))
        );

        raw["config_ref"] = json!("configs/tpch.yaml");
        let problems = schema_violations(&raw);
        assert!(problems.iter().any(|p| p.contains("'config_ref'")));
    }

    #[test]
    fn malformed_artifact_id_is_a_schema_error() {
        let mut raw = sample();
        raw["artifact_id"] = json!("not-an-id");
        let err = Manifest::from_value(raw, "datasets/x").unwrap_err();
        assert_eq!(err.kind(), "SchemaError");
    }
}
