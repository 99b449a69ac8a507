use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PipelineError;
use crate::manifest::Manifest;

/// Hex-encoded SHA-256 identifier of an artifact.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactId(String);

pub const ARTIFACT_ID_LEN: usize = 64;

impl ArtifactId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form used in log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }

    pub(crate) fn from_digest(hex: String) -> Self {
        debug_assert!(is_valid_id(&hex));
        ArtifactId(hex)
    }
}

fn is_valid_id(value: &str) -> bool {
    value.len() == ARTIFACT_ID_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

impl FromStr for ArtifactId {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if is_valid_id(trimmed) {
            Ok(ArtifactId(trimmed.to_string()))
        } else {
            Err(PipelineError::config(format!(
                "'{value}' is not an artifact id (expected {ARTIFACT_ID_LEN} lowercase hex characters)"
            )))
        }
    }
}

impl TryFrom<String> for ArtifactId {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ArtifactId> for String {
    fn from(id: ArtifactId) -> Self {
        id.0
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single metric reported by a stage executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Number(value)
    }
}

impl From<u64> for MetricValue {
    fn from(value: u64) -> Self {
        MetricValue::Number(value as f64)
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        MetricValue::Text(value.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(value: String) -> Self {
        MetricValue::Text(value)
    }
}

pub type Metrics = BTreeMap<String, MetricValue>;

/// An immutable, published pipeline output.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub id: ArtifactId,
    pub stage: String,
    pub payload: Value,
    pub metrics: Metrics,
    pub manifest: Manifest,
}

impl Artifact {
    pub fn input_ids(&self) -> &[ArtifactId] {
        &self.manifest.input_ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_only_lowercase_hex_of_full_length() {
        let valid = "a".repeat(ARTIFACT_ID_LEN);
        assert!(valid.parse::<ArtifactId>().is_ok());
        assert!("A".repeat(ARTIFACT_ID_LEN).parse::<ArtifactId>().is_err());
        assert!("abc".parse::<ArtifactId>().is_err());
        assert!(
            format!("{}g", "a".repeat(ARTIFACT_ID_LEN - 1))
                .parse::<ArtifactId>()
                .is_err()
        );
    }

    #[test]
    fn metric_values_serialize_untagged() {
        let mut metrics = Metrics::new();
        metrics.insert("shots".into(), MetricValue::from(1024u64));
        metrics.insert("backend".into(), MetricValue::from("sim"));
        let json = serde_json::to_string(&metrics).unwrap();
        assert_eq!(json, r#"{"backend":"sim","shots":1024.0}"#);
    }
}
