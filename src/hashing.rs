//! Canonical serialization and identifier derivation.
//!
//! Canonical JSON: object keys sorted by byte order, no whitespace, floats with
//! an integral value inside +/-2^53 written as integers (`-0.0` becomes `0`),
//! every other float in shortest round-trip form. The artifact id preimage is a
//! length-prefixed encoding of stage, canonical config, ordered input ids and
//! the sorted seed set, so no two distinct tuples share a preimage.

use serde_json::{Number, Value};
use sha2::{Digest, Sha256};

use crate::artifact::ArtifactId;
use crate::error::{PipelineError, Result};

const ID_DOMAIN: &[u8] = b"provenant/artifact-id/v1\n";
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Canonical byte form of a configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalJson(Vec<u8>);

impl CanonicalJson {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Only ever built from `String`s.
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

pub fn canonicalize(value: &Value) -> Result<CanonicalJson> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(CanonicalJson(out.into_bytes()))
}

fn write_canonical(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => write_number(n, out)?,
        Value::String(s) => write_string(s, out)?,
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
            out.push('{');
            for (idx, (key, item)) in entries.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_string(key, out)?;
                out.push(':');
                write_canonical(item, out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn write_string(s: &str, out: &mut String) -> Result<()> {
    let escaped = serde_json::to_string(s).map_err(|err| PipelineError::serde("string", err))?;
    out.push_str(&escaped);
    Ok(())
}

fn write_number(n: &Number, out: &mut String) -> Result<()> {
    if let Some(i) = n.as_i64() {
        out.push_str(&i.to_string());
        return Ok(());
    }
    if let Some(u) = n.as_u64() {
        out.push_str(&u.to_string());
        return Ok(());
    }
    let f = n
        .as_f64()
        .filter(|f| f.is_finite())
        .ok_or_else(|| PipelineError::config(format!("number {n} has no canonical form")))?;
    if f.fract() == 0.0 && f.abs() < MAX_EXACT_INTEGER {
        out.push_str(&(f as i64).to_string());
    } else {
        let rendered = serde_json::to_string(&f).map_err(|err| PipelineError::serde("float", err))?;
        out.push_str(&rendered);
    }
    Ok(())
}

/// Sorted, de-duplicated view of a seed set.
pub fn normalize_seeds(seeds: &[u64]) -> Vec<u64> {
    let mut seeds = seeds.to_vec();
    seeds.sort_unstable();
    seeds.dedup();
    seeds
}

pub fn derive_id(
    stage: &str,
    config: &CanonicalJson,
    input_ids: &[ArtifactId],
    seeds: &[u64],
) -> ArtifactId {
    let mut hasher = Sha256::new();
    hasher.update(ID_DOMAIN);
    update_field(&mut hasher, stage.as_bytes());
    update_field(&mut hasher, config.as_bytes());
    hasher.update((input_ids.len() as u64).to_be_bytes());
    for id in input_ids {
        update_field(&mut hasher, id.as_str().as_bytes());
    }
    let seeds = normalize_seeds(seeds);
    hasher.update((seeds.len() as u64).to_be_bytes());
    for seed in seeds {
        hasher.update(seed.to_be_bytes());
    }
    ArtifactId::from_digest(format!("{:x}", hasher.finalize()))
}

fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

/// Derive an id straight from a config value.
pub fn derive_id_for(
    stage: &str,
    config: &Value,
    input_ids: &[ArtifactId],
    seeds: &[u64],
) -> Result<ArtifactId> {
    Ok(derive_id(stage, &canonicalize(config)?, input_ids, seeds))
}

pub fn config_hash(config: &Value) -> Result<String> {
    Ok(sha256_bytes(canonicalize(config)?.as_bytes()))
}

pub fn sha256_bytes(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;

    fn id(stage: &str, config: Value, inputs: &[ArtifactId], seeds: &[u64]) -> ArtifactId {
        derive_id_for(stage, &config, inputs, seeds).unwrap()
    }

    #[test]
    fn canonical_form_sorts_keys_recursively() {
        let value = json!({"b": 1, "a": {"z": [3, 2], "y": null}});
        let canonical = canonicalize(&value).unwrap();
        assert_eq!(canonical.as_str(), r#"{"a":{"y":null,"z":[3,2]},"b":1}"#);
    }

    #[test]
    fn integral_floats_collapse_to_integers() {
        assert_eq!(canonicalize(&json!(1.0)).unwrap().as_str(), "1");
        assert_eq!(canonicalize(&json!(-0.0)).unwrap().as_str(), "0");
        assert_eq!(canonicalize(&json!(0.1)).unwrap().as_str(), "0.1");
        assert_eq!(canonicalize(&json!(1e300)).unwrap().as_str(), "1e300");
    }

    #[test]
    fn object_key_order_does_not_change_the_id() {
        let a: Value = serde_json::from_str(r#"{"shots": 1024, "name": "sim"}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"name": "sim", "shots": 1024}"#).unwrap();
        assert_eq!(id("jobs", a, &[], &[]), id("jobs", b, &[], &[]));
    }

    #[test]
    fn input_order_changes_the_id() {
        let x = id("datasets", json!({"n": 1}), &[], &[]);
        let y = id("datasets", json!({"n": 2}), &[], &[]);
        let forward = id("plans", json!({}), &[x.clone(), y.clone()], &[]);
        let backward = id("plans", json!({}), &[y, x], &[]);
        assert_ne!(forward, backward);
    }

    #[test]
    fn seeds_form_a_set() {
        let a = id("circuits", json!({}), &[], &[3, 1, 1]);
        let b = id("circuits", json!({}), &[], &[1, 3]);
        let c = id("circuits", json!({}), &[], &[1]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn field_boundaries_are_unambiguous() {
        let a = id("ab", json!("c"), &[], &[]);
        let b = id("a", json!("bc"), &[], &[]);
        assert_ne!(a, b);
    }

    #[test]
    fn ids_are_stable_across_runs() {
        let first = id("datasets", json!({"rows": 100, "name": "tpch"}), &[], &[7]);
        let second = id("datasets", json!({"name": "tpch", "rows": 100}), &[], &[7]);
        assert_eq!(first, second);
        assert_eq!(first.as_str().len(), 64);
    }

    #[test]
    fn generated_corpus_has_no_collisions() {
        let mut seen: HashMap<ArtifactId, String> = HashMap::new();
        let stages = ["datasets", "workload_instances", "circuits"];
        for stage in stages {
            for shots in 0..40u64 {
                for depth in 0..10u64 {
                    for variant in ["grover", "mlae", "qfilter"] {
                        let config = json!({
                            "kernel": variant,
                            "shots": shots,
                            "depth": depth,
                            "ratio": (shots as f64) / 7.0,
                        });
                        let label = format!("{stage}:{config}");
                        let derived = id(stage, config, &[], &[depth % 3]);
                        if let Some(previous) = seen.insert(derived.clone(), label.clone()) {
                            panic!("collision between {previous} and {label}");
                        }
                    }
                }
            }
        }
        assert_eq!(seen.len(), 3 * 40 * 10 * 3);
    }

    #[test]
    fn sha256_of_known_input() {
        assert_eq!(
            sha256_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
