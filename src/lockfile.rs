use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactId;
use crate::error::{PipelineError, Result};
use crate::manifest::{CodeRef, ConfigRef, PRODUCER_VERSION};
use crate::orchestrator::Orchestrator;
use crate::pipeline::PipelineDefinition;

/// Snapshot of the ids every node of a definition resolves to. Diffing two
/// lockfiles shows which artifacts a change invalidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineLock {
    pub definition_version: u32,
    pub generated_at: DateTime<Utc>,
    pub producer_version: String,
    pub code_ref: CodeRef,
    pub nodes: BTreeMap<String, NodeLock>,
}

/// Resolved identity of one node. Only derived from the definition and its
/// config files, never from what a local store happens to hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLock {
    pub stage: String,
    pub artifact_id: ArtifactId,
    pub config_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_ref: Option<ConfigRef>,
    pub input_ids: Vec<ArtifactId>,
}

impl PipelineLock {
    /// Plan every node without executing anything.
    pub fn plan(definition: &PipelineDefinition, orchestrator: &Orchestrator) -> Result<Self> {
        let mut nodes = BTreeMap::new();
        for node in &definition.nodes {
            let request = definition.request_for(&node.name)?;
            let plan = orchestrator.plan(&request)?;
            let Some(target) = plan.nodes.iter().find(|n| n.artifact_id == plan.target) else {
                continue;
            };
            nodes.insert(
                node.name.clone(),
                NodeLock {
                    stage: target.stage.clone(),
                    artifact_id: target.artifact_id.clone(),
                    config_hash: target.config_hash.clone(),
                    config_ref: request.config_ref.clone(),
                    input_ids: target.input_ids.clone(),
                },
            );
        }

        Ok(Self {
            definition_version: definition.version,
            generated_at: Utc::now(),
            producer_version: PRODUCER_VERSION.to_string(),
            code_ref: orchestrator.store().code_ref().clone(),
            nodes,
        })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|err| PipelineError::io(path, err))?;
        serde_yaml::to_writer(file, self).map_err(|err| {
            PipelineError::config(format!("failed to write lockfile {}: {err}", path.display()))
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|err| PipelineError::io(path, err))?;
        serde_yaml::from_reader(file).map_err(|err| {
            PipelineError::config(format!("invalid lockfile {}: {err}", path.display()))
        })
    }

    /// Nodes whose id differs from `previous`, or that are new.
    pub fn changed_since<'a>(&'a self, previous: &PipelineLock) -> Vec<&'a str> {
        self.nodes
            .iter()
            .filter(|(name, lock)| {
                previous
                    .nodes
                    .get(*name)
                    .is_none_or(|old| old.artifact_id != lock.artifact_id)
            })
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

pub fn generate_lock(
    definition: &PipelineDefinition,
    orchestrator: &Orchestrator,
    path: &Path,
) -> Result<PipelineLock> {
    let lock = PipelineLock::plan(definition, orchestrator)?;
    lock.write(path)?;
    Ok(lock)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;

    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::hashing::sha256_bytes;
    use crate::store::ArtifactStore;

    const DEFINITION: &str = r#"
version: 1
stages:
  - {name: datasets, executor: materialize}
  - {name: plans, executor: merge, inputs: [datasets]}
nodes:
  - {name: tpch, stage: datasets, config: {name: tpch}}
  - {name: plan, stage: plans, config: {k: 2}, inputs: [tpch]}
"#;

    #[test]
    fn lock_round_trips_and_reports_changes() {
        let temp = tempdir().unwrap();
        let store = Arc::new(ArtifactStore::open(temp.path().join("artifacts")).unwrap());
        let definition = PipelineDefinition::from_yaml(DEFINITION).unwrap();
        let orchestrator = Orchestrator::new(store, Arc::new(definition.build_registry().unwrap()));

        let path = temp.path().join("pipeline.lock");
        let lock = generate_lock(&definition, &orchestrator, &path).unwrap();
        assert_eq!(lock.nodes.len(), 2);
        assert_eq!(lock.nodes["plan"].input_ids, vec![lock.nodes["tpch"].artifact_id.clone()]);

        let reloaded = PipelineLock::load(&path).unwrap();
        assert!(lock.changed_since(&reloaded).is_empty());

        let edited = PipelineDefinition::from_yaml(&DEFINITION.replace("name: tpch}", "name: ssb}"))
            .unwrap();
        let relocked = PipelineLock::plan(&edited, &orchestrator).unwrap();
        assert_eq!(relocked.changed_since(&lock), vec!["plan", "tpch"]);
    }

    #[tokio::test]
    async fn lock_does_not_depend_on_store_contents() {
        let temp = tempdir().unwrap();
        let store = Arc::new(ArtifactStore::open(temp.path().join("artifacts")).unwrap());
        let definition = PipelineDefinition::from_yaml(DEFINITION).unwrap();
        let orchestrator = Orchestrator::new(store, Arc::new(definition.build_registry().unwrap()));

        let before = PipelineLock::plan(&definition, &orchestrator).unwrap();
        orchestrator
            .build(&definition.request_for("plan").unwrap(), &CancellationToken::new())
            .await
            .unwrap();
        let after = PipelineLock::plan(&definition, &orchestrator).unwrap();
        assert_eq!(before.nodes, after.nodes);

        let rendered = serde_yaml::to_string(&after).unwrap();
        assert!(!rendered.contains("cached"));
    }

    #[test]
    fn config_files_are_pinned_by_digest() {
        let temp = tempdir().unwrap();
        let config = b"name: tpch\nscale: 0.1\n";
        fs::write(temp.path().join("tpch.yaml"), config).unwrap();
        let pipeline = temp.path().join("pipeline.yaml");
        fs::write(
            &pipeline,
            DEFINITION.replace("config: {name: tpch}", "config: tpch.yaml"),
        )
        .unwrap();
        let definition = PipelineDefinition::load(&pipeline).unwrap();
        let store = Arc::new(ArtifactStore::open(temp.path().join("artifacts")).unwrap());
        let orchestrator = Orchestrator::new(store, Arc::new(definition.build_registry().unwrap()));

        let path = temp.path().join("pipeline.lock");
        let lock = generate_lock(&definition, &orchestrator, &path).unwrap();
        let pinned = lock.nodes["tpch"].config_ref.clone().unwrap();
        assert_eq!(pinned, ConfigRef::new("tpch.yaml", sha256_bytes(config)));
        assert_eq!(PipelineLock::load(&path).unwrap().nodes["tpch"].config_ref, Some(pinned));
    }
}
