//! Re-derives downstream artifacts from a pinned upstream artifact.
//!
//! Every node of the target tree whose stage matches the pinned artifact's
//! stage is replaced by that artifact. Deterministic nodes downstream of a pin
//! are re-executed regardless of the cache; when the recomputed id is already
//! stored its payload must match. Non-deterministic stages are never run.

use futures::future::{BoxFuture, FutureExt, try_join_all};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::artifact::{Artifact, ArtifactId};
use crate::error::{PipelineError, Result};
use crate::hashing::{canonicalize, derive_id_for, sha256_bytes};
use crate::manifest::ManifestExtras;
use crate::orchestrator::{InputRef, Orchestrator, StageRequest, put_request};
use crate::store::ArtifactStore;

/// Outcome for one node of the replayed tree.
struct Replayed {
    artifact: Artifact,
    /// Id the node has in the lineage that produced the target naturally.
    natural: ArtifactId,
    /// Depends on a pinned artifact.
    downstream: bool,
}

#[derive(Debug, Clone)]
pub struct ReplayEngine {
    orchestrator: Orchestrator,
}

impl ReplayEngine {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }

    /// Rebuild `target` with every node of `from`'s stage pinned to `from`.
    pub async fn replay(
        &self,
        target: &StageRequest,
        from: &ArtifactId,
        cancel: &CancellationToken,
    ) -> Result<Artifact> {
        let pinned = self.orchestrator.fetch(from.clone()).await?;
        if !self.reaches(target, &pinned.stage)? {
            return Err(PipelineError::config(format!(
                "no node of the '{}' request consumes stage '{}'",
                target.stage, pinned.stage
            )));
        }
        info!(
            target = %target.stage,
            pinned_stage = %pinned.stage,
            pinned = %pinned.id.short(),
            "Replaying from pinned artifact"
        );
        let replayed = self.replay_node(target, &pinned, cancel).await?;
        Ok(replayed.artifact)
    }

    /// Replay the full lineage of a stored artifact from `from`.
    pub async fn replay_artifact(
        &self,
        target: &ArtifactId,
        from: &ArtifactId,
        cancel: &CancellationToken,
    ) -> Result<Artifact> {
        let request = StageRequest::from_lineage(self.orchestrator.store(), target)?;
        self.replay(&request, from, cancel).await
    }

    fn reaches(&self, request: &StageRequest, stage: &str) -> Result<bool> {
        if request.stage == stage {
            return Ok(true);
        }
        for input in &request.inputs {
            let found = match input {
                InputRef::Request(upstream) => self.reaches(upstream, stage)?,
                InputRef::Artifact(id) => stored_stage(self.orchestrator.store(), id)? == stage,
            };
            if found {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn replay_input<'a>(
        &'a self,
        input: &'a InputRef,
        pinned: &'a Artifact,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Replayed>> {
        async move {
            match input {
                InputRef::Request(upstream) => self.replay_node(upstream, pinned, cancel).await,
                InputRef::Artifact(id) => {
                    let artifact = self.orchestrator.fetch(id.clone()).await?;
                    if artifact.stage == pinned.stage {
                        Ok(Replayed {
                            natural: artifact.id,
                            artifact: pinned.clone(),
                            downstream: true,
                        })
                    } else {
                        Ok(Replayed {
                            natural: artifact.id.clone(),
                            artifact,
                            downstream: false,
                        })
                    }
                }
            }
        }
        .boxed()
    }

    fn replay_node<'a>(
        &'a self,
        request: &'a StageRequest,
        pinned: &'a Artifact,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Replayed>> {
        async move {
            let stage = request.stage.as_str();
            if stage == pinned.stage {
                return Ok(Replayed {
                    natural: natural_id(request)?,
                    artifact: pinned.clone(),
                    downstream: true,
                });
            }
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled {
                    stage: stage.to_string(),
                });
            }
            let registered = self.orchestrator.prepare(request)?;

            let resolved = try_join_all(
                request
                    .inputs
                    .iter()
                    .map(|input| self.replay_input(input, pinned, cancel)),
            )
            .await?;
            let downstream = resolved.iter().any(|node| node.downstream);
            let natural_inputs: Vec<ArtifactId> =
                resolved.iter().map(|node| node.natural.clone()).collect();
            let inputs: Vec<Artifact> = resolved.into_iter().map(|node| node.artifact).collect();
            registered.spec.check_inputs(&inputs)?;

            let input_ids: Vec<ArtifactId> = inputs.iter().map(|a| a.id.clone()).collect();
            let id = derive_id_for(stage, &request.config, &input_ids, &request.seeds)?;
            let natural = derive_id_for(stage, &request.config, &natural_inputs, &request.seeds)?;
            let deterministic = registered.spec.determinism.is_deterministic();

            let stored = self.orchestrator.exists(id.clone()).await?;
            if !deterministic {
                if !stored {
                    return Err(PipelineError::NonReplayableStage {
                        stage: stage.to_string(),
                        id,
                    });
                }
                debug!(stage, id = %id.short(), "Reusing stored non-deterministic artifact");
                let artifact = self.orchestrator.fetch(id).await?;
                return Ok(Replayed {
                    artifact,
                    natural,
                    downstream,
                });
            }
            if !downstream && stored {
                let artifact = self.orchestrator.fetch(id).await?;
                return Ok(Replayed {
                    artifact,
                    natural,
                    downstream,
                });
            }

            let _slot = self.orchestrator.lock(&id, stage, cancel).await?;
            let output = self
                .orchestrator
                .execute(&registered, &request.config, inputs, cancel)
                .await?;

            if self.orchestrator.exists(id.clone()).await? {
                let existing = self.orchestrator.fetch(id.clone()).await?;
                if downstream {
                    let replayed = sha256_bytes(canonicalize(&output.payload)?.as_bytes());
                    if replayed != existing.manifest.payload_sha256 {
                        return Err(PipelineError::ReplayDivergence {
                            stage: stage.to_string(),
                            id,
                            stored: existing.manifest.payload_sha256,
                            replayed,
                        });
                    }
                    debug!(stage, id = %id.short(), "Replayed payload matches stored artifact");
                }
                return Ok(Replayed {
                    artifact: existing,
                    natural,
                    downstream,
                });
            }

            let mut extras = ManifestExtras::default();
            if downstream && natural != id && self.orchestrator.exists(natural.clone()).await? {
                extras.replay_of = Some(natural.clone());
            }
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled {
                    stage: stage.to_string(),
                });
            }
            let artifact = self
                .orchestrator
                .publish(put_request(request, input_ids, output, extras))
                .await?;
            info!(
                stage,
                id = %artifact.id.short(),
                replay_of = artifact.manifest.replay_of.as_ref().map(ArtifactId::short),
                "Replayed artifact published"
            );
            Ok(Replayed {
                artifact,
                natural,
                downstream,
            })
        }
        .boxed()
    }
}

fn stored_stage(store: &ArtifactStore, id: &ArtifactId) -> Result<String> {
    store
        .locate(id)
        .ok_or_else(|| PipelineError::NotFound { id: id.clone() })
}

/// Id of a request computed from its own inputs, no pins applied.
fn natural_id(request: &StageRequest) -> Result<ArtifactId> {
    let mut inputs = Vec::with_capacity(request.inputs.len());
    for input in &request.inputs {
        inputs.push(match input {
            InputRef::Artifact(id) => id.clone(),
            InputRef::Request(upstream) => natural_id(upstream)?,
        });
    }
    derive_id_for(&request.stage, &request.config, &inputs, &request.seeds)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn natural_id_matches_direct_derivation() {
        let upstream = StageRequest::new("results_raw", json!({"shots": 10}));
        let request = StageRequest::new("results_curated", json!({"drop": 0.1}))
            .with_upstream(upstream.clone());
        let upstream_id = derive_id_for("results_raw", &json!({"shots": 10}), &[], &[]).unwrap();
        let expected =
            derive_id_for("results_curated", &json!({"drop": 0.1}), &[upstream_id], &[]).unwrap();
        assert_eq!(natural_id(&request).unwrap(), expected);
    }
}
