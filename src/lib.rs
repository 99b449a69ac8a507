pub mod artifact;
pub mod error;
pub mod hashing;
pub mod lockfile;
pub mod manifest;
pub mod observability;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;
pub mod replay;
pub mod stages;
pub mod store;
pub mod validation;

pub use artifact::{Artifact, ArtifactId, MetricValue, Metrics};
pub use error::{PipelineError, Result};
pub use manifest::{CodeRef, ConfigRef, Manifest};
pub use orchestrator::{InputRef, Orchestrator, StageRequest};
pub use pipeline::PipelineDefinition;
pub use registry::{Determinism, RetryPolicy, StageError, StageExecutor, StageOutput, StageRegistry, StageSpec};
pub use replay::ReplayEngine;
pub use store::{ArtifactStore, PutRequest, StoreOptions};
pub use validation::{ValidationReport, Validator};
