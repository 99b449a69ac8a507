use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use futures::future::try_join_all;
use provenant::lockfile::generate_lock;
use provenant::observability::{MetricsCollector, log_snapshot};
use provenant::pipeline::{PipelineDefinition, load_config};
use provenant::store::{ArtifactStore, StoreOptions};
use provenant::validation::Validator;
use provenant::{
    ArtifactId, CodeRef, Orchestrator, PipelineError, ReplayEngine, StageRegistry, StageRequest,
};
use serde_json::to_writer_pretty;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = configure_tracing(cli.otlp_endpoint.as_deref()) {
        eprintln!("error: {err:#}");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("error: failed to start runtime: {err}");
            return ExitCode::FAILURE;
        }
    };
    let result = runtime.block_on(run(cli));

    #[cfg(feature = "otel")]
    opentelemetry::global::shutdown_tracer_provider();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report_error(&err);
            ExitCode::FAILURE
        }
    }
}

/// Print the error with its typed kind when the chain carries one.
fn report_error(err: &anyhow::Error) {
    let kind = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<PipelineError>())
        .map(PipelineError::kind)
        .unwrap_or("Error");
    error!(kind, "{err:#}");
    eprintln!("error[{kind}]: {err:#}");
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                    vec![KeyValue::new("service.name", "provenant")],
                )))
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .install_simple()?;

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
            return Ok(());
        }
    }

    #[cfg(not(feature = "otel"))]
    {
        if let Some(endpoint) = otlp_endpoint {
            eprintln!(
                "warning: --otlp-endpoint '{endpoint}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel."
            );
        }
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let context = CliContext::new(&cli)?;
    match cli.command {
        Commands::Build {
            nodes,
            print_metrics,
            metrics_json,
            metrics_prometheus,
        } => {
            let metrics = build_nodes(&context, nodes).await?;
            emit_metrics(&metrics, print_metrics, metrics_json, metrics_prometheus)
        }
        Commands::Plan { nodes, json } => plan_nodes(&context, nodes, json),
        Commands::Lock { output } => {
            let definition = context.definition()?;
            let orchestrator = context.orchestrator()?;
            let lock = generate_lock(definition, &orchestrator, &output)
                .with_context(|| format!("Failed to lock pipeline into {}", output.display()))?;
            info!(
                lockfile = %output.display(),
                nodes = lock.nodes.len(),
                "Lockfile written"
            );
            Ok(())
        }
        Commands::Validate {
            stage,
            target,
            json,
            shallow,
        } => validate(&context, stage, target, json, shallow),
        Commands::Replay { from, target, node } => {
            replay(&context, from, target, node).await
        }
        Commands::List { stage } => list(&context, stage),
        Commands::Show { id, payload } => show(&context, &id, payload),
        Commands::ListStages => {
            list_stages(&context.registry()?);
            Ok(())
        }
        Commands::Gc { grace_secs } => {
            let grace = grace_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| context.staging_grace());
            let store = context.open_store_without_sweep()?;
            let report = store.gc_staging(grace)?;
            info!(
                removed_staging = report.removed_staging,
                removed_incomplete = report.removed_incomplete,
                "Garbage collection finished"
            );
            println!("{}", serde_json::to_string(&report)?);
            Ok(())
        }
        Commands::Stage(args) => run_stage(&context, args).await,
    }
}

/// Shared handles derived from the global flags.
struct CliContext {
    artifacts_root: PathBuf,
    pipeline_path: PathBuf,
    code_ref: CodeRef,
    definition: Option<PipelineDefinition>,
}

impl CliContext {
    fn new(cli: &Cli) -> Result<Self> {
        let definition = if cli.pipeline.is_file() {
            Some(PipelineDefinition::load(&cli.pipeline).with_context(|| {
                format!("Failed to load pipeline definition: {}", cli.pipeline.display())
            })?)
        } else {
            None
        };
        let code_ref = match &cli.code_ref {
            Some(revision) => CodeRef::revision(revision.clone()),
            None => detect_code_ref(),
        };
        Ok(Self {
            artifacts_root: cli.artifacts_root.clone(),
            pipeline_path: cli.pipeline.clone(),
            code_ref,
            definition,
        })
    }

    fn definition(&self) -> Result<&PipelineDefinition> {
        self.definition.as_ref().ok_or_else(|| {
            anyhow!(
                "pipeline definition not found: {} (set --pipeline or PIPELINE_FILE)",
                self.pipeline_path.display()
            )
        })
    }

    fn registry(&self) -> Result<StageRegistry> {
        match &self.definition {
            Some(definition) => Ok(definition.build_registry()?),
            None => Ok(StageRegistry::new()),
        }
    }

    fn store_options(&self) -> StoreOptions {
        match &self.definition {
            Some(definition) => definition.execution.store_options(self.code_ref.clone()),
            None => StoreOptions {
                code_ref: self.code_ref.clone(),
                ..StoreOptions::default()
            },
        }
    }

    fn staging_grace(&self) -> Duration {
        self.store_options().staging_grace
    }

    fn open_store(&self) -> Result<Arc<ArtifactStore>> {
        self.open_store_with(self.store_options())
    }

    fn open_store_without_sweep(&self) -> Result<Arc<ArtifactStore>> {
        self.open_store_with(StoreOptions {
            sweep_on_open: false,
            ..self.store_options()
        })
    }

    fn open_store_with(&self, options: StoreOptions) -> Result<Arc<ArtifactStore>> {
        let store = ArtifactStore::open_with(&self.artifacts_root, options).with_context(|| {
            format!("Failed to open artifact store: {}", self.artifacts_root.display())
        })?;
        Ok(Arc::new(store))
    }

    /// For commands that only read: never creates the root or sweeps leftovers.
    fn read_store(&self) -> ArtifactStore {
        ArtifactStore::open_read_only(&self.artifacts_root)
    }

    fn orchestrator(&self) -> Result<Orchestrator> {
        Ok(Orchestrator::new(self.open_store()?, Arc::new(self.registry()?)))
    }
}

fn detect_code_ref() -> CodeRef {
    let revision = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string())
        .filter(|revision| !revision.is_empty());
    let Some(revision) = revision else {
        return CodeRef::default();
    };
    let dirty = Command::new("git")
        .args(["status", "--porcelain", "--untracked-files=no"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .is_some_and(|output| !output.stdout.is_empty());
    CodeRef {
        revision: Some(revision),
        dirty,
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling pending stage invocations");
            trigger.cancel();
        }
    });
    token
}

fn selected_nodes(definition: &PipelineDefinition, nodes: Vec<String>) -> Vec<String> {
    if nodes.is_empty() {
        definition.targets().into_iter().map(str::to_string).collect()
    } else {
        nodes
    }
}

async fn build_nodes(context: &CliContext, nodes: Vec<String>) -> Result<MetricsCollector> {
    let definition = context.definition()?;
    let orchestrator = context.orchestrator()?;
    let nodes = selected_nodes(definition, nodes);
    if nodes.is_empty() {
        warn!("Pipeline defines no nodes. Nothing to build.");
        return Ok(orchestrator.metrics());
    }

    let requests = nodes
        .iter()
        .map(|name| definition.request_for(name).map(|request| (name, request)))
        .collect::<provenant::Result<Vec<_>>>()?;
    let cancel = cancel_on_ctrl_c();
    let built = try_join_all(requests.iter().map(|(name, request)| {
        let orchestrator = &orchestrator;
        let cancel = &cancel;
        async move {
            orchestrator
                .build(request, cancel)
                .await
                .with_context(|| format!("Failed to build node '{name}'"))
        }
    }))
    .await?;

    for ((name, _), artifact) in requests.iter().zip(&built) {
        info!(node = %name, stage = %artifact.stage, id = %artifact.id, "Node ready");
        println!("{name}\t{}", artifact.id);
    }
    let stats = orchestrator.store().stats();
    info!(
        published = stats.published,
        deduplicated = stats.deduplicated,
        "Build finished"
    );
    Ok(orchestrator.metrics())
}

fn emit_metrics(
    metrics: &MetricsCollector,
    print_metrics: bool,
    metrics_json: Option<PathBuf>,
    metrics_prometheus: Option<PathBuf>,
) -> Result<()> {
    let snapshot = metrics.snapshot();
    if print_metrics {
        log_snapshot(&snapshot);
    }
    if let Some(path) = metrics_json {
        ensure_parent(&path)?;
        let file = File::create(&path)
            .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
        to_writer_pretty(file, &snapshot)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = metrics_prometheus {
        ensure_parent(&path)?;
        fs::write(&path, snapshot.to_prometheus()).with_context(|| {
            format!("Failed to write Prometheus metrics: {}", path.display())
        })?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn plan_nodes(context: &CliContext, nodes: Vec<String>, json: bool) -> Result<()> {
    let definition = context.definition()?;
    let orchestrator = context.orchestrator()?;
    let mut plans = Vec::new();
    for name in selected_nodes(definition, nodes) {
        let request = definition.request_for(&name)?;
        let plan = orchestrator
            .plan(&request)
            .with_context(|| format!("Failed to plan node '{name}'"))?;
        plans.push((name, plan));
    }

    if json {
        let rendered: serde_json::Map<String, serde_json::Value> = plans
            .iter()
            .map(|(name, plan)| -> Result<(String, serde_json::Value)> {
                Ok((name.clone(), serde_json::to_value(plan)?))
            })
            .collect::<Result<_>>()?;
        println!("{}", serde_json::to_string_pretty(&rendered)?);
        return Ok(());
    }
    for (name, plan) in &plans {
        println!("{name}\t{}", plan.target);
        for node in &plan.nodes {
            let status = if node.cached { "cached" } else { "pending" };
            println!("  {status:<8}{:<24}{}", node.stage, node.artifact_id);
        }
    }
    Ok(())
}

fn validate(
    context: &CliContext,
    stage: Option<String>,
    target: Option<String>,
    json: Option<PathBuf>,
    shallow: bool,
) -> Result<()> {
    let store = context.read_store();
    let mut validator = Validator::new(&store);
    if shallow {
        validator = validator.shallow();
    }
    let report = match (stage, target.as_deref()) {
        (Some(stage), None | Some("all")) => validator.validate_stage(&stage)?,
        (None, None | Some("all")) => validator.validate_all()?,
        (None, Some(id)) => validator.validate_artifact(&id.parse::<ArtifactId>()?)?,
        (Some(_), Some(_)) => bail!("--stage cannot be combined with an artifact id"),
    };

    if let Some(path) = json {
        ensure_parent(&path)?;
        report.write_json(&path)?;
        info!(report = %path.display(), "Validation report written");
    }
    for warning in &report.warnings {
        warn!("{warning}");
    }
    for failure in report.failures() {
        for violation in &failure.violations {
            println!(
                "- {}/{}: {:?}: {}",
                failure.stage, failure.artifact_id, violation.kind, violation.message
            );
        }
    }
    for entry in &report.unpublished {
        println!("- {}/{}: SchemaError: {}", entry.stage, entry.name, entry.message);
    }
    println!(
        "Validated {} artifact(s) under {}: {} failed",
        report.checked,
        store.root().display(),
        report.failed
    );
    report.into_result()?;
    Ok(())
}

async fn replay(
    context: &CliContext,
    from: String,
    target: Option<String>,
    node: Option<String>,
) -> Result<()> {
    let from: ArtifactId = from.parse()?;
    let orchestrator = context.orchestrator()?;
    let request = match (target, node) {
        (Some(id), None) => StageRequest::from_lineage(orchestrator.store(), &id.parse()?)?,
        (None, Some(node)) => context.definition()?.request_for(&node)?,
        _ => bail!("replay needs exactly one of --target <ID> or --node <NAME>"),
    };
    let cancel = cancel_on_ctrl_c();
    let artifact = ReplayEngine::new(orchestrator)
        .replay(&request, &from, &cancel)
        .await
        .with_context(|| format!("Failed to replay '{}' from {from}", request.stage))?;
    println!("{}", artifact.id);
    Ok(())
}

fn list(context: &CliContext, stage: Option<String>) -> Result<()> {
    let store = context.read_store();
    let stages = match stage {
        Some(stage) => vec![stage],
        None => store.stages()?,
    };
    for stage in stages {
        for id in store.list(&stage)? {
            println!("{stage}\t{id}");
        }
    }
    Ok(())
}

fn show(context: &CliContext, id: &str, payload: bool) -> Result<()> {
    let store = context.read_store();
    let artifact = store.get(&id.parse()?)?;
    let rendered = if payload {
        serde_json::to_string_pretty(&artifact.payload)?
    } else {
        serde_json::to_string_pretty(&artifact.manifest)?
    };
    println!("{rendered}");
    Ok(())
}

fn list_stages(registry: &StageRegistry) {
    for stage in registry.iter() {
        let spec = &stage.spec;
        let inputs = if spec.inputs.is_empty() {
            "-".to_string()
        } else {
            spec.inputs.join(",")
        };
        println!(
            "{}\tinputs={}\tdeterminism={:?}",
            spec.name, inputs, spec.determinism
        );
    }
}

/// `provenant <stage> --config <path> [--input <id>]... [--seed N]...`
#[derive(Parser, Debug)]
struct StageArgs {
    /// YAML or JSON stage configuration.
    #[arg(long)]
    config: PathBuf,
    /// Input artifact ids, in the order the stage declares them.
    #[arg(long = "input")]
    inputs: Vec<String>,
    #[arg(long = "seed")]
    seeds: Vec<u64>,
}

async fn run_stage(context: &CliContext, args: Vec<String>) -> Result<()> {
    let stage = args
        .first()
        .cloned()
        .ok_or_else(|| anyhow!("missing stage name"))?;
    let parsed = StageArgs::try_parse_from(&args)?;
    let orchestrator = context.orchestrator()?;
    // Fail on unknown stages before touching any config file.
    orchestrator.registry().get(&stage)?;

    let (config, config_ref) = load_config(&parsed.config, parsed.config.display().to_string())?;
    let mut request = StageRequest::new(stage.clone(), config)
        .with_config_ref(config_ref)
        .with_seeds(parsed.seeds);
    for input in &parsed.inputs {
        request = request.with_artifact(input.parse()?);
    }

    let cancel = cancel_on_ctrl_c();
    let artifact = orchestrator
        .build(&request, &cancel)
        .await
        .with_context(|| format!("Stage '{stage}' failed"))?;
    println!("{}", artifact.id);
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "provenant",
    version,
    about = "Content-addressed artifact pipeline with provenance tracking"
)]
struct Cli {
    /// Root directory of the artifact store.
    #[arg(
        long,
        global = true,
        env = "PIPELINE_ARTIFACTS_ROOT",
        default_value = "artifacts"
    )]
    artifacts_root: PathBuf,
    /// Pipeline definition file.
    #[arg(long, global = true, env = "PIPELINE_FILE", default_value = "pipeline.yaml")]
    pipeline: PathBuf,
    /// Code revision recorded in manifests; detected from git when unset.
    #[arg(long, global = true, env = "PIPELINE_CODE_REF")]
    code_ref: Option<String>,
    #[arg(long = "otlp-endpoint", global = true)]
    otlp_endpoint: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build pipeline nodes (default: every node nothing else consumes).
    Build {
        nodes: Vec<String>,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
    },
    /// Show the ids a build would produce without executing anything.
    Plan {
        nodes: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Write a lockfile with every node's planned artifact id.
    Lock {
        #[arg(long, default_value = "pipeline.lock")]
        output: PathBuf,
    },
    /// Check stored artifacts for schema, hash and reference problems.
    Validate {
        #[arg(long)]
        stage: Option<String>,
        /// Artifact id, or `all`.
        target: Option<String>,
        #[arg(long)]
        json: Option<PathBuf>,
        /// Skip recursive validation of inputs.
        #[arg(long)]
        shallow: bool,
    },
    /// Re-derive downstream artifacts from a pinned upstream artifact.
    Replay {
        #[arg(long)]
        from: String,
        /// Stored artifact whose lineage is replayed.
        #[arg(long, conflicts_with = "node")]
        target: Option<String>,
        /// Pipeline node to replay.
        #[arg(long)]
        node: Option<String>,
    },
    List {
        stage: Option<String>,
    },
    Show {
        id: String,
        /// Print the payload instead of the manifest.
        #[arg(long)]
        payload: bool,
    },
    ListStages,
    /// Remove orphaned staging and incomplete artifact directories.
    Gc {
        /// Only remove leftovers older than this. Defaults to the pipeline's
        /// staging grace (900 seconds unless configured).
        #[arg(long)]
        grace_secs: Option<u64>,
    },
    /// Run one declared stage: `<stage> --config <path> [--input <id>]... [--seed N]...`
    #[command(external_subcommand)]
    Stage(Vec<String>),
}
