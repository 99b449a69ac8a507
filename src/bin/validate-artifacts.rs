//! CI entry point: validate every stored artifact and fail on any violation.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use provenant::store::ArtifactStore;
use provenant::validation::Validator;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, prelude::*};

#[derive(Parser)]
#[command(
    name = "validate-artifacts",
    version,
    about = "Validate on-disk artifacts against their manifests"
)]
struct Args {
    #[arg(long, env = "PIPELINE_ARTIFACTS_ROOT", default_value = "artifacts")]
    artifacts_root: PathBuf,
    /// Write the full report as JSON.
    #[arg(long)]
    json: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();

    if !args.artifacts_root.is_dir() {
        println!("No artifacts found under {}", args.artifacts_root.display());
        return ExitCode::SUCCESS;
    }

    let store = ArtifactStore::open_read_only(&args.artifacts_root);
    let report = match Validator::new(&store).validate_all() {
        Ok(report) => report,
        Err(err) => {
            error!(kind = err.kind(), "{err}");
            eprintln!("error[{}]: {err}", err.kind());
            return ExitCode::FAILURE;
        }
    };

    if let Some(path) = &args.json
        && let Err(err) = report.write_json(path)
    {
        eprintln!("error[{}]: {err}", err.kind());
        return ExitCode::FAILURE;
    }

    if report.is_ok() {
        info!(checked = report.checked, "Artifacts validated");
        println!(
            "Validated {} artifacts under {}",
            report.checked,
            args.artifacts_root.display()
        );
        return ExitCode::SUCCESS;
    }

    println!("Artifact validation failed:");
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
    ExitCode::FAILURE
}
