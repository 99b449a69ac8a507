use std::fs;
use std::path::Path;

use assert_cmd::Command;
use provenant::hashing::sha256_bytes;
use tempfile::tempdir;

const PIPELINE: &str = r#"
version: 1
stages:
  - name: datasets
    executor: materialize
    schema: {name: string}
  - name: plans
    executor: merge
    inputs: [datasets]
nodes:
  - name: tpch
    stage: datasets
    config: tpch.yaml
  - name: plan
    stage: plans
    config: {planner: simple}
    inputs: [tpch]
"#;

const TPCH_CONFIG: &str = "name: tpch\nscale: 1\n";

fn write_project(dir: &Path) {
    fs::write(dir.join("pipeline.yaml"), PIPELINE).unwrap();
    fs::write(dir.join("tpch.yaml"), TPCH_CONFIG).unwrap();
}

fn provenant(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("provenant").expect("binary present");
    cmd.current_dir(dir)
        .env_remove("PIPELINE_ARTIFACTS_ROOT")
        .env_remove("PIPELINE_FILE")
        .env("PIPELINE_CODE_REF", "0a1b2c3");
    cmd
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.output().unwrap();
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).unwrap()
}

#[test]
fn build_is_repeatable_and_validates() {
    let temp = tempdir().unwrap();
    write_project(temp.path());

    let first = stdout_of(provenant(temp.path()).arg("build"));
    let second = stdout_of(provenant(temp.path()).arg("build"));
    assert_eq!(first, second);
    assert!(first.starts_with("plan\t"));
    assert_eq!(fs::read_dir(temp.path().join("artifacts/datasets")).unwrap().count(), 1);
    assert_eq!(fs::read_dir(temp.path().join("artifacts/plans")).unwrap().count(), 1);

    let report = stdout_of(provenant(temp.path()).arg("validate"));
    assert!(report.contains("Validated 2 artifact(s)"));

    Command::cargo_bin("validate-artifacts")
        .expect("binary present")
        .current_dir(temp.path())
        .env_remove("PIPELINE_ARTIFACTS_ROOT")
        .assert()
        .success();
}

#[test]
fn stage_subcommand_matches_pipeline_build() {
    let temp = tempdir().unwrap();
    write_project(temp.path());

    let built = stdout_of(provenant(temp.path()).args(["build", "tpch"]));
    let direct = stdout_of(provenant(temp.path()).args(["datasets", "--config", "tpch.yaml"]));

    assert_eq!(built.trim(), format!("tpch\t{}", direct.trim()));
    let manifest = stdout_of(provenant(temp.path()).args(["show", direct.trim()]));
    assert!(manifest.contains("\"path\": \"tpch.yaml\""), "{manifest}");
    assert!(manifest.contains(&sha256_bytes(TPCH_CONFIG.as_bytes())));
    assert!(manifest.contains("0a1b2c3"));
}

#[test]
fn unknown_stage_is_a_config_error() {
    let temp = tempdir().unwrap();
    write_project(temp.path());

    let output = provenant(temp.path())
        .args(["circuits", "--config", "missing.yaml"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error[ConfigError]"), "{stderr}");
    assert!(stderr.contains("Available stages: datasets, plans"), "{stderr}");
}

#[test]
fn plan_and_lock_do_not_execute() {
    let temp = tempdir().unwrap();
    write_project(temp.path());

    let plan = stdout_of(provenant(temp.path()).arg("plan"));
    assert!(plan.contains("pending"));
    assert!(!temp.path().join("artifacts/plans").exists());

    provenant(temp.path()).arg("lock").assert().success();
    let lock = fs::read_to_string(temp.path().join("pipeline.lock")).unwrap();
    assert!(lock.contains("tpch:"));
    assert!(lock.contains("path: tpch.yaml"), "{lock}");
    assert!(lock.contains(&sha256_bytes(TPCH_CONFIG.as_bytes())));
    assert!(!lock.contains("cached"));

    let built = stdout_of(provenant(temp.path()).arg("build"));
    let target = built.trim().split('\t').nth(1).unwrap().to_string();
    assert!(plan.starts_with(&format!("plan\t{target}")));
}

#[test]
fn validate_reports_tampered_manifest() {
    let temp = tempdir().unwrap();
    write_project(temp.path());
    let id = stdout_of(provenant(temp.path()).args(["datasets", "--config", "tpch.yaml"]));
    let manifest_path = temp
        .path()
        .join("artifacts/datasets")
        .join(id.trim())
        .join("manifest.json");
    let edited = fs::read_to_string(&manifest_path)
        .unwrap()
        .replace("\"tpch\"", "\"ssb\"");
    fs::write(&manifest_path, edited).unwrap();

    let output = provenant(temp.path()).arg("validate").output().unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("error[HashMismatch]"));

    Command::cargo_bin("validate-artifacts")
        .expect("binary present")
        .current_dir(temp.path())
        .env_remove("PIPELINE_ARTIFACTS_ROOT")
        .assert()
        .failure();
}

#[test]
fn validate_reports_incomplete_directories_without_removing_them() {
    let temp = tempdir().unwrap();
    write_project(temp.path());
    stdout_of(provenant(temp.path()).arg("build"));
    let incomplete = temp.path().join("artifacts/plans").join("c".repeat(64));
    fs::create_dir_all(&incomplete).unwrap();
    fs::write(incomplete.join("payload.json"), b"{}").unwrap();

    let output = provenant(temp.path()).arg("validate").output().unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("error[SchemaError]"));

    Command::cargo_bin("validate-artifacts")
        .expect("binary present")
        .current_dir(temp.path())
        .env_remove("PIPELINE_ARTIFACTS_ROOT")
        .env("RUST_LOG", "off")
        .assert()
        .failure();
    assert!(incomplete.join("payload.json").is_file());
}

#[test]
fn gc_keeps_recent_staging_by_default() {
    let temp = tempdir().unwrap();
    write_project(temp.path());
    stdout_of(provenant(temp.path()).arg("build"));
    let in_flight = temp.path().join("artifacts/.staging/plans.0a1b2c3d4e5f.4242.0");
    fs::create_dir_all(&in_flight).unwrap();

    let report = stdout_of(provenant(temp.path()).arg("gc"));
    assert!(report.contains("\"removed_staging\":0"), "{report}");
    assert!(in_flight.exists());

    let report = stdout_of(provenant(temp.path()).args(["gc", "--grace-secs", "0"]));
    assert!(report.contains("\"removed_staging\":1"), "{report}");
    assert!(!in_flight.exists());
}
