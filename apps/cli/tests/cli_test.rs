//! Binary-level tests for `tandem`.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn tandem(workdir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("tandem").unwrap();
    cmd.current_dir(workdir.path()).env("HOME", workdir.path()).env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_help() {
    let temp = TempDir::new().unwrap();
    tandem(&temp)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--resume"))
        .stdout(predicate::str::contains("--device"));
}

#[test]
fn test_no_tasks_exits_with_error() {
    let temp = TempDir::new().unwrap();
    tandem(&temp).assert().failure().stderr(predicate::str::contains("No tasks found"));
    assert!(!temp.path().join("models").exists());
}

#[test]
fn test_image_demo_writes_checkpoint() {
    let temp = TempDir::new().unwrap();
    std::fs::write(
        temp.path().join("train_image.toml"),
        "[tasks.task_optimize_image]\niterations = 3\n",
    )
    .unwrap();

    tandem(&temp)
        .args(["--seed", "5", "--log-level", "warn"])
        .assert()
        .success()
        .stdout(predicate::str::contains("saved Image"));

    let checkpoints: Vec<_> = std::fs::read_dir(temp.path().join("models"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(checkpoints.iter().any(|n| n.starts_with("Image-") && n.ends_with(".ckpt")));
    assert!(checkpoints.iter().any(|n| n == "run_manifest.json"));
}

#[test]
fn test_filter_skips_unmatched_manifests() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("train_image.toml"), "").unwrap();
    tandem(&temp)
        .arg("audio")
        .assert()
        .failure()
        .stderr(predicate::str::contains("No tasks found"));
}

#[test]
fn test_unknown_module_is_fatal() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("train_audio.toml"), "").unwrap();
    tandem(&temp).assert().failure().stderr(predicate::str::contains("unknown task module"));
}

#[test]
fn test_invalid_device() {
    let temp = TempDir::new().unwrap();
    tandem(&temp).args(["--device", "tpu"]).assert().failure();
}
