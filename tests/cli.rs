use std::fs;
use std::path::Path;

use assert_cmd::Command;
use serde_json::Value;
use tempfile::tempdir;

const PIPELINE: &str = r#"
pipeline:
  - id: norm
    stage: normalize
    inputs: ["sample:S1"]
  - id: norm2
    stage: normalize
    params: { method: log, cofactor: 2.0 }
    inputs: ["sample:S2"]
  - id: clust
    stage: cluster
    params: { k: 2, seed: 3 }
    inputs: ["stage:norm"]
  - id: report
    stage: summarize
    inputs: ["stage:norm", "stage:clust"]
"#;

fn write_sample(path: &Path, shift: f64) {
    let mut csv = String::from("CD3,CD4,CD8\n");
    for i in 0..20 {
        let j = i as f64 * 0.25;
        csv.push_str(&format!("{},{},{}\n", 12.0 + j + shift, 150.0 - j, 4.0 + j));
        csv.push_str(&format!("{},{},{}\n", 240.0 - j + shift, 9.0 + j, 60.0 - j));
    }
    fs::write(path, csv).unwrap();
}

fn write_workspace(root: &Path, experiment: &str, pipeline: &str) -> std::path::PathBuf {
    fs::create_dir_all(root.join("samples")).unwrap();
    write_sample(&root.join("samples/S1.csv"), 0.0);
    write_sample(&root.join("samples/S2.csv"), 3.0);
    let manifest = root.join(format!("{experiment}.yaml"));
    fs::write(
        &manifest,
        format!(
            "version: 1\nexperiment: {experiment}\nowner: lab\nsamples:\n  - path: samples/*.csv\n    subject: donor-1\n{pipeline}"
        ),
    )
    .unwrap();
    manifest
}

fn cytoflow(store: &Path) -> Command {
    let mut cmd = Command::cargo_bin("cytoflow").expect("binary present");
    cmd.env_remove("CYTOFLOW_STORE")
        .env_remove("CYTOFLOW_WORKERS")
        .arg("--store")
        .arg(store);
    cmd
}

fn stdout(cmd: &mut Command) -> String {
    let output = cmd.assert().success().get_output().stdout.clone();
    String::from_utf8(output).unwrap()
}

#[test]
fn init_run_and_inspect_provenance() {
    let temp = tempdir().unwrap();
    let store = temp.path().join("store");
    let manifest = write_workspace(temp.path(), "pbmc", PIPELINE);

    cytoflow(&store).arg("validate").arg(&manifest).assert().success();
    let experiment_id = stdout(cytoflow(&store).arg("init").arg(&manifest));
    assert!(!experiment_id.trim().is_empty());

    let first = stdout(cytoflow(&store).args(["run", "pbmc"]));
    assert!(first.contains("SUCCEEDED"), "{first}");
    assert!(first.contains("COMPUTED"), "{first}");

    let second = stdout(cytoflow(&store).args(["run", "pbmc", "--parallelism", "serial"]));
    assert!(second.contains("CACHED"), "{second}");
    assert!(!second.contains("COMPUTED"), "{second}");

    let runs = stdout(cytoflow(&store).args(["runs", "pbmc"]));
    let run_ids: Vec<&str> = runs
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .collect();
    assert_eq!(run_ids.len(), 2);

    let json = stdout(cytoflow(&store).args(["provenance", run_ids[0], "--json"]));
    let provenance: Value = serde_json::from_str(&json).unwrap();
    assert_eq!(provenance["run"]["status"], "SUCCEEDED");
    assert_eq!(provenance["stages"].as_array().unwrap().len(), 4);

    let listing = stdout(cytoflow(&store).arg("experiments"));
    assert!(listing.contains("pbmc"));
    assert!(listing.contains("samples=2"));
}

#[test]
fn failed_runs_exit_non_zero() {
    let temp = tempdir().unwrap();
    let store = temp.path().join("store");
    let pipeline = r#"
pipeline:
  - id: norm
    stage: normalize
    inputs: ["sample:S1"]
  - id: cd19
    stage: gate
    params: { marker: CD19, threshold: 1.0 }
    inputs: ["stage:norm"]
  - id: again
    stage: normalize
    inputs: ["stage:cd19"]
  - id: other
    stage: normalize
    inputs: ["sample:S2"]
"#;
    let manifest = write_workspace(temp.path(), "broken", pipeline);
    cytoflow(&store).arg("init").arg(&manifest).assert().success();

    let output = cytoflow(&store).args(["run", "broken"]).assert().failure().get_output().clone();
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("first failure: cd19"), "{stdout}");
    assert!(stdout.contains("skipped: again"), "{stdout}");
}

#[test]
fn validate_rejects_unknown_stages() {
    let temp = tempdir().unwrap();
    let store = temp.path().join("store");
    let pipeline = "pipeline:\n  - id: x\n    stage: tsne\n    inputs: [\"sample:S1\"]\n";
    let manifest = write_workspace(temp.path(), "unknown", pipeline);
    cytoflow(&store).arg("validate").arg(&manifest).assert().failure();
}

#[test]
fn lock_list_stages_and_digest() {
    let temp = tempdir().unwrap();
    let store = temp.path().join("store");
    let manifest = write_workspace(temp.path(), "locked", PIPELINE);
    let lock_path = temp.path().join("out/pipeline.lock");

    cytoflow(&store)
        .arg("lock")
        .arg(&manifest)
        .arg(&lock_path)
        .assert()
        .success();
    let lock = fs::read_to_string(&lock_path).unwrap();
    assert!(lock.contains("experiment: locked"));
    assert_eq!(lock.matches("artifact_key:").count(), 4);

    let stages = stdout(cytoflow(&store).arg("list-stages"));
    for id in ["normalize@v1", "gate@v1", "cluster@v2", "embed@v1", "summarize@v1"] {
        assert!(stages.contains(id), "{id} missing from {stages}");
    }

    let digest = stdout(
        cytoflow(&store)
            .arg("digest")
            .arg("--path")
            .arg(temp.path().join("samples/S1.csv")),
    );
    let hash = digest.split_whitespace().next().unwrap();
    assert_eq!(hash.len(), 64);
}

#[test]
fn resume_requires_a_run_of_the_named_experiment() {
    let temp = tempdir().unwrap();
    let store = temp.path().join("store");
    let first = write_workspace(temp.path(), "first", PIPELINE);
    let second = write_workspace(temp.path(), "second", PIPELINE);
    cytoflow(&store).arg("init").arg(&first).assert().success();
    cytoflow(&store).arg("init").arg(&second).assert().success();
    cytoflow(&store).args(["run", "first"]).assert().success();

    let runs = stdout(cytoflow(&store).args(["runs", "first"]));
    let run_id = runs.split_whitespace().next().unwrap().to_string();

    let output = cytoflow(&store)
        .args(["run", "second", "--resume", &run_id])
        .assert()
        .failure()
        .get_output()
        .clone();
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("not 'second'"), "{stderr}");

    let resumed = stdout(cytoflow(&store).args(["run", "first", "--resume", &run_id]));
    assert!(resumed.contains("attempt 2"), "{resumed}");
}
