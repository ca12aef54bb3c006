use assert_cmd::Command;
use predicates::prelude::*;
use std::error::Error;
use std::path::PathBuf;
use tempfile::tempdir;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests").join("fixtures").join(name)
}

#[test]
fn verify_accepts_fixture() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("xynet")?;
    cmd.arg("verify").arg(fixture("ring.json")).arg("--print");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Verification OK"))
        .stdout(predicate::str::contains("connect syn (A -> cells, B -> cells) {"));
    Ok(())
}

#[test]
fn verify_rejects_duplicate_parts() -> Result<(), Box<dyn Error>> {
    let tmp = tempdir()?;
    let input = tmp.path().join("dup.toml");
    std::fs::write(
        &input,
        "name = \"m\"\n\n[[parts]]\nname = \"cells\"\n\n[[parts]]\nname = \"cells\"\n",
    )?;
    let mut cmd = Command::cargo_bin("xynet")?;
    cmd.arg("verify").arg(&input);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("duplicate part name"));
    Ok(())
}

#[test]
fn devices_lists_registry() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("xynet")?;
    cmd.arg("devices");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("neuron1"))
        .stdout(predicate::str::contains("neuron2"))
        .stdout(predicate::str::contains("synapse1 (connection)"));

    let mut cmd = Command::cargo_bin("xynet")?;
    cmd.args(["devices", "--detailed"]);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("internals: N, M, H"))
        .stdout(predicate::str::contains("GMAX // Maximal conductance"));
    Ok(())
}
