use assert_cmd::Command;
use predicates::prelude::*;
use std::error::Error;
use std::path::PathBuf;
use tempfile::tempdir;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests").join("fixtures").join(name)
}

fn xynet() -> Result<Command, Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("xynet")?;
    cmd.env_remove("XYNET_SEED").env_remove("RUST_LOG");
    Ok(cmd)
}

#[test]
fn compile_writes_netlist() -> Result<(), Box<dyn Error>> {
    let tmp = tempdir()?;
    let out = tmp.path().join("ring.cir");
    let mut cmd = xynet()?;
    cmd.arg("compile")
        .arg(fixture("ring.json"))
        .arg("-o")
        .arg(&out)
        .args(["--seed", "7", "--print", "cells.V[0]"]);
    cmd.assert().success().stdout(predicate::str::contains("seed 7"));

    let text = std::fs::read_to_string(&out)?;
    assert!(text.starts_with("* ring\n* seed: 7\n.tran 0.001 0.1\n"));
    assert!(text.contains("\n+ V(n2_V)\n.end\n"));
    assert_eq!(text.lines().filter(|l| l.starts_with("Bc")).count(), 9);
    Ok(())
}

#[test]
fn compile_is_deterministic_for_a_seed() -> Result<(), Box<dyn Error>> {
    let tmp = tempdir()?;
    let a = tmp.path().join("a.cir");
    let b = tmp.path().join("b.cir");
    for out in [&a, &b] {
        xynet()?
            .arg("compile")
            .arg(fixture("ring.json"))
            .arg("-o")
            .arg(out)
            .args(["--seed", "99"])
            .assert()
            .success();
    }
    assert_eq!(std::fs::read(&a)?, std::fs::read(&b)?);
    Ok(())
}

#[test]
fn compile_exports_metadata_and_adjacency() -> Result<(), Box<dyn Error>> {
    let tmp = tempdir()?;
    let out = tmp.path().join("ring.cir");
    let meta = tmp.path().join("ring.json");
    let adj = tmp.path().join("adjacency");
    xynet()?
        .arg("compile")
        .arg(fixture("ring.json"))
        .arg("-o")
        .arg(&out)
        .args(["--seed", "3"])
        .arg("--metadata")
        .arg(&meta)
        .arg("--adjacency-dir")
        .arg(&adj)
        .assert()
        .success();

    let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&meta)?)?;
    assert_eq!(json["seed"], 3);
    assert_eq!(json["serials"]["ring.cells"], serde_json::json!([2, 3, 4]));
    assert_eq!(json["connections"]["ring.syn"], 9);

    let matrix = std::fs::read_to_string(adj.join("ring_syn.tsv"))?;
    assert_eq!(matrix.lines().count(), 3);
    assert!(matrix.lines().all(|row| row.split('\t').count() == 3));
    Ok(())
}

#[test]
fn config_supplies_seed_and_outputs() -> Result<(), Box<dyn Error>> {
    let tmp = tempdir()?;
    let config = tmp.path().join("config.toml");
    std::fs::write(&config, "default_seed = 11\ndefault_outputs = [\"cells.V[2]\"]\n")?;
    let out = tmp.path().join("ring.cir");
    xynet()?
        .arg("--config")
        .arg(&config)
        .arg("compile")
        .arg(fixture("ring.json"))
        .arg("-o")
        .arg(&out)
        .assert()
        .success();
    let text = std::fs::read_to_string(&out)?;
    assert!(text.contains("* seed: 11\n"));
    assert!(text.contains("\n+ V(n4_V)\n"));
    Ok(())
}

#[test]
fn compile_missing_output_flag_fails() -> Result<(), Box<dyn Error>> {
    xynet()?
        .arg("compile")
        .arg(fixture("ring.json"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("--output"));
    Ok(())
}

#[test]
fn unknown_device_fails_without_netlist() -> Result<(), Box<dyn Error>> {
    let tmp = tempdir()?;
    let input = tmp.path().join("bad.json");
    std::fs::write(
        &input,
        r#"{ "name": "m", "parts": [ { "name": "cells", "metadata": { "device": "neuron9" } } ] }"#,
    )?;
    let out = tmp.path().join("bad.cir");
    xynet()?
        .arg("compile")
        .arg(&input)
        .arg("-o")
        .arg(&out)
        .assert()
        .failure()
        .stderr(predicate::str::contains("m.cells").and(predicate::str::contains("neuron9")));
    assert!(!out.exists());
    Ok(())
}

#[test]
fn bad_output_expression_fails() -> Result<(), Box<dyn Error>> {
    let tmp = tempdir()?;
    let out = tmp.path().join("ring.cir");
    xynet()?
        .arg("compile")
        .arg(fixture("ring.json"))
        .arg("-o")
        .arg(&out)
        .args(["--print", "cells.V[7]"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cells.V[7]"));
    assert!(!out.exists());
    Ok(())
}
