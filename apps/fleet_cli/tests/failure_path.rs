use anyhow::Result;
use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::tempdir;

fn fleet(store: &std::path::Path) -> Result<Command> {
    let mut cmd = Command::cargo_bin("fleet")?;
    cmd.env("FLEET_CANCEL_GRACE_MS", "500")
        .arg("run")
        .arg("--executor")
        .arg("local")
        .arg("--store")
        .arg(store);
    Ok(cmd)
}

#[test]
fn failing_host_fails_the_job() -> Result<()> {
    let temp = tempdir()?;
    fleet(&temp.path().join("jobs.jsonl"))?
        .args(["--hosts", "ok,bad"])
        .args(["--command", "test \"$FLEET_HOST\" = ok || exit 3"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("[bad] failure (exit 3"))
        .stdout(predicate::str::contains("failed: success=1 failed=1 timeout=0 cancelled=0"));
    Ok(())
}

#[test]
fn slow_host_times_out() -> Result<()> {
    let temp = tempdir()?;
    fleet(&temp.path().join("jobs.jsonl"))?
        .args(["--hosts", "fast slow"])
        .args(["--command", "[ \"$FLEET_HOST\" = fast ] || exec sleep 30"])
        .args(["--per-host-timeout", "1", "--timeout", "60"])
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .failure()
        .stdout(predicate::str::contains("[slow] timeout"))
        .stdout(predicate::str::contains("success=1 failed=0 timeout=1 cancelled=0"));
    Ok(())
}

#[test]
fn job_timeout_cancels_waiting_hosts() -> Result<()> {
    let temp = tempdir()?;
    let store = temp.path().join("jobs.jsonl");
    fleet(&store)?
        .args(["--hosts", "a,b,c", "--command", "exec sleep 30"])
        .args(["--per-host-timeout", "30", "--timeout", "1", "--max-concurrency", "1"])
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .failure()
        .stdout(predicate::str::contains("timed_out: success=0 failed=0 timeout=1 cancelled=2"));

    let log = fs::read_to_string(&store)?;
    assert!(log.contains("\"status\":\"timed_out\""));
    Ok(())
}

#[test]
fn empty_host_list_is_rejected() -> Result<()> {
    let temp = tempdir()?;
    let store = temp.path().join("jobs.jsonl");
    fleet(&store)?
        .args(["--hosts", " , ;", "--command", "true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no target hosts"));

    let log = fs::read_to_string(&store).unwrap_or_default();
    assert!(!log.contains("job_created"));
    Ok(())
}

#[test]
fn unknown_job_lookup_fails() -> Result<()> {
    let temp = tempdir()?;
    let store = temp.path().join("jobs.jsonl");
    fleet(&store)?
        .args(["--hosts", "a", "--command", "true"])
        .assert()
        .success();

    Command::cargo_bin("fleet")?
        .args(["jobs", "show", "no-such-job", "--store"])
        .arg(&store)
        .assert()
        .failure()
        .stderr(predicate::str::contains("no-such-job"));
    Ok(())
}

#[test]
fn read_commands_need_an_existing_store() -> Result<()> {
    let temp = tempdir()?;
    let store = temp.path().join("state").join("jobs.jsonl");
    for args in [&["jobs", "list"][..], &["jobs", "show", "no-such-job"], &["metrics"]] {
        Command::cargo_bin("fleet")?
            .args(args)
            .arg("--store")
            .arg(&store)
            .assert()
            .failure()
            .stderr(predicate::str::contains("no job store at"));
    }
    assert!(!store.exists());
    assert!(!temp.path().join("state").exists());
    Ok(())
}
