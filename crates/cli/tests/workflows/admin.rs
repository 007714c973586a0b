//! Housekeeping commands: config, lock and cleanup

use crate::common::TestHost;
use crate::rampart;
use anyhow::Result;
use std::time::Duration;

#[test]
fn test_config_set_and_get() -> Result<()> {
    let host = TestHost::new()?;

    rampart!(host.config(), "config", "set", "retention.retention_days", "7").assert_success()?;
    let value = rampart!(host.config(), "config", "get", "retention.retention_days")
        .assert_success()?;
    assert_eq!(value.stdout.trim(), "7");

    let listed = rampart!(host.config(), "--json", "config", "list")
        .assert_success()?
        .json()?;
    assert_eq!(listed["retention.retention_days"], "7");
    assert_eq!(listed["timeouts.hook_timeout_secs"], "5");
    Ok(())
}

#[test]
fn test_config_rejects_out_of_range_values() -> Result<()> {
    let host = TestHost::new()?;

    let result = rampart!(host.config(), "config", "set", "timeouts.hook_timeout_secs", "0")
        .assert_failure()?;
    assert!(result.contains_stderr("Invalid configuration value"));

    rampart!(host.config(), "config", "get", "no.such_key").assert_failure()?;

    let value = rampart!(host.config(), "config", "get", "timeouts.hook_timeout_secs")
        .assert_success()?;
    assert_eq!(value.stdout.trim(), "5");
    Ok(())
}

#[test]
fn test_config_example_and_path() -> Result<()> {
    let host = TestHost::new()?;

    let example = rampart!(host.config(), "config", "example").assert_success()?;
    assert!(example.contains_stdout("[paths]"));
    assert!(example.contains_stdout("retention_days"));

    let path = rampart!(host.config(), "config", "path").assert_success()?;
    assert_eq!(path.stdout.trim(), host.config().display().to_string());
    Ok(())
}

#[test]
fn test_lock_reports_free_and_held() -> Result<()> {
    let host = TestHost::new()?;

    let free = rampart!(host.config(), "--json", "lock").assert_success()?.json()?;
    assert_eq!(free["state"], "free");
    assert_eq!(free["scope"], "host");

    let _held = host.locks().acquire("host", Duration::ZERO)?;
    let held = rampart!(host.config(), "--json", "lock").assert_success()?.json()?;
    assert_eq!(held["state"], "held");
    assert_eq!(held["pid"], std::process::id());

    let text = rampart!(host.config(), "lock").assert_success()?;
    assert!(text.contains_stdout("held"));
    Ok(())
}

#[test]
fn test_cleanup_with_nothing_to_do() -> Result<()> {
    let host = TestHost::new()?;

    let result = rampart!(host.config(), "cleanup").assert_success()?;
    assert!(result.contains_stdout("Cleanup Complete"));
    assert!(result.contains_stdout("nothing to remove"));
    Ok(())
}

#[test]
fn test_cleanup_purges_committed_backups() -> Result<()> {
    let host = TestHost::new()?;
    let locator = host.write_etc("sshd_config", "Port 22\n")?;
    let plan = host.write_plan(
        "plan.toml",
        &format!(
            r#"
[[target]]
id = "sshd_config"
kind = "file"
locator = "{locator}"
content = "Port 2222\n"
"#
        ),
    )?;
    rampart!(host.config(), "apply", "--plan", &plan, "--mode", "non-interactive")
        .assert_success()?;

    // Default retention keeps a fresh backup
    let kept = rampart!(host.config(), "--json", "cleanup").assert_success()?.json()?;
    assert_eq!(kept["records_deleted"], 0);

    std::thread::sleep(Duration::from_millis(20));
    let purged = rampart!(host.config(), "--json", "cleanup", "--retention-days", "0")
        .assert_success()?
        .json()?;
    assert_eq!(purged["records_deleted"], 1);
    assert_eq!(host.read_etc("sshd_config")?, "Port 2222\n");
    Ok(())
}
