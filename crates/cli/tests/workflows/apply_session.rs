//! `rampart apply` against real files and shell hooks

use crate::common::TestHost;
use crate::rampart;
use anyhow::Result;
use std::time::Duration;

const SSHD_OLD: &str = "Port 22\nPermitRootLogin yes\n";
const SSHD_NEW: &str = "Port 2222\nPermitRootLogin no\n";

fn sshd_plan(host: &TestHost, content: &str) -> Result<String> {
    let locator = host.write_etc("sshd_config", SSHD_OLD)?;
    host.write_plan(
        "plan.toml",
        &format!(
            r#"
[[target]]
id = "sshd_config"
kind = "file"
locator = "{locator}"
content = """{content}"""
validate = "! grep -q BROKEN {{path}}"
"#
        ),
    )
}

#[test]
fn test_non_interactive_apply_commits() -> Result<()> {
    let host = TestHost::new()?;
    let plan = sshd_plan(&host, SSHD_NEW)?;

    let result = rampart!(host.config(), "apply", "--plan", &plan, "--mode", "non-interactive")
        .assert_success()?;

    assert!(result.contains_stdout("sshd_config"));
    assert!(result.contains_stdout("committed"));
    assert_eq!(host.read_etc("sshd_config")?, SSHD_NEW);
    assert!(result.duration < Duration::from_secs(30));
    Ok(())
}

#[test]
fn test_failed_validation_restores_original() -> Result<()> {
    let host = TestHost::new()?;
    let plan = sshd_plan(&host, "Port 2222\nBROKEN\n")?;

    let result =
        rampart!(host.config(), "apply", "--plan", &plan, "--mode", "non-interactive")
            .assert_failure()?;

    assert!(result.contains_stderr("sshd_config"));
    assert_eq!(host.read_etc("sshd_config")?, SSHD_OLD);

    let sessions = rampart!(host.config(), "--json", "sessions").assert_success()?.json()?;
    assert_eq!(sessions[0]["status"], "rolled_back");
    Ok(())
}

#[test]
fn test_dry_run_leaves_files_alone() -> Result<()> {
    let host = TestHost::new()?;
    let plan = sshd_plan(&host, SSHD_NEW)?;

    let result = rampart!(host.config(), "apply", "--plan", &plan, "--mode", "dry-run")
        .assert_success()?;

    assert!(result.contains_stdout("+Port 2222"));
    assert!(result.contains_stdout("-Port 22"));
    assert!(result.contains_stdout("valid"));
    assert_eq!(host.read_etc("sshd_config")?, SSHD_OLD);
    Ok(())
}

#[test]
fn test_dry_run_reports_invalid_content() -> Result<()> {
    let host = TestHost::new()?;
    let plan = sshd_plan(&host, "BROKEN\n")?;

    let result = rampart!(host.config(), "apply", "--plan", &plan, "--mode", "dry-run")
        .assert_failure()?;

    assert!(result.contains_stdout("sshd_config"));
    assert!(result.contains_stderr("failed"));
    assert_eq!(host.read_etc("sshd_config")?, SSHD_OLD);
    Ok(())
}

#[test]
fn test_plan_mode_used_without_flag() -> Result<()> {
    let host = TestHost::new()?;
    let locator = host.write_etc("jail.local", "[sshd]\nenabled = false\n")?;
    let plan = host.write_plan(
        "plan.toml",
        &format!(
            r#"
mode = "dry_run"

[[target]]
id = "fail2ban-jail"
kind = "file"
locator = "{locator}"
content = "[sshd]\nenabled = true\n"
"#
        ),
    )?;

    let result = rampart!(host.config(), "--json", "apply", "--plan", &plan).assert_success()?;
    let report = result.json()?;

    assert_eq!(report["mode"], "dry_run");
    assert_eq!(report["dry_run"][0]["target_id"], "fail2ban-jail");
    assert_eq!(host.read_etc("jail.local")?, "[sshd]\nenabled = false\n");
    Ok(())
}

#[test]
fn test_advisory_ruleset_failure_is_a_warning() -> Result<()> {
    let host = TestHost::new()?;
    let sshd = host.write_etc("sshd_config", SSHD_OLD)?;
    let rules = host.write_etc("ufw.rules", "allow 22/tcp\n")?;
    let plan = host.write_plan(
        "plan.toml",
        &format!(
            r#"
[[target]]
id = "ufw-rules"
kind = "ruleset"
locator = "{rules}"
criticality = "advisory"
content = "allow 2222/tcp\nconflict\n"
read = "cat {{path}}"
write = "! grep -q conflict {{path}} && cp {{path}} '{rules}'"

[[target]]
id = "sshd_config"
kind = "file"
locator = "{sshd}"
content = """{SSHD_NEW}"""
"#
        ),
    )?;

    let result = rampart!(
        host.config(),
        "--json",
        "apply",
        "--plan",
        &plan,
        "--mode",
        "non-interactive"
    )
    .assert_success()?;
    let report = result.json()?;

    assert_eq!(report["status"], "committed");
    assert_eq!(report["changes"][0]["target_id"], "ufw-rules");
    assert_eq!(report["changes"][0]["state"], "rolled_back");
    assert_eq!(report["changes"][1]["state"], "committed");
    assert!(report["warnings"][0]
        .as_str()
        .is_some_and(|w| w.starts_with("ufw-rules")));

    assert_eq!(host.read_etc("ufw.rules")?, "allow 22/tcp\n");
    assert_eq!(host.read_etc("sshd_config")?, SSHD_NEW);
    Ok(())
}

#[test]
fn test_apply_fails_while_lock_is_held() -> Result<()> {
    let host = TestHost::new()?;
    let plan = sshd_plan(&host, SSHD_NEW)?;
    let _held = host.locks().acquire("host", Duration::ZERO)?;

    let result = rampart!(
        host.config(),
        "apply",
        "--plan",
        &plan,
        "--mode",
        "non-interactive",
        "--lock-timeout",
        "0"
    )
    .assert_failure()?;

    assert!(result.contains_stderr("still held"));
    assert_eq!(host.read_etc("sshd_config")?, SSHD_OLD);
    Ok(())
}

#[test]
fn test_separate_scope_is_not_blocked() -> Result<()> {
    let host = TestHost::new()?;
    let plan = sshd_plan(&host, SSHD_NEW)?;
    let _held = host.locks().acquire("firewall", Duration::ZERO)?;

    rampart!(
        host.config(),
        "apply",
        "--plan",
        &plan,
        "--mode",
        "non-interactive"
    )
    .assert_success()?;

    assert_eq!(host.read_etc("sshd_config")?, SSHD_NEW);
    Ok(())
}

#[test]
fn test_session_history() -> Result<()> {
    let host = TestHost::new()?;
    let plan = sshd_plan(&host, SSHD_NEW)?;
    rampart!(host.config(), "apply", "--plan", &plan, "--mode", "non-interactive")
        .assert_success()?;

    let sessions = rampart!(host.config(), "--json", "sessions").assert_success()?.json()?;
    let id = sessions[0]["id"].as_str().unwrap_or_default().to_string();
    assert_eq!(sessions[0]["status"], "committed");
    assert_eq!(id.len(), 26);

    let shown = rampart!(host.config(), "--json", "session", &id[..10])
        .assert_success()?
        .json()?;
    assert_eq!(shown["id"], id.as_str());
    assert_eq!(shown["changes"][0]["target_id"], "sshd_config");
    assert_eq!(shown["changes"][0]["state"], "committed");
    assert_eq!(shown["changes"][0]["proposed_bytes"], SSHD_NEW.len());

    let text = rampart!(host.config(), "session", &id[..10]).assert_success()?;
    assert!(text.contains_stdout("sshd_config"));
    assert!(text.contains_stdout("backup"));
    Ok(())
}

#[test]
fn test_unknown_session_fails() -> Result<()> {
    let host = TestHost::new()?;
    let result = rampart!(host.config(), "session", "01ZZZZ").assert_failure()?;
    assert!(result.contains_stderr("Session not found"));
    Ok(())
}

#[test]
fn test_invalid_plan_is_rejected() -> Result<()> {
    let host = TestHost::new()?;
    let plan = host.write_plan(
        "plan.toml",
        r#"
[[target]]
id = "fw"
kind = "ruleset"
locator = "ufw"
content = "allow 22"
"#,
    )?;

    rampart!(host.config(), "apply", "--plan", &plan, "--mode", "non-interactive")
        .assert_failure()?;
    let sessions = rampart!(host.config(), "--json", "sessions").assert_success()?.json()?;
    assert_eq!(sessions.as_array().map(Vec::len), Some(0));
    Ok(())
}

/// Plan whose validation keeps the session open for a few seconds
fn slow_plan(host: &TestHost) -> Result<String> {
    let locator = host.write_etc("sshd_config", SSHD_OLD)?;
    host.write_plan(
        "slow.toml",
        &format!(
            r#"
[[target]]
id = "sshd_config"
kind = "file"
locator = "{locator}"
content = """{SSHD_NEW}"""
validate = "sleep 3"
"#
        ),
    )
}

#[test]
fn test_concurrent_apply_times_out_on_host_lock() -> Result<()> {
    let host = TestHost::new()?;
    let plan = slow_plan(&host)?;

    let first = rampart!(host.config(), "apply", "--plan", &plan, "--mode", "non-interactive")
        .spawn()?;
    std::thread::sleep(Duration::from_millis(800));

    let second = rampart!(
        host.config(),
        "apply",
        "--plan",
        &plan,
        "--mode",
        "non-interactive",
        "--lock-timeout",
        "1"
    )
    .assert_failure()?;
    assert!(second.contains_stderr("still held"), "stderr: {}", second.stderr);

    let first = first.wait()?;
    assert!(first.success(), "stderr: {}", first.stderr);
    assert_eq!(host.read_etc("sshd_config")?, SSHD_NEW);
    Ok(())
}

#[test]
fn test_queued_apply_runs_after_current_session() -> Result<()> {
    let host = TestHost::new()?;
    let plan = slow_plan(&host)?;

    let first = rampart!(host.config(), "apply", "--plan", &plan, "--mode", "non-interactive")
        .spawn()?;
    std::thread::sleep(Duration::from_millis(800));

    let second = rampart!(
        host.config(),
        "apply",
        "--plan",
        &plan,
        "--mode",
        "non-interactive",
        "--lock-timeout",
        "20"
    )
    .assert_success()?;
    assert!(second.duration >= Duration::from_secs(1));
    assert!(first.wait()?.success());

    let sessions = rampart!(host.config(), "--json", "sessions").assert_success()?.json()?;
    assert_eq!(sessions.as_array().map(Vec::len), Some(2));
    assert_eq!(sessions[0]["status"], "committed");
    assert_eq!(sessions[1]["status"], "committed");
    Ok(())
}

#[test]
fn test_history_waits_for_running_session() -> Result<()> {
    let host = TestHost::new()?;
    let plan = slow_plan(&host)?;

    let running = rampart!(host.config(), "apply", "--plan", &plan, "--mode", "non-interactive")
        .spawn()?;
    std::thread::sleep(Duration::from_millis(800));

    let sessions = rampart!(host.config(), "--json", "sessions").assert_success()?.json()?;
    assert!(running.wait()?.success());
    assert_eq!(sessions[0]["status"], "committed");
    Ok(())
}
