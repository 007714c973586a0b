//! `rampart restore-point` create, list, restore and delete

use crate::common::TestHost;
use crate::rampart;
use anyhow::Result;
use std::fs;

fn two_target_plan(host: &TestHost) -> Result<String> {
    let sshd = host.write_etc("sshd_config", "Port 22\n")?;
    let jail = host.write_etc("jail.local", "[sshd]\nenabled = true\n")?;
    host.write_plan(
        "baseline.toml",
        &format!(
            r#"
[[target]]
id = "sshd_config"
kind = "file"
locator = "{sshd}"

[[target]]
id = "fail2ban-jail"
kind = "file"
locator = "{jail}"
criticality = "advisory"
"#
        ),
    )
}

#[test]
fn test_create_list_restore_delete() -> Result<()> {
    let host = TestHost::new()?;
    let plan = two_target_plan(&host)?;

    let created = rampart!(
        host.config(),
        "--json",
        "restore-point",
        "create",
        "before-caprover",
        "--plan",
        &plan,
        "-d",
        "baseline before installing caprover"
    )
    .assert_success()?
    .json()?;
    let id = created["id"].as_str().unwrap_or_default().to_string();
    assert!(id.starts_with("before-caprover_"));
    assert_eq!(created["records"], 2);
    assert_eq!(host.restore_point_count(), 1);

    let listed = rampart!(host.config(), "restore-point", "list").assert_success()?;
    assert!(listed.contains_stdout(&id));
    assert!(listed.contains_stdout("baseline before installing caprover"));

    // Somebody edits both files by hand
    fs::write(host.etc("sshd_config"), "Port 2222\n")?;
    fs::remove_file(host.etc("jail.local"))?;

    let restored = rampart!(
        host.config(),
        "--json",
        "restore-point",
        "restore",
        "before-caprover",
        "--yes"
    )
    .assert_success()?
    .json()?;
    assert_eq!(restored["restored"].as_array().map(Vec::len), Some(2));
    assert_eq!(host.read_etc("sshd_config")?, "Port 22\n");
    assert_eq!(host.read_etc("jail.local")?, "[sshd]\nenabled = true\n");

    rampart!(host.config(), "restore-point", "delete", &id).assert_success()?;
    assert_eq!(host.restore_point_count(), 0);

    let empty = rampart!(host.config(), "restore-point", "list").assert_success()?;
    assert!(empty.contains_stdout("No restore points"));
    Ok(())
}

#[test]
fn test_restore_requires_confirmation_without_terminal() -> Result<()> {
    let host = TestHost::new()?;
    let plan = two_target_plan(&host)?;
    rampart!(host.config(), "restore-point", "create", "baseline", "--plan", &plan)
        .assert_success()?;
    fs::write(host.etc("sshd_config"), "Port 2222\n")?;

    let result = rampart!(host.config(), "restore-point", "restore", "baseline").assert_failure()?;

    assert!(result.contains_stderr("--yes"));
    assert_eq!(host.read_etc("sshd_config")?, "Port 2222\n");
    Ok(())
}

#[test]
fn test_create_fails_for_missing_target() -> Result<()> {
    let host = TestHost::new()?;
    let missing = host.etc("does-not-exist.conf");
    let plan = host.write_plan(
        "plan.toml",
        &format!(
            r#"
[[target]]
id = "ghost"
kind = "file"
locator = "{}"
"#,
            missing.display()
        ),
    )?;

    rampart!(host.config(), "restore-point", "create", "ghost", "--plan", &plan)
        .assert_failure()?;

    // A failed snapshot leaves nothing behind
    assert_eq!(host.restore_point_count(), 0);
    Ok(())
}

#[test]
fn test_restore_unknown_point_fails() -> Result<()> {
    let host = TestHost::new()?;
    rampart!(host.config(), "restore-point", "restore", "nope", "--yes").assert_failure()?;
    rampart!(host.config(), "restore-point", "delete", "nope").assert_failure()?;
    Ok(())
}
