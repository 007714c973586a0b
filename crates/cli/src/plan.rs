//! Plan files: the targets a run touches and how to handle each one
//!
//! ```toml
//! [[target]]
//! id = "sshd_config"
//! kind = "file"
//! locator = "/etc/ssh/sshd_config"
//! criticality = "critical"
//! proposed = "sshd_config.new"
//! validate = "sshd -t -f {path}"
//! reload = "systemctl reload ssh"
//! health_port = 2222
//! ```
//!
//! Relative `proposed` paths resolve against the plan file's directory.

use crate::adapters::{CommandAdapter, TargetHooks};
use anyhow::{Context, Result};
use rampart_core::{AdapterRegistry, Criticality, Target, TargetKind};
use rampart_journal::{ExecutionMode, PlannedChange};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    /// Mode used when `--mode` is not given
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(rename = "target", default)]
    pub targets: Vec<PlanTarget>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanTarget {
    pub id: String,
    pub kind: TargetKind,
    pub locator: String,
    #[serde(default = "default_criticality")]
    pub criticality: Criticality,
    /// File holding the new content
    #[serde(default)]
    pub proposed: Option<PathBuf>,
    /// New content given inline
    #[serde(default)]
    pub content: Option<String>,
    /// Hook commands; `{path}` is replaced with the file they act on
    #[serde(default)]
    pub read: Option<String>,
    #[serde(default)]
    pub write: Option<String>,
    #[serde(default)]
    pub validate: Option<String>,
    #[serde(default)]
    pub reload: Option<String>,
    /// Local TCP port that must accept connections after a reload
    #[serde(default)]
    pub health_port: Option<u16>,
}

fn default_criticality() -> Criticality {
    Criticality::Critical
}

impl PlanTarget {
    pub fn target(&self) -> Target {
        Target::new(&self.id, self.kind, &self.locator, self.criticality)
    }

    pub fn hooks(&self) -> TargetHooks {
        TargetHooks {
            read: self.read.clone(),
            write: self.write.clone(),
            validate: self.validate.clone(),
            reload: self.reload.clone(),
            health_port: self.health_port,
        }
    }
}

impl Plan {
    /// Parse a plan and resolve its relative paths
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan {}", path.display()))?;
        let mut plan = Self::parse(&text)
            .with_context(|| format!("Invalid plan {}", path.display()))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for target in &mut plan.targets {
            if let Some(proposed) = &target.proposed {
                if proposed.is_relative() {
                    target.proposed = Some(base.join(proposed));
                }
            }
        }
        Ok(plan)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let plan: Plan = toml::from_str(text)?;
        plan.check()?;
        Ok(plan)
    }

    fn check(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for target in &self.targets {
            target.target().check_id()?;
            if !seen.insert(target.id.as_str()) {
                anyhow::bail!("Target '{}' is listed twice", target.id);
            }
            if target.proposed.is_some() && target.content.is_some() {
                anyhow::bail!(
                    "Target '{}' sets both 'proposed' and 'content'",
                    target.id
                );
            }
            if target.kind != TargetKind::File && target.read.is_none() {
                anyhow::bail!(
                    "Target '{}' is a {} and needs a 'read' hook",
                    target.id,
                    target.kind
                );
            }
            if target.kind != TargetKind::File && target.write.is_none() {
                anyhow::bail!(
                    "Target '{}' is a {} and needs a 'write' hook",
                    target.id,
                    target.kind
                );
            }
        }
        Ok(())
    }

    /// `mode` from the plan, if any
    pub fn mode(&self) -> Result<Option<ExecutionMode>> {
        self.mode
            .as_deref()
            .map(|m| m.parse::<ExecutionMode>().map_err(anyhow::Error::msg))
            .transpose()
    }

    pub fn targets(&self) -> Vec<Target> {
        self.targets.iter().map(PlanTarget::target).collect()
    }

    /// Changes in plan order; every target must carry new content
    pub fn changes(&self) -> Result<Vec<PlannedChange>> {
        self.targets
            .iter()
            .map(|t| -> Result<PlannedChange> {
                let proposed = match (&t.proposed, &t.content) {
                    (Some(path), None) => std::fs::read(path).with_context(|| {
                        format!("Failed to read proposed content for '{}' from {}", t.id, path.display())
                    })?,
                    (None, Some(content)) => content.as_bytes().to_vec(),
                    _ => anyhow::bail!("Target '{}' has no proposed content", t.id),
                };
                Ok(PlannedChange {
                    target: t.target(),
                    proposed,
                })
            })
            .collect()
    }

    /// Adapters for every kind, driven by this plan's hooks.
    /// `hook_timeout` bounds the hooks the engine cannot hand a budget to.
    pub fn adapters(&self, runtime: Handle, hook_timeout: Duration) -> AdapterRegistry {
        let hooks: HashMap<String, TargetHooks> = self
            .targets
            .iter()
            .map(|t| (t.id.clone(), t.hooks()))
            .collect();
        CommandAdapter::registry(Arc::new(hooks), runtime, hook_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"
mode = "dry-run"

[[target]]
id = "sshd_config"
kind = "file"
locator = "/etc/ssh/sshd_config"
proposed = "sshd_config.new"
validate = "sshd -t -f {path}"
reload = "systemctl reload ssh"
health_port = 2222

[[target]]
id = "ufw-rules"
kind = "ruleset"
locator = "ufw"
criticality = "advisory"
content = "-A ufw-user-input -p tcp --dport 2222 -j ACCEPT\n"
read = "cat /etc/ufw/user.rules"
write = "cp {path} /etc/ufw/user.rules && ufw reload"
"#;

    #[test]
    fn test_parse_plan() {
        let plan = Plan::parse(PLAN).unwrap();
        assert_eq!(plan.mode().unwrap(), Some(ExecutionMode::DryRun));
        assert_eq!(plan.targets.len(), 2);

        let ssh = &plan.targets[0];
        assert_eq!(ssh.criticality, Criticality::Critical);
        assert_eq!(ssh.hooks().health_port, Some(2222));
        assert_eq!(ssh.validate.as_deref(), Some("sshd -t -f {path}"));

        let ufw = &plan.targets[1];
        assert_eq!(ufw.kind, TargetKind::Ruleset);
        assert_eq!(ufw.criticality, Criticality::Advisory);
    }

    #[test]
    fn test_inline_content_becomes_change() {
        let plan = Plan::parse(PLAN).unwrap();
        let ufw = Plan {
            mode: None,
            targets: vec![plan.targets[1].clone()],
        };
        let changes = ufw.changes().unwrap();
        assert_eq!(changes[0].target.id, "ufw-rules");
        assert!(changes[0].proposed.starts_with(b"-A ufw-user-input"));
    }

    #[test]
    fn test_relative_proposed_resolves_next_to_plan() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sshd_config.new"), "Port 2222\n").unwrap();
        let plan_path = dir.path().join("plan.toml");
        std::fs::write(
            &plan_path,
            "[[target]]\nid = \"sshd_config\"\nkind = \"file\"\nlocator = \"/etc/ssh/sshd_config\"\nproposed = \"sshd_config.new\"\n",
        )
        .unwrap();

        let plan = Plan::load(&plan_path).unwrap();
        let changes = plan.changes().unwrap();
        assert_eq!(changes[0].proposed, b"Port 2222\n");
    }

    #[test]
    fn test_rejects_bad_plans() {
        let twice = "[[target]]\nid = \"a\"\nkind = \"file\"\nlocator = \"/a\"\n\n[[target]]\nid = \"a\"\nkind = \"file\"\nlocator = \"/b\"\n";
        assert!(Plan::parse(twice).is_err());

        let hookless = "[[target]]\nid = \"ufw\"\nkind = \"ruleset\"\nlocator = \"ufw\"\n";
        assert!(Plan::parse(hookless).is_err());

        let traversal = "[[target]]\nid = \"../x\"\nkind = \"file\"\nlocator = \"/x\"\n";
        assert!(Plan::parse(traversal).is_err());

        let unknown = "[[target]]\nid = \"a\"\nkind = \"file\"\nlocator = \"/a\"\nrestart = \"x\"\n";
        assert!(Plan::parse(unknown).is_err());
    }

    #[test]
    fn test_missing_content_is_an_error() {
        let plan = Plan::parse("[[target]]\nid = \"a\"\nkind = \"file\"\nlocator = \"/a\"\n").unwrap();
        assert!(plan.changes().is_err());
        assert_eq!(plan.targets().len(), 1);
    }
}
