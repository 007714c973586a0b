//! Target adapters driven by shell commands from a plan file
//!
//! Each target may name `read`, `write`, `validate` and `reload` commands,
//! run through `sh -c` with `{path}` replaced by the (quoted) file they act
//! on. Files without a `read`/`write` command are read and replaced
//! directly. Commands run as child processes on the tokio runtime and are
//! killed when their budget runs out.

use rampart_core::{
    atomic_write, AdapterError, AdapterRegistry, AdapterResult, EngineError, ReloadOutcome, Target,
    TargetAdapter, TargetKind, ValidationSubject,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::runtime::Handle;
use tokio::time;

const PROBE_INTERVAL: Duration = Duration::from_millis(200);

/// Commands configured for one target
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetHooks {
    pub read: Option<String>,
    pub write: Option<String>,
    pub validate: Option<String>,
    pub reload: Option<String>,
    pub health_port: Option<u16>,
}

/// Adapter resolving hooks by target id
pub struct CommandAdapter {
    hooks: Arc<HashMap<String, TargetHooks>>,
    runtime: Handle,
    /// Budget for `read`/`write`, which the engine calls without one
    io_timeout: Duration,
}

impl CommandAdapter {
    pub fn new(hooks: Arc<HashMap<String, TargetHooks>>, runtime: Handle, io_timeout: Duration) -> Self {
        Self {
            hooks,
            runtime,
            io_timeout,
        }
    }

    /// One adapter instance per kind, all sharing the same hook table
    pub fn registry(
        hooks: Arc<HashMap<String, TargetHooks>>,
        runtime: Handle,
        io_timeout: Duration,
    ) -> AdapterRegistry {
        let mut registry = AdapterRegistry::new();
        for kind in [TargetKind::File, TargetKind::Service, TargetKind::Ruleset] {
            registry.register(
                kind,
                Box::new(Self::new(hooks.clone(), runtime.clone(), io_timeout)),
            );
        }
        registry
    }

    fn hooks(&self, target: &Target) -> Option<&TargetHooks> {
        self.hooks.get(&target.id)
    }

    fn hook<'a>(&'a self, target: &Target, pick: fn(&TargetHooks) -> &Option<String>) -> Option<&'a str> {
        self.hooks(target).and_then(|h| pick(h).as_deref())
    }

    fn run(&self, command: &str, path: &str, timeout: Duration) -> AdapterResult<Vec<u8>> {
        self.runtime.block_on(run_command(command, path, timeout))
    }
}

impl TargetAdapter for CommandAdapter {
    fn read(&self, target: &Target) -> AdapterResult<Vec<u8>> {
        match self.hook(target, |h| &h.read) {
            Some(command) => self.run(command, &target.locator, self.io_timeout),
            None if target.kind == TargetKind::File => Ok(std::fs::read(&target.locator)?),
            None => Err(AdapterError::failed(format!(
                "no read command for {} target '{}'",
                target.kind, target.id
            ))),
        }
    }

    fn write(&self, target: &Target, state: &[u8]) -> AdapterResult<()> {
        match self.hook(target, |h| &h.write) {
            Some(command) => {
                let staged = StagedFile::create(target, state)?;
                self.run(command, &staged.path.to_string_lossy(), self.io_timeout)?;
                Ok(())
            }
            None if target.kind == TargetKind::File => {
                let path = Path::new(&target.locator);
                let dir = match path.parent() {
                    Some(p) if !p.as_os_str().is_empty() => p,
                    _ => Path::new("."),
                };
                atomic_write(dir, path, state).map_err(|e| match e {
                    EngineError::Io { source, .. } => AdapterError::from(source),
                    other => AdapterError::failed(other),
                })
            }
            None => Err(AdapterError::failed(format!(
                "no write command for {} target '{}'",
                target.kind, target.id
            ))),
        }
    }

    fn validate(
        &self,
        target: &Target,
        subject: ValidationSubject<'_>,
        timeout: Duration,
    ) -> AdapterResult<()> {
        let Some(command) = self.hook(target, |h| &h.validate) else {
            return Ok(());
        };
        let path = match subject {
            ValidationSubject::Live => target.locator.clone(),
            ValidationSubject::Scratch(path) => path.to_string_lossy().into_owned(),
        };
        self.run(command, &path, timeout)?;
        Ok(())
    }

    fn reload(&self, target: &Target, timeout: Duration) -> AdapterResult<ReloadOutcome> {
        match self.hook(target, |h| &h.reload) {
            Some(command) => {
                self.run(command, &target.locator, timeout)?;
                Ok(ReloadOutcome::Reloaded)
            }
            None => Ok(ReloadOutcome::NotApplicable),
        }
    }

    fn health_check(&self, target: &Target, timeout: Duration) -> AdapterResult<()> {
        match self.hooks(target).and_then(|h| h.health_port) {
            Some(port) => self.runtime.block_on(check_port(port, timeout)),
            None => Ok(()),
        }
    }
}

/// Run `command` through `sh -c` with `{path}` substituted, returning stdout
pub async fn run_command(command: &str, path: &str, timeout: Duration) -> AdapterResult<Vec<u8>> {
    let line = command.replace("{path}", &shell_quote(path));
    tracing::debug!(command = %line, "Running hook");

    let mut process = Command::new("sh");
    process
        .arg("-c")
        .arg(&line)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = process
        .spawn()
        .map_err(|e| AdapterError::failed(format!("failed to spawn `{line}`: {e}")))?;

    let output = match time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => output?,
        Err(_) => {
            tracing::warn!(command = %line, "Hook timed out after {:?}", timeout);
            return Err(AdapterError::TimedOut(timeout));
        }
    };

    if output.status.success() {
        return Ok(output.stdout);
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let status = match output.status.code() {
        Some(code) => format!("exit status {code}"),
        None => "a signal".to_string(),
    };
    if stderr.is_empty() {
        Err(AdapterError::Failed(format!("`{line}` failed with {status}")))
    } else {
        Err(AdapterError::Failed(format!("`{line}` failed with {status}: {stderr}")))
    }
}

/// Wait for something to accept TCP connections on the local `port`
pub async fn check_port(port: u16, timeout: Duration) -> AdapterResult<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let last_error = match time::timeout(remaining, TcpStream::connect(("127.0.0.1", port))).await {
            Ok(Ok(_)) => return Ok(()),
            Ok(Err(e)) => e.to_string(),
            Err(_) => "connect timed out".to_string(),
        };
        if Instant::now() + PROBE_INTERVAL >= deadline {
            return Err(AdapterError::Failed(format!(
                "nothing listening on port {port}: {last_error}"
            )));
        }
        time::sleep(PROBE_INTERVAL).await;
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Content handed to a `write` command, removed once the command is done
struct StagedFile {
    path: PathBuf,
}

impl StagedFile {
    fn create(target: &Target, state: &[u8]) -> AdapterResult<Self> {
        let path = std::env::temp_dir().join(format!(".rampart-{}-{}", target.id, ulid::Ulid::new()));
        std::fs::write(&path, state)?;
        Ok(Self { path })
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
