//! Named, operator-triggered snapshots of several targets at once
//!
//! Layout:
//! ```text
//! <restore_point_root>/
//!   before-caprover_20240103_143000/
//!     metadata              NAME= TIMESTAMP= DESCRIPTION= CREATED_BY= TARGETS=
//!     sshd_config.bak
//!     sshd_config.meta
//!     ufw-rules.bak
//!     ufw-rules.meta
//! ```

use rampart_core::time::{dir_stamp, now_ms, parse_dir_stamp};
use rampart_core::{
    AdapterRegistry, BackupRecord, BackupStore, EngineError, KvDocument, KvSchema, Result, Target,
    TargetKind,
};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use ulid::Ulid;

const METADATA_FILE: &str = "metadata";

const METADATA_SCHEMA: KvSchema = KvSchema {
    required: &["NAME", "TIMESTAMP"],
    optional: &["DESCRIPTION", "CREATED_BY", "TARGETS"],
};

/// A restore point as found on disk
#[derive(Debug, Clone)]
pub struct RestorePoint {
    /// Directory name, `<name>_<YYYYmmdd_HHMMSS>`
    pub id: String,
    pub name: String,
    pub created_at_ms: u64,
    pub description: String,
    pub created_by: String,
    pub target_ids: Vec<String>,
    pub records: Vec<BackupRecord>,
    pub path: PathBuf,
}

impl RestorePoint {
    pub fn backup_record_ids(&self) -> Vec<Ulid> {
        self.records.iter().map(|r| r.id).collect()
    }
}

/// Outcome of restoring a point; failures do not stop the rest
#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreReport {
    pub restored: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl RestoreReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct RestorePointManager {
    store: BackupStore,
}

impl RestorePointManager {
    pub fn open(root: &Path) -> Result<Self> {
        Ok(Self {
            store: BackupStore::open(root)?,
        })
    }

    pub fn root(&self) -> &Path {
        self.store.root()
    }

    /// Snapshot every target under one named point.
    ///
    /// All or nothing: if any backup fails the partial directory is removed.
    pub fn create(
        &self,
        name: &str,
        description: &str,
        targets: &[Target],
        adapters: &AdapterRegistry,
    ) -> Result<RestorePoint> {
        check_name(name)?;
        let created_at_ms = now_ms();
        let stamp = dir_stamp(created_at_ms);
        let id = format!("{name}_{stamp}");
        let dir = self.root().join(&id);

        if dir.exists() {
            return Err(EngineError::Config(format!("restore point {id} already exists")));
        }
        fs::create_dir_all(&dir).map_err(|e| EngineError::io(&dir, e))?;

        let result = (|| -> Result<RestorePoint> {
            let mut records = Vec::with_capacity(targets.len());
            for target in targets {
                let adapter = adapters.for_target(target)?;
                records.push(self.store.backup_into(&dir, target, adapter)?);
            }

            let target_ids: Vec<String> = targets.iter().map(|t| t.id.clone()).collect();
            let created_by = invoking_user();
            let mut doc = KvDocument::new();
            doc.set("NAME", name)
                .set("TIMESTAMP", stamp.as_str())
                .set("DESCRIPTION", description)
                .set("CREATED_BY", created_by.as_str())
                .set("TARGETS", target_ids.join(","));
            doc.write(&dir, &dir.join(METADATA_FILE))?;

            Ok(RestorePoint {
                id: id.clone(),
                name: name.to_string(),
                created_at_ms: parse_dir_stamp(&stamp).unwrap_or(created_at_ms),
                description: description.to_string(),
                created_by,
                target_ids,
                records,
                path: dir.clone(),
            })
        })();

        match result {
            Ok(point) => {
                tracing::info!(restore_point = %point.id, targets = point.records.len(), "Created restore point");
                Ok(point)
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&dir) {
                    tracing::warn!("Failed to remove partial restore point {}: {}", dir.display(), cleanup);
                }
                Err(e)
            }
        }
    }

    /// All restore points, newest first. Directories without readable
    /// metadata are skipped.
    pub fn list(&self) -> Result<Vec<RestorePoint>> {
        let root = self.root();
        let mut points = Vec::new();
        for entry in fs::read_dir(root).map_err(|e| EngineError::io(root, e))? {
            let path = entry.map_err(|e| EngineError::io(root, e))?.path();
            if !path.is_dir() {
                continue;
            }
            match self.load(&path) {
                Ok(point) => points.push(point),
                Err(e) => tracing::warn!("Skipping restore point {}: {}", path.display(), e),
            }
        }
        points.sort_by(|a, b| {
            b.created_at_ms
                .cmp(&a.created_at_ms)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(points)
    }

    /// Exact id, else the newest point with that name
    pub fn resolve(&self, id_or_name: &str) -> Result<RestorePoint> {
        let points = self.list()?;
        if let Some(point) = points.iter().find(|p| p.id == id_or_name) {
            return Ok(point.clone());
        }
        points
            .into_iter()
            .find(|p| p.name == id_or_name)
            .ok_or_else(|| EngineError::Config(format!("no restore point named '{id_or_name}'")))
    }

    /// Write every snapshot of the point back.
    ///
    /// Targets listed in `order` go first, in that order; the rest follow
    /// firewall rule sets, then services, then files. A failing target is
    /// reported and skipped.
    pub fn restore(
        &self,
        id_or_name: &str,
        order: &[String],
        adapters: &AdapterRegistry,
    ) -> Result<RestoreReport> {
        let point = self.resolve(id_or_name)?;
        let mut report = RestoreReport::default();

        if point.records.is_empty() {
            tracing::warn!(restore_point = %point.id, "Restore point holds no restorable records");
        }

        for record in restore_sequence(point.records, order) {
            let target_id = record.target.id.clone();
            let outcome = adapters
                .for_target(&record.target)
                .and_then(|adapter| self.store.restore(&record, &record.target, adapter));
            match outcome {
                Ok(()) => {
                    tracing::info!(restore_point = %point.id, target_id = %target_id, "Restored");
                    report.restored.push(target_id);
                }
                Err(e) => {
                    tracing::error!(restore_point = %point.id, target_id = %target_id, "Restore failed: {}", e);
                    report.failed.push((target_id, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Remove a restore point
    pub fn delete(&self, id_or_name: &str) -> Result<RestorePoint> {
        let point = self.resolve(id_or_name)?;
        fs::remove_dir_all(&point.path).map_err(|e| EngineError::io(&point.path, e))?;
        tracing::info!(restore_point = %point.id, "Deleted restore point");
        Ok(point)
    }

    fn load(&self, dir: &Path) -> Result<RestorePoint> {
        let doc = KvDocument::read(&dir.join(METADATA_FILE), &METADATA_SCHEMA)?;
        let meta_path = dir.join(METADATA_FILE);
        let name = doc.require("NAME", &meta_path)?.to_string();
        let timestamp = doc.require("TIMESTAMP", &meta_path)?;
        let id = dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        let records = self.store.records_in(dir)?;
        let target_ids = match doc.get("TARGETS") {
            Some(list) => list
                .split(',')
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            None => records.iter().map(|r| r.target.id.clone()).collect(),
        };

        Ok(RestorePoint {
            id,
            name,
            created_at_ms: parse_dir_stamp(timestamp).unwrap_or(0),
            description: doc.get("DESCRIPTION").unwrap_or_default().to_string(),
            created_by: doc.get("CREATED_BY").unwrap_or("unknown").to_string(),
            target_ids,
            records,
            path: dir.to_path_buf(),
        })
    }
}

/// Declared ids first, then by kind, then by id
fn restore_sequence(mut records: Vec<BackupRecord>, order: &[String]) -> Vec<BackupRecord> {
    let kind_rank = |kind: TargetKind| match kind {
        TargetKind::Ruleset => 0,
        TargetKind::Service => 1,
        TargetKind::File => 2,
    };
    records.sort_by(|a, b| {
        let pos = |r: &BackupRecord| {
            order
                .iter()
                .position(|id| *id == r.target.id)
                .unwrap_or(usize::MAX)
        };
        pos(a)
            .cmp(&pos(b))
            .then_with(|| kind_rank(a.target.kind).cmp(&kind_rank(b.target.kind)))
            .then_with(|| a.target.id.cmp(&b.target.id))
    });
    records
}

fn check_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(EngineError::Config(format!("invalid restore point name '{name}'")))
    }
}

/// The operator behind sudo, if any
fn invoking_user() -> String {
    ["SUDO_USER", "USER"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|v| !v.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
