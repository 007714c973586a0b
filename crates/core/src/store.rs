//! On-disk backup store
//!
//! Layout:
//! ```text
//! <backup_root>/
//!   20240103_143000_01HN8X.../     one directory per session
//!     sshd_config.bak             snapshot bytes
//!     sshd_config.meta            KEY=value record metadata
//!     sshd_config.2.bak           second snapshot of the same target
//!     sshd_config.2.meta
//! ```
//!
//! A record exists only once its `.meta` file is in place. Both files are
//! written to a temp name, fsynced and renamed, `.bak` first, so an
//! interrupted backup leaves at most an orphaned `.bak` that nothing will
//! restore from.

use crate::error::{AdapterError, EngineError, Result};
use crate::hash::{hash_bytes, read_stable, Blake3Hash};
use crate::kvmeta::{KvDocument, KvSchema};
use crate::target::{Criticality, Target, TargetAdapter, TargetKind};
use crate::time::{dir_stamp, now_ms};
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use ulid::Ulid;
use walkdir::WalkDir;

const META_SCHEMA: KvSchema = KvSchema {
    required: &[
        "RECORD_ID",
        "TARGET_ID",
        "KIND",
        "LOCATOR",
        "CRITICALITY",
        "CREATED_AT",
        "CHECKSUM",
    ],
    optional: &["MODE", "SIZE"],
};

/// Headroom kept free on the backup volume beyond the snapshot itself
const SPACE_HEADROOM: u64 = 64 * 1024;

/// Immutable snapshot of one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub id: Ulid,
    pub target: Target,
    pub created_at_ms: u64,
    /// Path of the stored snapshot (`.bak`)
    pub content_path: PathBuf,
    pub checksum: Blake3Hash,
    /// Unix permission bits of a file target at backup time
    pub mode: Option<u32>,
}

impl BackupRecord {
    pub fn target_id(&self) -> &str {
        &self.target.id
    }

    pub fn meta_path(&self) -> PathBuf {
        self.content_path.with_extension("meta")
    }

    fn to_document(&self, size: usize) -> KvDocument {
        let mut doc = KvDocument::new();
        doc.set("RECORD_ID", self.id.to_string())
            .set("TARGET_ID", self.target.id.as_str())
            .set("KIND", self.target.kind.as_str())
            .set("LOCATOR", self.target.locator.as_str())
            .set("CRITICALITY", self.target.criticality.as_str())
            .set("CREATED_AT", self.created_at_ms.to_string())
            .set("CHECKSUM", self.checksum.to_hex())
            .set("SIZE", size.to_string());
        if let Some(mode) = self.mode {
            doc.set("MODE", format!("{mode:04o}"));
        }
        doc
    }

    /// Load a record from its `.meta` file
    pub fn load(meta_path: &Path) -> Result<Self> {
        let doc = KvDocument::read(meta_path, &META_SCHEMA)?;
        let bad = |reason: String| EngineError::Metadata {
            path: meta_path.to_path_buf(),
            reason,
        };

        let id = Ulid::from_string(doc.require("RECORD_ID", meta_path)?)
            .map_err(|e| bad(format!("RECORD_ID: {e}")))?;
        let kind: TargetKind = doc.require("KIND", meta_path)?.parse().map_err(bad)?;
        let criticality: Criticality = doc.require("CRITICALITY", meta_path)?.parse().map_err(bad)?;
        let created_at_ms = doc
            .require("CREATED_AT", meta_path)?
            .parse()
            .map_err(|e| bad(format!("CREATED_AT: {e}")))?;
        let checksum = Blake3Hash::from_hex(doc.require("CHECKSUM", meta_path)?).map_err(bad)?;
        let mode = match doc.get("MODE") {
            Some(text) => Some(
                u32::from_str_radix(text, 8).map_err(|e| bad(format!("MODE: {e}")))?,
            ),
            None => None,
        };

        Ok(Self {
            id,
            target: Target {
                id: doc.require("TARGET_ID", meta_path)?.to_string(),
                kind,
                locator: doc.require("LOCATOR", meta_path)?.to_string(),
                criticality,
            },
            created_at_ms,
            content_path: meta_path.with_extension("bak"),
            checksum,
            mode,
        })
    }
}

/// Records and sessions that retention must not touch
#[derive(Debug, Clone, Default)]
pub struct ProtectedSet {
    pub sessions: HashSet<Ulid>,
    pub records: HashSet<Ulid>,
}

/// Outcome of a retention pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub records_deleted: usize,
    pub records_protected: usize,
    pub orphans_deleted: usize,
    pub sessions_removed: usize,
    pub bytes_freed: u64,
}

/// A session directory found under the backup root
#[derive(Debug, Clone)]
pub struct SessionDir {
    pub path: PathBuf,
    pub session_id: Ulid,
}

/// Timestamped snapshot storage for configuration targets
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    /// Open (creating if needed) the store rooted at `root`
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).map_err(|e| EngineError::io(root, e))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory name for a session: `<YYYYmmdd_HHMMSS>_<sessionId>`
    pub fn session_dir_name(session_id: Ulid, started_at_ms: u64) -> String {
        format!("{}_{}", dir_stamp(started_at_ms), session_id)
    }

    /// Create the backup directory for a new session
    pub fn create_session_dir(&self, session_id: Ulid, started_at_ms: u64) -> Result<PathBuf> {
        let dir = self
            .root
            .join(Self::session_dir_name(session_id, started_at_ms));
        fs::create_dir_all(&dir).map_err(|e| EngineError::io(&dir, e))?;
        Ok(dir)
    }

    /// Snapshot `target` into the backup directory of a session
    pub fn backup(
        &self,
        session_id: Ulid,
        started_at_ms: u64,
        target: &Target,
        adapter: &dyn TargetAdapter,
    ) -> Result<BackupRecord> {
        let dir = self
            .root
            .join(Self::session_dir_name(session_id, started_at_ms));
        self.backup_into(&dir, target, adapter)
    }

    /// Snapshot the current state of `target` into `dir`.
    ///
    /// File targets are read straight from their locator; other kinds are
    /// dumped through the adapter.
    pub fn backup_into(
        &self,
        dir: &Path,
        target: &Target,
        adapter: &dyn TargetAdapter,
    ) -> Result<BackupRecord> {
        target.check_id()?;

        let (data, mode) = read_target_state(target, adapter)?;

        fs::create_dir_all(dir).map_err(|e| backup_io_error(target, dir, e))?;
        ensure_space(dir, data.len() as u64 + SPACE_HEADROOM)?;

        let stem = next_free_stem(dir, &target.id);
        let record = BackupRecord {
            id: Ulid::new(),
            target: target.clone(),
            created_at_ms: now_ms(),
            content_path: dir.join(format!("{stem}.bak")),
            checksum: hash_bytes(&data),
            mode,
        };

        write_atomically(dir, &record.content_path, &data)
            .map_err(|e| backup_io_error(target, &record.content_path, e))?;
        let meta = record.to_document(data.len()).render();
        write_atomically(dir, &record.meta_path(), meta.as_bytes())
            .map_err(|e| backup_io_error(target, &record.meta_path(), e))?;

        tracing::debug!(
            target_id = %target.id,
            record = %record.id,
            bytes = data.len(),
            "Backed up target"
        );
        Ok(record)
    }

    /// Write a snapshot back to its target.
    ///
    /// The snapshot is verified against its checksum first; a missing or
    /// corrupted backup never touches the target.
    pub fn restore(
        &self,
        record: &BackupRecord,
        target: &Target,
        adapter: &dyn TargetAdapter,
    ) -> Result<()> {
        let fail = |reason: String| EngineError::RestoreFailure {
            target: target.id.clone(),
            reason,
        };

        if record.target.id != target.id {
            return Err(fail(format!(
                "record {} belongs to target '{}'",
                record.id, record.target.id
            )));
        }

        let data = fs::read(&record.content_path).map_err(|e| {
            fail(format!(
                "backup {} unreadable: {e}",
                record.content_path.display()
            ))
        })?;
        let actual = hash_bytes(&data);
        if actual != record.checksum {
            return Err(fail(format!(
                "checksum mismatch for {} (expected {}, found {})",
                record.content_path.display(),
                record.checksum,
                actual
            )));
        }

        match target.kind {
            TargetKind::File => {
                let path = Path::new(&target.locator);
                let parent = parent_dir(path);
                write_atomically(parent, path, &data)
                    .map_err(|e| fail(format!("writing {}: {e}", path.display())))?;
                if let Some(mode) = record.mode {
                    set_mode(path, mode).map_err(|e| fail(format!("chmod {}: {e}", path.display())))?;
                }
            }
            TargetKind::Service | TargetKind::Ruleset => {
                adapter
                    .write(target, &data)
                    .map_err(|e| fail(format!("loading serialized state: {e}")))?;
            }
        }

        tracing::debug!(target_id = %target.id, record = %record.id, "Restored target");
        Ok(())
    }

    /// Whether a record's files are still on disk
    pub fn record_exists(&self, record: &BackupRecord) -> bool {
        record.content_path.is_file() && record.meta_path().is_file()
    }

    /// All complete records in a directory, oldest first.
    /// Unreadable metadata is skipped with a warning.
    pub fn records_in(&self, dir: &Path) -> Result<Vec<BackupRecord>> {
        let mut records = Vec::new();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(EngineError::io(dir, e)),
        };

        for entry in entries {
            let path = entry.map_err(|e| EngineError::io(dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("meta") {
                continue;
            }
            match BackupRecord::load(&path) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Skipping unreadable backup metadata: {}", e),
            }
        }

        records.sort_by(|a, b| (a.created_at_ms, a.id).cmp(&(b.created_at_ms, b.id)));
        Ok(records)
    }

    /// Session directories under the root; foreign directories are ignored
    pub fn session_dirs(&self) -> Result<Vec<SessionDir>> {
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(|e| EngineError::io(&self.root, e))? {
            let path = entry.map_err(|e| EngineError::io(&self.root, e))?.path();
            if !path.is_dir() {
                continue;
            }
            let session_id = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.rsplit_once('_'))
                .and_then(|(_, id)| Ulid::from_string(id).ok());
            if let Some(session_id) = session_id {
                dirs.push(SessionDir { path, session_id });
            }
        }
        dirs.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(dirs)
    }

    /// Delete records older than `retention`, sparing everything in
    /// `protected`. Age comes from the record's own `CREATED_AT`, never from
    /// file modification times; only leftovers that are not records at all
    /// (interrupted writes) are judged by mtime.
    pub fn cleanup(&self, retention: Duration, protected: &ProtectedSet) -> Result<CleanupReport> {
        let cutoff = now_ms().saturating_sub(retention.as_millis() as u64);
        let mut report = CleanupReport::default();

        for session in self.session_dirs()? {
            let records = self.records_in(&session.path)?;

            if protected.sessions.contains(&session.session_id) {
                report.records_protected += records.len();
                continue;
            }

            let mut live_files: HashSet<PathBuf> = HashSet::new();
            for record in records {
                if protected.records.contains(&record.id) {
                    report.records_protected += 1;
                    live_files.insert(record.content_path.clone());
                    live_files.insert(record.meta_path());
                    continue;
                }
                if record.created_at_ms > cutoff {
                    live_files.insert(record.content_path.clone());
                    live_files.insert(record.meta_path());
                    continue;
                }

                report.bytes_freed += remove_counting(&record.content_path);
                report.bytes_freed += remove_counting(&record.meta_path());
                report.records_deleted += 1;
                tracing::debug!(record = %record.id, target_id = %record.target.id, "Purged backup record");
            }

            for entry in WalkDir::new(&session.path)
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let path = entry.path();
                if !entry.file_type().is_file() || live_files.contains(path) {
                    continue;
                }
                let old = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| (d.as_millis() as u64) < cutoff)
                    .unwrap_or(false);
                if old {
                    report.bytes_freed += remove_counting(path);
                    report.orphans_deleted += 1;
                }
            }

            let empty = fs::read_dir(&session.path)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);
            if empty && fs::remove_dir(&session.path).is_ok() {
                report.sessions_removed += 1;
            }
        }

        Ok(report)
    }
}

fn read_target_state(
    target: &Target,
    adapter: &dyn TargetAdapter,
) -> Result<(Vec<u8>, Option<u32>)> {
    match target.kind {
        TargetKind::File => {
            let path = Path::new(&target.locator);
            let data = read_stable(path, 3).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    EngineError::TargetNotFound {
                        target: target.id.clone(),
                        locator: target.locator.clone(),
                    }
                } else {
                    EngineError::BackupFailure {
                        target: target.id.clone(),
                        reason: format!("reading {}: {e}", path.display()),
                    }
                }
            })?;
            Ok((data, file_mode(path)))
        }
        TargetKind::Service | TargetKind::Ruleset => {
            let data = adapter.read(target).map_err(|e| match e {
                AdapterError::NotFound(_) => EngineError::TargetNotFound {
                    target: target.id.clone(),
                    locator: target.locator.clone(),
                },
                other => EngineError::BackupFailure {
                    target: target.id.clone(),
                    reason: format!("dumping state: {other}"),
                },
            })?;
            Ok((data, None))
        }
    }
}

fn backup_io_error(target: &Target, path: &Path, err: std::io::Error) -> EngineError {
    if is_out_of_space(&err) {
        EngineError::InsufficientSpace {
            path: path.to_path_buf(),
            needed: 0,
            available: 0,
        }
    } else {
        EngineError::BackupFailure {
            target: target.id.clone(),
            reason: format!("writing {}: {err}", path.display()),
        }
    }
}

/// Pick `<id>`, `<id>.2`, `<id>.3`, ... whichever has no files yet
fn next_free_stem(dir: &Path, target_id: &str) -> String {
    let taken = |stem: &str| {
        dir.join(format!("{stem}.bak")).exists() || dir.join(format!("{stem}.meta")).exists()
    };
    if !taken(target_id) {
        return target_id.to_string();
    }
    let mut n = 2u32;
    loop {
        let stem = format!("{target_id}.{n}");
        if !taken(&stem) {
            return stem;
        }
        n += 1;
    }
}

fn remove_counting(path: &Path) -> u64 {
    let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    match fs::remove_file(path) {
        Ok(()) => size,
        Err(e) => {
            tracing::warn!("Failed to remove {}: {}", path.display(), e);
            0
        }
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// Whether an I/O error means the volume is full
pub fn is_out_of_space(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(nix::errno::Errno::ENOSPC as i32)
}

/// Fail with `InsufficientSpace` if `dir`'s volume cannot take `needed` bytes.
/// Volumes that cannot be queried are assumed to have room.
pub fn ensure_space(dir: &Path, needed: u64) -> Result<()> {
    match nix::sys::statvfs::statvfs(dir) {
        Ok(stat) => {
            let available = (stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64);
            if available < needed {
                return Err(EngineError::InsufficientSpace {
                    path: dir.to_path_buf(),
                    needed,
                    available,
                });
            }
            Ok(())
        }
        Err(e) => {
            tracing::debug!("statvfs({}) failed: {}", dir.display(), e);
            Ok(())
        }
    }
}

/// Atomic write helper
///
/// Writes data to a temporary file in `tmp_dir`, fsyncs it, then renames it
/// over `target` and fsyncs the parent directory. `tmp_dir` must be on the
/// same filesystem as `target`. An existing target's permission bits are
/// carried over to the replacement.
pub fn atomic_write(tmp_dir: &Path, target: &Path, data: &[u8]) -> Result<()> {
    write_atomically(tmp_dir, target, data).map_err(|e| EngineError::io(target, e))
}

fn write_atomically(tmp_dir: &Path, target: &Path, data: &[u8]) -> std::io::Result<()> {
    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("rampart");
    let tmp_path = tmp_dir.join(format!(".{name}.{}.tmp", Ulid::new()));

    let result = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        if let Ok(meta) = fs::metadata(target) {
            fs::set_permissions(&tmp_path, meta.permissions())?;
        }

        fs::rename(&tmp_path, target)?;

        if let Ok(dir) = File::open(parent_dir(target)) {
            let _ = dir.sync_all();
        }
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

#[cfg(unix)]
fn file_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).ok().map(|m| m.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> Option<u32> {
    None
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
