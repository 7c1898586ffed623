//! Filesystem journal for workspace rollback.
//!
//! Layout under the store directory:
//!
//! ```text
//! fs_snapshots/session_{id}/baseline.json            manifest (size, mtime, sha256)
//! fs_snapshots/session_{id}/baseline/...             full copy, taken once
//! fs_snapshots/session_{id}/snapshots/snapshot_001/  diff vs baseline for index 0
//! ```
//!
//! Each incremental directory holds every file that differs from the
//! baseline plus an empty `<path>.__deleted__` marker for every baseline file
//! missing from the workspace. The state directory and configured exclude
//! names are never captured, cleared or restored.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

use crate::io::config::{STATE_DIR, write_atomic};

pub const DELETION_SUFFIX: &str = ".__deleted__";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct FileStamp {
    size: u64,
    mtime_ns: u64,
    sha256: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Manifest {
    files: BTreeMap<String, FileStamp>,
}

/// Counts from one incremental capture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub changed: usize,
    pub deleted: usize,
}

/// Baseline plus incrementals for one session.
#[derive(Debug, Clone)]
pub struct FsJournal {
    workspace: PathBuf,
    session_dir: PathBuf,
    exclude: Vec<String>,
}

impl FsJournal {
    pub fn new(store_dir: &Path, session_id: u64, workspace: &Path, exclude: &[String]) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            session_dir: store_dir
                .join("fs_snapshots")
                .join(format!("session_{session_id}")),
            exclude: exclude.to_vec(),
        }
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    fn baseline_dir(&self) -> PathBuf {
        self.session_dir.join("baseline")
    }

    fn manifest_path(&self) -> PathBuf {
        self.session_dir.join("baseline.json")
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.session_dir.join("snapshots")
    }

    pub fn snapshot_dir(&self, index: u32) -> PathBuf {
        self.snapshots_dir()
            .join(format!("snapshot_{:03}", u64::from(index) + 1))
    }

    pub fn has_baseline(&self) -> bool {
        self.manifest_path().is_file()
    }

    fn is_excluded(&self, name: &str) -> bool {
        name == STATE_DIR || self.exclude.iter().any(|ex| ex == name)
    }

    /// Workspace files as `relative/path` → absolute path.
    fn workspace_files(&self) -> Result<BTreeMap<String, PathBuf>> {
        let mut files = BTreeMap::new();
        let walker = WalkDir::new(&self.workspace)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| !self.is_excluded(&entry.file_name().to_string_lossy()));
        for entry in walker {
            let entry = entry.with_context(|| format!("walk {}", self.workspace.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = relative_key(&self.workspace, entry.path())?;
            files.insert(rel, entry.into_path());
        }
        Ok(files)
    }

    fn load_manifest(&self) -> Result<Manifest> {
        let path = self.manifest_path();
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
    }

    /// Copy the whole workspace into `baseline/` unless that already happened.
    #[instrument(skip_all, fields(session_dir = %self.session_dir.display()))]
    pub fn ensure_baseline(&self) -> Result<bool> {
        if self.has_baseline() {
            return Ok(false);
        }
        let baseline = self.baseline_dir();
        if baseline.exists() {
            fs::remove_dir_all(&baseline)
                .with_context(|| format!("remove partial baseline {}", baseline.display()))?;
        }
        fs::create_dir_all(&baseline)
            .with_context(|| format!("create directory {}", baseline.display()))?;

        let mut manifest = Manifest::default();
        for (rel, path) in self.workspace_files()? {
            copy_file(&path, &baseline.join(&rel))?;
            manifest.files.insert(rel, stamp(&path)?);
        }
        let mut buf = serde_json::to_string_pretty(&manifest).context("serialize manifest")?;
        buf.push('\n');
        write_atomic(&self.manifest_path(), &buf)?;
        info!(files = manifest.files.len(), "captured baseline");
        Ok(true)
    }

    /// Record the workspace's difference from baseline as incremental `index`.
    #[instrument(skip_all, fields(index = index))]
    pub fn capture(&self, index: u32) -> Result<CaptureStats> {
        self.ensure_baseline()?;
        let manifest = self.load_manifest()?;
        let dir = self.snapshot_dir(index);
        if dir.exists() {
            fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))?;
        }
        fs::create_dir_all(&dir).with_context(|| format!("create directory {}", dir.display()))?;

        let current = self.workspace_files()?;
        let mut stats = CaptureStats::default();
        for (rel, path) in &current {
            let changed = match manifest.files.get(rel) {
                None => true,
                Some(base) => differs(path, base)?,
            };
            if changed {
                copy_file(path, &dir.join(rel))?;
                stats.changed += 1;
            }
        }
        for rel in manifest.files.keys() {
            if !current.contains_key(rel) {
                let marker = dir.join(format!("{rel}{DELETION_SUFFIX}"));
                create_parent(&marker)?;
                File::create(&marker).with_context(|| format!("create {}", marker.display()))?;
                stats.deleted += 1;
            }
        }
        debug!(changed = stats.changed, deleted = stats.deleted, "captured incremental");
        Ok(stats)
    }

    /// Indices that have an incremental directory, ascending.
    pub fn available_indices(&self) -> Result<Vec<u32>> {
        let dir = self.snapshots_dir();
        let mut indices = Vec::new();
        if !dir.exists() {
            return Ok(indices);
        }
        for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            let name = entry.file_name();
            if let Some(n) = name
                .to_str()
                .and_then(|name| name.strip_prefix("snapshot_"))
                .and_then(|n| n.parse::<u32>().ok())
                && n >= 1
            {
                indices.push(n - 1);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    /// Rebuild the workspace as it was when incremental `target` was captured.
    ///
    /// Clears the workspace, restores the baseline and replays incrementals
    /// `0..=target` in order. Files touched by one incremental but absent from
    /// the next go back to their baseline state before the next is applied.
    #[instrument(skip_all, fields(target = target))]
    pub fn restore(&self, target: u32) -> Result<()> {
        if !self.has_baseline() {
            bail!("no filesystem baseline in {}", self.session_dir.display());
        }
        for index in 0..=target {
            if !self.snapshot_dir(index).is_dir() {
                bail!("filesystem snapshot {index} is missing");
            }
        }
        let manifest = self.load_manifest()?;
        let baseline = self.baseline_dir();

        self.clear_workspace()?;
        for rel in manifest.files.keys() {
            copy_file(&baseline.join(rel), &self.workspace.join(rel))?;
        }

        let mut previous: BTreeSet<String> = BTreeSet::new();
        for index in 0..=target {
            let entries = incremental_entries(&self.snapshot_dir(index))?;
            let touched: BTreeSet<String> = entries.keys().cloned().collect();
            for rel in previous.difference(&touched) {
                let dest = self.workspace.join(rel);
                if manifest.files.contains_key(rel) {
                    copy_file(&baseline.join(rel), &dest)?;
                } else {
                    remove_if_exists(&dest)?;
                }
            }
            for (rel, entry) in &entries {
                let dest = self.workspace.join(rel);
                match entry {
                    Entry::Deleted => remove_if_exists(&dest)?,
                    Entry::File(src) => copy_file(src, &dest)?,
                }
            }
            previous = touched;
        }
        info!(target, "workspace restored");
        Ok(())
    }

    /// Delete incrementals newer than `index`.
    pub fn purge_after(&self, index: u32) -> Result<usize> {
        let mut removed = 0;
        for newer in self.available_indices()?.into_iter().filter(|i| *i > index) {
            let dir = self.snapshot_dir(newer);
            fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Remove every workspace file and directory that snapshots cover.
    fn clear_workspace(&self) -> Result<()> {
        for path in self.workspace_files()?.into_values() {
            fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        }
        let walker = WalkDir::new(&self.workspace)
            .min_depth(1)
            .contents_first(true)
            .into_iter()
            .filter_entry(|entry| !self.is_excluded(&entry.file_name().to_string_lossy()));
        for entry in walker {
            let entry = entry.with_context(|| format!("walk {}", self.workspace.display()))?;
            if entry.file_type().is_dir() {
                // Directories still holding excluded entries stay.
                let _ = fs::remove_dir(entry.path());
            } else if entry.file_type().is_symlink() {
                fs::remove_file(entry.path())
                    .with_context(|| format!("remove {}", entry.path().display()))?;
            }
        }
        Ok(())
    }
}

enum Entry {
    File(PathBuf),
    Deleted,
}

/// Files and deletion markers of one incremental, keyed by workspace path.
fn incremental_entries(dir: &Path) -> Result<BTreeMap<String, Entry>> {
    let mut entries = BTreeMap::new();
    for entry in WalkDir::new(dir).min_depth(1) {
        let entry = entry.with_context(|| format!("walk {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = relative_key(dir, entry.path())?;
        match rel.strip_suffix(DELETION_SUFFIX) {
            Some(original) => entries.insert(original.to_string(), Entry::Deleted),
            None => entries.insert(rel, Entry::File(entry.into_path())),
        };
    }
    Ok(entries)
}

fn relative_key(root: &Path, path: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(root)
        .with_context(|| format!("{} is not under {}", path.display(), root.display()))?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

fn stamp(path: &Path) -> Result<FileStamp> {
    let meta = fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    Ok(FileStamp {
        size: meta.len(),
        mtime_ns: mtime_ns(&meta),
        sha256: hash_file(path)?,
    })
}

fn mtime_ns(meta: &fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// Size/mtime fast path, content hash when the fast path is inconclusive.
fn differs(path: &Path, base: &FileStamp) -> Result<bool> {
    let meta = fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    if meta.len() != base.size {
        return Ok(true);
    }
    if mtime_ns(&meta) == base.mtime_ns {
        return Ok(false);
    }
    Ok(hash_file(path)? != base.sha256)
}

fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).with_context(|| format!("hash {}", path.display()))?;
    Ok(hex::encode(hasher.finalize()))
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    Ok(())
}

fn copy_file(src: &Path, dest: &Path) -> Result<()> {
    create_parent(dest)?;
    fs::copy(src, dest)
        .with_context(|| format!("copy {} to {}", src.display(), dest.display()))?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}
