//! Session snapshots: scheduler records plus the filesystem journal.
//!
//! Every checkpoint writes `.task-agent/snapshots/{session}.{index}.json`
//! and captures the workspace's difference from the session baseline.
//! [`SnapshotStore::rollback`] restores both and drops everything newer.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::agent::Agent;
use crate::executor::{CallEdge, CheckpointSink, ExecutorState};
use crate::io::config::{SnapshotConfig, state_dir};
use crate::io::fs_snapshot::FsJournal;
use crate::io::prompt::dedup_system_prompts;
use crate::io::session_store::{
    self, RECORD_VERSION, SessionSummary, list_indices, read_record, records_dir, write_record,
};

/// On-disk form of one checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub version: u32,
    pub session_id: u64,
    pub snapshot_index: u32,
    pub created_at: String,
    pub workspace_root: String,
    pub executor: ExecutorState,
}

/// Refusals callers may want to tell apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    /// The record was taken in a different workspace.
    WorkspaceMismatch { recorded: String, current: String },
    NoSnapshots { session_id: u64 },
    MissingIndex { session_id: u64, index: u32 },
    /// An index below the rollback target is missing.
    NonContiguous { session_id: u64, missing: u32 },
    /// Filesystem capture is turned off, so rollback cannot restore files.
    JournalDisabled { session_id: u64 },
    /// No filesystem incremental exists for `index` (or no baseline at all).
    WorkspaceNotCaptured { session_id: u64, index: u32 },
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::WorkspaceMismatch { recorded, current } => write!(
                f,
                "snapshot workspace {recorded} does not match current workspace {current}"
            ),
            SnapshotError::NoSnapshots { session_id } => {
                write!(f, "session {session_id} has no snapshots")
            }
            SnapshotError::MissingIndex { session_id, index } => {
                write!(f, "session {session_id} has no snapshot {index}")
            }
            SnapshotError::NonContiguous { session_id, missing } => write!(
                f,
                "session {session_id} snapshots are not contiguous: snapshot {missing} is missing"
            ),
            SnapshotError::JournalDisabled { session_id } => write!(
                f,
                "filesystem snapshots are disabled; session {session_id} cannot restore its workspace"
            ),
            SnapshotError::WorkspaceNotCaptured { session_id, index } => write!(
                f,
                "session {session_id} has no filesystem snapshot {index}; the workspace cannot be restored"
            ),
        }
    }
}

impl std::error::Error for SnapshotError {}

/// State loaded back from the newest record of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedSession {
    pub session_id: u64,
    pub snapshot_index: u32,
    pub state: ExecutorState,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    workspace: PathBuf,
    records: PathBuf,
    state_dir: PathBuf,
    config: SnapshotConfig,
}

fn dedup_agent(agent: &Agent) -> Agent {
    Agent {
        history: dedup_system_prompts(&agent.history),
        ..agent.clone()
    }
}

impl SnapshotStore {
    pub fn new(workspace: &Path, config: &SnapshotConfig) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            records: records_dir(workspace),
            state_dir: state_dir(workspace),
            config: config.clone(),
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    fn journal(&self, session_id: u64) -> FsJournal {
        FsJournal::new(
            &self.state_dir,
            session_id,
            &self.workspace,
            &self.config.exclude,
        )
    }

    fn workspace_label(&self) -> String {
        self.workspace.display().to_string()
    }

    /// Write a record for `state` and capture the workspace as `index`.
    #[instrument(skip_all, fields(session_id = session_id, index = index))]
    pub fn save(&self, state: &ExecutorState, session_id: u64, index: u32) -> Result<PathBuf> {
        let executor = ExecutorState {
            context_stack: state.context_stack.iter().map(dedup_agent).collect(),
            current_agent: state.current_agent.as_ref().map(dedup_agent),
            ..state.clone()
        };
        let record = SnapshotRecord {
            version: RECORD_VERSION,
            session_id,
            snapshot_index: index,
            created_at: Utc::now().to_rfc3339(),
            workspace_root: self.workspace_label(),
            executor,
        };
        let path = write_record(&self.records, session_id, index, &record)?;
        if self.config.enabled {
            let stats = self
                .journal(session_id)
                .capture(index)
                .with_context(|| format!("capture filesystem snapshot {index}"))?;
            debug!(changed = stats.changed, deleted = stats.deleted, "filesystem captured");
        }
        Ok(path)
    }

    /// Read one record, refusing records from another workspace.
    pub fn load_index(&self, session_id: u64, index: u32) -> Result<SnapshotRecord> {
        let record: SnapshotRecord = read_record(&self.records, session_id, index)?;
        let current = self.workspace_label();
        if record.workspace_root != current {
            return Err(SnapshotError::WorkspaceMismatch {
                recorded: record.workspace_root,
                current,
            }
            .into());
        }
        Ok(record)
    }

    /// Load the newest snapshot of a session.
    pub fn load(&self, session_id: u64) -> Result<LoadedSession> {
        let index = list_indices(&self.records, session_id)?
            .last()
            .copied()
            .ok_or(SnapshotError::NoSnapshots { session_id })?;
        let record = self.load_index(session_id, index)?;
        info!(session_id, index, "session loaded");
        Ok(LoadedSession {
            session_id,
            snapshot_index: index,
            state: record.executor,
        })
    }

    /// Restore the session and workspace to `target`, deleting every newer
    /// record and filesystem incremental.
    #[instrument(skip_all, fields(session_id = session_id, target = target))]
    pub fn rollback(&self, session_id: u64, target: u32) -> Result<LoadedSession> {
        let indices = list_indices(&self.records, session_id)?;
        if indices.is_empty() {
            return Err(SnapshotError::NoSnapshots { session_id }.into());
        }
        if !indices.contains(&target) {
            return Err(SnapshotError::MissingIndex {
                session_id,
                index: target,
            }
            .into());
        }
        if let Some(missing) = (0..target).find(|i| !indices.contains(i)) {
            return Err(SnapshotError::NonContiguous {
                session_id,
                missing,
            }
            .into());
        }
        let record = self.load_index(session_id, target)?;

        if !self.config.enabled {
            return Err(SnapshotError::JournalDisabled { session_id }.into());
        }
        let journal = self.journal(session_id);
        let captured = if journal.has_baseline() {
            journal.available_indices()?
        } else {
            Vec::new()
        };
        if let Some(index) = (0..=target).find(|i| !captured.contains(i)) {
            return Err(SnapshotError::WorkspaceNotCaptured { session_id, index }.into());
        }

        journal.restore(target)?;
        let purged = journal.purge_after(target)?;
        debug!(purged, "filesystem incrementals purged");
        let removed = session_store::remove_records_after(&self.records, session_id, target)?;
        info!(removed, "rolled back");
        Ok(LoadedSession {
            session_id,
            snapshot_index: target,
            state: record.executor,
        })
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        session_store::list_sessions(&self.records)
    }

    pub fn list_snapshots(&self, session_id: u64) -> Result<Vec<u32>> {
        list_indices(&self.records, session_id)
    }

    /// One past the highest recorded session id.
    pub fn next_session_id(&self) -> Result<u64> {
        let ids = session_store::list_session_ids(&self.records)?;
        Ok(ids.last().map_or(1, |id| id + 1))
    }

    /// Sink that appends checkpoints after the newest existing index.
    pub fn recorder(&self, session_id: u64) -> Result<SessionRecorder> {
        let next_index = list_indices(&self.records, session_id)?
            .last()
            .map_or(0, |index| index + 1);
        Ok(SessionRecorder {
            store: self.clone(),
            session_id,
            next_index,
        })
    }
}

/// Writes one snapshot per checkpoint with increasing indices.
#[derive(Debug, Clone)]
pub struct SessionRecorder {
    store: SnapshotStore,
    session_id: u64,
    next_index: u32,
}

impl SessionRecorder {
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn next_index(&self) -> u32 {
        self.next_index
    }
}

impl CheckpointSink for SessionRecorder {
    fn checkpoint(&mut self, edge: CallEdge, state: &ExecutorState) -> Result<()> {
        let index = self.next_index;
        self.store.save(state, self.session_id, index)?;
        self.next_index += 1;
        debug!(?edge, index, "checkpoint saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::core::types::Message;
    use crate::io::prompt::SYSTEM_PROMPT_HEADER;

    fn state_with_prompts() -> ExecutorState {
        let mut agent = Agent::new(0, None, format!("{SYSTEM_PROMPT_HEADER}\nv1"), "task");
        agent.history.push(Message::assistant("<bash_call>ls</bash_call>"));
        agent.refresh_system_prompt(format!("{SYSTEM_PROMPT_HEADER}\nv2"));
        ExecutorState {
            current_agent: Some(agent),
            global_sub_task_count: 3,
            auto_approve: true,
            ..ExecutorState::default()
        }
    }

    fn store(root: &Path) -> SnapshotStore {
        SnapshotStore::new(root, &SnapshotConfig::default())
    }

    #[test]
    fn save_and_load_dedups_system_prompts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let state = state_with_prompts();
        store.save(&state, 1, 0).expect("save");
        store.save(&state, 1, 1).expect("save");

        let loaded = store.load(1).expect("load");
        assert_eq!(loaded.snapshot_index, 1);
        let history = &loaded.state.current_agent.as_ref().expect("agent").history;
        assert_eq!(history.len(), 3);
        assert!(history[0].content.ends_with("v2"));
        assert_eq!(loaded.state.global_sub_task_count, 3);
        assert!(loaded.state.auto_approve);
    }

    #[test]
    fn load_refuses_other_workspace() {
        let temp = tempfile::tempdir().expect("tempdir");
        let original = temp.path().join("a");
        fs::create_dir_all(&original).expect("mkdir");
        store(&original).save(&ExecutorState::default(), 1, 0).expect("save");

        let moved = temp.path().join("b");
        fs::rename(&original, &moved).expect("rename");
        let err = store(&moved).load(1).expect_err("mismatch");
        assert!(matches!(
            err.downcast_ref::<SnapshotError>(),
            Some(SnapshotError::WorkspaceMismatch { .. })
        ));
    }

    #[test]
    fn rollback_requires_contiguous_indices() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store.save(&ExecutorState::default(), 2, 0).expect("save");
        store.save(&ExecutorState::default(), 2, 2).expect("save");

        let err = store.rollback(2, 2).expect_err("gap");
        assert_eq!(
            err.downcast_ref::<SnapshotError>(),
            Some(&SnapshotError::NonContiguous {
                session_id: 2,
                missing: 1
            })
        );
        let err = store.rollback(9, 0).expect_err("empty");
        assert_eq!(
            err.downcast_ref::<SnapshotError>(),
            Some(&SnapshotError::NoSnapshots { session_id: 9 })
        );
    }

    #[test]
    fn rollback_refuses_when_filesystem_capture_is_disabled() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = SnapshotConfig {
            enabled: false,
            ..SnapshotConfig::default()
        };
        let store = SnapshotStore::new(temp.path(), &config);
        store.save(&ExecutorState::default(), 1, 0).expect("save");
        store.save(&ExecutorState::default(), 1, 1).expect("save");

        let err = store.rollback(1, 0).expect_err("disabled");
        assert_eq!(
            err.downcast_ref::<SnapshotError>(),
            Some(&SnapshotError::JournalDisabled { session_id: 1 })
        );
        assert_eq!(store.list_snapshots(1).expect("list"), vec![0, 1]);
    }

    #[test]
    fn rollback_refuses_when_workspace_was_not_captured() {
        let temp = tempfile::tempdir().expect("tempdir");
        let records_only = SnapshotStore::new(
            temp.path(),
            &SnapshotConfig {
                enabled: false,
                ..SnapshotConfig::default()
            },
        );
        records_only.save(&ExecutorState::default(), 3, 0).expect("save");
        fs::write(temp.path().join("a.txt"), "one").expect("write");
        store(temp.path()).save(&ExecutorState::default(), 3, 1).expect("save");
        records_only.save(&ExecutorState::default(), 3, 2).expect("save");

        let err = store(temp.path()).rollback(3, 2).expect_err("no baseline for 0");
        assert_eq!(
            err.downcast_ref::<SnapshotError>(),
            Some(&SnapshotError::WorkspaceNotCaptured {
                session_id: 3,
                index: 0
            })
        );
        assert_eq!(store(temp.path()).list_snapshots(3).expect("list"), vec![0, 1, 2]);
        assert_eq!(fs::read_to_string(temp.path().join("a.txt")).expect("read"), "one");
    }

    #[test]
    fn recorder_and_session_ids_continue_after_existing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        assert_eq!(store.next_session_id().expect("id"), 1);

        let mut recorder = store.recorder(4).expect("recorder");
        recorder
            .checkpoint(CallEdge::Before, &ExecutorState::default())
            .expect("before");
        recorder
            .checkpoint(CallEdge::After, &ExecutorState::default())
            .expect("after");
        assert_eq!(store.list_snapshots(4).expect("list"), vec![0, 1]);
        assert_eq!(store.recorder(4).expect("recorder").next_index(), 2);
        assert_eq!(store.next_session_id().expect("id"), 5);
        assert_eq!(store.list_sessions().expect("sessions")[0].snapshot_count, 2);
    }
}
