//! Snapshot record files: `.task-agent/snapshots/{session_id}.{snapshot_index}.json`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use jsonschema::Draft;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::io::config::{state_dir, write_atomic};

pub const RECORD_VERSION: u32 = 1;

const SNAPSHOT_SCHEMA: &str = include_str!("../../schemas/snapshot/v1.schema.json");

/// `<root>/.task-agent/snapshots`
pub fn records_dir(root: &Path) -> PathBuf {
    state_dir(root).join("snapshots")
}

pub fn record_path(dir: &Path, session_id: u64, index: u32) -> PathBuf {
    dir.join(format!("{session_id}.{index}.json"))
}

fn parse_file_name(name: &str) -> Option<(u64, u32)> {
    let stem = name.strip_suffix(".json")?;
    let (session, index) = stem.split_once('.')?;
    Some((session.parse().ok()?, index.parse().ok()?))
}

/// Write one record as pretty JSON with a trailing newline.
pub fn write_record<T: Serialize>(
    dir: &Path,
    session_id: u64,
    index: u32,
    record: &T,
) -> Result<PathBuf> {
    let path = record_path(dir, session_id, index);
    let mut buf = serde_json::to_string_pretty(record).context("serialize snapshot record")?;
    buf.push('\n');
    write_atomic(&path, &buf)?;
    debug!(path = %path.display(), "wrote snapshot record");
    Ok(path)
}

/// Read one record, validating it against the snapshot schema first.
pub fn read_record<T: DeserializeOwned>(dir: &Path, session_id: u64, index: u32) -> Result<T> {
    let path = record_path(dir, session_id, index);
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    validate_record(&value).with_context(|| format!("validate {}", path.display()))?;
    serde_json::from_value(value).with_context(|| format!("deserialize {}", path.display()))
}

/// Validate a record against the v1 schema (Draft 2020-12).
pub fn validate_record(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(SNAPSHOT_SCHEMA).context("parse snapshot schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile json schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

/// All `(session_id, index)` pairs on disk, keyed by session.
fn scan(dir: &Path) -> Result<BTreeMap<u64, Vec<u32>>> {
    let mut sessions: BTreeMap<u64, Vec<u32>> = BTreeMap::new();
    if !dir.exists() {
        return Ok(sessions);
    }
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let name = entry.file_name();
        if let Some((session, index)) = name.to_str().and_then(parse_file_name) {
            sessions.entry(session).or_default().push(index);
        }
    }
    for indices in sessions.values_mut() {
        indices.sort_unstable();
    }
    Ok(sessions)
}

/// Snapshot indices of a session in ascending order.
pub fn list_indices(dir: &Path, session_id: u64) -> Result<Vec<u32>> {
    Ok(scan(dir)?.remove(&session_id).unwrap_or_default())
}

pub fn list_session_ids(dir: &Path) -> Result<Vec<u64>> {
    Ok(scan(dir)?.into_keys().collect())
}

/// Delete every record of a session with an index above `index`.
pub fn remove_records_after(dir: &Path, session_id: u64, index: u32) -> Result<usize> {
    let mut removed = 0;
    for newer in list_indices(dir, session_id)?
        .into_iter()
        .filter(|i| *i > index)
    {
        let path = record_path(dir, session_id, newer);
        fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        removed += 1;
    }
    Ok(removed)
}

/// Overview of one recorded session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: u64,
    pub snapshot_count: usize,
    pub last_index: u32,
    /// Modification time of the newest record (RFC 3339).
    pub updated_at: Option<String>,
}

pub fn list_sessions(dir: &Path) -> Result<Vec<SessionSummary>> {
    let mut summaries = Vec::new();
    for (session_id, indices) in scan(dir)? {
        let Some(&last_index) = indices.last() else {
            continue;
        };
        let updated_at = fs::metadata(record_path(dir, session_id, last_index))
            .and_then(|meta| meta.modified())
            .ok()
            .map(|time| DateTime::<Utc>::from(time).to_rfc3339());
        summaries.push(SessionSummary {
            session_id,
            snapshot_count: indices.len(),
            last_index,
            updated_at,
        });
    }
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(session_id: u64, index: u32) -> Value {
        json!({
            "version": 1,
            "session_id": session_id,
            "snapshot_index": index,
            "created_at": "2026-01-01T00:00:00Z",
            "workspace_root": "/work",
            "executor": {
                "context_stack": [],
                "current_agent": {
                    "id": "abcd1234",
                    "depth": 0,
                    "history": [{"role": "user", "content": "hi", "timestamp": 1.5}]
                },
                "global_sub_task_count": 0,
                "auto_approve": false
            }
        })
    }

    #[test]
    fn write_read_and_list() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = records_dir(temp.path());
        for index in [0, 1, 2, 10] {
            write_record(&dir, 3, index, &record(3, index)).expect("write");
        }
        write_record(&dir, 7, 0, &record(7, 0)).expect("write");
        fs::write(dir.join("notes.txt"), "ignored").expect("write");

        assert!(dir.join("3.10.json").is_file());
        assert_eq!(list_indices(&dir, 3).expect("list"), vec![0, 1, 2, 10]);
        assert_eq!(list_session_ids(&dir).expect("ids"), vec![3, 7]);

        let back: Value = read_record(&dir, 3, 1).expect("read");
        assert_eq!(back, record(3, 1));

        let sessions = list_sessions(&dir).expect("sessions");
        assert_eq!(sessions[0].snapshot_count, 4);
        assert_eq!(sessions[0].last_index, 10);
        assert!(sessions[0].updated_at.is_some());
    }

    #[test]
    fn invalid_records_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().to_path_buf();
        let mut bad = record(1, 0);
        bad["version"] = json!(2);
        write_record(&dir, 1, 0, &bad).expect("write");
        let err = read_record::<Value>(&dir, 1, 0).expect_err("schema");
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn removes_newer_records() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().to_path_buf();
        for index in 0..4 {
            write_record(&dir, 1, index, &record(1, index)).expect("write");
        }
        assert_eq!(remove_records_after(&dir, 1, 1).expect("remove"), 2);
        assert_eq!(list_indices(&dir, 1).expect("list"), vec![0, 1]);
        assert!(list_indices(&dir, 9).expect("list").is_empty());
    }
}
