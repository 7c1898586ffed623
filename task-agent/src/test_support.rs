//! Test-only fakes for the model and process collaborators.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::core::types::Message;
use crate::io::config::{AgentConfig, SnapshotConfig};
use crate::io::model::{ModelClient, ModelReply};
use crate::io::shell::{ProcessExecutor, ProcessOutcome, ProcessRequest};

/// Model that answers from a queue and records every request.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    replies: RefCell<VecDeque<Result<ModelReply, String>>>,
    requests: RefCell<Vec<Vec<Message>>>,
    calls: Cell<usize>,
}

impl ScriptedModel {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let model = Self::default();
        for reply in replies {
            model.push(reply);
        }
        model
    }

    /// A model whose next `count` calls fail.
    pub fn failing(count: usize) -> Self {
        let model = Self::default();
        for _ in 0..count {
            model.push_error("scripted model failure");
        }
        model
    }

    pub fn push(&self, content: impl Into<String>) {
        self.replies
            .borrow_mut()
            .push_back(Ok(ModelReply::text(content)));
    }

    pub fn push_error(&self, message: impl Into<String>) {
        self.replies.borrow_mut().push_back(Err(message.into()));
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    /// Histories passed to each call, in order.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.borrow().clone()
    }

    pub fn assert_drained(&self) {
        let left = self.replies.borrow().len();
        assert_eq!(left, 0, "{left} scripted replies were never requested");
    }
}

impl ModelClient for ScriptedModel {
    fn chat(&self, history: &[Message], _max_tokens: u32) -> Result<ModelReply> {
        self.calls.set(self.calls.get() + 1);
        self.requests.borrow_mut().push(history.to_vec());
        match self.replies.borrow_mut().pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted model has no more replies")),
        }
    }
}

/// Process executor returning queued outcomes (success with no output once
/// the queue is empty).
#[derive(Debug, Default)]
pub struct RecordingProcess {
    outcomes: RefCell<VecDeque<ProcessOutcome>>,
    requests: RefCell<Vec<ProcessRequest>>,
}

impl RecordingProcess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, outcome: ProcessOutcome) {
        self.outcomes.borrow_mut().push_back(outcome);
    }

    pub fn requests(&self) -> Vec<ProcessRequest> {
        self.requests.borrow().clone()
    }

    pub fn assert_drained(&self) {
        let left = self.outcomes.borrow().len();
        assert_eq!(left, 0, "{left} scripted outcomes were never used");
    }
}

impl ProcessExecutor for RecordingProcess {
    fn run(&self, request: &ProcessRequest) -> ProcessOutcome {
        self.requests.borrow_mut().push(request.clone());
        self.outcomes.borrow_mut().pop_front().unwrap_or_default()
    }
}

/// Scratch workspace in a temporary directory.
pub struct TestWorkspace {
    dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create temp workspace"),
        }
    }

    /// Canonical root, so recorded workspace paths compare equal.
    pub fn root(&self) -> PathBuf {
        fs::canonicalize(self.dir.path()).expect("canonicalize temp workspace")
    }

    pub fn write(&self, rel: &str, contents: &str) -> PathBuf {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent directories");
        }
        fs::write(&path, contents).expect("write workspace file");
        path
    }

    pub fn read(&self, rel: &str) -> Option<String> {
        fs::read_to_string(self.root().join(rel)).ok()
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.root().join(rel).exists()
    }

    /// Config with filesystem snapshots enabled and compaction off.
    pub fn config(&self) -> AgentConfig {
        let mut cfg = AgentConfig {
            workspace_dir: Some(self.root()),
            snapshots: SnapshotConfig::default(),
            ..AgentConfig::default()
        };
        cfg.compaction.enabled = false;
        cfg
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}
