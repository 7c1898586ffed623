//! Snapshot persistence: round trips, resuming in a fresh executor and
//! rollback of the workspace.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use task_agent::agent::Agent;
use task_agent::approval::ApprovalDecision;
use task_agent::core::safety::SafetyGate;
use task_agent::core::types::{CommandSpec, Role, ToolKind};
use task_agent::executor::{Executor, ExecutorSettings, ExecutorState, RunOutcome, RunStatus};
use task_agent::io::config::STATE_DIR;
use task_agent::io::prompt::is_system_prompt;
use task_agent::snapshot::{SnapshotError, SnapshotStore};
use task_agent::test_support::{RecordingProcess, ScriptedModel, TestWorkspace};
use walkdir::WalkDir;

fn transcript(agent: &Agent) -> Vec<(Role, String)> {
    agent
        .history
        .iter()
        .map(|msg| (msg.role, msg.content.clone()))
        .collect()
}

/// Every workspace file outside the state directory.
fn workspace_files(root: &Path) -> BTreeMap<String, String> {
    WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| entry.file_name() != STATE_DIR)
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            let rel = entry
                .path()
                .strip_prefix(root)
                .expect("under root")
                .to_string_lossy()
                .replace('\\', "/");
            let contents = fs::read_to_string(entry.path()).expect("read file");
            (rel, contents)
        })
        .collect()
}

#[test]
fn saved_state_loads_back_equal() {
    let ws = TestWorkspace::new();
    let cfg = ws.config();
    let store = SnapshotStore::new(&ws.root(), &cfg.snapshots);
    let model = ScriptedModel::new([
        "<create_agent name=\"scan\">scan the repo</create_agent>",
        "<bash_call>ls -la</bash_call>",
    ]);
    let process = RecordingProcess::new();
    let settings = ExecutorSettings::from_config(&cfg, &ws.root());
    let mut executor = Executor::new(&model, &process, SafetyGate::default(), settings)
        .with_checkpoints(Box::new(store.recorder(1).expect("recorder")));
    executor.set_auto_approve(false);

    let outcome = executor.run("inspect", |_| {}).expect("run");
    assert!(matches!(outcome, RunOutcome::AwaitingApproval { .. }));
    let state = executor.into_state();

    let loaded = store.load(1).expect("load");
    assert_eq!(loaded.snapshot_index, 3);
    assert_eq!(store.list_snapshots(1).expect("list"), vec![0, 1, 2, 3]);

    let restored = loaded.state;
    assert_eq!(restored.global_sub_task_count, state.global_sub_task_count);
    assert_eq!(restored.auto_approve, state.auto_approve);
    assert_eq!(restored.status, RunStatus::AwaitingApproval);
    assert_eq!(
        restored.pending_commands,
        vec![CommandSpec::new(ToolKind::Bash, "ls -la")]
    );
    assert_eq!(restored.context_stack.len(), 1);

    let parent = &restored.context_stack[0];
    let original_parent = &state.context_stack[0];
    assert_eq!(parent.id, original_parent.id);
    let prompts = parent.history.iter().filter(|msg| is_system_prompt(msg)).count();
    assert_eq!(prompts, 1);
    let expected: Vec<(Role, String)> = transcript(original_parent)
        .into_iter()
        .filter(|(role, content)| !(*role == Role::System && content.starts_with("# task-agent")))
        .collect();
    let actual: Vec<(Role, String)> = transcript(parent).into_iter().skip(1).collect();
    assert_eq!(actual, expected);

    let child = restored.current_agent.as_ref().expect("child");
    let original_child = state.current_agent.as_ref().expect("child");
    assert_eq!(child.depth, 1);
    assert_eq!(transcript(child), transcript(original_child));
}

#[test]
fn pending_approval_survives_a_new_executor() {
    let ws = TestWorkspace::new();
    let cfg = ws.config();
    let store = SnapshotStore::new(&ws.root(), &cfg.snapshots);
    let settings = ExecutorSettings::from_config(&cfg, &ws.root());

    {
        let model = ScriptedModel::new(["<bash_call>ls</bash_call>"]);
        let process = RecordingProcess::new();
        let mut executor = Executor::new(&model, &process, SafetyGate::default(), settings.clone())
            .with_checkpoints(Box::new(store.recorder(7).expect("recorder")));
        executor.run("list", |_| {}).expect("run");
    }

    let loaded = store.load(7).expect("load");
    let model = ScriptedModel::new(["<completion>listed</completion>"]);
    let process = RecordingProcess::new();
    let mut executor = Executor::new(&model, &process, SafetyGate::default(), settings)
        .with_state(loaded.state)
        .with_checkpoints(Box::new(store.recorder(7).expect("recorder")));

    let outcome = executor
        .confirm(ApprovalDecision::Approve, None, |_| {})
        .expect("confirm");
    assert_eq!(
        outcome,
        RunOutcome::Complete {
            summary: "listed".to_string()
        }
    );
    assert_eq!(process.requests().len(), 1);
    assert_eq!(store.list_snapshots(7).expect("list"), vec![0, 1, 2, 3]);
    assert_eq!(
        store.load(7).expect("load").state.status,
        RunStatus::Complete
    );
}

#[test]
fn rollback_restores_the_workspace_of_the_target_snapshot() {
    let ws = TestWorkspace::new();
    let cfg = ws.config();
    let store = SnapshotStore::new(&ws.root(), &cfg.snapshots);
    let state = ExecutorState::default();

    ws.write("a.txt", "one");
    ws.write("keep/k.txt", "kept");
    store.save(&state, 1, 0).expect("save 0");
    let at_zero = workspace_files(&ws.root());

    ws.write("a.txt", "two!!");
    ws.write("b.txt", "bee");
    store.save(&state, 1, 1).expect("save 1");

    fs::remove_file(ws.root().join("a.txt")).expect("remove a");
    ws.write("b.txt", "bee-2");
    ws.write("nested/dir/n.txt", "new");
    store.save(&state, 1, 2).expect("save 2");
    let at_two = workspace_files(&ws.root());

    ws.write("c.txt", "late");
    ws.write("b.txt", "bee-three");
    ws.write("a.txt", "back again");
    store.save(&state, 1, 3).expect("save 3");

    let loaded = store.rollback(1, 2).expect("rollback to 2");
    assert_eq!(loaded.snapshot_index, 2);
    assert_eq!(workspace_files(&ws.root()), at_two);
    assert_eq!(store.list_snapshots(1).expect("list"), vec![0, 1, 2]);

    store.rollback(1, 0).expect("rollback to 0");
    assert_eq!(workspace_files(&ws.root()), at_zero);
    assert_eq!(store.list_snapshots(1).expect("list"), vec![0]);
    assert!(!ws.exists("nested/dir/n.txt"));

    let err = store.rollback(1, 2).expect_err("gone");
    assert_eq!(
        err.downcast_ref::<SnapshotError>(),
        Some(&SnapshotError::MissingIndex {
            session_id: 1,
            index: 2
        })
    );
}
