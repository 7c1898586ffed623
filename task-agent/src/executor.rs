//! Stack-based scheduler that drives agents depth-first.
//!
//! The whole run is plain data in [`ExecutorState`]: the ancestors on
//! `context_stack`, the current agent, the run-wide sub-task count and any
//! commands awaiting approval. Every suspension point returns to the caller
//! with that state intact, so a run can continue in another process after
//! the state is saved and loaded again.

use std::mem;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::agent::{Agent, StepContext};
use crate::approval::{ApprovalDecision, can_auto_execute, rejection_note};
use crate::core::compaction::CompactionPolicy;
use crate::core::quota::SubTaskQuota;
use crate::core::safety::SafetyGate;
use crate::core::types::{Action, CommandSpec, StepResult};
use crate::io::agents::AgentCatalog;
use crate::io::config::AgentConfig;
use crate::io::model::ModelClient;
use crate::io::prompt::{PromptContext, render_system_prompt};
use crate::io::safety_rules::load_safety_rules;
use crate::io::shell::ProcessExecutor;
use crate::runtime::{self, CommandExecutionResult, ExecutionContext};

/// Where the run currently stands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    AwaitingApproval,
    AwaitingInput,
    Complete,
}

/// Serializable scheduler state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutorState {
    /// Ancestors of the current agent, root first.
    pub context_stack: Vec<Agent>,
    pub current_agent: Option<Agent>,
    pub global_sub_task_count: u32,
    pub auto_approve: bool,
    #[serde(default)]
    pub skip_parse_once: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_parse_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_commands: Vec<CommandSpec>,
    #[serde(default)]
    pub status: RunStatus,
}

impl ExecutorState {
    /// Depth of the current agent (0 when there is none).
    pub fn depth(&self) -> u32 {
        self.current_agent.as_ref().map_or(0, |agent| agent.depth)
    }
}

/// Edge of a model call a checkpoint is taken at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEdge {
    Before,
    After,
}

/// Receives the scheduler state around every model call.
pub trait CheckpointSink {
    fn checkpoint(&mut self, edge: CallEdge, state: &ExecutorState) -> Result<()>;
}

/// Progress reported while the scheduler runs.
#[derive(Debug, Clone, Copy)]
pub enum RunEvent<'e> {
    Step {
        depth: u32,
        result: &'e StepResult,
    },
    ChildStarted {
        depth: u32,
        name: Option<&'e str>,
        task: &'e str,
    },
    ChildCompleted {
        depth: u32,
        summary: &'e str,
    },
    CommandFinished {
        spec: &'e CommandSpec,
        result: &'e CommandExecutionResult,
    },
    CommandRejected {
        spec: &'e CommandSpec,
        note: &'e str,
    },
}

/// Why the scheduler returned control to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Commands need a decision via [`Executor::confirm`].
    AwaitingApproval { commands: Vec<CommandSpec> },
    /// The current agent needs input via [`Executor::resume`].
    AwaitingInput,
    /// The root agent finished.
    Complete { summary: String },
}

/// Run-wide knobs, usually derived from [`AgentConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorSettings {
    pub workspace: PathBuf,
    pub max_depth: u32,
    pub command_timeout: Duration,
    pub max_output_tokens: u32,
    pub model_retries: u32,
    pub compaction: CompactionPolicy,
}

impl ExecutorSettings {
    pub fn from_config(cfg: &AgentConfig, workspace: &Path) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            max_depth: cfg.max_depth,
            command_timeout: Duration::from_secs(cfg.command_timeout_secs),
            max_output_tokens: cfg.max_output_tokens,
            model_retries: cfg.model_retries,
            compaction: cfg.compaction.clone(),
        }
    }
}

pub struct Executor<'a, M: ModelClient + ?Sized, P: ProcessExecutor + ?Sized> {
    model: &'a M,
    process: &'a P,
    gate: SafetyGate,
    settings: ExecutorSettings,
    agents: AgentCatalog,
    state: ExecutorState,
    checkpoints: Option<Box<dyn CheckpointSink + 'a>>,
}

impl<'a, M: ModelClient + ?Sized, P: ProcessExecutor + ?Sized> Executor<'a, M, P> {
    pub fn new(model: &'a M, process: &'a P, gate: SafetyGate, settings: ExecutorSettings) -> Self {
        Self {
            model,
            process,
            gate,
            settings,
            agents: AgentCatalog::default(),
            state: ExecutorState::default(),
            checkpoints: None,
        }
    }

    /// Continue from a previously saved state.
    pub fn with_state(mut self, state: ExecutorState) -> Self {
        self.state = state;
        self
    }

    /// Predefined agents that `<create_agent name=...>` can start.
    pub fn with_agents(mut self, agents: AgentCatalog) -> Self {
        self.agents = agents;
        self
    }

    pub fn with_checkpoints(mut self, sink: Box<dyn CheckpointSink + 'a>) -> Self {
        self.checkpoints = Some(sink);
        self
    }

    pub fn state(&self) -> &ExecutorState {
        &self.state
    }

    pub fn into_state(self) -> ExecutorState {
        self.state
    }

    pub fn set_auto_approve(&mut self, enabled: bool) {
        self.state.auto_approve = enabled;
    }

    /// Make exactly the next step treat the reply as plain text.
    pub fn arm_skip_next_parse(&mut self, reason: impl Into<String>) {
        self.state.skip_parse_once = true;
        self.state.skip_parse_reason = Some(reason.into());
    }

    /// Re-read the safety rules file and swap it into the gate.
    pub fn reload_safety_rules(&mut self, path: &Path) -> Result<()> {
        let rules = load_safety_rules(path)?;
        self.gate.replace_rules(rules);
        info!(path = %path.display(), "safety rules reloaded");
        Ok(())
    }

    fn quota(&self) -> SubTaskQuota {
        SubTaskQuota::new(self.settings.max_depth)
    }

    fn system_prompt(&self, depth: u32, task_name: Option<String>) -> Result<String> {
        render_system_prompt(&PromptContext {
            workspace: self.settings.workspace.display().to_string(),
            depth,
            max_depth: self.settings.max_depth,
            remaining: self.quota().remaining(self.state.global_sub_task_count),
            agents: self
                .agents
                .available_to(task_name.as_deref())
                .map(|def| def.prompt_line())
                .collect(),
            task_name,
        })
    }

    fn ensure_no_pending(&self) -> Result<()> {
        if !self.state.pending_commands.is_empty() {
            bail!(
                "{} command(s) are awaiting approval; confirm or reject them first",
                self.state.pending_commands.len()
            );
        }
        Ok(())
    }

    /// Start a run with `task`, or add it as a follow-up message to the
    /// current agent when one exists.
    #[instrument(skip_all)]
    pub fn run<F: FnMut(RunEvent<'_>)>(&mut self, task: &str, mut on_event: F) -> Result<RunOutcome> {
        self.ensure_no_pending()?;
        match self.state.current_agent.as_mut() {
            Some(agent) => agent.add_user_input(task),
            None => {
                let prompt = self.system_prompt(0, None)?;
                let root = Agent::new(0, None, prompt, task);
                info!(agent = %root.id, "root agent created");
                self.state.current_agent = Some(root);
            }
        }
        self.drive(&mut on_event)
    }

    /// Continue a suspended run. Empty input adds no message.
    #[instrument(skip_all)]
    pub fn resume<F: FnMut(RunEvent<'_>)>(&mut self, input: &str, mut on_event: F) -> Result<RunOutcome> {
        self.ensure_no_pending()?;
        let agent = self
            .state
            .current_agent
            .as_mut()
            .ok_or_else(|| anyhow!("no active agent to resume"))?;
        if !input.trim().is_empty() {
            agent.add_user_input(input);
        }
        self.drive(&mut on_event)
    }

    /// Answer the commands surfaced by [`RunOutcome::AwaitingApproval`].
    #[instrument(skip_all, fields(decision = ?decision))]
    pub fn confirm<F: FnMut(RunEvent<'_>)>(
        &mut self,
        decision: ApprovalDecision,
        note: Option<&str>,
        mut on_event: F,
    ) -> Result<RunOutcome> {
        if self.state.pending_commands.is_empty() {
            bail!("no commands are awaiting approval");
        }
        let commands = mem::take(&mut self.state.pending_commands);
        match decision {
            ApprovalDecision::Reject => {
                let note = rejection_note(note);
                let agent = self
                    .state
                    .current_agent
                    .as_mut()
                    .ok_or_else(|| anyhow!("no active agent for pending commands"))?;
                for spec in &commands {
                    agent.add_user_input(runtime::result_message(spec.tool, "rejected", &note));
                    on_event(RunEvent::CommandRejected { spec, note: &note });
                }
                info!(count = commands.len(), "commands rejected");
            }
            ApprovalDecision::ApproveAndEnableAuto => {
                self.state.auto_approve = true;
                self.execute_batch(&commands, &mut on_event)?;
            }
            ApprovalDecision::Approve => self.execute_batch(&commands, &mut on_event)?,
        }
        self.drive(&mut on_event)
    }

    fn execute_batch<F: FnMut(RunEvent<'_>)>(
        &mut self,
        commands: &[CommandSpec],
        on_event: &mut F,
    ) -> Result<()> {
        let ctx = ExecutionContext {
            workspace: self.settings.workspace.clone(),
            default_timeout: self.settings.command_timeout,
        };
        for spec in commands {
            let result = runtime::execute(spec, &ctx, self.process);
            let agent = self
                .state
                .current_agent
                .as_mut()
                .ok_or_else(|| anyhow!("no active agent for command results"))?;
            agent.add_user_input(runtime::result_message(
                spec.tool,
                "executed",
                &result.summary(),
            ));
            on_event(RunEvent::CommandFinished {
                spec,
                result: &result,
            });
        }
        Ok(())
    }

    fn checkpoint(&mut self, edge: CallEdge) {
        if let Some(sink) = self.checkpoints.as_mut()
            && let Err(err) = sink.checkpoint(edge, &self.state)
        {
            warn!(?edge, error = %format!("{err:#}"), "checkpoint failed");
        }
    }

    fn take_skip_parse(&mut self) -> Option<String> {
        if !mem::take(&mut self.state.skip_parse_once) {
            return None;
        }
        Some(
            self.state
                .skip_parse_reason
                .take()
                .unwrap_or_else(|| "skip requested".to_string()),
        )
    }

    /// Push the next queued sub-task of the current agent, if any.
    fn start_queued_child<F: FnMut(RunEvent<'_>)>(&mut self, on_event: &mut F) -> Result<()> {
        let Some(request) = self
            .state
            .current_agent
            .as_mut()
            .and_then(|agent| agent.queued_sub_tasks.pop_front())
        else {
            return Ok(());
        };
        let depth = self.state.depth() + 1;
        let prompt = self
            .system_prompt(depth, request.name.clone())
            .context("render sub-task system prompt")?;
        let task = match request.name.as_deref().and_then(|name| self.agents.find(name)) {
            Some(definition) => {
                debug!(definition = %definition.name, "predefined agent instructions applied");
                definition.compose_task(&request.task)
            }
            None => request.task.clone(),
        };
        let child = Agent::new(depth, request.name.clone(), prompt, &task);
        info!(agent = %child.id, depth, "sub-task agent started");
        on_event(RunEvent::ChildStarted {
            depth,
            name: request.name.as_deref(),
            task: &request.task,
        });
        if let Some(parent) = self.state.current_agent.replace(child) {
            self.state.context_stack.push(parent);
        }
        Ok(())
    }

    /// Pop a completed agent. Returns the outcome when the root finished.
    fn finish_current<F: FnMut(RunEvent<'_>)>(
        &mut self,
        summary: String,
        on_event: &mut F,
    ) -> Result<Option<RunOutcome>> {
        let Some(mut parent) = self.state.context_stack.pop() else {
            self.state.status = RunStatus::Complete;
            info!("root agent completed");
            return Ok(Some(RunOutcome::Complete { summary }));
        };
        parent.on_child_completed(&summary);
        let prompt = self.system_prompt(parent.depth, parent.name.clone())?;
        parent.refresh_system_prompt(prompt);
        let depth = parent.depth;
        self.state.current_agent = Some(parent);
        on_event(RunEvent::ChildCompleted {
            depth,
            summary: &summary,
        });
        Ok(None)
    }

    fn maybe_compact(&mut self) {
        let policy = &self.settings.compaction;
        let needed = self
            .state
            .current_agent
            .as_ref()
            .is_some_and(|agent| policy.should_compact(&agent.history, agent.last_compacted_len));
        if !needed {
            return;
        }
        self.checkpoint(CallEdge::Before);
        if let Some(agent) = self.state.current_agent.as_mut() {
            match agent.compact(self.model, &self.settings.compaction, self.settings.max_output_tokens) {
                Ok(changed) => debug!(changed, "compaction pass finished"),
                Err(err) => {
                    agent.last_compacted_len = agent.history.len();
                    warn!(error = %format!("{err:#}"), "compaction failed; keeping full history");
                }
            }
        }
        self.checkpoint(CallEdge::After);
    }

    fn drive<F: FnMut(RunEvent<'_>)>(&mut self, on_event: &mut F) -> Result<RunOutcome> {
        self.state.status = RunStatus::Running;
        loop {
            self.start_queued_child(on_event)?;
            self.maybe_compact();

            self.checkpoint(CallEdge::Before);
            let skip_parse = self.take_skip_parse();
            let quota = self.quota();
            let agent = self
                .state
                .current_agent
                .as_mut()
                .ok_or_else(|| anyhow!("no active agent"))?;
            let depth = agent.depth;
            let result = agent.step(StepContext {
                model: self.model,
                quota,
                sub_task_count: &mut self.state.global_sub_task_count,
                agents: &self.agents,
                skip_parse,
                max_output_tokens: self.settings.max_output_tokens,
                model_retries: self.settings.model_retries,
            });
            debug!(depth, action = ?result.action, "step finished");
            on_event(RunEvent::Step {
                depth,
                result: &result,
            });

            match result.action {
                Action::Complete => {
                    let summary = result.summary.unwrap_or_default();
                    let finished = self.finish_current(summary, on_event)?;
                    self.checkpoint(CallEdge::After);
                    if let Some(outcome) = finished {
                        return Ok(outcome);
                    }
                }
                Action::Wait => {
                    self.state.status = RunStatus::AwaitingInput;
                    self.checkpoint(CallEdge::After);
                    return Ok(RunOutcome::AwaitingInput);
                }
                Action::Continue => {
                    if let Some(agent) = self.state.current_agent.as_mut() {
                        agent.queued_sub_tasks.extend(result.sub_tasks);
                    }
                    let commands = result.pending_commands;
                    if commands.is_empty() {
                        self.checkpoint(CallEdge::After);
                        continue;
                    }
                    if can_auto_execute(
                        &self.gate,
                        self.state.auto_approve,
                        &commands,
                        &self.settings.workspace,
                    ) {
                        self.checkpoint(CallEdge::After);
                        self.execute_batch(&commands, on_event)?;
                        continue;
                    }
                    self.state.pending_commands = commands.clone();
                    self.state.status = RunStatus::AwaitingApproval;
                    self.checkpoint(CallEdge::After);
                    return Ok(RunOutcome::AwaitingApproval { commands });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Role, ToolKind};
    use crate::io::agents::AgentDefinition;
    use crate::io::shell::ProcessOutcome;
    use crate::test_support::{RecordingProcess, ScriptedModel};

    fn settings() -> ExecutorSettings {
        ExecutorSettings::from_config(&AgentConfig::default(), Path::new("/work"))
    }

    #[derive(Default)]
    struct Edges(std::rc::Rc<std::cell::RefCell<Vec<(CallEdge, usize)>>>);

    impl CheckpointSink for Edges {
        fn checkpoint(&mut self, edge: CallEdge, state: &ExecutorState) -> Result<()> {
            let len = state.current_agent.as_ref().map_or(0, |a| a.history.len());
            self.0.borrow_mut().push((edge, len));
            Ok(())
        }
    }

    #[test]
    fn checkpoints_bracket_every_model_call() {
        let model = ScriptedModel::new(["<completion>ok</completion>"]);
        let process = RecordingProcess::new();
        let edges = Edges::default();
        let seen = std::rc::Rc::clone(&edges.0);
        let mut executor = Executor::new(&model, &process, SafetyGate::default(), settings())
            .with_checkpoints(Box::new(edges));

        let outcome = executor.run("say ok", |_| {}).expect("run");
        assert_eq!(outcome, RunOutcome::Complete { summary: "ok".to_string() });
        assert_eq!(*seen.borrow(), vec![(CallEdge::Before, 2), (CallEdge::After, 3)]);
    }

    #[test]
    fn auto_mode_runs_safe_commands_without_suspending() {
        let model = ScriptedModel::new([
            "<bash_call>ls</bash_call>",
            "<completion>listed</completion>",
        ]);
        let process = RecordingProcess::new();
        process.push(ProcessOutcome::success("a.txt\n"));
        let mut executor = Executor::new(&model, &process, SafetyGate::default(), settings());
        executor.set_auto_approve(true);

        let mut finished = Vec::new();
        let outcome = executor
            .run("list", |event| {
                if let RunEvent::CommandFinished { result, .. } = event {
                    finished.push(result.summary());
                }
            })
            .expect("run");
        assert_eq!(outcome, RunOutcome::Complete { summary: "listed".to_string() });
        assert_eq!(finished, vec!["success, output:\na.txt".to_string()]);

        let second_call = &model.requests()[1];
        let folded = second_call.last().expect("result message");
        assert_eq!(folded.role, Role::User);
        assert_eq!(
            folded.content,
            "<bash_call_result id=\"executed\">\nsuccess, output:\na.txt\n</bash_call_result>"
        );
        process.assert_drained();
    }

    #[test]
    fn unsafe_commands_suspend_even_in_auto_mode() {
        let model = ScriptedModel::new(["<bash_call>rm -rf build</bash_call><bash_call>ls</bash_call>"]);
        let process = RecordingProcess::new();
        let mut executor = Executor::new(&model, &process, SafetyGate::default(), settings());
        executor.set_auto_approve(true);

        let outcome = executor.run("clean", |_| {}).expect("run");
        let RunOutcome::AwaitingApproval { commands } = outcome else {
            panic!("expected approval, got {outcome:?}");
        };
        assert_eq!(commands.len(), 2);
        assert_eq!(executor.state().status, RunStatus::AwaitingApproval);
        assert!(process.requests().is_empty());
        assert!(executor.run("more", |_| {}).is_err());
    }

    #[test]
    fn confirm_requires_pending_commands() {
        let model = ScriptedModel::new(Vec::<String>::new());
        let process = RecordingProcess::new();
        let mut executor = Executor::new(&model, &process, SafetyGate::default(), settings());
        let err = executor
            .confirm(ApprovalDecision::Approve, None, |_| {})
            .expect_err("nothing pending");
        assert!(err.to_string().contains("no commands are awaiting approval"));
    }

    #[test]
    fn skip_parse_is_consumed_by_one_step() {
        let model = ScriptedModel::new([
            "<bash_call>ls</bash_call>",
            "<bash_call>ls</bash_call>",
        ]);
        let process = RecordingProcess::new();
        let mut executor = Executor::new(&model, &process, SafetyGate::default(), settings());
        executor.arm_skip_next_parse("operator");

        assert_eq!(executor.run("go", |_| {}).expect("run"), RunOutcome::AwaitingInput);
        assert!(!executor.state().skip_parse_once);
        assert_eq!(executor.state().skip_parse_reason, None);

        let outcome = executor.resume("", |_| {}).expect("resume");
        assert_eq!(
            outcome,
            RunOutcome::AwaitingApproval {
                commands: vec![CommandSpec::new(ToolKind::Bash, "ls")]
            }
        );
    }

    fn compacting_settings() -> ExecutorSettings {
        let mut settings = settings();
        settings.compaction = CompactionPolicy {
            enabled: true,
            context_window_tokens: 10,
            threshold: 0.5,
            keep_messages: 1,
            chunk_chars: 2000,
        };
        settings
    }

    #[test]
    fn compaction_is_checkpointed_before_the_next_step() {
        let model = ScriptedModel::new([
            "Which directory should I inspect?",
            "src and tests were inspected",
            "<completion>done</completion>",
        ]);
        let process = RecordingProcess::new();
        let edges = Edges::default();
        let seen = std::rc::Rc::clone(&edges.0);
        let mut executor = Executor::new(&model, &process, SafetyGate::default(), compacting_settings())
            .with_checkpoints(Box::new(edges));

        assert_eq!(executor.run("inspect the project", |_| {}).expect("run"), RunOutcome::AwaitingInput);
        seen.borrow_mut().clear();

        let outcome = executor.resume("look at src", |_| {}).expect("resume");
        assert_eq!(outcome, RunOutcome::Complete { summary: "done".to_string() });
        assert_eq!(
            *seen.borrow(),
            vec![
                (CallEdge::Before, 4),
                (CallEdge::After, 3),
                (CallEdge::Before, 3),
                (CallEdge::After, 4),
            ]
        );

        let summary_request = &model.requests()[1];
        assert_eq!(summary_request.len(), 2);
        assert_eq!(summary_request[0].role, Role::System);

        let history = &executor.state().current_agent.as_ref().expect("root").history;
        assert_eq!(history.len(), 4);
        assert_eq!(history[1].role, Role::System);
        assert_eq!(history[1].content, "History summary (auto):\nsrc and tests were inspected");
        assert_eq!(history[2].content, "look at src");
    }

    #[test]
    fn failed_compaction_keeps_the_full_history() {
        let model = ScriptedModel::new(["Which directory should I inspect?"]);
        let process = RecordingProcess::new();
        let mut executor = Executor::new(&model, &process, SafetyGate::default(), compacting_settings());
        assert_eq!(executor.run("inspect the project", |_| {}).expect("run"), RunOutcome::AwaitingInput);

        model.push_error("context service unavailable");
        model.push("<completion>done</completion>");
        let outcome = executor.resume("look at src", |_| {}).expect("resume");
        assert_eq!(outcome, RunOutcome::Complete { summary: "done".to_string() });

        let root = executor.state().current_agent.as_ref().expect("root");
        assert_eq!(root.history.len(), 5);
        assert!(root.history.iter().all(|msg| !msg.content.starts_with("History summary")));
        assert_eq!(root.history[1].content, "inspect the project");
        assert_eq!(root.last_compacted_len, 4);
        model.assert_drained();
    }

    #[test]
    fn reloaded_rules_change_what_runs_automatically() {
        let model = ScriptedModel::new([
            "<bash_call>ls</bash_call>",
            "<completion>listed</completion>",
            "<bash_call>ls</bash_call>",
        ]);
        let process = RecordingProcess::new();
        process.push(ProcessOutcome::success("a.txt\n"));
        let mut executor = Executor::new(&model, &process, SafetyGate::default(), settings());
        executor.set_auto_approve(true);

        let outcome = executor.run("list", |_| {}).expect("run");
        assert_eq!(outcome, RunOutcome::Complete { summary: "listed".to_string() });
        assert_eq!(process.requests().len(), 1);

        let temp = tempfile::tempdir().expect("tempdir");
        let rules = temp.path().join("safety_rules.toml");
        std::fs::write(&rules, "[tools.bash]\nblocked = ['^ls\\b']\n").expect("write rules");
        executor.reload_safety_rules(&rules).expect("reload");

        let outcome = executor.run("list again", |_| {}).expect("run");
        assert_eq!(
            outcome,
            RunOutcome::AwaitingApproval {
                commands: vec![CommandSpec::new(ToolKind::Bash, "ls")]
            }
        );
        assert_eq!(process.requests().len(), 1);
    }

    #[test]
    fn invalid_rules_file_keeps_the_current_rules() {
        let model = ScriptedModel::new(Vec::<String>::new());
        let process = RecordingProcess::new();
        let mut executor = Executor::new(&model, &process, SafetyGate::default(), settings());

        let temp = tempfile::tempdir().expect("tempdir");
        let rules = temp.path().join("safety_rules.toml");
        std::fs::write(&rules, "[global]\nblocked = ['(']\n").expect("write rules");
        assert!(executor.reload_safety_rules(&rules).is_err());
        assert!(executor.gate.is_safe("ls", ToolKind::Bash, Path::new("/work")));
    }

    #[test]
    fn named_child_starts_from_its_predefined_flow() {
        let model = ScriptedModel::new([
            "<create_agent name=\"review\">look at src</create_agent>",
            "<completion>reviewed</completion>",
            "<completion>all done</completion>",
        ]);
        let process = RecordingProcess::new();
        let agents = AgentCatalog::new(vec![AgentDefinition {
            name: "review".to_string(),
            description: "reviews diffs".to_string(),
            instructions: "# Review flow\nCheck every diff.".to_string(),
            ..AgentDefinition::default()
        }]);
        let mut executor =
            Executor::new(&model, &process, SafetyGate::default(), settings()).with_agents(agents);

        let mut started = Vec::new();
        let outcome = executor
            .run("review the change", |event| {
                if let RunEvent::ChildStarted { name, task, .. } = event {
                    started.push((name.map(str::to_string), task.to_string()));
                }
            })
            .expect("run");
        assert_eq!(outcome, RunOutcome::Complete { summary: "all done".to_string() });
        assert_eq!(started, vec![(Some("review".to_string()), "look at src".to_string())]);

        let requests = model.requests();
        assert!(requests[0][0].content.contains("- `review`: reviews diffs"));
        let child_task = &requests[1][1];
        assert_eq!(child_task.role, Role::User);
        assert_eq!(
            child_task.content,
            "# Review flow\nCheck every diff.\n\n---\n\nTask: use Review flow, look at src"
        );
    }
}
