//! LLM task orchestration CLI.
//!
//! Runs a task through a tree of agents, asking for approval before
//! commands that are not cleared for automatic execution. Every model call
//! is checkpointed under `.task-agent/snapshots/`, so a suspended run can be
//! resumed or rolled back later.

use std::env;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use task_agent::approval::ApprovalDecision;
use task_agent::core::safety::SafetyGate;
use task_agent::executor::{Executor, ExecutorSettings, ExecutorState, RunEvent, RunOutcome};
use task_agent::exit_codes;
use task_agent::io::agents::load_agent_catalog;
use task_agent::io::config::{
    AgentConfig, agents_dir, config_path, load_config, safety_rules_path,
};
use task_agent::io::init::{InitOptions, init_workspace};
use task_agent::io::model::{CommandModelClient, ModelClient};
use task_agent::io::safety_rules::load_safety_rules;
use task_agent::io::shell::{ProcessExecutor, SystemProcessExecutor};
use task_agent::logging;
use task_agent::snapshot::SnapshotStore;

#[derive(Parser)]
#[command(
    name = "task-agent",
    version,
    about = "LLM task orchestration with approvals, snapshots and rollback"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.task-agent/` with default config and safety rules.
    Init {
        /// Overwrite existing config and rules files.
        #[arg(short, long)]
        force: bool,
    },
    /// Start a task (or add it to an existing session).
    Run {
        task: String,
        /// Continue this session instead of starting a new one.
        #[arg(long)]
        session: Option<u64>,
        /// Execute commands that pass the safety gate without asking.
        #[arg(long)]
        auto: bool,
    },
    /// Continue a suspended session.
    Resume {
        session: u64,
        /// Message for the current agent.
        input: Option<String>,
        /// Treat the next model reply as plain text.
        #[arg(
            long,
            value_name = "REASON",
            num_args = 0..=1,
            default_missing_value = "requested by operator"
        )]
        skip_parse: Option<String>,
    },
    /// List recorded sessions.
    Sessions,
    /// List snapshot indices of a session.
    Snapshots { session: u64 },
    /// Restore a session and its workspace to a snapshot, deleting newer ones.
    Rollback { session: u64, index: u32 },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::ERROR);
        }
    }
}

fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init { force } => cmd_init(force),
        Command::Run {
            task,
            session,
            auto,
        } => cmd_run(&task, session, auto),
        Command::Resume {
            session,
            input,
            skip_parse,
        } => cmd_resume(session, input.as_deref(), skip_parse),
        Command::Sessions => cmd_sessions(),
        Command::Snapshots { session } => cmd_snapshots(session),
        Command::Rollback { session, index } => cmd_rollback(session, index),
    }
}

/// Config, workspace and snapshot store for the current directory.
struct Project {
    root: PathBuf,
    workspace: PathBuf,
    config: AgentConfig,
    store: SnapshotStore,
}

impl Project {
    fn open() -> Result<Self> {
        let cwd = env::current_dir().context("read current directory")?;
        let root = fs::canonicalize(&cwd).with_context(|| format!("resolve {}", cwd.display()))?;
        let config = load_config(&config_path(&root))?;
        let configured = config.workspace_root(&root);
        let workspace = fs::canonicalize(&configured)
            .with_context(|| format!("resolve workspace {}", configured.display()))?;
        let store = SnapshotStore::new(&workspace, &config.snapshots);
        Ok(Self {
            root,
            workspace,
            config,
            store,
        })
    }

    fn gate(&self) -> Result<SafetyGate> {
        Ok(SafetyGate::new(load_safety_rules(&safety_rules_path(&self.root))?))
    }
}

fn cmd_init(force: bool) -> Result<i32> {
    let cwd = env::current_dir().context("read current directory")?;
    let paths = init_workspace(&cwd, &InitOptions { force })?;
    println!("initialized {}", paths.state_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_run(task: &str, session: Option<u64>, auto: bool) -> Result<i32> {
    let project = Project::open()?;
    let (session_id, state) = match session {
        Some(id) if !project.store.list_snapshots(id)?.is_empty() => {
            (id, project.store.load(id)?.state)
        }
        Some(id) => (id, ExecutorState::default()),
        None => (project.store.next_session_id()?, ExecutorState::default()),
    };
    eprintln!("session {session_id}");

    let model = CommandModelClient::new(&project.config.model, project.config.output_limit_bytes);
    let process = SystemProcessExecutor::new(project.config.output_limit_bytes);
    let mut executor = build_executor(&project, &model, &process, session_id, state)?;
    if auto {
        executor.set_auto_approve(true);
    }
    let outcome = executor.run(task, print_event)?;
    finish_interactive(&mut executor, outcome, session_id)
}

fn cmd_resume(session_id: u64, input: Option<&str>, skip_parse: Option<String>) -> Result<i32> {
    let project = Project::open()?;
    let loaded = project.store.load(session_id)?;
    let model = CommandModelClient::new(&project.config.model, project.config.output_limit_bytes);
    let process = SystemProcessExecutor::new(project.config.output_limit_bytes);
    let mut executor = build_executor(&project, &model, &process, session_id, loaded.state)?;
    if let Some(reason) = skip_parse {
        executor.arm_skip_next_parse(reason);
    }

    let pending = executor.state().pending_commands.clone();
    if !pending.is_empty() {
        return finish_interactive(
            &mut executor,
            RunOutcome::AwaitingApproval { commands: pending },
            session_id,
        );
    }
    let outcome = executor.resume(input.unwrap_or_default(), print_event)?;
    finish_interactive(&mut executor, outcome, session_id)
}

fn build_executor<'a, M: ModelClient, P: ProcessExecutor>(
    project: &Project,
    model: &'a M,
    process: &'a P,
    session_id: u64,
    state: ExecutorState,
) -> Result<Executor<'a, M, P>> {
    let settings = ExecutorSettings::from_config(&project.config, &project.workspace);
    let recorder = project.store.recorder(session_id)?;
    let agents = load_agent_catalog(&agents_dir(&project.root))?;
    Ok(Executor::new(model, process, project.gate()?, settings)
        .with_state(state)
        .with_agents(agents)
        .with_checkpoints(Box::new(recorder)))
}

/// Ask for approvals on the terminal until the run completes or needs input.
fn finish_interactive<M: ModelClient, P: ProcessExecutor>(
    executor: &mut Executor<'_, M, P>,
    mut outcome: RunOutcome,
    session_id: u64,
) -> Result<i32> {
    loop {
        match outcome {
            RunOutcome::Complete { .. } => return Ok(exit_codes::OK),
            RunOutcome::AwaitingInput => {
                eprintln!(
                    "waiting for input: task-agent resume {session_id} \"<message>\""
                );
                return Ok(exit_codes::SUSPENDED);
            }
            RunOutcome::AwaitingApproval { commands } => {
                println!("commands awaiting approval:");
                for spec in &commands {
                    println!("  [{}] {}", spec.tool.tag(), spec.command);
                }
                let Some(answer) = prompt_line("approve? [y]es / [a]ll from now on / anything else rejects: ")?
                else {
                    eprintln!("approval pending: task-agent resume {session_id}");
                    return Ok(exit_codes::SUSPENDED);
                };
                let (decision, note) = ApprovalDecision::from_input(&answer);
                outcome = executor.confirm(decision, note.as_deref(), print_event)?;
            }
        }
    }
}

/// Read one line from stdin; `None` at end of input.
fn prompt_line(prompt: &str) -> Result<Option<String>> {
    print!("{prompt}");
    io::stdout().flush().context("flush stdout")?;
    let mut line = String::new();
    let read = io::stdin()
        .lock()
        .read_line(&mut line)
        .context("read approval answer")?;
    Ok((read > 0).then_some(line))
}

fn print_event(event: RunEvent<'_>) {
    match event {
        RunEvent::Step { depth, result } => {
            let indent = "  ".repeat(depth as usize);
            for output in &result.outputs {
                for line in output.lines() {
                    println!("{indent}{line}");
                }
            }
        }
        RunEvent::ChildStarted { depth, name, task } => {
            println!("[sub-task {} at depth {depth}] {task}", name.unwrap_or("unnamed"));
        }
        RunEvent::ChildCompleted { depth, .. } => {
            println!("[sub-task finished, back at depth {depth}]");
        }
        RunEvent::CommandFinished { spec, result } => {
            println!("$ {}", spec.command);
            println!("{}", result.summary());
        }
        RunEvent::CommandRejected { spec, note } => {
            println!("[rejected] {}: {note}", spec.command);
        }
    }
}

fn cmd_sessions() -> Result<i32> {
    let project = Project::open()?;
    for session in project.store.list_sessions()? {
        println!(
            "{}\t{} snapshots\tlast {}\t{}",
            session.session_id,
            session.snapshot_count,
            session.last_index,
            session.updated_at.as_deref().unwrap_or("-")
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_snapshots(session_id: u64) -> Result<i32> {
    let project = Project::open()?;
    for index in project.store.list_snapshots(session_id)? {
        println!("{index}");
    }
    Ok(exit_codes::OK)
}

fn cmd_rollback(session_id: u64, index: u32) -> Result<i32> {
    let project = Project::open()?;
    let loaded = project.store.rollback(session_id, index)?;
    println!(
        "session {} rolled back to snapshot {} ({:?})",
        loaded.session_id, loaded.snapshot_index, loaded.state.status
    );
    Ok(exit_codes::OK)
}
