use anyhow::{bail, Context};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::{Args, Parser, Subcommand};
use orch_agents::{HeadlessProbe, TmuxProbe};
use orch_beads::{BeadsClient, TrackerClient};
use orch_core::config::{default_config_path, load_or_default_config, save_config, OrchConfig};
use orch_core::state::AgentStatus;
use orch_core::types::{AgentId, AgentRecord, ModelKind};
use orch_core::validation::{has_errors, Validate, ValidationLevel};
use orch_verify::GitEvidence;
use orchd::{
    read_snapshot_file, AgentFilter, CompleteOutcome, JsonlEventLog, LifecycleController, Registry,
    SpawnRequest, TeardownOutcome,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const EXIT_FAILURE: i32 = 1;
const EXIT_REFUSED: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "orch", version, about = "Spawn, track, and retire coding agents")]
struct Cli {
    /// Config file; defaults to ~/.orch/config.toml.
    #[arg(long, global = true, env = "ORCH_CONFIG")]
    config: Option<PathBuf>,
    /// Log more (-v info, -vv debug). ORCH_LOG overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start an agent on a task.
    Spawn(SpawnArgs),
    /// Reconcile and list agents.
    Status(StatusArgs),
    /// Verify an agent's work, then retire it.
    Complete {
        id: String,
        /// Accept committed work without a `Phase: Complete` line.
        #[arg(long)]
        force: bool,
        #[arg(long)]
        json: bool,
    },
    /// Give up on an active agent.
    Abandon {
        id: String,
        #[arg(long, default_value = "abandoned by user")]
        reason: String,
    },
    /// Type a line into an agent's window.
    Send { id: String, text: String },
    /// Switch to an agent's window.
    Focus { id: String },
    /// Finish teardowns deferred by agents that completed themselves.
    Sweep,
    /// Reconcile, sweep, and tombstone finished agents.
    Clean {
        /// Also purge tombstones older than this many days.
        #[arg(long)]
        purge_older_than_days: Option<u32>,
    },
    /// Remove one tombstoned record for good.
    Purge { id: String },
    /// Fold another registry file into this one.
    Merge { file: PathBuf },
    /// Print the lifecycle event log.
    Events {
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        json: bool,
    },
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Debug, Args)]
struct SpawnArgs {
    task: String,
    /// Project directory; defaults to the current directory.
    #[arg(long)]
    project: Option<PathBuf>,
    #[arg(long)]
    model: Option<ModelKind>,
    #[arg(long)]
    skill: Option<String>,
    /// Tracker issue the agent works on.
    #[arg(long)]
    issue: Option<String>,
    /// Run as a detached process instead of a tmux window.
    #[arg(long)]
    headless: bool,
    #[arg(long)]
    prompt: Option<String>,
    /// Extra arguments for the agent CLI, after `--`.
    #[arg(last = true)]
    extra_args: Vec<String>,
}

#[derive(Debug, Args)]
struct StatusArgs {
    #[arg(long)]
    project: Option<PathBuf>,
    #[arg(long)]
    status: Option<AgentStatus>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration.
    Show,
    /// Check the configuration for problems.
    Validate,
    /// Write a default config file.
    Init {
        #[arg(long)]
        force: bool,
    },
}

/// How a successful run should exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Done,
    Refused,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match run(cli) {
        Ok(Outcome::Done) => {}
        Ok(Outcome::Refused) => std::process::exit(EXIT_REFUSED),
        Err(err) => {
            eprintln!("orch: {err:#}");
            std::process::exit(EXIT_FAILURE);
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_env("ORCH_LOG").unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> anyhow::Result<Outcome> {
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let command = match cli.command {
        Command::Config(command) => return run_config(&command, &config_path),
        command => command,
    };

    let config = load_or_default_config(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let registry = Registry::from_config(&config);
    let backends = Backends::from_config(&config);
    let controller = backends.controller(&config, &registry);

    match command {
        Command::Spawn(args) => run_spawn(&controller, args),
        Command::Status(args) => run_status(&controller, args),
        Command::Complete { id, force, json } => run_complete(&controller, &id, force, json),
        Command::Abandon { id, reason } => {
            let outcome = controller.abandon(&AgentId::new(id), &reason)?;
            println!(
                "{} abandoned ({})",
                outcome.record.id,
                describe_teardown(&outcome.teardown)
            );
            Ok(Outcome::Done)
        }
        Command::Send { id, text } => {
            controller.send(&AgentId::new(id), &text)?;
            Ok(Outcome::Done)
        }
        Command::Focus { id } => {
            controller.focus(&AgentId::new(id))?;
            Ok(Outcome::Done)
        }
        Command::Sweep => {
            let report = controller.sweep()?;
            if report.skipped_unknown_observer {
                bail!("cannot tell which tmux window this is; run `orch sweep` from outside the agent's window");
            }
            for id in &report.skipped_self {
                println!("{id}: skipped (this is its own window)");
            }
            for (id, outcome) in &report.finished {
                println!("{id}: {}", describe_teardown(outcome));
            }
            Ok(Outcome::Done)
        }
        Command::Clean {
            purge_older_than_days,
        } => {
            let age = purge_older_than_days.map(|days| ChronoDuration::days(i64::from(days)));
            let report = controller.clean(age)?;
            for (id, transition) in &report.reconcile.transitions {
                println!("{id}: {} -> {}", transition.from, transition.to);
            }
            for inconclusive in &report.reconcile.inconclusive {
                eprintln!("{}: left unchanged ({})", inconclusive.id, inconclusive.reason);
            }
            for (id, outcome) in &report.sweep.finished {
                println!("{id}: {}", describe_teardown(outcome));
            }
            println!(
                "tombstoned {}, purged {}",
                report.tombstoned.len(),
                report.purged.len()
            );
            Ok(Outcome::Done)
        }
        Command::Purge { id } => {
            let record = controller.purge(&AgentId::new(id))?;
            println!("purged {}", record.id);
            Ok(Outcome::Done)
        }
        Command::Merge { file } => {
            let snapshot = read_snapshot_file(&file)?;
            let report = registry.merge(snapshot)?;
            println!(
                "merged {}: {} added, {} updated, {} unchanged",
                file.display(),
                report.added.len(),
                report.updated.len(),
                report.unchanged
            );
            Ok(Outcome::Done)
        }
        Command::Events { agent, json } => {
            let log = registry
                .event_log()
                .cloned()
                .unwrap_or_else(|| JsonlEventLog::new(config.events_path()));
            let agent = agent.map(AgentId::new);
            for event in log.read(agent.as_ref())? {
                if json {
                    println!("{}", serde_json::to_string(&event)?);
                } else {
                    let who = event
                        .agent_id
                        .as_ref()
                        .map(AgentId::to_string)
                        .unwrap_or_else(|| "-".to_string());
                    println!("{} {who} {}", event.at.to_rfc3339(), event.kind.name());
                }
            }
            Ok(Outcome::Done)
        }
        Command::Config(command) => run_config(&command, &config_path),
    }
}

/// The real probe, tracker, and evidence implementations.
struct Backends {
    tmux: TmuxProbe,
    headless: HeadlessProbe,
    tracker: Option<BeadsClient>,
    evidence: GitEvidence,
}

impl Backends {
    fn from_config(config: &OrchConfig) -> Self {
        let tracker = config.tracker.enabled.then(|| {
            BeadsClient::new(
                &config.tracker.binary,
                Duration::from_secs(config.tracker.timeout_secs),
            )
        });
        Self {
            tmux: TmuxProbe::new(&config.tmux.binary, config.tmux.exit_input.clone()),
            headless: HeadlessProbe::new(config.agent.shell.clone()),
            tracker,
            evidence: GitEvidence::default(),
        }
    }

    fn controller<'a>(
        &'a self,
        config: &'a OrchConfig,
        registry: &'a Registry,
    ) -> LifecycleController<'a> {
        LifecycleController::new(
            config,
            registry,
            &self.tmux,
            &self.headless,
            self.tracker.as_ref().map(|client| client as &dyn TrackerClient),
            &self.evidence,
        )
    }
}

fn run_spawn(controller: &LifecycleController<'_>, args: SpawnArgs) -> anyhow::Result<Outcome> {
    let project = resolve_project(args.project.as_deref())?;
    let request = SpawnRequest {
        project_path: project,
        task: args.task,
        prompt: args.prompt,
        model: args.model,
        skill: args.skill,
        issue: args.issue,
        headless: args.headless,
        extra_args: args.extra_args,
    };
    let record = controller.spawn(request)?;
    println!("{}", record.id);
    println!("  runs in {}", record.backend);
    if let Some(workspace) = &record.workspace_ref {
        println!("  workspace {}", workspace.display());
    }
    Ok(Outcome::Done)
}

fn run_status(controller: &LifecycleController<'_>, args: StatusArgs) -> anyhow::Result<Outcome> {
    let mut filter = AgentFilter::all();
    if let Some(status) = args.status {
        filter.statuses = vec![status];
    }
    if let Some(project) = args.project.as_deref() {
        filter = filter.with_project(resolve_project(Some(project))?);
    }

    let (report, records) = controller.status(&filter)?;
    for inconclusive in &report.inconclusive {
        eprintln!(
            "warning: {} could not be checked ({})",
            inconclusive.id, inconclusive.reason
        );
    }
    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else if records.is_empty() {
        println!("no agents");
    } else {
        let now = Utc::now();
        for record in &records {
            println!("{}", status_line(record, now));
        }
    }
    Ok(Outcome::Done)
}

fn run_complete(
    controller: &LifecycleController<'_>,
    id: &str,
    force: bool,
    json: bool,
) -> anyhow::Result<Outcome> {
    let id = AgentId::new(id);
    match controller.complete(&id, force)? {
        CompleteOutcome::Refused(result) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            eprintln!("cannot complete {id}:\n{}", result.render());
            Ok(Outcome::Refused)
        }
        CompleteOutcome::Completed {
            record,
            verification,
            teardown,
            tombstoned,
        } => {
            if json {
                println!("{}", serde_json::to_string_pretty(&verification)?);
            }
            println!("{} completed ({})", record.id, describe_teardown(&teardown));
            if !tombstoned && teardown == TeardownOutcome::Deferred {
                println!("  run `orch sweep` from another terminal to close its window");
            }
            Ok(Outcome::Done)
        }
    }
}

fn run_config(command: &ConfigCommand, path: &Path) -> anyhow::Result<Outcome> {
    match command {
        ConfigCommand::Show => {
            let config = load_or_default_config(path)?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigCommand::Validate => {
            let config = load_or_default_config(path)?;
            let issues = config.validate();
            for issue in &issues {
                let level = match issue.level {
                    ValidationLevel::Error => "error",
                    ValidationLevel::Warning => "warning",
                };
                println!("{level}: {} ({})", issue.message, issue.code);
            }
            if has_errors(&issues) {
                bail!("{} is invalid", path.display());
            }
            println!("{} ok", path.display());
        }
        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                bail!("{} already exists; pass --force to overwrite", path.display());
            }
            save_config(path, &OrchConfig::default())?;
            println!("wrote {}", path.display());
        }
    }
    Ok(Outcome::Done)
}

fn resolve_project(project: Option<&Path>) -> anyhow::Result<PathBuf> {
    let path = match project {
        Some(path) => path.to_path_buf(),
        None => std::env::current_dir().context("reading current directory")?,
    };
    fs::canonicalize(&path).with_context(|| format!("project {} not found", path.display()))
}

fn status_line(record: &AgentRecord, now: DateTime<Utc>) -> String {
    let mut line = format!(
        "{:<48} {:<10} {:<8} {:>6}  {}",
        record.id.as_str(),
        record.status.to_string(),
        record.backend.as_str(),
        format_age(now - record.created_at),
        record.project_path.display()
    );
    if record.teardown_pending {
        line.push_str("  [teardown pending]");
    }
    if let Some(reason) = &record.status_reason {
        line.push_str(&format!("  ({reason})"));
    }
    line
}

fn format_age(age: ChronoDuration) -> String {
    let secs = age.num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3_599 => format!("{}m", secs / 60),
        3_600..=86_399 => format!("{}h", secs / 3_600),
        _ => format!("{}d", secs / 86_400),
    }
}

fn describe_teardown(outcome: &TeardownOutcome) -> String {
    match outcome {
        TeardownOutcome::AlreadyGone => "process already gone".to_string(),
        TeardownOutcome::Graceful => "shut down".to_string(),
        TeardownOutcome::Forced => "killed after grace period".to_string(),
        TeardownOutcome::Deferred => "teardown deferred".to_string(),
        TeardownOutcome::LeftRunning => "still running; kill it by hand if needed".to_string(),
        TeardownOutcome::Failed(message) => format!("teardown failed: {message}"),
    }
}
