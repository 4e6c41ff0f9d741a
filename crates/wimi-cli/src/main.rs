//! `wimi` command-line front end.

mod demo;

use clap::{Parser, Subcommand};
use demo::{DemoExecutor, LayeredSwitches};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wimi_core::{FixedTaskAnalyzer, WimiError};
use wimi_orchestrator::{
    AgentRegistry, ApprovalDecision, ApprovalRequest, CollectingNotifier, EnvFallbackSwitches,
    Orchestrator, OrchestratorConfig, PlannerPolicy, SequencePlanner, StaticFallbackSwitches,
    StepOutcome, WorkflowStatus,
};
use wimi_telemetry::ExportFormat;

#[derive(Parser)]
#[command(name = "wimi", about = "WIMI: human-in-the-loop workflow orchestration")]
struct Cli {
    /// Path to config file (optional; defaults apply when missing)
    #[arg(short, long, default_value = "wimi.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered agents
    Agents,
    /// Compute an execution sequence
    Plan {
        /// Required agents, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        agents: Vec<String>,
        /// Optional agents, comma separated
        #[arg(long, value_delimiter = ',')]
        optional: Vec<String>,
    },
    /// Check an explicit sequence against the dependency rules
    Validate {
        /// Agent ids in execution order, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        sequence: Vec<String>,
    },
    /// Run a demo investigation with offline agents
    Run {
        /// Task description
        #[arg(long)]
        task: String,
        /// Agents the task needs
        #[arg(
            long,
            value_delimiter = ',',
            default_value = "gmail,invoice,salesforce,analysis"
        )]
        agents: Vec<String>,
        /// Approve both gates without prompting
        #[arg(long)]
        auto_approve: bool,
        /// Agents whose integration is simulated as unreachable
        #[arg(long, value_delimiter = ',')]
        unreachable: Vec<String>,
        /// Write the plan's event log to this file
        #[arg(long)]
        export: Option<PathBuf>,
        /// Export format (json or jsonl)
        #[arg(long, default_value = "jsonl", value_parser = parse_format)]
        format: ExportFormat,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = load_config(&cli.config).await?;
    let registry = AgentRegistry::default_catalog();

    match cli.command {
        Commands::Agents => {
            println!("Registered agents:");
            for agent in registry.list() {
                println!("  {} [{}] - {}", agent.id, agent.category.as_str(), agent.description);
                if !agent.dependencies.is_empty() {
                    println!("    needs:    {}", join(&agent.dependencies));
                }
                println!("    provides: {}", join(&agent.provides));
                if let Some(integration) = &agent.integration {
                    println!("    integration: {integration}");
                }
            }
            println!("\nTotal: {} agent(s)", registry.len());
        }
        Commands::Plan { agents, optional } => {
            let planner = planner(registry, config.planner);
            let outcome = planner.plan(&agents, &optional);
            println!("Sequence: {}", outcome.sequence.join(" -> "));
            for warning in &outcome.warnings {
                println!("  warning: {warning}");
            }
            if !outcome.unknown_agents.is_empty() {
                println!("  unknown: {}", outcome.unknown_agents.join(", "));
            }
            println!("{}", serde_json::to_string_pretty(&outcome.validation)?);
        }
        Commands::Validate { sequence } => {
            let planner = planner(registry, config.planner);
            let report = planner.validate(&sequence);
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.valid {
                anyhow::bail!("sequence is not valid");
            }
        }
        Commands::Run {
            task,
            agents,
            auto_approve,
            unreachable,
            export,
            format,
        } => {
            let registry = Arc::new(registry);
            let switches = LayeredSwitches::new(
                StaticFallbackSwitches::new(config.resilience.mock_fallback.clone()),
                EnvFallbackSwitches::new(),
            );
            let notifier = Arc::new(CollectingNotifier::new());
            let sweep_interval = config.sweep_interval();

            let orchestrator = Arc::new(
                Orchestrator::builder(config)
                    .registry((*registry).clone())
                    .analyzer(Arc::new(FixedTaskAnalyzer::new(agents)))
                    .executor(Arc::new(DemoExecutor::new(Arc::clone(&registry), unreachable)))
                    .notifier(notifier.clone())
                    .fallback_switches(Arc::new(switches))
                    .build()
                    .await?,
            );
            let sweeper = orchestrator.spawn_expiry_sweeper(sweep_interval);

            let mut stdin = BufReader::new(tokio::io::stdin()).lines();
            let result = run(&orchestrator, &task, auto_approve, &mut stdin).await;
            sweeper.abort();
            let plan_id = result?;

            if let Some(path) = export {
                let log = orchestrator.export_log(&plan_id, format)?;
                tokio::fs::write(&path, log).await?;
                info!(path = %path.display(), "Event log exported");
            }

            let metrics = orchestrator.get_metrics();
            println!(
                "\nStability: {:?} ({} error(s) in window), notifications sent: {}",
                metrics.stability,
                metrics.errors_in_window,
                notifier.sent().len()
            );
        }
    }

    Ok(())
}

async fn load_config(path: &Path) -> anyhow::Result<OrchestratorConfig> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => {
            let config = OrchestratorConfig::from_toml(&text)?;
            info!(path = %path.display(), "Config loaded");
            Ok(config)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "No config file, using defaults");
            Ok(OrchestratorConfig::default())
        }
        Err(e) => Err(anyhow::anyhow!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        )),
    }
}

fn parse_format(value: &str) -> Result<ExportFormat, String> {
    value.parse().map_err(|e: WimiError| e.to_string())
}

fn planner(registry: AgentRegistry, policy: PlannerPolicy) -> SequencePlanner {
    SequencePlanner::new(Arc::new(registry), policy)
}

fn join<T: ToString>(items: &[T]) -> String {
    items.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Submit, approve, execute and finalise one plan. Returns the plan id.
async fn run(
    orchestrator: &Orchestrator,
    task: &str,
    auto_approve: bool,
    stdin: &mut Lines<BufReader<Stdin>>,
) -> anyhow::Result<String> {
    let plan_id = orchestrator.submit_task(task, "cli").await?;
    println!("Plan {plan_id}");

    loop {
        let Some(request) = orchestrator.approvals().pending(&plan_id) else {
            let ctx = orchestrator.get_status(&plan_id).await?;
            println!("Plan ended before approval: {}", ctx.status);
            return Ok(plan_id);
        };
        print_request(&request);

        let decision = if auto_approve {
            ApprovalDecision::Approve
        } else {
            let answer = prompt(stdin, "Approve plan? [y]es / [n]o / m <agent,agent,...>").await?;
            parse_plan_answer(&answer)
        };
        match orchestrator
            .decide_plan_approval(&plan_id, decision, None)
            .await
        {
            Ok(outcome) if outcome.follow_up.is_some() => continue,
            Ok(outcome) if outcome.context.status == WorkflowStatus::PlanApproved => break,
            Ok(outcome) => {
                println!("Plan {}", outcome.context.status);
                return Ok(plan_id);
            }
            Err(err @ (WimiError::Validation(_) | WimiError::UserInput(_))) => {
                warn!(error = %err, "Decision refused");
                println!("  {err}");
                if auto_approve {
                    return Err(err.into());
                }
            }
            Err(err) => return Err(err.into()),
        }
    }

    let ctx = orchestrator.execute(&plan_id).await?;
    for step in &ctx.steps {
        let marker = match step.outcome {
            StepOutcome::Succeeded => "ok",
            StepOutcome::PartialSuccess => "partial",
            StepOutcome::Mocked => "mocked",
            StepOutcome::Failed => "FAILED",
        };
        println!("  [{marker:>7}] {} ({:.2}s)", step.agent_id, step.duration_seconds);
    }
    if ctx.status != WorkflowStatus::AwaitingFinalApproval {
        let reason = ctx.failure.map(|f| f.reason).unwrap_or_default();
        println!("Execution stopped: {} {reason}", ctx.status);
        return Ok(plan_id);
    }

    if let Some(request) = orchestrator.approvals().pending(&plan_id) {
        print_request(&request);
    }
    let approve = if auto_approve {
        true
    } else {
        let answer = prompt(stdin, "Accept results? [y/N]").await?;
        matches!(answer.as_str(), "y" | "yes")
    };
    let outcome = orchestrator
        .decide_final_approval(&plan_id, approve, None)
        .await?;
    println!("Plan {}", outcome.context.status);
    Ok(plan_id)
}

fn print_request(request: &ApprovalRequest) {
    println!(
        "\n{:?} approval requested (expires {}):",
        request.kind,
        request.timeout_at.format("%H:%M:%S")
    );
    for (position, agent) in request.proposal.agents.iter().enumerate() {
        let reasoning = request
            .proposal
            .reasoning
            .get(agent)
            .map(String::as_str)
            .unwrap_or("");
        println!("  {}. {agent}: {reasoning}", position + 1);
    }
    if let Some(validation) = &request.validation {
        for note in &validation.recommendations {
            println!("  note: {note}");
        }
    }
}

fn parse_plan_answer(answer: &str) -> ApprovalDecision {
    match answer.split_once(' ') {
        Some(("m" | "modify", agents)) => ApprovalDecision::Modify(
            agents
                .split(',')
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .collect(),
        ),
        _ if matches!(answer, "y" | "yes") => ApprovalDecision::Approve,
        _ => ApprovalDecision::Reject,
    }
}

/// Read one trimmed, lowercased line. End of input reads as an empty answer.
async fn prompt(stdin: &mut Lines<BufReader<Stdin>>, question: &str) -> anyhow::Result<String> {
    println!("{question}");
    Ok(stdin
        .next_line()
        .await?
        .map(|line| line.trim().to_ascii_lowercase())
        .unwrap_or_default())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plan_answer() {
        assert!(matches!(parse_plan_answer("y"), ApprovalDecision::Approve));
        assert!(matches!(parse_plan_answer(""), ApprovalDecision::Reject));
        match parse_plan_answer("m planner, gmail,analysis") {
            ApprovalDecision::Modify(agents) => {
                assert_eq!(agents, vec!["planner", "gmail", "analysis"]);
            }
            _ => panic!("expected a modification"),
        }
    }

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "wimi",
            "run",
            "--task",
            "Check ACME",
            "--agents",
            "gmail,analysis",
            "--auto-approve",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                agents,
                auto_approve,
                format,
                ..
            } => {
                assert_eq!(agents, vec!["gmail", "analysis"]);
                assert!(auto_approve);
                assert_eq!(format, ExportFormat::Jsonl);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_export_format() {
        let parse = |format: &str| {
            Cli::try_parse_from(["wimi", "run", "--task", "Check ACME", "--format", format])
        };
        assert!(parse("xml").is_err());
        match parse("json").unwrap().command {
            Commands::Run { format, .. } => assert_eq!(format, ExportFormat::Json),
            _ => panic!("expected run"),
        }
    }

    #[tokio::test]
    async fn test_missing_config_uses_defaults() {
        let config = load_config(Path::new("/nonexistent/wimi.toml"))
            .await
            .unwrap();
        assert_eq!(config, OrchestratorConfig::default());
    }
}
