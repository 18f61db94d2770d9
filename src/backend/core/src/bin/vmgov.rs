//! vmgov CLI - submit, approve and inspect governed VM changes.
//!
//! Talks to the pipeline database directly; every write goes through the
//! transactional enqueuer, so the CLI is subject to the same rules as any
//! other caller.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::*;
use serde::Serialize;
use std::sync::Arc;
use tabled::{
    settings::{object::Columns, Alignment, Modify, Style},
    Table, Tabled,
};

use vmgov_core::{
    config::Config,
    governance::{
        get_effective_spec, ApproveRequest, Event, EventId, EventStatus, JobCancellation,
        Requester, RuleBasedApprovalPolicy, SubmitRequest, TicketId, TransactionalEnqueuer,
    },
    jobs::JobPriority,
    provider::VmOperation,
    store::{EventFilter, PgStore, Store},
};

// ═══════════════════════════════════════════════════════════════════════════════
// CLI Structure
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Parser)]
#[command(
    name = "vmgov",
    version,
    about = "Governed VM change requests",
    long_about = "Submit VM change requests, decide approval tickets and inspect the execution pipeline.",
    propagate_version = true
)]
struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Configuration file path
    #[arg(short, long, global = true, env = "VMGOV_CONFIG")]
    config: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply database migrations
    Migrate,

    /// Submit a change request
    Submit(SubmitArgs),

    /// Approve a pending ticket and enqueue its job
    Approve(ApproveArgs),

    /// Reject a pending ticket
    Reject(DecisionArgs),

    /// Withdraw a pending ticket
    Cancel(DecisionArgs),

    /// Cancel the job of an approved request
    CancelJob {
        /// Request event ID
        event_id: String,

        /// Who is cancelling
        #[arg(long, env = "VMGOV_USER")]
        actor: String,
    },

    /// Show a request with its ticket, job and outcomes
    Show {
        /// Request event ID
        event_id: String,
    },

    /// List events
    Events {
        /// Filter by status
        #[arg(short, long)]
        status: Option<String>,

        /// Filter by aggregate ID
        #[arg(short, long)]
        aggregate: Option<String>,

        /// Include archived events
        #[arg(long)]
        all: bool,

        /// Maximum number of events
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// List tickets awaiting a decision
    Pending {
        /// Maximum number of tickets
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Counts per status for events, tickets and jobs
    Summary,

    /// Configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Args)]
struct SubmitArgs {
    /// Operation (create, delete, power_on, power_off, restart, reconfigure, migrate)
    #[arg(short, long)]
    operation: String,

    /// Target ID
    #[arg(short, long)]
    aggregate: String,

    /// Target type
    #[arg(long, default_value = "vm")]
    aggregate_type: String,

    /// Requested parameters as a JSON object
    #[arg(short, long, default_value = "{}")]
    spec: String,

    /// Who is asking
    #[arg(long, env = "VMGOV_USER")]
    requester: String,

    /// Requester roles
    #[arg(long = "role")]
    roles: Vec<String>,

    /// Why the change is needed
    #[arg(short, long)]
    reason: Option<String>,

    /// Job priority (low, normal, high, critical)
    #[arg(short, long)]
    priority: Option<String>,
}

#[derive(Args)]
struct ApproveArgs {
    /// Ticket ID
    ticket_id: String,

    /// Who is approving
    #[arg(long, env = "VMGOV_USER")]
    approver: String,

    /// Field overrides as a JSON object
    #[arg(short, long)]
    spec: Option<String>,

    /// Approval comment
    #[arg(long)]
    comment: Option<String>,

    /// Job priority (low, normal, high, critical)
    #[arg(short, long)]
    priority: Option<String>,
}

#[derive(Args)]
struct DecisionArgs {
    /// Ticket ID
    ticket_id: String,

    /// Who is deciding
    #[arg(long, env = "VMGOV_USER")]
    actor: String,

    /// Reason recorded on the ticket
    #[arg(short, long)]
    reason: Option<String>,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Load and validate the configuration
    Validate,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Display Types
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Tabled, Serialize)]
struct EventRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Type")]
    event_type: String,
    #[tabled(rename = "Target")]
    target: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "By")]
    created_by: String,
    #[tabled(rename = "Created")]
    created_at: String,
}

impl From<&Event> for EventRow {
    fn from(event: &Event) -> Self {
        Self {
            id: event.id.to_string(),
            event_type: event.event_type.to_string(),
            target: format!("{}/{}", event.aggregate_type, event.aggregate_id),
            status: event.status.to_string(),
            created_by: event.created_by.clone(),
            created_at: format_time(event.created_at),
        }
    }
}

#[derive(Tabled, Serialize)]
struct TicketRow {
    #[tabled(rename = "Ticket")]
    id: String,
    #[tabled(rename = "Event")]
    event_id: String,
    #[tabled(rename = "Requested by")]
    created_by: String,
    #[tabled(rename = "Reason")]
    reason: String,
    #[tabled(rename = "Waiting since")]
    created_at: String,
}

#[derive(Tabled, Serialize)]
struct CountRow {
    #[tabled(rename = "Entity")]
    entity: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Count")]
    count: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Entry Point
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let output = OutputHelper::new(cli.format, cli.no_color);

    if let Err(e) = run(cli, &output).await {
        output.print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli, output: &OutputHelper) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Config(cmd) => handle_config(cmd, &config, output),
        Commands::Migrate => {
            let store = PgStore::connect(&config.database).await?;
            store.migrate().await?;
            output.print_success("Migrations applied");
            Ok(())
        }
        command => {
            let store: Arc<dyn Store> = Arc::new(PgStore::connect(&config.database).await?);
            let enqueuer = TransactionalEnqueuer::new(
                store.clone(),
                Arc::new(RuleBasedApprovalPolicy::new(&config.approval)),
                config.enqueuer.clone(),
                config.retry.clone(),
            );
            handle_pipeline(command, store.as_ref(), &enqueuer, output).await
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Command Handlers
// ═══════════════════════════════════════════════════════════════════════════════

async fn handle_pipeline(
    command: Commands,
    store: &dyn Store,
    enqueuer: &TransactionalEnqueuer,
    output: &OutputHelper,
) -> Result<()> {
    match command {
        Commands::Submit(args) => {
            let operation: VmOperation = args.operation.parse()?;
            let spec: serde_json::Value =
                serde_json::from_str(&args.spec).context("--spec is not valid JSON")?;
            let mut requester = Requester::new(args.requester);
            for role in args.roles {
                requester = requester.with_role(role);
            }

            let submission = enqueuer
                .submit(SubmitRequest {
                    requester,
                    operation,
                    aggregate_type: args.aggregate_type,
                    aggregate_id: args.aggregate,
                    spec,
                    reason: args.reason,
                    priority: parse_priority(args.priority.as_deref())?,
                })
                .await?;

            if matches!(output.format, OutputFormat::Json) {
                return output.print_json(&submission);
            }
            if submission.auto_approved {
                output.print_success("Request auto-approved and enqueued");
            } else {
                output.print_info("Request awaiting approval");
            }
            output.print_key_value("Event", &submission.event_id.to_string());
            output.print_key_value("Ticket", &submission.ticket_id.to_string());
            if let Some(job_id) = submission.job_id {
                output.print_key_value("Job", &job_id.to_string());
            }
        }

        Commands::Approve(args) => {
            let mut request = ApproveRequest::new(args.ticket_id.parse::<TicketId>()?, args.approver);
            if let Some(spec) = args.spec {
                request = request.with_modified_spec(
                    serde_json::from_str(&spec).context("--spec is not valid JSON")?,
                );
            }
            if let Some(comment) = args.comment {
                request = request.with_comment(comment);
            }
            request.priority = parse_priority(args.priority.as_deref())?;

            let job_id = enqueuer.approve_and_enqueue(request).await?;
            match output.format {
                OutputFormat::Json => output.print_json(&serde_json::json!({ "job_id": job_id }))?,
                _ => output.print_success(&format!("Ticket approved, job {} enqueued", job_id)),
            }
        }

        Commands::Reject(args) => {
            enqueuer
                .reject(args.ticket_id.parse()?, &args.actor, args.reason)
                .await?;
            output.print_success("Ticket rejected");
        }

        Commands::Cancel(args) => {
            enqueuer
                .cancel(args.ticket_id.parse()?, &args.actor, args.reason)
                .await?;
            output.print_success("Ticket cancelled");
        }

        Commands::CancelJob { event_id, actor } => {
            match enqueuer.cancel_job(event_id.parse()?, &actor).await? {
                JobCancellation::Discarded => output.print_success("Job discarded, request cancelled"),
                JobCancellation::Requested => output.print_warning(
                    "Job is running; it will be cancelled instead of retried if the current call fails",
                ),
            }
        }

        Commands::Show { event_id } => {
            let event_id: EventId = event_id.parse()?;
            handle_show(event_id, store, output).await?;
        }

        Commands::Events {
            status,
            aggregate,
            all,
            limit,
        } => {
            let filter = EventFilter {
                status: status.as_deref().map(str::parse::<EventStatus>).transpose()?,
                aggregate_id: aggregate,
                include_archived: all,
                limit,
            };
            let rows: Vec<EventRow> = store.list_events(&filter).await?.iter().map(EventRow::from).collect();
            output.print_table(&rows)?;
        }

        Commands::Pending { limit } => {
            let rows: Vec<TicketRow> = store
                .list_pending_tickets(limit)
                .await?
                .into_iter()
                .map(|t| TicketRow {
                    id: t.id.to_string(),
                    event_id: t.event_id.to_string(),
                    created_by: t.created_by,
                    reason: t.request_reason.unwrap_or_default(),
                    created_at: format_time(t.created_at),
                })
                .collect();
            output.print_table(&rows)?;
        }

        Commands::Summary => {
            let summary = store.summary().await?;
            if matches!(output.format, OutputFormat::Json) {
                return output.print_json(&summary);
            }
            let mut rows = Vec::new();
            for (entity, counts) in [
                ("events", &summary.events),
                ("tickets", &summary.tickets),
                ("jobs", &summary.jobs),
            ] {
                rows.extend(counts.iter().map(|(status, count)| CountRow {
                    entity: entity.to_string(),
                    status: format_status(status),
                    count: *count,
                }));
            }
            output.print_header("Pipeline Summary");
            output.print_table(&rows)?;
        }

        Commands::Migrate | Commands::Config(_) => {
            anyhow::bail!("command does not operate on the pipeline")
        }
    }

    Ok(())
}

async fn handle_show(event_id: EventId, store: &dyn Store, output: &OutputHelper) -> Result<()> {
    let event = store
        .get_event(event_id)
        .await?
        .with_context(|| format!("event {} not found", event_id))?;
    let ticket = store.ticket_for_event(event_id).await?;
    let job = store.job_for_event(event_id).await?;
    let outcomes = store.outcome_events(event_id).await?;
    let effective = get_effective_spec(event.payload(), ticket.as_ref().and_then(|t| t.modified_spec.as_ref()))?;

    if matches!(output.format, OutputFormat::Json) {
        return output.print_json(&serde_json::json!({
            "event": event,
            "effective_spec": effective.to_value(),
            "ticket": ticket,
            "job": job,
            "outcomes": outcomes,
        }));
    }

    output.print_header(&format!("Request {}", event.id));
    output.print_key_value("Operation", event.operation().as_str());
    output.print_key_value("Target", &format!("{}/{}", event.aggregate_type, event.aggregate_id));
    output.print_key_value("Status", &format_status(event.status.as_str()));
    output.print_key_value("Requested by", &event.created_by);
    output.print_key_value("Created", &format_time(event.created_at));
    output.print_key_value("Spec", &serde_json::to_string(&effective.to_value())?);

    if let Some(ticket) = &ticket {
        output.print_header("Ticket");
        output.print_key_value("ID", &ticket.id.to_string());
        output.print_key_value("Status", &format_status(ticket.status.as_str()));
        if let Some(by) = &ticket.decided_by {
            output.print_key_value("Decided by", by);
        }
        if let Some(reason) = &ticket.decision_reason {
            output.print_key_value("Reason", reason);
        }
    }

    if let Some(job) = &job {
        output.print_header("Job");
        output.print_key_value("ID", &job.id.to_string());
        output.print_key_value("State", &format_status(job.state.as_str()));
        output.print_key_value("Attempts", &format!("{}/{}", job.attempt, job.max_attempts));
        output.print_key_value("Priority", &format!("{:?}", job.priority).to_lowercase());
        if let Some(lease) = &job.lease {
            output.print_key_value("Leased by", &lease.owner);
            output.print_key_value("Lease expires", &format_time(lease.expires_at));
        }
        if let Some(err) = &job.last_error {
            output.print_key_value("Last error", &err.red().to_string());
        }
    }

    if !outcomes.is_empty() {
        output.print_header("Outcomes");
        let rows: Vec<EventRow> = outcomes.iter().map(EventRow::from).collect();
        output.print_table(&rows)?;
    }

    Ok(())
}

fn handle_config(cmd: ConfigCommands, config: &Config, output: &OutputHelper) -> Result<()> {
    match cmd {
        ConfigCommands::Show => match output.format {
            OutputFormat::Json => output.print_json(config)?,
            _ => println!("{}", toml::to_string_pretty(config)?),
        },
        ConfigCommands::Validate => {
            config.validate()?;
            output.print_success("Configuration is valid");
        }
    }
    Ok(())
}

fn parse_priority(raw: Option<&str>) -> Result<Option<JobPriority>> {
    Ok(raw.map(str::parse::<JobPriority>).transpose()?)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Output Helpers
// ═══════════════════════════════════════════════════════════════════════════════

struct OutputHelper {
    format: OutputFormat,
}

impl OutputHelper {
    fn new(format: OutputFormat, no_color: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format }
    }

    fn print_success(&self, message: &str) {
        match self.format {
            OutputFormat::Json => {
                println!("{}", serde_json::json!({ "status": "success", "message": message }));
            }
            _ => {
                println!("{} {}", "[OK]".green().bold(), message);
            }
        }
    }

    fn print_error(&self, message: &str) {
        match self.format {
            OutputFormat::Json => {
                eprintln!("{}", serde_json::json!({ "status": "error", "message": message }));
            }
            _ => {
                eprintln!("{} {}", "[ERROR]".red().bold(), message);
            }
        }
    }

    fn print_warning(&self, message: &str) {
        match self.format {
            OutputFormat::Json => {
                println!("{}", serde_json::json!({ "status": "warning", "message": message }));
            }
            _ => {
                println!("{} {}", "[WARN]".yellow().bold(), message);
            }
        }
    }

    fn print_info(&self, message: &str) {
        match self.format {
            OutputFormat::Json => {
                println!("{}", serde_json::json!({ "status": "info", "message": message }));
            }
            _ => {
                println!("{} {}", "[INFO]".blue().bold(), message);
            }
        }
    }

    fn print_table<T: Tabled + Serialize>(&self, items: &[T]) -> Result<()> {
        match self.format {
            OutputFormat::Json => self.print_json(&items),
            _ => {
                if items.is_empty() {
                    println!("{}", "No results found.".dimmed());
                    return Ok(());
                }
                let table = Table::new(items)
                    .with(Style::rounded())
                    .with(Modify::new(Columns::first()).with(Alignment::left()))
                    .to_string();
                println!("{}", table);
                Ok(())
            }
        }
    }

    fn print_json<T: Serialize + ?Sized>(&self, data: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(data)?;
        println!("{}", json);
        Ok(())
    }

    fn print_header(&self, title: &str) {
        if !matches!(self.format, OutputFormat::Json) {
            println!();
            println!("{}", title.bold().underline());
            println!();
        }
    }

    fn print_key_value(&self, key: &str, value: &str) {
        if !matches!(self.format, OutputFormat::Json) {
            println!("  {}: {}", key.cyan(), value);
        }
    }
}

fn format_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn format_status(status: &str) -> String {
    match status {
        "pending" | "pending_approval" | "retryable" => status.yellow().to_string(),
        "approved" | "available" => status.cyan().to_string(),
        "processing" | "running" => status.blue().bold().to_string(),
        "completed" => status.green().to_string(),
        "failed" | "rejected" | "discarded" => status.red().to_string(),
        "cancelled" => status.dimmed().to_string(),
        _ => status.to_string(),
    }
}
