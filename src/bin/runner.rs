//! runner CLI: operator interface to the deferred playbook scheduler.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use playbook_runner::actions::{
    Action, ActionOutcome, ClearRequest, CountRequest, ExecuteRequest, Runner, ScheduleRequest,
};
use playbook_runner::config::Config;
use playbook_runner::engine::{Poller, PollerConfig};
use playbook_runner::model::CaseId;
use playbook_runner::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "runner", about = "Schedule playbooks to run after a delay")]
struct Cli {
    /// TOML config file; environment variables are used when absent
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Case the invocation is attached to
    #[arg(long, global = true)]
    case_id: Option<i64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a playbook once a delay has passed
    Schedule {
        /// Why the playbook is delayed
        #[arg(long)]
        purpose: String,
        /// Minutes, Hours or Days
        #[arg(long)]
        unit: String,
        /// Delay magnitude
        #[arg(long)]
        duration: i64,
        /// Playbook as <repo name>/<playbook name>
        #[arg(long)]
        playbook: String,
        /// artifact, all, new, "container all" or "container new"
        #[arg(long)]
        scope: String,
        #[arg(long)]
        artifact_id: Option<String>,
        #[arg(long)]
        container_id: Option<String>,
        /// JSON object forwarded to the playbook
        #[arg(long)]
        input_data: Option<String>,
    },
    /// Run a playbook now
    Execute {
        #[arg(long)]
        playbook: String,
        #[arg(long)]
        scope: String,
        #[arg(long)]
        artifact_id: Option<String>,
        #[arg(long)]
        container_id: Option<String>,
        #[arg(long)]
        input_data: Option<String>,
    },
    /// Cancel every pending playbook of a case
    Clear {
        #[arg(long)]
        reason: String,
        #[arg(long)]
        container_id: Option<String>,
    },
    /// Count runner markers on the case
    Count {
        #[arg(long)]
        playbook_filter: Option<String>,
        /// Marker state, e.g. pending or complete
        #[arg(long)]
        label_filter: Option<String>,
    },
    /// Run expired playbooks
    Poll {
        /// Keep polling until interrupted
        #[arg(long)]
        watch: bool,
        /// Seconds between cycles in watch mode
        #[arg(long, default_value_t = 60)]
        interval_secs: u64,
    },
    /// Check that the platform answers
    TestConnectivity,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_toml_file(path)?,
        None => Config::from_env()?,
    };
    let _guard = init_telemetry(TelemetryConfig::from_config(&config))?;

    let runner = Runner::from_config(&config, cli.case_id.map(CaseId))?;

    let action = match cli.command {
        Command::Poll {
            watch: true,
            interval_secs,
        } => return cmd_watch(&runner, interval_secs).await,
        Command::Poll { watch: false, .. } => Action::OnPoll,
        Command::Schedule {
            purpose,
            unit,
            duration,
            playbook,
            scope,
            artifact_id,
            container_id,
            input_data,
        } => Action::SchedulePlaybook(ScheduleRequest {
            delay_purpose: purpose,
            duration_unit: unit,
            delay_duration: duration,
            playbook,
            playbook_scope: scope,
            artifact_id,
            container_id,
            input_data,
        }),
        Command::Execute {
            playbook,
            scope,
            artifact_id,
            container_id,
            input_data,
        } => Action::ExecutePlaybook(ExecuteRequest {
            playbook,
            playbook_scope: scope,
            artifact_id,
            container_id,
            input_data,
        }),
        Command::Clear {
            reason,
            container_id,
        } => Action::ClearScheduledPlaybooks(ClearRequest {
            cancellation_reason: reason,
            container_id,
        }),
        Command::Count {
            playbook_filter,
            label_filter,
        } => Action::CountRunnerArtifacts(CountRequest {
            playbook_filter,
            label_filter,
        }),
        Command::TestConnectivity => Action::TestConnectivity,
    };

    let outcome = runner.handle(action).await;
    print_outcome(&outcome)?;
    if !outcome.is_success() {
        anyhow::bail!("{}", outcome.message);
    }
    Ok(())
}

async fn cmd_watch(runner: &Runner, interval_secs: u64) -> anyhow::Result<()> {
    let poller = Poller::new(
        runner.engine(),
        PollerConfig {
            interval: Duration::from_secs(interval_secs.max(1)),
        },
    );

    let stop = poller.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        stop.shutdown();
    });

    poller.run().await?;
    Ok(())
}

fn print_outcome(outcome: &ActionOutcome) -> anyhow::Result<()> {
    println!("{}", outcome.message);
    if let Some(ref data) = outcome.data {
        println!("{}", serde_json::to_string_pretty(data)?);
    }
    Ok(())
}
