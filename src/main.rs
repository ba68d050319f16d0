use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use work_order_engine::config::{config, init_config, DatabaseConfig, WorkOrderEngineConfig};
use work_order_engine::store::{SqliteStore, UserDirectory};
use work_order_engine::telemetry::{init_telemetry, shutdown_telemetry};
use work_order_engine::workflow::{
    ActivityType, InterventionStatus, InterventionStatusUpdate, NewIntervention, RequestContext,
    TracingNotifier, TransitionOverrides, TransitionRequest, User, UserId, WorkOrderId,
    WorkOrderState, WorkflowEngine,
};

#[derive(Parser)]
#[command(name = "work-order-engine")]
#[command(about = "Work order lifecycle engine for vehicle repair shops")]
#[command(long_about = "Drives repair work orders through draft, approved, in progress, completed \
                       and cancelled, enforcing role and content rules and recording an audit trail. \
                       Every command prints JSON.")]
struct Cli {
    /// Configuration file (defaults to work-order-engine.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database URL, overrides the configured one
    #[arg(long, global = true)]
    database: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Move a work order to a new state
    Transition {
        work_order: WorkOrderId,
        /// Target state: draft, approved, in_progress, completed, cancelled
        target: WorkOrderState,
        /// Acting user id
        #[arg(long)]
        user: UserId,
        /// Reason, mandatory for cancellations, reopening and restoring
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        ip: Option<String>,
        #[arg(long)]
        user_agent: Option<String>,
        /// Intervention count to use instead of the stored one
        #[arg(long)]
        interventions_count: Option<usize>,
    },
    /// List the transitions leaving the current state and whether the user may take them
    Available {
        work_order: WorkOrderId,
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        interventions_count: Option<usize>,
    },
    /// Show the audit trail of a work order, newest first
    AuditTrail {
        work_order: WorkOrderId,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Change an intervention status, cascading to the work order when needed
    InterventionStatus {
        work_order: WorkOrderId,
        intervention: i64,
        /// preso_in_carico, attesa_componente, sospeso, concluso
        status: InterventionStatus,
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        note: Option<String>,
        /// Required when suspending
        #[arg(long)]
        suspension_note: Option<String>,
    },
    /// Add an intervention to a work order
    AddIntervention {
        work_order: WorkOrderId,
        #[arg(long)]
        description: String,
        #[arg(long, default_value = "0")]
        hours: f64,
        /// mechanical or bodywork
        #[arg(long, default_value = "mechanical")]
        activity_type: ActivityType,
        /// Defaults to the next free sequence number
        #[arg(long)]
        sequence: Option<u32>,
        #[arg(long)]
        status: Option<InterventionStatus>,
        #[arg(long)]
        note: Option<String>,
        #[arg(long)]
        suspension_note: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => WorkOrderEngineConfig::load_from(Some(path.as_path()))?,
        None => {
            init_config()?;
            config()?.clone()
        }
    };
    if let Some(url) = &cli.database {
        let base = settings.database.clone().unwrap_or(DatabaseConfig {
            url: url.clone(),
            max_connections: 5,
            auto_migrate: true,
        });
        settings.database = Some(DatabaseConfig {
            url: url.clone(),
            ..base
        });
    }

    init_telemetry(&settings.observability)?;

    let result = tokio::runtime::Runtime::new()?.block_on(async { run(cli.command, &settings).await });

    shutdown_telemetry();
    result
}

async fn run(command: Commands, settings: &WorkOrderEngineConfig) -> Result<()> {
    let Some(database) = &settings.database else {
        bail!("No database configured; set [database] url or pass --database");
    };
    let store = Arc::new(SqliteStore::from_config(database).await?);
    let engine = WorkflowEngine::new(
        store.clone(),
        store.clone(),
        Arc::new(TracingNotifier),
        settings,
    );

    let result = execute(&engine, store.as_ref(), command).await;

    // Let queued notifications finish before the process exits
    engine.dispatcher().wait_idle().await;
    engine.metrics().log_stats();
    store.shutdown().await;
    result
}

async fn execute(engine: &WorkflowEngine, directory: &dyn UserDirectory, command: Commands) -> Result<()> {
    match command {
        Commands::Transition {
            work_order,
            target,
            user,
            reason,
            ip,
            user_agent,
            interventions_count,
        } => {
            let user = acting_user(directory, user).await?;
            let outcome = engine
                .transition(TransitionRequest {
                    work_order_id: work_order,
                    target,
                    user,
                    reason,
                    context: RequestContext {
                        ip_address: ip,
                        user_agent,
                    },
                    overrides: overrides(interventions_count),
                })
                .await?;
            print_json(&outcome)
        }
        Commands::Available {
            work_order,
            user,
            interventions_count,
        } => {
            let user = acting_user(directory, user).await?;
            let work_order = engine.work_order(work_order).await?;
            let overrides = overrides(interventions_count);
            let available = engine
                .available_transitions(&work_order, &user, overrides.as_ref())
                .await;
            print_json(&available)
        }
        Commands::AuditTrail { work_order, limit } => {
            let trail = engine.audit_trail(work_order, limit).await?;
            print_json(&trail)
        }
        Commands::InterventionStatus {
            work_order,
            intervention,
            status,
            user,
            note,
            suspension_note,
        } => {
            let user = acting_user(directory, user).await?;
            let outcome = engine
                .update_intervention_status(
                    work_order,
                    intervention,
                    InterventionStatusUpdate {
                        status,
                        note,
                        suspension_note,
                    },
                    &user,
                )
                .await?;
            print_json(&outcome)
        }
        Commands::AddIntervention {
            work_order,
            description,
            hours,
            activity_type,
            sequence,
            status,
            note,
            suspension_note,
        } => {
            let intervention = engine
                .add_intervention(
                    work_order,
                    NewIntervention {
                        sequence,
                        description,
                        estimated_hours: hours,
                        activity_type,
                        status,
                        note,
                        suspension_note,
                    },
                )
                .await?;
            print_json(&intervention)
        }
    }
}

async fn acting_user(directory: &dyn UserDirectory, id: UserId) -> Result<User> {
    let user = directory
        .find_user(id)
        .await?
        .with_context(|| format!("User {id} not found"))?;
    if !user.active {
        bail!("User {id} is not active");
    }
    Ok(user)
}

fn overrides(interventions_count: Option<usize>) -> Option<TransitionOverrides> {
    interventions_count.map(|count| TransitionOverrides {
        interventions_count: Some(count),
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
