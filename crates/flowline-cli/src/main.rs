//! flowline CLI.

use clap::{Parser, Subcommand};
use serde_json::Value;

mod commands;

#[derive(Parser)]
#[command(name = "flowline")]
#[command(about = "Submit and inspect flowline executions", long_about = None)]
struct Cli {
    /// Coordinator HTTP façade URL
    #[arg(long, env = "FLOWLINE_API_URL", default_value = "http://localhost:8080")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new execution
    Submit {
        /// Playbook path (mutually exclusive with --catalog-id)
        playbook_path: Option<String>,
        /// Catalog id of an already-registered playbook
        #[arg(long)]
        catalog_id: Option<String>,
        /// JSON payload merged into the playbook's workload
        #[arg(long, default_value = "{}")]
        payload: String,
    },
    /// Show paginated events for an execution
    Show {
        execution_id: String,
        #[arg(long, default_value = "1")]
        page: i64,
        #[arg(long, default_value = "100")]
        page_size: i64,
        #[arg(long)]
        since_event_id: Option<String>,
        #[arg(long)]
        event_type: Option<String>,
    },
    /// Tail an execution's events
    Logs {
        execution_id: String,
        /// Keep polling for new events
        #[arg(short, long)]
        follow: bool,
    },
    /// Cancel a running execution
    Cancel { execution_id: String },
    /// Inspect or mutate transient execution variables
    Vars {
        #[command(subcommand)]
        command: VarCommands,
    },
}

#[derive(Subcommand)]
enum VarCommands {
    /// List all variables for an execution
    List { execution_id: String },
    /// Read a single variable
    Get { execution_id: String, name: String },
    /// Set a variable to a JSON value
    Set {
        execution_id: String,
        name: String,
        value: String,
    },
    /// Delete a variable
    Delete { execution_id: String, name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Submit { playbook_path, catalog_id, payload } => {
            let payload: Value = serde_json::from_str(&payload)?;
            commands::executions::submit(&cli.api_url, playbook_path, catalog_id, payload).await?;
        }
        Commands::Show { execution_id, page, page_size, since_event_id, event_type } => {
            commands::executions::show(&cli.api_url, &execution_id, page, page_size, since_event_id, event_type).await?;
        }
        Commands::Logs { execution_id, follow } => {
            commands::executions::logs(&cli.api_url, &execution_id, follow).await?;
        }
        Commands::Cancel { execution_id } => {
            commands::executions::cancel(&cli.api_url, &execution_id).await?;
        }
        Commands::Vars { command } => match command {
            VarCommands::List { execution_id } => {
                commands::vars::list(&cli.api_url, &execution_id).await?;
            }
            VarCommands::Get { execution_id, name } => {
                commands::vars::get_var(&cli.api_url, &execution_id, &name).await?;
            }
            VarCommands::Set { execution_id, name, value } => {
                let value: Value = serde_json::from_str(&value).unwrap_or(Value::String(value));
                commands::vars::set_var(&cli.api_url, &execution_id, &name, value).await?;
            }
            VarCommands::Delete { execution_id, name } => {
                commands::vars::delete_var(&cli.api_url, &execution_id, &name).await?;
            }
        },
    }

    Ok(())
}
