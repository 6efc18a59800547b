//! syncq CLI: operator interface to the task queue and CDC controllers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use syncq::cdc::{CdcAction, ControllerRegistry, EnqueueHandler};
use syncq::config::Config;
use syncq::config::secrets::redact_url;
use syncq::db::{Db, PgHashStore, PostgresDriver};
use syncq::driver::Driver;
use syncq::engine::{SyncConfig, SyncManager};
use syncq::manager::TaskManager;
use syncq::telemetry::{TelemetryConfig, init_telemetry};
use tracing::info;

#[derive(Parser)]
#[command(name = "syncq", about = "Durable task queue and change data capture")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the CDC controllers until interrupted
    Serve {
        /// Directory containing controller TOML configs
        #[arg(long, default_value = "controllers")]
        controllers: PathBuf,
    },
    /// Create the queue and CDC tables
    Migrate,
    /// Task operations
    Task {
        #[command(subcommand)]
        action: TaskCommand,
    },
    /// Queue maintenance
    Queue {
        #[command(subcommand)]
        action: QueueCommand,
    },
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Put a task on the queue
    Add {
        /// Task name (determines handler routing)
        name: String,
        /// Task key
        key: String,
        /// JSON object payload
        #[arg(long)]
        data: Option<String>,
        /// Do not claim the task before this many seconds have passed
        #[arg(long)]
        delay_secs: Option<i64>,
    },
    /// Show the most recent task with a given name
    Show {
        /// Task name
        name: String,
    },
}

#[derive(Subcommand)]
enum QueueCommand {
    /// Number of rows in the queue, in any state
    Length,
    /// Delete every task
    Clear {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
    /// Make old RETRY tasks ready again
    RefreshRetry {
        /// Minimum age of the last attempt
        #[arg(long, default_value_t = 3600)]
        age_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "syncq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let db = Db::connect(config.database_url.expose_secret(), config.max_connections).await?;
    info!(database = %redact_url(&config.database_url), "connected");
    let driver = PostgresDriver::new(db.pool().clone(), config.driver_config())?;

    match cli.command {
        Command::Serve { controllers } => cmd_serve(&config, &db, driver, controllers).await,
        Command::Migrate => cmd_migrate(&config, &db, &driver).await,
        Command::Task { action } => match action {
            TaskCommand::Add {
                name,
                key,
                data,
                delay_secs,
            } => cmd_task_add(driver, name, key, data, delay_secs).await,
            TaskCommand::Show { name } => cmd_task_show(&driver, name).await,
        },
        Command::Queue { action } => match action {
            QueueCommand::Length => {
                println!("{}", driver.queue_length().await?);
                Ok(())
            }
            QueueCommand::Clear { yes } => {
                if !yes {
                    anyhow::bail!("refusing to clear the queue without --yes");
                }
                driver.clear().await?;
                println!("Queue cleared.");
                Ok(())
            }
            QueueCommand::RefreshRetry { age_secs } => {
                let count = driver
                    .refresh_retry(Duration::from_secs(age_secs))
                    .await?;
                println!("{count} task(s) made ready");
                Ok(())
            }
        },
    }
}

async fn cmd_migrate(config: &Config, db: &Db, driver: &PostgresDriver) -> anyhow::Result<()> {
    driver.migrate().await?;
    PgHashStore::new(db.pool().clone(), &config.cdc_schema, "")?
        .migrate()
        .await?;
    println!("Migrations applied.");
    Ok(())
}

async fn cmd_serve(
    config: &Config,
    db: &Db,
    driver: PostgresDriver,
    controllers: PathBuf,
) -> anyhow::Result<()> {
    driver.migrate().await?;
    let registry = ControllerRegistry::load_from_dir(&controllers)?;
    if registry.is_empty() {
        anyhow::bail!("no controllers found in {}", controllers.display());
    }

    let driver: Arc<dyn Driver> = Arc::new(driver);
    let tasks = TaskManager::new(Arc::clone(&driver));

    // Producer only: claimed tasks are handled by whichever service owns
    // their names.
    let manager = Arc::new(SyncManager::new(
        driver,
        SyncConfig {
            dispatch_tasks: false,
            ..SyncConfig::default()
        },
    )?);

    for controller in registry.iter() {
        let store = PgHashStore::new(
            db.pool().clone(),
            &config.cdc_schema,
            &controller.source_query,
        )?;
        store.migrate().await?;

        let handler = EnqueueHandler::new(tasks.clone(), &controller.task_prefix);
        let action = CdcAction::new(controller.id, Arc::new(store), Arc::new(handler))
            .with_batch_size(controller.batch_size);
        manager.schedule(Arc::new(action), controller.period());
        info!(
            controller_id = %controller.id,
            period_secs = controller.period_secs,
            task_prefix = %controller.task_prefix,
            "controller scheduled"
        );
    }

    let stopper = Arc::clone(&manager);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        stopper.stop();
    });

    manager.run().await;
    Ok(())
}

async fn cmd_task_add(
    driver: PostgresDriver,
    name: String,
    key: String,
    data: Option<String>,
    delay_secs: Option<i64>,
) -> anyhow::Result<()> {
    let data: serde_json::Value = match data {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };
    let not_before = delay_secs.map(not_before_after).transpose()?;

    let tasks = TaskManager::new(Arc::new(driver));
    let id = tasks.add_task(&name, &key, not_before, &data).await?;
    println!("Created: {id}");
    Ok(())
}

/// `now + secs`, or an error when that falls outside the representable
/// time range.
fn not_before_after(secs: i64) -> anyhow::Result<chrono::DateTime<chrono::Utc>> {
    chrono::TimeDelta::try_seconds(secs)
        .and_then(|delay| chrono::Utc::now().checked_add_signed(delay))
        .ok_or_else(|| anyhow::anyhow!("--delay-secs {secs} is out of range"))
}

async fn cmd_task_show(driver: &PostgresDriver, name: String) -> anyhow::Result<()> {
    let Some(task) = driver.get_task(&name).await? else {
        anyhow::bail!("no task named '{name}'");
    };

    println!("ID:         {}", task.id);
    println!("Name:       {}", task.name);
    println!("Key:        {}", task.key);
    println!("State:      {}", task.state);
    println!("Data:       {}", serde_json::to_string_pretty(&task.data)?);
    println!("Created:    {}", task.created_at);
    if let Some(not_before) = task.not_before {
        println!("Not Before: {not_before}");
    }
    println!("Attempted:  {}", task.last_attempted);
    println!(
        "Message:    {}",
        task.last_attempt_message.as_deref().unwrap_or("-")
    );
    Ok(())
}
