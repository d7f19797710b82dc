use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use resilient_docstore::driver::{DriverOp, MemoryDriver, SortDirection};
use resilient_docstore::*;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "docstore-sim")]
#[command(about = "Drive the resilient document store client against a fault-injecting in-memory store")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML or JSON); defaults to the per-user file if it exists
    #[arg(long, global = true, env = "DOCSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a write workload with injected driver faults
    Run {
        /// Number of documents to create
        #[arg(short = 'n', long, default_value = "20")]
        operations: usize,

        /// Inject a connection-fatal error on every Nth write (0 disables)
        #[arg(long, default_value = "7")]
        fatal_every: usize,

        /// Inject a transient error on every Nth write (0 disables)
        #[arg(long, default_value = "3")]
        transient_every: usize,

        /// Collection the workload writes to
        #[arg(long, default_value = "tours")]
        collection: String,

        /// Shrink settle, network cycle and backoff delays to milliseconds
        #[arg(long)]
        fast: bool,
    },

    /// Print the resolved configuration
    Config,
}

const FATAL_MESSAGE: &str =
    "FIRESTORE (9.6.1) INTERNAL ASSERTION FAILED: Unexpected state (ID: ca9)";

fn init_logging(debug: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(explicit: Option<PathBuf>) -> Result<ClientConfig> {
    let path = explicit.or_else(|| ClientConfig::default_path().filter(|p| p.exists()));
    if let Some(path) = &path {
        tracing::info!(path = %path.display(), "Loading configuration");
    }
    ClientConfig::load(path.as_deref()).context("Failed to load client configuration")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug, cli.json);

    let config = load_config(cli.config)?;

    match cli.command {
        Commands::Run {
            operations,
            fatal_every,
            transient_every,
            collection,
            fast,
        } => {
            let config = if fast { fast_config(config) } else { config };
            run_workload(config, operations, fatal_every, transient_every, &collection).await
        }
        Commands::Config => {
            let rendered =
                serde_json::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{}", rendered);
            Ok(())
        }
    }
}

fn fast_config(config: ClientConfig) -> ClientConfig {
    ClientConfig {
        settle_delay_ms: 20,
        network_cycle_delay_ms: 20,
        backoff_base_ms: 25,
        backoff_cap_ms: 250,
        ..config
    }
}

async fn run_workload(
    config: ClientConfig,
    operations: usize,
    fatal_every: usize,
    transient_every: usize,
    collection: &str,
) -> Result<()> {
    let driver = MemoryDriver::new();
    let client = ResilientClient::new(Arc::new(driver.clone()), config);
    let started = Instant::now();

    // Record every state transition for the summary
    let transitions: Arc<Mutex<Vec<(DateTime<Utc>, ConnectionState)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let recorder = {
        let transitions = Arc::clone(&transitions);
        let mut rx = client.connection_state();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                if let Ok(mut log) = transitions.lock() {
                    log.push((Utc::now(), state));
                }
            }
        })
    };

    client
        .initialize()
        .await
        .context("Failed to initialize client")?;
    client.spawn_health_monitor();

    let snapshot_docs = Arc::new(AtomicUsize::new(0));
    let snapshots = Arc::new(AtomicUsize::new(0));
    let mut live = client
        .read_collection(
            collection,
            vec![QueryConstraint::order_by("seq", SortDirection::Asc)],
        )
        .context("Failed to open live query")?;
    let watcher = {
        let snapshot_docs = Arc::clone(&snapshot_docs);
        let snapshots = Arc::clone(&snapshots);
        tokio::spawn(async move {
            while let Some(item) = live.next().await {
                match item {
                    Ok(docs) => {
                        snapshots.fetch_add(1, Ordering::SeqCst);
                        snapshot_docs.store(docs.len(), Ordering::SeqCst);
                    }
                    Err(e) => tracing::warn!(error = %e, "Live query ended with an error"),
                }
            }
        })
    };

    let mut succeeded = 0usize;
    let mut failed = 0usize;

    for i in 1..=operations {
        if fatal_every > 0 && i % fatal_every == 0 {
            driver.fail_next(DriverOp::AddDocument, DriverError::message(FATAL_MESSAGE));
        } else if transient_every > 0 && i % transient_every == 0 {
            driver.fail_next(
                DriverOp::AddDocument,
                DriverError::new("deadline-exceeded", "Deadline exceeded"),
            );
        }

        let payload = Payload::mapping([
            ("seq", Payload::from(i as u64)),
            ("label", Payload::from(format!("op-{}", i))),
            // odd writes carry an explicit null, even ones an unset field
            (
                "note",
                if i % 2 == 0 {
                    Payload::Unset
                } else {
                    Payload::Null
                },
            ),
        ]);

        match client.create_document(collection, payload).await {
            Ok(id) => {
                succeeded += 1;
                tracing::debug!(seq = i, id = %id, "Document created");
            }
            Err(e) => {
                failed += 1;
                tracing::warn!(seq = i, class = ?e.class(), error = %e, "Write failed");
                println!("write {} failed: {}", i, e.user_message());
            }
        }
    }

    // Let the live query catch up with the last write
    tokio::time::sleep(client.config().settle_delay()).await;
    let final_state = client.current_state();
    client.shutdown().await;
    let _ = watcher.await;
    recorder.abort();

    println!();
    println!("Simulation summary");
    println!("  Operations:        {}", operations);
    println!("  Succeeded:         {}", succeeded);
    println!("  Failed:            {}", failed);
    println!(
        "  Network cycles:    {}",
        driver.calls(DriverOp::DisableNetwork)
    );
    println!("  Live snapshots:    {}", snapshots.load(Ordering::SeqCst));
    println!(
        "  Documents seen:    {}",
        snapshot_docs.load(Ordering::SeqCst)
    );
    println!("  Final state:       {}", final_state);
    println!(
        "  Elapsed:           {}",
        humantime::format_duration(std::time::Duration::from_millis(
            started.elapsed().as_millis() as u64
        ))
    );

    println!();
    println!("State transitions");
    let log = transitions
        .lock()
        .map(|log| log.clone())
        .unwrap_or_default();
    for (at, state) in log {
        println!("  {}  {}", at.format("%H:%M:%S%.3f"), state);
    }

    Ok(())
}
