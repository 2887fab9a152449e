use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use testlane::artifact::cleanup::ArtifactCleaner;
use testlane::artifact::ArtifactStore;
use testlane::config::EngineConfig;
use testlane::engine::ExecutionEngine;
use testlane::model::{Browser, Execution};
use testlane::storage::ExecutionRepo;

#[derive(Parser)]
#[command(
    name = "testlane",
    about = "Self-hosted browser test execution engine",
    version,
    long_about = None
)]
struct Cli {
    /// Config file path (overrides TESTLANE_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the execution engine daemon
    Serve,

    /// Run a single test script and wait for the result
    Run {
        /// Path to the test script
        script: PathBuf,

        /// Execution name
        #[arg(long, default_value = "cli run")]
        name: String,

        /// Base URL the tests run against
        #[arg(long)]
        base_url: String,

        /// Browser: chromium, firefox, or webkit
        #[arg(long, default_value = "chromium")]
        browser: String,

        /// Run the browser with a visible window
        #[arg(long)]
        headed: bool,

        /// Per-job wall-clock timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Run one artifact retention cleanup pass
    Cleanup,

    /// Manage execution records
    Executions {
        #[command(subcommand)]
        action: ExecutionAction,
    },
}

#[derive(Subcommand)]
enum ExecutionAction {
    /// List recent executions
    List {
        /// Maximum rows to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::load_or_default(),
    };

    match cli.command {
        Commands::Serve => {
            tracing::info!("Starting testlane daemon");
            testlane::serve(config).await?;
        }
        Commands::Run {
            script,
            name,
            base_url,
            browser,
            headed,
            timeout,
        } => {
            run_once(config, script, name, base_url, browser, headed, timeout).await?;
        }
        Commands::Cleanup => {
            let pool = testlane::storage::open_pool(&config.storage.db_path)?;
            let repo = ExecutionRepo::new(pool);
            let store = Arc::new(ArtifactStore::from_config(&config, repo.clone())?);
            let cleaner =
                ArtifactCleaner::new(store, repo, config.artifacts.cleanup_batch_limit);
            let report = cleaner.run_once(chrono::Utc::now()).await;
            println!(
                "Cleanup: {} expired, {} orphaned, {} failures",
                report.expired_deleted, report.orphans_deleted, report.failures
            );
        }
        Commands::Executions { action } => {
            let pool = testlane::storage::open_pool(&config.storage.db_path)?;
            let repo = ExecutionRepo::new(pool);
            match action {
                ExecutionAction::List { limit } => {
                    let list = repo.recent(limit)?;
                    if list.is_empty() {
                        println!("No executions found.");
                    } else {
                        println!(
                            "{:<36} | {:<20} | {:<9} | {:<10} | Created",
                            "ID", "Name", "Browser", "Status"
                        );
                        println!("{:-<36}-|-{:-<20}-|-{:-<9}-|-{:-<10}-|-{:-<20}", "", "", "", "", "");
                        for e in list {
                            println!(
                                "{:<36} | {:<20} | {:<9} | {:<10} | {}",
                                e.id,
                                truncate(&e.name, 20),
                                e.browser.as_str(),
                                e.status.as_str(),
                                e.created_at.format("%Y-%m-%d %H:%M:%S")
                            );
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_once(
    config: EngineConfig,
    script: PathBuf,
    name: String,
    base_url: String,
    browser: String,
    headed: bool,
    timeout: Option<u64>,
) -> Result<()> {
    let Some(browser) = Browser::parse(&browser) else {
        bail!("unknown browser '{browser}' (expected chromium, firefox, or webkit)");
    };
    let source = std::fs::read_to_string(&script)
        .with_context(|| format!("failed to read script: {}", script.display()))?;

    let pool = testlane::storage::open_pool(&config.storage.db_path)?;
    let repo = ExecutionRepo::new(pool);
    let artifacts = Arc::new(ArtifactStore::from_config(&config, repo.clone())?);
    let engine = ExecutionEngine::new(config, repo.clone(), artifacts);

    let mut execution = Execution::new(&name, &base_url, browser, &source, "cli");
    execution.config.headless = Some(!headed);
    execution.config.timeout_secs = timeout;
    repo.insert(&execution)?;

    let id = engine.submit(execution)?;
    tracing::info!(execution_id = %id, "execution submitted, waiting");

    let finished = loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let Some(current) = repo.find(id)? else {
            bail!("execution record disappeared");
        };
        if current.status.is_terminal() {
            break current;
        }
    };

    println!("\n=== Testlane Execution Report ===");
    println!("Execution: {}", finished.id);
    println!("Status:    {}", finished.status);
    if let Some(err) = &finished.error_message {
        println!("Error:     {}", err);
    }

    let details = repo.details(id)?;
    if !details.is_empty() {
        println!("\n{:<50} | {:<8} | Duration", "Test", "Outcome");
        println!("{:-<50}-|-{:-<8}-|-{:-<10}", "", "", "");
        for d in &details {
            println!(
                "{:<50} | {:<8} | {}ms",
                truncate(&d.title, 50),
                d.outcome.as_str(),
                d.duration_ms
            );
            if let Some(err) = &d.error_message {
                println!("{:<50} |          |   -> {}", "", truncate(err, 60));
            }
        }
    }

    if let Some(m) = repo.metrics(id)? {
        println!(
            "\n{} tests: {} passed, {} failed, {} skipped ({}ms total)",
            m.total_tests, m.total_passed, m.total_failed, m.total_skipped, m.total_duration_ms
        );
        println!(
            "Peak memory: {} MiB, avg CPU: {:.1}%, artifacts: {}",
            m.peak_memory_bytes / (1024 * 1024),
            m.avg_cpu_percent,
            m.artifact_count
        );
    }
    println!("=================================\n");

    if finished.status != testlane::model::ExecutionStatus::Completed {
        std::process::exit(1);
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}
