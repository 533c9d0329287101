//! `taskflow` - operator CLI over the engine

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use taskflow_engine::application::api::{Aweme, CachePolicy};
use taskflow_engine::application::progress_poller::{ProgressChannel, ProgressEvent, TerminationReason};
use taskflow_engine::application::task_flow::FlowConfig;
use taskflow_engine::domain::flow_status::flow_status_of;
use taskflow_engine::domain::task::Platform;
use taskflow_engine::infrastructure::logging::init_logging_with_config;
use taskflow_engine::{EngineConfig, EngineContext};

#[derive(Parser)]
#[command(name = "taskflow")]
#[command(about = "Create, list and follow dashboard crawl tasks")]
#[command(version)]
struct Cli {
    /// Config file (TOML); defaults to the platform config dir
    #[arg(short, long, global = true, env = "TASKFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and store the bearer token
    Login {
        #[arg(short, long)]
        username: String,
        #[arg(short, long, env = "TASKFLOW_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// List tasks with their derived flow status
    Tasks {
        #[arg(long, default_value_t = 0)]
        offset: u32,
        #[arg(long, default_value_t = 50)]
        count: u32,
        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },

    /// Follow progress of one task until polling stops
    Watch {
        task_id: String,
        /// Poll marketing progress instead of analysis progress
        #[arg(long)]
        marketing: bool,
        /// With --marketing: count every user, not only filtered ones
        #[arg(long)]
        all: bool,
    },

    /// Create a task and follow it to the marketing stage
    Flow {
        #[arg(long, default_value = "dy")]
        platform: String,
        #[arg(long)]
        keyword: String,
        /// Content to crawl, as `id:title[:xsec_token]`; repeatable
        #[arg(long = "aweme")]
        awemes: Vec<String>,
        /// Only create the task
        #[arg(long)]
        no_monitor: bool,
    },

    /// Show the account quota
    Quota,
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = EngineConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    init_logging_with_config(&config.logging)?;

    let engine = EngineContext::build(config)?;
    match cli.command {
        Commands::Login { username, password } => cmd_login(&engine, &username, &password).await,
        Commands::Tasks { offset, count, json } => cmd_tasks(&engine, offset, count, json).await,
        Commands::Watch { task_id, marketing, all } => {
            let channel = if marketing {
                ProgressChannel::Marketing { is_all: all }
            } else {
                engine.poller.analysis_channel()
            };
            cmd_watch(&engine, &task_id, channel).await
        }
        Commands::Flow {
            platform,
            keyword,
            awemes,
            no_monitor,
        } => {
            let awemes = awemes.iter().map(|raw| parse_aweme(raw)).collect::<Result<Vec<_>>>()?;
            let flow = FlowConfig::new(Platform::from(platform), keyword).with_awemes(awemes);
            cmd_flow(&engine, flow, no_monitor).await
        }
        Commands::Quota => {
            let quota = engine.api.quota(CachePolicy::Refresh).await?;
            println!("{}", serde_json::to_string_pretty(&quota)?);
            Ok(())
        }
    }
}

async fn cmd_login(engine: &EngineContext, username: &str, password: &str) -> Result<()> {
    engine.api.login(username, password).await?;
    println!("Logged in as {username}");
    Ok(())
}

async fn cmd_tasks(engine: &EngineContext, offset: u32, count: u32, json: bool) -> Result<()> {
    let tasks = engine.registry.refresh(offset, count).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    for task in &tasks {
        println!(
            "{:<24} {:<4} {:<20} {:<18} crawl={} analysis={} market={}",
            task.task_id,
            task.platform,
            task.keyword,
            flow_status_of(task),
            task.crawler_state,
            task.analysis_state,
            task.market_state
        );
    }
    println!(
        "{} of {} task(s){}",
        tasks.len(),
        engine.registry.total_count(),
        if engine.registry.has_more() { ", more available" } else { "" }
    );
    Ok(())
}

async fn cmd_watch(engine: &EngineContext, task_id: &str, channel: ProgressChannel) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener = engine.poller.on_update(
        task_id,
        Arc::new(move |event: &ProgressEvent| {
            let _ = tx.send(event.clone());
        }),
    );
    engine.poller.start(task_id, channel).await?;

    let outcome = loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(ProgressEvent::Updated { percent, intent_percent, snapshot, .. }) => {
                    println!(
                        "{task_id}: {percent:>3}% ({}/{}) intent {intent_percent}%",
                        snapshot.num, snapshot.sum
                    );
                }
                Some(ProgressEvent::Terminated { reason, .. }) => break Some(reason),
                None => break None,
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, stopping poller");
                engine.poller.stop(task_id).await;
                break None;
            }
        }
    };
    engine.poller.remove_listener(listener);

    match outcome {
        Some(TerminationReason::Finished { reason }) => {
            println!("{task_id}: polling finished ({reason:?})");
            Ok(())
        }
        Some(TerminationReason::Failed { failure }) => bail!("polling failed: {}", failure.message),
        None => Ok(()),
    }
}

async fn cmd_flow(engine: &EngineContext, flow: FlowConfig, no_monitor: bool) -> Result<()> {
    let manager = engine.new_flow(flow);
    if no_monitor {
        let task_id = manager.create_only().await?;
        println!("Created task {task_id}");
        return Ok(());
    }

    let mut status = manager.subscribe();
    let printer = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            info!("Flow status: {}", current);
            println!("status: {current}");
        }
    });

    let result = tokio::select! {
        result = manager.start_flow() => result,
        _ = tokio::signal::ctrl_c() => {
            manager.stop_monitoring();
            printer.abort();
            println!("Monitoring stopped; the remote task keeps running");
            return Ok(());
        }
    };
    printer.abort();

    let outcome = result?;
    println!(
        "Task {} reached {} with {} marketing user(s)",
        outcome.task_id,
        outcome.status,
        outcome.marketing_users.len()
    );
    Ok(())
}

/// `id:title[:xsec_token]`
fn parse_aweme(raw: &str) -> Result<Aweme> {
    let mut parts = raw.splitn(3, ':');
    let id = parts.next().unwrap_or_default().trim();
    if id.is_empty() {
        bail!("aweme '{raw}' has no id");
    }
    Ok(Aweme {
        id: id.to_string(),
        title: parts.next().unwrap_or_default().to_string(),
        xsec_token: parts.next().unwrap_or_default().to_string(),
    })
}
