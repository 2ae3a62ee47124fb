//! CLI command definitions for priority-scheduler.
//!
//! `run` drives a scheduler node over agents described in a YAML file;
//! `register`, `deregister` and `status` operate on the shared queue
//! directly, without executing anything.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::agent::AgentRegistry;
use crate::clock::SystemClock;
use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, StoreError};
use crate::metrics::{export_metrics, init_metrics};
use crate::scheduler::{DistributedQueue, PriorityScheduler, TimeScoreComputer};
use crate::store::{CoordinationStore, MemoryStore, RedisStore, RemovalResult};

/// Distributed priority scheduler for recurring agents.
#[derive(Parser)]
#[command(name = "priority-scheduler")]
#[command(about = "Distribute recurring agent work across nodes through a Redis sorted set")]
#[command(version)]
#[command(
    long_about = "priority-scheduler spreads periodic agents across a fleet of nodes. Each agent runs on at most one node at a time, guarded by a lease in Redis.\n\nExample usage:\n  priority-scheduler run --agents ./agents.yaml\n  priority-scheduler status --json"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a scheduler node executing the agents of a definition file.
    Run(RunArgs),

    /// Add agent keys to the shared queue.
    Register(KeysArgs),

    /// Remove agent keys from the shared queue for good.
    Deregister(DeregisterArgs),

    /// Show queue and lease state.
    Status(StatusArgs),
}

/// Store connection options shared by every command.
#[derive(Parser, Debug, Clone)]
pub struct StoreArgs {
    /// Redis connection URL.
    #[arg(long, env = "SCHEDULER_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Prefix of every Redis key the scheduler touches.
    #[arg(long, env = "SCHEDULER_KEY_PREFIX")]
    pub key_prefix: Option<String>,
}

/// Arguments for `priority-scheduler run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// YAML file describing the agents this node can run.
    #[arg(short, long)]
    pub agents: PathBuf,

    /// Use an in-process store instead of Redis.
    #[arg(long, default_value = "false")]
    pub memory: bool,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    pub duration_secs: Option<u64>,

    /// Identity written into leases held by this node.
    #[arg(long, env = "SCHEDULER_NODE_ID")]
    pub node_id: Option<String>,

    /// Maximum agents executing at once on this node.
    #[arg(long)]
    pub max_concurrent: Option<usize>,

    /// Print Prometheus metrics on exit.
    #[arg(long, default_value = "false")]
    pub print_metrics: bool,

    #[command(flatten)]
    pub store: StoreArgs,
}

/// Arguments for `register` and `deregister`.
#[derive(Parser, Debug)]
pub struct KeysArgs {
    /// Agent keys.
    #[arg(required = true)]
    pub keys: Vec<String>,

    #[command(flatten)]
    pub store: StoreArgs,
}

/// Arguments for `priority-scheduler deregister`.
#[derive(Parser, Debug)]
pub struct DeregisterArgs {
    #[command(flatten)]
    pub keys: KeysArgs,

    /// Skip agents that are running somewhere right now.
    #[arg(long, default_value = "false")]
    pub if_idle: bool,
}

/// Arguments for `priority-scheduler status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Output as JSON.
    #[arg(long, default_value = "false")]
    pub json: bool,

    #[command(flatten)]
    pub store: StoreArgs,
}

/// Queue state of one agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub key: String,
    pub score: Option<i64>,
    pub lease_owner: Option<String>,
    pub lease_ttl_ms: Option<i64>,
}

/// Output of `status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub now: i64,
    pub pending: usize,
    pub due: usize,
    pub registered: usize,
    pub agents: Vec<AgentStatus>,
}

/// Parse CLI arguments and return the Cli struct.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For more control over logging initialization, use `parse_cli()` and
/// `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_scheduler_command(args).await,
        Commands::Register(args) => run_register_command(args).await,
        Commands::Deregister(args) => run_deregister_command(args).await,
        Commands::Status(args) => run_status_command(args).await,
    }
}

/// Environment configuration with command-line overrides applied.
fn build_config(store: &StoreArgs) -> anyhow::Result<SchedulerConfig> {
    let mut config = SchedulerConfig::from_env()?;
    if let Some(url) = &store.redis_url {
        config = config.with_redis_url(url.clone());
    }
    if let Some(prefix) = &store.key_prefix {
        config = config.with_key_prefix(prefix.clone());
    }
    config.validate()?;
    Ok(config)
}

async fn connect(config: &SchedulerConfig) -> anyhow::Result<Arc<dyn CoordinationStore>> {
    let store = RedisStore::connect(&config.redis_url, config.store_options()).await?;
    info!(prefix = %config.key_prefix, "Connected to Redis");
    Ok(Arc::new(store))
}

async fn run_scheduler_command(args: RunArgs) -> anyhow::Result<()> {
    init_metrics()?;

    let mut config = build_config(&args.store)?;
    if let Some(node_id) = args.node_id {
        config = config.with_node_id(node_id);
    }
    if let Some(max) = args.max_concurrent {
        config = config.with_max_concurrent_agents(max);
    }

    let agents = AgentRegistry::with_builtin_kinds().load_file(&args.agents)?;
    info!(count = agents.len(), file = %args.agents.display(), "Loaded agent definitions");

    let store: Arc<dyn CoordinationStore> = if args.memory {
        info!("Using in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        connect(&config).await?
    };

    let scheduler = PriorityScheduler::new(config, store, Arc::new(SystemClock))?;
    scheduler.register(agents).await?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run(shutdown_rx).await }
    });

    match args.duration_secs {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    info!(secs = secs, "Run duration elapsed");
                }
                _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("Received Ctrl-C");
        }
    }

    // Ignore send error - the loop may have already exited
    let _ = shutdown_tx.send(());
    match handle.await? {
        Ok(()) => {}
        Err(SchedulerError::ShutdownTimeout(timeout)) => {
            warn!(timeout_secs = timeout.as_secs(), "Some agents were aborted at shutdown");
        }
        Err(e) => return Err(e.into()),
    }

    let health = scheduler.health().await?;
    let stats = scheduler.pool_stats();
    println!("✓ Scheduler stopped");
    println!("  Node:        {}", health.node_id);
    println!("  Cycles:      {}", health.cycles);
    println!("  Succeeded:   {}", health.succeeded);
    println!("  Failed:      {}", health.failed);
    println!("  Contention:  {}", health.contention);
    println!("  Avg run:     {:.1}s", stats.average_duration.as_secs_f64());
    println!("  Pending now: {}", health.pending);

    if args.print_metrics {
        println!();
        print!("{}", export_metrics());
    }
    Ok(())
}

async fn run_register_command(args: KeysArgs) -> anyhow::Result<()> {
    let config = build_config(&args.store)?;
    let store = connect(&config).await?;
    let scores = TimeScoreComputer::new(None, Arc::clone(&store), Arc::new(SystemClock));
    let queue =
        DistributedQueue::new(store).with_registration_jitter(config.registration_jitter);

    let added = queue.add_agents(&args.keys, scores.now_score().await).await?;
    println!(
        "Registered {} agent(s), {} already known",
        added,
        args.keys.len().saturating_sub(added)
    );
    Ok(())
}

async fn run_deregister_command(args: DeregisterArgs) -> anyhow::Result<()> {
    let config = build_config(&args.keys.store)?;
    let queue = DistributedQueue::new(connect(&config).await?);

    let result = deregister_keys(&queue, &args.keys.keys, args.if_idle).await?;
    println!("Deregistered {} agent(s)", result.removed_count);
    for key in &result.removed {
        println!("  {}", key);
    }
    if args.if_idle {
        let kept = args.keys.keys.len().saturating_sub(result.removed_count);
        if kept > 0 {
            warn!(kept = kept, "Some agents were running or unknown and were left in place");
        }
    }
    Ok(())
}

async fn deregister_keys(
    queue: &DistributedQueue,
    keys: &[String],
    if_idle: bool,
) -> Result<RemovalResult, StoreError> {
    if if_idle {
        queue.deregister_idle(keys).await
    } else {
        queue.deregister(keys).await
    }
}

async fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    let config = build_config(&args.store)?;
    let store = connect(&config).await?;
    let report = collect_status(store).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Pending:    {}", report.pending);
    println!("Due:        {}", report.due);
    println!("Registered: {}", report.registered);
    for agent in &report.agents {
        let score = agent
            .score
            .map(|s| (s - report.now).to_string() + "s")
            .unwrap_or_else(|| "-".to_string());
        let lease = match (&agent.lease_owner, agent.lease_ttl_ms) {
            (Some(owner), Some(ttl)) => format!("{} ({}ms left)", owner, ttl),
            (Some(owner), None) => owner.clone(),
            _ => "-".to_string(),
        };
        println!("  {:<40} due in {:>8}  lease {}", agent.key, score, lease);
    }
    Ok(())
}

/// Reads the queue and lease state of every registered agent.
pub async fn collect_status(store: Arc<dyn CoordinationStore>) -> anyhow::Result<StatusReport> {
    let scores = TimeScoreComputer::new(None, Arc::clone(&store), Arc::new(SystemClock));
    let now = scores.now_score().await;
    let queue = DistributedQueue::new(Arc::clone(&store));
    let stats = queue.stats(now).await?;

    let mut agents = Vec::new();
    for key in queue.registered_agents().await? {
        let score = store.score_of(&key).await?;
        let lease = store.lease_of(&key).await?;
        agents.push(AgentStatus {
            key,
            score,
            lease_owner: lease.as_ref().map(|l| l.owner.clone()),
            lease_ttl_ms: lease.map(|l| l.ttl_remaining_ms),
        });
    }

    Ok(StatusReport {
        now,
        pending: stats.pending,
        due: stats.due,
        registered: stats.registered,
        agents,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from([
            "priority-scheduler",
            "run",
            "--agents",
            "agents.yaml",
            "--memory",
            "--duration-secs",
            "5",
            "--log-level",
            "debug",
        ])
        .unwrap();

        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.agents, PathBuf::from("agents.yaml"));
                assert!(args.memory);
                assert_eq!(args.duration_secs, Some(5));
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_parse_keys_commands() {
        let cli = Cli::try_parse_from(["priority-scheduler", "register", "a", "b"]).unwrap();
        match cli.command {
            Commands::Register(args) => assert_eq!(args.keys, vec!["a", "b"]),
            _ => panic!("expected register command"),
        }

        assert!(Cli::try_parse_from(["priority-scheduler", "deregister"]).is_err());

        let cli =
            Cli::try_parse_from(["priority-scheduler", "deregister", "--if-idle", "a"]).unwrap();
        match cli.command {
            Commands::Deregister(args) => {
                assert!(args.if_idle);
                assert_eq!(args.keys.keys, vec!["a"]);
            }
            _ => panic!("expected deregister command"),
        }

        let cli = Cli::try_parse_from(["priority-scheduler", "status", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Status(StatusArgs { json: true, .. })));
    }

    #[tokio::test]
    async fn test_deregister_if_idle_keeps_running_agents() {
        let store = MemoryStore::with_clock(Arc::new(ManualClock::at_secs(1_700_000_000)));
        store
            .add_agents(&[("a".to_string(), 1), ("b".to_string(), 1)])
            .await
            .unwrap();
        store
            .claim_lease("a", "node-a", Duration::from_secs(30))
            .await
            .unwrap();
        let queue = DistributedQueue::new(Arc::new(store.clone()));
        let keys = vec!["a".to_string(), "b".to_string()];

        let result = deregister_keys(&queue, &keys, true).await.unwrap();
        assert_eq!(result.removed, vec!["b".to_string()]);

        let result = deregister_keys(&queue, &keys, false).await.unwrap();
        assert_eq!(result.removed, vec!["a".to_string()]);
        assert!(store.registered_agents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_collect_status() {
        let clock = Arc::new(ManualClock::at_secs(1_700_000_000));
        let store = MemoryStore::with_clock(clock);
        store
            .add_agents(&[
                ("a".to_string(), 1_699_999_990),
                ("b".to_string(), 1_700_000_100),
            ])
            .await
            .unwrap();
        store
            .claim_lease("a", "node-a", Duration::from_secs(30))
            .await
            .unwrap();

        let report = collect_status(Arc::new(store)).await.unwrap();
        assert_eq!(report.now, 1_700_000_000);
        assert_eq!(report.pending, 2);
        assert_eq!(report.due, 1);
        assert_eq!(report.registered, 2);
        assert_eq!(report.agents[0].lease_owner.as_deref(), Some("node-a"));
        assert_eq!(report.agents[0].lease_ttl_ms, Some(30_000));
        assert_eq!(report.agents[1].lease_owner, None);
    }
}
