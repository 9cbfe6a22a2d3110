//! CLI command definitions for fairq.
//!
//! Every command talks to Redis directly and prints JSON to stdout, so the
//! binary doubles as an operator tool and a smoke-test harness.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::concurrency::ConcurrencyGroupConfig;
use crate::keys::DEFAULT_KEY_PREFIX;
use crate::locker::{LockError, LockRetryOverrides, RunLocker, RunLockerConfig};
use crate::metrics::{export_metrics, init_metrics};
use crate::queue::{
    BatchEnqueueOptions, BatchMessage, DeadLetterMessage, EnqueueOptions, FairQueue,
    FairQueueConfig, MessageContext, SchedulerKind,
};
use crate::scheduler::{DrrConfig, FairDequeuingConfig};

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Redis-backed multi-tenant fair queue.
#[derive(Parser)]
#[command(name = "fairq")]
#[command(about = "Inspect and drive a Redis-backed multi-tenant fair queue")]
#[command(version)]
#[command(
    long_about = "fairq enqueues, consumes and inspects messages in a Redis-backed fair queue, and can hold run locks.\n\nExample usage:\n  fairq enqueue org:acme:env:prod:queue:emails --payload '{\"to\":\"a@b.c\"}'\n  fairq consume --consumers 2 --duration-secs 30\n  fairq dlq list acme"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis connection URL.
    #[arg(long, env = "REDIS_URL", default_value = DEFAULT_REDIS_URL, global = true)]
    pub redis_url: String,

    /// Prefix for every key fairq writes.
    #[arg(long, env = "FAIRQ_PREFIX", default_value = DEFAULT_KEY_PREFIX, global = true)]
    pub prefix: String,

    /// Number of master-queue shards.
    #[arg(long, env = "FAIRQ_SHARDS", default_value = "2", global = true)]
    pub shards: u32,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Enqueue one or more messages.
    Enqueue(EnqueueArgs),

    /// Print queue, in-flight and dead-letter counts.
    Stats(StatsArgs),

    /// Inspect or redrive dead letters.
    Dlq(DlqArgs),

    /// Run consumers that log each message and complete it.
    Consume(ConsumeArgs),

    /// Hold a run lock on some resources for a while.
    Lock(LockArgs),
}

/// Arguments for `fairq enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Queue id, `org:{org}:env:{env}:queue:{name}`.
    pub queue_id: String,

    /// Owning tenant; defaults to the queue's org.
    #[arg(short, long, default_value = "")]
    pub tenant: String,

    /// JSON payload.
    #[arg(short, long, default_value = "{}")]
    pub payload: String,

    /// Number of copies to enqueue in one atomic batch.
    #[arg(short = 'n', long, default_value = "1")]
    pub count: usize,

    /// Delay delivery by this many milliseconds.
    #[arg(long)]
    pub delay_ms: Option<u64>,

    /// Metadata entries as `key=value`.
    #[arg(short, long = "metadata")]
    pub metadata: Vec<String>,
}

/// Arguments for `fairq stats`.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Queues to report lengths for.
    #[arg(short, long = "queue")]
    pub queues: Vec<String>,

    /// Tenants to report dead-letter counts for.
    #[arg(short, long = "tenant")]
    pub tenants: Vec<String>,
}

/// Arguments for `fairq dlq`.
#[derive(Parser, Debug)]
pub struct DlqArgs {
    #[command(subcommand)]
    pub command: DlqSubcommand,
}

/// Dead-letter subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum DlqSubcommand {
    /// List a tenant's dead letters, oldest first.
    List {
        tenant: String,

        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Move a dead letter back into its queue.
    Redrive { tenant: String, message_id: String },
}

/// Arguments for `fairq consume`.
#[derive(Parser, Debug)]
pub struct ConsumeArgs {
    /// Number of consumer loops.
    #[arg(short, long, default_value = "1")]
    pub consumers: usize,

    /// Stop after this many seconds; runs until Ctrl-C otherwise.
    #[arg(short, long)]
    pub duration_secs: Option<u64>,

    /// Cap on concurrently processed messages per tenant.
    #[arg(long)]
    pub tenant_limit: Option<u64>,

    /// Cap on concurrently processed messages per environment.
    #[arg(long)]
    pub env_limit: Option<u64>,

    /// Scheduling algorithm: `fair` or `drr`.
    #[arg(long, default_value = "fair")]
    pub scheduler: String,

    /// Claim visibility timeout in milliseconds.
    #[arg(long, default_value = "30000")]
    pub visibility_timeout_ms: u64,

    /// Simulated work per message in milliseconds.
    #[arg(long, default_value = "0")]
    pub work_ms: u64,

    /// Print Prometheus metrics after stopping.
    #[arg(long)]
    pub metrics: bool,
}

/// Arguments for `fairq lock`.
#[derive(Parser, Debug)]
pub struct LockArgs {
    /// Resources to lock.
    #[arg(required = true)]
    pub resources: Vec<String>,

    /// Lock name.
    #[arg(long, default_value = "cli")]
    pub name: String,

    /// How long to hold the lock once acquired.
    #[arg(long, default_value = "1000")]
    pub hold_ms: u64,

    /// Lease duration; renewed while held.
    #[arg(long, default_value = "5000")]
    pub lease_ms: u64,

    /// Override the retry limit.
    #[arg(long)]
    pub max_retries: Option<u32>,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let base = FairQueueConfig::default()
        .with_key_prefix(cli.prefix.clone())
        .with_shard_count(cli.shards);

    match cli.command {
        Commands::Enqueue(args) => run_enqueue_command(&cli.redis_url, base, args).await,
        Commands::Stats(args) => run_stats_command(&cli.redis_url, base, args).await,
        Commands::Dlq(args) => run_dlq_command(&cli.redis_url, base, args).await,
        Commands::Consume(args) => run_consume_command(&cli.redis_url, base, args).await,
        Commands::Lock(args) => run_lock_command(&cli.redis_url, &cli.prefix, args).await,
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| anyhow::anyhow!("Failed to serialize output: {}", e))?;
    println!("{}", json);
    Ok(())
}

fn parse_metadata(entries: &[String]) -> anyhow::Result<Vec<(String, String)>> {
    entries
        .iter()
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .filter(|(k, _)| !k.is_empty())
                .ok_or_else(|| anyhow::anyhow!("Invalid metadata '{}', expected key=value", entry))
        })
        .collect()
}

fn parse_scheduler(name: &str) -> anyhow::Result<SchedulerKind> {
    match name.to_ascii_lowercase().as_str() {
        "fair" | "fair-dequeuing" => Ok(SchedulerKind::FairDequeuing(
            FairDequeuingConfig::default(),
        )),
        "drr" => Ok(SchedulerKind::Drr(DrrConfig::default())),
        other => Err(anyhow::anyhow!(
            "Unknown scheduler '{}', expected 'fair' or 'drr'",
            other
        )),
    }
}

// ============================================================================
// Enqueue
// ============================================================================

#[derive(Debug, Serialize)]
struct EnqueueOutput {
    status: &'static str,
    queue_id: String,
    message_ids: Vec<String>,
}

async fn run_enqueue_command(
    redis_url: &str,
    config: FairQueueConfig,
    args: EnqueueArgs,
) -> anyhow::Result<()> {
    let payload: serde_json::Value = serde_json::from_str(&args.payload)
        .map_err(|e| anyhow::anyhow!("Payload is not valid JSON: {}", e))?;
    let metadata = parse_metadata(&args.metadata)?;
    let available_at = args
        .delay_ms
        .map(|ms| chrono::Utc::now() + chrono::Duration::milliseconds(ms as i64));

    let queue = FairQueue::connect(redis_url, config).await?;

    let message_ids = if args.count <= 1 {
        let mut options = EnqueueOptions::new(&args.queue_id, &args.tenant, payload);
        if let Some(at) = available_at {
            options = options.with_available_at(at);
        }
        for (key, value) in metadata {
            options = options.with_metadata(key, value);
        }
        vec![queue.enqueue(options).await?]
    } else {
        let messages = (0..args.count)
            .map(|_| {
                let mut message = BatchMessage::new(payload.clone());
                if let Some(at) = available_at {
                    message = message.with_available_at(at);
                }
                message.metadata.extend(metadata.iter().cloned());
                message
            })
            .collect();
        queue
            .enqueue_batch(BatchEnqueueOptions {
                queue_id: args.queue_id.clone(),
                tenant_id: args.tenant.clone(),
                messages,
            })
            .await?
    };

    info!(queue_id = %args.queue_id, count = message_ids.len(), "Enqueued");
    print_json(&EnqueueOutput {
        status: "enqueued",
        queue_id: args.queue_id,
        message_ids,
    })
}

// ============================================================================
// Stats
// ============================================================================

#[derive(Debug, Serialize)]
struct StatsOutput {
    active_queues: u64,
    inflight: u64,
    queue_lengths: HashMap<String, u64>,
    dead_letters: HashMap<String, u64>,
}

async fn run_stats_command(
    redis_url: &str,
    config: FairQueueConfig,
    args: StatsArgs,
) -> anyhow::Result<()> {
    let queue = FairQueue::connect(redis_url, config).await?;

    let mut queue_lengths = HashMap::new();
    for queue_id in &args.queues {
        queue_lengths.insert(queue_id.clone(), queue.get_queue_length(queue_id).await?);
    }

    let mut dead_letters = HashMap::new();
    for tenant in &args.tenants {
        dead_letters.insert(
            tenant.clone(),
            queue.get_dead_letter_queue_length(tenant).await?,
        );
    }

    print_json(&StatsOutput {
        active_queues: queue.get_total_queue_count().await?,
        inflight: queue.get_total_inflight_count().await?,
        queue_lengths,
        dead_letters,
    })
}

// ============================================================================
// Dead letters
// ============================================================================

#[derive(Debug, Serialize)]
struct DlqListOutput {
    tenant_id: String,
    total: u64,
    messages: Vec<DeadLetterMessage>,
}

#[derive(Debug, Serialize)]
struct DlqRedriveOutput {
    tenant_id: String,
    message_id: String,
    redriven: bool,
}

async fn run_dlq_command(
    redis_url: &str,
    config: FairQueueConfig,
    args: DlqArgs,
) -> anyhow::Result<()> {
    let queue = FairQueue::connect(redis_url, config).await?;

    match args.command {
        DlqSubcommand::List { tenant, limit } => {
            let messages = queue.get_dead_letter_messages(&tenant, limit).await?;
            let total = queue.get_dead_letter_queue_length(&tenant).await?;
            print_json(&DlqListOutput {
                tenant_id: tenant,
                total,
                messages,
            })
        }
        DlqSubcommand::Redrive { tenant, message_id } => {
            let redriven = queue.redrive_message(&tenant, &message_id).await?;
            if !redriven {
                warn!(tenant_id = %tenant, message_id = %message_id, "No such dead letter");
            }
            print_json(&DlqRedriveOutput {
                tenant_id: tenant,
                message_id,
                redriven,
            })
        }
    }
}

// ============================================================================
// Consume
// ============================================================================

#[derive(Debug, Serialize)]
struct ConsumeOutput {
    status: &'static str,
    processed: u64,
    elapsed_secs: f64,
    clean_shutdown: bool,
}

async fn run_consume_command(
    redis_url: &str,
    config: FairQueueConfig,
    args: ConsumeArgs,
) -> anyhow::Result<()> {
    if args.metrics {
        init_metrics()?;
    }

    let mut config = config
        .with_consumer_count(args.consumers)
        .with_visibility_timeout(Duration::from_millis(args.visibility_timeout_ms))
        .with_scheduler(parse_scheduler(&args.scheduler)?);
    if let Some(limit) = args.tenant_limit {
        config = config.with_concurrency_group(ConcurrencyGroupConfig::tenant(limit));
    }
    if let Some(limit) = args.env_limit {
        config = config.with_concurrency_group(ConcurrencyGroupConfig::env(limit));
    }

    let mut queue = FairQueue::connect(redis_url, config).await?;
    let processed = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&processed);
    let work = Duration::from_millis(args.work_ms);

    queue.on_message(move |ctx: MessageContext| {
        let counter = Arc::clone(&counter);
        async move {
            info!(
                message_id = %ctx.message().id,
                queue_id = %ctx.queue().queue_id,
                tenant_id = %ctx.queue().tenant_id,
                attempt = ctx.message().attempt,
                "Processing message"
            );
            if !work.is_zero() {
                tokio::time::sleep(work).await;
            }
            ctx.complete().await?;
            counter.fetch_add(1, Ordering::Relaxed);
            Ok::<(), anyhow::Error>(())
        }
    });

    let started = Instant::now();
    queue.start().await?;

    match args.duration_secs {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("Interrupted");
        }
    }

    let clean_shutdown = match queue.close().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Consumers did not shut down cleanly");
            false
        }
    };

    print_json(&ConsumeOutput {
        status: "stopped",
        processed: processed.load(Ordering::Relaxed),
        elapsed_secs: started.elapsed().as_secs_f64(),
        clean_shutdown,
    })?;

    if args.metrics {
        print!("{}", export_metrics());
    }
    Ok(())
}

// ============================================================================
// Lock
// ============================================================================

#[derive(Debug, Serialize)]
struct LockOutput {
    status: &'static str,
    name: String,
    resources: Vec<String>,
    held_ms: u64,
    lost: bool,
}

async fn run_lock_command(redis_url: &str, prefix: &str, args: LockArgs) -> anyhow::Result<()> {
    let redis = crate::store::connect(redis_url).await?;
    let config = RunLockerConfig::default()
        .with_key_prefix(prefix)
        .with_retry_overrides(LockRetryOverrides {
            max_retries: args.max_retries,
            ..Default::default()
        });
    let locker = RunLocker::new(redis, config);
    let hold = Duration::from_millis(args.hold_ms);

    let outcome: Result<(u64, bool), LockError> = locker
        .lock(
            &args.name,
            args.resources.clone(),
            Duration::from_millis(args.lease_ms),
            |signal| async move {
                let started = Instant::now();
                let lost = tokio::select! {
                    _ = tokio::time::sleep(hold) => false,
                    _ = signal.cancelled() => true,
                };
                Ok((started.elapsed().as_millis() as u64, lost))
            },
        )
        .await;
    locker.quit().await;

    let output = match outcome {
        Ok((held_ms, lost)) => LockOutput {
            status: if lost { "lost" } else { "released" },
            name: args.name,
            resources: args.resources,
            held_ms,
            lost,
        },
        Err(LockError::AcquisitionTimeout { .. }) => LockOutput {
            status: "timeout",
            name: args.name,
            resources: args.resources,
            held_ms: 0,
            lost: false,
        },
        Err(e) => return Err(e.into()),
    };
    print_json(&output)
}
