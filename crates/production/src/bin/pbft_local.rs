//! PBFT Local Cluster
//!
//! Runs N validators in one process, connected by in-memory channels, and
//! drives a batch of client requests through consensus.
//!
//! # Usage
//!
//! ```bash
//! # Four validators, ten requests
//! pbft-local
//!
//! # Seven validators with custom consensus settings
//! pbft-local --validators 7 --requests 50 --config local.toml
//!
//! # Persist each validator under ./data/node-<id> (requires the rocksdb feature)
//! pbft-local --data-dir ./data
//! ```
//!
//! # Configuration
//!
//! ```toml
//! [consensus]
//! view_change_timeout_ms = 3000
//! checkpoint_interval = 100
//!
//! [runner]
//! channel_capacity = 10000
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use pbft_bft::BftConfig;
use pbft_core::{Application, ApplyError, Dber, MemoryDb, StaticBackend};
use pbft_production::{
    encode_metrics, init_logging, LocalHub, ProductionRunner, RunnerConfig, RunnerHandle,
};
use pbft_types::{Hash, Proposal, ValidatorId, View};
use parking_lot::Mutex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// PBFT Local Cluster
///
/// Runs an in-process cluster and reports what it committed.
#[derive(Parser, Debug)]
#[command(name = "pbft-local")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Number of validators
    #[arg(short = 'n', long, default_value_t = 4)]
    validators: u64,

    /// Number of client requests to commit
    #[arg(short, long, default_value_t = 10)]
    requests: u64,

    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory for RocksDB; in-memory storage when omitted
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Seconds to wait for all requests to commit
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Log filter (overrides RUST_LOG)
    #[arg(long)]
    log_filter: Option<String>,

    /// Print Prometheus metrics before exiting
    #[arg(long)]
    metrics: bool,
}

/// Top-level cluster configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct LocalConfig {
    consensus: BftConfig,
    runner: RunnerConfig,
}

impl LocalConfig {
    fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config
            .consensus
            .validate()
            .with_context(|| format!("Invalid consensus config in {}", path.display()))?;
        Ok(config)
    }
}

/// Application that keeps the committed log of this run in memory.
struct LogApplication {
    id: ValidatorId,
    log: Mutex<Vec<(u64, Hash)>>,
}

impl LogApplication {
    fn new(id: ValidatorId) -> Self {
        Self {
            id,
            log: Mutex::new(Vec::new()),
        }
    }
}

impl Application for LogApplication {
    fn commit(&self, view: View, proposal: &Proposal) -> Result<(), ApplyError> {
        let mut log = self.log.lock();
        // A resumed validator starts wherever its storage left off.
        if let Some(&(last, _)) = log.last() {
            if proposal.sequence() != last + 1 {
                return Err(ApplyError::Commit {
                    sequence: proposal.sequence(),
                    reason: format!("expected sequence {}", last + 1),
                });
            }
        }
        log.push((proposal.sequence(), proposal.hash()));
        info!(validator = %self.id, %view, digest = %proposal.hash(), "Applied");
        Ok(())
    }

    fn build_checkpoint(&self, view: View, digest: Hash) -> Result<(), ApplyError> {
        info!(validator = %self.id, %view, %digest, "Checkpoint built");
        Ok(())
    }
}

fn open_storage(data_dir: Option<&Path>, id: ValidatorId) -> Result<Arc<dyn Dber>> {
    let Some(dir) = data_dir else {
        return Ok(Arc::new(MemoryDb::new()));
    };
    #[cfg(feature = "rocksdb")]
    {
        let path = dir.join(format!("node-{}", id.0));
        let storage = pbft_production::RocksDbStorage::open(&path)
            .with_context(|| format!("Failed to open storage at {}", path.display()))?;
        Ok(Arc::new(storage))
    }
    #[cfg(not(feature = "rocksdb"))]
    {
        bail!(
            "--data-dir {} for validator {id} requires the rocksdb feature",
            dir.display()
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_filter.as_deref()).context("Failed to initialize logging")?;

    let config = match &cli.config {
        Some(path) => LocalConfig::load(path)?,
        None => LocalConfig::default(),
    };
    if cli.validators == 0 {
        bail!("--validators must be at least 1");
    }

    let ids: Vec<ValidatorId> = (0..cli.validators).map(ValidatorId).collect();
    let validators = config
        .consensus
        .validator_set(ids.clone())
        .context("Invalid validator set")?;
    info!(
        validators = validators.size(),
        quorum = validators.quorum(),
        requests = cli.requests,
        "Starting local cluster"
    );

    let hub = LocalHub::new();
    let mut handles: Vec<RunnerHandle> = Vec::new();
    let mut shutdowns = Vec::new();
    let mut tasks = Vec::new();
    let mut applications = Vec::new();

    for &id in &ids {
        let (transport, inbound) = hub.join(id, config.runner.channel_capacity);
        let application = Arc::new(LogApplication::new(id));
        let mut runner = ProductionRunner::builder()
            .backend(Arc::new(StaticBackend::insecure_for_testing(
                id,
                validators.clone(),
            )))
            .bft_config(config.consensus.clone())
            .config(config.runner.clone())
            .transport(Arc::new(transport))
            .inbound(inbound)
            .application(application.clone())
            .storage(open_storage(cli.data_dir.as_deref(), id)?)
            .build()
            .with_context(|| format!("Failed to build runner for validator {id}"))?;

        if let Some(mut errors) = runner.take_error_receiver() {
            tokio::spawn(async move {
                while let Some(error) = errors.recv().await {
                    warn!(validator = %id, %error, "Collaborator error");
                }
            });
        }

        handles.push(runner.handle());
        shutdowns.extend(runner.shutdown_handle());
        applications.push(application);
        tasks.push(tokio::spawn(runner.run()));
    }

    // Replicas queue requests too, so any proposer can pick them up.
    let start_sequence = handles.first().map_or(0, |h| h.status().committed.sequence);
    for i in 0..cli.requests {
        let payload = format!("request-{i}").into_bytes();
        for handle in &handles {
            handle.submit(payload.clone())?;
        }
    }

    let target = start_sequence + cli.requests;
    let timeout = Duration::from_secs(cli.timeout_secs);
    let mut reached = 0;
    for handle in &mut handles {
        match handle.wait_for_commit(target, timeout).await {
            Ok(status) => {
                reached += 1;
                info!(committed = %status.committed, view_changes = status.view_changes, "Validator caught up");
            }
            Err(e) => warn!(error = %e, target, "Validator did not reach target"),
        }
    }

    for shutdown in shutdowns {
        shutdown.shutdown();
    }
    for task in tasks {
        task.await.context("Runner task panicked")??;
    }

    for (id, application) in ids.iter().zip(&applications) {
        let log = application.log.lock();
        println!(
            "validator {id}: {} applied, head {}",
            log.len(),
            log.last().map_or_else(|| "-".to_string(), |(_, digest)| digest.to_hex())
        );
    }
    if cli.metrics {
        println!("{}", encode_metrics()?);
    }

    if reached < handles.len() {
        bail!(
            "{} of {} validators committed sequence {target}",
            reached,
            handles.len()
        );
    }
    Ok(())
}
