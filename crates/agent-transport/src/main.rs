//! agent-transport binary entry point.
//!
//! Usage: agent-transport [--config <path>] [--collector-url <url>]
//!
//! Registers with the collector, then forwards newline-delimited JSON
//! records read from stdin:
//!
//! ```text
//! {"type": "POST", "target": "coverage", "payload": {...}}
//! ```

use agent_transport::{
    Destination, HttpDestinationMapper, HttpTransport, InMemoryMessageQueue,
    JsonMessageSerializer, MessageSendingListener, QueuedMessageSender, RetryingMetadataSender,
    SenderOptions, TransportConfig, TransportResult, UnsentReason,
};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

/// Forwards agent messages to a collector with bounded buffering and retry.
#[derive(Parser, Debug)]
#[command(name = "agent-transport")]
#[command(about = "Reliable delivery of agent messages to a remote collector")]
struct Args {
    /// Path to a JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Collector base URL.
    #[arg(long, env = "AGENT_TRANSPORT_COLLECTOR_URL")]
    collector_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Number of delivery workers.
    #[arg(long)]
    workers: Option<usize>,
}

/// One stdin line.
#[derive(Debug, Deserialize)]
struct Record {
    #[serde(rename = "type")]
    kind: String,
    target: String,
    payload: serde_json::Value,
}

/// Registration payload sent through the handshake gate.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct InstanceMetadata<'a> {
    group_id: &'a str,
    agent_id: &'a str,
    build_version: &'a str,
    instance_id: &'a str,
    transport_version: &'a str,
}

#[derive(Default)]
struct Totals {
    sent: AtomicUsize,
    unsent: AtomicUsize,
}

impl MessageSendingListener for Totals {
    fn on_sent(&self, _destination: &Destination, _payload: &[u8]) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    fn on_unsent(&self, destination: &Destination, _payload: &[u8], reason: UnsentReason) {
        self.unsent.fetch_add(1, Ordering::Relaxed);
        warn!(destination = %destination, reason = %reason, "Dropped message");
    }
}

fn load_config(args: &Args) -> TransportResult<TransportConfig> {
    let mut config = TransportConfig::load(args.config.as_deref())?;

    // CLI flags win over file and environment
    if let Some(url) = &args.collector_url {
        config.collector_url = url.clone();
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    if let Some(workers) = args.workers {
        config.worker_count = workers;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    observability::init_with_config(observability::LogConfig {
        service_name: "agent-transport".into(),
        default_level: config.log_level.clone(),
        also_stderr: true,
        ..Default::default()
    });

    info!(
        collector_url = %config.collector_url,
        instance_id = %config.instance_id,
        workers = config.worker_count,
        capacity = config.queue_capacity_bytes,
        "Configuration loaded"
    );

    let transport = Arc::new(HttpTransport::from_config(&config)?);
    let mapper = Arc::new(HttpDestinationMapper::new(
        &config.group_id,
        &config.agent_id,
        &config.build_version,
        &config.instance_id,
    ));
    let serializer = Arc::new(JsonMessageSerializer::<serde_json::Value>::new());
    let queue = Arc::new(InMemoryMessageQueue::with_sizer(
        config.queue_capacity_bytes,
        serializer.clone(),
    ));
    let totals = Arc::new(Totals::default());

    let gate = RetryingMetadataSender::<serde_json::Value>::new(
        transport.clone(),
        serializer.clone(),
        mapper.clone(),
        config.metadata_retry_interval(),
    );
    let metadata = serde_json::to_value(InstanceMetadata {
        group_id: &config.group_id,
        agent_id: &config.agent_id,
        build_version: &config.build_version,
        instance_id: &config.instance_id,
        transport_version: env!("CARGO_PKG_VERSION"),
    })?;

    // Records are buffered until the collector has accepted the registration.
    let sender = QueuedMessageSender::<serde_json::Value>::builder(queue, transport, serializer)
        .mapper(mapper)
        .options(SenderOptions::from(&config))
        .listener(totals.clone())
        .paused()
        .start();
    gate.add_state_listener(sender.state_listener());
    let registration = gate.send(&metadata)?;

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        info!("Input closed");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to read input");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Record>(&line) {
                    Ok(record) => {
                        let destination = Destination::new(record.kind, record.target);
                        if let Err(e) = sender.send(&destination, &record.payload) {
                            warn!(error = %e, "Failed to enqueue record");
                        }
                    }
                    Err(e) => warn!(error = %e, "Skipping malformed record"),
                }
            }
            _ = &mut ctrl_c => {
                info!("Received shutdown signal, exiting...");
                break;
            }
        }
    }

    gate.shutdown();
    let registered = registration.wait().await;
    sender.shutdown().await;

    info!(
        registered,
        sent = totals.sent.load(Ordering::Relaxed),
        unsent = totals.unsent.load(Ordering::Relaxed),
        "Shut down"
    );

    Ok(())
}
