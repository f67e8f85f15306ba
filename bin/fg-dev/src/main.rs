//! Flowgate Development Binary
//!
//! A loan broker running every routing component in one process:
//! - A polling scheduler emits one quote request per poll
//! - Each request fans out to a set of simulated banks, every bank call
//!   wrapped in the retry template
//! - Every quote passes the redelivery policy, then the aggregator
//! - The lowest quote per request is logged; expired or failed requests land
//!   in the failure log
//!
//! Configuration comes from `flowgate.toml` (or `FLOWGATE_CONFIG`) plus
//! `FLOWGATE_*` environment overrides.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fg_common::Message;
use fg_config::{AppConfig, ConfigLoader, ObjectStoreConfig};
use fg_retry::{AsyncRetryTemplate, RetryContext, RetryError, RetryPolicyTemplate, Submission};
use fg_router::{
    object_store_from_config, spawn_group_reaper, Aggregator, CompositeFailureHandler, FailureLog,
    LoggingFailureHandler, RedeliveryPolicy, RouterError,
};
use fg_scheduler::{FixedFrequencyScheduler, FnJob, PollJob, TimeUnit};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::json;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const BANKS: &[(&str, f64)] = &[
    ("first-national", 4.8),
    ("harbour-savings", 5.1),
    ("union-mutual", 4.6),
    ("north-bank", 5.4),
];

/// Probability that a single bank call fails and has to be retried
const BANK_FAILURE_RATE: f64 = 0.15;

/// Limits applied to an unbounded memory store. Quotes are never redelivered
/// here, so records kept after a failed group would otherwise pile up.
const DEMO_RECORD_TTL_SECS: u64 = 600;
const DEMO_MAX_RECORDS: usize = 10_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fg_common::logging::init_logging("fg-dev");

    info!("Starting Flowgate loan broker");

    let config = ConfigLoader::new().load()?;
    if config.metrics.enabled {
        let addr: SocketAddr = config.metrics.listen_address.parse()?;
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!(address = %addr, "Prometheus exporter listening");
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // 1. Failure handling
    let failure_log = Arc::new(FailureLog::default());
    let failure_handler = Arc::new(
        CompositeFailureHandler::new()
            .with(Arc::new(LoggingFailureHandler))
            .with(failure_log.clone()),
    );

    // 2. Redelivery policy and aggregator
    let store = object_store_from_config(&bounded_store_config(&config.redelivery.object_store)).await?;
    let redelivery = Arc::new(RedeliveryPolicy::from_config(
        &config.redelivery,
        store,
        failure_handler.clone(),
    )?);
    let aggregator = Arc::new(Aggregator::from_config(&config.aggregator, failure_handler)?);
    info!(
        id_expression = %redelivery.id_expression(),
        max_redelivery = redelivery.config().max_redelivery_count,
        reducer = aggregator.reducer().name(),
        "Routing core ready"
    );

    let reaper_handle = spawn_group_reaper(
        aggregator.clone(),
        config.aggregator.reaper_interval(),
        &shutdown_tx,
    );

    // 3. Bank connections
    let retry = Arc::new(RetryPolicyTemplate::from_config(&config.retry).with_metadata("component", "bank"));
    let directory = Arc::new(BankDirectory::new());
    let async_retry = AsyncRetryTemplate::new(RetryPolicyTemplate::from_config(&config.retry));
    connect_directory(&config, &retry, &async_retry, directory.clone()).await?;

    // 4. Broker poll
    let broker = Arc::new(LoanBroker {
        banks: BANKS
            .iter()
            .map(|(name, base_rate)| SimulatedBank::new(name, *base_rate))
            .collect(),
        directory,
        retry,
        redelivery,
        aggregator,
        requests: AtomicU64::new(0),
    });
    let scheduler = FixedFrequencyScheduler::from_config("loan-broker", &config.poll, broker)?;
    scheduler.initialise()?;
    scheduler.start()?;

    // 5. Failure log housekeeping
    let cleanup_log = failure_log.clone();
    let cleanup = FixedFrequencyScheduler::new(
        "failure-log-cleanup",
        1,
        1,
        Arc::new(FnJob::new(move || {
            let log = cleanup_log.clone();
            async move {
                log.cleanup();
                Ok(())
            }
        })),
        TimeUnit::Hours,
    );
    cleanup.initialise()?;
    cleanup.start()?;

    info!(
        frequency_ms = scheduler.frequency().as_millis() as u64,
        banks = BANKS.len(),
        "Loan broker started"
    );

    shutdown_signal().await;
    info!("Shutdown signal received, stopping loan broker");

    async_retry.cancel();
    for scheduler in [&scheduler, &cleanup] {
        if let Err(e) = scheduler.stop().and_then(|_| scheduler.dispose()) {
            warn!(scheduler = scheduler.name(), error = %e, "Scheduler did not stop cleanly");
        }
    }
    let _ = shutdown_tx.send(());

    let shutdown_timeout = Duration::from_secs(5);
    if tokio::time::timeout(shutdown_timeout, reaper_handle).await.is_err() {
        warn!("Group reaper did not stop within {:?}", shutdown_timeout);
    }

    info!(
        failures = failure_log.count(),
        "Loan broker shutdown complete"
    );
    Ok(())
}

/// Fill in size and age limits for a memory store configured without them
fn bounded_store_config(config: &ObjectStoreConfig) -> ObjectStoreConfig {
    let mut bounded = config.clone();
    if bounded.store_type.eq_ignore_ascii_case("memory") {
        bounded.entry_ttl_secs.get_or_insert(DEMO_RECORD_TTL_SECS);
        bounded.max_entries.get_or_insert(DEMO_MAX_RECORDS);
    }
    bounded
}

/// Connect to the rate directory before the first poll. In asynchronous mode
/// the connection is retried in the background and polls start immediately.
async fn connect_directory(
    config: &AppConfig,
    retry: &RetryPolicyTemplate,
    async_retry: &AsyncRetryTemplate,
    directory: Arc<BankDirectory>,
) -> anyhow::Result<()> {
    if config.retry.asynchronous {
        let submission = async_retry.submit("connect rate directory", move |ctx: &RetryContext| {
            let directory = directory.clone();
            let attempt = ctx.attempt();
            async move { directory.connect(attempt).await }
        });
        if let Submission::Started(handle) = submission {
            tokio::spawn(async move {
                match handle.await {
                    Ok(Ok(())) => info!("Rate directory connected in background"),
                    Ok(Err(e)) => warn!(error = %e, "Rate directory unavailable"),
                    Err(e) => error!(error = %e, "Rate directory task failed"),
                }
            });
        }
        return Ok(());
    }

    match retry
        .execute("connect rate directory", |ctx| directory.connect(ctx.attempt()))
        .await
    {
        Ok(()) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("{}", e)),
    }
}

/// Rate directory that refuses the first connection attempt
struct BankDirectory {
    connected: std::sync::atomic::AtomicBool,
}

impl BankDirectory {
    fn new() -> Self {
        Self {
            connected: std::sync::atomic::AtomicBool::new(false),
        }
    }

    async fn connect(&self, attempt: u32) -> Result<(), String> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if attempt < 2 {
            return Err("connection refused".to_string());
        }
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

struct SimulatedBank {
    name: String,
    base_rate: f64,
}

impl SimulatedBank {
    fn new(name: &str, base_rate: f64) -> Self {
        Self {
            name: name.to_string(),
            base_rate,
        }
    }

    async fn quote(&self, amount: u64) -> Result<f64, String> {
        let latency = rand::random_range(5..50);
        tokio::time::sleep(Duration::from_millis(latency)).await;

        if rand::random::<f64>() < BANK_FAILURE_RATE {
            return Err(format!("{} timed out", self.name));
        }
        // Larger loans get a slightly better rate
        let discount = (amount as f64 / 1_000_000.0).min(0.5);
        let spread = rand::random_range(-0.4..0.4);
        Ok(((self.base_rate - discount + spread) * 100.0).round() / 100.0)
    }
}

struct LoanBroker {
    banks: Vec<SimulatedBank>,
    directory: Arc<BankDirectory>,
    retry: Arc<RetryPolicyTemplate>,
    redelivery: Arc<RedeliveryPolicy>,
    aggregator: Arc<Aggregator>,
    requests: AtomicU64,
}

impl LoanBroker {
    /// Ask one bank for a quote. Exhausted retries still produce a member,
    /// marked failed, so the group fails instead of waiting for its timeout.
    async fn request_quote(&self, bank: &SimulatedBank, request_id: &str, amount: u64) -> Message {
        let description = format!("quote {} from {}", request_id, bank.name);
        let outcome = self.retry.execute(&description, |_| bank.quote(amount)).await;

        let group_size = self.banks.len() as u32;
        let message = match outcome {
            Ok(rate) => Message::new(json!({
                "bank": bank.name,
                "rate": rate,
                "amount": amount,
            })),
            Err(RetryError::Exhausted { last_error, .. }) => {
                Message::new(json!({"bank": bank.name})).failed(last_error)
            }
            Err(e) => Message::new(json!({"bank": bank.name})).failed(e.to_string()),
        };

        message
            .correlated(request_id, Some(group_size))
            .property("bank", bank.name.as_str())
            .property("requestId", request_id)
    }

    async fn route(&self, quote: Message) {
        let bank = quote.properties.get("bank").cloned().unwrap_or_default();
        match self.redelivery.process(quote, |m| self.aggregator.accept(m)).await {
            Ok(Some(result)) => info!(
                request_id = %result.correlation_id,
                bank = %result.message.properties.get("bank").map(String::as_str).unwrap_or("unknown"),
                rate = %result.message.payload["rate"],
                quotes = result.member_count,
                "Best quote selected"
            ),
            Ok(None) => debug!(bank = %bank, "Quote accepted"),
            Err(RouterError::Processing { identity, reason }) => {
                warn!(identity = %identity, bank = %bank, reason = %reason, "Quote not aggregated")
            }
            Err(e) => warn!(bank = %bank, error = %e, "Quote rejected"),
        }
    }
}

#[async_trait]
impl PollJob for LoanBroker {
    async fn run(&self) -> anyhow::Result<()> {
        if !self.directory.is_connected() {
            debug!("Rate directory not connected yet, skipping poll");
            return Ok(());
        }

        let sequence = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        let request_id = format!("loan-{}", sequence);
        let amount = rand::random_range(10_000..500_000u64);
        debug!(request_id = %request_id, amount = amount, "Requesting quotes");

        let quotes = futures::future::join_all(
            self.banks
                .iter()
                .map(|bank| self.request_quote(bank, &request_id, amount)),
        )
        .await;

        for quote in quotes {
            self.route(quote).await;
        }
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_gets_demo_limits() {
        let bounded = bounded_store_config(&ObjectStoreConfig::default());
        assert_eq!(bounded.entry_ttl_secs, Some(DEMO_RECORD_TTL_SECS));
        assert_eq!(bounded.max_entries, Some(DEMO_MAX_RECORDS));

        let configured = ObjectStoreConfig {
            max_entries: Some(5),
            ..Default::default()
        };
        assert_eq!(bounded_store_config(&configured).max_entries, Some(5));
    }

    #[test]
    fn test_file_store_is_left_alone() {
        let file = ObjectStoreConfig {
            store_type: "file".to_string(),
            ..Default::default()
        };
        let bounded = bounded_store_config(&file);
        assert_eq!(bounded.entry_ttl_secs, None);
        assert_eq!(bounded.max_entries, None);
    }
}
