/*!
Observability for the Keepsafe engine.

Structured logging goes through `tracing`. With the `metrics` feature the
engine also keeps Prometheus counters and histograms for jobs, transfers,
retention and restores; the `record_*` functions here are no-ops without it,
so call sites never need their own feature gates.
*/

#[cfg(feature = "metrics")]
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{BackupError, Result};

#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<KeepsafeMetrics>> = OnceLock::new();

/// Prometheus metrics for Keepsafe operations
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct KeepsafeMetrics {
    pub jobs_total: IntCounterVec,
    pub job_duration_seconds: HistogramVec,
    pub archive_size_bytes: HistogramVec,
    pub transfers_total: IntCounterVec,
    pub transfer_duration_seconds: HistogramVec,
    pub transfer_retries_total: IntCounterVec,
    pub evictions_total: IntCounter,
    pub restores_total: IntCounterVec,
    pub destination_healthy: IntGaugeVec,
    registry: Registry,
}

#[cfg(feature = "metrics")]
fn metric_error(name: &str, e: prometheus::Error) -> BackupError {
    BackupError::config(format!("failed to set up metric {name}: {e}"))
}

#[cfg(feature = "metrics")]
impl KeepsafeMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let jobs_total = IntCounterVec::new(
            Opts::new("keepsafe_jobs_total", "Backup jobs by tier and final status"),
            &["tier", "status"],
        )
        .map_err(|e| metric_error("keepsafe_jobs_total", e))?;

        let job_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "keepsafe_job_duration_seconds",
                "Wall-clock duration of backup jobs",
            )
            .buckets(vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0, 14400.0]),
            &["tier"],
        )
        .map_err(|e| metric_error("keepsafe_job_duration_seconds", e))?;

        let archive_size_bytes = HistogramVec::new(
            HistogramOpts::new("keepsafe_archive_size_bytes", "Size of stored archives")
                .buckets(prometheus::exponential_buckets(1024.0, 8.0, 10).map_err(|e| {
                    metric_error("keepsafe_archive_size_bytes", e)
                })?),
            &["tier"],
        )
        .map_err(|e| metric_error("keepsafe_archive_size_bytes", e))?;

        let transfers_total = IntCounterVec::new(
            Opts::new(
                "keepsafe_transfers_total",
                "Destination operations by outcome",
            ),
            &["destination", "operation", "outcome"],
        )
        .map_err(|e| metric_error("keepsafe_transfers_total", e))?;

        let transfer_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "keepsafe_transfer_duration_seconds",
                "Duration of destination operations",
            ),
            &["destination", "operation"],
        )
        .map_err(|e| metric_error("keepsafe_transfer_duration_seconds", e))?;

        let transfer_retries_total = IntCounterVec::new(
            Opts::new(
                "keepsafe_transfer_retries_total",
                "Retries of destination operations after transient failures",
            ),
            &["destination", "operation"],
        )
        .map_err(|e| metric_error("keepsafe_transfer_retries_total", e))?;

        let evictions_total = IntCounter::new(
            "keepsafe_evictions_total",
            "Backups fully evicted by retention",
        )
        .map_err(|e| metric_error("keepsafe_evictions_total", e))?;

        let restores_total = IntCounterVec::new(
            Opts::new("keepsafe_restores_total", "Restores by final state"),
            &["state"],
        )
        .map_err(|e| metric_error("keepsafe_restores_total", e))?;

        let destination_healthy = IntGaugeVec::new(
            Opts::new(
                "keepsafe_destination_healthy",
                "1 when a destination accepts new copies, 0 when marked unhealthy",
            ),
            &["destination"],
        )
        .map_err(|e| metric_error("keepsafe_destination_healthy", e))?;

        registry
            .register(Box::new(jobs_total.clone()))
            .map_err(|e| metric_error("keepsafe_jobs_total", e))?;
        registry
            .register(Box::new(job_duration_seconds.clone()))
            .map_err(|e| metric_error("keepsafe_job_duration_seconds", e))?;
        registry
            .register(Box::new(archive_size_bytes.clone()))
            .map_err(|e| metric_error("keepsafe_archive_size_bytes", e))?;
        registry
            .register(Box::new(transfers_total.clone()))
            .map_err(|e| metric_error("keepsafe_transfers_total", e))?;
        registry
            .register(Box::new(transfer_duration_seconds.clone()))
            .map_err(|e| metric_error("keepsafe_transfer_duration_seconds", e))?;
        registry
            .register(Box::new(transfer_retries_total.clone()))
            .map_err(|e| metric_error("keepsafe_transfer_retries_total", e))?;
        registry
            .register(Box::new(evictions_total.clone()))
            .map_err(|e| metric_error("keepsafe_evictions_total", e))?;
        registry
            .register(Box::new(restores_total.clone()))
            .map_err(|e| metric_error("keepsafe_restores_total", e))?;
        registry
            .register(Box::new(destination_healthy.clone()))
            .map_err(|e| metric_error("keepsafe_destination_healthy", e))?;

        Ok(Self {
            jobs_total,
            job_duration_seconds,
            archive_size_bytes,
            transfers_total,
            transfer_duration_seconds,
            transfer_retries_total,
            evictions_total,
            restores_total,
            destination_healthy,
            registry,
        })
    }

    /// Get or initialize the global metrics instance
    pub fn global() -> Option<&'static KeepsafeMetrics> {
        METRICS
            .get_or_init(|| match Self::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::error!(error = %e, "Metrics disabled");
                    None
                }
            })
            .as_ref()
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| BackupError::config(format!("failed to encode metrics: {e}")))?;
        String::from_utf8(buffer)
            .map_err(|e| BackupError::config(format!("metrics are not valid UTF-8: {e}")))
    }
}

#[allow(unused_variables)]
pub fn record_job(tier: &str, status: &str, duration: Duration, archive_bytes: Option<u64>) {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = KeepsafeMetrics::global() {
        metrics.jobs_total.with_label_values(&[tier, status]).inc();
        metrics
            .job_duration_seconds
            .with_label_values(&[tier])
            .observe(duration.as_secs_f64());
        if let Some(bytes) = archive_bytes {
            metrics
                .archive_size_bytes
                .with_label_values(&[tier])
                .observe(bytes as f64);
        }
    }
}

#[allow(unused_variables)]
pub fn record_retry(destination: &str, operation: &str) {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = KeepsafeMetrics::global() {
        metrics
            .transfer_retries_total
            .with_label_values(&[destination, operation])
            .inc();
    }
}

#[allow(unused_variables)]
pub fn record_evictions(count: usize) {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = KeepsafeMetrics::global() {
        metrics.evictions_total.inc_by(count as u64);
    }
}

#[allow(unused_variables)]
pub fn record_restore(state: &str) {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = KeepsafeMetrics::global() {
        metrics.restores_total.with_label_values(&[state]).inc();
    }
}

#[allow(unused_variables)]
pub fn record_destination_health(destination: &str, healthy: bool) {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = KeepsafeMetrics::global() {
        metrics
            .destination_healthy
            .with_label_values(&[destination])
            .set(i64::from(healthy));
    }
}

/// Times one destination operation and records its outcome
pub struct MetricsTimer {
    start: Instant,
    destination: String,
    operation: &'static str,
}

impl MetricsTimer {
    pub fn start(destination: &str, operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            destination: destination.to_string(),
            operation,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn finish(self, success: bool) -> Duration {
        let elapsed = self.start.elapsed();
        #[cfg(feature = "metrics")]
        if let Some(metrics) = KeepsafeMetrics::global() {
            let outcome = if success { "success" } else { "error" };
            metrics
                .transfers_total
                .with_label_values(&[self.destination.as_str(), self.operation, outcome])
                .inc();
            metrics
                .transfer_duration_seconds
                .with_label_values(&[self.destination.as_str(), self.operation])
                .observe(elapsed.as_secs_f64());
        }
        #[cfg(not(feature = "metrics"))]
        let _ = (success, &self.destination, self.operation);
        elapsed
    }
}

/// Logging options
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Emit one JSON object per line instead of human-readable text
    pub json: bool,
    /// Raise the default level for keepsafe targets to debug
    pub verbose: bool,
}

/// Initialize the global tracing subscriber
///
/// `RUST_LOG` takes precedence; otherwise keepsafe targets log at `info`
/// (`debug` when verbose) and everything else at `warn`.
pub fn init_observability(options: &LogOptions) -> Result<()> {
    #[cfg(feature = "metrics")]
    KeepsafeMetrics::global();

    let default_directive = if options.verbose {
        "warn,keepsafe=debug,keepsafe_core=debug,keepsafe_retry=debug"
    } else {
        "warn,keepsafe=info,keepsafe_core=info,keepsafe_retry=info"
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .map_err(|e| BackupError::config(format!("invalid log filter: {e}")))?;

    let result = if options.json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    };
    result.map_err(|e| BackupError::config(format!("failed to set tracing subscriber: {e}")))?;

    tracing::debug!("Keepsafe observability initialized");
    Ok(())
}
