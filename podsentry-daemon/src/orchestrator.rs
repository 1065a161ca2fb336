//! Module orchestration -- assembly, channel wiring, and lifecycle management.
//!
//! The [`Orchestrator`] is the central coordinator of `podsentry-daemon`.
//! It loads configuration, creates inter-module channels, builds the
//! modules, manages startup/shutdown ordering, and runs the main event
//! loop that applies workload events to the store.
//!
//! # Startup Order (consumers before producers)
//!
//! 1. Upstream Reporter (consumes ReportJobs)
//! 2. Scan Scheduler (produces ScanEvents consumed by the event loop)
//! 3. Cluster Watcher (floods WorkloadEvents on start)
//!
//! # Shutdown Order (producers first)
//!
//! 1. Cluster Watcher (stop producing WorkloadEvents)
//! 2. Event loop drains already-emitted events
//! 3. Scan Scheduler (waits for in-flight scans)
//! 4. Upstream Reporter (flushes the job queue within the grace period)

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::mpsc;

use podsentry_cluster_watch::{ClusterClient, ClusterWatcher, ClusterWatcherBuilder, KubeClusterClient};
use podsentry_core::config::AgentConfig;
use podsentry_core::event::{
    MODULE_CLUSTER_WATCH, MODULE_IMAGE_SCAN, MODULE_UPSTREAM_REPORT, ScanEvent, WorkloadEvent,
};
use podsentry_core::pipeline::Pipeline;
use podsentry_image_scan::{RegistryImagePuller, ScanScheduler, ScanSchedulerBuilder};
use podsentry_inventory::WorkloadStore;
use podsentry_upstream_report::{
    HttpUpstreamClient, ReportJob, UpstreamReporter, UpstreamReporterBuilder,
};

use crate::health::{DaemonHealth, ModuleHealth, aggregate_status};
use crate::metrics_server;
use crate::wiring;

/// Seconds between periodic health check cycles.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// The main daemon orchestrator.
///
/// Owns the workload store (single-writer discipline: only the event
/// loop in [`Orchestrator::run`] mutates it) and the three pipeline
/// modules.
pub struct Orchestrator {
    /// Loaded and validated configuration.
    config: AgentConfig,
    /// Cluster watcher (WorkloadEvent producer).
    watcher: ClusterWatcher<KubeClusterClient>,
    /// Scan scheduler (ScanEvent producer, scan cache owner).
    scheduler: ScanScheduler<RegistryImagePuller>,
    /// Upstream reporter (ReportJob consumer).
    reporter: UpstreamReporter<HttpUpstreamClient>,
    /// Workload inventory, mutated only by the event loop.
    store: WorkloadStore,
    /// Workload event channel (taken by the event loop).
    event_rx: Option<mpsc::Receiver<WorkloadEvent>>,
    /// Scan completion channel (taken by the event loop).
    scan_rx: Option<mpsc::Receiver<ScanEvent>>,
    /// Report job submission channel.
    job_tx: mpsc::Sender<ReportJob>,
    /// Daemon start time (for uptime reporting).
    start_time: Instant,
}

impl Orchestrator {
    /// Load configuration and build the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration cannot be read, parsed, or validated
    /// - The cluster API is unreachable (fatal at startup by design:
    ///   an agent that cannot watch anything should crash-loop visibly)
    /// - Any module fails to initialize
    #[allow(dead_code)] // Public API, main uses build_from_config
    pub async fn build(config_path: &Path) -> Result<Self> {
        let config = AgentConfig::load(config_path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to load config: {}", e))?;
        Self::build_from_config(config).await
    }

    /// Build from an already-loaded configuration.
    pub async fn build_from_config(config: AgentConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;

        // Install metrics recorder before module initialization
        if config.metrics.enabled {
            metrics_server::install_metrics_recorder(&config.metrics)?;
            metrics::gauge!(
                podsentry_core::metrics::DAEMON_BUILD_INFO,
                "version" => env!("CARGO_PKG_VERSION")
            )
            .set(1.0);
            tracing::info!(port = config.metrics.port, "metrics endpoint enabled");
        }

        // Cluster client: unreachable API at startup is fatal
        tracing::info!("connecting to cluster API");
        let cluster_client = KubeClusterClient::connect()
            .await
            .map_err(|e| anyhow::anyhow!("failed to create cluster client: {}", e))?;
        cluster_client
            .ping()
            .await
            .map_err(|e| anyhow::anyhow!("cluster API unreachable at startup: {}", e))?;

        let (watcher, event_rx) = ClusterWatcherBuilder::new()
            .client(Arc::new(cluster_client))
            .cluster_name(&config.cluster.name)
            .event_channel_capacity(config.cluster.event_channel_capacity)
            .resync_interval(resync_interval(config.cluster.resync_interval_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build cluster watcher: {}", e))?;

        let puller = Arc::new(
            RegistryImagePuller::new(&config.scan.registry_auth)
                .map_err(|e| anyhow::anyhow!("failed to create image puller: {}", e))?,
        );
        let mut scheduler_builder = ScanSchedulerBuilder::new()
            .puller(puller)
            .max_concurrency(config.scan.max_concurrency)
            .retry_max_attempts(config.scan.retry_max_attempts)
            .retry_backoff_base(Duration::from_millis(config.scan.retry_backoff_base_ms));
        if !config.scan.workdir.is_empty() {
            scheduler_builder = scheduler_builder.workdir(&config.scan.workdir);
        }
        let (scheduler, scan_rx) = scheduler_builder
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build scan scheduler: {}", e))?;

        let upstream_client = HttpUpstreamClient::new(
            &config.upstream.base_url,
            &config.upstream.integration_id,
            Duration::from_secs(config.upstream.timeout_secs),
        )
        .map_err(|e| anyhow::anyhow!("failed to create upstream client: {}", e))?;
        let (reporter, job_tx) = UpstreamReporterBuilder::new()
            .client(Arc::new(upstream_client))
            .retry_backoff_base(Duration::from_millis(config.upstream.retry_backoff_base_ms))
            .retry_backoff_max(Duration::from_millis(config.upstream.retry_backoff_max_ms))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build upstream reporter: {}", e))?;

        tracing::info!(cluster = %config.cluster.name, "orchestrator initialized");

        Ok(Self {
            config,
            watcher,
            scheduler,
            reporter,
            store: WorkloadStore::new(),
            event_rx,
            scan_rx,
            job_tx,
            start_time: Instant::now(),
        })
    }

    /// Start all modules and run the main event loop.
    ///
    /// Blocks until a shutdown signal (SIGTERM or SIGINT) is received,
    /// then performs graceful shutdown in producer-first order.
    pub async fn run(&mut self) -> Result<()> {
        if !self.config.general.pid_file.is_empty() {
            write_pid_file(Path::new(&self.config.general.pid_file))?;
        }

        let result = self.run_inner().await;

        if !self.config.general.pid_file.is_empty() {
            remove_pid_file(Path::new(&self.config.general.pid_file));
        }
        result
    }

    async fn run_inner(&mut self) -> Result<()> {
        let mut event_rx = self
            .event_rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("orchestrator already ran"))?;
        let mut scan_rx = self
            .scan_rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("orchestrator already ran"))?;

        // Consumers before producers
        self.reporter
            .start()
            .await
            .map_err(|e| anyhow::anyhow!("failed to start upstream reporter: {}", e))?;
        self.scheduler
            .start()
            .await
            .map_err(|e| anyhow::anyhow!("failed to start scan scheduler: {}", e))?;
        if let Err(e) = self.watcher.start().await {
            tracing::warn!("watcher startup failed, rolling back started modules");
            let _ = self.scheduler.stop().await;
            let _ = self.reporter.stop().await;
            return Err(anyhow::anyhow!("failed to start cluster watcher: {}", e));
        }

        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("failed to install SIGTERM handler: {}", e))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| anyhow::anyhow!("failed to install SIGINT handler: {}", e))?;

        let mut health_interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        health_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!("entering main event loop");
        let cause = loop {
            tokio::select! {
                _ = sigterm.recv() => break "SIGTERM",
                _ = sigint.recv() => break "SIGINT",
                event = event_rx.recv() => match event {
                    Some(event) => self.handle_workload_event(event).await,
                    None => {
                        tracing::error!("workload event channel closed unexpectedly");
                        break "event channel closed";
                    }
                },
                scan = scan_rx.recv() => match scan {
                    Some(scan) => self.handle_scan_event(scan).await,
                    None => {
                        tracing::error!("scan event channel closed unexpectedly");
                        break "scan channel closed";
                    }
                },
                _ = health_interval.tick() => self.report_health().await,
            }
        };
        tracing::info!(cause = cause, "leaving main event loop");

        // Stop producers first so the drains below see everything
        if let Err(e) = self.watcher.stop().await {
            tracing::error!(error = %e, "failed to stop cluster watcher");
        }
        while let Ok(event) = event_rx.try_recv() {
            self.handle_workload_event(event).await;
        }

        if let Err(e) = self.scheduler.stop().await {
            tracing::error!(error = %e, "failed to stop scan scheduler");
        }
        while let Ok(scan) = scan_rx.try_recv() {
            self.handle_scan_event(scan).await;
        }

        if let Err(e) = self.reporter.stop().await {
            tracing::error!(error = %e, "failed to stop upstream reporter");
        }

        Ok(())
    }

    /// Apply one workload event and enqueue its side effects.
    async fn handle_workload_event(&mut self, event: WorkloadEvent) {
        tracing::debug!(event = %event, "applying workload event");
        let outcome = self.store.apply(&event);

        for image in outcome.new_images {
            self.scheduler
                .schedule(image, event.metadata.trace_id.clone())
                .await;
        }

        let jobs = wiring::jobs_for_deltas(&self.store, &outcome.deltas);
        self.submit_jobs(jobs).await;
    }

    /// React to one scan completion: upsert dependency graphs for every
    /// workload currently referencing the scanned image.
    async fn handle_scan_event(&mut self, scan: ScanEvent) {
        tracing::debug!(scan = %scan, "scan completed");

        if !scan.success {
            // Owning workloads stay reported without dependency graphs
            tracing::warn!(image = %scan.image, "scan failed, skipping dependency graphs");
            return;
        }

        let Some(report) = self.scheduler.report_for_digest(&scan.digest).await else {
            tracing::warn!(digest = %scan.digest, "no cached report for completed scan");
            return;
        };

        let jobs = wiring::dependency_graph_jobs(&self.store, &scan.image, &report);
        self.submit_jobs(jobs).await;
    }

    async fn submit_jobs(&self, jobs: Vec<ReportJob>) {
        for job in jobs {
            if self.job_tx.send(job).await.is_err() {
                tracing::error!("report queue closed, dropping report job");
            }
        }
    }

    /// Poll every module, log the aggregate, and refresh uptime.
    async fn report_health(&self) {
        let health = self.health().await;

        if self.config.metrics.enabled {
            #[allow(clippy::cast_precision_loss)]
            metrics::gauge!(podsentry_core::metrics::DAEMON_UPTIME_SECONDS)
                .set(health.uptime_secs as f64);
        }

        if health.status.is_healthy() {
            tracing::debug!(uptime_secs = health.uptime_secs, "all modules healthy");
        } else {
            tracing::warn!(status = ?health.status, "daemon health degraded");
        }
    }

    /// Get the current aggregated health status.
    pub async fn health(&self) -> DaemonHealth {
        let modules = vec![
            ModuleHealth {
                name: MODULE_CLUSTER_WATCH.to_owned(),
                status: self.watcher.health_check().await,
            },
            ModuleHealth {
                name: MODULE_IMAGE_SCAN.to_owned(),
                status: self.scheduler.health_check().await,
            },
            ModuleHealth {
                name: MODULE_UPSTREAM_REPORT.to_owned(),
                status: self.reporter.health_check().await,
            },
        ];

        DaemonHealth {
            status: aggregate_status(&modules),
            uptime_secs: self.start_time.elapsed().as_secs(),
            modules,
        }
    }

    /// Get a reference to the loaded configuration.
    #[allow(dead_code)] // Public API for introspection
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }
}

/// Effective resync interval. Zero disables periodic relisting, which
/// the watcher expresses as a deadline that never fires in practice.
fn resync_interval(secs: u64) -> Duration {
    if secs == 0 {
        Duration::from_secs(365 * 24 * 3600)
    } else {
        Duration::from_secs(secs)
    }
}

/// Write the current process PID to a file.
///
/// Used to prevent duplicate agent instances.
///
/// # Security
///
/// - Uses `create_new(true)` to atomically create the file
/// - Verifies the created file is a regular file (no symlink target)
/// - Creates the parent directory with restrictive permissions (0o700)
fn write_pid_file(path: &Path) -> Result<()> {
    use std::fs::{self, OpenOptions};
    use std::io::{ErrorKind, Write};

    if let Some(parent) = path.parent() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            let mut builder = fs::DirBuilder::new();
            builder.mode(0o700).recursive(true);
            builder.create(parent)?;
        }
        #[cfg(not(unix))]
        {
            fs::create_dir_all(parent)?;
        }
    }

    let pid = std::process::id();

    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            let existing = fs::read_to_string(path).unwrap_or_else(|_| "unknown".to_owned());
            return Err(anyhow::anyhow!(
                "PID file {} already exists with PID: {}. Is another instance running?",
                path.display(),
                existing.trim()
            ));
        }
        Err(e) => return Err(e.into()),
    };

    let metadata = file.metadata()?;
    if !metadata.is_file() {
        let _ = fs::remove_file(path);
        return Err(anyhow::anyhow!(
            "PID file {} is not a regular file",
            path.display()
        ));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    writeln!(file, "{}", pid)?;
    tracing::info!(pid = pid, path = %path.display(), "PID file written");
    Ok(())
}

/// Remove the PID file on shutdown.
///
/// Logs a warning but does not fail if the file cannot be removed.
fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove PID file");
    } else {
        tracing::info!(path = %path.display(), "PID file removed");
    }
}
