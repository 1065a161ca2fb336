//! 업스트림 리포터 -- 보고 작업 큐의 단일 워커 전달 루프
//!
//! [`UpstreamReporter`]는 core의 [`Pipeline`] trait을 구현하여
//! `podsentry-daemon`에서 다른 모듈과 동일한 생명주기로 관리됩니다.
//!
//! # 전달 보장
//!
//! - at-least-once: 실패한 작업은 백오프 후 무한히 재시도됩니다.
//!   업스트림 API가 멱등 upsert이므로 중복 전달은 안전합니다.
//! - FIFO: 워커가 하나뿐이므로 큐에 넣은 순서대로 전달됩니다.
//!   locator의 메타데이터 upsert가 해당 네임스페이스 인벤토리 교체보다
//!   먼저 도착하는 일은 없습니다 (생산자가 그 순서로 넣는 한).
//! - 종료 시: 취소 신호를 받으면 남은 큐를 유예 시간 안에서 비우고,
//!   유예를 넘긴 작업은 로그를 남기고 버립니다.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use podsentry_core::error::AgentError;
use podsentry_core::pipeline::{HealthStatus, Pipeline};
use podsentry_core::types::{ScanResult, WorkloadLocator, WorkloadMetadata};

use crate::client::{InventoryEntry, UpstreamClient};
use crate::error::UpstreamReportError;

/// 업스트림으로 전달할 보고 작업 하나
#[derive(Debug, Clone)]
pub enum ReportJob {
    /// 네임스페이스 인벤토리 전체 교체
    ReplaceInventory {
        /// 클러스터 이름
        cluster: String,
        /// 네임스페이스
        namespace: String,
        /// 현재 인벤토리 스냅샷
        entries: Vec<InventoryEntry>,
    },
    /// 워크로드 메타데이터 upsert
    UpsertMetadata {
        /// 대상 워크로드
        locator: WorkloadLocator,
        /// 전달할 메타데이터
        metadata: WorkloadMetadata,
    },
    /// 워크로드 의존성 그래프 upsert
    UpsertDependencyGraphs {
        /// 대상 워크로드
        locator: WorkloadLocator,
        /// 플러그인 키별 스캔 결과
        results: BTreeMap<String, ScanResult>,
    },
}

impl ReportJob {
    /// 메트릭/로그용 작업 이름을 반환합니다.
    pub fn op_name(&self) -> &'static str {
        match self {
            Self::ReplaceInventory { .. } => "replace_inventory",
            Self::UpsertMetadata { .. } => "upsert_metadata",
            Self::UpsertDependencyGraphs { .. } => "upsert_dependency_graphs",
        }
    }
}

/// 리포터 실행 상태
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReporterState {
    /// 초기화됨, 아직 시작하지 않음
    Initialized,
    /// 실행 중
    Running,
    /// 정지됨
    Stopped,
}

/// 워커 루프에 필요한 설정 묶음
struct WorkerConfig {
    retry_backoff_base: Duration,
    retry_backoff_max: Duration,
    flush_grace: Duration,
}

/// 업스트림 리포터 -- 보고 작업을 FIFO로 전달하는 단일 워커
///
/// # 사용 예시
/// ```ignore
/// use podsentry_upstream_report::{ReportJob, UpstreamReporterBuilder};
///
/// let (mut reporter, job_tx) = UpstreamReporterBuilder::new()
///     .client(Arc::new(client))
///     .build()?;
///
/// reporter.start().await?;
/// job_tx.send(ReportJob::ReplaceInventory { .. }).await?;
/// ```
pub struct UpstreamReporter<U: UpstreamClient> {
    /// 현재 상태
    state: ReporterState,
    /// 업스트림 클라이언트 (공유)
    client: Arc<U>,
    /// 작업 수신 채널 (start 시 워커로 이동)
    job_rx: Option<mpsc::Receiver<ReportJob>>,
    /// 워커 설정 (start 시 워커로 이동)
    config: Option<WorkerConfig>,
    /// 종료 신호
    cancel: CancellationToken,
    /// 워커 태스크 핸들
    worker: Option<tokio::task::JoinHandle<()>>,
    /// 전달 완료 카운터
    jobs_delivered: Arc<AtomicU64>,
    /// 재시도 카운터
    retries_performed: Arc<AtomicU64>,
}

impl<U: UpstreamClient> UpstreamReporter<U> {
    /// 현재 상태명을 반환합니다.
    pub fn state_name(&self) -> &str {
        match self.state {
            ReporterState::Initialized => "initialized",
            ReporterState::Running => "running",
            ReporterState::Stopped => "stopped",
        }
    }

    /// 전달 완료한 작업 수를 반환합니다.
    pub fn jobs_delivered(&self) -> u64 {
        self.jobs_delivered.load(Ordering::Relaxed)
    }

    /// 수행한 재시도 수를 반환합니다.
    pub fn retries_performed(&self) -> u64 {
        self.retries_performed.load(Ordering::Relaxed)
    }
}

impl<U: UpstreamClient> Pipeline for UpstreamReporter<U> {
    async fn start(&mut self) -> Result<(), AgentError> {
        if self.state == ReporterState::Running {
            return Err(podsentry_core::error::PipelineError::AlreadyRunning.into());
        }

        let job_rx = self.job_rx.take().ok_or_else(|| {
            AgentError::from(podsentry_core::error::PipelineError::InitFailed(
                "reporter already consumed its job channel".to_owned(),
            ))
        })?;
        let config = self.config.take().ok_or_else(|| {
            AgentError::from(podsentry_core::error::PipelineError::InitFailed(
                "reporter already consumed its worker config".to_owned(),
            ))
        })?;

        info!("starting upstream reporter");

        self.worker = Some(tokio::spawn(run_worker(
            Arc::clone(&self.client),
            job_rx,
            config,
            self.cancel.clone(),
            Arc::clone(&self.jobs_delivered),
            Arc::clone(&self.retries_performed),
        )));

        self.state = ReporterState::Running;
        info!("upstream reporter started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), AgentError> {
        if self.state != ReporterState::Running {
            return Err(podsentry_core::error::PipelineError::NotRunning.into());
        }

        info!("stopping upstream reporter");
        self.cancel.cancel();

        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }

        self.state = ReporterState::Stopped;
        info!(
            delivered = self.jobs_delivered(),
            retries = self.retries_performed(),
            "upstream reporter stopped"
        );
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            ReporterState::Running => HealthStatus::Healthy,
            ReporterState::Initialized => HealthStatus::Unhealthy("not started".to_owned()),
            ReporterState::Stopped => HealthStatus::Unhealthy("stopped".to_owned()),
        }
    }
}

/// 단일 워커 루프 -- 큐에서 작업을 꺼내 순서대로 전달합니다.
async fn run_worker<U: UpstreamClient>(
    client: Arc<U>,
    mut job_rx: mpsc::Receiver<ReportJob>,
    config: WorkerConfig,
    cancel: CancellationToken,
    jobs_delivered: Arc<AtomicU64>,
    retries_performed: Arc<AtomicU64>,
) {
    loop {
        metrics::gauge!(podsentry_core::metrics::REPORT_QUEUE_DEPTH).set(job_rx.len() as f64);

        let job = tokio::select! {
            _ = cancel.cancelled() => break,
            job = job_rx.recv() => match job {
                Some(job) => job,
                None => {
                    info!("report queue closed, stopping worker");
                    return;
                }
            }
        };

        if !deliver_until(&client, &job, &config, &cancel, &retries_performed, None).await {
            // 전달 도중 취소됨 -- 이 작업부터 flush 단계에서 마저 처리
            flush_remaining(
                &client,
                Some(job),
                &mut job_rx,
                &config,
                &retries_performed,
                &jobs_delivered,
            )
            .await;
            return;
        }
        record_delivered(&job, &jobs_delivered);
    }

    flush_remaining(
        &client,
        None,
        &mut job_rx,
        &config,
        &retries_performed,
        &jobs_delivered,
    )
    .await;
}

/// 종료 유예 시간 안에서 남은 큐를 비웁니다.
async fn flush_remaining<U: UpstreamClient>(
    client: &Arc<U>,
    carried: Option<ReportJob>,
    job_rx: &mut mpsc::Receiver<ReportJob>,
    config: &WorkerConfig,
    retries_performed: &Arc<AtomicU64>,
    jobs_delivered: &Arc<AtomicU64>,
) {
    job_rx.close();
    let deadline = Instant::now() + config.flush_grace;
    let mut pending: Vec<ReportJob> = carried.into_iter().collect();
    while let Ok(job) = job_rx.try_recv() {
        pending.push(job);
    }

    if pending.is_empty() {
        return;
    }
    info!(jobs = pending.len(), "flushing remaining report jobs");

    let mut dropped = 0usize;
    let mut jobs = pending.into_iter();
    for job in jobs.by_ref() {
        if Instant::now() >= deadline {
            dropped += 1;
            warn!(op = job.op_name(), "flush grace exceeded, dropping report job");
            continue;
        }
        // 유예 시간 안에서만 재시도
        if deliver_until(
            client,
            &job,
            config,
            &CancellationToken::new(),
            retries_performed,
            Some(deadline),
        )
        .await
        {
            record_delivered(&job, jobs_delivered);
        } else {
            dropped += 1;
            warn!(op = job.op_name(), "flush grace exceeded, dropping report job");
        }
    }

    if dropped > 0 {
        warn!(dropped, "report jobs dropped during shutdown flush");
    } else {
        info!("report queue flushed");
    }
}

/// 작업 하나를 성공할 때까지 전달합니다.
///
/// 실패마다 지수 백오프(상한 있음) 후 재시도하며, 취소 신호나
/// 유예 마감(deadline)에 걸리면 false를 반환합니다.
async fn deliver_until<U: UpstreamClient>(
    client: &Arc<U>,
    job: &ReportJob,
    config: &WorkerConfig,
    cancel: &CancellationToken,
    retries_performed: &Arc<AtomicU64>,
    deadline: Option<Instant>,
) -> bool {
    let mut attempt: u32 = 0;
    loop {
        match deliver_once(client, job).await {
            Ok(()) => return true,
            Err(e) => {
                attempt += 1;
                let backoff = (config.retry_backoff_base * 2u32.saturating_pow(attempt - 1))
                    .min(config.retry_backoff_max);
                warn!(
                    op = job.op_name(),
                    attempt,
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "report delivery failed, retrying"
                );
                retries_performed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(
                    podsentry_core::metrics::REPORT_RETRIES_TOTAL,
                    "op" => job.op_name()
                )
                .increment(1);

                if let Some(deadline) = deadline
                    && Instant::now() + backoff >= deadline
                {
                    return false;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return false,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}

/// 작업 하나를 종류에 맞는 업스트림 호출로 전달합니다.
async fn deliver_once<U: UpstreamClient>(
    client: &Arc<U>,
    job: &ReportJob,
) -> Result<(), UpstreamReportError> {
    match job {
        ReportJob::ReplaceInventory {
            cluster,
            namespace,
            entries,
        } => {
            debug!(cluster = %cluster, namespace = %namespace, entries = entries.len(),
                "replacing namespace inventory");
            client.replace_inventory(cluster, namespace, entries).await
        }
        ReportJob::UpsertMetadata { locator, metadata } => {
            debug!(locator = %locator, "upserting workload metadata");
            client.upsert_metadata(locator, metadata).await
        }
        ReportJob::UpsertDependencyGraphs { locator, results } => {
            debug!(locator = %locator, plugins = results.len(),
                "upserting dependency graphs");
            client.upsert_dependency_graphs(locator, results).await
        }
    }
}

fn record_delivered(job: &ReportJob, jobs_delivered: &Arc<AtomicU64>) {
    jobs_delivered.fetch_add(1, Ordering::Relaxed);
    metrics::counter!(
        podsentry_core::metrics::REPORT_JOBS_DELIVERED_TOTAL,
        "op" => job.op_name()
    )
    .increment(1);
}

/// 업스트림 리포터 빌더
pub struct UpstreamReporterBuilder<U: UpstreamClient> {
    client: Option<Arc<U>>,
    job_channel_capacity: usize,
    retry_backoff_base: Duration,
    retry_backoff_max: Duration,
    flush_grace: Duration,
}

impl<U: UpstreamClient> UpstreamReporterBuilder<U> {
    /// 새 빌더를 생성합니다.
    pub fn new() -> Self {
        Self {
            client: None,
            job_channel_capacity: 1024,
            retry_backoff_base: Duration::from_millis(500),
            retry_backoff_max: Duration::from_secs(30),
            flush_grace: Duration::from_secs(10),
        }
    }

    /// 업스트림 클라이언트를 설정합니다.
    pub fn client(mut self, client: Arc<U>) -> Self {
        self.client = Some(client);
        self
    }

    /// 작업 큐 용량을 설정합니다.
    pub fn job_channel_capacity(mut self, capacity: usize) -> Self {
        self.job_channel_capacity = capacity.max(1);
        self
    }

    /// 재시도 백오프 기준값을 설정합니다.
    pub fn retry_backoff_base(mut self, base: Duration) -> Self {
        self.retry_backoff_base = base;
        self
    }

    /// 재시도 백오프 상한을 설정합니다.
    pub fn retry_backoff_max(mut self, max: Duration) -> Self {
        self.retry_backoff_max = max;
        self
    }

    /// 종료 시 큐 비우기 유예 시간을 설정합니다.
    pub fn flush_grace(mut self, grace: Duration) -> Self {
        self.flush_grace = grace;
        self
    }

    /// 리포터를 빌드합니다.
    ///
    /// # Returns
    /// - `UpstreamReporter`: 리포터 인스턴스
    /// - `mpsc::Sender<ReportJob>`: 작업 투입 채널
    pub fn build(
        self,
    ) -> Result<(UpstreamReporter<U>, mpsc::Sender<ReportJob>), UpstreamReportError> {
        let client = self
            .client
            .ok_or_else(|| UpstreamReportError::Config(
                "upstream client must be provided".to_owned(),
            ))?;

        let (job_tx, job_rx) = mpsc::channel(self.job_channel_capacity);

        let reporter = UpstreamReporter {
            state: ReporterState::Initialized,
            client,
            job_rx: Some(job_rx),
            config: Some(WorkerConfig {
                retry_backoff_base: self.retry_backoff_base,
                retry_backoff_max: self.retry_backoff_max,
                flush_grace: self.flush_grace,
            }),
            cancel: CancellationToken::new(),
            worker: None,
            jobs_delivered: Arc::new(AtomicU64::new(0)),
            retries_performed: Arc::new(AtomicU64::new(0)),
        };

        Ok((reporter, job_tx))
    }
}

impl<U: UpstreamClient> Default for UpstreamReporterBuilder<U> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopClient;

    impl UpstreamClient for NoopClient {
        async fn replace_inventory(
            &self,
            _cluster: &str,
            _namespace: &str,
            _workloads: &[InventoryEntry],
        ) -> Result<(), UpstreamReportError> {
            Ok(())
        }
        async fn upsert_metadata(
            &self,
            _locator: &WorkloadLocator,
            _metadata: &WorkloadMetadata,
        ) -> Result<(), UpstreamReportError> {
            Ok(())
        }
        async fn upsert_dependency_graphs(
            &self,
            _locator: &WorkloadLocator,
            _results: &BTreeMap<String, ScanResult>,
        ) -> Result<(), UpstreamReportError> {
            Ok(())
        }
    }

    #[test]
    fn builder_requires_client() {
        let missing: Result<_, _> = UpstreamReporterBuilder::<NoopClient>::new().build();
        assert!(missing.is_err());
    }

    #[test]
    fn builder_defaults() {
        let (reporter, _tx) = UpstreamReporterBuilder::new()
            .client(Arc::new(NoopClient))
            .build()
            .unwrap();
        assert_eq!(reporter.state_name(), "initialized");
        assert_eq!(reporter.jobs_delivered(), 0);
    }

    #[test]
    fn job_op_names_are_stable() {
        let job = ReportJob::ReplaceInventory {
            cluster: "c".to_owned(),
            namespace: "ns".to_owned(),
            entries: vec![],
        };
        assert_eq!(job.op_name(), "replace_inventory");
    }

    #[tokio::test]
    async fn stop_before_start_is_rejected() {
        let (mut reporter, _tx) = UpstreamReporterBuilder::new()
            .client(Arc::new(NoopClient))
            .build()
            .unwrap();
        assert!(reporter.stop().await.is_err());
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let (mut reporter, _tx) = UpstreamReporterBuilder::new()
            .client(Arc::new(NoopClient))
            .build()
            .unwrap();
        reporter.start().await.unwrap();
        assert!(reporter.start().await.is_err());
        reporter.stop().await.unwrap();
        assert_eq!(reporter.state_name(), "stopped");
    }
}
