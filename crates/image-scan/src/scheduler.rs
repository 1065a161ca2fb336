//! 스캔 스케줄러 -- digest 기준 중복 제거와 동시성 제한
//!
//! [`ScanScheduler`]는 core의 [`Pipeline`] trait을 구현하여
//! `podsentry-daemon`에서 다른 모듈과 동일한 생명주기로 관리됩니다.
//!
//! # 내부 아키텍처
//! ```text
//! schedule(image) ──┬── 참조 캐시 적중 ──────────> ScanEvent 즉시 방출
//!                   ├── 진행 중 ── broadcast 구독 ─> 완료 시 ScanEvent
//!                   └── 신규 ── Semaphore ── pull ── inspect
//!                                   |
//!                              digest 캐시 확인 (태그만 다른 동일 이미지)
//!                                   |
//!                              ScanReport 캐시 + ScanEvent ──mpsc──> daemon
//! ```
//!
//! 캐시는 프로세스 수명 동안 유지되며 digest가 해석된 실패 스캔도
//! 기록합니다. 실패 이미지의 소유 워크로드도 의존성 그래프 없이 계속
//! 보고되어야 하기 때문입니다. digest조차 해석하지 못한 실패는 콘텐츠
//! 식별자가 없으므로 캐시하지 않고 다음 목격 때 다시 시도합니다.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use podsentry_core::error::AgentError;
use podsentry_core::event::ScanEvent;
use podsentry_core::pipeline::{HealthStatus, Pipeline};
use podsentry_core::types::{ImageReference, ScanResult};

use crate::error::ImageScanError;
use crate::inspector;
use crate::pull::ImagePuller;
use crate::workdir::ScanWorkdir;

/// 완료된 스캔 하나의 결과 묶음
///
/// 성공/실패 모두 이 형태로 캐시됩니다. 실패한 스캔은 `results`가
/// 비어 있고 `success`가 false입니다.
#[derive(Debug)]
pub struct ScanReport {
    /// 스캔된 이미지
    pub image: ImageReference,
    /// 해석된 콘텐츠 digest (해석 실패 시 참조 문자열)
    pub digest: String,
    /// 플러그인 키별 스캔 결과
    pub results: BTreeMap<String, ScanResult>,
    /// 성공 여부
    pub success: bool,
}

/// 스케줄러 실행 상태
#[derive(Debug, Clone, PartialEq, Eq)]
enum SchedulerState {
    /// 초기화됨, 아직 시작하지 않음
    Initialized,
    /// 실행 중
    Running,
    /// 정지됨
    Stopped,
}

/// 참조 문자열 하나의 캐시 항목
enum RefEntry {
    /// 스캔 완료 (성공/실패 모두)
    Done(Arc<ScanReport>),
    /// 스캔 진행 중 -- 완료 시 broadcast로 통지
    InFlight(broadcast::Sender<Arc<ScanReport>>),
}

#[derive(Default)]
struct SchedulerCache {
    /// 이미지 참조 문자열 -> 캐시 항목
    by_reference: HashMap<String, RefEntry>,
    /// 해석된 digest -> 완료 보고 (태그만 다른 동일 이미지 재사용)
    by_digest: HashMap<String, Arc<ScanReport>>,
}

/// 워커와 스케줄러가 공유하는 상태
struct Shared<P: ImagePuller> {
    puller: Arc<P>,
    workdir_base: PathBuf,
    cache: Mutex<SchedulerCache>,
    semaphore: Semaphore,
    scan_tx: mpsc::Sender<ScanEvent>,
    cancel: CancellationToken,
    retry_max_attempts: u32,
    retry_backoff_base: Duration,
    scans_completed: AtomicU64,
    scans_failed: AtomicU64,
    cache_hits: AtomicU64,
}

/// 스캔 스케줄러
///
/// `schedule()` 호출마다 정확히 하나의 [`ScanEvent`]가 (즉시 또는 완료
/// 시점에) 방출됩니다. 같은 이미지를 여러 워크로드가 참조해도 실제
/// pull/검사는 digest당 한 번만 수행됩니다.
pub struct ScanScheduler<P: ImagePuller> {
    state: SchedulerState,
    shared: Arc<Shared<P>>,
    tracker: TaskTracker,
}

impl<P: ImagePuller> ScanScheduler<P> {
    /// 현재 상태명을 반환합니다.
    pub fn state_name(&self) -> &str {
        match self.state {
            SchedulerState::Initialized => "initialized",
            SchedulerState::Running => "running",
            SchedulerState::Stopped => "stopped",
        }
    }

    /// 완료된 스캔 수를 반환합니다.
    pub fn scans_completed(&self) -> u64 {
        self.shared.scans_completed.load(Ordering::Relaxed)
    }

    /// 실패로 끝난 스캔 수를 반환합니다.
    pub fn scans_failed(&self) -> u64 {
        self.shared.scans_failed.load(Ordering::Relaxed)
    }

    /// 캐시 적중 수를 반환합니다.
    pub fn cache_hits(&self) -> u64 {
        self.shared.cache_hits.load(Ordering::Relaxed)
    }

    /// digest의 캐시된 보고를 반환합니다.
    ///
    /// daemon이 [`ScanEvent`]를 받아 업스트림 보고 작업을 만들 때
    /// 사용합니다.
    pub async fn report_for_digest(&self, digest: &str) -> Option<Arc<ScanReport>> {
        self.shared.cache.lock().await.by_digest.get(digest).cloned()
    }

    /// 이미지 스캔을 요청합니다.
    ///
    /// 캐시 적중이면 즉시, 진행 중이면 완료 시점에, 신규면 스캔 후에
    /// `trace_id`가 연결된 [`ScanEvent`]가 방출됩니다.
    pub async fn schedule(&self, image: ImageReference, trace_id: String) {
        let key = image.to_string();
        let mut cache = self.shared.cache.lock().await;

        match cache.by_reference.get(&key) {
            Some(RefEntry::Done(report)) => {
                self.shared.cache_hits.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(podsentry_core::metrics::SCAN_CACHE_HITS_TOTAL).increment(1);
                let report = Arc::clone(report);
                drop(cache);
                debug!(image = %image, "scan cache hit");

                // 이벤트 채널이 가득 차 있어도 schedule 호출자(daemon 이벤트
                // 루프가 곧 유일한 수신자)를 막지 않도록 방출은 분리합니다
                let scan_tx = self.shared.scan_tx.clone();
                self.tracker.spawn(async move {
                    emit_event(&scan_tx, &report, trace_id).await;
                });
            }
            Some(RefEntry::InFlight(sender)) => {
                self.shared.cache_hits.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(podsentry_core::metrics::SCAN_CACHE_HITS_TOTAL).increment(1);
                let mut receiver = sender.subscribe();
                drop(cache);
                debug!(image = %image, "attaching to in-flight scan");

                let scan_tx = self.shared.scan_tx.clone();
                self.tracker.spawn(async move {
                    if let Ok(report) = receiver.recv().await {
                        emit_event(&scan_tx, &report, trace_id).await;
                    }
                });
            }
            None => {
                let (done_tx, _) = broadcast::channel(1);
                cache
                    .by_reference
                    .insert(key.clone(), RefEntry::InFlight(done_tx.clone()));
                drop(cache);

                let shared = Arc::clone(&self.shared);
                self.tracker.spawn(async move {
                    run_scan(shared, image, key, trace_id, done_tx).await;
                });
            }
        }
    }
}

impl<P: ImagePuller> Pipeline for ScanScheduler<P> {
    async fn start(&mut self) -> Result<(), AgentError> {
        if self.state == SchedulerState::Running {
            return Err(podsentry_core::error::PipelineError::AlreadyRunning.into());
        }
        info!(
            workdir = %self.shared.workdir_base.display(),
            "starting scan scheduler"
        );
        self.state = SchedulerState::Running;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), AgentError> {
        if self.state != SchedulerState::Running {
            return Err(podsentry_core::error::PipelineError::NotRunning.into());
        }

        info!("stopping scan scheduler");
        self.shared.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        self.state = SchedulerState::Stopped;
        info!("scan scheduler stopped");
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            SchedulerState::Running => HealthStatus::Healthy,
            SchedulerState::Initialized => HealthStatus::Unhealthy("not started".to_owned()),
            SchedulerState::Stopped => HealthStatus::Unhealthy("stopped".to_owned()),
        }
    }
}

/// 신규 이미지 하나의 스캔 워커
async fn run_scan<P: ImagePuller>(
    shared: Arc<Shared<P>>,
    image: ImageReference,
    key: String,
    trace_id: String,
    done_tx: broadcast::Sender<Arc<ScanReport>>,
) {
    // Semaphore는 닫히지 않으므로 acquire 실패는 취소뿐
    let _permit = tokio::select! {
        _ = shared.cancel.cancelled() => return,
        permit = shared.semaphore.acquire() => match permit {
            Ok(p) => p,
            Err(_) => return,
        },
    };

    let (report, digest_resolved) = scan_with_retry(&shared, &image).await;
    let report = Arc::new(report);

    {
        let mut cache = shared.cache.lock().await;
        if report.success || digest_resolved {
            cache.by_reference.insert(key, RefEntry::Done(Arc::clone(&report)));
        } else {
            // digest 미해석 실패는 캐시 항목을 남기지 않아 다음 목격 때
            // 재시도됩니다
            cache.by_reference.remove(&key);
        }
        if report.success {
            cache
                .by_digest
                .entry(report.digest.clone())
                .or_insert_with(|| Arc::clone(&report));
        }
    }

    if report.success {
        shared.scans_completed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(podsentry_core::metrics::SCANS_COMPLETED_TOTAL).increment(1);
    } else {
        shared.scans_failed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(podsentry_core::metrics::SCANS_FAILED_TOTAL).increment(1);
    }

    // 진행 중 대기자에게 통지 (대기자가 없으면 send 실패, 무해)
    let _ = done_tx.send(Arc::clone(&report));
    emit_event(&shared.scan_tx, &report, trace_id).await;
}

/// pull/검사를 일시적 실패에 한해 백오프 재시도합니다.
///
/// 영구 실패 또는 재시도 소진 시 실패 보고를 반환합니다. 실패도
/// 보고이지 에러가 아닙니다. 두 번째 반환값은 시도 중 digest가
/// 해석된 적이 있는지입니다 (실패 캐시 여부 판단용).
async fn scan_with_retry<P: ImagePuller>(
    shared: &Shared<P>,
    image: &ImageReference,
) -> (ScanReport, bool) {
    let mut resolved: Option<String> = None;
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match scan_once(shared, image, &mut resolved).await {
            Ok(report) => {
                info!(
                    image = %image,
                    digest = %report.digest,
                    plugins = report.results.len(),
                    "image scan completed"
                );
                return (report, true);
            }
            Err(e) if e.is_transient() && attempt < shared.retry_max_attempts => {
                let backoff = shared.retry_backoff_base * 2u32.saturating_pow(attempt - 1);
                warn!(
                    image = %image,
                    attempt = attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "transient scan failure, retrying"
                );
                tokio::select! {
                    _ = shared.cancel.cancelled() => {
                        let digest_resolved = resolved.is_some();
                        let report =
                            failed_report(image, resolved.as_deref(), "cancelled during retry");
                        return (report, digest_resolved);
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            Err(e) => {
                if e.is_transient() {
                    error!(
                        image = %image,
                        attempts = attempt,
                        error = %e,
                        "scan failed after exhausting retries"
                    );
                } else {
                    error!(image = %image, error = %e, "permanent scan failure");
                }
                let digest_resolved = resolved.is_some();
                let report = failed_report(image, resolved.as_deref(), &e.to_string());
                return (report, digest_resolved);
            }
        }
    }
}

/// 단일 스캔 시도: digest 해석 -> digest 캐시 확인 -> pull -> 검사
///
/// `resolved`에는 가장 최근에 해석된 digest가 남습니다. 이후 단계가
/// 실패해도 실패 보고가 콘텐츠 식별자를 가질 수 있게 합니다.
async fn scan_once<P: ImagePuller>(
    shared: &Shared<P>,
    image: &ImageReference,
    resolved: &mut Option<String>,
) -> Result<ScanReport, ImageScanError> {
    let digest = shared.puller.resolve_digest(image).await?;
    *resolved = Some(digest.clone());

    // 태그만 다른 동일 콘텐츠는 pull 없이 재사용
    let already_scanned = {
        let cache = shared.cache.lock().await;
        cache.by_digest.get(&digest).cloned()
    };
    if let Some(existing) = already_scanned {
        debug!(image = %image, digest = %digest, "digest already scanned, reusing results");
        shared.cache_hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(podsentry_core::metrics::SCAN_CACHE_HITS_TOTAL).increment(1);
        return Ok(ScanReport {
            image: image.clone(),
            digest,
            results: existing.results.clone(),
            success: existing.success,
        });
    }

    let workdir = ScanWorkdir::create(&shared.workdir_base)?;
    let pulled = shared.puller.pull(image, &workdir).await?;

    let results = tokio::task::spawn_blocking(move || {
        let results = inspector::inspect(&pulled);
        drop(pulled);
        results
    })
    .await
    .map_err(|e| ImageScanError::Inspect(format!("inspect task failed: {e}")))??;

    Ok(ScanReport {
        image: image.clone(),
        digest,
        results,
        success: true,
    })
}

fn failed_report(image: &ImageReference, digest: Option<&str>, reason: &str) -> ScanReport {
    debug!(image = %image, reason = reason, "recording failed scan report");
    ScanReport {
        image: image.clone(),
        digest: digest.map_or_else(|| image.to_string(), str::to_owned),
        results: BTreeMap::new(),
        success: false,
    }
}

async fn emit_event(scan_tx: &mpsc::Sender<ScanEvent>, report: &ScanReport, trace_id: String) {
    let plugin_keys: Vec<String> = report.results.keys().cloned().collect();
    let event = ScanEvent::with_trace(
        report.image.clone(),
        report.digest.clone(),
        plugin_keys,
        report.success,
        trace_id,
    );
    if scan_tx.send(event).await.is_err() {
        warn!(image = %report.image, "scan event channel closed, dropping completion event");
    }
}

/// 스캔 스케줄러 빌더
///
/// 스케줄러를 구성하고 필요한 채널을 생성합니다.
pub struct ScanSchedulerBuilder<P: ImagePuller> {
    puller: Option<Arc<P>>,
    workdir_base: PathBuf,
    max_concurrency: usize,
    retry_max_attempts: u32,
    retry_backoff_base: Duration,
    scan_tx: Option<mpsc::Sender<ScanEvent>>,
    scan_channel_capacity: usize,
}

impl<P: ImagePuller> ScanSchedulerBuilder<P> {
    /// 새 빌더를 생성합니다.
    pub fn new() -> Self {
        Self {
            puller: None,
            workdir_base: std::env::temp_dir().join("podsentry"),
            max_concurrency: 4,
            retry_max_attempts: 3,
            retry_backoff_base: Duration::from_millis(500),
            scan_tx: None,
            scan_channel_capacity: 256,
        }
    }

    /// 이미지 pull 제공자를 설정합니다.
    pub fn puller(mut self, puller: Arc<P>) -> Self {
        self.puller = Some(puller);
        self
    }

    /// 스캔 작업 디렉토리의 베이스 경로를 설정합니다.
    pub fn workdir(mut self, base: impl Into<PathBuf>) -> Self {
        self.workdir_base = base.into();
        self
    }

    /// 동시 스캔 상한을 설정합니다.
    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = limit.max(1);
        self
    }

    /// 일시적 실패 재시도 상한을 설정합니다.
    pub fn retry_max_attempts(mut self, attempts: u32) -> Self {
        self.retry_max_attempts = attempts.max(1);
        self
    }

    /// 재시도 백오프 기준 시간을 설정합니다.
    pub fn retry_backoff_base(mut self, base: Duration) -> Self {
        self.retry_backoff_base = base;
        self
    }

    /// 외부 스캔 이벤트 전송 채널을 설정합니다.
    ///
    /// 설정하지 않으면 빌더가 새 채널을 생성합니다.
    pub fn scan_sender(mut self, tx: mpsc::Sender<ScanEvent>) -> Self {
        self.scan_tx = Some(tx);
        self
    }

    /// 스캔 이벤트 채널 용량을 설정합니다 (외부 채널 미사용 시).
    pub fn scan_channel_capacity(mut self, capacity: usize) -> Self {
        self.scan_channel_capacity = capacity;
        self
    }

    /// 스케줄러를 빌드합니다.
    ///
    /// # Returns
    /// - `ScanScheduler`: 스케줄러 인스턴스
    /// - `Option<mpsc::Receiver<ScanEvent>>`: 스캔 이벤트 수신 채널
    ///   (외부 scan_sender를 설정한 경우 None)
    pub fn build(
        self,
    ) -> Result<(ScanScheduler<P>, Option<mpsc::Receiver<ScanEvent>>), ImageScanError> {
        let puller = self
            .puller
            .ok_or_else(|| ImageScanError::Channel("image puller must be provided".to_owned()))?;

        let (scan_tx, scan_rx) = if let Some(tx) = self.scan_tx {
            (tx, None)
        } else {
            let (tx, rx) = mpsc::channel(self.scan_channel_capacity);
            (tx, Some(rx))
        };

        let scheduler = ScanScheduler {
            state: SchedulerState::Initialized,
            shared: Arc::new(Shared {
                puller,
                workdir_base: self.workdir_base,
                cache: Mutex::new(SchedulerCache::default()),
                semaphore: Semaphore::new(self.max_concurrency),
                scan_tx,
                cancel: CancellationToken::new(),
                retry_max_attempts: self.retry_max_attempts,
                retry_backoff_base: self.retry_backoff_base,
                scans_completed: AtomicU64::new(0),
                scans_failed: AtomicU64::new(0),
                cache_hits: AtomicU64::new(0),
            }),
            tracker: TaskTracker::new(),
        };

        Ok((scheduler, scan_rx))
    }
}

impl<P: ImagePuller> Default for ScanSchedulerBuilder<P> {
    fn default() -> Self {
        Self::new()
    }
}
