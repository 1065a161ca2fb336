//! 클러스터 워처 -- kind별 watch 루프 및 전체 재목록 조정
//!
//! [`ClusterWatcher`]는 core의 [`Pipeline`] trait을 구현하여
//! `podsentry-daemon`에서 다른 모듈과 동일한 생명주기로 관리됩니다.
//!
//! # 내부 아키텍처
//! ```text
//! kind별 태스크 (Pod, Deployment, ...)
//!     |
//!  list() ──> reconcile (shadow 대비 diff) ──> WorkloadEvent
//!     |
//!  watch() ──> 증분 이벤트 ──> WorkloadEvent
//!     |
//!  (410 / 스트림 종료 / resync 주기) ──> 다시 list()
//! ```
//!
//! 모든 kind의 이벤트는 하나의 mpsc 채널로 합쳐져 단일 순서
//! 스트림이 됩니다. 소비자(워크로드 스토어)는 이 순서만 신뢰하면
//! 됩니다.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use podsentry_core::error::AgentError;
use podsentry_core::event::{WorkloadEvent, WorkloadOp};
use podsentry_core::pipeline::{HealthStatus, Pipeline};
use podsentry_core::types::{WorkloadLocator, WorkloadMetadata};

use crate::client::{ClusterClient, RawEvent, RawWorkload};
use crate::error::ClusterWatchError;

/// list/watch 실패 시 재시도 백오프 상한
const MAX_RELIST_BACKOFF: Duration = Duration::from_secs(30);

/// 워처 실행 상태
#[derive(Debug, Clone, PartialEq, Eq)]
enum WatcherState {
    /// 초기화됨, 아직 시작하지 않음
    Initialized,
    /// 실행 중
    Running,
    /// 정지됨
    Stopped,
}

/// 클러스터 워처 -- 워크로드 kind별 watch 스트림을 유지하고
/// 정규화된 [`WorkloadEvent`]를 단일 채널로 내보냅니다.
///
/// core의 `Pipeline` trait을 구현하여 `podsentry-daemon`에서
/// 다른 모듈과 동일한 생명주기(start/stop/health_check)로 관리됩니다.
///
/// # 사용 예시
/// ```ignore
/// use podsentry_cluster_watch::{ClusterWatcher, ClusterWatcherBuilder};
///
/// let (watcher, event_rx) = ClusterWatcherBuilder::new()
///     .client(Arc::new(client))
///     .cluster_name("prod")
///     .build()?;
///
/// watcher.start().await?;
/// ```
pub struct ClusterWatcher<C: ClusterClient> {
    /// 클러스터 이름 (모든 locator에 부착)
    cluster: String,
    /// 현재 상태
    state: WatcherState,
    /// 오케스트레이터 클라이언트 (공유)
    client: Arc<C>,
    /// 이벤트 전송 채널
    event_tx: mpsc::Sender<WorkloadEvent>,
    /// 주기적 전체 재목록 간격
    resync_interval: Duration,
    /// 종료 신호
    cancel: CancellationToken,
    /// kind별 백그라운드 태스크 핸들
    tasks: Vec<tokio::task::JoinHandle<()>>,
    /// 내보낸 이벤트 카운터
    events_emitted: Arc<AtomicU64>,
    /// 수행한 재목록 카운터
    relists_performed: Arc<AtomicU64>,
}

impl<C: ClusterClient> ClusterWatcher<C> {
    /// 현재 상태명을 반환합니다.
    pub fn state_name(&self) -> &str {
        match self.state {
            WatcherState::Initialized => "initialized",
            WatcherState::Running => "running",
            WatcherState::Stopped => "stopped",
        }
    }

    /// 내보낸 이벤트 수를 반환합니다.
    pub fn events_emitted(&self) -> u64 {
        self.events_emitted.load(Ordering::Relaxed)
    }

    /// 수행한 전체 재목록 수를 반환합니다.
    pub fn relists_performed(&self) -> u64 {
        self.relists_performed.load(Ordering::Relaxed)
    }

    /// 클러스터 이름을 반환합니다.
    pub fn cluster_name(&self) -> &str {
        &self.cluster
    }
}

impl<C: ClusterClient> Pipeline for ClusterWatcher<C> {
    async fn start(&mut self) -> Result<(), AgentError> {
        if self.state == WatcherState::Running {
            return Err(podsentry_core::error::PipelineError::AlreadyRunning.into());
        }

        info!(cluster = %self.cluster, "starting cluster watcher");

        for kind in podsentry_core::types::WorkloadKind::ALL {
            let task = tokio::spawn(run_kind_loop(KindLoop {
                client: Arc::clone(&self.client),
                cluster: self.cluster.clone(),
                kind,
                event_tx: self.event_tx.clone(),
                resync_interval: self.resync_interval,
                cancel: self.cancel.clone(),
                events_emitted: Arc::clone(&self.events_emitted),
                relists_performed: Arc::clone(&self.relists_performed),
            }));
            self.tasks.push(task);
        }

        self.state = WatcherState::Running;
        info!(kinds = self.tasks.len(), "cluster watcher started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), AgentError> {
        if self.state != WatcherState::Running {
            return Err(podsentry_core::error::PipelineError::NotRunning.into());
        }

        info!("stopping cluster watcher");
        self.cancel.cancel();

        for task in self.tasks.drain(..) {
            let _ = task.await;
        }

        self.state = WatcherState::Stopped;
        info!("cluster watcher stopped");
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            WatcherState::Running => {
                if self.client.ping().await.is_ok() {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Degraded("api server not reachable".to_owned())
                }
            }
            WatcherState::Initialized => HealthStatus::Unhealthy("not started".to_owned()),
            WatcherState::Stopped => HealthStatus::Unhealthy("stopped".to_owned()),
        }
    }
}

/// kind 루프 하나에 필요한 공유 상태 묶음
struct KindLoop<C: ClusterClient> {
    client: Arc<C>,
    cluster: String,
    kind: podsentry_core::types::WorkloadKind,
    event_tx: mpsc::Sender<WorkloadEvent>,
    resync_interval: Duration,
    cancel: CancellationToken,
    events_emitted: Arc<AtomicU64>,
    relists_performed: Arc<AtomicU64>,
}

/// kind 하나의 list/watch/조정 루프
///
/// 종료 조건은 취소 신호 또는 이벤트 채널 닫힘뿐입니다. 그 외의
/// 모든 실패(API 오류, 스트림 중단, 410)는 백오프 후 전체 재목록으로
/// 복구합니다.
async fn run_kind_loop<C: ClusterClient>(ctx: KindLoop<C>) {
    // 지금까지 내보낸 워크로드의 revision 기록. 스토어가 이벤트를
    // 순서대로 적용하므로 이 그림자 맵은 스토어의 현재 뷰와 일치합니다.
    let mut shadow: HashMap<WorkloadLocator, String> = HashMap::new();
    let mut backoff = Duration::from_secs(1);

    loop {
        if ctx.cancel.is_cancelled() {
            return;
        }

        // 1. 전체 재목록 및 그림자 대비 조정
        let (items, resource_version) = match ctx.client.list(ctx.kind).await {
            Ok(listed) => {
                backoff = Duration::from_secs(1);
                listed
            }
            Err(e) => {
                warn!(kind = %ctx.kind, error = %e, "list failed, backing off");
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_RELIST_BACKOFF);
                continue;
            }
        };

        ctx.relists_performed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            podsentry_core::metrics::WATCH_RELISTS_TOTAL,
            "kind" => ctx.kind.as_str()
        )
        .increment(1);

        let events = reconcile(&ctx.cluster, &mut shadow, items);
        debug!(kind = %ctx.kind, events = events.len(), "relist reconciled");
        for event in events {
            if !emit(&ctx, event).await {
                return;
            }
        }

        // 2. watch 스트림 소비 (resync 주기까지)
        let mut stream = match ctx.client.watch(ctx.kind, &resource_version).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(kind = %ctx.kind, error = %e, "watch open failed, will relist");
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_RELIST_BACKOFF);
                continue;
            }
        };

        let resync_deadline = tokio::time::sleep(ctx.resync_interval);
        tokio::pin!(resync_deadline);

        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return,
                _ = &mut resync_deadline => {
                    debug!(kind = %ctx.kind, "resync deadline reached, relisting");
                    break;
                }
                item = stream.next() => match item {
                    Some(Ok(RawEvent::Added(raw) | RawEvent::Modified(raw))) => {
                        if let Some(event) = upsert_event(&ctx.cluster, &mut shadow, raw)
                            && !emit(&ctx, event).await
                        {
                            return;
                        }
                    }
                    Some(Ok(RawEvent::Deleted(raw))) => {
                        if let Some(event) = delete_event(&ctx.cluster, &mut shadow, raw)
                            && !emit(&ctx, event).await
                        {
                            return;
                        }
                    }
                    Some(Ok(RawEvent::StaleResourceVersion)) => {
                        info!(kind = %ctx.kind, "watch position expired, relisting");
                        break;
                    }
                    Some(Err(e @ ClusterWatchError::Malformed { .. })) => {
                        warn!(kind = %ctx.kind, error = %e, "skipping malformed watch item");
                        metrics::counter!(
                            podsentry_core::metrics::WATCH_MALFORMED_OBJECTS_TOTAL,
                            "kind" => ctx.kind.as_str()
                        )
                        .increment(1);
                    }
                    Some(Err(e)) => {
                        warn!(kind = %ctx.kind, error = %e, "watch stream error, relisting");
                        break;
                    }
                    None => {
                        debug!(kind = %ctx.kind, "watch stream ended, relisting");
                        break;
                    }
                }
            }
        }
    }
}

/// 이벤트를 채널로 보냅니다. 채널이 닫혔으면 false를 반환합니다.
async fn emit<C: ClusterClient>(ctx: &KindLoop<C>, event: WorkloadEvent) -> bool {
    let op_label = match event.op {
        WorkloadOp::Add => "add",
        WorkloadOp::Modify => "modify",
        WorkloadOp::Delete => "delete",
    };
    debug!(event = %event, "emitting workload event");

    if ctx.event_tx.send(event).await.is_err() {
        info!(kind = %ctx.kind, "event channel closed, stopping kind loop");
        return false;
    }

    ctx.events_emitted.fetch_add(1, Ordering::Relaxed);
    metrics::counter!(
        podsentry_core::metrics::WATCH_EVENTS_TOTAL,
        "kind" => ctx.kind.as_str(),
        "op" => op_label
    )
    .increment(1);
    true
}

/// 전체 목록을 그림자 맵과 비교하여 누락된 변경을 합성합니다.
///
/// watch 공백 동안 발생한 Add/Modify/Delete가 모두 복원됩니다.
/// 같은 revision의 워크로드는 이벤트를 만들지 않습니다.
fn reconcile(
    cluster: &str,
    shadow: &mut HashMap<WorkloadLocator, String>,
    items: Vec<RawWorkload>,
) -> Vec<WorkloadEvent> {
    let mut events = Vec::new();
    let mut seen: HashSet<WorkloadLocator> = HashSet::with_capacity(items.len());

    for raw in items {
        if raw.owned {
            continue;
        }
        let locator = locator_of(cluster, &raw);
        seen.insert(locator);
        if let Some(event) = upsert_event(cluster, shadow, raw) {
            events.push(event);
        }
    }

    // 목록에 더 이상 없는 워크로드는 watch 공백 중에 삭제된 것
    let vanished: Vec<WorkloadLocator> = shadow
        .keys()
        .filter(|locator| !seen.contains(*locator))
        .cloned()
        .collect();
    for locator in vanished {
        shadow.remove(&locator);
        events.push(WorkloadEvent::new(WorkloadOp::Delete, locator, None, vec![]));
    }

    events
}

/// Add/Modify 관측 하나를 그림자 맵에 반영하고 필요한 이벤트를 만듭니다.
///
/// 소유된 Pod와 revision이 같은 재관측은 None을 반환합니다.
fn upsert_event(
    cluster: &str,
    shadow: &mut HashMap<WorkloadLocator, String>,
    raw: RawWorkload,
) -> Option<WorkloadEvent> {
    if raw.owned {
        return None;
    }

    let locator = locator_of(cluster, &raw);
    let op = match shadow.get(&locator) {
        Some(known) if *known == raw.revision => return None,
        Some(_) => WorkloadOp::Modify,
        None => WorkloadOp::Add,
    };

    shadow.insert(locator.clone(), raw.revision.clone());
    let images = raw.images.clone();
    Some(WorkloadEvent::new(op, locator, Some(metadata_of(raw)), images))
}

/// Delete 관측 하나를 그림자 맵에 반영하고 필요한 이벤트를 만듭니다.
fn delete_event(
    cluster: &str,
    shadow: &mut HashMap<WorkloadLocator, String>,
    raw: RawWorkload,
) -> Option<WorkloadEvent> {
    if raw.owned {
        return None;
    }

    let locator = locator_of(cluster, &raw);
    // 모른 채로 삭제를 보는 경우(시작 직후 등)에도 Delete는 전달합니다.
    // 스토어 쪽에서 no-op 처리됩니다.
    shadow.remove(&locator);
    Some(WorkloadEvent::new(WorkloadOp::Delete, locator, None, vec![]))
}

fn locator_of(cluster: &str, raw: &RawWorkload) -> WorkloadLocator {
    WorkloadLocator::new(cluster, raw.namespace.clone(), raw.kind, raw.name.clone())
}

fn metadata_of(raw: RawWorkload) -> WorkloadMetadata {
    WorkloadMetadata {
        revision: raw.revision,
        labels: raw.labels,
        spec_labels: raw.spec_labels,
        annotations: raw.annotations,
        spec_annotations: raw.spec_annotations,
        pod_spec: raw.pod_spec,
    }
}

/// 클러스터 워처 빌더
///
/// 워처를 구성하고 필요한 채널을 생성합니다.
pub struct ClusterWatcherBuilder<C: ClusterClient> {
    cluster: String,
    client: Option<Arc<C>>,
    event_tx: Option<mpsc::Sender<WorkloadEvent>>,
    event_channel_capacity: usize,
    resync_interval: Duration,
}

impl<C: ClusterClient> ClusterWatcherBuilder<C> {
    /// 새 빌더를 생성합니다.
    pub fn new() -> Self {
        Self {
            cluster: "default".to_owned(),
            client: None,
            event_tx: None,
            event_channel_capacity: 1024,
            resync_interval: Duration::from_secs(600),
        }
    }

    /// 클러스터 이름을 지정합니다.
    pub fn cluster_name(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = cluster.into();
        self
    }

    /// 오케스트레이터 클라이언트를 설정합니다.
    pub fn client(mut self, client: Arc<C>) -> Self {
        self.client = Some(client);
        self
    }

    /// 외부 이벤트 전송 채널을 설정합니다.
    ///
    /// 설정하지 않으면 빌더가 새 채널을 생성합니다.
    pub fn event_sender(mut self, tx: mpsc::Sender<WorkloadEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// 이벤트 채널 용량을 설정합니다 (외부 채널 미사용 시).
    pub fn event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    /// 전체 재목록 주기를 설정합니다.
    pub fn resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    /// 워처를 빌드합니다.
    ///
    /// # Returns
    /// - `ClusterWatcher`: 워처 인스턴스
    /// - `Option<mpsc::Receiver<WorkloadEvent>>`: 이벤트 수신 채널
    ///   (외부 event_sender를 설정한 경우 None)
    pub fn build(
        self,
    ) -> Result<(ClusterWatcher<C>, Option<mpsc::Receiver<WorkloadEvent>>), ClusterWatchError> {
        let client = self
            .client
            .ok_or_else(|| ClusterWatchError::Api("cluster client must be provided".to_owned()))?;

        let (event_tx, event_rx) = if let Some(tx) = self.event_tx {
            (tx, None)
        } else {
            let (tx, rx) = mpsc::channel(self.event_channel_capacity);
            (tx, Some(rx))
        };

        let watcher = ClusterWatcher {
            cluster: self.cluster,
            state: WatcherState::Initialized,
            client,
            event_tx,
            resync_interval: self.resync_interval,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            events_emitted: Arc::new(AtomicU64::new(0)),
            relists_performed: Arc::new(AtomicU64::new(0)),
        };

        Ok((watcher, event_rx))
    }
}

impl<C: ClusterClient> Default for ClusterWatcherBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}
