//! 통합 테스트 -- 스캔 스케줄러 전체 플로우 검증
//!
//! schedule → pull(mock) → inspect → ScanEvent 방출 시나리오를
//! 고정 파일시스템을 만들어내는 mock puller로 테스트합니다.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use podsentry_core::event::ScanEvent;
use podsentry_core::pipeline::Pipeline;
use podsentry_core::types::{ImageMetadata, ImageReference};
use podsentry_image_scan::{
    ImagePuller, ImageScanError, PulledImage, ScanSchedulerBuilder, ScanWorkdir,
};

const DEBIAN_FIXTURE: &[(&str, &str)] = &[
    (
        "etc/os-release",
        "ID=debian\nVERSION_ID=\"12\"\nPRETTY_NAME=\"Debian GNU/Linux 12\"\n",
    ),
    (
        "var/lib/dpkg/status",
        "Package: libc6\nVersion: 2.36-9\nStatus: install ok installed\n",
    ),
    ("usr/local/bin/node", "node-binary"),
];

/// 고정 파일시스템을 전개하는 mock puller
struct MockImagePuller {
    digest: String,
    files: Vec<(String, String)>,
    pull_count: AtomicUsize,
    transient_failures: AtomicUsize,
    auth_failures: AtomicUsize,
    resolve_failures: AtomicUsize,
    permanent_failure: bool,
    pull_delay: Duration,
}

impl MockImagePuller {
    fn new(digest: &str, files: &[(&str, &str)]) -> Self {
        Self {
            digest: digest.to_owned(),
            files: files
                .iter()
                .map(|(p, c)| ((*p).to_owned(), (*c).to_owned()))
                .collect(),
            pull_count: AtomicUsize::new(0),
            transient_failures: AtomicUsize::new(0),
            auth_failures: AtomicUsize::new(0),
            resolve_failures: AtomicUsize::new(0),
            permanent_failure: false,
            pull_delay: Duration::ZERO,
        }
    }

    fn with_transient_failures(mut self, count: usize) -> Self {
        self.transient_failures = AtomicUsize::new(count);
        self
    }

    fn with_auth_failures(mut self, count: usize) -> Self {
        self.auth_failures = AtomicUsize::new(count);
        self
    }

    fn with_resolve_failures(mut self, count: usize) -> Self {
        self.resolve_failures = AtomicUsize::new(count);
        self
    }

    fn with_permanent_failure(mut self) -> Self {
        self.permanent_failure = true;
        self
    }

    fn with_pull_delay(mut self, delay: Duration) -> Self {
        self.pull_delay = delay;
        self
    }

    fn pull_count(&self) -> usize {
        self.pull_count.load(Ordering::SeqCst)
    }
}

impl ImagePuller for MockImagePuller {
    async fn resolve_digest(&self, _image: &ImageReference) -> Result<String, ImageScanError> {
        if self
            .resolve_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ImageScanError::Network("dns lookup failed".to_owned()));
        }
        Ok(self.digest.clone())
    }

    async fn pull(
        &self,
        image: &ImageReference,
        workdir: &ScanWorkdir,
    ) -> Result<PulledImage, ImageScanError> {
        if !self.pull_delay.is_zero() {
            tokio::time::sleep(self.pull_delay).await;
        }

        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ImageScanError::Network("connection reset".to_owned()));
        }
        if self
            .auth_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ImageScanError::Auth("token endpoint returned 503".to_owned()));
        }
        if self.permanent_failure {
            return Err(ImageScanError::Manifest("unsupported media type".to_owned()));
        }

        self.pull_count.fetch_add(1, Ordering::SeqCst);
        for (path, content) in &self.files {
            let full = workdir.rootfs().join(path);
            std::fs::create_dir_all(full.parent().unwrap())?;
            std::fs::write(&full, content)?;
        }

        Ok(PulledImage {
            digest: self.digest.clone(),
            rootfs: workdir.rootfs().to_path_buf(),
            image_metadata: ImageMetadata {
                image: image.to_string(),
                digest: self.digest.clone(),
            },
        })
    }
}

async fn recv_event(rx: &mut tokio::sync::mpsc::Receiver<ScanEvent>) -> ScanEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for scan event")
        .expect("scan channel closed")
}

fn builder(
    puller: Arc<MockImagePuller>,
    workdir: &tempfile::TempDir,
) -> ScanSchedulerBuilder<MockImagePuller> {
    ScanSchedulerBuilder::new()
        .puller(puller)
        .workdir(workdir.path())
        .retry_backoff_base(Duration::from_millis(10))
}

#[tokio::test]
async fn scan_produces_results_and_event() {
    let base = tempfile::tempdir().unwrap();
    let puller = Arc::new(MockImagePuller::new("sha256:deb1", DEBIAN_FIXTURE));
    let (mut scheduler, rx) = builder(Arc::clone(&puller), &base).build().unwrap();
    let mut rx = rx.unwrap();

    scheduler.start().await.unwrap();

    let image = ImageReference::parse("debian:12").unwrap();
    scheduler.schedule(image.clone(), "trace-1".to_owned()).await;

    let event = recv_event(&mut rx).await;
    assert!(event.success);
    assert_eq!(event.digest, "sha256:deb1");
    assert_eq!(event.metadata.trace_id, "trace-1");
    assert_eq!(event.plugin_keys, vec!["deb".to_owned(), "node".to_owned()]);

    let report = scheduler.report_for_digest("sha256:deb1").await.unwrap();
    assert!(report.success);
    assert_eq!(report.results["deb"].dependency_graph.package_count(), 1);
    assert_eq!(report.results["node"].hashes.len(), 1);

    assert_eq!(scheduler.scans_completed(), 1);
    scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn repeat_schedule_hits_cache() {
    let base = tempfile::tempdir().unwrap();
    let puller = Arc::new(MockImagePuller::new("sha256:deb1", DEBIAN_FIXTURE));
    let (mut scheduler, rx) = builder(Arc::clone(&puller), &base).build().unwrap();
    let mut rx = rx.unwrap();

    scheduler.start().await.unwrap();
    let image = ImageReference::parse("debian:12").unwrap();

    scheduler.schedule(image.clone(), "t-1".to_owned()).await;
    let first = recv_event(&mut rx).await;
    assert_eq!(first.metadata.trace_id, "t-1");

    // 완료 후 재요청은 pull 없이 즉시 이벤트
    scheduler.schedule(image, "t-2".to_owned()).await;
    let second = recv_event(&mut rx).await;
    assert_eq!(second.metadata.trace_id, "t-2");
    assert_eq!(second.digest, "sha256:deb1");

    assert_eq!(puller.pull_count(), 1);
    assert_eq!(scheduler.cache_hits(), 1);
    scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn concurrent_schedules_attach_to_in_flight_scan() {
    let base = tempfile::tempdir().unwrap();
    let puller = Arc::new(
        MockImagePuller::new("sha256:deb1", DEBIAN_FIXTURE)
            .with_pull_delay(Duration::from_millis(100)),
    );
    let (mut scheduler, rx) = builder(Arc::clone(&puller), &base).build().unwrap();
    let mut rx = rx.unwrap();

    scheduler.start().await.unwrap();
    let image = ImageReference::parse("debian:12").unwrap();

    scheduler.schedule(image.clone(), "t-1".to_owned()).await;
    scheduler.schedule(image.clone(), "t-2".to_owned()).await;
    scheduler.schedule(image, "t-3".to_owned()).await;

    let mut traces: Vec<String> = vec![
        recv_event(&mut rx).await.metadata.trace_id,
        recv_event(&mut rx).await.metadata.trace_id,
        recv_event(&mut rx).await.metadata.trace_id,
    ];
    traces.sort();
    assert_eq!(traces, vec!["t-1", "t-2", "t-3"]);

    assert_eq!(puller.pull_count(), 1, "in-flight schedules must share one pull");
    scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn different_tags_same_digest_pull_once() {
    let base = tempfile::tempdir().unwrap();
    let puller = Arc::new(MockImagePuller::new("sha256:same", DEBIAN_FIXTURE));
    let (mut scheduler, rx) = builder(Arc::clone(&puller), &base).build().unwrap();
    let mut rx = rx.unwrap();

    scheduler.start().await.unwrap();

    scheduler
        .schedule(ImageReference::parse("debian:12").unwrap(), "t-1".to_owned())
        .await;
    let first = recv_event(&mut rx).await;
    assert!(first.success);

    // 다른 태그, 같은 digest: 참조 캐시는 빗나가지만 digest 캐시가 잡음
    scheduler
        .schedule(ImageReference::parse("debian:bookworm").unwrap(), "t-2".to_owned())
        .await;
    let second = recv_event(&mut rx).await;
    assert!(second.success);
    assert_eq!(second.digest, "sha256:same");

    assert_eq!(puller.pull_count(), 1);
    scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn permanent_failure_yields_failed_event_and_is_cached() {
    let base = tempfile::tempdir().unwrap();
    let puller = Arc::new(
        MockImagePuller::new("sha256:broken", DEBIAN_FIXTURE).with_permanent_failure(),
    );
    let (mut scheduler, rx) = builder(Arc::clone(&puller), &base).build().unwrap();
    let mut rx = rx.unwrap();

    scheduler.start().await.unwrap();
    let image = ImageReference::parse("broken/image:1").unwrap();

    scheduler.schedule(image.clone(), "t-1".to_owned()).await;
    let event = recv_event(&mut rx).await;
    assert!(!event.success);
    assert!(event.plugin_keys.is_empty());
    assert_eq!(scheduler.scans_failed(), 1);

    // 실패도 캐시: 재요청이 새 pull 시도를 만들지 않음
    scheduler.schedule(image, "t-2".to_owned()).await;
    let repeat = recv_event(&mut rx).await;
    assert!(!repeat.success);
    assert_eq!(repeat.metadata.trace_id, "t-2");
    assert_eq!(scheduler.scans_failed(), 1);
    assert_eq!(puller.pull_count(), 0);

    scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn transient_failure_is_retried_to_success() {
    let base = tempfile::tempdir().unwrap();
    let puller = Arc::new(
        MockImagePuller::new("sha256:flaky", DEBIAN_FIXTURE).with_transient_failures(2),
    );
    let (mut scheduler, rx) = builder(Arc::clone(&puller), &base).build().unwrap();
    let mut rx = rx.unwrap();

    scheduler.start().await.unwrap();
    scheduler
        .schedule(ImageReference::parse("flaky:1").unwrap(), "t-1".to_owned())
        .await;

    let event = recv_event(&mut rx).await;
    assert!(event.success, "scan must succeed after transient retries");
    assert_eq!(puller.pull_count(), 1);
    assert_eq!(scheduler.scans_completed(), 1);
    assert_eq!(scheduler.scans_failed(), 0);

    scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn cache_hit_does_not_block_on_full_event_channel() {
    let base = tempfile::tempdir().unwrap();
    let puller = Arc::new(MockImagePuller::new("sha256:deb1", DEBIAN_FIXTURE));
    let (mut scheduler, rx) = builder(Arc::clone(&puller), &base)
        .scan_channel_capacity(1)
        .build()
        .unwrap();
    let mut rx = rx.unwrap();

    scheduler.start().await.unwrap();
    let image = ImageReference::parse("debian:12").unwrap();
    scheduler.schedule(image.clone(), "t-1".to_owned()).await;
    let first = recv_event(&mut rx).await;
    assert!(first.success);

    // 수신자가 읽지 않아 채널이 가득 차도 캐시 적중 schedule은 즉시 반환
    scheduler.schedule(image.clone(), "t-2".to_owned()).await;
    let prompt = tokio::time::timeout(
        Duration::from_secs(2),
        scheduler.schedule(image, "t-3".to_owned()),
    )
    .await;
    assert!(prompt.is_ok(), "cache-hit schedule must not wait on the event channel");

    let mut traces = vec![
        recv_event(&mut rx).await.metadata.trace_id,
        recv_event(&mut rx).await.metadata.trace_id,
    ];
    traces.sort();
    assert_eq!(traces, vec!["t-2", "t-3"]);
    scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn auth_failure_is_retried_to_success() {
    let base = tempfile::tempdir().unwrap();
    let puller = Arc::new(
        MockImagePuller::new("sha256:deb1", DEBIAN_FIXTURE).with_auth_failures(1),
    );
    let (mut scheduler, rx) = builder(Arc::clone(&puller), &base)
        .retry_max_attempts(3)
        .build()
        .unwrap();
    let mut rx = rx.unwrap();

    scheduler.start().await.unwrap();
    scheduler
        .schedule(ImageReference::parse("private/app:1").unwrap(), "t-1".to_owned())
        .await;

    let event = recv_event(&mut rx).await;
    assert!(event.success, "auth hiccup must be retried like other transient failures");
    assert_eq!(puller.pull_count(), 1);
    assert_eq!(scheduler.scans_failed(), 0);
    assert_eq!(scheduler.scans_completed(), 1);

    scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn unresolved_digest_failure_is_retried_on_next_sighting() {
    let base = tempfile::tempdir().unwrap();
    let puller = Arc::new(
        MockImagePuller::new("sha256:deb1", DEBIAN_FIXTURE).with_resolve_failures(2),
    );
    let (mut scheduler, rx) = builder(Arc::clone(&puller), &base)
        .retry_max_attempts(2)
        .build()
        .unwrap();
    let mut rx = rx.unwrap();

    scheduler.start().await.unwrap();
    let image = ImageReference::parse("flaky.corp/app:1").unwrap();

    scheduler.schedule(image.clone(), "t-1".to_owned()).await;
    let first = recv_event(&mut rx).await;
    assert!(!first.success);
    assert_eq!(scheduler.scans_failed(), 1);

    // digest 미해석 실패는 캐시되지 않으므로 다음 목격 때 다시 시도
    scheduler.schedule(image, "t-2".to_owned()).await;
    let second = recv_event(&mut rx).await;
    assert!(second.success, "a failure without a content digest must be retried");
    assert_eq!(second.digest, "sha256:deb1");
    assert_eq!(puller.pull_count(), 1);
    assert_eq!(scheduler.scans_completed(), 1);

    scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn transient_failures_exhaust_into_failed_report() {
    let base = tempfile::tempdir().unwrap();
    let puller = Arc::new(
        MockImagePuller::new("sha256:down", DEBIAN_FIXTURE).with_transient_failures(10),
    );
    let (mut scheduler, rx) = builder(Arc::clone(&puller), &base)
        .retry_max_attempts(2)
        .build()
        .unwrap();
    let mut rx = rx.unwrap();

    scheduler.start().await.unwrap();
    scheduler
        .schedule(ImageReference::parse("down:1").unwrap(), "t-1".to_owned())
        .await;

    let event = recv_event(&mut rx).await;
    assert!(!event.success);
    assert_eq!(scheduler.scans_failed(), 1);

    scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn stop_waits_for_in_flight_scans() {
    let base = tempfile::tempdir().unwrap();
    let puller = Arc::new(
        MockImagePuller::new("sha256:slow", DEBIAN_FIXTURE)
            .with_pull_delay(Duration::from_millis(50)),
    );
    let (mut scheduler, rx) = builder(Arc::clone(&puller), &base).build().unwrap();
    let mut rx = rx.unwrap();

    scheduler.start().await.unwrap();
    scheduler
        .schedule(ImageReference::parse("slow:1").unwrap(), "t-1".to_owned())
        .await;

    let event = recv_event(&mut rx).await;
    assert!(event.success);

    scheduler.stop().await.unwrap();
    assert_eq!(scheduler.state_name(), "stopped");
}
