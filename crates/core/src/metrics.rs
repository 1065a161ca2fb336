//! 메트릭 이름 상수 — Prometheus 노출 지표의 단일 정의처
//!
//! 모든 모듈은 여기 정의된 이름으로만 `metrics` 매크로를 호출합니다.
//! 네이밍 규칙: `podsentry_{모듈}_{지표}_{단위}`.

/// 데몬 빌드 정보 (버전 레이블 포함, 항상 1)
pub const DAEMON_BUILD_INFO: &str = "podsentry_daemon_build_info";
/// 데몬 가동 시간 (초)
pub const DAEMON_UPTIME_SECONDS: &str = "podsentry_daemon_uptime_seconds";

/// 수신한 watch 이벤트 수 (kind 레이블)
pub const WATCH_EVENTS_TOTAL: &str = "podsentry_watch_events_total";
/// 수행한 전체 재목록(list) 조정 횟수
pub const WATCH_RELISTS_TOTAL: &str = "podsentry_watch_relists_total";
/// 건너뛴 비정상 오브젝트 수
pub const WATCH_MALFORMED_OBJECTS_TOTAL: &str = "podsentry_watch_malformed_objects_total";

/// 스토어에 들어 있는 워크로드 수
pub const STORE_WORKLOADS: &str = "podsentry_store_workloads";
/// 스토어에 적용된 이벤트 수 (op 레이블)
pub const STORE_EVENTS_APPLIED_TOTAL: &str = "podsentry_store_events_applied_total";

/// 완료된 이미지 스캔 수
pub const SCANS_COMPLETED_TOTAL: &str = "podsentry_scans_completed_total";
/// 최종 실패한 이미지 스캔 수
pub const SCANS_FAILED_TOTAL: &str = "podsentry_scans_failed_total";
/// digest 캐시 적중 수 (중복 제거된 스캔 요청)
pub const SCAN_CACHE_HITS_TOTAL: &str = "podsentry_scan_cache_hits_total";

/// 업스트림에 전달된 보고 작업 수 (op 레이블)
pub const REPORT_JOBS_DELIVERED_TOTAL: &str = "podsentry_report_jobs_delivered_total";
/// 업스트림 전달 재시도 수
pub const REPORT_RETRIES_TOTAL: &str = "podsentry_report_retries_total";
/// 전달 대기 중인 보고 작업 수
pub const REPORT_QUEUE_DEPTH: &str = "podsentry_report_queue_depth";

/// 모든 지표의 설명을 recorder에 등록합니다.
///
/// Prometheus recorder 설치 직후 한 번 호출합니다.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge};

    describe_gauge!(DAEMON_BUILD_INFO, "Build information (always 1, version label)");
    describe_gauge!(DAEMON_UPTIME_SECONDS, "Daemon uptime in seconds");

    describe_counter!(WATCH_EVENTS_TOTAL, "Workload events emitted by the cluster watcher");
    describe_counter!(WATCH_RELISTS_TOTAL, "Full relist reconciliations performed");
    describe_counter!(WATCH_MALFORMED_OBJECTS_TOTAL, "Malformed objects skipped during watch/list");

    describe_gauge!(STORE_WORKLOADS, "Workloads currently held in the inventory store");
    describe_counter!(STORE_EVENTS_APPLIED_TOTAL, "Workload events applied to the store");

    describe_counter!(SCANS_COMPLETED_TOTAL, "Image scans completed successfully");
    describe_counter!(SCANS_FAILED_TOTAL, "Image scans that exhausted retries");
    describe_counter!(SCAN_CACHE_HITS_TOTAL, "Scan requests answered from cache");

    describe_counter!(REPORT_JOBS_DELIVERED_TOTAL, "Report jobs delivered upstream");
    describe_counter!(REPORT_RETRIES_TOTAL, "Upstream delivery retries");
    describe_gauge!(REPORT_QUEUE_DEPTH, "Report jobs waiting for delivery");
}
