//! 이벤트 시스템 — 모듈 간 통신의 기본 단위
//!
//! 모듈 간 통신은 이벤트 기반 메시지 패싱으로 수행됩니다.
//! [`EventMetadata`]는 모든 이벤트에 공통으로 포함되는 메타데이터이며,
//! [`Event`] trait은 모든 이벤트 타입이 구현해야 하는 인터페이스입니다.
//!
//! 핵심 흐름: 클러스터 워처가 [`WorkloadEvent`]를 내보내면 워크로드
//! 스토어가 순서대로 적용하고, 스캔 스케줄러가 [`ScanEvent`]로 완료를
//! 알립니다.

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::types::{ImageReference, WorkloadLocator, WorkloadMetadata};

// --- 모듈명 상수 ---

/// 클러스터 워처 모듈명
pub const MODULE_CLUSTER_WATCH: &str = "cluster-watch";
/// 워크로드 스토어 모듈명
pub const MODULE_INVENTORY: &str = "inventory";
/// 이미지 스캔 모듈명
pub const MODULE_IMAGE_SCAN: &str = "image-scan";
/// 업스트림 리포터 모듈명
pub const MODULE_UPSTREAM_REPORT: &str = "upstream-report";

// --- 이벤트 타입 상수 ---

/// 워크로드 변경 이벤트 타입
pub const EVENT_TYPE_WORKLOAD: &str = "workload";
/// 스캔 완료 이벤트 타입
pub const EVENT_TYPE_SCAN: &str = "scan";

/// 이벤트 메타데이터 — 모든 이벤트에 공통으로 포함되는 추적 정보
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    /// 이벤트 발생 시각
    pub timestamp: SystemTime,
    /// 이벤트를 생성한 모듈명
    pub source_module: String,
    /// 분산 추적 ID — 같은 흐름의 이벤트를 연결합니다
    pub trace_id: String,
}

impl EventMetadata {
    /// 기존 trace_id를 사용하여 새 메타데이터를 생성합니다.
    pub fn new(source_module: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            source_module: source_module.into(),
            trace_id: trace_id.into(),
        }
    }

    /// 새로운 UUID v4 trace_id를 생성하여 메타데이터를 만듭니다.
    pub fn with_new_trace(source_module: impl Into<String>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            source_module: source_module.into(),
            trace_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// 모든 이벤트가 구현해야 하는 기본 trait
///
/// `Send + Sync + 'static` 바운드로 `tokio::mpsc` 채널을 통한
/// 안전한 전송을 보장합니다.
pub trait Event: Send + Sync + 'static {
    /// 이벤트 고유 ID (UUID v4)
    fn event_id(&self) -> &str;

    /// 이벤트 메타데이터
    fn metadata(&self) -> &EventMetadata;

    /// 이벤트 타입명 (로깅 및 라우팅에 사용)
    fn event_type(&self) -> &str;
}

/// 워크로드 변경 연산
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadOp {
    /// 새 워크로드 관측
    Add,
    /// 기존 워크로드 스펙 변경
    Modify,
    /// 워크로드 삭제 (terminal)
    Delete,
}

impl fmt::Display for WorkloadOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "ADD"),
            Self::Modify => write!(f, "MODIFY"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

/// 정규화된 워크로드 변경 이벤트
///
/// 클러스터 워처가 kind별 watch 스트림을 병합하여 내보내는 단일 순서
/// 스트림의 원소입니다. Delete 이벤트의 메타데이터/이미지 목록은 비어
/// 있을 수 있습니다.
#[derive(Debug, Clone)]
pub struct WorkloadEvent {
    /// 이벤트 고유 ID
    pub id: String,
    /// 이벤트 메타데이터
    pub metadata: EventMetadata,
    /// 변경 연산
    pub op: WorkloadOp,
    /// 대상 워크로드
    pub locator: WorkloadLocator,
    /// 워크로드 메타데이터 (Delete면 None)
    pub workload: Option<WorkloadMetadata>,
    /// Pod 스펙에서 추출한 이미지 참조
    pub images: Vec<ImageReference>,
}

impl WorkloadEvent {
    /// 새로운 trace를 시작하는 워크로드 이벤트를 생성합니다.
    pub fn new(
        op: WorkloadOp,
        locator: WorkloadLocator,
        workload: Option<WorkloadMetadata>,
        images: Vec<ImageReference>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            metadata: EventMetadata::with_new_trace(MODULE_CLUSTER_WATCH),
            op,
            locator,
            workload,
            images,
        }
    }
}

impl Event for WorkloadEvent {
    fn event_id(&self) -> &str {
        &self.id
    }

    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    fn event_type(&self) -> &str {
        EVENT_TYPE_WORKLOAD
    }
}

impl fmt::Display for WorkloadEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WorkloadEvent[{}] {} {} images={}",
            &self.id[..8.min(self.id.len())],
            self.op,
            self.locator,
            self.images.len(),
        )
    }
}

/// 스캔 완료 이벤트
///
/// 스캔 스케줄러가 이미지 하나의 검사를 마쳤을 때 (성공/실패 모두)
/// 내보냅니다. 실패한 스캔은 plugin_keys가 비어 있으며, 소유 워크로드는
/// 의존성 그래프 없이 계속 보고됩니다.
#[derive(Debug, Clone)]
pub struct ScanEvent {
    /// 이벤트 고유 ID
    pub id: String,
    /// 이벤트 메타데이터
    pub metadata: EventMetadata,
    /// 스캔된 이미지
    pub image: ImageReference,
    /// 해석된 콘텐츠 digest (해석 실패 시 참조 문자열)
    pub digest: String,
    /// 결과를 낸 플러그인 키 목록
    pub plugin_keys: Vec<String>,
    /// 스캔 성공 여부
    pub success: bool,
}

impl ScanEvent {
    /// 기존 trace에 연결된 스캔 이벤트를 생성합니다.
    pub fn with_trace(
        image: ImageReference,
        digest: impl Into<String>,
        plugin_keys: Vec<String>,
        success: bool,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            metadata: EventMetadata::new(MODULE_IMAGE_SCAN, trace_id),
            image,
            digest: digest.into(),
            plugin_keys,
            success,
        }
    }
}

impl Event for ScanEvent {
    fn event_id(&self) -> &str {
        &self.id
    }

    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    fn event_type(&self) -> &str {
        EVENT_TYPE_SCAN
    }
}

impl fmt::Display for ScanEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.success { "OK" } else { "FAILED" };
        write!(
            f,
            "ScanEvent[{}] {} digest={} plugins={} status={}",
            &self.id[..8.min(self.id.len())],
            self.image,
            self.digest,
            self.plugin_keys.len(),
            status,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WorkloadKind;

    fn sample_locator() -> WorkloadLocator {
        WorkloadLocator::new("prod", "default", WorkloadKind::Deployment, "web")
    }

    #[test]
    fn event_metadata_new_preserves_trace_id() {
        let meta = EventMetadata::new("cluster-watch", "trace-abc");
        assert_eq!(meta.source_module, "cluster-watch");
        assert_eq!(meta.trace_id, "trace-abc");
    }

    #[test]
    fn event_metadata_with_new_trace_generates_uuid() {
        let meta = EventMetadata::with_new_trace("inventory");
        assert_eq!(meta.trace_id.len(), 36);
        assert_eq!(meta.trace_id.chars().filter(|c| *c == '-').count(), 4);
    }

    #[test]
    fn workload_event_implements_event_trait() {
        let event = WorkloadEvent::new(WorkloadOp::Add, sample_locator(), None, vec![]);
        assert_eq!(event.event_type(), "workload");
        assert!(!event.event_id().is_empty());
        assert_eq!(event.metadata().source_module, "cluster-watch");
    }

    #[test]
    fn workload_event_display() {
        let event = WorkloadEvent::new(WorkloadOp::Delete, sample_locator(), None, vec![]);
        let display = event.to_string();
        assert!(display.contains("DELETE"));
        assert!(display.contains("prod/default/Deployment/web"));
    }

    #[test]
    fn scan_event_with_trace_preserves_trace_id() {
        let image = crate::types::ImageReference::parse("nginx:1.27").unwrap();
        let event = ScanEvent::with_trace(image, "sha256:ffff", vec!["deb".to_owned()], true, "t-1");
        assert_eq!(event.metadata().trace_id, "t-1");
        assert_eq!(event.event_type(), "scan");
    }

    #[test]
    fn scan_event_display_failure() {
        let image = crate::types::ImageReference::parse("nginx").unwrap();
        let event = ScanEvent::with_trace(image, "nginx", vec![], false, "t-2");
        assert!(event.to_string().contains("FAILED"));
    }

    #[test]
    fn events_are_send_sync() {
        fn assert_send_sync<T: Send + Sync + 'static>() {}
        assert_send_sync::<WorkloadEvent>();
        assert_send_sync::<ScanEvent>();
    }
}
