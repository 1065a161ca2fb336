//! Podsentry 공유 크레이트 — 도메인 타입, 이벤트, 에러, 설정, 생명주기 trait
//!
//! 워크로드 인벤토리/이미지 스캔 파이프라인의 모든 모듈이 공유하는
//! 기반 타입을 정의합니다.

pub mod config;
pub mod error;
pub mod event;
pub mod metrics;
pub mod pipeline;
pub mod types;

// --- 주요 타입 re-export ---
// 각 모듈의 핵심 타입을 크레이트 루트에서 바로 사용할 수 있도록 합니다.

// 에러
pub use error::{AgentError, ConfigError, PipelineError, ReportError, ScanError, WatchError};

// 설정
pub use config::AgentConfig;

// 이벤트
pub use event::{Event, EventMetadata, ScanEvent, WorkloadEvent, WorkloadOp};

// 파이프라인 trait
pub use pipeline::{HealthStatus, Pipeline};

// 도메인 타입
pub use types::{
    DependencyGraph, DependencyPackage, ImageMetadata, ImageReference, PackageInfo, PluginInfo,
    ScanResult, TargetOs, WorkloadKind, WorkloadLocator, WorkloadMetadata,
};
