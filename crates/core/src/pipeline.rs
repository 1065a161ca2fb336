//! 파이프라인 trait — 모듈 생명주기 확장 포인트
//!
//! 모든 모듈(클러스터 워처, 스캔 스케줄러, 업스트림 리포터)은
//! [`Pipeline`]을 구현하여 데몬에서 동일한 생명주기로 관리됩니다.

use std::future::Future;

use crate::error::AgentError;

/// 모듈 건강 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// 정상 동작 중
    Healthy,
    /// 동작 중이지만 기능 일부가 제한됨
    Degraded(String),
    /// 동작 불가
    Unhealthy(String),
}

impl HealthStatus {
    /// 정상 여부를 반환합니다.
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// 동작 불가 여부를 반환합니다.
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, Self::Unhealthy(_))
    }
}

/// 모듈 생명주기 trait
///
/// `start()`는 백그라운드 태스크를 스폰하고 즉시 반환합니다.
/// `stop()` 후 재시작은 지원하지 않습니다 — 빌더로 새 인스턴스를
/// 만들어야 합니다.
pub trait Pipeline: Send {
    /// 모듈을 시작합니다.
    fn start(&mut self) -> impl Future<Output = Result<(), AgentError>> + Send;

    /// 모듈을 정지합니다. 진행 중인 작업은 유예 시간 내에서 마무리됩니다.
    fn stop(&mut self) -> impl Future<Output = Result<(), AgentError>> + Send;

    /// 현재 건강 상태를 보고합니다.
    fn health_check(&self) -> impl Future<Output = HealthStatus> + Send;
}
