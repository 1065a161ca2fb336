//! 업스트림 리포터 에러 타입

use podsentry_core::error::{AgentError, ReportError};

/// 업스트림 전달 경로의 상세 에러
#[derive(Debug, thiserror::Error)]
pub enum UpstreamReportError {
    /// 업스트림이 에러 상태 코드를 반환함
    #[error("upstream returned status {status}: {reason}")]
    Http {
        /// HTTP 상태 코드
        status: u16,
        /// 응답 설명
        reason: String,
    },

    /// 네트워크 수준 실패 (연결 불가, 타임아웃 등)
    #[error("upstream network error: {0}")]
    Network(String),

    /// 요청 본문 직렬화 실패
    #[error("payload serialization failed: {0}")]
    Serialize(String),

    /// 리포터 구성 오류
    #[error("reporter config error: {0}")]
    Config(String),

    /// 전달 큐 닫힘 (생산자 전부 종료)
    #[error("report queue closed")]
    QueueClosed,
}

impl From<UpstreamReportError> for AgentError {
    fn from(err: UpstreamReportError) -> Self {
        match err {
            UpstreamReportError::QueueClosed => AgentError::Report(ReportError::QueueClosed),
            other => AgentError::Report(ReportError::Delivery(other.to_string())),
        }
    }
}
