//! 클러스터 워처 에러 타입

use podsentry_core::error::{AgentError, WatchError};

/// 클러스터 watch/list 경로의 상세 에러
#[derive(Debug, thiserror::Error)]
pub enum ClusterWatchError {
    /// 오케스트레이터 API 호출 실패 (연결 불가, 인증 실패 등)
    #[error("cluster api error: {0}")]
    Api(String),

    /// watch 스트림 중단 (연결 끊김 등) — 전체 재목록으로 복구
    #[error("watch stream error: {0}")]
    Stream(String),

    /// watch 위치가 너무 오래됨 (HTTP 410) — 전체 재목록으로 복구
    #[error("watch position expired, full relist required")]
    StaleResourceVersion,

    /// 단일 오브젝트 페이로드 손상 — 해당 오브젝트만 건너뜀
    #[error("malformed {kind} object '{name}': {reason}")]
    Malformed {
        /// 오브젝트 kind
        kind: String,
        /// 오브젝트 이름 (식별 불가 시 "<unknown>")
        name: String,
        /// 원인
        reason: String,
    },

    /// 정규화 이벤트 채널 닫힘 (소비자 종료)
    #[error("event channel closed")]
    ChannelClosed,
}

impl ClusterWatchError {
    /// 비정상 오브젝트 에러 헬퍼
    pub fn malformed(kind: impl Into<String>, name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            kind: kind.into(),
            name: name.into(),
            reason: reason.into(),
        }
    }
}

impl From<ClusterWatchError> for AgentError {
    fn from(err: ClusterWatchError) -> Self {
        match err {
            ClusterWatchError::Api(reason) => AgentError::Watch(WatchError::Api(reason)),
            other => AgentError::Watch(WatchError::Stream(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_error_names_object() {
        let err = ClusterWatchError::malformed("Deployment", "web", "missing metadata.name");
        assert!(err.to_string().contains("Deployment"));
        assert!(err.to_string().contains("web"));
    }

    #[test]
    fn api_error_maps_to_core_api_variant() {
        let err: AgentError = ClusterWatchError::Api("connection refused".to_owned()).into();
        assert!(err.to_string().contains("connection refused"));
    }
}
