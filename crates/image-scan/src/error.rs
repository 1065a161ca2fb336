//! 이미지 스캔 에러 타입
//!
//! 스케줄러의 재시도 판단을 위해 일시적(transient) 실패와 영구적
//! 실패를 구분합니다. 일시적 실패만 백오프 재시도 대상입니다.

use podsentry_core::error::{AgentError, ScanError};

/// 이미지 pull/검사 경로의 상세 에러
#[derive(Debug, thiserror::Error)]
pub enum ImageScanError {
    /// 레지스트리가 에러 상태 코드를 반환함
    #[error("registry error (status {status}): {reason}")]
    Registry {
        /// HTTP 상태 코드
        status: u16,
        /// 응답 본문 또는 설명
        reason: String,
    },

    /// 네트워크 수준 실패 (연결 불가, 타임아웃 등)
    #[error("registry network error: {0}")]
    Network(String),

    /// 인증 실패 (잘못된 자격 증명, 토큰 발급 거부)
    #[error("registry auth failed: {0}")]
    Auth(String),

    /// 매니페스트 해석 실패 (지원하지 않는 media type, 손상된 본문)
    #[error("manifest error: {0}")]
    Manifest(String),

    /// 레이어 압축 해제/적용 실패
    #[error("layer unpack failed: {0}")]
    Unpack(String),

    /// 이미지 파일시스템 검사 실패
    #[error("image inspect failed: {0}")]
    Inspect(String),

    /// 파일시스템 I/O 실패
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// 스케줄러 내부 채널 닫힘
    #[error("scan channel closed: {0}")]
    Channel(String),
}

impl ImageScanError {
    /// 재시도할 가치가 있는 실패인지 반환합니다.
    ///
    /// 서버 오류(5xx)와 속도 제한(429), 네트워크/I/O 실패, 인증 실패는
    /// 일시적으로 간주합니다. 인증은 토큰 엔드포인트 장애나 자격 증명
    /// 전파 지연으로도 실패하므로 재시도 상한까지 백오프 재시도합니다.
    /// 매니페스트/레이어 손상은 재시도해도 같은 결과이므로 영구
    /// 실패입니다.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Registry { status, .. } => *status >= 500 || *status == 429,
            Self::Network(_) | Self::Io(_) | Self::Auth(_) => true,
            Self::Manifest(_) | Self::Unpack(_) | Self::Inspect(_) | Self::Channel(_) => false,
        }
    }
}

impl From<ImageScanError> for AgentError {
    fn from(err: ImageScanError) -> Self {
        match err {
            ImageScanError::Inspect(reason) => AgentError::Scan(ScanError::Inspect(reason)),
            other => AgentError::Scan(ScanError::Pull(other.to_string())),
        }
    }
}
