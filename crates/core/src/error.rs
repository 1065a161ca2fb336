//! 에러 타입 — 도메인별 에러 정의

/// Podsentry 최상위 에러 타입
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// 설정 관련 에러
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// 파이프라인 생명주기 에러
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// 클러스터 watch/list 에러
    #[error("watch error: {0}")]
    Watch(#[from] WatchError),

    /// 이미지 스캔 에러
    #[error("scan error: {0}")]
    Scan(#[from] ScanError),

    /// 업스트림 보고 에러
    #[error("report error: {0}")]
    Report(#[from] ReportError),

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 설정 관련 에러
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// 설정 파일을 찾을 수 없음
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// 설정 파싱 실패
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// 유효하지 않은 설정 값
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// 파이프라인 생명주기 에러
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// 이미 실행 중인 모듈을 다시 시작
    #[error("pipeline already running")]
    AlreadyRunning,

    /// 실행 중이 아닌 모듈을 정지
    #[error("pipeline not running")]
    NotRunning,

    /// 채널 전송 실패
    #[error("channel send failed: {0}")]
    ChannelSend(String),

    /// 초기화 실패
    #[error("pipeline init failed: {0}")]
    InitFailed(String),
}

/// 클러스터 watch/list 에러 (core 수준 요약)
///
/// 상세 에러는 `podsentry-cluster-watch`의 `ClusterWatchError`가 담고,
/// 모듈 경계를 넘을 때 이 타입으로 축약됩니다.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// 오케스트레이터 API 호출 실패
    #[error("cluster api error: {0}")]
    Api(String),

    /// 이벤트 스트림 종료/중단
    #[error("watch stream interrupted: {0}")]
    Stream(String),
}

/// 이미지 스캔 에러 (core 수준 요약)
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// 이미지 pull/해석 실패
    #[error("image pull failed: {0}")]
    Pull(String),

    /// 이미지 검사 실패
    #[error("image inspect failed: {0}")]
    Inspect(String),
}

/// 업스트림 보고 에러 (core 수준 요약)
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    /// 업스트림 전송 실패
    #[error("upstream delivery failed: {0}")]
    Delivery(String),

    /// 전송 큐 닫힘
    #[error("delivery queue closed")]
    QueueClosed,
}
