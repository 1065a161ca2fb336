//! 설정 관리 — podsentry.toml 파싱 및 런타임 설정
//!
//! [`AgentConfig`]는 모든 모듈의 설정을 담는 최상위 구조체입니다.
//!
//! # 설정 로딩 우선순위
//! 1. 환경변수 (`PODSENTRY_CLUSTER_NAME=prod` 형식)
//! 2. 설정 파일 (`podsentry.toml`)
//! 3. 기본값 (`Default` 구현)

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, ConfigError};

/// Podsentry 통합 설정
///
/// `podsentry.toml` 파일의 최상위 구조를 나타냅니다.
/// 각 모듈은 자기 섹션만 읽어 사용합니다.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// 일반 설정
    #[serde(default)]
    pub general: GeneralConfig,
    /// 클러스터 워처 설정
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// 이미지 스캔 설정
    #[serde(default)]
    pub scan: ScanConfig,
    /// 업스트림 보고 설정
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// 메트릭 설정
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl AgentConfig {
    /// TOML 파일에서 설정을 로드하고 환경변수 오버라이드를 적용합니다.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// TOML 파일에서 설정을 로드합니다 (환경변수 오버라이드 없음).
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AgentError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                AgentError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// TOML 문자열에서 설정을 파싱합니다.
    pub fn parse(toml_str: &str) -> Result<Self, AgentError> {
        toml::from_str(toml_str).map_err(|e| {
            AgentError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// 환경변수로 설정값을 오버라이드합니다.
    ///
    /// 네이밍 규칙: `PODSENTRY_{SECTION}_{FIELD}`
    /// 예: `PODSENTRY_CLUSTER_NAME=prod-eu`
    pub fn apply_env_overrides(&mut self) {
        // General
        override_string(&mut self.general.log_level, "PODSENTRY_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "PODSENTRY_GENERAL_LOG_FORMAT");
        override_string(&mut self.general.pid_file, "PODSENTRY_GENERAL_PID_FILE");

        // Cluster
        override_string(&mut self.cluster.name, "PODSENTRY_CLUSTER_NAME");
        override_u64(
            &mut self.cluster.resync_interval_secs,
            "PODSENTRY_CLUSTER_RESYNC_INTERVAL_SECS",
        );
        override_usize(
            &mut self.cluster.event_channel_capacity,
            "PODSENTRY_CLUSTER_EVENT_CHANNEL_CAPACITY",
        );

        // Scan
        override_usize(&mut self.scan.max_concurrency, "PODSENTRY_SCAN_MAX_CONCURRENCY");
        override_u32(
            &mut self.scan.retry_max_attempts,
            "PODSENTRY_SCAN_RETRY_MAX_ATTEMPTS",
        );
        override_u64(
            &mut self.scan.retry_backoff_base_ms,
            "PODSENTRY_SCAN_RETRY_BACKOFF_BASE_MS",
        );
        override_string(&mut self.scan.workdir, "PODSENTRY_SCAN_WORKDIR");

        // Upstream
        override_string(&mut self.upstream.base_url, "PODSENTRY_UPSTREAM_BASE_URL");
        override_string(
            &mut self.upstream.integration_id,
            "PODSENTRY_UPSTREAM_INTEGRATION_ID",
        );
        override_u64(
            &mut self.upstream.timeout_secs,
            "PODSENTRY_UPSTREAM_TIMEOUT_SECS",
        );
        override_u64(
            &mut self.upstream.retry_backoff_base_ms,
            "PODSENTRY_UPSTREAM_RETRY_BACKOFF_BASE_MS",
        );
        override_u64(
            &mut self.upstream.retry_backoff_max_ms,
            "PODSENTRY_UPSTREAM_RETRY_BACKOFF_MAX_MS",
        );

        // Metrics
        override_bool(&mut self.metrics.enabled, "PODSENTRY_METRICS_ENABLED");
        override_u16(&mut self.metrics.port, "PODSENTRY_METRICS_PORT");
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), AgentError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "general.log_level".to_owned(),
                reason: format!("must be one of: {}", valid_levels.join(", ")),
            }
            .into());
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "general.log_format".to_owned(),
                reason: format!("must be one of: {}", valid_formats.join(", ")),
            }
            .into());
        }

        if self.cluster.name.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "cluster.name".to_owned(),
                reason: "cluster name must not be empty".to_owned(),
            }
            .into());
        }

        if self.scan.max_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scan.max_concurrency".to_owned(),
                reason: "must be at least 1".to_owned(),
            }
            .into());
        }

        if self.scan.retry_max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scan.retry_max_attempts".to_owned(),
                reason: "must be at least 1".to_owned(),
            }
            .into());
        }

        if self.upstream.base_url.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "upstream.base_url".to_owned(),
                reason: "upstream base URL must not be empty".to_owned(),
            }
            .into());
        }

        if self.upstream.integration_id.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "upstream.integration_id".to_owned(),
                reason: "integration id must not be empty".to_owned(),
            }
            .into());
        }

        Ok(())
    }
}

/// 일반 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// 로그 레벨 (trace, debug, info, warn, error)
    pub log_level: String,
    /// 로그 형식 (json, pretty)
    pub log_format: String,
    /// PID 파일 경로 (빈 문자열이면 미사용)
    pub pid_file: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "json".to_owned(),
            pid_file: String::new(),
        }
    }
}

/// 클러스터 워처 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// 클러스터 이름 (업스트림 보고 키의 일부)
    pub name: String,
    /// 주기적 전체 재목록(list) 조정 간격 (초, 0이면 비활성)
    pub resync_interval_secs: u64,
    /// 정규화 이벤트 채널 용량
    pub event_channel_capacity: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "default".to_owned(),
            resync_interval_secs: 600,
            event_channel_capacity: 1024,
        }
    }
}

/// 레지스트리 인증 정보 (비공개 레지스트리용)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryAuth {
    /// 레지스트리 호스트 (예: "registry.corp:5000")
    pub registry: String,
    /// 사용자 이름
    pub username: String,
    /// 비밀번호 또는 토큰
    pub password: String,
}

/// 이미지 스캔 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// 동시 스캔 상한 (워커 풀 크기)
    pub max_concurrency: usize,
    /// 일시적 실패 재시도 상한
    pub retry_max_attempts: u32,
    /// 재시도 백오프 기준 (밀리초, 지수 증가)
    pub retry_backoff_base_ms: u64,
    /// 레이어 작업 디렉토리 (빈 문자열이면 시스템 temp)
    pub workdir: String,
    /// 비공개 레지스트리 인증 목록
    pub registry_auth: Vec<RegistryAuth>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            retry_max_attempts: 3,
            retry_backoff_base_ms: 500,
            workdir: String::new(),
            registry_auth: Vec::new(),
        }
    }
}

/// 업스트림 보고 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// 백엔드 기본 URL (예: "https://upstream.example.com")
    pub base_url: String,
    /// 통합 식별자 (보고 경로의 일부)
    pub integration_id: String,
    /// HTTP 요청 타임아웃 (초)
    pub timeout_secs: u64,
    /// 전달 재시도 백오프 기준 (밀리초, 지수 증가)
    pub retry_backoff_base_ms: u64,
    /// 전달 재시도 백오프 상한 (밀리초)
    pub retry_backoff_max_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            integration_id: String::new(),
            timeout_secs: 30,
            retry_backoff_base_ms: 500,
            retry_backoff_max_ms: 60_000,
        }
    }
}

/// 메트릭 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus 엔드포인트 활성화 여부
    pub enabled: bool,
    /// 리스너 포트
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9184,
        }
    }
}

// --- 환경변수 오버라이드 헬퍼 ---

fn override_string(target: &mut String, var: &str) {
    if let Ok(value) = std::env::var(var) {
        *target = value;
    }
}

fn override_bool(target: &mut bool, var: &str) {
    if let Ok(value) = std::env::var(var) {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" => *target = true,
            "false" | "0" | "no" => *target = false,
            _ => tracing::warn!(var = var, value = %value, "invalid boolean env override, ignoring"),
        }
    }
}

fn override_usize(target: &mut usize, var: &str) {
    if let Ok(value) = std::env::var(var) {
        match value.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => tracing::warn!(var = var, value = %value, "invalid integer env override, ignoring"),
        }
    }
}

fn override_u64(target: &mut u64, var: &str) {
    if let Ok(value) = std::env::var(var) {
        match value.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => tracing::warn!(var = var, value = %value, "invalid integer env override, ignoring"),
        }
    }
}

fn override_u32(target: &mut u32, var: &str) {
    if let Ok(value) = std::env::var(var) {
        match value.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => tracing::warn!(var = var, value = %value, "invalid integer env override, ignoring"),
        }
    }
}

fn override_u16(target: &mut u16, var: &str) {
    if let Ok(value) = std::env::var(var) {
        match value.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => tracing::warn!(var = var, value = %value, "invalid integer env override, ignoring"),
        }
    }
}
