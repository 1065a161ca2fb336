//! 도메인 타입 — 시스템 전역에서 사용되는 공통 타입
//!
//! 모든 모듈이 공유하는 데이터 구조를 정의합니다.
//! 워크로드 식별자([`WorkloadLocator`]), 메타데이터([`WorkloadMetadata`]),
//! 이미지 참조([`ImageReference`]), 스캔 결과([`ScanResult`])가 핵심입니다.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// 감시 대상 워크로드 종류
///
/// Kubernetes의 Pod 및 Pod 소유 컨트롤러의 닫힌 집합입니다.
/// 직렬화 시 Kubernetes 정식 kind 문자열을 사용합니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    /// 소유 컨트롤러가 없는 단독 Pod
    Pod,
    /// ReplicationController
    ReplicationController,
    /// Deployment
    Deployment,
    /// StatefulSet
    StatefulSet,
    /// DaemonSet
    DaemonSet,
    /// Job
    Job,
    /// CronJob
    CronJob,
}

impl WorkloadKind {
    /// 감시 대상 전체 kind 목록 (watch 스트림은 kind당 하나씩 열립니다)
    pub const ALL: [Self; 7] = [
        Self::Pod,
        Self::ReplicationController,
        Self::Deployment,
        Self::StatefulSet,
        Self::DaemonSet,
        Self::Job,
        Self::CronJob,
    ];

    /// Kubernetes 정식 kind 문자열을 반환합니다.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pod => "Pod",
            Self::ReplicationController => "ReplicationController",
            Self::Deployment => "Deployment",
            Self::StatefulSet => "StatefulSet",
            Self::DaemonSet => "DaemonSet",
            Self::Job => "Job",
            Self::CronJob => "CronJob",
        }
    }

    /// kind 문자열에서 파싱합니다. 대소문자를 구분하지 않습니다.
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pod" => Some(Self::Pod),
            "replicationcontroller" => Some(Self::ReplicationController),
            "deployment" => Some(Self::Deployment),
            "statefulset" => Some(Self::StatefulSet),
            "daemonset" => Some(Self::DaemonSet),
            "job" => Some(Self::Job),
            "cronjob" => Some(Self::CronJob),
            _ => None,
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 워크로드 식별자 — 인벤토리의 유일 키
///
/// `{cluster, namespace, kind, name}` 조합은 한 시점에 클러스터 내에서
/// 유일합니다. 같은 컨트롤러에 속한 Pod들은 컨트롤러 locator 하나로
/// 수렴하고, 소유자가 없는 Pod만 Pod kind의 locator가 됩니다.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkloadLocator {
    /// 클러스터 이름
    pub cluster: String,
    /// 네임스페이스
    pub namespace: String,
    /// 워크로드 종류
    pub kind: WorkloadKind,
    /// 워크로드 이름
    pub name: String,
}

impl WorkloadLocator {
    /// 새 locator를 생성합니다.
    pub fn new(
        cluster: impl Into<String>,
        namespace: impl Into<String>,
        kind: WorkloadKind,
        name: impl Into<String>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            namespace: namespace.into(),
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.cluster, self.namespace, self.kind, self.name,
        )
    }
}

/// 워크로드 메타데이터
///
/// locator에 부착되는 스펙 정보입니다. `revision`은 스펙이 바뀔 때마다
/// (새 롤아웃) 달라지며, revision이 같은 메타데이터 갱신은 보고 관점에서
/// no-op입니다.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadMetadata {
    /// 스펙 버전 마커 (Kubernetes resourceVersion / generation 기반)
    pub revision: String,
    /// 오브젝트 레이블
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Pod 템플릿 레이블
    #[serde(default)]
    pub spec_labels: BTreeMap<String, String>,
    /// 오브젝트 어노테이션
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Pod 템플릿 어노테이션
    #[serde(default)]
    pub spec_annotations: BTreeMap<String, String>,
    /// Pod 스펙 (컨트롤러 종류별로 구조가 달라 JSON 값으로 유지)
    #[serde(default)]
    pub pod_spec: serde_json::Value,
}

/// 컨테이너 이미지 참조 — 스캔 중복 제거의 단위
///
/// Pod 스펙의 컨테이너 목록에서 추출됩니다. 여러 워크로드가 같은
/// 이미지를 참조할 수 있으며, 스캔은 참조 문자열이 아닌 해석된
/// 콘텐츠 digest 기준으로 한 번만 수행됩니다.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ImageReference {
    /// 레지스트리 호스트 (기본: docker.io)
    pub registry: String,
    /// 리포지토리 경로 (예: library/nginx)
    pub repository: String,
    /// 태그 또는 digest (예: "1.27" 또는 "sha256:abcd…")
    pub reference: String,
}

impl ImageReference {
    /// 컨테이너 스펙의 이미지 문자열을 파싱합니다.
    ///
    /// 규칙은 Docker 참조 문법을 따릅니다:
    /// - 레지스트리 생략 시 `docker.io`, 단일 경로 세그먼트면 `library/` 접두
    /// - 태그 생략 시 `latest`
    /// - `@sha256:…` digest 참조는 그대로 유지
    ///
    /// 빈 문자열은 `None`을 반환합니다.
    pub fn parse(image: &str) -> Option<Self> {
        let image = image.trim();
        if image.is_empty() {
            return None;
        }

        // digest 분리가 태그 분리보다 먼저
        let (name, reference) = if let Some((name, digest)) = image.split_once('@') {
            (name, digest.to_owned())
        } else {
            // 포트 구분자와 태그 구분자 모두 ':' — 마지막 세그먼트에만 적용
            match image.rsplit_once(':') {
                Some((name, tag)) if !tag.contains('/') => (name, tag.to_owned()),
                _ => (image, "latest".to_owned()),
            }
        };

        // 첫 세그먼트에 '.'/':'가 있거나 "localhost"면 레지스트리 호스트
        let (registry, repository) = match name.split_once('/') {
            Some((host, rest)) if host.contains('.') || host.contains(':') || host == "localhost" => {
                (host.to_owned(), rest.to_owned())
            }
            _ => {
                let repo = if name.contains('/') {
                    name.to_owned()
                } else {
                    format!("library/{name}")
                };
                ("docker.io".to_owned(), repo)
            }
        };

        if repository.is_empty() {
            return None;
        }

        Some(Self {
            registry,
            repository,
            reference,
        })
    }

    /// digest 참조 여부를 반환합니다.
    pub fn is_digest(&self) -> bool {
        self.reference.starts_with("sha256:")
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = if self.is_digest() { "@" } else { ":" };
        write!(f, "{}/{}{}{}", self.registry, self.repository, sep, self.reference)
    }
}

/// 이미지 안에서 탐지된 대상 OS 서술자
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetOs {
    /// OS 이름 (os-release ID, 예: "debian")
    pub name: String,
    /// OS 버전 (os-release VERSION_ID)
    pub version: String,
    /// 사람이 읽는 이름 (os-release PRETTY_NAME)
    pub pretty_name: String,
}

impl TargetOs {
    /// OS 패키지 데이터베이스가 전혀 없는 이미지(scratch/distroless)용 센티널.
    ///
    /// "구조화된 정보를 찾지 못했지만 기록은 남긴다"는 의미이며 에러가 아닙니다.
    pub fn unknown() -> Self {
        Self {
            name: "unknown".to_owned(),
            version: "0.0".to_owned(),
            pretty_name: String::new(),
        }
    }
}

/// 스캔 결과의 패키지 섹션
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageInfo {
    /// 패키지 포맷 버전 (예: "deb:0.0.1", 미탐지 시 "linux:0.0.1")
    pub package_format_version: String,
    /// 대상 OS — 업스트림 스키마의 필드명은 `targetOS`
    #[serde(rename = "targetOS")]
    pub target_os: TargetOs,
}

/// 스캔 결과의 플러그인 섹션
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    /// 탐지된 패키지 매니저 (예: "deb", "apk", "rpm", 미탐지 시 "linux")
    pub package_manager: String,
}

/// 의존성 그래프의 패키지 노드
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyPackage {
    /// 패키지 이름
    pub name: String,
    /// 패키지 버전
    pub version: String,
}

/// 이미지에서 추출한 의존성 그래프 (플러그인 하나 분량)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyGraph {
    /// 패키지 목록
    pub packages: Vec<DependencyPackage>,
}

impl DependencyGraph {
    /// 패키지 수를 반환합니다.
    pub fn package_count(&self) -> usize {
        self.packages.len()
    }
}

/// 스캔된 이미지의 메타데이터
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
    /// 스캔 시점의 이미지 참조 문자열
    pub image: String,
    /// 해석된 콘텐츠 digest
    pub digest: String,
}

/// 플러그인 하나의 스캔 결과
///
/// 한 이미지는 여러 결과를 낼 수 있습니다 (OS 패키지 + 탐지된 언어
/// 런타임별 결과). 결과는 플러그인 키(예: "deb", "node", "openjdk")로
/// 구분됩니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    /// 패키지 포맷/OS 정보
    pub package: PackageInfo,
    /// 플러그인 정보
    pub plugin: PluginInfo,
    /// 의존성 그래프
    pub dependency_graph: DependencyGraph,
    /// 이미지 메타데이터
    pub image_metadata: ImageMetadata,
    /// 핵심 바이너리 콘텐츠 해시 — 카탈로그 선언 순서 그대로 (정렬 금지)
    pub hashes: Vec<String>,
}

impl fmt::Display for ScanResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} packages={} os={}:{} hashes={}",
            self.plugin.package_manager,
            self.dependency_graph.package_count(),
            self.package.target_os.name,
            self.package.target_os.version,
            self.hashes.len(),
        )
    }
}
