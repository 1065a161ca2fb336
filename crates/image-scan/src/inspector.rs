//! 이미지 인스펙터 -- 전개된 루트 파일시스템에서 구성 정보 추출
//!
//! pull된 이미지의 파일시스템을 읽어 플러그인 키별 [`ScanResult`] 맵을
//! 만듭니다. OS 패키지 데이터베이스(dpkg/apk/rpm) 하나와, 카탈로그에
//! 등록된 언어 런타임별 결과가 각각 하나씩 나올 수 있습니다.
//!
//! 아무것도 찾지 못한 이미지(scratch/distroless)도 에러가 아니라
//! `linux:0.0.1` 센티널 결과 하나를 냅니다. 워크로드 존재 자체는
//! 항상 보고되어야 하기 때문입니다.

use std::collections::BTreeMap;
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::debug;

use podsentry_core::types::{
    DependencyGraph, DependencyPackage, PackageInfo, PluginInfo, ScanResult, TargetOs,
};

use crate::catalog::KEY_BINARIES;
use crate::error::ImageScanError;
use crate::pull::PulledImage;

/// os-release 파일의 표준 위치 (우선순위 순)
const OS_RELEASE_PATHS: &[&str] = &["etc/os-release", "usr/lib/os-release"];
/// dpkg 설치 데이터베이스
const DPKG_STATUS_PATH: &str = "var/lib/dpkg/status";
/// apk 설치 데이터베이스
const APK_INSTALLED_PATH: &str = "lib/apk/db/installed";
/// rpm 데이터베이스 디렉토리
const RPM_DB_PATH: &str = "var/lib/rpm";

/// 미탐지 시 사용하는 패키지 매니저/포맷 센티널
const LINUX_FALLBACK: &str = "linux";
const LINUX_FORMAT_VERSION: &str = "linux:0.0.1";

/// 전개된 이미지를 검사하여 플러그인 키별 스캔 결과를 만듭니다.
///
/// 블로킹 파일 I/O를 수행하므로 `spawn_blocking`에서 호출해야 합니다.
pub fn inspect(pulled: &PulledImage) -> Result<BTreeMap<String, ScanResult>, ImageScanError> {
    let rootfs = &pulled.rootfs;
    let target_os = detect_os(rootfs).unwrap_or_else(TargetOs::unknown);

    let mut results = BTreeMap::new();

    // 1. OS 패키지 결과 (없으면 linux 센티널)
    let (manager, packages) = detect_os_packages(rootfs)?;
    let package_format_version = if manager == LINUX_FALLBACK {
        LINUX_FORMAT_VERSION.to_owned()
    } else {
        format!("{manager}:0.0.1")
    };
    debug!(
        manager = manager,
        packages = packages.len(),
        os = %target_os.name,
        "detected os packages"
    );
    results.insert(
        manager.to_owned(),
        ScanResult {
            package: PackageInfo {
                package_format_version,
                target_os: target_os.clone(),
            },
            plugin: PluginInfo {
                package_manager: manager.to_owned(),
            },
            dependency_graph: DependencyGraph { packages },
            image_metadata: pulled.image_metadata.clone(),
            hashes: vec![],
        },
    );

    // 2. 핵심 바이너리 해시 결과 (런타임별, 카탈로그 순서 유지)
    for binary in KEY_BINARIES {
        let hashes = hash_catalog_paths(rootfs, binary.paths)?;
        if hashes.is_empty() {
            continue;
        }
        debug!(plugin = binary.plugin_key, hashes = hashes.len(), "hashed key binaries");
        results.insert(
            binary.plugin_key.to_owned(),
            ScanResult {
                package: PackageInfo {
                    package_format_version: format!("{}:0.0.1", binary.plugin_key),
                    target_os: target_os.clone(),
                },
                plugin: PluginInfo {
                    package_manager: binary.plugin_key.to_owned(),
                },
                dependency_graph: DependencyGraph::default(),
                image_metadata: pulled.image_metadata.clone(),
                hashes,
            },
        );
    }

    Ok(results)
}

/// os-release 메타데이터에서 대상 OS를 탐지합니다.
fn detect_os(rootfs: &Path) -> Option<TargetOs> {
    for relative in OS_RELEASE_PATHS {
        let path = rootfs.join(relative);
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        if let Some(os) = parse_os_release(&content) {
            return Some(os);
        }
    }
    None
}

/// os-release 본문을 파싱합니다. `ID` 필드가 없으면 None입니다.
fn parse_os_release(content: &str) -> Option<TargetOs> {
    let mut name = None;
    let mut version = None;
    let mut pretty_name = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim_matches('"').trim_matches('\'');
        match key {
            "ID" => name = Some(value.to_owned()),
            "VERSION_ID" => version = Some(value.to_owned()),
            "PRETTY_NAME" => pretty_name = Some(value.to_owned()),
            _ => {}
        }
    }

    Some(TargetOs {
        name: name?,
        version: version.unwrap_or_else(|| "0.0".to_owned()),
        pretty_name: pretty_name.unwrap_or_default(),
    })
}

/// 설치 데이터베이스를 찾아 (패키지 매니저, 패키지 목록)을 반환합니다.
///
/// 아무 데이터베이스도 없으면 `("linux", [])`입니다. rpm은 데이터베이스
/// 존재만 기록하고 패키지 상세는 추출하지 않습니다.
fn detect_os_packages(
    rootfs: &Path,
) -> Result<(&'static str, Vec<DependencyPackage>), ImageScanError> {
    let dpkg = rootfs.join(DPKG_STATUS_PATH);
    if dpkg.is_file() {
        let content = std::fs::read_to_string(&dpkg)?;
        return Ok(("deb", parse_dpkg_status(&content)));
    }

    let apk = rootfs.join(APK_INSTALLED_PATH);
    if apk.is_file() {
        let content = std::fs::read_to_string(&apk)?;
        return Ok(("apk", parse_apk_installed(&content)));
    }

    let rpm = rootfs.join(RPM_DB_PATH);
    if rpm.is_dir() && rpm.read_dir()?.next().is_some() {
        return Ok(("rpm", vec![]));
    }

    Ok((LINUX_FALLBACK, vec![]))
}

/// dpkg status 파일을 파싱합니다. `Status: … installed`인 항목만 포함합니다.
fn parse_dpkg_status(content: &str) -> Vec<DependencyPackage> {
    let mut packages = Vec::new();

    for stanza in content.split("\n\n") {
        let mut name = None;
        let mut version = None;
        let mut installed = false;

        for line in stanza.lines() {
            if let Some(value) = line.strip_prefix("Package:") {
                name = Some(value.trim().to_owned());
            } else if let Some(value) = line.strip_prefix("Version:") {
                version = Some(value.trim().to_owned());
            } else if let Some(value) = line.strip_prefix("Status:") {
                installed = value.split_whitespace().any(|word| word == "installed");
            }
        }

        if installed && let (Some(name), Some(version)) = (name, version) {
            packages.push(DependencyPackage { name, version });
        }
    }

    packages
}

/// apk installed 데이터베이스를 파싱합니다 (P: 이름, V: 버전).
fn parse_apk_installed(content: &str) -> Vec<DependencyPackage> {
    let mut packages = Vec::new();

    for stanza in content.split("\n\n") {
        let mut name = None;
        let mut version = None;

        for line in stanza.lines() {
            if let Some(value) = line.strip_prefix("P:") {
                name = Some(value.trim().to_owned());
            } else if let Some(value) = line.strip_prefix("V:") {
                version = Some(value.trim().to_owned());
            }
        }

        if let (Some(name), Some(version)) = (name, version) {
            packages.push(DependencyPackage { name, version });
        }
    }

    packages
}

/// 카탈로그 경로 목록에서 존재하는 파일을 순서대로 해시합니다.
///
/// 반환 순서는 경로 선언 순서와 같습니다. 정렬하지 않습니다.
fn hash_catalog_paths(rootfs: &Path, paths: &[&str]) -> Result<Vec<String>, ImageScanError> {
    let mut hashes = Vec::new();
    for relative in paths {
        let path = rootfs.join(relative);
        if !path.is_file() {
            continue;
        }
        let content = std::fs::read(&path)?;
        let digest = Sha256::digest(&content);
        hashes.push(hex::encode(digest));
    }
    Ok(hashes)
}
