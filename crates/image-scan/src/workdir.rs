//! 스캔 작업 디렉토리 -- 스캔 하나당 격리된 임시 공간
//!
//! 이미지 레이어 다운로드와 루트 파일시스템 전개는 모두 스캔별
//! 디렉토리 안에서 일어납니다. [`ScanWorkdir`]가 drop되면 디렉토리가
//! 내용물과 함께 삭제되므로 어떤 종료 경로에서도 잔재가 남지
//! 않습니다. 동시 스캔끼리는 디렉토리를 공유하지 않습니다.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;

use crate::error::ImageScanError;

/// 스캔 하나의 작업 디렉토리 (RAII 정리)
pub struct ScanWorkdir {
    dir: TempDir,
    rootfs: PathBuf,
}

impl ScanWorkdir {
    /// `base` 아래에 새 작업 디렉토리를 만듭니다.
    ///
    /// `base`가 없으면 생성합니다. 루트 파일시스템 전개용 `rootfs`
    /// 서브디렉토리가 함께 준비됩니다.
    pub fn create(base: &Path) -> Result<Self, ImageScanError> {
        std::fs::create_dir_all(base)?;
        let dir = TempDir::with_prefix_in("scan-", base)?;
        let rootfs = dir.path().join("rootfs");
        std::fs::create_dir(&rootfs)?;
        debug!(path = %dir.path().display(), "created scan workdir");
        Ok(Self { dir, rootfs })
    }

    /// 작업 디렉토리 경로를 반환합니다 (레이어 다운로드용).
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// 루트 파일시스템 전개 디렉토리를 반환합니다.
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }
}
