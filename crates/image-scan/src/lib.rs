//! Podsentry 이미지 스캔 -- 레지스트리 pull, 구성 검사, 스캔 스케줄링
//!
//! # 모듈 구성
//!
//! - [`error`]: 도메인 에러 타입 (`ImageScanError`, transient/permanent 구분)
//! - [`catalog`]: 핵심 바이너리 카탈로그 (고정 순서)
//! - [`workdir`]: 스캔별 임시 디렉토리 (`ScanWorkdir`, RAII 정리)
//! - [`pull`]: 이미지 pull 추상화 (`ImagePuller` trait, `RegistryImagePuller`)
//! - [`inspector`]: 루트 파일시스템 검사 (`inspect`)
//! - [`scheduler`]: 메인 오케스트레이터 (`ScanScheduler`, `ScanSchedulerBuilder`)
//!
//! # 아키텍처
//!
//! ```text
//! schedule(image) --> ScanScheduler (digest 중복 제거, Semaphore)
//!                          |
//!                     ImagePuller.pull()
//!                          |
//!                     inspector::inspect()
//!                          |
//!                     ScanEvent --mpsc--> daemon
//! ```

pub mod catalog;
pub mod error;
pub mod inspector;
pub mod pull;
pub mod scheduler;
pub mod workdir;

// --- 주요 타입 re-export ---

// 스케줄러 (메인 오케스트레이터)
pub use scheduler::{ScanReport, ScanScheduler, ScanSchedulerBuilder};

// pull 추상화
pub use pull::{ImagePuller, PulledImage, RegistryImagePuller};

// 검사
pub use inspector::inspect;

// 에러
pub use error::ImageScanError;

// 작업 디렉토리
pub use workdir::ScanWorkdir;
