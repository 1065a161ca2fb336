//! Podsentry 업스트림 리포터 -- 인벤토리/스캔 델타의 at-least-once 전달
//!
//! # 모듈 구성
//!
//! - [`error`]: 도메인 에러 타입 (`UpstreamReportError`)
//! - [`client`]: 업스트림 API 추상화 (`UpstreamClient` trait, `HttpUpstreamClient`)
//! - [`reporter`]: 전달 루프 (`UpstreamReporter`, `UpstreamReporterBuilder`)
//!
//! # 아키텍처
//!
//! ```text
//! daemon --mpsc--> ReportJob 큐 --> 단일 워커 (FIFO)
//!                                      |
//!                               UpstreamClient (HTTP)
//!                                      |
//!                            실패 시 백오프 후 무한 재시도
//! ```

pub mod client;
pub mod error;
pub mod reporter;

// --- 주요 타입 re-export ---

// 리포터 (전달 루프)
pub use reporter::{ReportJob, UpstreamReporter, UpstreamReporterBuilder};

// 업스트림 API 추상화
pub use client::{HttpUpstreamClient, InventoryEntry, UpstreamClient};

// 에러
pub use error::UpstreamReportError;
