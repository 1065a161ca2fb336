//! Podsentry 클러스터 워처 -- 워크로드 watch/list 및 이벤트 정규화
//!
//! # 모듈 구성
//!
//! - [`error`]: 도메인 에러 타입 (`ClusterWatchError`)
//! - [`client`]: 오케스트레이터 API 추상화 (`ClusterClient` trait, `KubeClusterClient`)
//! - [`convert`]: 오브젝트 JSON 정규화 (`raw_from_json`)
//! - [`watcher`]: 메인 오케스트레이터 (`ClusterWatcher`, `ClusterWatcherBuilder`)
//!
//! # 아키텍처
//!
//! ```text
//! kind별 watch 스트림 --normalize--> ClusterWatcher
//!                                        |
//!                                   shadow 조정
//!                                        |
//!                              WorkloadEvent --mpsc--> 워크로드 스토어
//! ```

pub mod client;
pub mod convert;
pub mod error;
pub mod watcher;

// --- 주요 타입 re-export ---

// 워처 (메인 오케스트레이터)
pub use watcher::{ClusterWatcher, ClusterWatcherBuilder};

// 클라이언트 추상화
pub use client::{ClusterClient, KubeClusterClient, RawEvent, RawWorkload};

// 에러
pub use error::ClusterWatchError;
