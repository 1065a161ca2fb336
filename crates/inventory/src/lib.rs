//! Podsentry 워크로드 인벤토리 — 단일 작성자 인메모리 스토어
//!
//! 클러스터 워처의 정규화 이벤트를 순서대로 적용하여 인벤토리를
//! 유지하고, 스캔/보고 부수효과를 계산합니다.

pub mod store;

pub use store::{ApplyOutcome, StoreDelta, WorkloadStore};
