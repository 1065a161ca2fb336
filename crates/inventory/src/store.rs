//! 워크로드 스토어 — 인벤토리의 단일 권위 소유자
//!
//! [`WorkloadStore`]는 locator → 메타데이터/이미지 참조의 인메모리 맵이며,
//! 클러스터 워처가 전달한 순서 그대로 단일 소비자 태스크에서
//! [`WorkloadStore::apply`]를 호출해 변경을 적용합니다 (단일 작성자 규율).
//!
//! `apply`는 필요한 부수효과 집합을 돌려줍니다: 스캔해야 할 새 이미지
//! 참조와, 업스트림에 보고할 추가/변경/삭제 델타.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use podsentry_core::event::{WorkloadEvent, WorkloadOp};
use podsentry_core::metrics as m;
use podsentry_core::types::{ImageReference, WorkloadKind, WorkloadLocator, WorkloadMetadata};

/// 스토어에 저장된 워크로드 한 건
#[derive(Debug, Clone)]
struct StoredWorkload {
    /// 최신 관측 메타데이터
    metadata: WorkloadMetadata,
    /// 이 워크로드가 참조하는 이미지 집합
    images: BTreeSet<ImageReference>,
}

/// 스토어 적용이 만든 보고 델타
///
/// 데몬 오케스트레이터가 업스트림 보고 작업으로 변환합니다.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreDelta {
    /// 새 워크로드 — 인벤토리 교체 + 메타데이터 업서트 대상
    Added {
        /// 추가된 워크로드
        locator: WorkloadLocator,
        /// 관측된 메타데이터
        metadata: WorkloadMetadata,
    },
    /// 스펙 변경 (revision 증가) — 메타데이터 업서트 대상
    MetadataChanged {
        /// 변경된 워크로드
        locator: WorkloadLocator,
        /// 새 메타데이터
        metadata: WorkloadMetadata,
    },
    /// 삭제 (terminal) — 즉시 인벤토리 교체 대상
    Removed {
        /// 제거된 워크로드
        locator: WorkloadLocator,
    },
}

/// `apply` 한 번이 만든 부수효과 집합
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    /// 스캔 스케줄링이 필요한 이미지 참조 (이 워크로드 기준 신규)
    pub new_images: Vec<ImageReference>,
    /// 업스트림 보고 델타
    pub deltas: Vec<StoreDelta>,
}

impl ApplyOutcome {
    /// 부수효과가 전혀 없는지 반환합니다 (중복/무의미 이벤트).
    pub fn is_noop(&self) -> bool {
        self.new_images.is_empty() && self.deltas.is_empty()
    }
}

/// 워크로드 인벤토리 스토어
///
/// 공유 가변 상태가 아니라 명시적으로 소유되는 구조체입니다.
/// 모든 변경은 한 태스크에서만 수행하여 불변식이 경합하지 않습니다.
#[derive(Debug, Default)]
pub struct WorkloadStore {
    workloads: HashMap<WorkloadLocator, StoredWorkload>,
}

impl WorkloadStore {
    /// 빈 스토어를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 저장된 워크로드 수를 반환합니다.
    pub fn workload_count(&self) -> usize {
        self.workloads.len()
    }

    /// locator 존재 여부를 반환합니다.
    pub fn contains(&self, locator: &WorkloadLocator) -> bool {
        self.workloads.contains_key(locator)
    }

    /// locator의 최신 revision을 반환합니다.
    pub fn revision_of(&self, locator: &WorkloadLocator) -> Option<&str> {
        self.workloads
            .get(locator)
            .map(|w| w.metadata.revision.as_str())
    }

    /// 해당 locator가 참조하는 이미지 집합을 반환합니다.
    pub fn images_of(&self, locator: &WorkloadLocator) -> Option<&BTreeSet<ImageReference>> {
        self.workloads.get(locator).map(|w| &w.images)
    }

    /// 해당 이미지를 참조하는 모든 워크로드를 반환합니다.
    ///
    /// 스캔 완료 이벤트를 받은 데몬이 의존성 그래프를 보고할 대상을
    /// 찾을 때 사용합니다. 결과는 정렬되어 결정적입니다.
    pub fn workloads_using_image(&self, image: &ImageReference) -> Vec<WorkloadLocator> {
        let mut owners: Vec<WorkloadLocator> = self
            .workloads
            .iter()
            .filter(|(_, stored)| stored.images.contains(image))
            .map(|(locator, _)| locator.clone())
            .collect();
        owners.sort();
        owners
    }

    /// 네임스페이스의 현재 인벤토리 스냅샷을 반환합니다.
    ///
    /// 업스트림의 "지금 존재하는 전부" 교체 호출 본문이 됩니다.
    /// 결과는 이름/종류로 정렬되어 결정적입니다.
    pub fn namespace_inventory(&self, namespace: &str) -> Vec<(String, WorkloadKind)> {
        let mut entries: Vec<(String, WorkloadKind)> = self
            .workloads
            .keys()
            .filter(|locator| locator.namespace == namespace)
            .map(|locator| (locator.name.clone(), locator.kind))
            .collect();
        entries.sort();
        entries
    }

    /// 워크로드 이벤트 하나를 적용합니다.
    ///
    /// 같은 이벤트를 두 번 적용해도 스토어 상태와 보고 델타는
    /// 변하지 않습니다 (중복 전달 멱등성). revision이 같은 MODIFY는
    /// 관측 기록 외에는 no-op입니다.
    pub fn apply(&mut self, event: &WorkloadEvent) -> ApplyOutcome {
        let outcome = match event.op {
            WorkloadOp::Add | WorkloadOp::Modify => self.apply_upsert(event),
            WorkloadOp::Delete => self.apply_delete(event),
        };

        metrics::counter!(m::STORE_EVENTS_APPLIED_TOTAL, "op" => event.op.to_string())
            .increment(1);
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!(m::STORE_WORKLOADS).set(self.workloads.len() as f64);

        outcome
    }

    fn apply_upsert(&mut self, event: &WorkloadEvent) -> ApplyOutcome {
        let Some(metadata) = event.workload.as_ref() else {
            debug!(locator = %event.locator, "upsert event without metadata, ignoring");
            return ApplyOutcome::default();
        };
        let images: BTreeSet<ImageReference> = event.images.iter().cloned().collect();

        match self.workloads.get_mut(&event.locator) {
            Some(existing) => {
                if existing.metadata.revision == metadata.revision {
                    // 같은 revision 재전달 — 보고 관점 no-op
                    debug!(
                        locator = %event.locator,
                        revision = %metadata.revision,
                        "revision unchanged, recording observation only"
                    );
                    return ApplyOutcome::default();
                }

                let new_images: Vec<ImageReference> = images
                    .difference(&existing.images)
                    .cloned()
                    .collect();
                existing.metadata = metadata.clone();
                existing.images = images;

                ApplyOutcome {
                    new_images,
                    deltas: vec![StoreDelta::MetadataChanged {
                        locator: event.locator.clone(),
                        metadata: metadata.clone(),
                    }],
                }
            }
            None => {
                let new_images: Vec<ImageReference> = images.iter().cloned().collect();
                self.workloads.insert(
                    event.locator.clone(),
                    StoredWorkload {
                        metadata: metadata.clone(),
                        images,
                    },
                );

                ApplyOutcome {
                    new_images,
                    deltas: vec![StoreDelta::Added {
                        locator: event.locator.clone(),
                        metadata: metadata.clone(),
                    }],
                }
            }
        }
    }

    fn apply_delete(&mut self, event: &WorkloadEvent) -> ApplyOutcome {
        // 삭제는 terminal: 같은 키의 이후 생성은 완전히 새 생애주기.
        // 캐시된 스캔 결과는 다른 워크로드가 쓸 수 있으므로 건드리지 않음.
        if self.workloads.remove(&event.locator).is_some() {
            ApplyOutcome {
                new_images: Vec::new(),
                deltas: vec![StoreDelta::Removed {
                    locator: event.locator.clone(),
                }],
            }
        } else {
            debug!(locator = %event.locator, "delete for unknown locator, ignoring");
            ApplyOutcome::default()
        }
    }
}
