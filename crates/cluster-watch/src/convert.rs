//! 오케스트레이터 오브젝트 → [`RawWorkload`] 정규화
//!
//! kind마다 다른 스펙 구조(Pod는 `spec` 직접, 컨트롤러는
//! `spec.template`, CronJob은 `spec.jobTemplate.spec.template`)를
//! 하나의 형태로 평탄화합니다. 필수 필드가 없는 오브젝트는
//! [`ClusterWatchError::Malformed`]로 거부되며, 호출자는 해당
//! 오브젝트만 건너뜁니다.

use std::collections::BTreeMap;

use serde_json::Value;

use podsentry_core::types::{ImageReference, WorkloadKind};

use crate::client::RawWorkload;
use crate::error::ClusterWatchError;

/// 오브젝트 JSON을 정규화된 워크로드로 변환합니다.
pub fn raw_from_json(kind: WorkloadKind, obj: &Value) -> Result<RawWorkload, ClusterWatchError> {
    let metadata = obj
        .get("metadata")
        .and_then(Value::as_object)
        .ok_or_else(|| malformed(kind, obj, "missing metadata"))?;

    let name = metadata
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(kind, obj, "missing metadata.name"))?
        .to_owned();

    let namespace = metadata
        .get("namespace")
        .and_then(Value::as_str)
        .unwrap_or("default")
        .to_owned();

    // 컨트롤러는 스펙 변경 시에만 증가하는 generation을, Pod처럼
    // generation이 없는 오브젝트는 resourceVersion을 revision으로 사용
    let revision = match metadata.get("generation") {
        Some(generation) if !generation.is_null() => generation.to_string(),
        _ => metadata
            .get("resourceVersion")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed(kind, obj, "missing metadata.resourceVersion"))?
            .to_owned(),
    };

    let labels = string_map(metadata.get("labels"));
    let annotations = string_map(metadata.get("annotations"));

    let (template_meta, pod_spec) = pod_template(kind, obj)
        .ok_or_else(|| malformed(kind, obj, "missing pod spec"))?;

    let spec_labels = match kind {
        WorkloadKind::Pod => labels.clone(),
        _ => string_map(template_meta.and_then(|m| m.get("labels"))),
    };
    let spec_annotations = match kind {
        WorkloadKind::Pod => annotations.clone(),
        _ => string_map(template_meta.and_then(|m| m.get("annotations"))),
    };

    let images = container_images(&pod_spec);

    let owned = kind == WorkloadKind::Pod && has_owning_controller(metadata);

    Ok(RawWorkload {
        kind,
        namespace,
        name,
        revision,
        owned,
        labels,
        annotations,
        spec_labels,
        spec_annotations,
        pod_spec,
        images,
    })
}

/// kind별 Pod 템플릿 위치에서 (템플릿 metadata, pod spec)을 꺼냅니다.
fn pod_template<'a>(kind: WorkloadKind, obj: &'a Value) -> Option<(Option<&'a Value>, Value)> {
    match kind {
        WorkloadKind::Pod => obj.get("spec").map(|spec| (None, spec.clone())),
        WorkloadKind::CronJob => {
            let template = obj
                .get("spec")?
                .get("jobTemplate")?
                .get("spec")?
                .get("template")?;
            Some((template.get("metadata"), template.get("spec")?.clone()))
        }
        _ => {
            let template = obj.get("spec")?.get("template")?;
            Some((template.get("metadata"), template.get("spec")?.clone()))
        }
    }
}

/// Pod 스펙의 컨테이너 목록에서 이미지 참조를 추출합니다.
///
/// 파싱 불가능한 이미지 문자열은 건너뜁니다 (오브젝트 전체를
/// 거부하지 않습니다).
fn container_images(pod_spec: &Value) -> Vec<ImageReference> {
    pod_spec
        .get("containers")
        .and_then(Value::as_array)
        .map(|containers| {
            containers
                .iter()
                .filter_map(|c| c.get("image").and_then(Value::as_str))
                .filter_map(ImageReference::parse)
                .collect()
        })
        .unwrap_or_default()
}

/// metadata.ownerReferences에 controller=true 항목이 있는지 검사합니다.
fn has_owning_controller(metadata: &serde_json::Map<String, Value>) -> bool {
    metadata
        .get("ownerReferences")
        .and_then(Value::as_array)
        .is_some_and(|owners| {
            owners
                .iter()
                .any(|owner| owner.get("controller").and_then(Value::as_bool) == Some(true))
        })
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
                .collect()
        })
        .unwrap_or_default()
}

fn malformed(kind: WorkloadKind, obj: &Value, reason: &str) -> ClusterWatchError {
    let name = obj
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("<unknown>");
    ClusterWatchError::malformed(kind.as_str(), name, reason)
}
