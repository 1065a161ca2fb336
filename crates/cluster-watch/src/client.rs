//! Orchestrator API abstraction for testability.
//!
//! The [`ClusterClient`] trait abstracts the Kubernetes watch/list API,
//! allowing production code to use [`KubeClusterClient`] while tests use a
//! mock with scripted streams.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐
//! │ ClusterWatcher │
//! └───────┬────────┘
//!         │
//!         ▼
//!  ┌───────────────┐
//!  │ ClusterClient │ (trait)
//!  └───────────────┘
//!       │      │
//!       ▼      ▼
//!  ┌──────┐ ┌──────┐
//!  │ kube │ │ Mock │
//!  └───┬──┘ └──────┘
//!      │
//!      ▼
//!  API server
//! ```

use std::collections::BTreeMap;
use std::future::Future;

use futures::StreamExt;
use futures::stream::BoxStream;
use kube::api::{Api, ApiResource, DynamicObject, ListParams, WatchEvent, WatchParams};
use kube::core::GroupVersionKind;
use tracing::warn;

use podsentry_core::types::{ImageReference, WorkloadKind};

use crate::convert;
use crate::error::ClusterWatchError;

/// A workload object normalized out of the orchestrator's heterogeneous
/// resource types. Produced by [`convert::raw_from_json`].
#[derive(Debug, Clone)]
pub struct RawWorkload {
    /// Workload kind.
    pub kind: WorkloadKind,
    /// Object namespace.
    pub namespace: String,
    /// Object name.
    pub name: String,
    /// Spec version marker (generation when present, resourceVersion otherwise).
    pub revision: String,
    /// True for a pod owned by a controller; such pods are absorbed into the
    /// controller's locator and never become workloads of their own.
    pub owned: bool,
    /// Object labels.
    pub labels: BTreeMap<String, String>,
    /// Object annotations.
    pub annotations: BTreeMap<String, String>,
    /// Pod template labels.
    pub spec_labels: BTreeMap<String, String>,
    /// Pod template annotations.
    pub spec_annotations: BTreeMap<String, String>,
    /// Flattened pod spec.
    pub pod_spec: serde_json::Value,
    /// Image references extracted from the container list.
    pub images: Vec<ImageReference>,
}

/// A single item of a kind's watch stream, already normalized.
#[derive(Debug)]
pub enum RawEvent {
    /// Object created.
    Added(RawWorkload),
    /// Object updated.
    Modified(RawWorkload),
    /// Object deleted.
    Deleted(RawWorkload),
    /// The server reported the watch position as expired (HTTP 410);
    /// the consumer must relist and reopen the stream.
    StaleResourceVersion,
}

/// Trait abstracting the orchestrator watch/list API.
///
/// All API access goes through this trait, enabling testability via mocking.
/// The trait is `Send + Sync + 'static`, allowing safe sharing across async
/// contexts.
///
/// # Implementations
///
/// - [`KubeClusterClient`]: production implementation using the `kube` client
/// - `MockClusterClient`: test implementation with scripted lists and streams
pub trait ClusterClient: Send + Sync + 'static {
    /// Performs a full list of one workload kind.
    ///
    /// Returns the normalized objects plus the list's resource version, which
    /// is the position to start the next watch from. Malformed individual
    /// objects are skipped and logged, never failing the whole list.
    fn list(
        &self,
        kind: WorkloadKind,
    ) -> impl Future<Output = Result<(Vec<RawWorkload>, String), ClusterWatchError>> + Send;

    /// Opens a watch stream for one kind starting at `resource_version`.
    ///
    /// The stream yields normalized events; per-object conversion failures
    /// surface as `Err(Malformed)` items so the consumer can skip them
    /// without tearing the stream down.
    fn watch(
        &self,
        kind: WorkloadKind,
        resource_version: &str,
    ) -> impl Future<
        Output = Result<BoxStream<'static, Result<RawEvent, ClusterWatchError>>, ClusterWatchError>,
    > + Send;

    /// Checks API server connectivity.
    ///
    /// Used for the fatal startup check and by `Pipeline::health_check()`.
    fn ping(&self) -> impl Future<Output = Result<(), ClusterWatchError>> + Send;
}

/// Production orchestrator client backed by `kube`.
///
/// Uses dynamic-object APIs so one code path serves every supported workload
/// kind; kind-specific shape differences are handled in [`convert`].
#[derive(Clone)]
pub struct KubeClusterClient {
    client: kube::Client,
}

impl KubeClusterClient {
    /// Connects using the default environment (in-cluster service account,
    /// or local kubeconfig when running outside a cluster).
    ///
    /// # Errors
    ///
    /// Returns `ClusterWatchError::Api` when no usable configuration exists.
    pub async fn connect() -> Result<Self, ClusterWatchError> {
        let client = kube::Client::try_default()
            .await
            .map_err(|e| ClusterWatchError::Api(e.to_string()))?;
        Ok(Self { client })
    }

    /// Wraps an existing `kube::Client`.
    pub fn from_client(client: kube::Client) -> Self {
        Self { client }
    }

    fn api_for(&self, kind: WorkloadKind) -> Api<DynamicObject> {
        let resource = ApiResource::from_gvk(&gvk_for(kind));
        Api::all_with(self.client.clone(), &resource)
    }
}

/// Group/version coordinates for each supported kind.
fn gvk_for(kind: WorkloadKind) -> GroupVersionKind {
    match kind {
        WorkloadKind::Pod | WorkloadKind::ReplicationController => {
            GroupVersionKind::gvk("", "v1", kind.as_str())
        }
        WorkloadKind::Deployment | WorkloadKind::StatefulSet | WorkloadKind::DaemonSet => {
            GroupVersionKind::gvk("apps", "v1", kind.as_str())
        }
        WorkloadKind::Job | WorkloadKind::CronJob => {
            GroupVersionKind::gvk("batch", "v1", kind.as_str())
        }
    }
}

/// HTTP status the API server uses to signal an expired watch position.
const STATUS_EXPIRED: u16 = 410;

impl ClusterClient for KubeClusterClient {
    async fn list(
        &self,
        kind: WorkloadKind,
    ) -> Result<(Vec<RawWorkload>, String), ClusterWatchError> {
        let api = self.api_for(kind);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| ClusterWatchError::Api(e.to_string()))?;

        let resource_version = list.metadata.resource_version.unwrap_or_default();

        let mut workloads = Vec::with_capacity(list.items.len());
        for obj in list.items {
            match normalize_object(kind, &obj) {
                Ok(raw) => workloads.push(raw),
                Err(e) => {
                    // One bad object must not abort the list for the others
                    warn!(kind = %kind, error = %e, "skipping malformed object in list");
                    metrics::counter!(
                        podsentry_core::metrics::WATCH_MALFORMED_OBJECTS_TOTAL,
                        "kind" => kind.as_str()
                    )
                    .increment(1);
                }
            }
        }

        Ok((workloads, resource_version))
    }

    async fn watch(
        &self,
        kind: WorkloadKind,
        resource_version: &str,
    ) -> Result<BoxStream<'static, Result<RawEvent, ClusterWatchError>>, ClusterWatchError> {
        let api = self.api_for(kind);
        let stream = api
            .watch(&WatchParams::default(), resource_version)
            .await
            .map_err(|e| ClusterWatchError::Api(e.to_string()))?;

        let mapped = stream.filter_map(move |item| {
            let normalized = match item {
                Ok(WatchEvent::Added(obj)) => {
                    Some(normalize_object(kind, &obj).map(RawEvent::Added))
                }
                Ok(WatchEvent::Modified(obj)) => {
                    Some(normalize_object(kind, &obj).map(RawEvent::Modified))
                }
                Ok(WatchEvent::Deleted(obj)) => {
                    Some(normalize_object(kind, &obj).map(RawEvent::Deleted))
                }
                Ok(WatchEvent::Bookmark(_)) => None,
                Ok(WatchEvent::Error(status)) if status.code == STATUS_EXPIRED => {
                    Some(Ok(RawEvent::StaleResourceVersion))
                }
                Ok(WatchEvent::Error(status)) => {
                    Some(Err(ClusterWatchError::Stream(status.message)))
                }
                Err(e) => Some(Err(ClusterWatchError::Stream(e.to_string()))),
            };
            futures::future::ready(normalized)
        });

        Ok(mapped.boxed())
    }

    async fn ping(&self) -> Result<(), ClusterWatchError> {
        self.client
            .apiserver_version()
            .await
            .map(|_| ())
            .map_err(|e| ClusterWatchError::Api(e.to_string()))
    }
}

fn normalize_object(
    kind: WorkloadKind,
    obj: &DynamicObject,
) -> Result<RawWorkload, ClusterWatchError> {
    let value = serde_json::to_value(obj).map_err(|e| {
        ClusterWatchError::malformed(kind.as_str(), "<unknown>", e.to_string())
    })?;
    convert::raw_from_json(kind, &value)
}
