//! Upstream API abstraction for testability.
//!
//! The [`UpstreamClient`] trait abstracts the security backend's HTTP API,
//! allowing production code to use [`HttpUpstreamClient`] while tests record
//! calls with a mock.
//!
//! All three operations are idempotent upserts; the reporter relies on that
//! for its at-least-once delivery.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use podsentry_core::types::{ScanResult, WorkloadKind, WorkloadLocator, WorkloadMetadata};

use crate::error::UpstreamReportError;

/// One workload of a namespace's authoritative inventory list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InventoryEntry {
    /// Workload name.
    pub name: String,
    /// Workload kind, serialized as `type` on the wire.
    #[serde(rename = "type")]
    pub kind: WorkloadKind,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DependencyGraphBody<'a> {
    dependency_graph_results: &'a BTreeMap<String, ScanResult>,
}

/// Trait abstracting the upstream security backend.
///
/// # Implementations
///
/// - [`HttpUpstreamClient`]: production implementation using `reqwest`
/// - `MockUpstreamClient`: test implementation recording calls
pub trait UpstreamClient: Send + Sync + 'static {
    /// Replaces the full workload inventory of one namespace.
    ///
    /// Authoritative: a workload absent from the list is understood as
    /// deleted from that namespace's view.
    fn replace_inventory(
        &self,
        cluster: &str,
        namespace: &str,
        workloads: &[InventoryEntry],
    ) -> impl Future<Output = Result<(), UpstreamReportError>> + Send;

    /// Upserts one workload's metadata.
    fn upsert_metadata(
        &self,
        locator: &WorkloadLocator,
        metadata: &WorkloadMetadata,
    ) -> impl Future<Output = Result<(), UpstreamReportError>> + Send;

    /// Upserts one workload's dependency-graph results.
    fn upsert_dependency_graphs(
        &self,
        locator: &WorkloadLocator,
        results: &BTreeMap<String, ScanResult>,
    ) -> impl Future<Output = Result<(), UpstreamReportError>> + Send;
}

/// Production client speaking the upstream HTTP API.
///
/// Every path segment is URL-encoded; cluster names with spaces or colons
/// are common enough in practice that this is not optional.
pub struct HttpUpstreamClient {
    http: reqwest::Client,
    base_url: String,
    integration_id: String,
}

impl HttpUpstreamClient {
    /// Creates a client for the given backend base URL and integration id.
    pub fn new(
        base_url: impl Into<String>,
        integration_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, UpstreamReportError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UpstreamReportError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            integration_id: integration_id.into(),
        })
    }

    fn inventory_url(&self, cluster: &str, namespace: &str) -> String {
        format!(
            "{}/api/v2/workloads/{}/{}/{}",
            self.base_url,
            urlencoding::encode(&self.integration_id),
            urlencoding::encode(cluster),
            urlencoding::encode(namespace),
        )
    }

    fn workload_url(&self, prefix: &str, locator: &WorkloadLocator) -> String {
        format!(
            "{}/{}/{}/{}/{}/{}/{}",
            self.base_url,
            prefix,
            urlencoding::encode(&self.integration_id),
            urlencoding::encode(&locator.cluster),
            urlencoding::encode(&locator.namespace),
            urlencoding::encode(locator.kind.as_str()),
            urlencoding::encode(&locator.name),
        )
    }

    async fn send_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<(), UpstreamReportError> {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| UpstreamReportError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(url = url, "upstream call delivered");
            Ok(())
        } else {
            Err(UpstreamReportError::Http {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("unknown").to_owned(),
            })
        }
    }
}

impl UpstreamClient for HttpUpstreamClient {
    async fn replace_inventory(
        &self,
        cluster: &str,
        namespace: &str,
        workloads: &[InventoryEntry],
    ) -> Result<(), UpstreamReportError> {
        // Body is a bare JSON array of {name, type} objects
        let url = self.inventory_url(cluster, namespace);
        self.send_json(&url, workloads).await
    }

    async fn upsert_metadata(
        &self,
        locator: &WorkloadLocator,
        metadata: &WorkloadMetadata,
    ) -> Result<(), UpstreamReportError> {
        let url = self.workload_url("api/v1/workload", locator);
        self.send_json(&url, metadata).await
    }

    async fn upsert_dependency_graphs(
        &self,
        locator: &WorkloadLocator,
        results: &BTreeMap<String, ScanResult>,
    ) -> Result<(), UpstreamReportError> {
        let url = self.workload_url("api/v1/dependency-graphs", locator);
        self.send_json(
            &url,
            &DependencyGraphBody {
                dependency_graph_results: results,
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> HttpUpstreamClient {
        HttpUpstreamClient::new(
            "https://backend.example.com/",
            "intg-42",
            Duration::from_secs(30),
        )
        .unwrap()
    }

    #[test]
    fn inventory_url_shape() {
        assert_eq!(
            client().inventory_url("prod", "default"),
            "https://backend.example.com/api/v2/workloads/intg-42/prod/default",
        );
    }

    #[test]
    fn workload_urls_encode_every_segment() {
        let locator = WorkloadLocator::new(
            "staging cluster:eu",
            "team/apps",
            WorkloadKind::Deployment,
            "web",
        );
        let url = client().workload_url("api/v1/workload", &locator);
        assert_eq!(
            url,
            "https://backend.example.com/api/v1/workload/intg-42/staging%20cluster%3Aeu/team%2Fapps/Deployment/web",
        );
    }

    #[test]
    fn dependency_graph_url_prefix() {
        let locator = WorkloadLocator::new("c", "ns", WorkloadKind::CronJob, "backup");
        let url = client().workload_url("api/v1/dependency-graphs", &locator);
        assert!(url.contains("/api/v1/dependency-graphs/intg-42/c/ns/CronJob/backup"));
    }

    #[test]
    fn inventory_entry_serializes_kind_as_type() {
        let entry = InventoryEntry {
            name: "web".to_owned(),
            kind: WorkloadKind::Deployment,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["name"], "web");
        assert_eq!(json["type"], "Deployment");
    }

    #[test]
    fn inventory_body_is_a_bare_array() {
        let entries = vec![
            InventoryEntry {
                name: "web".to_owned(),
                kind: WorkloadKind::Deployment,
            },
            InventoryEntry {
                name: "backup".to_owned(),
                kind: WorkloadKind::CronJob,
            },
        ];
        let json = serde_json::to_value(&entries).unwrap();
        assert!(json.is_array());
        assert_eq!(json.as_array().unwrap().len(), 2);
        assert_eq!(json[1]["type"], "CronJob");
    }

    #[test]
    fn dependency_graph_body_field_name() {
        let results: BTreeMap<String, ScanResult> = BTreeMap::new();
        let body = DependencyGraphBody {
            dependency_graph_results: &results,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("dependencyGraphResults").is_some());
    }

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let with = HttpUpstreamClient::new("https://b.example.com/", "i", Duration::from_secs(1))
            .unwrap();
        let without = HttpUpstreamClient::new("https://b.example.com", "i", Duration::from_secs(1))
            .unwrap();
        assert_eq!(
            with.inventory_url("c", "ns"),
            without.inventory_url("c", "ns"),
        );
    }
}
