//! Store outcome to report job translation.
//!
//! The event loop applies workload events to the store and turns the
//! resulting deltas into upstream report jobs. Keeping that translation
//! in pure functions makes the ordering rules testable without a live
//! cluster or backend.
//!
//! # Ordering Rules
//!
//! - A new workload enqueues the namespace inventory replacement first,
//!   then its metadata upsert. The FIFO reporter preserves that order,
//!   so the backend always knows a workload before seeing its metadata.
//! - A removed workload enqueues an inventory replacement reflecting the
//!   post-removal snapshot. Taking the snapshot after the store mutation
//!   keeps a rapid delete-then-recreate sequence consistent.

use podsentry_core::types::ImageReference;
use podsentry_image_scan::ScanReport;
use podsentry_inventory::{StoreDelta, WorkloadStore};
use podsentry_upstream_report::{InventoryEntry, ReportJob};

/// Build the inventory replacement job for one namespace from the
/// store's current snapshot.
fn inventory_job(store: &WorkloadStore, cluster: &str, namespace: &str) -> ReportJob {
    let entries: Vec<InventoryEntry> = store
        .namespace_inventory(namespace)
        .into_iter()
        .map(|(name, kind)| InventoryEntry { name, kind })
        .collect();

    ReportJob::ReplaceInventory {
        cluster: cluster.to_owned(),
        namespace: namespace.to_owned(),
        entries,
    }
}

/// Translate store deltas into report jobs, in delivery order.
///
/// Must be called after the deltas have been applied to `store`, so the
/// inventory snapshots reflect the post-mutation state.
pub fn jobs_for_deltas(store: &WorkloadStore, deltas: &[StoreDelta]) -> Vec<ReportJob> {
    let mut jobs = Vec::new();

    for delta in deltas {
        match delta {
            StoreDelta::Added { locator, metadata } => {
                jobs.push(inventory_job(store, &locator.cluster, &locator.namespace));
                jobs.push(ReportJob::UpsertMetadata {
                    locator: locator.clone(),
                    metadata: metadata.clone(),
                });
            }
            StoreDelta::MetadataChanged { locator, metadata } => {
                jobs.push(ReportJob::UpsertMetadata {
                    locator: locator.clone(),
                    metadata: metadata.clone(),
                });
            }
            StoreDelta::Removed { locator } => {
                jobs.push(inventory_job(store, &locator.cluster, &locator.namespace));
            }
        }
    }

    jobs
}

/// Translate a completed scan into dependency-graph jobs for every
/// workload currently referencing the scanned image.
///
/// Failed or empty scans produce no jobs: the owning workloads stay in
/// the inventory and keep their metadata, just without dependency graphs.
pub fn dependency_graph_jobs(
    store: &WorkloadStore,
    image: &ImageReference,
    report: &ScanReport,
) -> Vec<ReportJob> {
    if !report.success || report.results.is_empty() {
        return Vec::new();
    }

    store
        .workloads_using_image(image)
        .into_iter()
        .map(|locator| ReportJob::UpsertDependencyGraphs {
            locator,
            results: report.results.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use podsentry_core::event::{WorkloadEvent, WorkloadOp};
    use podsentry_core::types::{
        DependencyGraph, ImageMetadata, PackageInfo, PluginInfo, ScanResult, TargetOs,
        WorkloadKind, WorkloadLocator, WorkloadMetadata,
    };

    fn locator(name: &str) -> WorkloadLocator {
        WorkloadLocator::new("prod", "default", WorkloadKind::Deployment, name)
    }

    fn metadata(revision: &str) -> WorkloadMetadata {
        WorkloadMetadata {
            revision: revision.to_owned(),
            ..Default::default()
        }
    }

    fn apply_add(store: &mut WorkloadStore, name: &str, images: &[&str]) -> Vec<StoreDelta> {
        let event = WorkloadEvent::new(
            WorkloadOp::Add,
            locator(name),
            Some(metadata("1")),
            images
                .iter()
                .map(|s| ImageReference::parse(s).unwrap())
                .collect(),
        );
        store.apply(&event).deltas
    }

    fn scan_result() -> ScanResult {
        ScanResult {
            package: PackageInfo {
                package_format_version: "deb:0.0.1".to_owned(),
                target_os: TargetOs::unknown(),
            },
            plugin: PluginInfo {
                package_manager: "deb".to_owned(),
            },
            dependency_graph: DependencyGraph::default(),
            image_metadata: ImageMetadata::default(),
            hashes: Vec::new(),
        }
    }

    #[test]
    fn added_workload_orders_inventory_before_metadata() {
        let mut store = WorkloadStore::new();
        let deltas = apply_add(&mut store, "web", &[]);

        let jobs = jobs_for_deltas(&store, &deltas);
        assert_eq!(jobs.len(), 2);
        assert!(matches!(&jobs[0], ReportJob::ReplaceInventory { entries, .. }
            if entries.len() == 1 && entries[0].name == "web"));
        assert!(matches!(&jobs[1], ReportJob::UpsertMetadata { locator, .. }
            if locator.name == "web"));
    }

    #[test]
    fn removed_workload_uses_post_removal_snapshot() {
        let mut store = WorkloadStore::new();
        apply_add(&mut store, "web", &[]);
        apply_add(&mut store, "api", &[]);

        let delete = WorkloadEvent::new(WorkloadOp::Delete, locator("web"), None, vec![]);
        let deltas = store.apply(&delete).deltas;

        let jobs = jobs_for_deltas(&store, &deltas);
        assert_eq!(jobs.len(), 1);
        assert!(matches!(&jobs[0], ReportJob::ReplaceInventory { entries, .. }
            if entries.len() == 1 && entries[0].name == "api"));
    }

    #[test]
    fn metadata_change_produces_single_upsert() {
        let mut store = WorkloadStore::new();
        apply_add(&mut store, "web", &[]);

        let modify = WorkloadEvent::new(
            WorkloadOp::Modify,
            locator("web"),
            Some(metadata("2")),
            vec![],
        );
        let deltas = store.apply(&modify).deltas;

        let jobs = jobs_for_deltas(&store, &deltas);
        assert_eq!(jobs.len(), 1);
        assert!(matches!(&jobs[0], ReportJob::UpsertMetadata { metadata, .. }
            if metadata.revision == "2"));
    }

    #[test]
    fn scan_fans_out_to_every_owner() {
        let mut store = WorkloadStore::new();
        apply_add(&mut store, "web", &["nginx:1.27"]);
        apply_add(&mut store, "edge", &["nginx:1.27"]);
        apply_add(&mut store, "db", &["postgres:16"]);

        let image = ImageReference::parse("nginx:1.27").unwrap();
        let mut results = BTreeMap::new();
        results.insert("deb".to_owned(), scan_result());
        let report = ScanReport {
            image: image.clone(),
            digest: "sha256:abc".to_owned(),
            results,
            success: true,
        };

        let jobs = dependency_graph_jobs(&store, &image, &report);
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|job| matches!(job,
            ReportJob::UpsertDependencyGraphs { locator, .. }
                if locator.name == "web" || locator.name == "edge")));
    }

    #[test]
    fn failed_scan_produces_no_jobs() {
        let mut store = WorkloadStore::new();
        apply_add(&mut store, "web", &["ghcr.io/corp/app:1"]);

        let image = ImageReference::parse("ghcr.io/corp/app:1").unwrap();
        let report = ScanReport {
            image: image.clone(),
            digest: image.to_string(),
            results: BTreeMap::new(),
            success: false,
        };

        assert!(dependency_graph_jobs(&store, &image, &report).is_empty());
    }
}
