//! End-to-end event flow tests.
//!
//! Exercises the daemon's wiring path with real modules where possible:
//! workload events applied to a real `WorkloadStore`, translated through
//! `wiring`, and delivered by a real `UpstreamReporter` to a recording
//! mock backend. Only the cluster API and the image registry are mocked
//! out (their module-level behavior is covered in their own crates).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use podsentry_core::event::{WorkloadEvent, WorkloadOp};
use podsentry_core::pipeline::Pipeline;
use podsentry_core::types::{
    DependencyGraph, DependencyPackage, ImageMetadata, ImageReference, PackageInfo, PluginInfo,
    ScanResult, TargetOs, WorkloadKind, WorkloadLocator, WorkloadMetadata,
};
use podsentry_daemon::wiring;
use podsentry_image_scan::ScanReport;
use podsentry_inventory::WorkloadStore;
use podsentry_upstream_report::{
    InventoryEntry, UpstreamClient, UpstreamReportError, UpstreamReporterBuilder,
};

/// Records every successful upstream call in order.
#[derive(Default)]
struct RecordingBackend {
    calls: Mutex<Vec<String>>,
}

impl RecordingBackend {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl UpstreamClient for RecordingBackend {
    async fn replace_inventory(
        &self,
        _cluster: &str,
        namespace: &str,
        workloads: &[InventoryEntry],
    ) -> Result<(), UpstreamReportError> {
        let names: Vec<&str> = workloads.iter().map(|e| e.name.as_str()).collect();
        self.calls
            .lock()
            .unwrap()
            .push(format!("inventory {namespace} [{}]", names.join(",")));
        Ok(())
    }

    async fn upsert_metadata(
        &self,
        locator: &WorkloadLocator,
        metadata: &WorkloadMetadata,
    ) -> Result<(), UpstreamReportError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("metadata {} rev={}", locator.name, metadata.revision));
        Ok(())
    }

    async fn upsert_dependency_graphs(
        &self,
        locator: &WorkloadLocator,
        results: &BTreeMap<String, ScanResult>,
    ) -> Result<(), UpstreamReportError> {
        let keys: Vec<&str> = results.keys().map(String::as_str).collect();
        self.calls
            .lock()
            .unwrap()
            .push(format!("graphs {} [{}]", locator.name, keys.join(",")));
        Ok(())
    }
}

fn locator(name: &str) -> WorkloadLocator {
    WorkloadLocator::new("prod", "default", WorkloadKind::Deployment, name)
}

fn add_event(name: &str, revision: &str, images: &[&str]) -> WorkloadEvent {
    WorkloadEvent::new(
        WorkloadOp::Add,
        locator(name),
        Some(WorkloadMetadata {
            revision: revision.to_owned(),
            ..Default::default()
        }),
        images
            .iter()
            .map(|s| ImageReference::parse(s).unwrap())
            .collect(),
    )
}

fn deb_scan_result(packages: &[(&str, &str)]) -> ScanResult {
    ScanResult {
        package: PackageInfo {
            package_format_version: "deb:0.0.1".to_owned(),
            target_os: TargetOs::unknown(),
        },
        plugin: PluginInfo {
            package_manager: "deb".to_owned(),
        },
        dependency_graph: DependencyGraph {
            packages: packages
                .iter()
                .map(|(name, version)| DependencyPackage {
                    name: (*name).to_owned(),
                    version: (*version).to_owned(),
                })
                .collect(),
        },
        image_metadata: ImageMetadata::default(),
        hashes: Vec::new(),
    }
}

async fn wait_for_calls(backend: &RecordingBackend, count: usize) {
    for _ in 0..200 {
        if backend.calls().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {count} upstream calls, got {:?}",
        backend.calls()
    );
}

#[tokio::test]
async fn workload_lifecycle_reports_in_order() {
    let backend = Arc::new(RecordingBackend::default());
    let (mut reporter, job_tx) = UpstreamReporterBuilder::new()
        .client(Arc::clone(&backend))
        .build()
        .unwrap();
    reporter.start().await.unwrap();

    let mut store = WorkloadStore::new();

    // New workload: inventory replacement must precede metadata upsert
    let outcome = store.apply(&add_event("web", "1", &["nginx:1.27"]));
    for job in wiring::jobs_for_deltas(&store, &outcome.deltas) {
        job_tx.send(job).await.unwrap();
    }

    // Revision bump: metadata-only delta
    let modify = WorkloadEvent::new(
        WorkloadOp::Modify,
        locator("web"),
        Some(WorkloadMetadata {
            revision: "2".to_owned(),
            ..Default::default()
        }),
        vec![ImageReference::parse("nginx:1.27").unwrap()],
    );
    let outcome = store.apply(&modify);
    for job in wiring::jobs_for_deltas(&store, &outcome.deltas) {
        job_tx.send(job).await.unwrap();
    }

    // Deletion: eager inventory replacement with the emptied namespace
    let delete = WorkloadEvent::new(WorkloadOp::Delete, locator("web"), None, vec![]);
    let outcome = store.apply(&delete);
    for job in wiring::jobs_for_deltas(&store, &outcome.deltas) {
        job_tx.send(job).await.unwrap();
    }

    wait_for_calls(&backend, 4).await;
    reporter.stop().await.unwrap();

    assert_eq!(
        backend.calls(),
        vec![
            "inventory default [web]",
            "metadata web rev=1",
            "metadata web rev=2",
            "inventory default []",
        ]
    );
}

#[tokio::test]
async fn scan_results_reach_every_owner() {
    let backend = Arc::new(RecordingBackend::default());
    let (mut reporter, job_tx) = UpstreamReporterBuilder::new()
        .client(Arc::clone(&backend))
        .build()
        .unwrap();
    reporter.start().await.unwrap();

    let mut store = WorkloadStore::new();
    store.apply(&add_event("web", "1", &["nginx:1.27"]));
    store.apply(&add_event("edge", "1", &["nginx:1.27"]));

    let image = ImageReference::parse("nginx:1.27").unwrap();
    let mut results = BTreeMap::new();
    results.insert("deb".to_owned(), deb_scan_result(&[("libc6", "2.36-9")]));
    let report = ScanReport {
        image: image.clone(),
        digest: "sha256:abc".to_owned(),
        results,
        success: true,
    };

    for job in wiring::dependency_graph_jobs(&store, &image, &report) {
        job_tx.send(job).await.unwrap();
    }

    wait_for_calls(&backend, 2).await;
    reporter.stop().await.unwrap();

    let calls = backend.calls();
    assert!(calls.contains(&"graphs web [deb]".to_owned()));
    assert!(calls.contains(&"graphs edge [deb]".to_owned()));
}

#[tokio::test]
async fn duplicate_events_do_not_duplicate_reports() {
    let backend = Arc::new(RecordingBackend::default());
    let (mut reporter, job_tx) = UpstreamReporterBuilder::new()
        .client(Arc::clone(&backend))
        .build()
        .unwrap();
    reporter.start().await.unwrap();

    let mut store = WorkloadStore::new();
    let event = add_event("web", "1", &["nginx:1.27"]);

    for _ in 0..3 {
        let outcome = store.apply(&event);
        for job in wiring::jobs_for_deltas(&store, &outcome.deltas) {
            job_tx.send(job).await.unwrap();
        }
    }

    wait_for_calls(&backend, 2).await;
    reporter.stop().await.unwrap();

    // Only the first apply produced report jobs
    assert_eq!(backend.calls().len(), 2);
}

#[tokio::test]
async fn failed_scan_produces_no_graph_calls() {
    let mut store = WorkloadStore::new();
    store.apply(&add_event("web", "1", &["ghcr.io/corp/app:1"]));

    let image = ImageReference::parse("ghcr.io/corp/app:1").unwrap();
    let report = ScanReport {
        image: image.clone(),
        digest: image.to_string(),
        results: BTreeMap::new(),
        success: false,
    };

    assert!(wiring::dependency_graph_jobs(&store, &image, &report).is_empty());
}
