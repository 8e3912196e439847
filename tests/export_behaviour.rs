//! Behavioural coverage for the export lease protocol.

#[path = "common/backup_fixtures.rs"]
mod backup_fixtures;

use std::time::Duration;

use backup_fixtures::{backup_root, fast_settings, run_for};
use rstest::rstest;
use vmbackup::test_support::{MemoryStorage, SCRIPTED_LEASE_ID, ScriptedHypervisor};
use vmbackup::{
    BackupError, BackupOrchestrator, BackupSettings, Destination, DestinationMode, ExportController,
    ExportError, LeaseState,
};

#[tokio::test]
async fn controller_polls_until_ready_and_substitutes_host() {
    let hypervisor = ScriptedHypervisor::new()
        .with_vm("web01", "vm-12")
        .with_lease_states([
            LeaseState::Initializing,
            LeaseState::Initializing,
            LeaseState::Ready,
        ])
        .with_artifact("disk-0.vmdk", 4096)
        .with_artifact("disk-1.vmdk", 0);
    let controller = ExportController::new(&hypervisor, "esxi.test")
        .with_poll_interval(Duration::from_millis(1));

    let vm = controller.find_vm("web01").await.expect("vm should exist");
    let lease = controller.request_lease(&vm).await.expect("lease");
    let urls = controller.wait_until_ready(&lease).await.expect("ready");
    let artifacts = controller
        .enumerate_artifacts(&urls)
        .await
        .expect("artifacts");

    assert_eq!(vm.id, "vm-12");
    assert!(hypervisor.calls().lease_status >= 3);
    let names: Vec<_> = artifacts
        .iter()
        .map(|artifact| artifact.name.as_str())
        .collect();
    assert_eq!(names, vec!["disk-0.vmdk", "disk-1.vmdk"]);
    assert_eq!(
        artifacts.first().map(|artifact| artifact.source_url.as_str()),
        Some(format!("https://esxi.test/nfc/{SCRIPTED_LEASE_ID}/disk-0.vmdk").as_str())
    );
    assert_eq!(artifacts.last().map(|artifact| artifact.size_bytes), Some(0));
}

#[tokio::test]
async fn first_exact_name_match_wins() {
    let hypervisor = ScriptedHypervisor::new()
        .with_vm("web01-old", "vm-1")
        .with_vm("web01", "vm-2")
        .with_vm("web01", "vm-3");
    let controller = ExportController::new(&hypervisor, "esxi.test");

    let vm = controller.find_vm("web01").await.expect("vm should exist");

    assert_eq!(vm.id, "vm-2");
}

#[tokio::test]
async fn initializing_lease_times_out() {
    let hypervisor = ScriptedHypervisor::new()
        .with_vm("web01", "vm-12")
        .with_lease_states([LeaseState::Initializing]);
    let controller = ExportController::new(&hypervisor, "esxi.test")
        .with_poll_interval(Duration::from_millis(5))
        .with_timeout(Duration::from_millis(30));
    let vm = controller.find_vm("web01").await.expect("vm should exist");
    let lease = controller.request_lease(&vm).await.expect("lease");

    let err = controller
        .wait_until_ready(&lease)
        .await
        .expect_err("lease should time out");

    assert!(matches!(err, ExportError::LeaseTimeout { .. }), "got {err:?}");
}

#[tokio::test]
async fn unbounded_timeout_still_waits_for_ready() {
    let hypervisor = ScriptedHypervisor::new()
        .with_vm("web01", "vm-12")
        .with_lease_states([LeaseState::Initializing, LeaseState::Ready])
        .with_artifact("disk-0.vmdk", 4096);
    let controller = ExportController::new(&hypervisor, "esxi.test")
        .with_poll_interval(Duration::from_millis(1))
        .with_timeout(Duration::from_secs(u64::MAX));
    let vm = controller.find_vm("web01").await.expect("vm should exist");
    let lease = controller.request_lease(&vm).await.expect("lease");

    let urls = controller
        .wait_until_ready(&lease)
        .await
        .expect("lease should become ready");

    assert_eq!(urls.len(), 1);
}

#[tokio::test]
async fn failed_size_query_yields_unknown_size() {
    let hypervisor = ScriptedHypervisor::new()
        .with_vm("web01", "vm-12")
        .with_artifact("disk-0.vmdk", 4096)
        .failing_size_queries();
    let controller = ExportController::new(&hypervisor, "esxi.test");
    let vm = controller.find_vm("web01").await.expect("vm should exist");
    let lease = controller.request_lease(&vm).await.expect("lease");
    let urls = controller.wait_until_ready(&lease).await.expect("ready");

    let artifacts = controller
        .enumerate_artifacts(&urls)
        .await
        .expect("size failures should not abort enumeration");

    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts.first().map(|artifact| artifact.size_bytes), Some(0));
}

#[tokio::test]
async fn run_downloads_artifacts_whose_size_is_unknown() {
    let root = backup_root();
    let run = run_for("web01", DestinationMode::File, &root);
    let hypervisor = ScriptedHypervisor::new()
        .with_vm("web01", "vm-12")
        .with_artifact("disk-0.vmdk", 4096)
        .failing_size_queries();

    let summary = BackupOrchestrator::new(
        hypervisor.clone(),
        Destination::<MemoryStorage>::Local,
        "esxi.test",
    )
    .with_settings(fast_settings())
    .execute(&run)
    .await
    .expect("unknown sizes should not abort the run");

    assert!(summary.transfer.is_complete());
    assert_eq!(summary.transfer.total_bytes(), 4096);
    let disk = root
        .path
        .join("web01_2024-01-15_14-30-00")
        .join("disk-0.vmdk");
    assert_eq!(std::fs::metadata(disk).map(|meta| meta.len()).ok(), Some(4096));
}

#[rstest]
#[case::reported_error(
    LeaseState::Error(Some(String::from("disk locked"))),
    "disk locked"
)]
#[case::silent_error(LeaseState::Error(None), "unknown lease error")]
#[case::already_done(LeaseState::Done, "lease finished before it became ready")]
#[tokio::test]
async fn failed_lease_is_completed_exactly_once(
    #[case] state: LeaseState,
    #[case] message: &str,
) {
    let root = backup_root();
    let run = run_for("web01", DestinationMode::File, &root);
    let hypervisor = ScriptedHypervisor::new()
        .with_vm("web01", "vm-12")
        .with_lease_states([LeaseState::Initializing, state])
        .with_artifact("disk-0.vmdk", 1024);

    let err = BackupOrchestrator::new(
        hypervisor.clone(),
        Destination::<MemoryStorage>::Local,
        "esxi.test",
    )
    .with_settings(fast_settings())
    .execute(&run)
    .await
    .expect_err("lease failure should abort");

    let BackupError::LeaseFailed { message: ref reported } = err else {
        panic!("expected LeaseFailed, got {err:?}");
    };
    assert_eq!(reported, message);
    let calls = hypervisor.calls();
    assert_eq!(calls.complete_lease, 1);
    assert_eq!(calls.disconnect, 1);
    assert_eq!(calls.open_artifact, 0);
}

#[tokio::test]
async fn unknown_vm_releases_session_without_lease() {
    let root = backup_root();
    let run = run_for("missing", DestinationMode::File, &root);
    let hypervisor = ScriptedHypervisor::new().with_vm("web01", "vm-12");

    let err = BackupOrchestrator::new(
        hypervisor.clone(),
        Destination::<MemoryStorage>::Local,
        "esxi.test",
    )
    .with_settings(fast_settings())
    .execute(&run)
    .await
    .expect_err("unknown vm should fail");

    assert!(
        matches!(err, BackupError::VmNotFound { ref name } if name == "missing"),
        "got {err:?}"
    );
    let calls = hypervisor.calls();
    assert_eq!(calls.export_vm, 0);
    assert_eq!(calls.complete_lease, 0);
    assert_eq!(calls.disconnect, 1);
}

#[tokio::test]
async fn lease_timeout_through_orchestrator_releases_lease() {
    let root = backup_root();
    let run = run_for("web01", DestinationMode::File, &root);
    let hypervisor = ScriptedHypervisor::new()
        .with_vm("web01", "vm-12")
        .with_lease_states([LeaseState::Initializing]);
    let settings = BackupSettings {
        lease_timeout_secs: 1,
        lease_poll_interval_ms: 50,
        ..fast_settings()
    };

    let err = BackupOrchestrator::new(
        hypervisor.clone(),
        Destination::<MemoryStorage>::Local,
        "esxi.test",
    )
    .with_settings(settings)
    .execute(&run)
    .await
    .expect_err("lease should time out");

    assert!(
        matches!(err, BackupError::LeaseTimeout { .. }),
        "got {err:?}"
    );
    assert_eq!(hypervisor.calls().complete_lease, 1);
}

#[tokio::test]
async fn teardown_failure_is_appended_to_primary_error() {
    let root = backup_root();
    let run = run_for("web01", DestinationMode::File, &root);
    let hypervisor = ScriptedHypervisor::new()
        .with_vm("web01", "vm-12")
        .with_lease_states([LeaseState::Error(Some(String::from("disk locked")))])
        .failing_completion();

    let err = BackupOrchestrator::new(
        hypervisor.clone(),
        Destination::<MemoryStorage>::Local,
        "esxi.test",
    )
    .with_settings(fast_settings())
    .execute(&run)
    .await
    .expect_err("lease failure should abort");

    let rendered = err.to_string();
    assert!(
        rendered.starts_with("export lease failed: disk locked"),
        "{rendered}"
    );
    assert!(
        rendered.contains("(teardown also failed: lease completion"),
        "{rendered}"
    );
    assert_eq!(hypervisor.calls().complete_lease, 1);
    assert_eq!(hypervisor.calls().disconnect, 1);
}

#[tokio::test]
async fn connect_failure_attempts_no_teardown() {
    let root = backup_root();
    let run = run_for("web01", DestinationMode::File, &root);
    let hypervisor = ScriptedHypervisor::new().failing_connect();

    let err = BackupOrchestrator::new(
        hypervisor.clone(),
        Destination::<MemoryStorage>::Local,
        "esxi.test",
    )
    .with_settings(fast_settings())
    .execute(&run)
    .await
    .expect_err("connect failure should abort");

    assert!(
        matches!(err, BackupError::Hypervisor { action: "connect", .. }),
        "got {err:?}"
    );
    let calls = hypervisor.calls();
    assert_eq!(calls.list_vms, 0);
    assert_eq!(calls.disconnect, 0);
}
