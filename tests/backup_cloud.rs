//! Behavioural coverage for cloud-mode backups.

#[path = "common/backup_fixtures.rs"]
mod backup_fixtures;

use backup_fixtures::{SMALL_DISK_BYTES, backup_root, fast_settings, run_for};
use vmbackup::test_support::{MemoryStorage, ScriptedHypervisor};
use vmbackup::{
    BackupError, BackupOrchestrator, Destination, DestinationMode, Finalization, PreflightError,
    StorageError,
};

const REMOTE_DIR: &str = "vm-backups/esxi";
const ARCHIVE_NAME: &str = "web01_2024-01-15_14-30-00.tar.gz";

fn hypervisor() -> ScriptedHypervisor {
    ScriptedHypervisor::new()
        .with_vm("web01", "vm-12")
        .with_artifact("web01-disk-0.vmdk", SMALL_DISK_BYTES)
}

fn cloud(storage: &MemoryStorage) -> Destination<MemoryStorage> {
    Destination::Cloud {
        storage: storage.clone(),
        remote_dir: REMOTE_DIR.to_owned(),
    }
}

#[tokio::test]
async fn cloud_mode_uploads_archive_and_removes_local_copies() {
    let root = backup_root();
    let run = run_for("web01", DestinationMode::Cloud, &root);
    let hypervisor = hypervisor();
    let storage = MemoryStorage::new();

    let summary = BackupOrchestrator::new(hypervisor.clone(), cloud(&storage), "esxi.test")
        .with_settings(fast_settings())
        .execute(&run)
        .await
        .expect("cloud backup should succeed");

    let remote_path = format!("{REMOTE_DIR}/{ARCHIVE_NAME}");
    assert_eq!(
        summary.finalization,
        Finalization::Uploaded {
            archive_name: ARCHIVE_NAME.to_owned(),
            remote_path: remote_path.clone(),
        }
    );
    assert!(storage.has_dir(REMOTE_DIR));
    let files = storage.files();
    assert_eq!(files.keys().collect::<Vec<_>>(), vec![&remote_path]);
    assert!(files.get(&remote_path).is_some_and(|size| *size > 0));

    assert!(!root.path.join("web01_2024-01-15_14-30-00").exists());
    assert!(!root.path.join(ARCHIVE_NAME).exists());
    let leftovers: Vec<_> = std::fs::read_dir(&root.path)
        .expect("backup root should exist")
        .collect();
    assert!(leftovers.is_empty(), "leftovers: {leftovers:?}");
    assert_eq!(hypervisor.calls().complete_lease, 1);
}

#[tokio::test]
async fn upload_failure_keeps_archive_and_run_directory() {
    let root = backup_root();
    let run = run_for("web01", DestinationMode::Cloud, &root);
    let hypervisor = hypervisor();
    let storage = MemoryStorage::new()
        .with_dir(REMOTE_DIR)
        .failing_uploads_ending_with(".tar.gz");

    let err = BackupOrchestrator::new(hypervisor.clone(), cloud(&storage), "esxi.test")
        .with_settings(fast_settings())
        .execute(&run)
        .await
        .expect_err("upload failure should be fatal");

    let BackupError::Upload {
        ref archive,
        ref source,
    } = err
    else {
        panic!("expected Upload, got {err:?}");
    };
    assert_eq!(archive, &root.path.join(ARCHIVE_NAME));
    assert!(matches!(source, StorageError::Status { code: 507, .. }));
    assert!(root.path.join(ARCHIVE_NAME).exists());
    assert!(
        root.path
            .join("web01_2024-01-15_14-30-00")
            .join("web01-disk-0.vmdk")
            .exists()
    );
    assert_eq!(hypervisor.calls().complete_lease, 1);
    assert_eq!(hypervisor.calls().disconnect, 1);
}

#[tokio::test]
async fn preflight_failure_stops_before_hypervisor_login() {
    let root = backup_root();
    let run = run_for("web01", DestinationMode::Cloud, &root);
    let hypervisor = hypervisor();
    let storage = MemoryStorage::new().unreachable();

    let err = BackupOrchestrator::new(hypervisor.clone(), cloud(&storage), "esxi.test")
        .with_settings(fast_settings())
        .execute(&run)
        .await
        .expect_err("unreachable storage should abort");

    assert!(
        matches!(err, BackupError::Preflight(PreflightError::Unreachable { .. })),
        "got {err:?}"
    );
    let calls = hypervisor.calls();
    assert_eq!(calls.connect, 0);
    assert_eq!(calls.complete_lease, 0);
    assert_eq!(calls.disconnect, 0);
    assert!(!root.path.exists(), "backup root should not be created");
}
