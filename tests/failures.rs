use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Error};

use vmb_api_types::{backup_error, BackupConfig, BackupError, BackupStatus, RestoreStatus};
use vmb_datastore::{MemoryStore, MetadataStore};

use vmbackup::disk::MemoryDisk;
use vmbackup::{AbortHandle, BackupJob, BackupState, RestoreJob, RestoreRequest, RestoreState};

mod common;
use common::*;

fn expect_error<T>(result: Result<T, Error>) -> Result<Error, Error> {
    match result {
        Ok(_) => bail!("operation succeeded unexpectedly"),
        Err(err) => Ok(err),
    }
}

#[tokio::test]
async fn failed_uploads_do_not_become_baseline() -> Result<(), Error> {
    init_logger();

    let memory = Arc::new(MemoryStore::new());
    let metadata = MetadataStore::new(memory.clone(), layout()?);
    let disk = eight_block_disk()?;
    run_backup(disk.clone(), &metadata, keyring()?, request("good", false, "")).await?;

    let faulty = Arc::new(FaultyStore::failing(Arc::clone(&memory)));
    let broken = MetadataStore::new(faulty.clone(), layout()?);

    disk.write_at(BLOCK_SIZE, &block_data(77))?;
    let err = expect_error(run_backup(disk, &broken, keyring()?, request("bad", true, "")).await)?;
    assert!(matches!(
        backup_error(&err),
        Some(BackupError::Upload { .. })
    ));
    // first attempt plus max_retries
    assert!(faulty.attempts() >= 3);

    assert_eq!(
        metadata.get_backup_record("bad").await?.status,
        BackupStatus::Error
    );
    let volume = metadata.get_volume_record().await?;
    assert_eq!(volume.backup_ids, vec!["good"]);
    match metadata.get_latest_backup_for("vol1").await? {
        Some(latest) => assert_eq!(latest.backup_id, "good"),
        None => bail!("lost the valid baseline"),
    }

    Ok(())
}

#[tokio::test]
async fn read_errors_are_retried() -> Result<(), Error> {
    init_logger();

    let metadata = MetadataStore::new(Arc::new(MemoryStore::new()), layout()?);
    let disk = eight_block_disk()?;

    // max_retries is 2, so two failures in a row are tolerated
    disk.inject_read_errors(3 * BLOCK_SIZE + 10, 2);
    let outcome = run_backup(disk.clone(), &metadata, keyring()?, request("r1", false, "")).await?;
    assert_eq!(outcome.record.status, BackupStatus::Complete);
    assert_eq!(outcome.record.block_table.len(), 6);

    disk.inject_read_errors(4 * BLOCK_SIZE, 3);
    let err = expect_error(run_backup(disk, &metadata, keyring()?, request("r2", false, "")).await)?;
    match backup_error(&err) {
        Some(BackupError::Io { index, .. }) => assert_eq!(*index, 4),
        _ => bail!("unexpected error - {}", err),
    }
    assert_eq!(
        metadata.get_backup_record("r2").await?.status,
        BackupStatus::Error
    );
    assert_eq!(metadata.get_volume_record().await?.backup_ids, vec!["r1"]);

    Ok(())
}

#[tokio::test]
async fn abort_stops_the_run() -> Result<(), Error> {
    init_logger();

    let metadata = MetadataStore::new(Arc::new(MemoryStore::new()), layout()?);
    let disk = eight_block_disk()?;

    let abort = AbortHandle::new();
    let aborting = Arc::new(AbortingDisk {
        inner: disk.clone(),
        abort: abort.clone(),
        abort_at: 3,
    });
    let mut job = BackupJob::new(aborting, metadata.clone(), keyring()?, test_config())?
        .with_abort_handle(abort.clone());

    let err = expect_error(job.run(request("a1", false, "")).await)?;
    assert!(matches!(backup_error(&err), Some(BackupError::Aborted)));
    assert_eq!(job.state(), BackupState::Error);
    assert_eq!(
        metadata.get_backup_record("a1").await?.status,
        BackupStatus::Error
    );
    assert!(metadata.get_volume_record().await?.backup_ids.is_empty());

    // an aborted handle refuses to start
    let mut job = BackupJob::new(disk, metadata.clone(), keyring()?, test_config())?
        .with_abort_handle(abort);
    let err = expect_error(job.run(request("a2", false, "")).await)?;
    assert!(matches!(backup_error(&err), Some(BackupError::Aborted)));

    Ok(())
}

#[tokio::test]
async fn watchdog_detects_stalled_uploads() -> Result<(), Error> {
    init_logger();

    let memory = Arc::new(MemoryStore::new());
    let hanging = Arc::new(FaultyStore::hanging(Arc::clone(&memory)));
    let metadata = MetadataStore::new(hanging.clone(), layout()?);
    let disk = eight_block_disk()?;

    let config = BackupConfig {
        pool_capacity: 2,
        worker_threads: 1,
        watchdog_timeout_ms: Some(200),
        ..test_config()
    };
    let mut job = BackupJob::new(disk, metadata.clone(), keyring()?, config)?;

    let start = Instant::now();
    let err = expect_error(job.run(request("s1", false, "")).await)?;
    assert!(matches!(
        backup_error(&err),
        Some(BackupError::Stalled(_))
    ));
    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(hanging.attempts() >= 1);

    assert_eq!(
        metadata.get_backup_record("s1").await?.status,
        BackupStatus::Error
    );

    Ok(())
}

#[tokio::test]
async fn restore_completion_write_failure_is_recorded() -> Result<(), Error> {
    init_logger();

    let memory = Arc::new(MemoryStore::new());
    let metadata = MetadataStore::new(memory.clone(), layout()?);
    run_backup(eight_block_disk()?, &metadata, keyring()?, request("t1", false, "")).await?;

    // the second task write stores the complete state
    let store = Arc::new(TaskWriteStore::failing_at(memory, 2));
    let broken = MetadataStore::new(store, layout()?);
    let mut job = RestoreJob::new(broken, keyring()?, test_config())?;
    let result = job
        .run(
            Arc::new(MemoryDisk::new(8 * BLOCK_SIZE)),
            RestoreRequest {
                restore_id: Some("t1-restore".to_string()),
                backup_id: "t1".to_string(),
            },
        )
        .await;

    assert!(result.is_err());
    assert_eq!(job.state(), RestoreState::Error);
    assert_eq!(
        metadata.get_restore_task("t1-restore").await?.status,
        RestoreStatus::Error
    );

    Ok(())
}

#[test]
fn invalid_config_is_rejected() -> Result<(), Error> {
    let metadata = MetadataStore::new(Arc::new(MemoryStore::new()), layout()?);
    let disk = eight_block_disk()?;

    let config = BackupConfig {
        block_size: 1000,
        ..test_config()
    };
    assert!(BackupJob::new(disk.clone(), metadata.clone(), keyring()?, config).is_err());

    let config = BackupConfig {
        pool_capacity: 0,
        ..test_config()
    };
    assert!(BackupJob::new(disk, metadata, keyring()?, config).is_err());

    Ok(())
}
