use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fieldsync_core::{EntityKind, EntityPayload, FieldPayload, ParentId, SyncState};
use fieldsync_engine::{DiscardOutcome, GatewayError, PassOutcome, RowStatus, SyncConfig};
use fieldsync_harness::{farm, test_config, user, CallKind, InMemoryRemote, TestDevice};
use fieldsync_storage::SqliteCache;

fn device_with(config: SyncConfig) -> Result<TestDevice, Box<dyn std::error::Error>> {
    Ok(TestDevice::build(
        user("user-u"),
        Arc::new(SqliteCache::open_in_memory()?),
        Arc::new(InMemoryRemote::new()),
        true,
        config,
    ))
}

// ============================================================================
// Ordering and deferral
// ============================================================================

#[tokio::test]
async fn children_wait_for_their_parent() -> Result<(), Box<dyn std::error::Error>> {
    let device = TestDevice::new("user-u")?;
    let home = device.create_farm("Home").await?;
    let north = device.create_field(&home, "North").await?;
    device.remote.fail_next(CallKind::Create, GatewayError::transient("connection reset"));

    let report = device.sync().await?;
    assert_eq!(report.retryable, 1);
    assert_eq!(report.deferred, 1);
    assert_eq!(device.remote.count(CallKind::Create), 1);
    assert_eq!(device.stored(north.local_id)?.ok_or("missing")?.attempts, 0);

    // Zero backoff in the test config: the next pass retries right away.
    let report = device.sync().await?;
    assert_eq!(report.committed, 2);
    let stored = device.stored(north.local_id)?.ok_or("missing")?;
    let farm_remote = device.stored(home.local_id)?.and_then(|e| e.remote_id).ok_or("farm not synced")?;
    let record = device.remote.record(stored.remote_id.as_ref().ok_or("field not synced")?).ok_or("not on remote")?;
    assert_eq!(record.parent, Some(farm_remote));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn concurrency_is_bounded() -> Result<(), Box<dyn std::error::Error>> {
    let device = device_with(SyncConfig {
        max_concurrency: 2,
        ..test_config()
    })?;
    for i in 0..6 {
        device.create_farm(&format!("Farm {i}")).await?;
    }
    device.remote.set_latency(Some(Duration::from_millis(100)));

    let started = tokio::time::Instant::now();
    let report = device.sync().await?;
    let elapsed = started.elapsed();

    assert_eq!(report.committed, 6);
    assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(600), "{elapsed:?}");
    Ok(())
}

// ============================================================================
// Failure classification
// ============================================================================

#[tokio::test]
async fn transient_failures_back_off() -> Result<(), Box<dyn std::error::Error>> {
    let device = device_with(SyncConfig {
        periodic_interval_secs: None,
        sync_on_write: false,
        ..SyncConfig::default()
    })?;
    let home = device.create_farm("Home").await?;
    device.remote.fail_next(CallKind::Create, GatewayError::transient("503"));

    let report = device.sync().await?;
    assert_eq!(report.retryable, 1);
    let stored = device.stored(home.local_id)?.ok_or("missing")?;
    assert_eq!(stored.attempts, 1);
    assert_eq!(stored.sync_state, SyncState::PendingCreate);
    assert!(stored.sync_error.is_none());
    let retry_after = stored.retry_after.ok_or("no backoff scheduled")?;
    assert!(retry_after > Utc::now() + chrono::Duration::seconds(3));

    // Still inside the window: left alone.
    let report = device.sync().await?;
    assert_eq!(report.attempted(), 0);
    assert_eq!(device.remote.count(CallKind::Create), 1);

    // Requeue skips the wait.
    device.service.requeue(home.local_id)?;
    let report = device.sync().await?;
    assert_eq!(report.committed, 1);
    let stored = device.stored(home.local_id)?.ok_or("missing")?;
    assert_eq!(stored.attempts, 0);
    assert!(stored.retry_after.is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn slow_responses_time_out_as_retryable() -> Result<(), Box<dyn std::error::Error>> {
    let device = TestDevice::new("user-u")?;
    let home = device.create_farm("Home").await?;
    device.remote.set_latency(Some(Duration::from_secs(2)));

    let report = device.sync().await?;
    assert_eq!(report.retryable, 1);
    assert_eq!(device.stored(home.local_id)?.ok_or("missing")?.attempts, 1);
    assert!(device.remote.records_of(&device.user, EntityKind::Farm).is_empty());

    device.remote.set_latency(None);
    let report = device.sync().await?;
    assert_eq!(report.committed, 1);
    assert_eq!(device.remote.records_of(&device.user, EntityKind::Farm).len(), 1);
    Ok(())
}

#[tokio::test]
async fn validation_failures_wait_for_the_user() -> Result<(), Box<dyn std::error::Error>> {
    let device = TestDevice::new("user-u")?;
    let home = device.create_farm("Home").await?;
    device
        .remote
        .fail_next(CallKind::Create, GatewayError::validation("name too long"));

    let report = device.sync().await?;
    assert_eq!(report.permanent, 1);
    let failed = device.service.failed_entities()?;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].status, RowStatus::Failed("name too long".into()));

    // Not retried automatically.
    let report = device.sync().await?;
    assert_eq!(report.attempted(), 0);
    assert_eq!(device.remote.count(CallKind::Create), 1);

    let requeued = device.service.requeue(home.local_id)?;
    assert!(requeued.sync_error.is_none());
    let report = device.sync().await?;
    assert_eq!(report.committed, 1);
    assert!(device.service.failed_entities()?.is_empty());
    Ok(())
}

#[tokio::test]
async fn schema_rejection_falls_back_to_mandatory_fields_once() -> Result<(), Box<dyn std::error::Error>> {
    let device = TestDevice::new("user-u")?;
    device.remote.reject_field_columns(&["soil_type"]);
    let home = device.create_farm("Home").await?;
    let mut payload = FieldPayload::named("North");
    payload.soil_type = Some("loam".into());
    payload.size = Some(4.0);
    let north = device
        .service
        .create_entity(EntityPayload::Field(payload.clone()), &device.user, ParentId::Local(home.local_id))
        .await?;

    let report = device.sync().await?;
    assert_eq!(report.committed, 1);
    assert_eq!(report.permanent, 1);
    // Farm, rejected field, narrowed field.
    assert_eq!(device.remote.count(CallKind::Create), 3);

    let stored = device.stored(north.local_id)?.ok_or("missing")?;
    assert_eq!(stored.sync_state, SyncState::PendingUpdate);
    let remote_id = stored.remote_id.clone().ok_or("narrowed create not recorded")?;
    assert!(stored.sync_error.as_deref().is_some_and(|e| e.contains("soil_type")));
    assert_eq!(stored.payload, EntityPayload::Field(payload.clone()));
    let record = device.remote.record(&remote_id).ok_or("not on remote")?;
    assert_eq!(record.payload, EntityPayload::Field(FieldPayload::named("North")));

    // The user drops the offending field; the edit clears the error and is
    // pushed as an update of the existing record.
    payload.soil_type = None;
    device
        .service
        .update_entity(north.local_id, &north.parent_id, EntityPayload::Field(payload.clone()))
        .await?;
    let report = device.sync().await?;
    assert_eq!(report.committed, 1);
    assert_eq!(device.remote.count(CallKind::Create), 3);
    let record = device.remote.record(&remote_id).ok_or("not on remote")?;
    assert_eq!(record.payload, EntityPayload::Field(payload));
    Ok(())
}

#[tokio::test]
async fn remote_delete_of_missing_record_counts_as_done() -> Result<(), Box<dyn std::error::Error>> {
    let device = TestDevice::new("user-u")?;
    let home = device.create_farm("Home").await?;
    device.sync().await?;
    let remote_id = device.stored(home.local_id)?.and_then(|e| e.remote_id).ok_or("not synced")?;

    device.remote.drop_record(&remote_id);
    device.service.delete_entity(home.local_id, &home.parent_id).await?;
    let report = device.sync().await?;
    assert_eq!(report.committed, 1);
    assert_eq!(device.remote.count(CallKind::Delete), 0);
    assert!(device.stored(home.local_id)?.is_none());
    Ok(())
}

#[tokio::test]
async fn unverifiable_parent_is_retried_later() -> Result<(), Box<dyn std::error::Error>> {
    let device = TestDevice::new("user-u")?;
    let home = device.create_farm("Home").await?;
    device.sync().await?;
    let north = device.create_field(&home, "North").await?;
    device.remote.fail_next(CallKind::Get, GatewayError::transient("timeout"));

    let report = device.sync().await?;
    assert_eq!(report.retryable, 1);
    assert_eq!(device.remote.count(CallKind::Create), 1);
    assert!(device.stored(north.local_id)?.ok_or("missing")?.sync_error.is_none());

    let report = device.sync().await?;
    assert_eq!(report.committed, 1);
    Ok(())
}

// ============================================================================
// Discard
// ============================================================================

#[tokio::test]
async fn discard_restores_the_remote_copy() -> Result<(), Box<dyn std::error::Error>> {
    let device = TestDevice::new("user-u")?;
    let home = device.create_farm("Home").await?;
    device.sync().await?;

    device.service.update_entity(home.local_id, &home.parent_id, farm("Bad name")).await?;
    device.remote.fail_next(CallKind::Update, GatewayError::validation("rejected"));
    device.sync().await?;
    assert_eq!(device.service.failed_entities()?.len(), 1);

    match device.service.discard(home.local_id).await? {
        DiscardOutcome::Restored(entity) => {
            assert_eq!(entity.payload.label(), "Home");
            assert_eq!(entity.sync_state, SyncState::Synced);
            assert!(entity.sync_error.is_none());
        }
        other => panic!("expected restore, got {other:?}"),
    }
    assert!(device.service.failed_entities()?.is_empty());
    assert_eq!(device.service.pending_count()?, 0);
    Ok(())
}

#[tokio::test]
async fn discard_of_unsynced_entity_removes_it() -> Result<(), Box<dyn std::error::Error>> {
    let device = TestDevice::with_remote("user-u", Arc::new(InMemoryRemote::new()), false)?;
    let home = device.create_farm("Home").await?;
    assert_eq!(device.service.discard(home.local_id).await?, DiscardOutcome::Removed);
    assert!(device.stored(home.local_id)?.is_none());
    Ok(())
}

// ============================================================================
// Passes and races
// ============================================================================

#[tokio::test(start_paused = true)]
async fn overlapping_passes_coalesce() -> Result<(), Box<dyn std::error::Error>> {
    let device = TestDevice::new("user-u")?;
    device.create_farm("Home").await?;
    device.remote.set_latency(Some(Duration::from_millis(100)));

    let reconciler = device.service.reconciler();
    let (first, second) = tokio::join!(reconciler.run_pass(), reconciler.run_pass());
    let mut outcomes = [first?, second?];
    outcomes.sort_by_key(|o| matches!(o, PassOutcome::Completed(_)));
    assert_eq!(outcomes[0], PassOutcome::Coalesced);
    assert!(
        matches!(&outcomes[1], PassOutcome::Completed(r) if r.committed == 1),
        "{:?}",
        outcomes[1]
    );
    assert_eq!(device.remote.count(CallKind::Create), 1);
    Ok(())
}

#[tokio::test]
async fn offline_pass_does_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let device = TestDevice::with_remote("user-u", Arc::new(InMemoryRemote::new()), false)?;
    device.create_farm("Home").await?;
    assert_eq!(device.service.reconciler().run_pass().await?, PassOutcome::Offline);
    assert!(device.remote.calls().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn delete_during_in_flight_create_removes_the_orphan() -> Result<(), Box<dyn std::error::Error>> {
    let device = TestDevice::new("user-u")?;
    let home = device.create_farm("Home").await?;
    device.remote.set_latency(Some(Duration::from_secs(1)));

    let (pass, _abort) = device.service.sync_now();
    let task = tokio::spawn(pass);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(device.remote.count(CallKind::Create), 1);

    device.service.delete_entity(home.local_id, &home.parent_id).await?;
    let outcome = task.await??;
    match outcome? {
        PassOutcome::Completed(report) => assert_eq!(report.compensated, 1),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(device.remote.records_of(&device.user, EntityKind::Farm).is_empty());
    assert!(device.stored(home.local_id)?.is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn edit_during_in_flight_create_stays_pending() -> Result<(), Box<dyn std::error::Error>> {
    let device = TestDevice::new("user-u")?;
    let home = device.create_farm("Home").await?;
    device.remote.set_latency(Some(Duration::from_secs(1)));

    let (pass, _abort) = device.service.sync_now();
    let task = tokio::spawn(pass);
    tokio::time::sleep(Duration::from_millis(100)).await;
    device.service.update_entity(home.local_id, &home.parent_id, farm("Homestead")).await?;
    task.await???;

    let stored = device.stored(home.local_id)?.ok_or("missing")?;
    assert_eq!(stored.sync_state, SyncState::PendingUpdate);
    let remote_id = stored.remote_id.clone().ok_or("remote id not written back")?;

    device.remote.set_latency(None);
    device.sync().await?;
    let record = device.remote.record(&remote_id).ok_or("not on remote")?;
    assert_eq!(record.payload.label(), "Homestead");
    assert_eq!(device.remote.count(CallKind::Create), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn aborted_pass_leaves_work_pending_and_restart_creates_once() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("cache.db");
    let path = path.to_str().ok_or("non-utf8 temp path")?;
    let remote = Arc::new(InMemoryRemote::new());

    let local_id = {
        let device = TestDevice::on_disk("user-u", path, Arc::clone(&remote), true)?;
        let home = device.create_farm("Home").await?;
        device.sync().await?;
        let north = device.create_field(&home, "North").await?;

        remote.set_latency(Some(Duration::from_secs(1)));
        let (pass, abort) = device.service.sync_now();
        let task = tokio::spawn(pass);
        tokio::time::sleep(Duration::from_millis(100)).await;
        abort.abort();
        assert!(task.await?.is_err());
        north.local_id
    };

    remote.set_latency(None);
    let device = TestDevice::on_disk("user-u", path, Arc::clone(&remote), true)?;
    let stored = device.stored(local_id)?.ok_or("lost across restart")?;
    assert_eq!(stored.sync_state, SyncState::PendingCreate);

    let report = device.sync().await?;
    assert_eq!(report.committed, 1);
    assert_eq!(remote.records_of(&device.user, EntityKind::Farm).len(), 1);
    assert_eq!(remote.records_of(&device.user, EntityKind::Field).len(), 1);

    // Nothing left to send after another restart.
    drop(device);
    let device = TestDevice::on_disk("user-u", path, Arc::clone(&remote), true)?;
    assert_eq!(device.sync().await?.attempted(), 0);
    Ok(())
}

#[tokio::test]
async fn reconnect_starts_a_background_pass() -> Result<(), Box<dyn std::error::Error>> {
    let device = TestDevice::with_remote("user-u", Arc::new(InMemoryRemote::new()), false)?;
    let runner = device.service.start_background_sync();
    let home = device.create_farm("Home").await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(device.remote.calls().is_empty());

    device.go_online();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let synced = device
                .stored(home.local_id)
                .ok()
                .flatten()
                .is_some_and(|e| e.sync_state == SyncState::Synced);
            if synced {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    runner.abort();
    assert_eq!(device.remote.count(CallKind::Create), 1);
    Ok(())
}

#[tokio::test]
async fn writes_trigger_the_background_runner_when_enabled() -> Result<(), Box<dyn std::error::Error>> {
    let device = device_with(SyncConfig {
        sync_on_write: true,
        ..test_config()
    })?;
    let runner = device.service.start_background_sync();
    let north_farm = device.create_farm("North farm").await?;

    tokio::time::timeout(Duration::from_secs(5), async {
        while device.service.pending_count().unwrap_or(1) > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    runner.abort();
    assert!(device.stored(north_farm.local_id)?.and_then(|e| e.remote_id).is_some());
    Ok(())
}
