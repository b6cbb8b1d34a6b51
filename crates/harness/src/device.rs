use std::error::Error;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use fieldsync_core::{
    CropRecordPayload, Entity, EntityPayload, FarmPayload, FieldPayload, HistoryEventPayload,
    LocalId, ParentId, UserId,
};
use fieldsync_engine::{
    ConnectivityMonitor, EngineError, FieldService, PassOutcome, PassReport, SyncConfig,
};
use fieldsync_storage::{CacheError, LocalCache, SqliteCache};

use crate::remote::InMemoryRemote;

/// Deterministic settings: no timer, no write-triggered passes, immediate
/// retries, short timeouts.
pub fn test_config() -> SyncConfig {
    SyncConfig {
        max_concurrency: 4,
        request_timeout_ms: 500,
        backoff_base_secs: 0,
        backoff_max_exponent: 8,
        periodic_interval_secs: None,
        sync_on_write: false,
    }
}

pub fn user(name: &str) -> UserId {
    UserId::new(name).expect("test user names are non-empty")
}

pub fn farm(name: &str) -> EntityPayload {
    EntityPayload::Farm(FarmPayload {
        name: name.into(),
        location: None,
        size: None,
        size_unit: None,
    })
}

pub fn field(name: &str) -> EntityPayload {
    EntityPayload::Field(FieldPayload::named(name))
}

pub fn sized_field(name: &str, hectares: f64) -> EntityPayload {
    let mut payload = FieldPayload::named(name);
    payload.size = Some(hectares);
    payload.size_unit = Some("hectares".into());
    EntityPayload::Field(payload)
}

pub fn crop(crop_type: &str) -> EntityPayload {
    EntityPayload::CropRecord(CropRecordPayload {
        crop_type: crop_type.into(),
        planting_date: None,
        expected_harvest_date: None,
        status: None,
        notes: None,
    })
}

pub fn history(event_type: &str, occurred_at: DateTime<Utc>) -> EntityPayload {
    EntityPayload::HistoryEvent(HistoryEventPayload {
        event_type: event_type.into(),
        description: format!("{event_type} recorded"),
        occurred_at,
    })
}

/// One signed-in device: a cache, a connectivity monitor, and the service
/// on top, talking to a (possibly shared) in-memory remote.
pub struct TestDevice {
    pub user: UserId,
    pub cache: Arc<SqliteCache>,
    pub remote: Arc<InMemoryRemote>,
    pub connectivity: Arc<ConnectivityMonitor>,
    pub service: FieldService,
}

impl TestDevice {
    /// Online, in-memory cache, fresh remote.
    pub fn new(user_name: &str) -> Result<Self, CacheError> {
        Self::with_remote(user_name, Arc::new(InMemoryRemote::new()), true)
    }

    pub fn with_remote(
        user_name: &str,
        remote: Arc<InMemoryRemote>,
        online: bool,
    ) -> Result<Self, CacheError> {
        let cache = Arc::new(SqliteCache::open_in_memory()?);
        Ok(Self::build(user(user_name), cache, remote, online, test_config()))
    }

    /// Cache backed by a file, for restart scenarios.
    pub fn on_disk(
        user_name: &str,
        path: &str,
        remote: Arc<InMemoryRemote>,
        online: bool,
    ) -> Result<Self, CacheError> {
        let cache = Arc::new(SqliteCache::open(path)?);
        Ok(Self::build(user(user_name), cache, remote, online, test_config()))
    }

    pub fn build(
        user: UserId,
        cache: Arc<SqliteCache>,
        remote: Arc<InMemoryRemote>,
        online: bool,
        config: SyncConfig,
    ) -> Self {
        let connectivity = Arc::new(ConnectivityMonitor::new(online));
        let service = FieldService::new(
            user.clone(),
            Arc::clone(&cache) as Arc<dyn LocalCache>,
            Arc::clone(&remote) as _,
            Arc::clone(&connectivity),
            config,
        );
        Self {
            user,
            cache,
            remote,
            connectivity,
            service,
        }
    }

    pub fn go_online(&self) {
        self.connectivity.set_online(true);
    }

    pub fn go_offline(&self) {
        self.connectivity.set_online(false);
    }

    /// Run one pass and insist it completed.
    pub async fn sync(&self) -> Result<PassReport, Box<dyn Error>> {
        match self.service.reconciler().run_pass().await? {
            PassOutcome::Completed(report) => Ok(report),
            other => Err(format!("sync pass did not run: {other:?}").into()),
        }
    }

    /// Raw cache read, tombstones included.
    pub fn stored(&self, local_id: LocalId) -> Result<Option<Entity>, CacheError> {
        self.cache.get(local_id)
    }

    pub async fn create_farm(&self, name: &str) -> Result<Entity, EngineError> {
        self.service
            .create_entity(farm(name), &self.user, ParentId::Owner(self.user.clone()))
            .await
    }

    pub async fn create_field(&self, farm: &Entity, name: &str) -> Result<Entity, EngineError> {
        self.service
            .create_entity(field(name), &self.user, ParentId::Local(farm.local_id))
            .await
    }

    pub async fn create_crop(&self, field: &Entity, crop_type: &str) -> Result<Entity, EngineError> {
        self.service
            .create_entity(crop(crop_type), &self.user, ParentId::Local(field.local_id))
            .await
    }
}
