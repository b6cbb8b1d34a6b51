//! What the screens call: local-first CRUD for one signed-in user.
//!
//! Writes land in the cache and return immediately; the reconciler pushes
//! them later. Reads merge the cache with the remote store when online.

use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures::future::{AbortHandle, Abortable, BoxFuture};
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;

use fieldsync_core::{
    CoreError, Entity, EntityKind, EntityPayload, LocalDelete, LocalId, ParentId, RemoteId,
    SyncState, UserId,
};
use fieldsync_storage::{CacheError, CacheWrite, LocalCache};

use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{EngineError, GatewayError};
use crate::gateway::{RemoteGateway, RemoteRecord, with_timeout};
use crate::ownership::{AccessVerdict, OwnershipVerdict, OwnershipVerifier};
use crate::reconciler::{PassOutcome, Reconciler};

/// Sync status as a list row shows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowStatus {
    Synced,
    Pending,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityView {
    pub entity: Entity,
    pub status: RowStatus,
}

impl EntityView {
    fn of(entity: Entity) -> Self {
        let status = match (&entity.sync_error, entity.sync_state) {
            (Some(reason), _) => RowStatus::Failed(reason.clone()),
            (None, SyncState::Synced) => RowStatus::Synced,
            (None, _) => RowStatus::Pending,
        };
        Self { entity, status }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Never reached the remote store; gone for good.
    Removed,
    /// Tombstoned until the remote delete is acknowledged.
    Queued,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DiscardOutcome {
    /// The record is gone locally (never synced, or deleted remotely).
    Removed,
    /// Local changes dropped in favour of the remote copy.
    Restored(Entity),
}

pub struct FieldService {
    session: UserId,
    cache: Arc<dyn LocalCache>,
    gateway: Arc<dyn RemoteGateway>,
    connectivity: Arc<ConnectivityMonitor>,
    verifier: Arc<OwnershipVerifier>,
    reconciler: Arc<Reconciler>,
    config: SyncConfig,
}

impl FieldService {
    pub fn new(
        session: UserId,
        cache: Arc<dyn LocalCache>,
        gateway: Arc<dyn RemoteGateway>,
        connectivity: Arc<ConnectivityMonitor>,
        config: SyncConfig,
    ) -> Self {
        let verifier = Arc::new(OwnershipVerifier::new(
            Arc::clone(&cache),
            Arc::clone(&gateway),
            Arc::clone(&connectivity),
            config.request_timeout(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&cache),
            Arc::clone(&gateway),
            Arc::clone(&verifier),
            Arc::clone(&connectivity),
            config.clone(),
        ));
        Self {
            session,
            cache,
            gateway,
            connectivity,
            verifier,
            reconciler,
            config,
        }
    }

    pub fn session(&self) -> &UserId {
        &self.session
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn verifier(&self) -> &Arc<OwnershipVerifier> {
        &self.verifier
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    /// Start the background sync runner.
    pub fn start_background_sync(&self) -> JoinHandle<()> {
        self.reconciler.spawn()
    }

    pub async fn create_entity(
        &self,
        payload: EntityPayload,
        owner_id: &UserId,
        parent_id: ParentId,
    ) -> Result<Entity, EngineError> {
        self.ensure_session(owner_id)?;
        payload.validate()?;
        self.require_parent(&parent_id).await?;
        self.check_placement(payload.kind(), &parent_id)?;

        let entity = Entity::new_local(owner_id.clone(), parent_id, payload, Utc::now());
        self.cache.put(&entity).map_err(degraded)?;
        info!(
            "created {} '{}' locally as {}",
            entity.kind(),
            entity.payload.label(),
            entity.local_id
        );
        self.after_write();
        Ok(entity)
    }

    /// `context` is the parent the caller is showing the entity under; a
    /// stale one is refused.
    pub async fn update_entity(
        &self,
        local_id: LocalId,
        context: &ParentId,
        payload: EntityPayload,
    ) -> Result<Entity, EngineError> {
        self.live_entity(local_id)?;
        self.require_access(local_id, context).await?;
        payload.validate()?;

        let now = Utc::now();
        let entity = self.mutate(local_id, |entity| entity.apply_update(payload.clone(), now))?;
        debug!("updated {} {} (revision {})", entity.kind(), local_id, entity.revision);
        self.after_write();
        Ok(entity)
    }

    /// Re-file an entity under another parent of the right kind.
    pub async fn move_entity(
        &self,
        local_id: LocalId,
        context: &ParentId,
        new_parent: ParentId,
    ) -> Result<Entity, EngineError> {
        let current = self.live_entity(local_id)?;
        self.require_access(local_id, context).await?;
        self.require_parent(&new_parent).await?;
        self.check_placement(current.kind(), &new_parent)?;

        let now = Utc::now();
        let entity = self.mutate(local_id, |entity| entity.apply_move(new_parent.clone(), now))?;
        info!("moved {} {} under {}", entity.kind(), local_id, entity.parent_id);
        self.after_write();
        Ok(entity)
    }

    /// Delete an entity and everything filed under it.
    pub async fn delete_entity(
        &self,
        local_id: LocalId,
        context: &ParentId,
    ) -> Result<DeleteOutcome, EngineError> {
        let root = self.live_entity(local_id)?;
        self.require_access(local_id, context).await?;

        let now = Utc::now();
        for child in self.descendants(&root)? {
            self.delete_one(child.local_id, now)?;
        }
        let outcome = self.delete_one(local_id, now)?;
        info!("deleted {} {} locally ({outcome:?})", root.kind(), local_id);
        self.after_write();
        Ok(outcome)
    }

    /// Entities of `owner_id`, optionally under one parent, with their sync
    /// status. Online, the remote listing is merged in first: unknown remote
    /// records are cached, synced rows take newer remote data, and rows with
    /// pending local changes are left alone. Offline, this is the cache.
    pub async fn list_entities(
        &self,
        owner_id: &UserId,
        parent_id: Option<&ParentId>,
    ) -> Result<Vec<EntityView>, EngineError> {
        self.ensure_session(owner_id)?;
        if self.connectivity.is_online()
            && let Err(e) = self.refresh_from_remote(owner_id, parent_id).await
        {
            warn!("remote listing failed, showing cached data: {e}");
        }

        let mut rows: Vec<Entity> = self
            .local_rows(owner_id, parent_id)?
            .into_iter()
            .filter(|e| !e.is_deleted())
            .collect();
        rows.sort_by(|a, b| {
            (a.kind(), a.payload.label()).cmp(&(b.kind(), b.payload.label()))
        });
        Ok(rows.into_iter().map(EntityView::of).collect())
    }

    pub fn get_entity(&self, local_id: LocalId) -> Result<Option<Entity>, EngineError> {
        Ok(self
            .cache
            .get(local_id)?
            .filter(|e| e.owner_id == self.session && !e.is_deleted()))
    }

    /// Entities whose sync failed permanently and wait for the user.
    pub fn failed_entities(&self) -> Result<Vec<EntityView>, EngineError> {
        Ok(self
            .cache
            .list_failed(&self.session)?
            .into_iter()
            .map(EntityView::of)
            .collect())
    }

    pub fn pending_count(&self) -> Result<u64, EngineError> {
        Ok(self.cache.pending_count(&self.session)?)
    }

    /// Retry a failed entity as it is.
    pub fn requeue(&self, local_id: LocalId) -> Result<Entity, EngineError> {
        self.owned_entity(local_id)?;
        self.reconciler
            .requeue(local_id)?
            .ok_or_else(|| EngineError::EntityNotFound(local_id.to_string()))
    }

    /// Drop local changes. A synced record is reset to the remote copy,
    /// which needs connectivity; a never-synced one is simply removed.
    pub async fn discard(&self, local_id: LocalId) -> Result<DiscardOutcome, EngineError> {
        let entity = self.owned_entity(local_id)?;
        let Some(remote_id) = entity.remote_id.clone() else {
            self.cache.remove(local_id)?;
            info!("discarded unsynced {} {}", entity.kind(), local_id);
            return Ok(DiscardOutcome::Removed);
        };
        if !self.connectivity.is_online() {
            return Err(EngineError::Offline(format!(
                "restoring {remote_id} needs the remote copy"
            )));
        }

        let fetched = with_timeout(
            self.config.request_timeout(),
            self.gateway.get(&self.session, &remote_id),
        )
        .await;
        match fetched {
            Ok(record) => {
                let parent_id = self.local_parent_ref(record.parent.as_ref(), Some(&entity.parent_id))?;
                let restored = self.cache.modify(local_id, &mut |current| {
                    let Some(mut e) = current else {
                        return CacheWrite::Keep;
                    };
                    e.payload = record.payload.clone();
                    e.parent_id = parent_id.clone();
                    e.updated_at = record.updated_at;
                    e.sync_state = SyncState::Synced;
                    e.sync_error = None;
                    e.retry_after = None;
                    e.attempts = 0;
                    e.revision += 1;
                    CacheWrite::Put(e)
                })?;
                let restored =
                    restored.ok_or_else(|| EngineError::EntityNotFound(local_id.to_string()))?;
                info!("discarded local changes to {} {}", restored.kind(), local_id);
                Ok(DiscardOutcome::Restored(restored))
            }
            Err(GatewayError::NotFound(_)) => {
                self.cache.remove(local_id)?;
                info!("{remote_id} no longer exists remotely, removed local copy");
                Ok(DiscardOutcome::Removed)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// A pass the caller can await or abort.
    pub fn sync_now(
        &self,
    ) -> (
        Abortable<BoxFuture<'static, Result<PassOutcome, EngineError>>>,
        AbortHandle,
    ) {
        self.reconciler.sync_now()
    }

    fn ensure_session(&self, owner_id: &UserId) -> Result<(), EngineError> {
        if owner_id != &self.session {
            return Err(EngineError::OwnershipDenied(format!(
                "{owner_id} is not the signed-in user"
            )));
        }
        Ok(())
    }

    fn owned_entity(&self, local_id: LocalId) -> Result<Entity, EngineError> {
        self.cache
            .get(local_id)?
            .filter(|e| e.owner_id == self.session)
            .ok_or_else(|| EngineError::EntityNotFound(local_id.to_string()))
    }

    /// Owned and not pending deletion.
    fn live_entity(&self, local_id: LocalId) -> Result<Entity, EngineError> {
        let entity = self.owned_entity(local_id)?;
        if entity.is_deleted() {
            return Err(EngineError::EntityNotFound(local_id.to_string()));
        }
        Ok(entity)
    }

    async fn require_parent(&self, parent_id: &ParentId) -> Result<(), EngineError> {
        match self
            .verifier
            .verify_parent_ownership(&self.session, parent_id)
            .await?
        {
            OwnershipVerdict::Allowed => Ok(()),
            OwnershipVerdict::Denied(reason) => Err(EngineError::OwnershipDenied(format!(
                "{parent_id}: {reason}"
            ))),
            OwnershipVerdict::Unknown => {
                debug!("accepting unverified parent {parent_id}; the remote store decides at sync time");
                Ok(())
            }
        }
    }

    async fn require_access(&self, local_id: LocalId, context: &ParentId) -> Result<(), EngineError> {
        match self
            .verifier
            .verify_entity_access(&self.session, local_id, context)
            .await?
        {
            AccessVerdict::Allowed => Ok(()),
            AccessVerdict::Denied(reason) => {
                Err(EngineError::OwnershipDenied(format!("{local_id}: {reason}")))
            }
        }
    }

    /// Farms hang off their owner, fields off farms, the rest off fields.
    fn check_placement(&self, kind: EntityKind, parent_id: &ParentId) -> Result<(), EngineError> {
        let misplaced = || {
            let expected = kind
                .parent_kind()
                .map_or_else(|| "its owner".to_string(), |k| format!("a {k}"));
            EngineError::Core(CoreError::InvalidParent(format!(
                "a {kind} must be filed under {expected}, not {parent_id}"
            )))
        };
        let parent_kind = match parent_id {
            ParentId::Owner(_) => None,
            ParentId::Local(local_id) => match self.cache.get(*local_id)? {
                Some(parent) => Some(parent.kind()),
                None => return Ok(()),
            },
            ParentId::Remote(remote_id) => match self.cache.find_by_remote_id(remote_id)? {
                Some(parent) => Some(parent.kind()),
                // Not cached; the remote store rejects a wrong kind.
                None if kind.parent_kind().is_some() => return Ok(()),
                None => return Err(misplaced()),
            },
        };
        if parent_kind != kind.parent_kind() {
            return Err(misplaced());
        }
        Ok(())
    }

    fn mutate(
        &self,
        local_id: LocalId,
        mut change: impl FnMut(&mut Entity) -> Result<(), CoreError>,
    ) -> Result<Entity, EngineError> {
        let mut failure = None;
        let stored = self
            .cache
            .modify(local_id, &mut |current| {
                let Some(mut entity) = current else {
                    return CacheWrite::Keep;
                };
                match change(&mut entity) {
                    Ok(()) => CacheWrite::Put(entity),
                    Err(e) => {
                        failure = Some(e);
                        CacheWrite::Keep
                    }
                }
            })
            .map_err(degraded)?;
        if let Some(e) = failure {
            return Err(e.into());
        }
        stored.ok_or_else(|| EngineError::EntityNotFound(local_id.to_string()))
    }

    fn delete_one(&self, local_id: LocalId, now: chrono::DateTime<Utc>) -> Result<DeleteOutcome, EngineError> {
        let mut outcome = DeleteOutcome::Removed;
        self.cache
            .modify(local_id, &mut |current| {
                let Some(entity) = current else {
                    return CacheWrite::Keep;
                };
                match entity.apply_delete(now) {
                    LocalDelete::Drop => {
                        outcome = DeleteOutcome::Removed;
                        CacheWrite::Remove
                    }
                    LocalDelete::Tombstone(tombstone) => {
                        outcome = DeleteOutcome::Queued;
                        CacheWrite::Put(tombstone)
                    }
                }
            })
            .map_err(degraded)?;
        Ok(outcome)
    }

    /// Live descendants of `root`, deepest first.
    fn descendants(&self, root: &Entity) -> Result<Vec<Entity>, CacheError> {
        let mut seen = HashSet::new();
        let mut found = Vec::new();
        let mut frontier = vec![root.clone()];
        while let Some(node) = frontier.pop() {
            for alias in self_aliases(&node) {
                for child in self.cache.list(&node.owner_id, Some(&alias))? {
                    if !child.is_deleted() && seen.insert(child.local_id) {
                        frontier.push(child.clone());
                        found.push(child);
                    }
                }
            }
        }
        found.sort_by_key(|e| Reverse(e.kind().depth()));
        Ok(found)
    }

    /// Every way a cached row may refer to `parent_id`.
    fn parent_aliases(&self, parent_id: &ParentId) -> Result<Vec<ParentId>, CacheError> {
        let mut aliases = vec![parent_id.clone()];
        match parent_id {
            ParentId::Owner(_) => {}
            ParentId::Local(local_id) => {
                if let Some(remote_id) = self.cache.get(*local_id)?.and_then(|e| e.remote_id) {
                    aliases.push(ParentId::Remote(remote_id));
                }
            }
            ParentId::Remote(remote_id) => {
                if let Some(entity) = self.cache.find_by_remote_id(remote_id)? {
                    aliases.push(ParentId::Local(entity.local_id));
                }
            }
        }
        Ok(aliases)
    }

    fn remote_alias(&self, parent_id: &ParentId) -> Result<Option<RemoteId>, CacheError> {
        Ok(match parent_id {
            ParentId::Owner(_) => None,
            ParentId::Remote(remote_id) => Some(remote_id.clone()),
            ParentId::Local(local_id) => self.cache.get(*local_id)?.and_then(|e| e.remote_id),
        })
    }

    fn local_rows(
        &self,
        owner_id: &UserId,
        parent_id: Option<&ParentId>,
    ) -> Result<Vec<Entity>, CacheError> {
        let Some(parent_id) = parent_id else {
            return self.cache.list(owner_id, None);
        };
        let mut seen = HashSet::new();
        let mut rows = Vec::new();
        for alias in self.parent_aliases(parent_id)? {
            for entity in self.cache.list(owner_id, Some(&alias))? {
                if seen.insert(entity.local_id) {
                    rows.push(entity);
                }
            }
        }
        Ok(rows)
    }

    /// How a record's remote parent should be referenced locally: keep the
    /// current reference if it already points there, prefer a cached entity,
    /// fall back to the bare remote id.
    fn local_parent_ref(
        &self,
        remote_parent: Option<&RemoteId>,
        current: Option<&ParentId>,
    ) -> Result<ParentId, CacheError> {
        let Some(remote_parent) = remote_parent else {
            return Ok(ParentId::Owner(self.session.clone()));
        };
        if let Some(current) = current
            && self.remote_alias(current)?.as_ref() == Some(remote_parent)
        {
            return Ok(current.clone());
        }
        Ok(match self.cache.find_by_remote_id(remote_parent)? {
            Some(parent) => ParentId::Local(parent.local_id),
            None => ParentId::Remote(remote_parent.clone()),
        })
    }

    async fn refresh_from_remote(
        &self,
        owner_id: &UserId,
        parent_id: Option<&ParentId>,
    ) -> Result<(), EngineError> {
        let (kinds, remote_parent) = match parent_id {
            None => (EntityKind::ALL.to_vec(), None),
            Some(ParentId::Owner(_)) => (vec![EntityKind::Farm], None),
            Some(parent) => {
                let Some(remote_parent) = self.remote_alias(parent)? else {
                    // Parent not created remotely yet; nothing to merge.
                    return Ok(());
                };
                let parent_kind = match parent {
                    ParentId::Local(local_id) => self.cache.get(*local_id)?.map(|e| e.kind()),
                    _ => self.cache.find_by_remote_id(&remote_parent)?.map(|e| e.kind()),
                };
                let kinds = EntityKind::ALL
                    .into_iter()
                    .filter(|k| match parent_kind {
                        Some(pk) => k.parent_kind() == Some(pk),
                        None => k.parent_kind().is_some(),
                    })
                    .collect();
                (kinds, Some(remote_parent))
            }
        };

        let quiet_before = !self.reconciler.is_running();
        let epoch_before = self.reconciler.epoch();
        let mut listings = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let call = self.gateway.list(owner_id, kind, remote_parent.as_ref());
            let records = with_timeout(self.config.request_timeout(), call).await?;
            listings.push((kind, records));
        }
        // A pass that commits while we list would look like a remote delete,
        // or a remote create nobody here knows about.
        let quiet = quiet_before
            && !self.reconciler.is_running()
            && self.reconciler.epoch() == epoch_before;

        for (kind, records) in listings {
            self.merge_listing(owner_id, kind, parent_id, &records, quiet)?;
        }
        Ok(())
    }

    fn merge_listing(
        &self,
        owner_id: &UserId,
        kind: EntityKind,
        scope: Option<&ParentId>,
        records: &[RemoteRecord],
        quiet: bool,
    ) -> Result<(), CacheError> {
        let mut seen = HashSet::new();
        for record in records.iter().filter(|r| &r.owner_id == owner_id && r.kind == kind) {
            seen.insert(record.remote_id.clone());
            match self.cache.find_by_remote_id(&record.remote_id)? {
                Some(local) => {
                    // The cache keeps millisecond precision.
                    let newer = record.updated_at.timestamp_millis() > local.updated_at.timestamp_millis();
                    if local.sync_state != SyncState::Synced || !newer {
                        continue;
                    }
                    let parent_id = self.local_parent_ref(record.parent.as_ref(), Some(&local.parent_id))?;
                    self.cache.modify(local.local_id, &mut |current| match current {
                        Some(mut e) if e.sync_state == SyncState::Synced && e.revision == local.revision => {
                            e.payload = record.payload.clone();
                            e.parent_id = parent_id.clone();
                            e.updated_at = record.updated_at;
                            CacheWrite::Put(e)
                        }
                        _ => CacheWrite::Keep,
                    })?;
                    debug!("refreshed {} {} from {}", kind, local.local_id, record.remote_id);
                }
                // Could be a create whose response a running pass has not
                // committed yet.
                None if !quiet => {
                    debug!("skipping unknown remote {} {} during a sync pass", kind, record.remote_id);
                }
                None => {
                    let parent_id = self.local_parent_ref(record.parent.as_ref(), None)?;
                    let entity = Entity::from_remote(
                        record.remote_id.clone(),
                        owner_id.clone(),
                        parent_id,
                        record.payload.clone(),
                        record.updated_at,
                    );
                    self.cache.put(&entity)?;
                    debug!("cached remote {} {} as {}", kind, record.remote_id, entity.local_id);
                }
            }
        }

        if !quiet {
            return Ok(());
        }
        let stale: Vec<Entity> = self
            .local_rows(owner_id, scope)?
            .into_iter()
            .filter(|e| e.kind() == kind && e.sync_state == SyncState::Synced)
            .filter(|e| e.remote_id.as_ref().is_some_and(|id| !seen.contains(id)))
            .collect();
        for entity in stale {
            self.cache.modify(entity.local_id, &mut |current| match current {
                Some(e) if e.sync_state == SyncState::Synced => CacheWrite::Remove,
                _ => CacheWrite::Keep,
            })?;
            info!("{} {} was deleted remotely", entity.kind(), entity.local_id);
        }
        Ok(())
    }

    fn after_write(&self) {
        if self.config.sync_on_write && self.connectivity.is_online() {
            self.reconciler.trigger();
        }
    }
}

fn self_aliases(entity: &Entity) -> Vec<ParentId> {
    let mut aliases = vec![ParentId::Local(entity.local_id)];
    if let Some(remote_id) = &entity.remote_id {
        aliases.push(ParentId::Remote(remote_id.clone()));
    }
    aliases
}

fn degraded(err: CacheError) -> EngineError {
    if err.is_storage_full() {
        error!("local storage is full, change not saved");
    } else {
        error!("local cache write failed: {err}");
    }
    EngineError::Cache(err)
}
