//! Drains pending local changes to the remote store.
//!
//! A pass lists every pending entity that is not failed or backing off,
//! then pushes them in waves: creates and updates by ascending depth
//! (farms, then fields, then crop records and history), deletes by
//! descending depth. Within a wave up to `max_concurrency` gateway calls run
//! at once. Each entity's result is committed to the cache on its own, so an
//! interrupted pass leaves everything either committed or still pending.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use futures::future::{AbortHandle, Abortable, BoxFuture};
use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use fieldsync_core::{Entity, LocalId, ParentId, RemoteId, SyncState};
use fieldsync_storage::{CacheError, CacheWrite, LocalCache};

use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{EngineError, GatewayError, RetryClass};
use crate::gateway::{CreateOutcome, CreateRequest, RemoteGateway, create_with_fallback, with_timeout};
use crate::ownership::{OwnershipVerdict, OwnershipVerifier, REASON_NOT_FOUND};

/// What happened to one entity during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityOutcome {
    Committed,
    /// Transient failure; backoff scheduled.
    Retryable,
    /// Marked failed; waits for the user.
    Permanent,
    /// Parent has no remote id yet.
    Deferred,
    /// Nothing to do, or someone else is on it.
    Skipped,
    /// Created remotely after being deleted locally; the remote copy was
    /// deleted again.
    Compensated,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub committed: usize,
    pub retryable: usize,
    pub permanent: usize,
    pub deferred: usize,
    pub skipped: usize,
    pub compensated: usize,
}

impl PassReport {
    fn record(&mut self, outcome: EntityOutcome) {
        let slot = match outcome {
            EntityOutcome::Committed => &mut self.committed,
            EntityOutcome::Retryable => &mut self.retryable,
            EntityOutcome::Permanent => &mut self.permanent,
            EntityOutcome::Deferred => &mut self.deferred,
            EntityOutcome::Skipped => &mut self.skipped,
            EntityOutcome::Compensated => &mut self.compensated,
        };
        *slot += 1;
    }

    fn absorb(&mut self, other: PassReport) {
        self.committed += other.committed;
        self.retryable += other.retryable;
        self.permanent += other.permanent;
        self.deferred += other.deferred;
        self.skipped += other.skipped;
        self.compensated += other.compensated;
    }

    /// Entities that reached the remote store or were settled against it.
    pub fn attempted(&self) -> usize {
        self.committed + self.retryable + self.permanent + self.compensated
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Completed(PassReport),
    /// Another pass was running; it will run again once it finishes.
    Coalesced,
    Offline,
}

/// Held while a pass runs.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// At most one in-flight remote operation per local id.
struct Claim<'a> {
    claims: &'a Mutex<HashSet<LocalId>>,
    local_id: LocalId,
}

impl<'a> Claim<'a> {
    fn acquire(claims: &'a Mutex<HashSet<LocalId>>, local_id: LocalId) -> Option<Self> {
        let mut set = claims.lock().unwrap_or_else(PoisonError::into_inner);
        set.insert(local_id).then_some(Self { claims, local_id })
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        let mut set = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        set.remove(&self.local_id);
    }
}

enum ParentLink {
    Ready(Option<RemoteId>),
    Waiting,
    Gone(String),
}

pub struct Reconciler {
    cache: Arc<dyn LocalCache>,
    gateway: Arc<dyn RemoteGateway>,
    verifier: Arc<OwnershipVerifier>,
    connectivity: Arc<ConnectivityMonitor>,
    config: SyncConfig,
    pass_running: AtomicBool,
    rerun_requested: AtomicBool,
    epoch: AtomicU64,
    claims: Mutex<HashSet<LocalId>>,
    wake: Notify,
}

impl Reconciler {
    pub fn new(
        cache: Arc<dyn LocalCache>,
        gateway: Arc<dyn RemoteGateway>,
        verifier: Arc<OwnershipVerifier>,
        connectivity: Arc<ConnectivityMonitor>,
        config: SyncConfig,
    ) -> Self {
        Self {
            cache,
            gateway,
            verifier,
            connectivity,
            config,
            pass_running: AtomicBool::new(false),
            rerun_requested: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            claims: Mutex::new(HashSet::new()),
            wake: Notify::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.pass_running.load(Ordering::Acquire)
    }

    /// Number of drain rounds started so far. Readers that must not race a
    /// pass compare it before and after their work.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Run one pass. If a pass is already running this only asks it to go
    /// around once more and returns `Coalesced`.
    pub async fn run_pass(&self) -> Result<PassOutcome, EngineError> {
        if !self.connectivity.is_online() {
            return Ok(PassOutcome::Offline);
        }
        let Some(mut guard) = PassGuard::try_acquire(&self.pass_running) else {
            self.rerun_requested.store(true, Ordering::Release);
            debug!("sync pass already running, coalescing");
            return Ok(PassOutcome::Coalesced);
        };

        let mut report = PassReport::default();
        loop {
            self.rerun_requested.store(false, Ordering::Release);
            self.epoch.fetch_add(1, Ordering::AcqRel);
            report.absorb(self.drain_once().await?);

            if !self.connectivity.is_online() {
                break;
            }
            if self.rerun_requested.load(Ordering::Acquire) {
                continue;
            }
            drop(guard);
            // A request may land between the check above and the release.
            if !self.rerun_requested.load(Ordering::Acquire) {
                break;
            }
            match PassGuard::try_acquire(&self.pass_running) {
                Some(g) => guard = g,
                None => break,
            }
        }
        Ok(PassOutcome::Completed(report))
    }

    /// Ask the background runner for a pass.
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    /// A pass the caller can abort. Aborting drops the in-flight calls;
    /// entities not yet committed stay pending.
    pub fn sync_now(
        self: &Arc<Self>,
    ) -> (
        Abortable<BoxFuture<'static, Result<PassOutcome, EngineError>>>,
        AbortHandle,
    ) {
        let (handle, registration) = AbortHandle::new_pair();
        let this = Arc::clone(self);
        let pass: BoxFuture<'static, _> = Box::pin(async move { this.run_pass().await });
        (Abortable::new(pass, registration), handle)
    }

    /// Start the background runner: a pass on startup, on every transition
    /// to online, on every `trigger`, and on the periodic timer.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_background().await })
    }

    /// Clear a permanent failure and any backoff so the entity is retried.
    pub fn requeue(&self, local_id: LocalId) -> Result<Option<Entity>, CacheError> {
        let stored = self.cache.modify(local_id, &mut |current| match current {
            Some(mut entity) if entity.sync_state.is_pending() => {
                entity.sync_error = None;
                entity.retry_after = None;
                entity.attempts = 0;
                CacheWrite::Put(entity)
            }
            _ => CacheWrite::Keep,
        })?;
        if stored.as_ref().is_some_and(|e| e.sync_state.is_pending()) {
            info!("requeued {local_id}");
            self.trigger();
        }
        Ok(stored)
    }

    async fn run_background(&self) {
        let mut online = self.connectivity.watch();
        let mut ticker = self.config.periodic_interval().map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        self.run_logged("startup").await;
        loop {
            let reason = tokio::select! {
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if !*online.borrow_and_update() {
                        continue;
                    }
                    "connectivity restored"
                }
                _ = next_tick(&mut ticker) => "periodic",
                _ = self.wake.notified() => "requested",
            };
            self.run_logged(reason).await;
        }
    }

    async fn run_logged(&self, reason: &str) {
        match self.run_pass().await {
            Ok(PassOutcome::Completed(report)) if report.attempted() > 0 => {
                info!("sync pass ({reason}): {report:?}");
            }
            Ok(outcome) => debug!("sync pass ({reason}): {outcome:?}"),
            Err(e) => error!("sync pass ({reason}) failed: {e}"),
        }
    }

    async fn drain_once(&self) -> Result<PassReport, EngineError> {
        let pending = self.cache.list_pending(Utc::now())?;
        let mut report = PassReport::default();
        if pending.is_empty() {
            return Ok(report);
        }
        info!("sync pass: {} pending", pending.len());

        let mut upserts: BTreeMap<u8, Vec<LocalId>> = BTreeMap::new();
        let mut deletes: BTreeMap<u8, Vec<LocalId>> = BTreeMap::new();
        for entity in &pending {
            let bucket = if entity.is_deleted() { &mut deletes } else { &mut upserts };
            bucket.entry(entity.kind().depth()).or_default().push(entity.local_id);
        }
        let waves = upserts.into_values().chain(deletes.into_values().rev());

        for wave in waves {
            if !self.connectivity.is_online() {
                info!("connectivity lost, stopping sync pass");
                break;
            }
            let outcomes: Vec<Result<EntityOutcome, EngineError>> = stream::iter(wave)
                .map(|local_id| self.sync_entity(local_id))
                .buffer_unordered(self.config.concurrency())
                .collect()
                .await;
            for outcome in outcomes {
                report.record(outcome?);
            }
        }
        Ok(report)
    }

    async fn sync_entity(&self, local_id: LocalId) -> Result<EntityOutcome, EngineError> {
        let Some(_claim) = Claim::acquire(&self.claims, local_id) else {
            debug!("{local_id} already in flight");
            return Ok(EntityOutcome::Skipped);
        };
        // The listing is a snapshot; work from the current record.
        let Some(entity) = self.cache.get(local_id)? else {
            return Ok(EntityOutcome::Skipped);
        };
        if entity.has_failed() || entity.retry_after.is_some_and(|at| at > Utc::now()) {
            return Ok(EntityOutcome::Skipped);
        }
        match entity.sync_state {
            SyncState::Synced => Ok(EntityOutcome::Skipped),
            SyncState::PendingDelete => self.push_delete(entity).await,
            SyncState::PendingCreate | SyncState::PendingUpdate => self.push_upsert(entity).await,
        }
    }

    fn resolve_parent(&self, entity: &Entity) -> Result<ParentLink, CacheError> {
        Ok(match &entity.parent_id {
            ParentId::Owner(_) => ParentLink::Ready(None),
            ParentId::Remote(remote_id) => ParentLink::Ready(Some(remote_id.clone())),
            ParentId::Local(parent_id) => match self.cache.get(*parent_id)? {
                None => ParentLink::Gone(format!("parent {parent_id} no longer exists")),
                Some(parent) if parent.is_deleted() => {
                    ParentLink::Gone(format!("parent {parent_id} is being deleted"))
                }
                Some(parent) => match parent.remote_id {
                    Some(remote_id) => ParentLink::Ready(Some(remote_id)),
                    None => ParentLink::Waiting,
                },
            },
        })
    }

    async fn push_upsert(&self, entity: Entity) -> Result<EntityOutcome, EngineError> {
        let parent = match self.resolve_parent(&entity)? {
            ParentLink::Ready(parent) => parent,
            ParentLink::Waiting => {
                debug!("{} waits for its parent to sync", entity.local_id);
                return Ok(EntityOutcome::Deferred);
            }
            ParentLink::Gone(reason) => return Ok(self.fail(&entity, reason)?),
        };

        match self.verifier.verify_for_sync(&entity.owner_id, &entity.parent_id).await? {
            OwnershipVerdict::Allowed => {}
            OwnershipVerdict::Denied(reason) => {
                return Ok(self.fail(&entity, format!("ownership denied: {reason}"))?);
            }
            OwnershipVerdict::Unknown => {
                return Ok(self.retry_later(&entity, "parent ownership could not be verified")?);
            }
        }

        let limit = self.config.request_timeout();
        match &entity.remote_id {
            None => {
                let request = CreateRequest {
                    owner_id: entity.owner_id.clone(),
                    parent,
                    payload: entity.payload.clone(),
                };
                match create_with_fallback(self.gateway.as_ref(), &entity.owner_id, &request, limit).await {
                    Ok(outcome) => self.commit_create(&entity, outcome).await,
                    Err(e) => Ok(self.record_failure(&entity, e)?),
                }
            }
            Some(remote_id) => {
                let call = self.gateway.update(&entity.owner_id, remote_id, parent.as_ref(), &entity.payload);
                match with_timeout(limit, call).await {
                    Ok(()) => Ok(self.commit_update(&entity)?),
                    Err(e) => Ok(self.record_failure(&entity, e)?),
                }
            }
        }
    }

    async fn commit_create(
        &self,
        snapshot: &Entity,
        outcome: CreateOutcome,
    ) -> Result<EntityOutcome, EngineError> {
        let (remote_id, rejected) = match outcome {
            CreateOutcome::Full(remote_id) => (remote_id, None),
            CreateOutcome::Narrowed { remote_id, rejected } => (remote_id, Some(rejected)),
        };

        let stored = self.cache.modify(snapshot.local_id, &mut |current| {
            let Some(mut entity) = current else {
                return CacheWrite::Keep;
            };
            let unchanged = entity.revision == snapshot.revision;
            entity.remote_id = Some(remote_id.clone());
            entity.attempts = 0;
            entity.retry_after = None;
            if entity.sync_state == SyncState::PendingCreate {
                entity.sync_state = if unchanged && rejected.is_none() {
                    SyncState::Synced
                } else {
                    SyncState::PendingUpdate
                };
            }
            if unchanged && rejected.is_some() {
                entity.sync_error = rejected.clone();
            }
            CacheWrite::Put(entity)
        })?;

        let Some(stored) = stored else {
            warn!(
                "{} was deleted while its create was in flight, removing {remote_id}",
                snapshot.local_id
            );
            let tombstone = Entity {
                remote_id: Some(remote_id),
                sync_state: SyncState::PendingDelete,
                sync_error: None,
                retry_after: None,
                attempts: 0,
                ..snapshot.clone()
            };
            self.cache.put(&tombstone)?;
            return Ok(match self.push_delete(tombstone).await? {
                EntityOutcome::Committed => EntityOutcome::Compensated,
                other => other,
            });
        };

        match (&rejected, stored.sync_error.is_some()) {
            (Some(reason), true) => {
                warn!(
                    "created {} '{}' as {remote_id} with mandatory fields only: {reason}",
                    stored.kind(),
                    stored.payload.label()
                );
                Ok(EntityOutcome::Permanent)
            }
            _ => {
                info!("created {} '{}' as {remote_id}", stored.kind(), stored.payload.label());
                Ok(EntityOutcome::Committed)
            }
        }
    }

    fn commit_update(&self, snapshot: &Entity) -> Result<EntityOutcome, CacheError> {
        self.cache.modify(snapshot.local_id, &mut |current| {
            let Some(mut entity) = current else {
                return CacheWrite::Keep;
            };
            entity.attempts = 0;
            entity.retry_after = None;
            if entity.sync_state == SyncState::PendingUpdate && entity.revision == snapshot.revision {
                entity.sync_state = SyncState::Synced;
            }
            CacheWrite::Put(entity)
        })?;
        debug!("updated {} {}", snapshot.kind(), snapshot.local_id);
        Ok(EntityOutcome::Committed)
    }

    async fn push_delete(&self, entity: Entity) -> Result<EntityOutcome, EngineError> {
        let Some(remote_id) = entity.remote_id.clone() else {
            self.cache.remove(entity.local_id)?;
            return Ok(EntityOutcome::Committed);
        };

        match self.verifier.verify_record_for_sync(&entity.owner_id, &remote_id).await {
            OwnershipVerdict::Allowed => {}
            OwnershipVerdict::Denied(reason) if reason == REASON_NOT_FOUND => {
                debug!("{remote_id} already gone remotely");
                return Ok(self.commit_delete(&entity)?);
            }
            OwnershipVerdict::Denied(reason) => {
                return Ok(self.fail(&entity, format!("ownership denied: {reason}"))?);
            }
            OwnershipVerdict::Unknown => {
                return Ok(self.retry_later(&entity, "record ownership could not be verified")?);
            }
        }

        let call = self.gateway.delete(&entity.owner_id, &remote_id);
        match with_timeout(self.config.request_timeout(), call).await {
            Ok(()) | Err(GatewayError::NotFound(_)) => Ok(self.commit_delete(&entity)?),
            Err(e) => Ok(self.record_failure(&entity, e)?),
        }
    }

    fn commit_delete(&self, snapshot: &Entity) -> Result<EntityOutcome, CacheError> {
        self.cache.modify(snapshot.local_id, &mut |current| match current {
            Some(entity) if entity.is_deleted() => CacheWrite::Remove,
            _ => CacheWrite::Keep,
        })?;
        debug!("deleted {} {}", snapshot.kind(), snapshot.local_id);
        Ok(EntityOutcome::Committed)
    }

    fn record_failure(&self, snapshot: &Entity, err: GatewayError) -> Result<EntityOutcome, CacheError> {
        match err.retry_class() {
            RetryClass::Retryable => self.retry_later(snapshot, &err.to_string()),
            RetryClass::Permanent => {
                let reason = match err {
                    GatewayError::Validation(message) => message,
                    other => other.to_string(),
                };
                self.fail(snapshot, reason)
            }
        }
    }

    /// Mark the entity failed. A newer local revision is left alone: the
    /// failure belongs to the payload that was sent.
    fn fail(&self, snapshot: &Entity, reason: impl Into<String>) -> Result<EntityOutcome, CacheError> {
        let reason = reason.into();
        let mut marked = false;
        self.cache.modify(snapshot.local_id, &mut |current| match current {
            Some(mut entity) if entity.revision == snapshot.revision => {
                entity.sync_error = Some(reason.clone());
                entity.retry_after = None;
                marked = true;
                CacheWrite::Put(entity)
            }
            _ => CacheWrite::Keep,
        })?;
        if !marked {
            return Ok(EntityOutcome::Skipped);
        }
        error!(
            "sync of {} {} failed permanently: {reason}",
            snapshot.kind(),
            snapshot.local_id
        );
        Ok(EntityOutcome::Permanent)
    }

    fn retry_later(&self, snapshot: &Entity, reason: &str) -> Result<EntityOutcome, CacheError> {
        let now = Utc::now();
        let stored = self.cache.modify(snapshot.local_id, &mut |current| match current {
            Some(mut entity) => {
                entity.attempts = entity.attempts.saturating_add(1);
                entity.retry_after = Some(now + self.config.backoff(entity.attempts));
                CacheWrite::Put(entity)
            }
            None => CacheWrite::Keep,
        })?;
        if let Some(entity) = stored {
            warn!(
                "sync of {} {} failed (attempt {}), retrying after {:?}: {reason}",
                entity.kind(),
                entity.local_id,
                entity.attempts,
                entity.retry_after
            );
        }
        Ok(EntityOutcome::Retryable)
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
