use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::{LocalId, ParentId, RemoteId, UserId};
use crate::payload::{EntityKind, EntityPayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncState {
    Synced,
    PendingCreate,
    PendingUpdate,
    PendingDelete,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::PendingCreate => "pending_create",
            Self::PendingUpdate => "pending_update",
            Self::PendingDelete => "pending_delete",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "synced" => Ok(Self::Synced),
            "pending_create" => Ok(Self::PendingCreate),
            "pending_update" => Ok(Self::PendingUpdate),
            "pending_delete" => Ok(Self::PendingDelete),
            _ => Err(CoreError::Serialization(format!("unknown sync state: {s}"))),
        }
    }

    pub fn is_pending(&self) -> bool {
        !matches!(self, Self::Synced)
    }
}

/// A farm, field, crop record or history event as the device knows it.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub local_id: LocalId,
    pub remote_id: Option<RemoteId>,
    pub owner_id: UserId,
    pub parent_id: ParentId,
    pub payload: EntityPayload,
    pub sync_state: SyncState,
    pub updated_at: DateTime<Utc>,
    /// Set when sync failed permanently; blocks automatic retries.
    pub sync_error: Option<String>,
    /// Earliest time the reconciler may retry after a transient failure.
    pub retry_after: Option<DateTime<Utc>>,
    /// Consecutive transient failures.
    pub attempts: u32,
    /// Bumped on every local mutation.
    pub revision: u64,
}

/// What a local delete amounts to.
#[derive(Debug)]
pub enum LocalDelete {
    /// Never reached the remote store: drop the record outright.
    Drop,
    /// Exists remotely: keep a tombstone until the remote delete is acknowledged.
    Tombstone(Entity),
}

impl Entity {
    /// A freshly authored entity, waiting for its first remote create.
    pub fn new_local(
        owner_id: UserId,
        parent_id: ParentId,
        payload: EntityPayload,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            local_id: LocalId::new(),
            remote_id: None,
            owner_id,
            parent_id,
            payload,
            sync_state: SyncState::PendingCreate,
            updated_at: now,
            sync_error: None,
            retry_after: None,
            attempts: 0,
            revision: 1,
        }
    }

    /// A record pulled from the remote store.
    pub fn from_remote(
        remote_id: RemoteId,
        owner_id: UserId,
        parent_id: ParentId,
        payload: EntityPayload,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            local_id: LocalId::new(),
            remote_id: Some(remote_id),
            owner_id,
            parent_id,
            payload,
            sync_state: SyncState::Synced,
            updated_at,
            sync_error: None,
            retry_after: None,
            attempts: 0,
            revision: 1,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.payload.kind()
    }

    pub fn is_deleted(&self) -> bool {
        self.sync_state == SyncState::PendingDelete
    }

    pub fn has_failed(&self) -> bool {
        self.sync_error.is_some()
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        // Keep updated_at monotonic even if the wall clock steps back.
        self.updated_at = now.max(self.updated_at);
        self.revision += 1;
        self.sync_error = None;
        if self.sync_state == SyncState::Synced {
            self.sync_state = SyncState::PendingUpdate;
        }
    }

    /// Replace the payload. A synced entity becomes `PendingUpdate`; a
    /// never-synced one stays `PendingCreate` and will be created with the
    /// latest payload.
    pub fn apply_update(
        &mut self,
        payload: EntityPayload,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        if self.is_deleted() {
            return Err(CoreError::InvalidData(format!(
                "{} is pending deletion",
                self.local_id
            )));
        }
        if payload.kind() != self.kind() {
            return Err(CoreError::InvalidPayload(format!(
                "cannot turn a {} into a {}",
                self.kind(),
                payload.kind()
            )));
        }
        self.payload = payload;
        self.touch(now);
        Ok(())
    }

    pub fn apply_move(&mut self, parent_id: ParentId, now: DateTime<Utc>) -> Result<(), CoreError> {
        if self.is_deleted() {
            return Err(CoreError::InvalidData(format!(
                "{} is pending deletion",
                self.local_id
            )));
        }
        self.parent_id = parent_id;
        self.touch(now);
        Ok(())
    }

    pub fn apply_delete(mut self, now: DateTime<Utc>) -> LocalDelete {
        if self.remote_id.is_none() {
            return LocalDelete::Drop;
        }
        self.updated_at = now.max(self.updated_at);
        self.revision += 1;
        self.sync_error = None;
        self.sync_state = SyncState::PendingDelete;
        LocalDelete::Tombstone(self)
    }

    /// Checks the remote-id / sync-state pairing.
    pub fn check_invariants(&self) -> Result<(), CoreError> {
        match (self.sync_state, &self.remote_id) {
            (SyncState::PendingCreate, None) => Ok(()),
            (SyncState::PendingCreate, Some(id)) => Err(CoreError::InvalidData(format!(
                "{} is pending create but already has remote id {id}",
                self.local_id
            ))),
            (state, None) => Err(CoreError::InvalidData(format!(
                "{} is {} without a remote id",
                self.local_id,
                state.as_str()
            ))),
            (_, Some(_)) => Ok(()),
        }
    }
}
