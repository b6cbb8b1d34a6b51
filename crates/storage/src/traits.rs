use chrono::{DateTime, Utc};

use fieldsync_core::{Entity, LocalId, ParentId, RemoteId, UserId};

use crate::error::CacheError;

/// Outcome of a [`LocalCache::modify`] closure.
#[derive(Debug)]
pub enum CacheWrite {
    /// Leave the record as it is.
    Keep,
    /// Store this snapshot under the same local id.
    Put(Entity),
    /// Delete the record.
    Remove,
}

/// Durable on-device store of entity snapshots keyed by local id.
///
/// Every method is durable before it returns. Implementations serialize all
/// writes, so two mutations of the same local id are applied in the order
/// they were submitted.
pub trait LocalCache: Send + Sync {
    fn put(&self, entity: &Entity) -> Result<(), CacheError>;

    fn get(&self, local_id: LocalId) -> Result<Option<Entity>, CacheError>;

    /// Entities owned by `owner_id`, optionally restricted to one parent.
    fn list(
        &self,
        owner_id: &UserId,
        parent_id: Option<&ParentId>,
    ) -> Result<Vec<Entity>, CacheError>;

    /// Returns whether a record was removed.
    fn remove(&self, local_id: LocalId) -> Result<bool, CacheError>;

    /// Atomic read-modify-write of one record. `f` sees the current snapshot
    /// (or `None`) and decides what to store. Returns the snapshot as stored
    /// afterwards.
    ///
    /// Storing a remote id that a `Synced` row under another local id already
    /// carries replaces that row: its children are re-filed under `local_id`
    /// and the copy is dropped in the same transaction.
    fn modify(
        &self,
        local_id: LocalId,
        f: &mut dyn FnMut(Option<Entity>) -> CacheWrite,
    ) -> Result<Option<Entity>, CacheError>;

    fn find_by_remote_id(&self, remote_id: &RemoteId) -> Result<Option<Entity>, CacheError>;

    /// Pending entities eligible for a sync attempt at `now`: no permanent
    /// error and no backoff window still open.
    fn list_pending(&self, now: DateTime<Utc>) -> Result<Vec<Entity>, CacheError>;

    /// Entities carrying a permanent sync error.
    fn list_failed(&self, owner_id: &UserId) -> Result<Vec<Entity>, CacheError>;

    /// Entities not yet confirmed by the remote store, failed ones included.
    fn pending_count(&self, owner_id: &UserId) -> Result<u64, CacheError>;
}
