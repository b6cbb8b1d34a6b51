//! Decides whether a user may attach to, or act on, a given record.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, warn};

use fieldsync_core::{LocalId, ParentId, RemoteId, UserId};
use fieldsync_storage::{CacheError, LocalCache};

use crate::connectivity::ConnectivityMonitor;
use crate::error::GatewayError;
use crate::gateway::{RemoteGateway, with_timeout};

pub const REASON_NOT_OWNER: &str = "not owner";
pub const REASON_NOT_FOUND: &str = "not found";
pub const REASON_PARENT_MISMATCH: &str = "parent mismatch";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnershipVerdict {
    Allowed,
    Denied(String),
    /// Could not be established either way. Callers decide what that means.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessVerdict {
    Allowed,
    Denied(String),
}

impl OwnershipVerdict {
    fn denied(reason: &str) -> Self {
        Self::Denied(reason.to_string())
    }
}

/// Ownership checks with an online fast path and an offline fallback.
///
/// Online, a remote parent is looked up through the gateway (bounded by the
/// request timeout) and positive answers are remembered for the session.
/// Offline, only that memory counts; anything else is `Unknown` and left for
/// the remote store to settle at sync time.
pub struct OwnershipVerifier {
    cache: Arc<dyn LocalCache>,
    gateway: Arc<dyn RemoteGateway>,
    connectivity: Arc<ConnectivityMonitor>,
    request_timeout: Duration,
    verified: Mutex<HashSet<(UserId, RemoteId)>>,
}

impl OwnershipVerifier {
    pub fn new(
        cache: Arc<dyn LocalCache>,
        gateway: Arc<dyn RemoteGateway>,
        connectivity: Arc<ConnectivityMonitor>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            gateway,
            connectivity,
            request_timeout,
            verified: Mutex::new(HashSet::new()),
        }
    }

    /// May `user` attach a new child to `parent`?
    pub async fn verify_parent_ownership(
        &self,
        user: &UserId,
        parent: &ParentId,
    ) -> Result<OwnershipVerdict, CacheError> {
        match parent {
            ParentId::Owner(owner) => Ok(owner_verdict(user, owner)),
            ParentId::Local(local_id) => {
                let Some(entity) = self.cache.get(*local_id)? else {
                    return Ok(OwnershipVerdict::denied(REASON_NOT_FOUND));
                };
                if &entity.owner_id != user {
                    return Ok(OwnershipVerdict::denied(REASON_NOT_OWNER));
                }
                if entity.is_deleted() {
                    return Ok(OwnershipVerdict::denied(REASON_NOT_FOUND));
                }
                match &entity.remote_id {
                    Some(remote_id) => Ok(self.remote_verdict(user, remote_id).await),
                    // The remote store has not seen it yet.
                    None => Ok(OwnershipVerdict::Unknown),
                }
            }
            ParentId::Remote(remote_id) => Ok(self.remote_verdict(user, remote_id).await),
        }
    }

    /// May `user` modify or delete `local_id`, which the caller shows under
    /// `context`? A context naming the same parent by its other id is fine.
    pub async fn verify_entity_access(
        &self,
        user: &UserId,
        local_id: LocalId,
        context: &ParentId,
    ) -> Result<AccessVerdict, CacheError> {
        let Some(entity) = self.cache.get(local_id)? else {
            return Ok(AccessVerdict::Denied(REASON_NOT_FOUND.into()));
        };
        if &entity.owner_id != user {
            return Ok(AccessVerdict::Denied(REASON_NOT_OWNER.into()));
        }
        if !self.same_parent(&entity.parent_id, context)? {
            return Ok(AccessVerdict::Denied(REASON_PARENT_MISMATCH.into()));
        }
        Ok(AccessVerdict::Allowed)
    }

    /// The check the reconciler runs before every remote-bound operation on
    /// a child of `parent`. Always asks the remote store and never trusts the
    /// session memory. `Unknown` means "try again later".
    pub async fn verify_for_sync(
        &self,
        user: &UserId,
        parent: &ParentId,
    ) -> Result<OwnershipVerdict, CacheError> {
        match parent {
            ParentId::Owner(owner) => Ok(owner_verdict(user, owner)),
            ParentId::Local(local_id) => {
                let Some(entity) = self.cache.get(*local_id)? else {
                    return Ok(OwnershipVerdict::denied(REASON_NOT_FOUND));
                };
                if entity.is_deleted() {
                    return Ok(OwnershipVerdict::denied(REASON_NOT_FOUND));
                }
                if &entity.owner_id != user {
                    return Ok(OwnershipVerdict::denied(REASON_NOT_OWNER));
                }
                match &entity.remote_id {
                    Some(remote_id) => Ok(self.check_remote(user, remote_id, false).await),
                    None => Ok(OwnershipVerdict::Unknown),
                }
            }
            ParentId::Remote(remote_id) => Ok(self.check_remote(user, remote_id, false).await),
        }
    }

    /// Does `user` own the remote record itself? Used before remote deletes.
    pub async fn verify_record_for_sync(&self, user: &UserId, remote_id: &RemoteId) -> OwnershipVerdict {
        self.check_remote(user, remote_id, false).await
    }

    /// Forget everything remembered this session. Call on sign-out.
    pub fn clear_session(&self) {
        self.verified_set().clear();
    }

    fn verified_set(&self) -> std::sync::MutexGuard<'_, HashSet<(UserId, RemoteId)>> {
        self.verified.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remember(&self, user: &UserId, remote_id: &RemoteId) {
        self.verified_set().insert((user.clone(), remote_id.clone()));
    }

    fn forget(&self, user: &UserId, remote_id: &RemoteId) {
        self.verified_set().remove(&(user.clone(), remote_id.clone()));
    }

    fn is_remembered(&self, user: &UserId, remote_id: &RemoteId) -> bool {
        self.verified_set().contains(&(user.clone(), remote_id.clone()))
    }

    /// Both references name the same container, directly or through the
    /// cached local/remote id pairing.
    fn same_parent(&self, a: &ParentId, b: &ParentId) -> Result<bool, CacheError> {
        if a == b {
            return Ok(true);
        }
        let (local_a, remote_a) = self.resolve(a)?;
        let (local_b, remote_b) = self.resolve(b)?;
        Ok((local_a.is_some() && local_a == local_b) || (remote_a.is_some() && remote_a == remote_b))
    }

    fn resolve(&self, parent: &ParentId) -> Result<(Option<LocalId>, Option<RemoteId>), CacheError> {
        Ok(match parent {
            ParentId::Owner(_) => (None, None),
            ParentId::Local(local_id) => {
                (Some(*local_id), self.cache.get(*local_id)?.and_then(|e| e.remote_id))
            }
            ParentId::Remote(remote_id) => (
                self.cache.find_by_remote_id(remote_id)?.map(|e| e.local_id),
                Some(remote_id.clone()),
            ),
        })
    }

    fn remote_verdict_offline(&self, user: &UserId, remote_id: &RemoteId) -> OwnershipVerdict {
        if self.is_remembered(user, remote_id) {
            return OwnershipVerdict::Allowed;
        }
        debug!("ownership of {remote_id} unknown while offline");
        OwnershipVerdict::Unknown
    }

    async fn remote_verdict(&self, user: &UserId, remote_id: &RemoteId) -> OwnershipVerdict {
        if self.connectivity.is_online() {
            return self.check_remote(user, remote_id, true).await;
        }
        self.remote_verdict_offline(user, remote_id)
    }

    async fn check_remote(
        &self,
        user: &UserId,
        remote_id: &RemoteId,
        allow_fallback: bool,
    ) -> OwnershipVerdict {
        let lookup = with_timeout(self.request_timeout, self.gateway.get(user, remote_id)).await;
        match lookup {
            Ok(record) if &record.owner_id == user => {
                self.remember(user, remote_id);
                OwnershipVerdict::Allowed
            }
            Ok(_) | Err(GatewayError::Forbidden(_)) => {
                self.forget(user, remote_id);
                OwnershipVerdict::denied(REASON_NOT_OWNER)
            }
            Err(GatewayError::NotFound(_)) => {
                self.forget(user, remote_id);
                OwnershipVerdict::denied(REASON_NOT_FOUND)
            }
            Err(e) => {
                warn!("ownership check for {remote_id} failed: {e}");
                if allow_fallback {
                    self.remote_verdict_offline(user, remote_id)
                } else {
                    OwnershipVerdict::Unknown
                }
            }
        }
    }
}

fn owner_verdict(user: &UserId, owner: &UserId) -> OwnershipVerdict {
    if user == owner {
        OwnershipVerdict::Allowed
    } else {
        OwnershipVerdict::denied(REASON_NOT_OWNER)
    }
}
