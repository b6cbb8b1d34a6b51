use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use fieldsync_core::{EntityKind, EntityPayload, RemoteId, UserId};
use fieldsync_engine::{CreateRequest, GatewayError, RemoteGateway, RemoteRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Create,
    Update,
    Delete,
    Get,
    List,
}

/// One gateway call as the remote store saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub kind: CallKind,
    pub actor: UserId,
    /// Target record, or the assigned id for a successful create.
    pub remote_id: Option<RemoteId>,
    pub payload: Option<EntityPayload>,
}

struct Fault {
    call: CallKind,
    error: GatewayError,
}

struct RemoteState {
    records: BTreeMap<RemoteId, RemoteRecord>,
    next_id: u64,
    calls: Vec<RecordedCall>,
    faults: VecDeque<Fault>,
    latency: Option<Duration>,
    ack_delay: Option<Duration>,
    rejected_columns: Vec<&'static str>,
}

/// In-process stand-in for the remote data store. Enforces ownership the
/// way row-level security would, hands out `srv-N` ids, records every call,
/// and can be scripted to fail.
pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// First assigned id will be `srv-{first}`.
    pub fn starting_at(first: u64) -> Self {
        Self {
            state: Mutex::new(RemoteState {
                records: BTreeMap::new(),
                next_id: first,
                calls: Vec::new(),
                faults: VecDeque::new(),
                latency: None,
                ack_delay: None,
                rejected_columns: Vec::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next call of `call` with `error`. Faults queue in order.
    pub fn fail_next(&self, call: CallKind, error: GatewayError) {
        self.state().faults.push_back(Fault { call, error });
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state().latency = latency;
    }

    /// Hold back create responses after the record has been stored, as a
    /// slow network would.
    pub fn set_ack_delay(&self, delay: Option<Duration>) {
        self.state().ack_delay = delay;
    }

    /// Pretend the remote schema lacks these field columns: any write whose
    /// field payload sets one is a validation error.
    pub fn reject_field_columns(&self, columns: &[&'static str]) {
        self.state().rejected_columns = columns.to_vec();
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state().calls.clone()
    }

    pub fn count(&self, kind: CallKind) -> usize {
        self.state().calls.iter().filter(|c| c.kind == kind).count()
    }

    /// Writes only; ownership lookups and listings excluded.
    pub fn write_count(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| matches!(c.kind, CallKind::Create | CallKind::Update | CallKind::Delete))
            .count()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn record(&self, remote_id: &RemoteId) -> Option<RemoteRecord> {
        self.state().records.get(remote_id).cloned()
    }

    pub fn records_of(&self, owner: &UserId, kind: EntityKind) -> Vec<RemoteRecord> {
        self.state()
            .records
            .values()
            .filter(|r| &r.owner_id == owner && r.kind == kind)
            .cloned()
            .collect()
    }

    /// Insert a record directly, as if another device had created it.
    pub fn seed(
        &self,
        owner: &UserId,
        parent: Option<&RemoteId>,
        payload: EntityPayload,
    ) -> RemoteId {
        let mut state = self.state();
        let remote_id = state.assign_id();
        state.records.insert(
            remote_id.clone(),
            RemoteRecord {
                remote_id: remote_id.clone(),
                kind: payload.kind(),
                owner_id: owner.clone(),
                parent: parent.cloned(),
                payload,
                updated_at: Utc::now(),
            },
        );
        remote_id
    }

    /// Change a record directly, as if another device had edited it.
    pub fn edit(&self, remote_id: &RemoteId, payload: EntityPayload) {
        if let Some(record) = self.state().records.get_mut(remote_id) {
            record.payload = payload;
            record.updated_at = Utc::now();
        }
    }

    /// Remove a record directly, as if another device had deleted it.
    pub fn drop_record(&self, remote_id: &RemoteId) {
        self.state().records.remove(remote_id);
    }

    /// Log the call, wait out the latency, then apply the next matching
    /// fault if one is queued. Returns the call's position in the log.
    async fn enter(
        &self,
        kind: CallKind,
        actor: &UserId,
        remote_id: Option<&RemoteId>,
        payload: Option<&EntityPayload>,
    ) -> Result<usize, GatewayError> {
        let (index, latency) = {
            let mut state = self.state();
            state.calls.push(RecordedCall {
                kind,
                actor: actor.clone(),
                remote_id: remote_id.cloned(),
                payload: payload.cloned(),
            });
            (state.calls.len() - 1, state.latency)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state();
        match state.faults.iter().position(|f| f.call == kind) {
            Some(index) => Err(state
                .faults
                .remove(index)
                .map(|f| f.error)
                .unwrap_or_else(|| GatewayError::transient("fault vanished"))),
            None => Ok(index),
        }
    }
}

impl RemoteState {
    fn assign_id(&mut self) -> RemoteId {
        let id = self.next_id;
        self.next_id += 1;
        RemoteId::new(format!("srv-{id}")).expect("generated ids are non-empty")
    }

    fn owned(&self, actor: &UserId, remote_id: &RemoteId) -> Result<&RemoteRecord, GatewayError> {
        let record = self
            .records
            .get(remote_id)
            .ok_or_else(|| GatewayError::not_found(remote_id.to_string()))?;
        if &record.owner_id != actor {
            return Err(GatewayError::forbidden(format!("{remote_id} belongs to another user")));
        }
        Ok(record)
    }

    fn check_parent(
        &self,
        actor: &UserId,
        kind: EntityKind,
        parent: Option<&RemoteId>,
    ) -> Result<(), GatewayError> {
        match (kind.parent_kind(), parent) {
            (None, None) => Ok(()),
            (None, Some(_)) => Err(GatewayError::validation("farms have no parent")),
            (Some(_), None) => Err(GatewayError::validation(format!("{kind} requires a parent"))),
            (Some(expected), Some(parent)) => {
                let record = self.owned(actor, parent)?;
                if record.kind != expected {
                    return Err(GatewayError::validation(format!(
                        "{kind} cannot be filed under a {}",
                        record.kind
                    )));
                }
                Ok(())
            }
        }
    }

    fn check_columns(&self, payload: &EntityPayload) -> Result<(), GatewayError> {
        let EntityPayload::Field(field) = payload else {
            return Ok(());
        };
        let set = [
            ("size", field.size.is_some()),
            ("size_unit", field.size_unit.is_some()),
            ("boundary", field.boundary.is_some()),
            ("location_description", field.location_description.is_some()),
            ("soil_type", field.soil_type.is_some()),
            ("irrigation_type", field.irrigation_type.is_some()),
        ];
        for (column, present) in set {
            if present && self.rejected_columns.contains(&column) {
                return Err(GatewayError::validation(format!(
                    "column \"{column}\" of relation \"fields\" does not exist"
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteGateway for InMemoryRemote {
    async fn create(&self, actor: &UserId, request: &CreateRequest) -> Result<RemoteId, GatewayError> {
        let call = self.enter(CallKind::Create, actor, None, Some(&request.payload)).await?;
        let (remote_id, ack_delay) = {
            let mut state = self.state();
            if &request.owner_id != actor {
                return Err(GatewayError::forbidden("cannot create records for another user"));
            }
            state.check_parent(actor, request.payload.kind(), request.parent.as_ref())?;
            state.check_columns(&request.payload)?;

            let remote_id = state.assign_id();
            state.records.insert(
                remote_id.clone(),
                RemoteRecord {
                    remote_id: remote_id.clone(),
                    kind: request.payload.kind(),
                    owner_id: actor.clone(),
                    parent: request.parent.clone(),
                    payload: request.payload.clone(),
                    updated_at: Utc::now(),
                },
            );
            if let Some(call) = state.calls.get_mut(call) {
                call.remote_id = Some(remote_id.clone());
            }
            (remote_id, state.ack_delay)
        };
        if let Some(delay) = ack_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(remote_id)
    }

    async fn update(
        &self,
        actor: &UserId,
        remote_id: &RemoteId,
        parent: Option<&RemoteId>,
        payload: &EntityPayload,
    ) -> Result<(), GatewayError> {
        self.enter(CallKind::Update, actor, Some(remote_id), Some(payload)).await?;
        let mut state = self.state();
        let kind = state.owned(actor, remote_id)?.kind;
        if kind != payload.kind() {
            return Err(GatewayError::validation(format!("{remote_id} is a {kind}")));
        }
        state.check_parent(actor, kind, parent)?;
        state.check_columns(payload)?;

        if let Some(record) = state.records.get_mut(remote_id) {
            record.payload = payload.clone();
            record.parent = parent.cloned();
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn delete(&self, actor: &UserId, remote_id: &RemoteId) -> Result<(), GatewayError> {
        self.enter(CallKind::Delete, actor, Some(remote_id), None).await?;
        let mut state = self.state();
        state.owned(actor, remote_id)?;

        // Cascade like the foreign keys would.
        let mut doomed = vec![remote_id.clone()];
        let mut index = 0;
        while index < doomed.len() {
            let current = doomed[index].clone();
            doomed.extend(
                state
                    .records
                    .values()
                    .filter(|r| r.parent.as_ref() == Some(&current))
                    .map(|r| r.remote_id.clone()),
            );
            index += 1;
        }
        for id in doomed {
            state.records.remove(&id);
        }
        Ok(())
    }

    async fn get(&self, actor: &UserId, remote_id: &RemoteId) -> Result<RemoteRecord, GatewayError> {
        self.enter(CallKind::Get, actor, Some(remote_id), None).await?;
        self.state().owned(actor, remote_id).cloned()
    }

    async fn list(
        &self,
        actor: &UserId,
        kind: EntityKind,
        parent: Option<&RemoteId>,
    ) -> Result<Vec<RemoteRecord>, GatewayError> {
        self.enter(CallKind::List, actor, parent, None).await?;
        Ok(self
            .state()
            .records
            .values()
            .filter(|r| &r.owner_id == actor && r.kind == kind)
            .filter(|r| parent.is_none() || r.parent.as_ref() == parent)
            .cloned()
            .collect())
    }
}
