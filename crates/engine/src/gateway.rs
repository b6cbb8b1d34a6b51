//! Contract with the remote data store.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;

use fieldsync_core::{EntityKind, EntityPayload, RemoteId, UserId};

use crate::error::GatewayError;

/// A record as the remote store returns it.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    pub remote_id: RemoteId,
    pub kind: EntityKind,
    pub owner_id: UserId,
    /// `None` for farms, which hang directly off the owner.
    pub parent: Option<RemoteId>,
    pub payload: EntityPayload,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateRequest {
    pub owner_id: UserId,
    pub parent: Option<RemoteId>,
    pub payload: EntityPayload,
}

/// Remote CRUD, always on behalf of an acting user. Implementations must
/// refuse with [`GatewayError::Forbidden`] when the actor does not own the
/// record or the parent it is attached to.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn create(&self, actor: &UserId, request: &CreateRequest) -> Result<RemoteId, GatewayError>;

    /// Replace the payload and (re)attach to `parent`.
    async fn update(
        &self,
        actor: &UserId,
        remote_id: &RemoteId,
        parent: Option<&RemoteId>,
        payload: &EntityPayload,
    ) -> Result<(), GatewayError>;

    async fn delete(&self, actor: &UserId, remote_id: &RemoteId) -> Result<(), GatewayError>;

    async fn get(&self, actor: &UserId, remote_id: &RemoteId) -> Result<RemoteRecord, GatewayError>;

    /// Records of `kind` owned by the actor, optionally under one parent.
    async fn list(
        &self,
        actor: &UserId,
        kind: EntityKind,
        parent: Option<&RemoteId>,
    ) -> Result<Vec<RemoteRecord>, GatewayError>;
}

/// Bound a gateway call. Expiry is reported as a transient failure.
pub async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, GatewayError>>,
) -> Result<T, GatewayError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::transient(format!(
            "no response within {}ms",
            limit.as_millis()
        ))),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Full(RemoteId),
    /// Only the mandatory fields were accepted. `rejected` is the remote
    /// store's reason for refusing the full record.
    Narrowed { remote_id: RemoteId, rejected: String },
}

impl CreateOutcome {
    pub fn remote_id(&self) -> &RemoteId {
        match self {
            Self::Full(id) | Self::Narrowed { remote_id: id, .. } => id,
        }
    }
}

/// Create, retrying exactly once with the minimal payload if the remote
/// store rejects the full one as a schema violation. A second rejection
/// surfaces the original error.
pub async fn create_with_fallback(
    gateway: &dyn RemoteGateway,
    actor: &UserId,
    request: &CreateRequest,
    limit: Duration,
) -> Result<CreateOutcome, GatewayError> {
    let original = match with_timeout(limit, gateway.create(actor, request)).await {
        Ok(remote_id) => return Ok(CreateOutcome::Full(remote_id)),
        Err(GatewayError::Validation(message)) if request.payload.has_optional_fields() => message,
        Err(e) => return Err(e),
    };

    warn!(
        "remote rejected {} '{}' ({original}), retrying with mandatory fields only",
        request.payload.kind(),
        request.payload.label()
    );
    let narrow = CreateRequest {
        payload: request.payload.minimal(),
        ..request.clone()
    };
    match with_timeout(limit, gateway.create(actor, &narrow)).await {
        Ok(remote_id) => Ok(CreateOutcome::Narrowed {
            remote_id,
            rejected: original,
        }),
        Err(GatewayError::Validation(_)) => Err(GatewayError::Validation(original)),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_core::FieldPayload;
    use std::sync::Mutex;

    /// Rejects any payload carrying a soil type.
    #[derive(Default)]
    struct SoilRejecting {
        creates: Mutex<Vec<EntityPayload>>,
        reject_everything: bool,
    }

    #[async_trait]
    impl RemoteGateway for SoilRejecting {
        async fn create(&self, _: &UserId, request: &CreateRequest) -> Result<RemoteId, GatewayError> {
            let mut creates = self.creates.lock().unwrap();
            creates.push(request.payload.clone());
            let has_soil = matches!(&request.payload, EntityPayload::Field(f) if f.soil_type.is_some());
            if self.reject_everything {
                return Err(GatewayError::validation(format!("attempt {} rejected", creates.len())));
            }
            if has_soil {
                return Err(GatewayError::validation("column \"soil_type\" does not exist"));
            }
            Ok(RemoteId::new(format!("srv-{}", creates.len())).unwrap())
        }

        async fn update(&self, _: &UserId, _: &RemoteId, _: Option<&RemoteId>, _: &EntityPayload) -> Result<(), GatewayError> {
            unreachable!()
        }

        async fn delete(&self, _: &UserId, _: &RemoteId) -> Result<(), GatewayError> {
            unreachable!()
        }

        async fn get(&self, _: &UserId, _: &RemoteId) -> Result<RemoteRecord, GatewayError> {
            unreachable!()
        }

        async fn list(&self, _: &UserId, _: EntityKind, _: Option<&RemoteId>) -> Result<Vec<RemoteRecord>, GatewayError> {
            unreachable!()
        }
    }

    fn request(soil: Option<&str>) -> CreateRequest {
        let mut field = FieldPayload::named("North");
        field.soil_type = soil.map(str::to_string);
        CreateRequest {
            owner_id: UserId::new("u").unwrap(),
            parent: Some(RemoteId::new("farm-1").unwrap()),
            payload: EntityPayload::Field(field),
        }
    }

    const LIMIT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn accepted_payload_is_created_once() {
        let gw = SoilRejecting::default();
        let req = request(None);
        let outcome = create_with_fallback(&gw, &req.owner_id, &req, LIMIT).await.unwrap();
        assert_eq!(outcome, CreateOutcome::Full(RemoteId::new("srv-1").unwrap()));
        assert_eq!(gw.creates.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn schema_rejection_narrows_exactly_once() {
        let gw = SoilRejecting::default();
        let req = request(Some("loam"));
        let outcome = create_with_fallback(&gw, &req.owner_id, &req, LIMIT).await.unwrap();
        match outcome {
            CreateOutcome::Narrowed { remote_id, rejected } => {
                assert_eq!(remote_id.as_str(), "srv-2");
                assert!(rejected.contains("soil_type"));
            }
            other => panic!("expected narrowed create, got {other:?}"),
        }
        let creates = gw.creates.lock().unwrap();
        assert_eq!(creates[1], req.payload.minimal());
    }

    #[tokio::test]
    async fn second_rejection_reports_the_original_error() {
        let gw = SoilRejecting {
            reject_everything: true,
            ..Default::default()
        };
        let req = request(Some("loam"));
        let err = create_with_fallback(&gw, &req.owner_id, &req, LIMIT).await.unwrap_err();
        assert_eq!(err, GatewayError::validation("attempt 1 rejected"));
        assert_eq!(gw.creates.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn minimal_payload_is_not_retried() {
        let gw = SoilRejecting {
            reject_everything: true,
            ..Default::default()
        };
        let req = request(None);
        assert!(create_with_fallback(&gw, &req.owner_id, &req, LIMIT).await.is_err());
        assert_eq!(gw.creates.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_transient() {
        let err = with_timeout(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<(), GatewayError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, GatewayError::Transient(_)));
    }
}
