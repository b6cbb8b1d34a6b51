//! [`RemoteGateway`] over a PostgREST-style HTTP API.
//!
//! One table per entity kind. Remote ids handed out by this gateway are
//! qualified with the table name (`fields/3f2c...`) so that `get`, `update`
//! and `delete` can find the right table from the id alone.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use reqwest::StatusCode;
use serde_json::{Map, Value};

use fieldsync_core::{EntityKind, EntityPayload, RemoteId, UserId};

use crate::error::GatewayError;
use crate::gateway::{CreateRequest, RemoteGateway, RemoteRecord};

const MAX_LOG_BODY_CHARS: usize = 512;
const CONNECT_TIMEOUT_SECS: u64 = 10;

fn table(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Farm => "farms",
        EntityKind::Field => "fields",
        EntityKind::CropRecord => "crop_records",
        EntityKind::HistoryEvent => "field_history",
    }
}

fn kind_for_table(name: &str) -> Option<EntityKind> {
    EntityKind::ALL.into_iter().find(|kind| table(*kind) == name)
}

fn parent_column(kind: EntityKind) -> Option<&'static str> {
    match kind {
        EntityKind::Farm => None,
        EntityKind::Field => Some("farm_id"),
        EntityKind::CropRecord | EntityKind::HistoryEvent => Some("field_id"),
    }
}

fn qualify(kind: EntityKind, raw: &str) -> Result<RemoteId, GatewayError> {
    RemoteId::new(format!("{}/{raw}", table(kind)))
        .map_err(|e| GatewayError::transient(format!("unusable id in response: {e}")))
}

fn split_id(remote_id: &RemoteId) -> Result<(EntityKind, &str), GatewayError> {
    remote_id
        .as_str()
        .split_once('/')
        .and_then(|(t, raw)| Some((kind_for_table(t)?, raw)))
        .filter(|(_, raw)| !raw.is_empty())
        .ok_or_else(|| GatewayError::not_found(format!("{remote_id} is not an id from this store")))
}

/// Map an HTTP status to a retry class.
pub fn classify_status(status: u16, body: &str) -> GatewayError {
    let message = format!("HTTP {status}: {}", body.trim());
    match status {
        408 | 425 | 429 | 500..=599 => GatewayError::Transient(message),
        401 | 403 => GatewayError::Forbidden(message),
        404 => GatewayError::NotFound(message),
        400..=499 => GatewayError::Validation(message),
        _ => GatewayError::Transient(message),
    }
}

fn transport_error(err: reqwest::Error) -> GatewayError {
    GatewayError::transient(format!("transport: {err}"))
}

fn encode_row(
    owner: &UserId,
    parent: Option<&RemoteId>,
    payload: &EntityPayload,
) -> Result<Value, GatewayError> {
    let fields = match payload {
        EntityPayload::Farm(p) => serde_json::to_value(p),
        EntityPayload::Field(p) => serde_json::to_value(p),
        EntityPayload::CropRecord(p) => serde_json::to_value(p),
        EntityPayload::HistoryEvent(p) => serde_json::to_value(p),
    }
    .map_err(|e| GatewayError::validation(format!("payload not encodable: {e}")))?;
    let Value::Object(mut row) = fields else {
        return Err(GatewayError::validation("payload did not encode to an object"));
    };

    row.insert("user_id".into(), Value::String(owner.as_str().to_string()));
    let kind = payload.kind();
    if let Some(column) = parent_column(kind) {
        let parent = parent
            .ok_or_else(|| GatewayError::validation(format!("{kind} requires a parent")))?;
        let (_, raw) = split_id(parent)?;
        row.insert(column.into(), Value::String(raw.to_string()));
    }
    Ok(Value::Object(row))
}

fn text_field(row: &Map<String, Value>, key: &str) -> Option<String> {
    match row.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn decode_row(kind: EntityKind, row: Value) -> Result<RemoteRecord, GatewayError> {
    let malformed = |what: &str| GatewayError::transient(format!("malformed {kind} row: {what}"));
    let Value::Object(map) = &row else {
        return Err(malformed("not an object"));
    };

    let raw_id = text_field(map, "id").ok_or_else(|| malformed("missing id"))?;
    let owner = text_field(map, "user_id").ok_or_else(|| malformed("missing user_id"))?;
    let owner_id = UserId::new(owner).map_err(|e| malformed(&e.to_string()))?;
    let parent = match parent_column(kind) {
        Some(column) => match text_field(map, column) {
            Some(raw) => Some(qualify(kind.parent_kind().unwrap_or(kind), &raw)?),
            None => None,
        },
        None => None,
    };
    let updated_at: DateTime<Utc> = map
        .get("updated_at")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| malformed(&e.to_string()))?
        .unwrap_or_else(Utc::now);

    let payload = match kind {
        EntityKind::Farm => serde_json::from_value(row.clone()).map(EntityPayload::Farm),
        EntityKind::Field => serde_json::from_value(row.clone()).map(EntityPayload::Field),
        EntityKind::CropRecord => serde_json::from_value(row.clone()).map(EntityPayload::CropRecord),
        EntityKind::HistoryEvent => {
            serde_json::from_value(row.clone()).map(EntityPayload::HistoryEvent)
        }
    }
    .map_err(|e| malformed(&e.to_string()))?;

    Ok(RemoteRecord {
        remote_id: qualify(kind, &raw_id)?,
        kind,
        owner_id,
        parent,
        payload,
        updated_at,
    })
}

#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    access_token: String,
}

impl HttpGateway {
    /// `access_token` is the session's bearer token; obtaining it is the
    /// host's concern.
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        access_token: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(transport_error)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            access_token: access_token.into(),
        })
    }

    fn url(&self, kind: EntityKind) -> String {
        format!("{}/rest/v1/{}", self.base_url, table(kind))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Vec<Value>, GatewayError> {
        let response = request
            .header("apikey", &self.api_key)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        log_response(status, &body);

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &body));
        }
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&body)
            .map_err(|e| GatewayError::transient(format!("unreadable response body: {e}")))
    }

    async fn fetch(&self, remote_id: &RemoteId) -> Result<RemoteRecord, GatewayError> {
        let (kind, raw) = split_id(remote_id)?;
        let rows = self
            .send(
                self.client
                    .get(self.url(kind))
                    .query(&[("id", format!("eq.{raw}")), ("select", "*".into())]),
            )
            .await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::not_found(remote_id.to_string()))?;
        decode_row(kind, row)
    }

    /// Fetch and insist the actor owns it.
    async fn fetch_owned(&self, actor: &UserId, remote_id: &RemoteId) -> Result<RemoteRecord, GatewayError> {
        let record = self.fetch(remote_id).await?;
        if &record.owner_id != actor {
            return Err(GatewayError::forbidden(format!("{remote_id} belongs to another user")));
        }
        Ok(record)
    }
}

fn log_response(status: StatusCode, body: &str) {
    if status.is_success() {
        debug!("remote response status: {status}");
        return;
    }
    let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
    if body.chars().count() > MAX_LOG_BODY_CHARS {
        preview.push_str("...");
    }
    debug!("remote response error ({status}): {preview}");
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    async fn create(&self, actor: &UserId, request: &CreateRequest) -> Result<RemoteId, GatewayError> {
        if &request.owner_id != actor {
            return Err(GatewayError::forbidden("cannot create records for another user"));
        }
        let kind = request.payload.kind();
        let row = encode_row(&request.owner_id, request.parent.as_ref(), &request.payload)?;
        let rows = self
            .send(
                self.client
                    .post(self.url(kind))
                    .header("Prefer", "return=representation")
                    .json(&row),
            )
            .await?;
        let created = rows
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::transient("create returned no row"))?;
        Ok(decode_row(kind, created)?.remote_id)
    }

    async fn update(
        &self,
        actor: &UserId,
        remote_id: &RemoteId,
        parent: Option<&RemoteId>,
        payload: &EntityPayload,
    ) -> Result<(), GatewayError> {
        let current = self.fetch_owned(actor, remote_id).await?;
        if current.kind != payload.kind() {
            return Err(GatewayError::validation(format!(
                "{remote_id} is a {}, not a {}",
                current.kind,
                payload.kind()
            )));
        }
        let (kind, raw) = split_id(remote_id)?;
        let mut row = encode_row(actor, parent, payload)?;
        if let Value::Object(map) = &mut row {
            map.insert("updated_at".into(), Value::String(Utc::now().to_rfc3339()));
        }
        let rows = self
            .send(
                self.client
                    .patch(self.url(kind))
                    .query(&[("id", format!("eq.{raw}")), ("user_id", format!("eq.{actor}"))])
                    .header("Prefer", "return=representation")
                    .json(&row),
            )
            .await?;
        if rows.is_empty() {
            return Err(GatewayError::not_found(remote_id.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, actor: &UserId, remote_id: &RemoteId) -> Result<(), GatewayError> {
        self.fetch_owned(actor, remote_id).await?;
        let (kind, raw) = split_id(remote_id)?;
        self.send(
            self.client
                .delete(self.url(kind))
                .query(&[("id", format!("eq.{raw}")), ("user_id", format!("eq.{actor}"))]),
        )
        .await?;
        Ok(())
    }

    async fn get(&self, actor: &UserId, remote_id: &RemoteId) -> Result<RemoteRecord, GatewayError> {
        self.fetch_owned(actor, remote_id).await
    }

    async fn list(
        &self,
        actor: &UserId,
        kind: EntityKind,
        parent: Option<&RemoteId>,
    ) -> Result<Vec<RemoteRecord>, GatewayError> {
        let mut query = vec![
            ("select".to_string(), "*".to_string()),
            ("user_id".to_string(), format!("eq.{actor}")),
        ];
        if let (Some(column), Some(parent)) = (parent_column(kind), parent) {
            let (_, raw) = split_id(parent)?;
            query.push((column.to_string(), format!("eq.{raw}")));
        }
        let rows = self.send(self.client.get(self.url(kind)).query(&query)).await?;
        rows.into_iter().map(|row| decode_row(kind, row)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_core::FieldPayload;
    use serde_json::json;

    #[test]
    fn statuses_map_to_retry_classes() {
        for status in [408, 425, 429, 500, 502, 503] {
            assert!(matches!(classify_status(status, ""), GatewayError::Transient(_)), "{status}");
        }
        assert!(matches!(classify_status(401, ""), GatewayError::Forbidden(_)));
        assert!(matches!(classify_status(403, ""), GatewayError::Forbidden(_)));
        assert!(matches!(classify_status(404, ""), GatewayError::NotFound(_)));
        assert!(matches!(classify_status(400, "bad"), GatewayError::Validation(m) if m.contains("bad")));
        assert!(matches!(classify_status(409, ""), GatewayError::Validation(_)));
    }

    #[test]
    fn field_rows_carry_owner_and_farm_column() {
        let mut field = FieldPayload::named("North");
        field.soil_type = Some("loam".into());
        let owner = UserId::new("user-1").unwrap();
        let farm = RemoteId::new("farms/abc").unwrap();
        let row = encode_row(&owner, Some(&farm), &EntityPayload::Field(field)).unwrap();
        assert_eq!(row["user_id"], "user-1");
        assert_eq!(row["farm_id"], "abc");
        assert_eq!(row["soil_type"], "loam");
        assert_eq!(row["name"], "North");
    }

    #[test]
    fn children_need_a_parent() {
        let owner = UserId::new("user-1").unwrap();
        let payload = EntityPayload::Field(FieldPayload::named("North"));
        assert!(matches!(
            encode_row(&owner, None, &payload),
            Err(GatewayError::Validation(_))
        ));
    }

    #[test]
    fn rows_decode_with_qualified_ids() {
        let row = json!({
            "id": "f-9",
            "user_id": "user-1",
            "farm_id": "abc",
            "name": "North",
            "size": 4.5,
            "soil_type": null,
            "created_at": "2025-01-01T00:00:00Z",
            "updated_at": "2025-01-02T00:00:00Z"
        });
        let record = decode_row(EntityKind::Field, row).unwrap();
        assert_eq!(record.remote_id.as_str(), "fields/f-9");
        assert_eq!(record.parent.unwrap().as_str(), "farms/abc");
        assert_eq!(record.owner_id.as_str(), "user-1");
        match record.payload {
            EntityPayload::Field(f) => {
                assert_eq!(f.size, Some(4.5));
                assert_eq!(f.soil_type, None);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn foreign_ids_are_not_found() {
        let id = RemoteId::new("srv-42").unwrap();
        assert!(matches!(split_id(&id), Err(GatewayError::NotFound(_))));
        let id = RemoteId::new("fields/f-1").unwrap();
        assert_eq!(split_id(&id).unwrap(), (EntityKind::Field, "f-1"));
    }
}
