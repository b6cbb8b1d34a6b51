use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};

use fieldsync_core::{
    Entity, EntityKind, EntityPayload, LocalId, ParentId, RemoteId, SyncState, UserId,
};

use crate::error::CacheError;
use crate::traits::{CacheWrite, LocalCache};

const SELECT_COLUMNS: &str = "SELECT local_id, remote_id, kind, owner_id, parent_id, payload, sync_state, updated_at, sync_error, retry_after, attempts, revision FROM entities";

/// Convert Vec<u8> to fixed-size array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], CacheError> {
    v.try_into()
        .map_err(|_| CacheError::Serialization(format!("invalid {label} length")))
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64, label: &str) -> Result<DateTime<Utc>, CacheError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| CacheError::Serialization(format!("{label} out of range: {ms}")))
}

/// SQLite-backed [`LocalCache`]. One connection behind a mutex; every write is
/// its own transaction.
pub struct SqliteCache {
    conn: Mutex<Connection>,
}

impl SqliteCache {
    pub fn open(path: &str) -> Result<Self, CacheError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        log::debug!("opened entity cache at {path}");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, CacheError> {
        self.conn.lock().map_err(|_| CacheError::Poisoned)
    }

    fn query_entities(
        conn: &Connection,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Entity>, CacheError> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, RawEntity::read)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?.into_entity()?);
        }
        Ok(result)
    }

    fn select_one(conn: &Connection, local_id: LocalId) -> Result<Option<Entity>, CacheError> {
        let raw = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE local_id = ?1"),
                rusqlite::params![local_id.as_bytes().as_slice()],
                RawEntity::read,
            )
            .optional()?;
        raw.map(RawEntity::into_entity).transpose()
    }
}

fn upsert(conn: &Connection, entity: &Entity) -> Result<(), CacheError> {
    entity.check_invariants()?;
    let payload = entity
        .payload
        .to_msgpack()
        .map_err(|e| CacheError::Serialization(e.to_string()))?;
    conn.execute(
        "INSERT INTO entities (local_id, remote_id, kind, owner_id, parent_id, payload, sync_state, updated_at, sync_error, retry_after, attempts, revision)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(local_id) DO UPDATE SET remote_id = excluded.remote_id, kind = excluded.kind, owner_id = excluded.owner_id,
             parent_id = excluded.parent_id, payload = excluded.payload, sync_state = excluded.sync_state,
             updated_at = excluded.updated_at, sync_error = excluded.sync_error, retry_after = excluded.retry_after,
             attempts = excluded.attempts, revision = excluded.revision",
        rusqlite::params![
            entity.local_id.as_bytes().as_slice(),
            entity.remote_id.as_ref().map(RemoteId::as_str),
            entity.kind().as_str(),
            entity.owner_id.as_str(),
            entity.parent_id.to_string(),
            payload,
            entity.sync_state.as_str(),
            to_millis(entity.updated_at),
            entity.sync_error.as_deref(),
            entity.retry_after.map(to_millis),
            entity.attempts as i64,
            entity.revision as i64,
        ],
    )?;
    Ok(())
}

/// Hand `entity`'s remote id over from a synced copy cached under another
/// local id. Rows filed under that copy move to `entity`. A pending holder
/// is left in place and the unique index reports the conflict.
fn adopt_remote_id(conn: &Connection, entity: &Entity) -> Result<(), CacheError> {
    let Some(remote_id) = &entity.remote_id else {
        return Ok(());
    };
    let holder: Option<(Vec<u8>, String)> = conn
        .query_row(
            "SELECT local_id, sync_state FROM entities WHERE remote_id = ?1 AND local_id != ?2",
            rusqlite::params![remote_id.as_str(), entity.local_id.as_bytes().as_slice()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((other, state)) = holder else {
        return Ok(());
    };
    if state != SyncState::Synced.as_str() {
        return Ok(());
    }
    let other = LocalId::from_bytes(to_array::<16>(other, "local_id")?);
    conn.execute(
        "UPDATE entities SET parent_id = ?1 WHERE parent_id = ?2",
        rusqlite::params![
            ParentId::Local(entity.local_id).to_string(),
            ParentId::Local(other).to_string()
        ],
    )?;
    conn.execute(
        "DELETE FROM entities WHERE local_id = ?1",
        rusqlite::params![other.as_bytes().as_slice()],
    )?;
    log::debug!("{} takes over {remote_id} from cached copy {other}", entity.local_id);
    Ok(())
}

/// Column values as SQLite hands them back, before decoding.
struct RawEntity {
    local_id: Vec<u8>,
    remote_id: Option<String>,
    kind: String,
    owner_id: String,
    parent_id: String,
    payload: Vec<u8>,
    sync_state: String,
    updated_at: i64,
    sync_error: Option<String>,
    retry_after: Option<i64>,
    attempts: i64,
    revision: i64,
}

impl RawEntity {
    fn read(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            local_id: row.get(0)?,
            remote_id: row.get(1)?,
            kind: row.get(2)?,
            owner_id: row.get(3)?,
            parent_id: row.get(4)?,
            payload: row.get(5)?,
            sync_state: row.get(6)?,
            updated_at: row.get(7)?,
            sync_error: row.get(8)?,
            retry_after: row.get(9)?,
            attempts: row.get(10)?,
            revision: row.get(11)?,
        })
    }

    fn into_entity(self) -> Result<Entity, CacheError> {
        let local_id = LocalId::from_bytes(to_array::<16>(self.local_id, "local_id")?);
        let payload = EntityPayload::from_msgpack(&self.payload)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;
        let kind = EntityKind::parse(&self.kind)?;
        if payload.kind() != kind {
            return Err(CacheError::Serialization(format!(
                "{local_id}: stored kind {kind} does not match payload kind {}",
                payload.kind()
            )));
        }
        Ok(Entity {
            local_id,
            remote_id: self.remote_id.map(RemoteId::new).transpose()?,
            owner_id: UserId::new(self.owner_id)?,
            parent_id: self.parent_id.parse::<ParentId>()?,
            payload,
            sync_state: SyncState::parse(&self.sync_state)?,
            updated_at: from_millis(self.updated_at, "updated_at")?,
            sync_error: self.sync_error,
            retry_after: self
                .retry_after
                .map(|ms| from_millis(ms, "retry_after"))
                .transpose()?,
            attempts: u32::try_from(self.attempts)
                .map_err(|_| CacheError::Serialization("attempts out of range".into()))?,
            revision: u64::try_from(self.revision)
                .map_err(|_| CacheError::Serialization("revision out of range".into()))?,
        })
    }
}

impl LocalCache for SqliteCache {
    fn put(&self, entity: &Entity) -> Result<(), CacheError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        upsert(&tx, entity)?;
        tx.commit()?;
        Ok(())
    }

    fn get(&self, local_id: LocalId) -> Result<Option<Entity>, CacheError> {
        let conn = self.lock()?;
        Self::select_one(&conn, local_id)
    }

    fn list(
        &self,
        owner_id: &UserId,
        parent_id: Option<&ParentId>,
    ) -> Result<Vec<Entity>, CacheError> {
        let conn = self.lock()?;
        match parent_id {
            Some(parent) => Self::query_entities(
                &conn,
                &format!("{SELECT_COLUMNS} WHERE owner_id = ?1 AND parent_id = ?2 ORDER BY rowid"),
                &[&owner_id.as_str(), &parent.to_string()],
            ),
            None => Self::query_entities(
                &conn,
                &format!("{SELECT_COLUMNS} WHERE owner_id = ?1 ORDER BY rowid"),
                &[&owner_id.as_str()],
            ),
        }
    }

    fn remove(&self, local_id: LocalId) -> Result<bool, CacheError> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM entities WHERE local_id = ?1",
            rusqlite::params![local_id.as_bytes().as_slice()],
        )?;
        Ok(removed > 0)
    }

    fn modify(
        &self,
        local_id: LocalId,
        f: &mut dyn FnMut(Option<Entity>) -> CacheWrite,
    ) -> Result<Option<Entity>, CacheError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let current = Self::select_one(&tx, local_id)?;
        let after = match f(current.clone()) {
            CacheWrite::Keep => current,
            CacheWrite::Put(entity) => {
                if entity.local_id != local_id {
                    return Err(CacheError::Serialization(format!(
                        "modify of {local_id} tried to write {}",
                        entity.local_id
                    )));
                }
                adopt_remote_id(&tx, &entity)?;
                upsert(&tx, &entity)?;
                Some(entity)
            }
            CacheWrite::Remove => {
                tx.execute(
                    "DELETE FROM entities WHERE local_id = ?1",
                    rusqlite::params![local_id.as_bytes().as_slice()],
                )?;
                None
            }
        };
        tx.commit()?;
        Ok(after)
    }

    fn find_by_remote_id(&self, remote_id: &RemoteId) -> Result<Option<Entity>, CacheError> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE remote_id = ?1"),
                rusqlite::params![remote_id.as_str()],
                RawEntity::read,
            )
            .optional()?;
        raw.map(RawEntity::into_entity).transpose()
    }

    fn list_pending(&self, now: DateTime<Utc>) -> Result<Vec<Entity>, CacheError> {
        let conn = self.lock()?;
        Self::query_entities(
            &conn,
            &format!(
                "{SELECT_COLUMNS} WHERE sync_state != 'synced' AND sync_error IS NULL
                 AND (retry_after IS NULL OR retry_after <= ?1) ORDER BY updated_at, rowid"
            ),
            &[&to_millis(now)],
        )
    }

    fn list_failed(&self, owner_id: &UserId) -> Result<Vec<Entity>, CacheError> {
        let conn = self.lock()?;
        Self::query_entities(
            &conn,
            &format!("{SELECT_COLUMNS} WHERE owner_id = ?1 AND sync_error IS NOT NULL ORDER BY updated_at"),
            &[&owner_id.as_str()],
        )
    }

    fn pending_count(&self, owner_id: &UserId) -> Result<u64, CacheError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE owner_id = ?1 AND sync_state != 'synced'",
            rusqlite::params![owner_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use fieldsync_core::{FarmPayload, FieldPayload};

    fn user() -> UserId {
        UserId::new("user-u").unwrap()
    }

    fn farm_parent() -> ParentId {
        ParentId::Remote(RemoteId::new("farm-f").unwrap())
    }

    fn field(name: &str) -> Entity {
        Entity::new_local(
            user(),
            farm_parent(),
            EntityPayload::Field(FieldPayload::named(name)),
            Utc::now(),
        )
    }

    #[test]
    fn put_get_roundtrip() -> Result<(), CacheError> {
        let cache = SqliteCache::open_in_memory()?;
        let entity = field("North");
        cache.put(&entity)?;
        let loaded = cache.get(entity.local_id)?.expect("stored");
        assert_eq!(loaded.local_id, entity.local_id);
        assert_eq!(loaded.payload, entity.payload);
        assert_eq!(loaded.sync_state, SyncState::PendingCreate);
        assert_eq!(loaded.parent_id, farm_parent());
        assert_eq!(loaded.updated_at.timestamp_millis(), entity.updated_at.timestamp_millis());
        Ok(())
    }

    #[test]
    fn put_rejects_broken_invariants() -> Result<(), CacheError> {
        let cache = SqliteCache::open_in_memory()?;
        let mut entity = field("North");
        entity.sync_state = SyncState::Synced;
        assert!(matches!(cache.put(&entity), Err(CacheError::Core(_))));
        assert!(cache.get(entity.local_id)?.is_none());
        Ok(())
    }

    #[test]
    fn list_filters_by_owner_and_parent() -> Result<(), CacheError> {
        let cache = SqliteCache::open_in_memory()?;
        let a = field("A");
        let b = field("B");
        let mut other_parent = field("C");
        other_parent.parent_id = ParentId::Remote(RemoteId::new("farm-g").unwrap());
        let farm = Entity::new_local(
            user(),
            ParentId::Owner(user()),
            EntityPayload::Farm(FarmPayload {
                name: "Home".into(),
                location: None,
                size: None,
                size_unit: None,
            }),
            Utc::now(),
        );
        for e in [&a, &b, &other_parent, &farm] {
            cache.put(e)?;
        }
        let mut stranger = field("D");
        stranger.owner_id = UserId::new("user-v").unwrap();
        cache.put(&stranger)?;

        assert_eq!(cache.list(&user(), None)?.len(), 4);
        let under_f = cache.list(&user(), Some(&farm_parent()))?;
        let names: Vec<&str> = under_f.iter().map(|e| e.payload.label()).collect();
        assert_eq!(names, vec!["A", "B"]);
        Ok(())
    }

    #[test]
    fn modify_is_read_modify_write() -> Result<(), CacheError> {
        let cache = SqliteCache::open_in_memory()?;
        let entity = field("North");
        cache.put(&entity)?;

        let after = cache.modify(entity.local_id, &mut |current| {
            let mut e = current.expect("present");
            e.remote_id = Some(RemoteId::new("srv-1").unwrap());
            e.sync_state = SyncState::Synced;
            CacheWrite::Put(e)
        })?;
        assert_eq!(after.unwrap().sync_state, SyncState::Synced);
        assert!(cache.find_by_remote_id(&RemoteId::new("srv-1").unwrap())?.is_some());

        let gone = cache.modify(entity.local_id, &mut |_| CacheWrite::Remove)?;
        assert!(gone.is_none());
        assert!(cache.get(entity.local_id)?.is_none());

        let missing = cache.modify(LocalId::new(), &mut |current| {
            assert!(current.is_none());
            CacheWrite::Keep
        })?;
        assert!(missing.is_none());
        Ok(())
    }

    #[test]
    fn modify_takes_over_remote_id_from_synced_copy() -> Result<(), CacheError> {
        let cache = SqliteCache::open_in_memory()?;
        let srv = RemoteId::new("srv-1").unwrap();
        let original = field("North");
        cache.put(&original)?;
        let copy = Entity::from_remote(
            srv.clone(),
            user(),
            farm_parent(),
            EntityPayload::Field(FieldPayload::named("North")),
            Utc::now(),
        );
        cache.put(&copy)?;
        let child = Entity::new_local(
            user(),
            ParentId::Local(copy.local_id),
            EntityPayload::Field(FieldPayload::named("under copy")),
            Utc::now(),
        );
        cache.put(&child)?;

        cache.modify(original.local_id, &mut |current| {
            let mut e = current.expect("present");
            e.remote_id = Some(srv.clone());
            e.sync_state = SyncState::Synced;
            CacheWrite::Put(e)
        })?;

        assert!(cache.get(copy.local_id)?.is_none());
        let holder = cache.find_by_remote_id(&srv)?.expect("adopted");
        assert_eq!(holder.local_id, original.local_id);
        let child = cache.get(child.local_id)?.expect("child kept");
        assert_eq!(child.parent_id, ParentId::Local(original.local_id));
        Ok(())
    }

    #[test]
    fn modify_does_not_steal_remote_id_from_pending_row() -> Result<(), CacheError> {
        let cache = SqliteCache::open_in_memory()?;
        let srv = RemoteId::new("srv-1").unwrap();
        let mut holder = field("Edited");
        holder.remote_id = Some(srv.clone());
        holder.sync_state = SyncState::PendingUpdate;
        cache.put(&holder)?;
        let other = field("Other");
        cache.put(&other)?;

        let result = cache.modify(other.local_id, &mut |current| {
            let mut e = current.expect("present");
            e.remote_id = Some(srv.clone());
            e.sync_state = SyncState::Synced;
            CacheWrite::Put(e)
        });
        assert!(result.is_err());
        assert!(cache.get(holder.local_id)?.is_some());
        assert_eq!(
            cache.get(other.local_id)?.unwrap().sync_state,
            SyncState::PendingCreate
        );
        Ok(())
    }

    #[test]
    fn modify_rolls_back_on_invalid_write() -> Result<(), CacheError> {
        let cache = SqliteCache::open_in_memory()?;
        let entity = field("North");
        cache.put(&entity)?;
        let result = cache.modify(entity.local_id, &mut |current| {
            let mut e = current.expect("present");
            e.sync_state = SyncState::PendingUpdate;
            CacheWrite::Put(e)
        });
        assert!(result.is_err());
        assert_eq!(
            cache.get(entity.local_id)?.unwrap().sync_state,
            SyncState::PendingCreate
        );
        Ok(())
    }

    #[test]
    fn list_pending_honours_backoff_and_errors() -> Result<(), CacheError> {
        let cache = SqliteCache::open_in_memory()?;
        let now = Utc::now();
        let ready = field("ready");
        let mut backing_off = field("backing off");
        backing_off.retry_after = Some(now + Duration::minutes(5));
        let mut failed = field("failed");
        failed.sync_error = Some("rejected".into());
        let mut synced = field("synced");
        synced.remote_id = Some(RemoteId::new("srv-9").unwrap());
        synced.sync_state = SyncState::Synced;
        for e in [&ready, &backing_off, &failed, &synced] {
            cache.put(e)?;
        }

        let pending: Vec<LocalId> = cache.list_pending(now)?.iter().map(|e| e.local_id).collect();
        assert_eq!(pending, vec![ready.local_id]);

        let later = cache.list_pending(now + Duration::minutes(6))?;
        assert_eq!(later.len(), 2);

        let failed_rows = cache.list_failed(&user())?;
        assert_eq!(failed_rows.len(), 1);
        assert_eq!(failed_rows[0].sync_error.as_deref(), Some("rejected"));

        assert_eq!(cache.pending_count(&user())?, 3);
        Ok(())
    }

    #[test]
    fn survives_reopen() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("cache.db");
        let path = path.to_str().expect("utf-8 path");
        let entity = field("Durable");
        {
            let cache = SqliteCache::open(path)?;
            cache.put(&entity)?;
        }
        let cache = SqliteCache::open(path)?;
        let loaded = cache.get(entity.local_id)?.expect("persisted");
        assert_eq!(loaded.payload.label(), "Durable");
        Ok(())
    }

    #[test]
    fn remove_reports_whether_anything_was_deleted() -> Result<(), CacheError> {
        let cache = SqliteCache::open_in_memory()?;
        let entity = field("North");
        cache.put(&entity)?;
        assert!(cache.remove(entity.local_id)?);
        assert!(!cache.remove(entity.local_id)?);
        Ok(())
    }
}
