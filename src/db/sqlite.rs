use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use parking_lot::Mutex;

use super::DatabaseError;
use super::models::{BlacklistRule, ControlRoom, MonitoredRoom, ResponseModeRule};
use crate::db::schema_sqlite::{
    blacklists, control_rooms, generated_messages, latest_reply_links, monitored_rooms,
    reply_links, response_modes, transaction_events, transactions,
};

pub type SharedConnection = Arc<Mutex<SqliteConnection>>;

// Helper function to convert DateTime to ISO string for SQLite
fn datetime_to_string(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

// Helper function to parse ISO string to DateTime
fn string_to_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Query(format!("invalid datetime format: {}", e)))
}

fn query_error(e: diesel::result::Error) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}

pub(crate) fn establish_connection(path: &str) -> Result<SqliteConnection, DatabaseError> {
    let mut conn =
        SqliteConnection::establish(path).map_err(|e| DatabaseError::Connection(e.to_string()))?;
    for pragma in [
        "PRAGMA foreign_keys = ON",
        "PRAGMA busy_timeout = 5000",
        "PRAGMA journal_mode = WAL",
    ] {
        diesel::sql_query(pragma)
            .execute(&mut conn)
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
    }
    Ok(conn)
}

/// Runs a blocking diesel closure against the shared connection.
pub(crate) async fn with_connection<F, T>(conn: &SharedConnection, f: F) -> Result<T, DatabaseError>
where
    F: FnOnce(&mut SqliteConnection) -> Result<T, DatabaseError> + Send + 'static,
    T: Send + 'static,
{
    let conn = conn.clone();
    tokio::task::spawn_blocking(move || {
        let mut guard = conn.lock();
        f(&mut guard)
    })
    .await
    .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = control_rooms)]
struct DbControlRoom {
    owner_user_id: String,
    room_id: String,
    access_token: Option<String>,
    pending_rename: bool,
    created_at: String,
}

impl DbControlRoom {
    fn to_control_room(&self) -> Result<ControlRoom, DatabaseError> {
        Ok(ControlRoom {
            owner_user_id: self.owner_user_id.clone(),
            room_id: self.room_id.clone(),
            access_token: self.access_token.clone(),
            pending_rename: self.pending_rename,
            created_at: string_to_datetime(&self.created_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = control_rooms)]
struct NewControlRoom<'a> {
    owner_user_id: &'a str,
    room_id: &'a str,
    access_token: Option<&'a str>,
    pending_rename: bool,
    created_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = monitored_rooms)]
struct DbMonitoredRoom {
    room_id: String,
    mimic_user_id: Option<String>,
    created_at: String,
}

impl DbMonitoredRoom {
    fn to_monitored_room(&self) -> Result<MonitoredRoom, DatabaseError> {
        Ok(MonitoredRoom {
            room_id: self.room_id.clone(),
            mimic_user_id: self.mimic_user_id.clone(),
            created_at: string_to_datetime(&self.created_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = monitored_rooms)]
struct NewMonitoredRoom<'a> {
    room_id: &'a str,
    mimic_user_id: Option<&'a str>,
    created_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = response_modes)]
struct DbResponseMode {
    mimic_user_id: String,
    room_id: Option<String>,
    replace_original: bool,
}

impl From<DbResponseMode> for ResponseModeRule {
    fn from(row: DbResponseMode) -> Self {
        Self {
            mimic_user_id: row.mimic_user_id,
            room_id: row.room_id,
            replace_original: row.replace_original,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = blacklists)]
struct DbBlacklist {
    mimic_user_id: String,
    room_id: Option<String>,
    pattern: String,
}

impl From<DbBlacklist> for BlacklistRule {
    fn from(row: DbBlacklist) -> Self {
        Self {
            mimic_user_id: row.mimic_user_id,
            room_id: row.room_id,
            pattern: row.pattern,
        }
    }
}

pub struct SqliteRoomStore {
    conn: SharedConnection,
}

impl SqliteRoomStore {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }
}

fn load_control_room_by_owner(
    conn: &mut SqliteConnection,
    owner: &str,
) -> Result<Option<ControlRoom>, DatabaseError> {
    use crate::db::schema_sqlite::control_rooms::dsl::*;
    control_rooms
        .filter(owner_user_id.eq(owner))
        .select(DbControlRoom::as_select())
        .first::<DbControlRoom>(conn)
        .optional()
        .map_err(query_error)?
        .map(|r| r.to_control_room())
        .transpose()
}

fn load_monitored_room(
    conn: &mut SqliteConnection,
    target_room: &str,
) -> Result<Option<MonitoredRoom>, DatabaseError> {
    use crate::db::schema_sqlite::monitored_rooms::dsl::*;
    monitored_rooms
        .filter(room_id.eq(target_room))
        .select(DbMonitoredRoom::as_select())
        .first::<DbMonitoredRoom>(conn)
        .optional()
        .map_err(query_error)?
        .map(|r| r.to_monitored_room())
        .transpose()
}

#[async_trait]
impl super::RoomStore for SqliteRoomStore {
    async fn get_control_room_by_owner(
        &self,
        owner_user_id: &str,
    ) -> Result<Option<ControlRoom>, DatabaseError> {
        let owner = owner_user_id.to_string();
        with_connection(&self.conn, move |conn| {
            load_control_room_by_owner(conn, &owner)
        })
        .await
    }

    async fn get_control_room_by_room(
        &self,
        room_id: &str,
    ) -> Result<Option<ControlRoom>, DatabaseError> {
        let target = room_id.to_string();
        with_connection(&self.conn, move |conn| {
            control_rooms::table
                .filter(control_rooms::room_id.eq(target))
                .select(DbControlRoom::as_select())
                .first::<DbControlRoom>(conn)
                .optional()
                .map_err(query_error)?
                .map(|r| r.to_control_room())
                .transpose()
        })
        .await
    }

    async fn create_control_room(
        &self,
        owner_user_id: &str,
        room_id: &str,
        pending_rename: bool,
    ) -> Result<ControlRoom, DatabaseError> {
        let owner = owner_user_id.to_string();
        let room = room_id.to_string();
        with_connection(&self.conn, move |conn| {
            let created_at = Utc::now();
            let new_room = NewControlRoom {
                owner_user_id: &owner,
                room_id: &room,
                access_token: None,
                pending_rename,
                created_at: datetime_to_string(&created_at),
            };
            diesel::insert_into(control_rooms::table)
                .values(&new_room)
                .execute(conn)
                .map_err(query_error)?;
            load_control_room_by_owner(conn, &owner)?
                .ok_or_else(|| DatabaseError::NotFound(format!("control room for {owner}")))
        })
        .await
    }

    async fn delete_control_room(&self, room_id: &str) -> Result<bool, DatabaseError> {
        let target = room_id.to_string();
        with_connection(&self.conn, move |conn| {
            diesel::delete(control_rooms::table.filter(control_rooms::room_id.eq(target)))
                .execute(conn)
                .map(|count| count > 0)
                .map_err(query_error)
        })
        .await
    }

    async fn set_access_token(
        &self,
        owner_user_id: &str,
        access_token: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let owner = owner_user_id.to_string();
        let token = access_token.map(ToOwned::to_owned);
        with_connection(&self.conn, move |conn| {
            let Some(existing) = load_control_room_by_owner(conn, &owner)? else {
                return Err(DatabaseError::NotFound(format!("control room for {owner}")));
            };
            diesel::update(
                control_rooms::table.filter(control_rooms::owner_user_id.eq(&owner)),
            )
            .set(control_rooms::access_token.eq(token))
            .execute(conn)
            .map_err(query_error)?;
            Ok(existing.access_token.is_some())
        })
        .await
    }

    async fn clear_pending_rename(&self, room_id: &str) -> Result<(), DatabaseError> {
        let target = room_id.to_string();
        with_connection(&self.conn, move |conn| {
            diesel::update(control_rooms::table.filter(control_rooms::room_id.eq(target)))
                .set(control_rooms::pending_rename.eq(false))
                .execute(conn)
                .map(|_| ())
                .map_err(query_error)
        })
        .await
    }

    async fn get_monitored_room(
        &self,
        room_id: &str,
    ) -> Result<Option<MonitoredRoom>, DatabaseError> {
        let target = room_id.to_string();
        with_connection(&self.conn, move |conn| load_monitored_room(conn, &target)).await
    }

    async fn create_monitored_room(&self, room_id: &str) -> Result<MonitoredRoom, DatabaseError> {
        let room = room_id.to_string();
        with_connection(&self.conn, move |conn| {
            let new_room = NewMonitoredRoom {
                room_id: &room,
                mimic_user_id: None,
                created_at: datetime_to_string(&Utc::now()),
            };
            diesel::insert_or_ignore_into(monitored_rooms::table)
                .values(&new_room)
                .execute(conn)
                .map_err(query_error)?;
            load_monitored_room(conn, &room)?
                .ok_or_else(|| DatabaseError::NotFound(format!("monitored room {room}")))
        })
        .await
    }

    async fn delete_monitored_room(&self, room_id: &str) -> Result<bool, DatabaseError> {
        let target = room_id.to_string();
        with_connection(&self.conn, move |conn| {
            diesel::delete(monitored_rooms::table.filter(monitored_rooms::room_id.eq(target)))
                .execute(conn)
                .map(|count| count > 0)
                .map_err(query_error)
        })
        .await
    }

    async fn set_mimic_user(
        &self,
        room_id: &str,
        mimic_user_id: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let target = room_id.to_string();
        let mimic = mimic_user_id.map(ToOwned::to_owned);
        with_connection(&self.conn, move |conn| {
            let updated = diesel::update(
                monitored_rooms::table.filter(monitored_rooms::room_id.eq(&target)),
            )
            .set(monitored_rooms::mimic_user_id.eq(mimic))
            .execute(conn)
            .map_err(query_error)?;
            if updated == 0 {
                return Err(DatabaseError::NotFound(format!("monitored room {target}")));
            }
            Ok(())
        })
        .await
    }

    async fn rooms_mimicked_by(&self, user_id: &str) -> Result<Vec<String>, DatabaseError> {
        let user = user_id.to_string();
        with_connection(&self.conn, move |conn| {
            use crate::db::schema_sqlite::monitored_rooms::dsl::*;
            monitored_rooms
                .filter(mimic_user_id.eq(user))
                .order(room_id.asc())
                .select(room_id)
                .load::<String>(conn)
                .map_err(query_error)
        })
        .await
    }

    async fn list_monitored_rooms(&self) -> Result<Vec<MonitoredRoom>, DatabaseError> {
        with_connection(&self.conn, move |conn| {
            use crate::db::schema_sqlite::monitored_rooms::dsl::*;
            let results = monitored_rooms
                .order(room_id.asc())
                .select(DbMonitoredRoom::as_select())
                .load::<DbMonitoredRoom>(conn)
                .map_err(query_error)?;
            results.iter().map(|r| r.to_monitored_room()).collect()
        })
        .await
    }
}

pub struct SqliteRuleStore {
    conn: SharedConnection,
}

impl SqliteRuleStore {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }
}

fn load_response_mode(
    conn: &mut SqliteConnection,
    user: &str,
    room: Option<&str>,
) -> Result<Option<DbResponseMode>, DatabaseError> {
    use crate::db::schema_sqlite::response_modes::dsl::*;
    let scoped = response_modes.filter(mimic_user_id.eq(user));
    match room {
        Some(room) => scoped
            .filter(room_id.eq(room))
            .select(DbResponseMode::as_select())
            .first::<DbResponseMode>(conn),
        None => scoped
            .filter(room_id.is_null())
            .select(DbResponseMode::as_select())
            .first::<DbResponseMode>(conn),
    }
    .optional()
    .map_err(query_error)
}

fn delete_response_mode(
    conn: &mut SqliteConnection,
    user: &str,
    room: Option<&str>,
) -> Result<bool, DatabaseError> {
    use crate::db::schema_sqlite::response_modes::dsl::*;
    let scoped = response_modes.filter(mimic_user_id.eq(user));
    match room {
        Some(room) => diesel::delete(scoped.filter(room_id.eq(room))).execute(conn),
        None => diesel::delete(scoped.filter(room_id.is_null())).execute(conn),
    }
    .map(|count| count > 0)
    .map_err(query_error)
}

fn load_blacklist(
    conn: &mut SqliteConnection,
    user: &str,
    room: Option<&str>,
) -> Result<Option<DbBlacklist>, DatabaseError> {
    use crate::db::schema_sqlite::blacklists::dsl::*;
    let scoped = blacklists.filter(mimic_user_id.eq(user));
    match room {
        Some(room) => scoped
            .filter(room_id.eq(room))
            .select(DbBlacklist::as_select())
            .first::<DbBlacklist>(conn),
        None => scoped
            .filter(room_id.is_null())
            .select(DbBlacklist::as_select())
            .first::<DbBlacklist>(conn),
    }
    .optional()
    .map_err(query_error)
}

fn delete_blacklist(
    conn: &mut SqliteConnection,
    user: &str,
    room: Option<&str>,
) -> Result<bool, DatabaseError> {
    use crate::db::schema_sqlite::blacklists::dsl::*;
    let scoped = blacklists.filter(mimic_user_id.eq(user));
    match room {
        Some(room) => diesel::delete(scoped.filter(room_id.eq(room))).execute(conn),
        None => diesel::delete(scoped.filter(room_id.is_null())).execute(conn),
    }
    .map(|count| count > 0)
    .map_err(query_error)
}

#[async_trait]
impl super::RuleStore for SqliteRuleStore {
    async fn get_response_mode(
        &self,
        mimic_user_id: &str,
        room_id: Option<&str>,
    ) -> Result<Option<ResponseModeRule>, DatabaseError> {
        let user = mimic_user_id.to_string();
        let room = room_id.map(ToOwned::to_owned);
        with_connection(&self.conn, move |conn| {
            Ok(load_response_mode(conn, &user, room.as_deref())?.map(Into::into))
        })
        .await
    }

    async fn set_response_mode(
        &self,
        mimic_user_id: &str,
        room_id: Option<&str>,
        replace_original: bool,
    ) -> Result<(), DatabaseError> {
        let user = mimic_user_id.to_string();
        let room = room_id.map(ToOwned::to_owned);
        with_connection(&self.conn, move |conn| {
            delete_response_mode(conn, &user, room.as_deref())?;
            diesel::insert_into(response_modes::table)
                .values((
                    response_modes::mimic_user_id.eq(&user),
                    response_modes::room_id.eq(room.as_deref()),
                    response_modes::replace_original.eq(replace_original),
                ))
                .execute(conn)
                .map(|_| ())
                .map_err(query_error)
        })
        .await
    }

    async fn clear_response_mode(
        &self,
        mimic_user_id: &str,
        room_id: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let user = mimic_user_id.to_string();
        let room = room_id.map(ToOwned::to_owned);
        with_connection(&self.conn, move |conn| {
            delete_response_mode(conn, &user, room.as_deref())
        })
        .await
    }

    async fn get_blacklist(
        &self,
        mimic_user_id: &str,
        room_id: Option<&str>,
    ) -> Result<Option<BlacklistRule>, DatabaseError> {
        let user = mimic_user_id.to_string();
        let room = room_id.map(ToOwned::to_owned);
        with_connection(&self.conn, move |conn| {
            Ok(load_blacklist(conn, &user, room.as_deref())?.map(Into::into))
        })
        .await
    }

    async fn set_blacklist(
        &self,
        mimic_user_id: &str,
        room_id: Option<&str>,
        pattern: &str,
    ) -> Result<(), DatabaseError> {
        let user = mimic_user_id.to_string();
        let room = room_id.map(ToOwned::to_owned);
        let pattern = pattern.to_string();
        with_connection(&self.conn, move |conn| {
            delete_blacklist(conn, &user, room.as_deref())?;
            diesel::insert_into(blacklists::table)
                .values((
                    blacklists::mimic_user_id.eq(&user),
                    blacklists::room_id.eq(room.as_deref()),
                    blacklists::pattern.eq(&pattern),
                ))
                .execute(conn)
                .map(|_| ())
                .map_err(query_error)
        })
        .await
    }

    async fn clear_blacklist(
        &self,
        mimic_user_id: &str,
        room_id: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let user = mimic_user_id.to_string();
        let room = room_id.map(ToOwned::to_owned);
        with_connection(&self.conn, move |conn| {
            delete_blacklist(conn, &user, room.as_deref())
        })
        .await
    }

    async fn clear_room_rules(
        &self,
        mimic_user_id: &str,
        room_id: &str,
    ) -> Result<(), DatabaseError> {
        let user = mimic_user_id.to_string();
        let room = room_id.to_string();
        with_connection(&self.conn, move |conn| {
            delete_response_mode(conn, &user, Some(&room))?;
            delete_blacklist(conn, &user, Some(&room))?;
            Ok(())
        })
        .await
    }

    async fn add_reply_link(
        &self,
        control_room_id: &str,
        event_id: &str,
        target_room_id: &str,
        set_latest: bool,
    ) -> Result<(), DatabaseError> {
        let control_room = control_room_id.to_string();
        let event = event_id.to_string();
        let target = target_room_id.to_string();
        with_connection(&self.conn, move |conn| {
            diesel::insert_or_ignore_into(reply_links::table)
                .values((
                    reply_links::control_room_id.eq(&control_room),
                    reply_links::event_id.eq(&event),
                    reply_links::target_room_id.eq(&target),
                ))
                .execute(conn)
                .map_err(query_error)?;

            if set_latest {
                diesel::replace_into(latest_reply_links::table)
                    .values((
                        latest_reply_links::control_room_id.eq(&control_room),
                        latest_reply_links::event_id.eq(&event),
                    ))
                    .execute(conn)
                    .map_err(query_error)?;
            }
            Ok(())
        })
        .await
    }

    async fn reply_link_target(
        &self,
        control_room_id: &str,
        event_id: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let control_room = control_room_id.to_string();
        let event = event_id.to_string();
        with_connection(&self.conn, move |conn| {
            reply_links::table
                .filter(reply_links::control_room_id.eq(control_room))
                .filter(reply_links::event_id.eq(event))
                .select(reply_links::target_room_id)
                .first::<String>(conn)
                .optional()
                .map_err(query_error)
        })
        .await
    }

    async fn latest_reply_target(
        &self,
        control_room_id: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let control_room = control_room_id.to_string();
        with_connection(&self.conn, move |conn| {
            latest_reply_links::table
                .inner_join(
                    reply_links::table.on(reply_links::control_room_id
                        .eq(latest_reply_links::control_room_id)
                        .and(reply_links::event_id.eq(latest_reply_links::event_id))),
                )
                .filter(latest_reply_links::control_room_id.eq(control_room))
                .select(reply_links::target_room_id)
                .first::<String>(conn)
                .optional()
                .map_err(query_error)
        })
        .await
    }

    async fn clear_latest_reply_link(&self, control_room_id: &str) -> Result<(), DatabaseError> {
        let control_room = control_room_id.to_string();
        with_connection(&self.conn, move |conn| {
            diesel::delete(
                latest_reply_links::table
                    .filter(latest_reply_links::control_room_id.eq(control_room)),
            )
            .execute(conn)
            .map(|_| ())
            .map_err(query_error)
        })
        .await
    }

    async fn users_linked_to_room(
        &self,
        target_room_id: &str,
    ) -> Result<Vec<String>, DatabaseError> {
        let target = target_room_id.to_string();
        with_connection(&self.conn, move |conn| {
            reply_links::table
                .inner_join(
                    control_rooms::table
                        .on(control_rooms::room_id.eq(reply_links::control_room_id)),
                )
                .filter(reply_links::target_room_id.eq(target))
                .select(control_rooms::owner_user_id)
                .distinct()
                .order(control_rooms::owner_user_id.asc())
                .load::<String>(conn)
                .map_err(query_error)
        })
        .await
    }
}

pub struct SqliteLedgerStore {
    conn: SharedConnection,
}

impl SqliteLedgerStore {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl super::LedgerStore for SqliteLedgerStore {
    async fn committed_event_indices(
        &self,
        txn_id: &str,
    ) -> Result<BTreeSet<usize>, DatabaseError> {
        let txn = txn_id.to_string();
        with_connection(&self.conn, move |conn| {
            let indices = transaction_events::table
                .filter(transaction_events::txn_id.eq(txn))
                .select(transaction_events::event_idx)
                .load::<i32>(conn)
                .map_err(query_error)?;
            Ok(indices
                .into_iter()
                .filter_map(|idx| usize::try_from(idx).ok())
                .collect())
        })
        .await
    }

    async fn mark_event_committed(
        &self,
        txn_id: &str,
        event_idx: usize,
    ) -> Result<(), DatabaseError> {
        let txn = txn_id.to_string();
        let idx = i32::try_from(event_idx)
            .map_err(|_| DatabaseError::Query(format!("event index {event_idx} out of range")))?;
        with_connection(&self.conn, move |conn| {
            let now = datetime_to_string(&Utc::now());
            diesel::insert_or_ignore_into(transactions::table)
                .values((
                    transactions::txn_id.eq(&txn),
                    transactions::received_at.eq(&now),
                ))
                .execute(conn)
                .map_err(query_error)?;
            diesel::insert_into(transaction_events::table)
                .values((
                    transaction_events::txn_id.eq(&txn),
                    transaction_events::event_idx.eq(idx),
                    transaction_events::committed_at.eq(&now),
                ))
                .execute(conn)
                .map(|_| ())
                .map_err(query_error)
        })
        .await
    }

    async fn is_generated_message(&self, event_id: &str) -> Result<bool, DatabaseError> {
        let event = event_id.to_string();
        with_connection(&self.conn, move |conn| {
            generated_messages::table
                .filter(generated_messages::event_id.eq(event))
                .count()
                .get_result::<i64>(conn)
                .map(|count| count > 0)
                .map_err(query_error)
        })
        .await
    }

    async fn record_generated_message(
        &self,
        event_id: &str,
        room_id: &str,
    ) -> Result<(), DatabaseError> {
        let event = event_id.to_string();
        let room = room_id.to_string();
        with_connection(&self.conn, move |conn| {
            diesel::insert_or_ignore_into(generated_messages::table)
                .values((
                    generated_messages::event_id.eq(&event),
                    generated_messages::room_id.eq(&room),
                    generated_messages::created_at.eq(datetime_to_string(&Utc::now())),
                ))
                .execute(conn)
                .map(|_| ())
                .map_err(query_error)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use crate::db::{DatabaseManager, LedgerStore, RoomStore, RuleStore};

    async fn migrated() -> DatabaseManager {
        let db = DatabaseManager::new_in_memory().unwrap();
        db.migrate().await.unwrap();
        db
    }

    #[tokio::test]
    async fn control_room_round_trip_and_token_updates() {
        let db = migrated().await;
        let rooms = db.room_store();

        let created = rooms
            .create_control_room("@alice:hs", "!ctl:hs", true)
            .await
            .unwrap();
        assert!(created.pending_rename);
        assert_eq!(created.access_token, None);

        assert!(!rooms.set_access_token("@alice:hs", Some("tok")).await.unwrap());
        assert!(rooms.set_access_token("@alice:hs", None).await.unwrap());
        rooms.clear_pending_rename("!ctl:hs").await.unwrap();

        let by_room = rooms.get_control_room_by_room("!ctl:hs").await.unwrap().unwrap();
        assert_eq!(by_room.owner_user_id, "@alice:hs");
        assert!(!by_room.pending_rename);
        assert!(rooms.set_access_token("@bob:hs", Some("tok")).await.is_err());
    }

    #[tokio::test]
    async fn response_mode_rules_are_scoped() {
        let db = migrated().await;
        let rooms = db.room_store();
        let rules = db.rule_store();
        rooms.create_monitored_room("!group:hs").await.unwrap();

        rules.set_response_mode("@alice:hs", None, true).await.unwrap();
        rules
            .set_response_mode("@alice:hs", Some("!group:hs"), false)
            .await
            .unwrap();
        rules
            .set_response_mode("@alice:hs", Some("!group:hs"), true)
            .await
            .unwrap();

        let global = rules.get_response_mode("@alice:hs", None).await.unwrap().unwrap();
        assert!(global.replace_original);
        let scoped = rules
            .get_response_mode("@alice:hs", Some("!group:hs"))
            .await
            .unwrap()
            .unwrap();
        assert!(scoped.replace_original);

        rules.clear_room_rules("@alice:hs", "!group:hs").await.unwrap();
        assert!(
            rules
                .get_response_mode("@alice:hs", Some("!group:hs"))
                .await
                .unwrap()
                .is_none()
        );
        assert!(rules.clear_response_mode("@alice:hs", None).await.unwrap());
        assert!(!rules.clear_response_mode("@alice:hs", None).await.unwrap());
    }

    #[tokio::test]
    async fn deleting_a_monitored_room_drops_its_rows() {
        let db = migrated().await;
        let rooms = db.room_store();
        let rules = db.rule_store();
        let ledger = db.ledger_store();
        rooms
            .create_control_room("@alice:hs", "!ctl:hs", false)
            .await
            .unwrap();
        rooms.create_monitored_room("!group:hs").await.unwrap();
        rules
            .set_blacklist("@alice:hs", Some("!group:hs"), "secret")
            .await
            .unwrap();
        rules
            .add_reply_link("!ctl:hs", "$notice", "!group:hs", true)
            .await
            .unwrap();
        ledger
            .record_generated_message("$relayed", "!group:hs")
            .await
            .unwrap();

        assert!(rooms.delete_monitored_room("!group:hs").await.unwrap());

        assert!(
            rules
                .get_blacklist("@alice:hs", Some("!group:hs"))
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(rules.reply_link_target("!ctl:hs", "$notice").await.unwrap(), None);
        assert_eq!(rules.latest_reply_target("!ctl:hs").await.unwrap(), None);
        assert!(!ledger.is_generated_message("$relayed").await.unwrap());
    }

    #[tokio::test]
    async fn latest_reply_link_follows_the_newest_notice() {
        let db = migrated().await;
        let rooms = db.room_store();
        let rules = db.rule_store();
        rooms
            .create_control_room("@alice:hs", "!ctl:hs", false)
            .await
            .unwrap();
        rooms.create_monitored_room("!one:hs").await.unwrap();
        rooms.create_monitored_room("!two:hs").await.unwrap();

        rules.add_reply_link("!ctl:hs", "$a", "!one:hs", true).await.unwrap();
        rules.add_reply_link("!ctl:hs", "$b", "!two:hs", true).await.unwrap();
        rules.add_reply_link("!ctl:hs", "$c", "!one:hs", false).await.unwrap();

        assert_eq!(
            rules.latest_reply_target("!ctl:hs").await.unwrap().as_deref(),
            Some("!two:hs")
        );
        assert_eq!(
            rules.reply_link_target("!ctl:hs", "$a").await.unwrap().as_deref(),
            Some("!one:hs")
        );

        rules.clear_latest_reply_link("!ctl:hs").await.unwrap();
        assert_eq!(rules.latest_reply_target("!ctl:hs").await.unwrap(), None);
        assert!(rules.reply_link_target("!ctl:hs", "$b").await.unwrap().is_some());

        assert_eq!(
            rules.users_linked_to_room("!one:hs").await.unwrap(),
            vec!["@alice:hs".to_string()]
        );
    }

    #[tokio::test]
    async fn ledger_tracks_committed_indices_per_transaction() {
        let db = migrated().await;
        let ledger = db.ledger_store();

        ledger.mark_event_committed("txn1", 0).await.unwrap();
        ledger.mark_event_committed("txn1", 2).await.unwrap();
        ledger.mark_event_committed("txn2", 1).await.unwrap();

        let committed = ledger.committed_event_indices("txn1").await.unwrap();
        assert_eq!(committed.into_iter().collect::<Vec<_>>(), vec![0, 2]);
        assert!(ledger.committed_event_indices("txn3").await.unwrap().is_empty());
    }
}
