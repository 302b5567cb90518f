use std::sync::Arc;

use diesel::RunQueryDsl;
use diesel::connection::{AnsiTransactionManager, TransactionManager};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::db::sqlite::{
    SharedConnection, SqliteLedgerStore, SqliteRoomStore, SqliteRuleStore, establish_connection,
    with_connection,
};
use crate::db::{DatabaseError, LedgerStore, RoomStore, RuleStore};

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS control_rooms (
        owner_user_id TEXT NOT NULL PRIMARY KEY,
        room_id TEXT NOT NULL UNIQUE,
        access_token TEXT NULL,
        pending_rename INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS monitored_rooms (
        room_id TEXT NOT NULL PRIMARY KEY,
        mimic_user_id TEXT NULL REFERENCES control_rooms(owner_user_id) ON DELETE SET NULL,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS control_rooms_not_monitored
    BEFORE INSERT ON control_rooms
    WHEN EXISTS (SELECT 1 FROM monitored_rooms WHERE room_id = NEW.room_id)
    BEGIN
        SELECT RAISE(ABORT, 'room is already a monitored room');
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS monitored_rooms_not_control
    BEFORE INSERT ON monitored_rooms
    WHEN EXISTS (SELECT 1 FROM control_rooms WHERE room_id = NEW.room_id)
    BEGIN
        SELECT RAISE(ABORT, 'room is already a control room');
    END
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS response_modes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        mimic_user_id TEXT NOT NULL,
        room_id TEXT NULL REFERENCES monitored_rooms(room_id) ON DELETE CASCADE,
        replace_original INTEGER NOT NULL
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_response_modes_room ON response_modes(mimic_user_id, room_id) WHERE room_id IS NOT NULL",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_response_modes_global ON response_modes(mimic_user_id) WHERE room_id IS NULL",
    r#"
    CREATE TABLE IF NOT EXISTS blacklists (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        mimic_user_id TEXT NOT NULL,
        room_id TEXT NULL REFERENCES monitored_rooms(room_id) ON DELETE CASCADE,
        pattern TEXT NOT NULL
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_blacklists_room ON blacklists(mimic_user_id, room_id) WHERE room_id IS NOT NULL",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_blacklists_global ON blacklists(mimic_user_id) WHERE room_id IS NULL",
    r#"
    CREATE TABLE IF NOT EXISTS reply_links (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        control_room_id TEXT NOT NULL REFERENCES control_rooms(room_id) ON DELETE CASCADE,
        event_id TEXT NOT NULL,
        target_room_id TEXT NOT NULL REFERENCES monitored_rooms(room_id) ON DELETE CASCADE,
        UNIQUE (control_room_id, event_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS latest_reply_links (
        control_room_id TEXT NOT NULL PRIMARY KEY,
        event_id TEXT NOT NULL,
        FOREIGN KEY (control_room_id, event_id)
            REFERENCES reply_links(control_room_id, event_id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS generated_messages (
        event_id TEXT NOT NULL PRIMARY KEY,
        room_id TEXT NOT NULL REFERENCES monitored_rooms(room_id) ON DELETE CASCADE,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transactions (
        txn_id TEXT NOT NULL PRIMARY KEY,
        received_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transaction_events (
        txn_id TEXT NOT NULL REFERENCES transactions(txn_id) ON DELETE CASCADE,
        event_idx INTEGER NOT NULL,
        committed_at TEXT NOT NULL,
        PRIMARY KEY (txn_id, event_idx)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_monitored_rooms_mimic ON monitored_rooms(mimic_user_id)",
    "CREATE INDEX IF NOT EXISTS idx_reply_links_target ON reply_links(target_room_id)",
    "CREATE INDEX IF NOT EXISTS idx_generated_messages_room ON generated_messages(room_id)",
];

/// Owns the single SQLite connection and hands out the stores built on it.
///
/// Every store shares the same connection, so a unit of work opened with
/// [`DatabaseManager::begin`] covers all store writes until it is committed
/// or rolled back.
#[derive(Clone)]
pub struct DatabaseManager {
    conn: SharedConnection,
    sqlite_path: String,
    room_store: Arc<dyn RoomStore>,
    rule_store: Arc<dyn RuleStore>,
    ledger_store: Arc<dyn LedgerStore>,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let path = config.sqlite_path().ok_or_else(|| {
            DatabaseError::Connection(format!(
                "unsupported database url: {}",
                config.connection_string()
            ))
        })?;
        let open_path = path.clone();
        let conn = tokio::task::spawn_blocking(move || establish_connection(&open_path))
            .await
            .map_err(|e| DatabaseError::Connection(format!("connection task failed: {e}")))??;
        info!(path = %path, "opened sqlite database");
        Ok(Self::from_connection(conn, path))
    }

    pub fn new_in_memory() -> Result<Self, DatabaseError> {
        let conn = establish_connection(":memory:")?;
        Ok(Self::from_connection(conn, ":memory:".to_string()))
    }

    fn from_connection(conn: diesel::sqlite::SqliteConnection, sqlite_path: String) -> Self {
        let conn: SharedConnection = Arc::new(Mutex::new(conn));
        Self {
            room_store: Arc::new(SqliteRoomStore::new(conn.clone())),
            rule_store: Arc::new(SqliteRuleStore::new(conn.clone())),
            ledger_store: Arc::new(SqliteLedgerStore::new(conn.clone())),
            conn,
            sqlite_path,
        }
    }

    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        with_connection(&self.conn, |conn| {
            for statement in MIGRATIONS {
                diesel::sql_query(*statement)
                    .execute(conn)
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            }
            Ok(())
        })
        .await?;
        debug!(path = %self.sqlite_path, "database schema is up to date");
        Ok(())
    }

    /// Opens the unit of work for one transaction event.
    pub async fn begin(&self) -> Result<(), DatabaseError> {
        with_connection(&self.conn, |conn| {
            AnsiTransactionManager::begin_transaction(conn)
                .map_err(|e| DatabaseError::Query(format!("begin failed: {e}")))
        })
        .await
    }

    pub async fn commit(&self) -> Result<(), DatabaseError> {
        with_connection(&self.conn, |conn| {
            AnsiTransactionManager::commit_transaction(conn)
                .map_err(|e| DatabaseError::Query(format!("commit failed: {e}")))
        })
        .await
    }

    pub async fn rollback(&self) -> Result<(), DatabaseError> {
        with_connection(&self.conn, |conn| {
            AnsiTransactionManager::rollback_transaction(conn)
                .map_err(|e| DatabaseError::Query(format!("rollback failed: {e}")))
        })
        .await
    }

    pub async fn is_healthy(&self) -> bool {
        with_connection(&self.conn, |conn| {
            diesel::sql_query("SELECT 1")
                .execute(conn)
                .map(|_| ())
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
        .is_ok()
    }

    pub fn room_store(&self) -> Arc<dyn RoomStore> {
        self.room_store.clone()
    }

    pub fn rule_store(&self) -> Arc<dyn RuleStore> {
        self.rule_store.clone()
    }

    pub fn ledger_store(&self) -> Arc<dyn LedgerStore> {
        self.ledger_store.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn migrated() -> DatabaseManager {
        let db = DatabaseManager::new_in_memory().unwrap();
        db.migrate().await.unwrap();
        db
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let db = migrated().await;
        db.migrate().await.unwrap();
        assert!(db.is_healthy().await);
    }

    #[tokio::test]
    async fn a_room_cannot_be_both_control_and_monitored() {
        let db = migrated().await;
        let rooms = db.room_store();
        rooms.create_monitored_room("!group:hs").await.unwrap();
        assert!(
            rooms
                .create_control_room("@alice:hs", "!group:hs", false)
                .await
                .is_err()
        );

        rooms
            .create_control_room("@alice:hs", "!dm:hs", false)
            .await
            .unwrap();
        assert!(rooms.create_monitored_room("!dm:hs").await.is_err());
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let db = migrated().await;
        let rooms = db.room_store();

        db.begin().await.unwrap();
        rooms.create_monitored_room("!a:hs").await.unwrap();
        db.rollback().await.unwrap();
        assert!(rooms.get_monitored_room("!a:hs").await.unwrap().is_none());

        db.begin().await.unwrap();
        rooms.create_monitored_room("!b:hs").await.unwrap();
        db.commit().await.unwrap();
        assert!(rooms.get_monitored_room("!b:hs").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn deleting_a_control_room_releases_mimic_claims() {
        let db = migrated().await;
        let rooms = db.room_store();
        let rules = db.rule_store();
        rooms
            .create_control_room("@alice:hs", "!ctl:hs", false)
            .await
            .unwrap();
        rooms.create_monitored_room("!group:hs").await.unwrap();
        rooms
            .set_mimic_user("!group:hs", Some("@alice:hs"))
            .await
            .unwrap();
        rules
            .add_reply_link("!ctl:hs", "$status", "!group:hs", true)
            .await
            .unwrap();

        assert!(rooms.delete_control_room("!ctl:hs").await.unwrap());

        let group = rooms.get_monitored_room("!group:hs").await.unwrap().unwrap();
        assert_eq!(group.mimic_user_id, None);
        assert_eq!(rules.latest_reply_target("!ctl:hs").await.unwrap(), None);
    }

    #[test]
    fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            url: Some(format!("sqlite://{}", dir.path().join("imposter.db").display())),
            filename: None,
        };

        tokio_test::block_on(async {
            let db = DatabaseManager::new(&config).await.unwrap();
            db.migrate().await.unwrap();
            db.ledger_store()
                .mark_event_committed("txn1", 0)
                .await
                .unwrap();
        });

        tokio_test::block_on(async {
            let db = DatabaseManager::new(&config).await.unwrap();
            db.migrate().await.unwrap();
            let committed = db.ledger_store().committed_event_indices("txn1").await.unwrap();
            assert!(committed.contains(&0));
        });
    }
}
