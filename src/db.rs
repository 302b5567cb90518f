pub use self::error::DatabaseError;
pub use self::manager::DatabaseManager;
pub use self::models::{
    BlacklistRule, ControlRoom, MonitoredRoom, ResponseModeRule, RoomRole,
};
pub use self::stores::{LedgerStore, RoomStore, RuleStore};

pub mod error;
pub mod manager;
pub mod models;
pub mod schema_sqlite;
pub mod sqlite;
pub mod stores;
