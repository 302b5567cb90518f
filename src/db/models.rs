use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Private room shared by the bot and exactly one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRoom {
    pub owner_user_id: String,
    pub room_id: String,
    pub access_token: Option<String>,
    /// Set when the bot created the room itself; cleared once it has been named.
    pub pending_rename: bool,
    pub created_at: DateTime<Utc>,
}

/// Any other room the bot has joined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredRoom {
    pub room_id: String,
    pub mimic_user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomRole {
    Control(ControlRoom),
    Monitored(MonitoredRoom),
    Unknown,
}

/// Row of the response mode table; `room_id == None` is the user's global default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseModeRule {
    pub mimic_user_id: String,
    pub room_id: Option<String>,
    pub replace_original: bool,
}

/// Row of the blacklist table; `room_id == None` is the user's global default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistRule {
    pub mimic_user_id: String,
    pub room_id: Option<String>,
    pub pattern: String,
}
