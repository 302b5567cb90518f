use std::collections::BTreeSet;

use async_trait::async_trait;

use super::DatabaseError;
use super::models::{BlacklistRule, ControlRoom, MonitoredRoom, ResponseModeRule, RoomRole};

/// Room directory: which rooms are control rooms and which are monitored.
#[async_trait]
pub trait RoomStore: Send + Sync {
    async fn get_control_room_by_owner(
        &self,
        owner_user_id: &str,
    ) -> Result<Option<ControlRoom>, DatabaseError>;
    async fn get_control_room_by_room(
        &self,
        room_id: &str,
    ) -> Result<Option<ControlRoom>, DatabaseError>;
    async fn create_control_room(
        &self,
        owner_user_id: &str,
        room_id: &str,
        pending_rename: bool,
    ) -> Result<ControlRoom, DatabaseError>;
    /// Removes the control room; reply links cascade and the owner's mimic claims are nulled.
    async fn delete_control_room(&self, room_id: &str) -> Result<bool, DatabaseError>;
    /// Returns whether a token was stored before the update.
    async fn set_access_token(
        &self,
        owner_user_id: &str,
        access_token: Option<&str>,
    ) -> Result<bool, DatabaseError>;
    async fn clear_pending_rename(&self, room_id: &str) -> Result<(), DatabaseError>;

    async fn get_monitored_room(
        &self,
        room_id: &str,
    ) -> Result<Option<MonitoredRoom>, DatabaseError>;
    async fn create_monitored_room(&self, room_id: &str) -> Result<MonitoredRoom, DatabaseError>;
    /// Removes the monitored room and, by cascade, every rule, reply link and
    /// generated message row that names it.
    async fn delete_monitored_room(&self, room_id: &str) -> Result<bool, DatabaseError>;
    async fn set_mimic_user(
        &self,
        room_id: &str,
        mimic_user_id: Option<&str>,
    ) -> Result<(), DatabaseError>;
    async fn rooms_mimicked_by(&self, user_id: &str) -> Result<Vec<String>, DatabaseError>;
    async fn list_monitored_rooms(&self) -> Result<Vec<MonitoredRoom>, DatabaseError>;

    async fn room_role(&self, room_id: &str) -> Result<RoomRole, DatabaseError> {
        if let Some(control) = self.get_control_room_by_room(room_id).await? {
            return Ok(RoomRole::Control(control));
        }
        if let Some(monitored) = self.get_monitored_room(room_id).await? {
            return Ok(RoomRole::Monitored(monitored));
        }
        Ok(RoomRole::Unknown)
    }
}

/// Per-user relay preferences and per-control-room reply context.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn get_response_mode(
        &self,
        mimic_user_id: &str,
        room_id: Option<&str>,
    ) -> Result<Option<ResponseModeRule>, DatabaseError>;
    async fn set_response_mode(
        &self,
        mimic_user_id: &str,
        room_id: Option<&str>,
        replace_original: bool,
    ) -> Result<(), DatabaseError>;
    async fn clear_response_mode(
        &self,
        mimic_user_id: &str,
        room_id: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    async fn get_blacklist(
        &self,
        mimic_user_id: &str,
        room_id: Option<&str>,
    ) -> Result<Option<BlacklistRule>, DatabaseError>;
    async fn set_blacklist(
        &self,
        mimic_user_id: &str,
        room_id: Option<&str>,
        pattern: &str,
    ) -> Result<(), DatabaseError>;
    async fn clear_blacklist(
        &self,
        mimic_user_id: &str,
        room_id: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    /// Drops the room-specific response mode and blacklist rows of one user.
    async fn clear_room_rules(&self, mimic_user_id: &str, room_id: &str)
    -> Result<(), DatabaseError>;

    async fn add_reply_link(
        &self,
        control_room_id: &str,
        event_id: &str,
        target_room_id: &str,
        set_latest: bool,
    ) -> Result<(), DatabaseError>;
    async fn reply_link_target(
        &self,
        control_room_id: &str,
        event_id: &str,
    ) -> Result<Option<String>, DatabaseError>;
    async fn latest_reply_target(
        &self,
        control_room_id: &str,
    ) -> Result<Option<String>, DatabaseError>;
    async fn clear_latest_reply_link(&self, control_room_id: &str) -> Result<(), DatabaseError>;
    /// Owners of control rooms holding a reply link to `target_room_id`.
    async fn users_linked_to_room(&self, target_room_id: &str)
    -> Result<Vec<String>, DatabaseError>;
}

/// Idempotency ledger for inbound transactions plus the loop-guard for relayed messages.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn committed_event_indices(&self, txn_id: &str)
    -> Result<BTreeSet<usize>, DatabaseError>;
    async fn mark_event_committed(&self, txn_id: &str, event_idx: usize)
    -> Result<(), DatabaseError>;
    async fn is_generated_message(&self, event_id: &str) -> Result<bool, DatabaseError>;
    async fn record_generated_message(
        &self,
        event_id: &str,
        room_id: &str,
    ) -> Result<(), DatabaseError>;
}
