use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::BotConfig;
use crate::db::{
    ControlRoom, DatabaseError, DatabaseManager, LedgerStore, MonitoredRoom, RoomRole, RoomStore,
    RuleStore,
};
use crate::matrix::{MatrixClient, MatrixError, MatrixEvent};
use crate::messages::{self, FormattedMessage, RoomRef};
use crate::parsers::{mentions_user, strip_reply_fallback};

pub mod commands;
pub mod logic;
pub mod presence;
pub mod startup;
pub mod transaction;

pub use self::transaction::{EffectScope, TransactionProcessor};

use self::logic::{
    RelayPlan, effective_blacklist, effective_replace, replace_redaction_request, resolve_relay,
};

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("homeserver request failed: {0}")]
    Matrix(#[from] MatrixError),

    #[error("store failure: {0}")]
    Database(#[from] DatabaseError),
}

/// Classifies inbound room events and applies their effects.
pub struct BridgeCore {
    client: MatrixClient,
    rooms: Arc<dyn RoomStore>,
    rules: Arc<dyn RuleStore>,
    ledger: Arc<dyn LedgerStore>,
    bot: BotConfig,
}

impl BridgeCore {
    pub fn new(client: MatrixClient, db: &DatabaseManager, bot: BotConfig) -> Self {
        Self {
            client,
            rooms: db.room_store(),
            rules: db.rule_store(),
            ledger: db.ledger_store(),
            bot,
        }
    }

    fn bot_user_id(&self) -> &str {
        self.client.bot_user_id()
    }

    pub async fn handle_event(
        &self,
        event: &MatrixEvent,
        scope: &EffectScope,
    ) -> Result<(), BridgeError> {
        let Some(room_id) = event.room_id.as_deref() else {
            debug!(event_type = %event.event_type, "ignoring event without room");
            return Ok(());
        };

        if event.is_membership() {
            self.handle_member(room_id, event, scope).await
        } else if event.is_message() {
            self.handle_message(room_id, event, scope).await
        } else {
            debug!(
                room_id = %room_id,
                event_type = %event.event_type,
                "ignoring unsupported event type"
            );
            Ok(())
        }
    }

    async fn handle_member(
        &self,
        room_id: &str,
        event: &MatrixEvent,
        scope: &EffectScope,
    ) -> Result<(), BridgeError> {
        let Some(member) = event.state_key.as_deref() else {
            debug!(room_id = %room_id, "ignoring membership event without state key");
            return Ok(());
        };

        match event.membership() {
            Some("invite") if member == self.bot_user_id() => {
                self.handle_bot_invite(room_id, &event.sender, event.is_direct(), scope)
                    .await
            }
            Some("join") => self.handle_join(room_id, member, event, scope).await,
            Some("leave") | Some("ban") => self.handle_leave(room_id, member, scope).await,
            other => {
                debug!(
                    room_id = %room_id,
                    member = %member,
                    membership = ?other,
                    "ignoring membership change"
                );
                Ok(())
            }
        }
    }

    async fn handle_bot_invite(
        &self,
        room_id: &str,
        inviter: &str,
        is_direct: bool,
        scope: &EffectScope,
    ) -> Result<(), BridgeError> {
        if !matches!(self.rooms.room_role(room_id).await?, RoomRole::Unknown) {
            debug!(room_id = %room_id, inviter = %inviter, "invited back into a known room");
            return match self.client.join_room(room_id).await {
                Ok(()) => Ok(()),
                Err(e) if e.has_status(&[403, 404]) => {
                    warn!(room_id = %room_id, "could not rejoin known room: {}", e);
                    Ok(())
                }
                Err(e) => Err(e.into()),
            };
        }

        if is_direct {
            if let Some(existing) = self.rooms.get_control_room_by_owner(inviter).await? {
                info!(
                    room_id = %room_id,
                    inviter = %inviter,
                    control_room = %existing.room_id,
                    "refusing a second control room"
                );
                self.post(&existing.room_id, &messages::already_controlled(), scope)
                    .await?;
                self.leave_room(room_id).await?;
                return Ok(());
            }

            self.rooms
                .create_control_room(inviter, room_id, false)
                .await?;
            info!(room_id = %room_id, owner = %inviter, "accepted control room invite");
            self.join_or_forget(room_id).await?;
            return Ok(());
        }

        self.rooms.create_monitored_room(room_id).await?;
        info!(room_id = %room_id, inviter = %inviter, "accepted room invite");
        if self.join_or_forget(room_id).await? {
            self.ensure_control_room(inviter).await?;
        }
        Ok(())
    }

    async fn handle_join(
        &self,
        room_id: &str,
        member: &str,
        event: &MatrixEvent,
        scope: &EffectScope,
    ) -> Result<(), BridgeError> {
        let repeat = event.prev_membership() == Some("join");
        let is_bot = member == self.bot_user_id();

        match self.rooms.room_role(room_id).await? {
            RoomRole::Control(control) => {
                if repeat {
                    return Ok(());
                }
                if is_bot {
                    self.post(room_id, &messages::welcome(), scope).await?;
                    if control.pending_rename {
                        self.client
                            .set_room_name(room_id, &self.bot.control_room_name)
                            .await?;
                        self.rooms.clear_pending_rename(room_id).await?;
                    }
                } else if member != control.owner_user_id {
                    warn!(
                        room_id = %room_id,
                        member = %member,
                        owner = %control.owner_user_id,
                        "stranger joined a control room"
                    );
                    self.post(
                        room_id,
                        &messages::invalid_control_room_user(member, &control.owner_user_id),
                        scope,
                    )
                    .await?;
                }
                Ok(())
            }
            RoomRole::Monitored(room) => {
                if is_bot {
                    if repeat {
                        return Ok(());
                    }
                    self.announce_bot_joined(room_id, scope).await
                } else if repeat {
                    self.relay_profile_change(&room, member, event, scope).await
                } else {
                    self.handle_member_joined(&room, member, scope).await
                }
            }
            RoomRole::Unknown => {
                if is_bot && !repeat {
                    self.rooms.create_monitored_room(room_id).await?;
                    info!(room_id = %room_id, "joined a room without an invite record");
                    self.announce_bot_joined(room_id, scope).await
                } else {
                    debug!(room_id = %room_id, member = %member, "ignoring join in unknown room");
                    Ok(())
                }
            }
        }
    }

    async fn announce_bot_joined(
        &self,
        room_id: &str,
        scope: &EffectScope,
    ) -> Result<(), BridgeError> {
        let room = self.room_ref(room_id).await?;
        let message = messages::bot_joined(&room);
        self.notify_members(&room, &[], &message, scope).await
    }

    async fn handle_member_joined(
        &self,
        room: &MonitoredRoom,
        member: &str,
        scope: &EffectScope,
    ) -> Result<(), BridgeError> {
        let room_ref = self.room_ref(&room.room_id).await?;
        let message = messages::user_joined(&room_ref, room.mimic_user_id.as_deref());
        self.notify_user(member, &message, Some(&room_ref), scope)
            .await?;

        if let Some(plan) = self.relay_plan(room, member).await? {
            let content = messages::relay_joined(member).to_content();
            self.send_as_mimic(&room.room_id, &content, &plan, scope)
                .await?;
        }
        Ok(())
    }

    async fn relay_profile_change(
        &self,
        room: &MonitoredRoom,
        member: &str,
        event: &MatrixEvent,
        scope: &EffectScope,
    ) -> Result<(), BridgeError> {
        let Some(plan) = self.relay_plan(room, member).await? else {
            return Ok(());
        };
        let content = messages::relay_renamed(member, event.displayname()).to_content();
        self.send_as_mimic(&room.room_id, &content, &plan, scope)
            .await?;
        Ok(())
    }

    async fn handle_leave(
        &self,
        room_id: &str,
        member: &str,
        scope: &EffectScope,
    ) -> Result<(), BridgeError> {
        match self.rooms.room_role(room_id).await? {
            RoomRole::Control(control) => {
                if member == self.bot_user_id() {
                    info!(
                        room_id = %room_id,
                        owner = %control.owner_user_id,
                        "removed from control room"
                    );
                    self.release_mimic_claims(&control.owner_user_id, scope)
                        .await?;
                    self.rooms.delete_control_room(room_id).await?;
                } else if member == control.owner_user_id {
                    info!(room_id = %room_id, owner = %member, "owner left control room");
                    self.leave_room(room_id).await?;
                }
                Ok(())
            }
            RoomRole::Monitored(room) => {
                if member == self.bot_user_id() {
                    self.forget_monitored_room(&room, scope).await
                } else {
                    self.handle_member_left(&room, member, scope).await
                }
            }
            RoomRole::Unknown => Ok(()),
        }
    }

    async fn forget_monitored_room(
        &self,
        room: &MonitoredRoom,
        scope: &EffectScope,
    ) -> Result<(), BridgeError> {
        info!(room_id = %room.room_id, "removed from monitored room");
        let room_ref = self.room_ref(&room.room_id).await?;
        let mut listeners = self.rules.users_linked_to_room(&room.room_id).await?;
        if let Some(mimic) = &room.mimic_user_id
            && !listeners.contains(mimic)
        {
            listeners.push(mimic.clone());
        }

        let message = messages::bot_left(&room_ref);
        for user in &listeners {
            self.notify_user(user, &message, None, scope).await?;
        }
        self.rooms.delete_monitored_room(&room.room_id).await?;
        Ok(())
    }

    async fn handle_member_left(
        &self,
        room: &MonitoredRoom,
        member: &str,
        scope: &EffectScope,
    ) -> Result<(), BridgeError> {
        let relay = self.relay_plan(room, member).await?;
        self.rules.clear_room_rules(member, &room.room_id).await?;
        let room_ref = self.room_ref(&room.room_id).await?;

        if room.mimic_user_id.as_deref() == Some(member) {
            self.rooms.set_mimic_user(&room.room_id, None).await?;
            info!(room_id = %room.room_id, mimic = %member, "mimic user left room");
            let message = messages::mimic_user_left(member, &room_ref);
            self.notify_members(&room_ref, &[member], &message, scope)
                .await?;
        }

        self.notify_user(member, &messages::user_left(&room_ref), None, scope)
            .await?;

        if let Some(plan) = relay {
            let content = messages::relay_left(member).to_content();
            self.send_as_mimic(&room.room_id, &content, &plan, scope)
                .await?;
        }

        let members = self.client.joined_members(&room.room_id).await?;
        if members.iter().all(|user| user == self.bot_user_id()) {
            info!(room_id = %room.room_id, "last member left, leaving room");
            self.leave_room(&room.room_id).await?;
        }
        Ok(())
    }

    async fn handle_message(
        &self,
        room_id: &str,
        event: &MatrixEvent,
        scope: &EffectScope,
    ) -> Result<(), BridgeError> {
        let sender = event.sender.as_str();
        if sender == self.bot_user_id() {
            return Ok(());
        }
        let Some(body) = event.body() else {
            debug!(room_id = %room_id, "ignoring message without body");
            return Ok(());
        };

        match self.rooms.room_role(room_id).await? {
            RoomRole::Control(control) => {
                if sender != control.owner_user_id {
                    debug!(room_id = %room_id, sender = %sender, "ignoring non-owner in control room");
                    return Ok(());
                }
                let text = strip_reply_fallback(body, event.formatted_body());
                self.run_command(&control, &text, event.in_reply_to(), scope)
                    .await?;

                if let Some(event_id) = event.event_id.as_deref()
                    && let Err(e) = self.client.send_read_receipt(room_id, event_id).await
                {
                    warn!(room_id = %room_id, event_id = %event_id, "failed to send read receipt: {}", e);
                }
                Ok(())
            }
            RoomRole::Monitored(room) => {
                if mentions_user(body, event.formatted_body(), self.bot_user_id()) {
                    let (control, existed) = self.ensure_control_room(sender).await?;
                    if existed {
                        self.post(&control.room_id, &messages::ping(), scope).await?;
                    }
                    return Ok(());
                }

                let Some(event_id) = event.event_id.as_deref() else {
                    return Ok(());
                };
                if self.ledger.is_generated_message(event_id).await? {
                    debug!(room_id = %room_id, event_id = %event_id, "ignoring relayed message");
                    return Ok(());
                }

                if let Some(plan) = self.relay_plan(&room, sender).await? {
                    self.relay_message(&room, event, event_id, body, &plan, scope)
                        .await?;
                }
                Ok(())
            }
            RoomRole::Unknown => {
                debug!(room_id = %room_id, "ignoring message in unknown room");
                Ok(())
            }
        }
    }

    pub(crate) async fn relay_plan(
        &self,
        room: &MonitoredRoom,
        sender: &str,
    ) -> Result<Option<RelayPlan>, BridgeError> {
        let Some(mimic) = room.mimic_user_id.as_deref() else {
            return Ok(None);
        };
        if mimic == sender {
            return Ok(None);
        }

        let room_rule = self.rules.get_blacklist(mimic, Some(&room.room_id)).await?;
        let global_rule = self.rules.get_blacklist(mimic, None).await?;
        let control = self.rooms.get_control_room_by_owner(mimic).await?;
        Ok(resolve_relay(
            room,
            sender,
            effective_blacklist(room_rule.as_ref(), global_rule.as_ref()),
            control.as_ref(),
        ))
    }

    async fn relay_message(
        &self,
        room: &MonitoredRoom,
        event: &MatrixEvent,
        event_id: &str,
        body: &str,
        plan: &RelayPlan,
        scope: &EffectScope,
    ) -> Result<(), BridgeError> {
        let attributed = messages::relay_attribution(&event.sender, body, event.formatted_body());
        let mut content = event.content.clone();
        if let Value::Object(map) = &mut content {
            map.insert("body".to_string(), attributed.plain.into());
            map.insert("format".to_string(), "org.matrix.custom.html".into());
            map.insert("formatted_body".to_string(), attributed.html.into());
        } else {
            content = attributed.to_content();
        }

        let Some(relayed_id) = self
            .send_as_mimic(&room.room_id, &content, plan, scope)
            .await?
        else {
            return Ok(());
        };
        debug!(
            room_id = %room.room_id,
            original = %event_id,
            relayed = %relayed_id,
            mimic = %plan.mimic_user_id,
            "relayed message"
        );

        let room_mode = self
            .rules
            .get_response_mode(&plan.mimic_user_id, Some(&room.room_id))
            .await?;
        let global_mode = self
            .rules
            .get_response_mode(&plan.mimic_user_id, None)
            .await?;
        if !effective_replace(room_mode.as_ref(), global_mode.as_ref()) {
            return Ok(());
        }

        let request = replace_redaction_request(&room.room_id, event_id);
        match self
            .client
            .redact(
                &request.room_id,
                &request.event_id,
                request.reason,
                &scope.next_txn_id(),
                None,
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.has_status(&[403, 404]) => {
                warn!(
                    room_id = %request.room_id,
                    event_id = %request.event_id,
                    "could not redact replaced message: {}",
                    e
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Sends with the mimic user's token; a rejected token is cleared and reported instead of failing.
    async fn send_as_mimic(
        &self,
        room_id: &str,
        content: &Value,
        plan: &RelayPlan,
        scope: &EffectScope,
    ) -> Result<Option<String>, BridgeError> {
        match self
            .client
            .send_message(
                room_id,
                content,
                &scope.next_txn_id(),
                Some(&plan.access_token),
            )
            .await
        {
            Ok(event_id) => {
                self.ledger
                    .record_generated_message(&event_id, room_id)
                    .await?;
                Ok(Some(event_id))
            }
            Err(e) if e.is_unknown_token() => {
                warn!(
                    room_id = %room_id,
                    mimic = %plan.mimic_user_id,
                    "stored access token was rejected"
                );
                self.rooms
                    .set_access_token(&plan.mimic_user_id, None)
                    .await?;
                self.notify_user(&plan.mimic_user_id, &messages::expired_token(), None, scope)
                    .await?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drops every mimic claim held by `user`, telling the other members of each room.
    /// Returns how many rooms were released.
    async fn release_mimic_claims(
        &self,
        user: &str,
        scope: &EffectScope,
    ) -> Result<usize, BridgeError> {
        let rooms = self.rooms.rooms_mimicked_by(user).await?;
        for room_id in &rooms {
            self.rooms.set_mimic_user(room_id, None).await?;
            let room = self.room_ref(room_id).await?;
            let message = messages::mimic_user_left(user, &room);
            self.notify_members(&room, &[user], &message, scope).await?;
        }
        Ok(rooms.len())
    }

    /// Returns the user's control room and whether it already existed.
    async fn ensure_control_room(&self, user: &str) -> Result<(ControlRoom, bool), BridgeError> {
        if let Some(control) = self.rooms.get_control_room_by_owner(user).await? {
            return Ok((control, true));
        }
        let room_id = self.client.create_direct_room(user).await?;
        let control = self.rooms.create_control_room(user, &room_id, true).await?;
        info!(room_id = %room_id, owner = %user, "created control room");
        Ok((control, false))
    }

    async fn join_or_forget(&self, room_id: &str) -> Result<bool, BridgeError> {
        match self.client.join_room(room_id).await {
            Ok(()) => Ok(true),
            Err(e) if e.has_status(&[403, 404]) => {
                warn!(room_id = %room_id, "could not join invited room: {}", e);
                self.rooms.delete_control_room(room_id).await?;
                self.rooms.delete_monitored_room(room_id).await?;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn leave_room(&self, room_id: &str) -> Result<(), BridgeError> {
        match self.client.leave_room(room_id).await {
            Ok(()) => Ok(()),
            Err(e) if e.has_status(&[403, 404]) => {
                debug!(room_id = %room_id, "already out of room: {}", e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) async fn room_ref(&self, room_id: &str) -> Result<RoomRef, BridgeError> {
        let name = self.client.room_display_name(room_id).await?;
        Ok(RoomRef::new(room_id, name))
    }

    pub(crate) async fn post(
        &self,
        room_id: &str,
        message: &FormattedMessage,
        scope: &EffectScope,
    ) -> Result<String, BridgeError> {
        let event_id = self
            .client
            .send_message(room_id, &message.to_content(), &scope.next_txn_id(), None)
            .await?;
        Ok(event_id)
    }

    /// Posts into `user`'s control room if they have one; never creates one.
    pub(crate) async fn notify_user(
        &self,
        user: &str,
        message: &FormattedMessage,
        about: Option<&RoomRef>,
        scope: &EffectScope,
    ) -> Result<bool, BridgeError> {
        let Some(control) = self.rooms.get_control_room_by_owner(user).await? else {
            return Ok(false);
        };
        let event_id = self.post(&control.room_id, message, scope).await?;
        if let Some(room) = about {
            self.rules
                .add_reply_link(&control.room_id, &event_id, &room.id, true)
                .await?;
        }
        Ok(true)
    }

    /// Notifies every listening member of `room` except the bot and `except`.
    pub(crate) async fn notify_members(
        &self,
        room: &RoomRef,
        except: &[&str],
        message: &FormattedMessage,
        scope: &EffectScope,
    ) -> Result<(), BridgeError> {
        for member in self.joined_members_or_empty(&room.id).await? {
            if member == self.bot_user_id() || except.contains(&member.as_str()) {
                continue;
            }
            self.notify_user(&member, message, Some(room), scope).await?;
        }
        Ok(())
    }

    pub(crate) async fn joined_members_or_empty(
        &self,
        room_id: &str,
    ) -> Result<Vec<String>, BridgeError> {
        match self.client.joined_members(room_id).await {
            Ok(members) => Ok(members),
            Err(e) if e.has_status(&[403, 404]) => {
                debug!(room_id = %room_id, "cannot list members: {}", e);
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }
}
