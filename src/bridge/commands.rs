use tracing::{debug, info};

use super::logic::compile_blacklist;
use super::{BridgeCore, BridgeError, EffectScope};
use crate::db::{ControlRoom, MonitoredRoom};
use crate::messages::{self, FormattedMessage, RoomRef};
use crate::parsers::{RoomReference, parse_command, parse_room_reference};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommandKind {
    Token,
    Revoke,
    MimicMe,
    StopIt,
    SetMode,
    Blacklist,
    GetBlacklist,
    Status,
    Actions,
    Help,
}

/// How a command finds the room it acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RoomScope {
    /// Never takes a room.
    Global,
    /// Needs a room: explicit, by reply, or the latest room the bot mentioned.
    Required,
    /// Takes a room if one is named or replied to, otherwise acts globally.
    Optional,
}

#[derive(Debug)]
pub(crate) struct CommandSpec {
    pub(crate) name: &'static str,
    pub(crate) kind: CommandKind,
    pub(crate) scope: RoomScope,
    pub(crate) usage: &'static str,
    pub(crate) description: &'static str,
}

pub(crate) const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "token",
        kind: CommandKind::Token,
        scope: RoomScope::Global,
        usage: "<access-token>",
        description: "give me your access token so I can post as you",
    },
    CommandSpec {
        name: "revoke",
        kind: CommandKind::Revoke,
        scope: RoomScope::Global,
        usage: "",
        description: "make me forget your access token and stop mimicking you everywhere",
    },
    CommandSpec {
        name: "mimicme",
        kind: CommandKind::MimicMe,
        scope: RoomScope::Required,
        usage: "[room]",
        description: "repost other people's messages in a room as if you sent them",
    },
    CommandSpec {
        name: "stopit",
        kind: CommandKind::StopIt,
        scope: RoomScope::Required,
        usage: "[room]",
        description: "stop mimicking you in a room",
    },
    CommandSpec {
        name: "setmode",
        kind: CommandKind::SetMode,
        scope: RoomScope::Optional,
        usage: "[room] echo|replace|default",
        description: "choose whether reposted messages keep or remove the original",
    },
    CommandSpec {
        name: "blacklist",
        kind: CommandKind::Blacklist,
        scope: RoomScope::Optional,
        usage: "[room] <patterns>|none|default",
        description: "never repost messages from users matching any of the patterns",
    },
    CommandSpec {
        name: "getblacklist",
        kind: CommandKind::GetBlacklist,
        scope: RoomScope::Optional,
        usage: "[room]",
        description: "show which users I never repost",
    },
    CommandSpec {
        name: "status",
        kind: CommandKind::Status,
        scope: RoomScope::Global,
        usage: "",
        description: "list the rooms where I mimic you and where your messages are reposted",
    },
    CommandSpec {
        name: "actions",
        kind: CommandKind::Actions,
        scope: RoomScope::Global,
        usage: "",
        description: "list the rooms where I could mimic you",
    },
    CommandSpec {
        name: "help",
        kind: CommandKind::Help,
        scope: RoomScope::Global,
        usage: "",
        description: "show this message",
    },
];

pub(crate) fn find_command(word: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|spec| spec.name == word)
}

/// A resolved command target.
struct TargetRoom {
    room: MonitoredRoom,
    display: RoomRef,
}

enum Resolution {
    Room(TargetRoom),
    /// Nothing was named or replied to.
    Unaddressed,
    /// Something was named but it is not a room the caller can address.
    Unresolved,
}

impl BridgeCore {
    pub(crate) async fn run_command(
        &self,
        control: &ControlRoom,
        text: &str,
        replied_event_id: Option<&str>,
        scope: &EffectScope,
    ) -> Result<(), BridgeError> {
        let Some(parsed) = parse_command(text) else {
            return Ok(());
        };
        let Some(spec) = find_command(&parsed.command) else {
            debug!(room_id = %control.room_id, command = %parsed.command, "unknown command");
            self.post(&control.room_id, &messages::invalid_command(), scope)
                .await?;
            return Ok(());
        };
        debug!(
            room_id = %control.room_id,
            owner = %control.owner_user_id,
            command = spec.name,
            "running command"
        );

        let mut args = parsed.args.as_slice();
        let target = match spec.scope {
            RoomScope::Global => None,
            RoomScope::Required | RoomScope::Optional => {
                let explicit = args.first().and_then(|word| parse_room_reference(word));
                if explicit.is_some() {
                    args = &args[1..];
                }
                let resolution = self
                    .resolve_target(control, explicit, replied_event_id, spec.scope)
                    .await?;
                match resolution {
                    Resolution::Room(target) => Some(target),
                    Resolution::Unaddressed if spec.scope == RoomScope::Optional => None,
                    Resolution::Unaddressed | Resolution::Unresolved => {
                        self.post(&control.room_id, &messages::no_room(), scope)
                            .await?;
                        return Ok(());
                    }
                }
            }
        };

        match spec.kind {
            CommandKind::Token => self.token_command(control, spec, args, scope).await,
            CommandKind::Revoke => self.revoke_command(control, scope).await,
            CommandKind::MimicMe => self.mimicme_command(control, target, scope).await,
            CommandKind::StopIt => self.stopit_command(control, target, scope).await,
            CommandKind::SetMode => {
                self.setmode_command(control, spec, target, args, scope)
                    .await
            }
            CommandKind::Blacklist => {
                self.blacklist_command(control, spec, target, args, scope)
                    .await
            }
            CommandKind::GetBlacklist => self.getblacklist_command(control, target, scope).await,
            CommandKind::Status => self.status_command(control, scope).await,
            CommandKind::Actions => self.actions_command(control, scope).await,
            CommandKind::Help => {
                let entries: Vec<_> = COMMANDS
                    .iter()
                    .map(|spec| (spec.name, spec.usage, spec.description))
                    .collect();
                self.post(&control.room_id, &messages::help(&entries), scope)
                    .await?;
                Ok(())
            }
        }
    }

    async fn resolve_target(
        &self,
        control: &ControlRoom,
        explicit: Option<RoomReference>,
        replied_event_id: Option<&str>,
        room_scope: RoomScope,
    ) -> Result<Resolution, BridgeError> {
        let room_id = match (explicit, replied_event_id) {
            (Some(RoomReference::RoomId(room_id)), _) => Some(room_id),
            (Some(RoomReference::Alias(alias)), _) => {
                let resolved = self.client.resolve_alias(&alias).await?;
                if resolved.is_none() {
                    debug!(alias = %alias, "alias does not resolve");
                    return Ok(Resolution::Unresolved);
                }
                resolved
            }
            (None, Some(event_id)) => {
                let linked = self
                    .rules
                    .reply_link_target(&control.room_id, event_id)
                    .await?;
                if linked.is_none() && room_scope == RoomScope::Optional {
                    return Ok(Resolution::Unaddressed);
                }
                linked
            }
            (None, None) if room_scope == RoomScope::Required => {
                self.rules.latest_reply_target(&control.room_id).await?
            }
            (None, None) => return Ok(Resolution::Unaddressed),
        };

        let Some(room_id) = room_id else {
            return Ok(Resolution::Unresolved);
        };
        let Some(room) = self.rooms.get_monitored_room(&room_id).await? else {
            debug!(room_id = %room_id, "command names a room that is not monitored");
            return Ok(Resolution::Unresolved);
        };
        let members = self.joined_members_or_empty(&room_id).await?;
        if !members.contains(&control.owner_user_id) {
            debug!(
                room_id = %room_id,
                user = %control.owner_user_id,
                "command names a room the caller is not in"
            );
            return Ok(Resolution::Unresolved);
        }

        let display = self.room_ref(&room_id).await?;
        Ok(Resolution::Room(TargetRoom { room, display }))
    }

    async fn reply(
        &self,
        control: &ControlRoom,
        message: &FormattedMessage,
        scope: &EffectScope,
    ) -> Result<(), BridgeError> {
        self.post(&control.room_id, message, scope).await?;
        Ok(())
    }

    /// Replies with a message about `room` and links it for follow-up replies.
    async fn reply_about(
        &self,
        control: &ControlRoom,
        room: &RoomRef,
        message: &FormattedMessage,
        set_latest: bool,
        scope: &EffectScope,
    ) -> Result<(), BridgeError> {
        let event_id = self.post(&control.room_id, message, scope).await?;
        self.rules
            .add_reply_link(&control.room_id, &event_id, &room.id, set_latest)
            .await?;
        Ok(())
    }

    async fn reply_scoped(
        &self,
        control: &ControlRoom,
        target: Option<&TargetRoom>,
        message: &FormattedMessage,
        scope: &EffectScope,
    ) -> Result<(), BridgeError> {
        match target {
            Some(target) => {
                self.reply_about(control, &target.display, message, true, scope)
                    .await
            }
            None => self.reply(control, message, scope).await,
        }
    }

    async fn token_command(
        &self,
        control: &ControlRoom,
        spec: &CommandSpec,
        args: &[String],
        scope: &EffectScope,
    ) -> Result<(), BridgeError> {
        let [token] = args else {
            return self
                .reply(control, &messages::usage(spec.name, spec.usage), scope)
                .await;
        };

        let owner = control.owner_user_id.as_str();
        let valid = match self.client.whoami(token).await {
            Ok(user_id) => user_id == owner,
            Err(e) if e.has_status(&[401, 403]) => {
                debug!(user = %owner, "token check rejected: {}", e);
                false
            }
            Err(e) => return Err(e.into()),
        };

        if !valid {
            info!(user = %owner, "rejected access token");
            return self.reply(control, &messages::invalid_token(), scope).await;
        }
        self.rooms.set_access_token(owner, Some(token.as_str())).await?;
        info!(user = %owner, "stored access token");
        self.reply(control, &messages::received_token(), scope).await
    }

    async fn revoke_command(
        &self,
        control: &ControlRoom,
        scope: &EffectScope,
    ) -> Result<(), BridgeError> {
        let owner = control.owner_user_id.as_str();
        let had_token = self.rooms.set_access_token(owner, None).await?;
        // A stale token is already cleared but its claims survive.
        let released = self.release_mimic_claims(owner, scope).await?;
        if !had_token && released == 0 {
            return self
                .reply(control, &messages::no_revoke_token(), scope)
                .await;
        }
        info!(user = %owner, released, "revoked access token");
        self.reply(control, &messages::revoked_token(), scope).await
    }

    async fn mimicme_command(
        &self,
        control: &ControlRoom,
        target: Option<TargetRoom>,
        scope: &EffectScope,
    ) -> Result<(), BridgeError> {
        let Some(TargetRoom { room, display }) = target else {
            return self.reply(control, &messages::no_room(), scope).await;
        };
        let owner = control.owner_user_id.as_str();

        match room.mimic_user_id.as_deref() {
            Some(mimic) if mimic == owner => {
                self.reply_about(control, &display, &messages::already_mimic(&display), true, scope)
                    .await
            }
            Some(mimic) => {
                let message = messages::rejected_mimic(mimic, &display);
                self.reply_about(control, &display, &message, true, scope)
                    .await
            }
            None if control.access_token.is_none() => {
                self.reply_about(control, &display, &messages::cant_mimic(), true, scope)
                    .await
            }
            None => {
                self.rooms.set_mimic_user(&room.room_id, Some(owner)).await?;
                info!(room_id = %room.room_id, mimic = %owner, "mimic claim accepted");
                self.reply_about(control, &display, &messages::accepted_mimic(&display), true, scope)
                    .await?;
                let notice = messages::mimic_taken(owner, &display);
                self.notify_members(&display, &[owner], &notice, scope)
                    .await
            }
        }
    }

    async fn stopit_command(
        &self,
        control: &ControlRoom,
        target: Option<TargetRoom>,
        scope: &EffectScope,
    ) -> Result<(), BridgeError> {
        let Some(TargetRoom { room, display }) = target else {
            return self.reply(control, &messages::no_room(), scope).await;
        };
        let owner = control.owner_user_id.as_str();

        if room.mimic_user_id.as_deref() != Some(owner) {
            return self
                .reply_about(control, &display, &messages::never_mimicked(&display), true, scope)
                .await;
        }

        self.rooms.set_mimic_user(&room.room_id, None).await?;
        info!(room_id = %room.room_id, mimic = %owner, "mimic claim released");
        self.reply_about(control, &display, &messages::stopped_mimic(&display), true, scope)
            .await?;
        let notice = messages::mimic_user_left(owner, &display);
        self.notify_members(&display, &[owner], &notice, scope)
            .await
    }

    async fn setmode_command(
        &self,
        control: &ControlRoom,
        spec: &CommandSpec,
        target: Option<TargetRoom>,
        args: &[String],
        scope: &EffectScope,
    ) -> Result<(), BridgeError> {
        let owner = control.owner_user_id.as_str();
        let room_id = target.as_ref().map(|target| target.room.room_id.as_str());
        let display = target.as_ref().map(|target| &target.display);

        let mode = match args {
            [mode] => mode.to_lowercase(),
            _ => {
                return self
                    .reply(control, &messages::usage(spec.name, spec.usage), scope)
                    .await;
            }
        };

        let message = match mode.as_str() {
            "echo" | "replace" => {
                let replace = mode == "replace";
                self.rules
                    .set_response_mode(owner, room_id, replace)
                    .await?;
                messages::mode_set(display, replace)
            }
            "default" => {
                self.rules.clear_response_mode(owner, room_id).await?;
                match display {
                    Some(display) => messages::mode_cleared(display),
                    None => messages::mode_set(None, false),
                }
            }
            _ => messages::usage(spec.name, spec.usage),
        };
        self.reply_scoped(control, target.as_ref(), &message, scope)
            .await
    }

    async fn blacklist_command(
        &self,
        control: &ControlRoom,
        spec: &CommandSpec,
        target: Option<TargetRoom>,
        args: &[String],
        scope: &EffectScope,
    ) -> Result<(), BridgeError> {
        let owner = control.owner_user_id.as_str();
        let room_id = target.as_ref().map(|target| target.room.room_id.as_str());
        let display = target.as_ref().map(|target| &target.display);

        let message = match args {
            [] => messages::usage(spec.name, spec.usage),
            [word] if word.eq_ignore_ascii_case("default") => {
                self.rules.clear_blacklist(owner, room_id).await?;
                match display {
                    Some(display) => messages::blacklist_cleared(display),
                    None => messages::blacklist_set(None, ""),
                }
            }
            [word] if word.eq_ignore_ascii_case("none") => {
                self.rules.set_blacklist(owner, room_id, "").await?;
                messages::blacklist_set(display, "")
            }
            patterns => {
                let pattern = patterns.join(" ");
                match compile_blacklist(&pattern) {
                    Ok(_) => {
                        self.rules.set_blacklist(owner, room_id, &pattern).await?;
                        messages::blacklist_set(display, &pattern)
                    }
                    Err(e) => {
                        debug!(user = %owner, "rejected blacklist pattern: {}", e);
                        messages::invalid_pattern(&pattern)
                    }
                }
            }
        };
        self.reply_scoped(control, target.as_ref(), &message, scope)
            .await
    }

    async fn getblacklist_command(
        &self,
        control: &ControlRoom,
        target: Option<TargetRoom>,
        scope: &EffectScope,
    ) -> Result<(), BridgeError> {
        let owner = control.owner_user_id.as_str();
        let message = match &target {
            Some(target) => {
                let room_rule = self
                    .rules
                    .get_blacklist(owner, Some(&target.room.room_id))
                    .await?;
                match room_rule {
                    Some(rule) => {
                        messages::blacklist_shown(Some(&target.display), Some(&rule.pattern), false)
                    }
                    None => {
                        let global = self.rules.get_blacklist(owner, None).await?;
                        let pattern = global.as_ref().map(|rule| rule.pattern.as_str());
                        messages::blacklist_shown(Some(&target.display), pattern, pattern.is_some())
                    }
                }
            }
            None => {
                let global = self.rules.get_blacklist(owner, None).await?;
                messages::blacklist_shown(None, global.as_ref().map(|rule| rule.pattern.as_str()), false)
            }
        };
        self.reply_scoped(control, target.as_ref(), &message, scope)
            .await
    }

    async fn status_command(
        &self,
        control: &ControlRoom,
        scope: &EffectScope,
    ) -> Result<(), BridgeError> {
        let owner = control.owner_user_id.as_str();
        self.rules.clear_latest_reply_link(&control.room_id).await?;

        let mimicked = self.rooms.rooms_mimicked_by(owner).await?;
        if mimicked.is_empty() {
            self.reply(control, &messages::mimic_none(), scope).await?;
        } else {
            self.reply(control, &messages::mimic_status(), scope).await?;
            for room_id in &mimicked {
                let display = self.room_ref(room_id).await?;
                self.reply_about(control, &display, &messages::room(&display), false, scope)
                    .await?;
            }
        }

        let mut relayed = Vec::new();
        for room in self.rooms.list_monitored_rooms().await? {
            let Some(mimic) = room.mimic_user_id.as_deref() else {
                continue;
            };
            if mimic == owner {
                continue;
            }
            let members = self.joined_members_or_empty(&room.room_id).await?;
            if !members.iter().any(|member| member == owner) {
                continue;
            }
            if let Some(plan) = self.relay_plan(&room, owner).await? {
                relayed.push((room.room_id.clone(), plan.mimic_user_id));
            }
        }

        if relayed.is_empty() {
            return self.reply(control, &messages::relayed_none(), scope).await;
        }
        self.reply(control, &messages::relayed_status(), scope).await?;
        for (room_id, mimic) in &relayed {
            let display = self.room_ref(room_id).await?;
            let message = messages::relayed_by(&display, mimic);
            self.reply_about(control, &display, &message, false, scope)
                .await?;
        }
        Ok(())
    }

    async fn actions_command(
        &self,
        control: &ControlRoom,
        scope: &EffectScope,
    ) -> Result<(), BridgeError> {
        let owner = control.owner_user_id.as_str();
        self.rules.clear_latest_reply_link(&control.room_id).await?;

        let mut available = Vec::new();
        for room in self.rooms.list_monitored_rooms().await? {
            if room.mimic_user_id.is_some() {
                continue;
            }
            let members = self.joined_members_or_empty(&room.room_id).await?;
            if members.iter().any(|member| member == owner) {
                available.push(room.room_id);
            }
        }

        if available.is_empty() {
            return self
                .reply(control, &messages::mimic_none_available(), scope)
                .await;
        }
        self.reply(control, &messages::mimic_available(), scope).await?;
        for room_id in &available {
            let display = self.room_ref(room_id).await?;
            self.reply_about(control, &display, &messages::room(&display), false, scope)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("token", RoomScope::Global)]
    #[test_case("revoke", RoomScope::Global)]
    #[test_case("mimicme", RoomScope::Required)]
    #[test_case("stopit", RoomScope::Required)]
    #[test_case("setmode", RoomScope::Optional)]
    #[test_case("blacklist", RoomScope::Optional)]
    #[test_case("getblacklist", RoomScope::Optional)]
    #[test_case("status", RoomScope::Global)]
    #[test_case("actions", RoomScope::Global)]
    #[test_case("help", RoomScope::Global)]
    fn catalogue_declares_room_scope(name: &str, expected: RoomScope) {
        let spec = find_command(name).unwrap();
        assert_eq!(spec.scope, expected);
    }

    #[test]
    fn catalogue_names_are_unique_and_lower_case() {
        for (i, spec) in COMMANDS.iter().enumerate() {
            assert_eq!(spec.name, spec.name.to_lowercase());
            assert!(COMMANDS[i + 1..].iter().all(|other| other.name != spec.name));
        }
        assert!(find_command("MIMICME").is_none());
        assert!(find_command("dance").is_none());
    }

    #[test]
    fn room_scoped_usage_mentions_the_room() {
        for spec in COMMANDS.iter().filter(|spec| spec.scope != RoomScope::Global) {
            assert!(spec.usage.starts_with("[room]"), "{}", spec.name);
        }
    }
}
