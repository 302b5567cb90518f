use regex::Regex;

use crate::db::{BlacklistRule, ControlRoom, MonitoredRoom, ResponseModeRule};

pub(crate) const REPLACE_REASON: &str = "Replaced by ImposterBot";

/// Who a message is relayed as, and with which credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RelayPlan {
    pub(crate) mimic_user_id: String,
    pub(crate) access_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RedactionRequest {
    pub(crate) room_id: String,
    pub(crate) event_id: String,
    pub(crate) reason: &'static str,
}

/// Compiles whitespace-separated alternatives into one regex that must match a whole user id.
pub(crate) fn compile_blacklist(pattern: &str) -> Result<Option<Regex>, regex::Error> {
    let alternatives: Vec<&str> = pattern.split_whitespace().collect();
    if alternatives.is_empty() {
        return Ok(None);
    }
    let joined = alternatives
        .iter()
        .map(|alternative| format!("(?:{alternative})"))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!("^(?:{joined})$")).map(Some)
}

pub(crate) fn blacklist_matches(pattern: &str, sender: &str) -> bool {
    match compile_blacklist(pattern) {
        Ok(Some(regex)) => regex.is_match(sender),
        Ok(None) | Err(_) => false,
    }
}

/// A room row overrides the global row, even when its pattern is empty.
pub(crate) fn effective_blacklist<'a>(
    room_rule: Option<&'a BlacklistRule>,
    global_rule: Option<&'a BlacklistRule>,
) -> Option<&'a str> {
    room_rule.or(global_rule).map(|rule| rule.pattern.as_str())
}

/// Echo unless the room row, else the global row, says replace.
pub(crate) fn effective_replace(
    room_rule: Option<&ResponseModeRule>,
    global_rule: Option<&ResponseModeRule>,
) -> bool {
    room_rule
        .or(global_rule)
        .is_some_and(|rule| rule.replace_original)
}

pub(crate) fn resolve_relay(
    room: &MonitoredRoom,
    sender: &str,
    blacklist: Option<&str>,
    mimic_control_room: Option<&ControlRoom>,
) -> Option<RelayPlan> {
    let mimic_user_id = room.mimic_user_id.as_deref()?;
    if mimic_user_id == sender {
        return None;
    }
    if blacklist.is_some_and(|pattern| blacklist_matches(pattern, sender)) {
        return None;
    }
    let control = mimic_control_room.filter(|control| control.owner_user_id == mimic_user_id)?;
    let access_token = control.access_token.as_deref()?;
    Some(RelayPlan {
        mimic_user_id: mimic_user_id.to_string(),
        access_token: access_token.to_string(),
    })
}

pub(crate) fn replace_redaction_request(room_id: &str, event_id: &str) -> RedactionRequest {
    RedactionRequest {
        room_id: room_id.to_string(),
        event_id: event_id.to_string(),
        reason: REPLACE_REASON,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use test_case::test_case;

    use super::*;

    fn room(mimic: Option<&str>) -> MonitoredRoom {
        MonitoredRoom {
            room_id: "!room:hs".to_string(),
            mimic_user_id: mimic.map(ToOwned::to_owned),
            created_at: Utc::now(),
        }
    }

    fn control(owner: &str, token: Option<&str>) -> ControlRoom {
        ControlRoom {
            owner_user_id: owner.to_string(),
            room_id: "!ctl:hs".to_string(),
            access_token: token.map(ToOwned::to_owned),
            pending_rename: false,
            created_at: Utc::now(),
        }
    }

    fn blacklist(room_id: Option<&str>, pattern: &str) -> BlacklistRule {
        BlacklistRule {
            mimic_user_id: "@mimic:hs".to_string(),
            room_id: room_id.map(ToOwned::to_owned),
            pattern: pattern.to_string(),
        }
    }

    #[test_case("@spam:hs", "@spam:hs", true; "exact")]
    #[test_case("@spam.*", "@spammer:hs", true; "wildcard")]
    #[test_case("@spam", "@spammer:hs", false; "anchored")]
    #[test_case("@a:hs @b:hs", "@b:hs", true; "second alternative")]
    #[test_case("", "@b:hs", false; "empty blocks nobody")]
    #[test_case("(", "(", false; "invalid never matches")]
    fn blacklist_matching(pattern: &str, sender: &str, expected: bool) {
        assert_eq!(blacklist_matches(pattern, sender), expected);
    }

    #[test]
    fn compile_blacklist_rejects_invalid_regex() {
        assert!(compile_blacklist("@ok:hs [").is_err());
        assert!(compile_blacklist("   ").unwrap().is_none());
    }

    #[test]
    fn room_blacklist_overrides_global() {
        let room_rule = blacklist(Some("!room:hs"), "@room-only:hs");
        let global_rule = blacklist(None, "@global:hs");

        let effective = effective_blacklist(Some(&room_rule), Some(&global_rule));
        assert_eq!(effective, Some("@room-only:hs"));
        assert!(!blacklist_matches(effective.unwrap(), "@global:hs"));

        let effective = effective_blacklist(None, Some(&global_rule));
        assert!(blacklist_matches(effective.unwrap(), "@global:hs"));
    }

    #[test]
    fn room_response_mode_overrides_global() {
        let global = ResponseModeRule {
            mimic_user_id: "@mimic:hs".to_string(),
            room_id: None,
            replace_original: true,
        };
        let room_rule = ResponseModeRule {
            room_id: Some("!room:hs".to_string()),
            replace_original: false,
            ..global.clone()
        };
        assert!(!effective_replace(Some(&room_rule), Some(&global)));
        assert!(effective_replace(None, Some(&global)));
        assert!(!effective_replace(None, None));
    }

    #[test]
    fn resolve_relay_excludes_self_and_missing_tokens() {
        let mimic = control("@mimic:hs", Some("secret"));
        assert_eq!(
            resolve_relay(&room(Some("@mimic:hs")), "@victim:hs", None, Some(&mimic)),
            Some(RelayPlan {
                mimic_user_id: "@mimic:hs".to_string(),
                access_token: "secret".to_string(),
            })
        );
        assert_eq!(
            resolve_relay(&room(Some("@mimic:hs")), "@mimic:hs", None, Some(&mimic)),
            None
        );
        assert_eq!(resolve_relay(&room(None), "@victim:hs", None, Some(&mimic)), None);
        assert_eq!(
            resolve_relay(
                &room(Some("@mimic:hs")),
                "@victim:hs",
                Some("@victim:hs"),
                Some(&mimic)
            ),
            None
        );
        let tokenless = control("@mimic:hs", None);
        assert_eq!(
            resolve_relay(&room(Some("@mimic:hs")), "@victim:hs", None, Some(&tokenless)),
            None
        );
    }
}
