use serde::Deserialize;
use serde_json::Value;

/// Room event as pushed by the home server inside a transaction.
#[derive(Debug, Clone, Deserialize)]
pub struct MatrixEvent {
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub sender: String,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub state_key: Option<String>,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub unsigned: Value,
    #[serde(default)]
    pub prev_content: Option<Value>,
}

impl MatrixEvent {
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(value)
    }

    pub fn is_membership(&self) -> bool {
        self.event_type == "m.room.member"
    }

    pub fn is_message(&self) -> bool {
        self.event_type == "m.room.message"
    }

    pub fn membership(&self) -> Option<&str> {
        self.content.get("membership").and_then(Value::as_str)
    }

    /// Membership before this event, taken from `unsigned.prev_content` or the legacy top-level field.
    pub fn prev_membership(&self) -> Option<&str> {
        self.unsigned
            .get("prev_content")
            .or(self.prev_content.as_ref())
            .and_then(|prev| prev.get("membership"))
            .and_then(Value::as_str)
    }

    pub fn is_direct(&self) -> bool {
        self.content
            .get("is_direct")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn body(&self) -> Option<&str> {
        self.content.get("body").and_then(Value::as_str)
    }

    pub fn formatted_body(&self) -> Option<&str> {
        if self.content.get("format").and_then(Value::as_str) != Some("org.matrix.custom.html") {
            return None;
        }
        self.content.get("formatted_body").and_then(Value::as_str)
    }

    pub fn in_reply_to(&self) -> Option<&str> {
        self.content
            .get("m.relates_to")
            .and_then(|relates| relates.get("m.in_reply_to"))
            .and_then(|reply| reply.get("event_id"))
            .and_then(Value::as_str)
    }

    pub fn displayname(&self) -> Option<&str> {
        self.content.get("displayname").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_membership_with_unsigned_prev_content() {
        let event = MatrixEvent::from_value(&json!({
            "event_id": "$join",
            "type": "m.room.member",
            "sender": "@alice:hs",
            "room_id": "!room:hs",
            "state_key": "@alice:hs",
            "content": {"membership": "join", "displayname": "Alice"},
            "unsigned": {"prev_content": {"membership": "join"}}
        }))
        .unwrap();

        assert!(event.is_membership());
        assert_eq!(event.membership(), Some("join"));
        assert_eq!(event.prev_membership(), Some("join"));
        assert_eq!(event.displayname(), Some("Alice"));
    }

    #[test]
    fn falls_back_to_legacy_prev_content() {
        let event = MatrixEvent::from_value(&json!({
            "type": "m.room.member",
            "sender": "@alice:hs",
            "content": {"membership": "leave"},
            "prev_content": {"membership": "invite"}
        }))
        .unwrap();
        assert_eq!(event.prev_membership(), Some("invite"));
        assert_eq!(event.room_id, None);
    }

    #[test]
    fn reads_message_fields() {
        let event = MatrixEvent::from_value(&json!({
            "event_id": "$msg",
            "type": "m.room.message",
            "sender": "@bob:hs",
            "room_id": "!room:hs",
            "content": {
                "msgtype": "m.text",
                "body": "hi",
                "format": "org.matrix.custom.html",
                "formatted_body": "<b>hi</b>",
                "m.relates_to": {"m.in_reply_to": {"event_id": "$parent"}}
            }
        }))
        .unwrap();
        assert!(event.is_message());
        assert_eq!(event.body(), Some("hi"));
        assert_eq!(event.formatted_body(), Some("<b>hi</b>"));
        assert_eq!(event.in_reply_to(), Some("$parent"));
    }

    #[test]
    fn rejects_events_without_sender() {
        assert!(MatrixEvent::from_value(&json!({"type": "m.room.message"})).is_err());
    }
}
