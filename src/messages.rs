use serde_json::{Value, json};

use crate::utils::formatting::{escape_html, matrix_to_link};

/// A message in both plain and `org.matrix.custom.html` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedMessage {
    pub plain: String,
    pub html: String,
}

impl FormattedMessage {
    pub fn to_content(&self) -> Value {
        json!({
            "msgtype": "m.text",
            "body": self.plain,
            "format": "org.matrix.custom.html",
            "formatted_body": self.html,
        })
    }
}

/// A room as shown to users: its id for the link, its display name for the text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRef {
    pub id: String,
    pub name: String,
}

impl RoomRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

#[derive(Default)]
struct Builder {
    plain: String,
    html: String,
}

impl Builder {
    fn text(mut self, text: &str) -> Self {
        self.plain.push_str(text);
        self.html.push_str(&escape_html(text).replace('\n', "<br>"));
        self
    }

    fn room(mut self, room: &RoomRef) -> Self {
        self.plain.push_str(&room.name);
        self.html.push_str(&matrix_to_link(&room.id, &room.name));
        self
    }

    fn user(mut self, user_id: &str) -> Self {
        self.plain.push_str(user_id);
        self.html.push_str(&matrix_to_link(user_id, user_id));
        self
    }

    fn build(self) -> FormattedMessage {
        FormattedMessage {
            plain: self.plain,
            html: self.html,
        }
    }
}

fn text(text: &str) -> FormattedMessage {
    Builder::default().text(text).build()
}

const ASK_FOR_TOKEN: &str = "You can give me your token by saying \"token <your-token-here>\".";
const OFFER_MIMIC: &str =
    "Reply \"mimicme\" to this message to make me post other people's messages on your behalf in that room.";
const OFFER_STOP: &str = "To make me stop, reply \"stopit\" to this message.";

pub fn welcome() -> FormattedMessage {
    text(
        "Hi! I'm imposter-bot. Send me commands in this room.\nTry saying \"help\" to see a list of everything you can make me do.",
    )
}

pub fn ping() -> FormattedMessage {
    text("You called?")
}

pub fn already_controlled() -> FormattedMessage {
    text(
        "You invited me to a direct chat room, but we already have this room, and I can only be in one direct chat at a time!",
    )
}

pub fn invalid_control_room_user(intruder: &str, owner: &str) -> FormattedMessage {
    Builder::default()
        .text("Hey ")
        .user(intruder)
        .text(", you aren't allowed in here! This is ")
        .user(owner)
        .text("'s control room!")
        .build()
}

pub fn invalid_command() -> FormattedMessage {
    text("Not a valid command! Say \"help\" to see what I understand.")
}

pub fn usage(command: &str, usage: &str) -> FormattedMessage {
    text(&format!("Usage: {command} {usage}"))
}

pub fn received_token() -> FormattedMessage {
    text("Thanks for your access token! I can now mimic you.\nTo make me revoke this token, say \"revoke\".")
}

pub fn invalid_token() -> FormattedMessage {
    text("Invalid access token!!")
}

pub fn revoked_token() -> FormattedMessage {
    text("OK, I discarded the access token you gave me. If I was mimicking you anywhere, I won't anymore.")
}

pub fn no_revoke_token() -> FormattedMessage {
    text("You never gave me a token to revoke!")
}

pub fn expired_token() -> FormattedMessage {
    text(&format!(
        "The token I have for your account is invalid. I can't mimic you until you give me a new, valid access token.\n{ASK_FOR_TOKEN}"
    ))
}

pub fn no_room() -> FormattedMessage {
    text("I can only answer that command in response to a room that I am present in!")
}

pub fn cant_mimic() -> FormattedMessage {
    text(&format!(
        "I can't mimic you until I have your access token! {ASK_FOR_TOKEN}"
    ))
}

pub fn accepted_mimic(room: &RoomRef) -> FormattedMessage {
    Builder::default()
        .text("I am now mimicking you in ")
        .room(room)
        .text(&format!("!\n{OFFER_STOP}"))
        .build()
}

pub fn already_mimic(room: &RoomRef) -> FormattedMessage {
    Builder::default()
        .text("I am already mimicking you in ")
        .room(room)
        .text("!")
        .build()
}

pub fn rejected_mimic(mimic_user: &str, room: &RoomRef) -> FormattedMessage {
    Builder::default()
        .text("I can't mimic you in ")
        .room(room)
        .text(", because I am already mimicking ")
        .user(mimic_user)
        .text(" in that room.")
        .build()
}

pub fn stopped_mimic(room: &RoomRef) -> FormattedMessage {
    Builder::default()
        .text("Okay, I stopped mimicking you in ")
        .room(room)
        .text(".")
        .build()
}

pub fn never_mimicked(room: &RoomRef) -> FormattedMessage {
    Builder::default()
        .text("I was never mimicking you in ")
        .room(room)
        .text("!")
        .build()
}

pub fn mimic_taken(mimic_user: &str, room: &RoomRef) -> FormattedMessage {
    Builder::default()
        .text("I am now mimicking ")
        .user(mimic_user)
        .text(" in the following room:\n")
        .room(room)
        .text("\nYour messages there will be reposted under their name.")
        .build()
}

pub fn mimic_user_left(mimic_user: &str, room: &RoomRef) -> FormattedMessage {
    Builder::default()
        .text("I am no longer mimicking ")
        .user(mimic_user)
        .text(" in the following room:\n")
        .room(room)
        .text(&format!(
            "\nNo one's messages will appear as coming from them anymore. This means you can now ask me to mimic you in that room if you like!\n{OFFER_MIMIC}"
        ))
        .build()
}

pub fn bot_joined(room: &RoomRef) -> FormattedMessage {
    Builder::default()
        .text("I just joined a room:\n")
        .room(room)
        .text(&format!("\n{OFFER_MIMIC}"))
        .build()
}

pub fn bot_left(room: &RoomRef) -> FormattedMessage {
    Builder::default()
        .text("I just left this room:\n")
        .room(room)
        .text("\nMy reign of terror in that room is over. I won't alter messages in it anymore.")
        .build()
}

pub fn user_joined(room: &RoomRef, mimic_user: Option<&str>) -> FormattedMessage {
    let builder = Builder::default()
        .text("You just joined a room that I am present in:\n")
        .room(room);
    match mimic_user {
        None => builder.text(&format!("\n{OFFER_MIMIC}")).build(),
        Some(mimic_user) => builder
            .text("\nI am mimicking ")
            .user(mimic_user)
            .text(" there, so your messages may be reposted under their name.")
            .build(),
    }
}

pub fn user_left(room: &RoomRef) -> FormattedMessage {
    Builder::default()
        .text("You just left a room that I was monitoring:\n")
        .room(room)
        .build()
}

fn scope(builder: Builder, room: Option<&RoomRef>) -> Builder {
    match room {
        Some(room) => builder.text(" in ").room(room),
        None => builder.text(" in every room without its own setting"),
    }
}

pub fn mode_set(room: Option<&RoomRef>, replace: bool) -> FormattedMessage {
    let mode = if replace {
        "replace other people's messages"
    } else {
        "echo other people's messages"
    };
    scope(Builder::default().text(&format!("Okay, I will {mode}")), room)
        .text(".")
        .build()
}

pub fn mode_cleared(room: &RoomRef) -> FormattedMessage {
    Builder::default()
        .text("Okay, ")
        .room(room)
        .text(" now follows your global response mode.")
        .build()
}

pub fn blacklist_set(room: Option<&RoomRef>, pattern: &str) -> FormattedMessage {
    let builder = if pattern.is_empty() {
        Builder::default().text("Okay, I will repost everyone's messages")
    } else {
        Builder::default().text(&format!(
            "Okay, I will ignore messages from users matching \"{pattern}\""
        ))
    };
    scope(builder, room).text(".").build()
}

pub fn blacklist_cleared(room: &RoomRef) -> FormattedMessage {
    Builder::default()
        .text("Okay, ")
        .room(room)
        .text(" now follows your global blacklist.")
        .build()
}

pub fn blacklist_shown(room: Option<&RoomRef>, pattern: Option<&str>, inherited: bool) -> FormattedMessage {
    let builder = match pattern {
        Some(pattern) if !pattern.is_empty() => Builder::default().text(&format!(
            "I ignore messages from users matching \"{pattern}\""
        )),
        _ => Builder::default().text("I don't ignore anyone"),
    };
    let builder = scope(builder, room);
    if inherited {
        builder.text(" (from your global blacklist).").build()
    } else {
        builder.text(".").build()
    }
}

pub fn invalid_pattern(pattern: &str) -> FormattedMessage {
    text(&format!("\"{pattern}\" is not a valid pattern."))
}

pub fn mimic_none() -> FormattedMessage {
    text("I am not mimicking you in any rooms!")
}

pub fn mimic_status() -> FormattedMessage {
    text("I am mimicking you in the following rooms. Reply \"stopit\" to the room you want me to stop mimicking you in.")
}

pub fn relayed_none() -> FormattedMessage {
    text("Nobody is reposting your messages anywhere.")
}

pub fn relayed_status() -> FormattedMessage {
    text("Your messages are being reposted in the following rooms:")
}

pub fn mimic_none_available() -> FormattedMessage {
    text("There are no rooms where I can mimic you in!")
}

pub fn mimic_available() -> FormattedMessage {
    text("I can mimic you in the following rooms. Reply \"mimicme\" to the room you want me to mimic you in.")
}

pub fn room(room: &RoomRef) -> FormattedMessage {
    Builder::default().room(room).build()
}

pub fn relayed_by(room: &RoomRef, mimic_user: &str) -> FormattedMessage {
    Builder::default()
        .room(room)
        .text(" as ")
        .user(mimic_user)
        .build()
}

pub fn help(commands: &[(&str, &str, &str)]) -> FormattedMessage {
    let mut builder = Builder::default().text("Here is everything I understand:");
    for (name, usage, description) in commands {
        let line = if usage.is_empty() {
            format!("\n{name}: {description}")
        } else {
            format!("\n{name} {usage}: {description}")
        };
        builder = builder.text(&line);
    }
    builder
        .text("\nWherever a [room] is accepted you may instead reply to one of my messages about that room.")
        .build()
}

/// Prefixes a relayed message with the original author.
pub fn relay_attribution(sender: &str, body: &str, formatted_body: Option<&str>) -> FormattedMessage {
    FormattedMessage {
        plain: format!("{sender} says:\n\n{body}"),
        html: format!(
            "{} says:<br><br>{}",
            matrix_to_link(sender, sender),
            formatted_body
                .map(ToOwned::to_owned)
                .unwrap_or_else(|| escape_html(body).replace('\n', "<br>"))
        ),
    }
}

pub fn relay_joined(sender: &str) -> FormattedMessage {
    Builder::default().user(sender).text(" joined the room.").build()
}

pub fn relay_left(sender: &str) -> FormattedMessage {
    Builder::default().user(sender).text(" left the room.").build()
}

pub fn relay_renamed(sender: &str, displayname: Option<&str>) -> FormattedMessage {
    let builder = Builder::default().user(sender);
    match displayname {
        Some(name) => builder.text(&format!(" is now known as {name}.")).build(),
        None => builder.text(" updated their profile.").build(),
    }
}
