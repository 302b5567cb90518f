pub mod command_parser;

pub use command_parser::{
    ParsedCommand, RoomReference, mentions_user, parse_command, parse_room_reference,
    strip_reply_fallback,
};
