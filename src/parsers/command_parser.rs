use once_cell::sync::Lazy;
use regex::Regex;

static HTML_TAG_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid html tag regex"));

const MATRIX_TO_PREFIX: &str = "https://matrix.to/#/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomReference {
    RoomId(String),
    Alias(String),
}

/// Splits a control-room message into a lower-cased command word and its arguments.
pub fn parse_command(text: &str) -> Option<ParsedCommand> {
    let mut segments = text.split_whitespace();
    let command = segments.next()?.to_lowercase();
    let args = segments.map(ToString::to_string).collect();
    Some(ParsedCommand { command, args })
}

/// Returns the text a user typed, without the quoted message a reply carries.
///
/// Rich replies put the quote in an `<mx-reply>` block of the formatted body;
/// the plain body repeats it as leading `> ` lines followed by a blank line.
pub fn strip_reply_fallback(body: &str, formatted_body: Option<&str>) -> String {
    if let Some(formatted) = formatted_body
        && let Some(end) = formatted.find("</mx-reply>")
    {
        let remainder = &formatted[end + "</mx-reply>".len()..];
        return HTML_TAG_REGEX.replace_all(remainder, " ").trim().to_string();
    }

    let mut lines = body.lines().peekable();
    let mut quoted = false;
    while let Some(line) = lines.peek() {
        if line.starts_with("> ") || *line == ">" {
            quoted = true;
            lines.next();
        } else {
            break;
        }
    }
    if quoted && lines.peek().is_some_and(|line| line.trim().is_empty()) {
        lines.next();
    }
    lines.collect::<Vec<_>>().join("\n").trim().to_string()
}

/// Recognises `!room:server`, `#alias:server` and their matrix.to links.
pub fn parse_room_reference(word: &str) -> Option<RoomReference> {
    let word = word
        .strip_prefix(MATRIX_TO_PREFIX)
        .map(|link| link.split(['?', '/']).next().unwrap_or(link))
        .unwrap_or(word);

    let (_, server) = word.split_once(':')?;
    if server.is_empty() || word.len() < 3 {
        return None;
    }

    match word.chars().next()? {
        '!' => Some(RoomReference::RoomId(word.to_string())),
        '#' => Some(RoomReference::Alias(word.to_string())),
        _ => None,
    }
}

/// True when `body` names `user_id`, either verbatim or as a matrix.to link.
pub fn mentions_user(body: &str, formatted_body: Option<&str>, user_id: &str) -> bool {
    body.contains(user_id)
        || formatted_body.is_some_and(|html| html.contains(&format!("{MATRIX_TO_PREFIX}{user_id}")))
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn parse_command_lowercases_the_command_word() {
        assert_eq!(
            parse_command("  MimicMe !room:hs "),
            Some(ParsedCommand {
                command: "mimicme".to_string(),
                args: vec!["!room:hs".to_string()]
            })
        );
        assert_eq!(parse_command("   "), None);
    }

    #[test]
    fn parse_command_keeps_argument_case() {
        let parsed = parse_command("token AbC123").unwrap();
        assert_eq!(parsed.args, vec!["AbC123".to_string()]);
    }

    #[test_case("!abc:example.org", Some(RoomReference::RoomId("!abc:example.org".into())); "room id")]
    #[test_case("#lounge:example.org", Some(RoomReference::Alias("#lounge:example.org".into())); "alias")]
    #[test_case("https://matrix.to/#/!abc:example.org?via=example.org", Some(RoomReference::RoomId("!abc:example.org".into())); "room link")]
    #[test_case("https://matrix.to/#/#lounge:example.org", Some(RoomReference::Alias("#lounge:example.org".into())); "alias link")]
    #[test_case("echo", None; "plain word")]
    #[test_case("#hashtag", None; "no server")]
    #[test_case("@alice:example.org", None; "user id")]
    fn parse_room_reference_cases(word: &str, expected: Option<RoomReference>) {
        assert_eq!(parse_room_reference(word), expected);
    }

    #[test]
    fn strip_reply_fallback_drops_plain_quote() {
        let body = "> <@imposter:hs> You are now mimicking in Lounge\n> second line\n\nsetmode replace";
        assert_eq!(strip_reply_fallback(body, None), "setmode replace");
    }

    #[test]
    fn strip_reply_fallback_prefers_formatted_reply() {
        let formatted = "<mx-reply><blockquote>quoted</blockquote></mx-reply>stopit";
        assert_eq!(strip_reply_fallback("> quoted\n\nstopit", Some(formatted)), "stopit");
    }

    #[test]
    fn strip_reply_fallback_leaves_ordinary_text() {
        assert_eq!(strip_reply_fallback("status", None), "status");
        assert_eq!(strip_reply_fallback("blacklist a\n> b", None), "blacklist a\n> b");
    }

    #[test]
    fn mentions_user_checks_body_and_links() {
        assert!(mentions_user("hey @imposter:hs", None, "@imposter:hs"));
        assert!(mentions_user(
            "hey Imposter",
            Some("hey <a href=\"https://matrix.to/#/@imposter:hs\">Imposter</a>"),
            "@imposter:hs"
        ));
        assert!(!mentions_user("hey there", None, "@imposter:hs"));
    }
}
