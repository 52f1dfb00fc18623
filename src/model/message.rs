//! Messages and the helpers that turn raw payloads into them.

use std::sync::LazyLock;

use bitflags::bitflags;
use regex::Regex;

use super::User;

bitflags! {
    /// Per-message flag bits.
    pub struct MessageFlags: u32 {
        const PREMIUM = 1 << 2;
        const BG_ON = 1 << 3;
        const MEDIA_ON = 1 << 4;
        const CENSORED = 1 << 5;
        const SHOW_MOD_ICON = 1 << 6;
        const SHOW_STAFF_ICON = 1 << 7;
        const CHANNEL_RED = 1 << 8;
        const CHANNEL_ORANGE = 1 << 9;
        const CHANNEL_GREEN = 1 << 10;
        const CHANNEL_CYAN = 1 << 11;
        const CHANNEL_BLUE = 1 << 12;
        const CHANNEL_PURPLE = 1 << 13;
        const CHANNEL_PINK = 1 << 14;
        const CHANNEL_MOD = 1 << 15;
    }
}

/// Numeric font faces the service understands.
pub static FONT_FACES: &[(&str, &str)] = &[
    ("0", "arial"),
    ("1", "comic"),
    ("2", "georgia"),
    ("3", "handwriting"),
    ("4", "impact"),
    ("5", "palatino"),
    ("6", "papirus"),
    ("7", "times"),
    ("8", "typewriter"),
];

/// The (room, author) pair a message was delivered on.
#[derive(Debug, Clone)]
pub struct Channel {
    pub room: String,
    pub user: User,
}

/// A chat message.
///
/// `temp_id` is the provisional id delivered with the payload; `id` is the
/// final server-assigned id and stays `None` until the two-phase delivery is
/// reconciled. Once a message enters the room history it is no longer
/// mutated.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: Option<String>,
    pub temp_id: String,
    pub user: User,
    /// Server wall time adjusted by the session's clock correction.
    pub time: f64,
    pub ip: String,
    pub puid: String,
    /// Unique-name id; the key ban operations use for anonymous authors.
    pub unid: String,
    pub body: String,
    pub raw: String,
    pub flags: MessageFlags,
    /// Roster users referenced by `@name` in the body.
    pub mentions: Vec<User>,
    pub channel: Channel,
}

static NAME_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<n(.*?)/>").unwrap());
static ROOM_FONT_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<f(.*?)>").unwrap());
static PM_FONT_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<g(.*?)>").unwrap());
static ROOM_FONT_STRIP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("<f.*?>|\"<i s=sm://(.*)\"").unwrap());
static PM_FONT_STRIP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("<g.*?>|\"<i s=sm://(.*)\"").unwrap());
static NAME_STRIP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<n.*?/>").unwrap());
static FONT_SPEC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"x(\d{1,2})?([a-fA-F0-9]{6}|[a-fA-F0-9]{3})="(.*?)""#).unwrap()
});
static MENTION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"@([a-zA-Z0-9]{1,20})").unwrap());

/// Derive the display name of an anonymous user.
///
/// The last four digits of the connection timestamp and the middle four
/// digits of the zero-padded puid are summed digit-wise modulo ten.
pub fn anon_name(ts: &str, puid: &str) -> String {
    let puid_digits: Vec<char> = format!("{:0>8}", puid).chars().skip(4).take(4).collect();
    let seed = if ts.len() < 4 {
        "3452".to_owned()
    } else {
        let whole = ts.split('.').next().unwrap_or("");
        whole
            .chars()
            .skip(whole.chars().count().saturating_sub(4))
            .collect()
    };
    let seed_digits: Vec<char> = seed.chars().collect();

    let mut out = String::with_capacity(8);
    out.push_str("anon");
    for (i, ch) in puid_digits.iter().enumerate() {
        let p = ch.to_digit(10).unwrap_or(0);
        let t = seed_digits
            .get(i)
            .and_then(|c| c.to_digit(10))
            .unwrap_or(0);
        out.push(char::from_digit((p + t) % 10, 10).unwrap_or('0'));
    }
    out
}

/// Styling extracted from a raw message body.
#[derive(Debug, Clone, PartialEq)]
pub struct FontSpec {
    pub size: u32,
    pub color: String,
    pub face: String,
}

impl Default for FontSpec {
    fn default() -> FontSpec {
        FontSpec {
            size: 11,
            color: "000000".to_owned(),
            face: "0".to_owned(),
        }
    }
}

/// Pull the font size, color and face out of a `<f …>` tag body.
pub(crate) fn parse_font(font: &str) -> FontSpec {
    match FONT_SPEC.captures(font) {
        Some(caps) => FontSpec {
            size: caps
                .get(1)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(11),
            color: caps
                .get(2)
                .map(|m| m.as_str().to_owned())
                .unwrap_or_else(|| "000000".to_owned()),
            face: caps
                .get(3)
                .map(|m| m.as_str().to_owned())
                .unwrap_or_else(|| "0".to_owned()),
        },
        None => FontSpec::default(),
    }
}

/// Strip the style tags off a raw body.
///
/// Returns the cleaned text plus the captured `<n…/>` and font tag bodies
/// (empty strings when absent). PM bodies carry their font in `<g…>` rather
/// than `<f…>`.
pub(crate) fn clean_message(raw: &str, pm: bool) -> (String, String, String) {
    let name_tag = NAME_TAG
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_owned())
        .unwrap_or_default();
    let (font_tag_re, font_strip_re): (&Regex, &Regex) = if pm {
        (&PM_FONT_TAG, &PM_FONT_STRIP)
    } else {
        (&ROOM_FONT_TAG, &ROOM_FONT_STRIP)
    };
    let font_tag = font_tag_re
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_owned())
        .unwrap_or_default();

    let stripped = font_strip_re.replace_all(raw, "");
    let stripped = NAME_STRIP.replace_all(&stripped, "");
    let body = unescape_html(&strip_html(&stripped)).replace('\r', "\n");
    (body, name_tag, font_tag)
}

/// Drop markup, turning `<br…>` into newlines.
pub(crate) fn strip_html(msg: &str) -> String {
    let segments: Vec<&str> = msg.split('<').collect();
    if segments.len() == 1 {
        return segments[0].to_owned();
    }
    let mut out = String::new();
    for segment in segments {
        match segment.split_once('>') {
            None => out.push_str(segment),
            Some((tag, rest)) => {
                if tag.starts_with("br") {
                    out.push('\n');
                }
                out.push_str(rest);
            }
        }
    }
    out
}

/// Decode the entities the service emits: the core named set plus numeric
/// references.
pub(crate) fn unescape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let decoded = rest
            .char_indices()
            .take(10)
            .find(|&(_, ch)| ch == ';')
            .and_then(|(end, _)| decode_entity(&rest[1..end]).map(|ch| (ch, end)));
        match decoded {
            Some((ch, end)) => {
                out.push(ch);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(entity: &str) -> Option<char> {
    match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => {
            let num = entity.strip_prefix('#')?;
            let value = match num.strip_prefix('x').or_else(|| num.strip_prefix('X')) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => num.parse().ok()?,
            };
            char::from_u32(value)
        }
    }
}

/// Collapse newlines out of the trailing token and trim the result.
pub(crate) fn normalize_trailing(body: &str) -> String {
    let mut parts: Vec<&str> = body.split(' ').collect();
    let last = parts.pop().unwrap_or("").replace('\n', "");
    let mut out = parts.join(" ");
    out.push(' ');
    out.push_str(&last);
    out.trim().to_owned()
}

/// Candidate `@name` references in a body. The caller filters against the
/// roster.
pub(crate) fn mention_candidates(body: &str) -> Vec<String> {
    MENTION
        .captures_iter(body)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// Escape a body for sending as plain text. Quotes stay as-is, matching
/// what the web client produces.
pub(crate) fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Split an outbound message into chunks the server will accept.
pub(crate) fn message_cut(message: &str, length: usize) -> Vec<String> {
    let chars: Vec<char> = message.chars().collect();
    chars
        .chunks(length.max(1))
        .map(|chunk| chunk.iter().collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anon_name_fixtures() {
        assert_eq!(anon_name("1700000002.0", "12345678"), "anon5670");
        assert_eq!(anon_name("", "12345678"), "anon8020");
        assert_eq!(anon_name("3452", "555"), "anon3907");
    }

    #[test]
    fn anon_name_shape() {
        for (ts, puid) in [("1699999999.5", "87654321"), ("0001", "00000000")] {
            let name = anon_name(ts, puid);
            assert!(name.starts_with("anon"));
            assert_eq!(name.len(), 8);
        }
    }

    #[test]
    fn clean_extracts_tags() {
        let (body, name, font) = clean_message("<n3c0/><f x11553399=\"8\">hi there", false);
        assert_eq!(body, "hi there");
        assert_eq!(name, "3c0");
        assert_eq!(font, " x11553399=\"8\"");
    }

    #[test]
    fn clean_handles_breaks_and_entities() {
        let (body, _, _) = clean_message("one<br/>two three", false);
        assert_eq!(body, "one\ntwo three");
        let (body, _, _) = clean_message("&lt;b&gt; &amp; &#39;quoted&#39;", false);
        assert_eq!(body, "<b> & 'quoted'");
    }

    #[test]
    fn clean_is_idempotent_on_plain_bodies() {
        let (once, _, _) = clean_message("hi there", false);
        let (twice, _, _) = clean_message(&once, false);
        assert_eq!(once, twice);
    }

    #[test]
    fn trailing_token_is_normalized() {
        let (body, _, _) = clean_message("tail newline<br/>", false);
        assert_eq!(normalize_trailing(&body), "tail newline");
        assert_eq!(normalize_trailing("plain"), "plain");
    }

    #[test]
    fn font_spec_fixtures() {
        assert_eq!(
            parse_font(" x11553399=\"8\""),
            FontSpec {
                size: 11,
                color: "553399".to_owned(),
                face: "8".to_owned()
            }
        );
        assert_eq!(
            parse_font(" x9224466=\"1\""),
            FontSpec {
                size: 9,
                color: "224466".to_owned(),
                face: "1".to_owned()
            }
        );
        assert_eq!(parse_font("garbage"), FontSpec::default());
        // a missing size falls back without losing the color
        let spec = parse_font(" xFF0000=\"2\"");
        assert_eq!(spec.size, 11);
        assert_eq!(spec.color, "FF0000");
    }

    #[test]
    fn message_cut_chunks_by_chars() {
        assert_eq!(message_cut("abcdef", 4), vec!["abcd", "ef"]);
        assert!(message_cut("", 4).is_empty());
    }

    #[test]
    fn mention_candidates_are_lowercased() {
        assert_eq!(
            mention_candidates("hey @Alice and @bob42!"),
            vec!["alice".to_owned(), "bob42".to_owned()]
        );
    }
}
