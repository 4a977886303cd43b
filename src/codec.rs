//! Text form of CQ code: parsing and serialization.
//!
//! A token looks like `[CQ:kind,key=value,...]`. Inside values `&`, `[`, `]` and `,` are
//! escaped as `&amp;`, `&#91;`, `&#93;` and `&#44;`; in plain text everything but `,` is.
//! Parsing is a single left-to-right pass that never fails: malformed tokens are kept as plain
//! text.
use std::{convert::Infallible, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::tag::{is_valid_key, is_valid_kind, Attributes, MessageChain, Segment, Tag, KNOWN_KINDS};

/// The prefix CQHTTP servers put in front of every kind name.
pub const CQ_PREFIX: &str = "CQ:";

/// How the parser treats kinds it does not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strictness {
    /// Unknown kinds become generic tags.
    #[default]
    Lenient,
    /// Unknown kinds are degraded to plain text.
    Strict,
}

/// Parser and serializer settings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CodecOptions {
    /// Written before the kind name on output. The parser accepts tokens with or without
    /// [`CQ_PREFIX`] regardless of this setting.
    pub prefix: String,
    pub strictness: Strictness,
}

impl CodecOptions {
    /// Options matching what CQHTTP servers send and expect.
    pub fn cq() -> Self {
        Self {
            prefix: CQ_PREFIX.to_string(),
            strictness: Strictness::Lenient,
        }
    }
}

/// Escapes plain text.
pub fn escape_text(text: &str) -> String {
    escape(text, false)
}

/// Escapes an attribute value.
pub fn escape_value(value: &str) -> String {
    escape(value, true)
}

fn escape(input: &str, value: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '[' => out.push_str("&#91;"),
            ']' => out.push_str("&#93;"),
            ',' if value => out.push_str("&#44;"),
            c => out.push(c),
        }
    }
    out
}

const ESCAPES: &[(&str, char)] = &[("&amp;", '&'), ("&#91;", '['), ("&#93;", ']'), ("&#44;", ',')];

/// Replaces the four recognized escape sequences. Anything else starting with `&` is kept as is.
pub fn unescape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        match ESCAPES.iter().find(|(seq, _)| rest.starts_with(seq)) {
            Some((seq, c)) => {
                out.push(*c);
                rest = &rest[seq.len()..];
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

/// Parses with default options.
pub fn parse(raw: &str) -> MessageChain {
    parse_with(raw, &CodecOptions::default())
}

/// Parses `raw` into text and tag segments.
pub fn parse_with(raw: &str, options: &CodecOptions) -> MessageChain {
    let mut segments = Vec::new();
    // Unescaped text accumulated since the last emitted tag.
    let mut text = String::new();
    let mut text_start = 0;
    let mut cursor = 0;

    while let Some(offset) = raw[cursor..].find('[') {
        let open = cursor + offset;
        let Some(rel) = raw[open + 1..].find(|c| c == '[' || c == ']') else {
            break;
        };
        let close = open + 1 + rel;
        if raw.as_bytes()[close] == b'[' {
            // A second opener before any closer: the first one was just text.
            cursor = close;
            continue;
        }

        text.push_str(&unescape(&raw[text_start..open]));
        match parse_token(&raw[open + 1..close], options) {
            Some(tag) => {
                if !text.is_empty() {
                    segments.push(Segment::Text(std::mem::take(&mut text)));
                }
                segments.push(Segment::Tag(tag));
            }
            None => text.push_str(&raw[open..=close]),
        }
        cursor = close + 1;
        text_start = cursor;
    }

    text.push_str(&unescape(&raw[text_start..]));
    if !text.is_empty() {
        segments.push(Segment::Text(text));
    }
    MessageChain::from(segments)
}

/// Parses the body of a token (between the brackets). `None` means the token is malformed.
fn parse_token(body: &str, options: &CodecOptions) -> Option<Tag> {
    let mut fields = body.split(',');
    let kind = fields.next()?;
    let kind = kind.strip_prefix(CQ_PREFIX).unwrap_or(kind);
    if !is_valid_kind(kind) {
        return None;
    }
    if options.strictness == Strictness::Strict && !KNOWN_KINDS.contains(&kind) {
        return None;
    }

    let mut attributes = Attributes::new();
    for field in fields {
        let (key, value) = field.split_once('=')?;
        if !is_valid_key(key) {
            return None;
        }
        attributes.insert(key, unescape(value));
    }
    Some(Tag::from_parts(kind.to_string(), attributes))
}

/// Serializes with default options.
pub fn serialize(segments: &[Segment]) -> String {
    serialize_with(segments, &CodecOptions::default())
}

/// Serializes segments to text, escaping as needed.
pub fn serialize_with(segments: &[Segment], options: &CodecOptions) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Text(text) => out.push_str(&escape_text(text)),
            Segment::Tag(tag) => write_tag(&mut out, tag, &options.prefix),
        }
    }
    out
}

fn write_tag(out: &mut String, tag: &Tag, prefix: &str) {
    out.push('[');
    out.push_str(prefix);
    out.push_str(tag.kind());
    for (key, value) in tag.attributes().iter() {
        out.push(',');
        out.push_str(key);
        out.push('=');
        out.push_str(&escape_value(value));
    }
    out.push(']');
}

impl Tag {
    /// Serializes this tag alone with the given options.
    pub fn to_text(&self, options: &CodecOptions) -> String {
        let mut out = String::new();
        write_tag(&mut out, self, &options.prefix);
        out
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text(&CodecOptions::default()))
    }
}

impl MessageChain {
    pub fn to_text(&self, options: &CodecOptions) -> String {
        serialize_with(self, options)
    }
}

impl fmt::Display for MessageChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&serialize(self))
    }
}

impl FromStr for MessageChain {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(parse(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::{ImageType, MusicSource};

    lazy_static::lazy_static! {
        static ref TEST_CASES: Vec<MessageChain> = vec![
            MessageChain::new().text("plain text only"),
            MessageChain::new().tag(Tag::at(123).unwrap()),
            MessageChain::new()
                .text("hello ")
                .tag(Tag::at(123).unwrap())
                .text(" world"),
            MessageChain::new()
                .text("brackets [not a tag] & ampersands &amp; stay literal")
                .tag(Tag::face(14).unwrap()),
            MessageChain::new()
                .tag(Tag::share("http://example.com/?a=1&b=2", "[title], with, commas").unwrap())
                .tag(Tag::image("base64://iVBORw0=", ImageType::Flash).unwrap())
                .text("tail"),
            MessageChain::new()
                .tag(Tag::reply(-5).unwrap())
                .tag(Tag::music(MusicSource::Qq, 1).unwrap())
                .tag(Tag::dice()),
            MessageChain::new().tag(
                Tag::new("future", [("note", "a=b=c"), ("empty", "")]).unwrap(),
            ),
            MessageChain::new()
                .tag(Tag::custom_node("bot", 10000, "[CQ:face,id=1] hi").unwrap())
                .text("中文 ✓"),
        ];
    }

    #[test]
    fn parses_scenario_string() {
        let chain = parse("hello [at,qq=123] world");
        assert_eq!(
            chain.segments(),
            &[
                Segment::Text("hello ".into()),
                Segment::Tag(Tag::new("at", [("qq", "123")]).unwrap()),
                Segment::Text(" world".into()),
            ]
        );
        assert_eq!(serialize(&chain), "hello [at,qq=123] world");
    }

    #[test]
    fn round_trip_with_both_prefixes() {
        for options in [CodecOptions::default(), CodecOptions::cq()] {
            for chain in TEST_CASES.iter() {
                let text = serialize_with(chain, &options);
                assert_eq!(&parse_with(&text, &options), chain, "text: {}", text);
            }
        }
    }

    #[test]
    fn escape_is_reversible() {
        let values = [
            "",
            "plain",
            "[,]&",
            "&amp;&#91;&#93;&#44;",
            "a,b=c]d[e&f",
            "&&[[]],,",
        ];
        for value in values {
            assert_eq!(unescape(&escape_value(value)), value);
            assert_eq!(unescape(&escape_text(value)), value);
        }
        assert_eq!(escape_value("a,b"), "a&#44;b");
        assert_eq!(escape_text("a,b"), "a,b");
    }

    #[test]
    fn unknown_escapes_pass_through() {
        assert_eq!(unescape("&lt; & &#92; &amp"), "&lt; & &#92; &amp");
        assert_eq!(unescape("x&#91;y"), "x[y");
    }

    #[test]
    fn accepts_cq_prefix() {
        let chain = parse("[CQ:image,file=a.png,type=flash]");
        let tag = chain.tags().next().unwrap();
        assert_eq!(tag.kind(), "image");
        assert_eq!(tag.get("file"), Some("a.png"));
        assert_eq!(tag.to_text(&CodecOptions::cq()), "[CQ:image,file=a.png,type=flash]");
        assert_eq!(tag.to_string(), "[image,file=a.png,type=flash]");
    }

    #[test]
    fn values_are_unescaped() {
        let chain = parse("[CQ:share,url=http://x/?a=1&amp;b=2,title=&#91;t&#93;&#44;x]");
        let tag = chain.tags().next().unwrap();
        assert_eq!(tag.get("url"), Some("http://x/?a=1&b=2"));
        assert_eq!(tag.get("title"), Some("[t],x"));
    }

    #[test]
    fn malformed_tokens_degrade_to_text() {
        let cases = [
            ("a [] b", "a [] b"),
            ("a [at,qq] b", "a [at,qq] b"),
            ("a [at,=1] b", "a [at,=1] b"),
            ("a [bad kind,x=1] b", "a [bad kind,x=1] b"),
            ("unterminated [at,qq=1", "unterminated [at,qq=1"),
            ("stray ] closer", "stray ] closer"),
        ];
        for (raw, text) in cases {
            let chain = parse(raw);
            assert_eq!(chain.segments(), &[Segment::Text(text.into())], "raw: {}", raw);
        }
    }

    #[test]
    fn nested_opener_restarts_token() {
        let chain = parse("x [y [at,qq=1] z");
        assert_eq!(
            chain.segments(),
            &[
                Segment::Text("x [y ".into()),
                Segment::Tag(Tag::at(1).unwrap()),
                Segment::Text(" z".into()),
            ]
        );
    }

    #[test]
    fn degraded_token_merges_with_neighbours() {
        let chain = parse("a[at,qq]b[face,id=1]");
        assert_eq!(
            chain.segments(),
            &[
                Segment::Text("a[at,qq]b".into()),
                Segment::Tag(Tag::face(1).unwrap())
            ]
        );
    }

    #[test]
    fn strictness_controls_unknown_kinds() {
        let raw = "[future,x=1][face,id=2]";
        let lenient = parse(raw);
        assert_eq!(lenient.tags().count(), 2);

        let strict = CodecOptions {
            prefix: String::new(),
            strictness: Strictness::Strict,
        };
        let chain = parse_with(raw, &strict);
        assert_eq!(
            chain.segments(),
            &[
                Segment::Text("[future,x=1]".into()),
                Segment::Tag(Tag::face(2).unwrap())
            ]
        );
    }

    #[test]
    fn reparse_of_normalized_text_is_equivalent() {
        let raw = "a &#91;b&#93; [CQ:at,qq=1] &unknown; c";
        let first = parse(raw);
        let again = parse(&serialize(&first));
        assert_eq!(first, again);
        assert_eq!("".parse::<MessageChain>().unwrap(), MessageChain::new());
    }
}
