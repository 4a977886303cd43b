//! The in-memory model of CQ-code rich content.
//!
//! A [`Tag`] is one typed, attributed token such as `[CQ:at,qq=123]`. A [`MessageChain`] is the
//! parsed form of a whole message: plain text runs interleaved with tags. Tags are immutable
//! values; the builders on [`Tag`] validate the attributes each known kind requires.
use std::{fmt::Display, ops::Deref};

use serde_json::{Map, Value};
use tracing::warn;

use crate::{
    codec::Strictness,
    error::{Result, RpcError, ValidationError},
};

/// Tag kinds understood by CQHTTP servers.
pub const KNOWN_KINDS: &[&str] = &[
    "anonymous",
    "at",
    "cardimage",
    "contact",
    "dice",
    "face",
    "forward",
    "gift",
    "image",
    "json",
    "location",
    "music",
    "node",
    "poke",
    "record",
    "redbag",
    "reply",
    "rps",
    "share",
    "shake",
    "tts",
    "video",
    "xml",
];

/// Ordered string attributes of a tag. Keys are unique; inserting an existing key replaces the
/// value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    entries: Vec<(String, String)>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces `key`, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => Some(std::mem::replace(existing, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut attributes = Attributes::new();
        for (key, value) in iter {
            attributes.insert(key, value);
        }
        attributes
    }
}

/// One typed, attributed markup token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    kind: String,
    attributes: Attributes,
}

/// Image display variants accepted by the `image` kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageType {
    #[default]
    Normal,
    Flash,
    Show,
}

/// Music platforms accepted by the `music` kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MusicSource {
    Qq,
    NetEase,
    Xiami,
}

impl MusicSource {
    fn as_str(self) -> &'static str {
        match self {
            MusicSource::Qq => "qq",
            MusicSource::NetEase => "163",
            MusicSource::Xiami => "xm",
        }
    }
}

pub(crate) fn is_valid_kind(kind: &str) -> bool {
    !kind.is_empty()
        && kind
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

pub(crate) fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && !key.contains([',', '=', '[', ']', '&'])
}

fn numeric_id(kind: &str, field: &str, value: impl Display) -> std::result::Result<String, ValidationError> {
    let value = value.to_string();
    match value.parse::<u64>() {
        Ok(_) => Ok(value),
        Err(_) => Err(ValidationError::new(kind, field, format!("expected a numeric id, got '{}'", value))),
    }
}

fn integer(kind: &str, field: &str, value: impl Display) -> std::result::Result<String, ValidationError> {
    let value = value.to_string();
    match value.parse::<i64>() {
        Ok(_) => Ok(value),
        Err(_) => Err(ValidationError::new(kind, field, format!("expected an integer, got '{}'", value))),
    }
}

fn non_empty(kind: &str, field: &str, value: impl Into<String>) -> std::result::Result<String, ValidationError> {
    let value = value.into();
    if value.is_empty() {
        return Err(ValidationError::new(kind, field, "must not be empty"));
    }
    Ok(value)
}

impl Tag {
    /// Creates a tag of an arbitrary kind.
    ///
    /// Only the shape of the kind name and of the keys is checked, so kinds this crate does not
    /// know about can still be sent.
    pub fn new<I, K, V>(kind: impl Into<String>, attributes: I) -> std::result::Result<Self, ValidationError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::validated(kind, attributes, Strictness::Lenient)
    }

    /// Like [`Tag::new`], but in [`Strictness::Strict`] mode kinds outside [`KNOWN_KINDS`] are
    /// rejected.
    pub fn validated<I, K, V>(
        kind: impl Into<String>,
        attributes: I,
        strictness: Strictness,
    ) -> std::result::Result<Self, ValidationError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let kind = kind.into();
        if !is_valid_kind(&kind) {
            return Err(ValidationError::new(&kind, "kind", "invalid kind name"));
        }
        if strictness == Strictness::Strict && !KNOWN_KINDS.contains(&kind.as_str()) {
            return Err(ValidationError::new(&kind, "kind", "unknown kind"));
        }
        let attributes: Attributes = attributes.into_iter().collect();
        if let Some(key) = attributes.keys().find(|key| !is_valid_key(key)) {
            return Err(ValidationError::new(&kind, key, "invalid attribute key"));
        }
        Ok(Self { kind, attributes })
    }

    /// Builds a tag from parts the parser has already checked.
    pub(crate) fn from_parts(kind: String, attributes: Attributes) -> Self {
        Self { kind, attributes }
    }

    fn known(kind: &str, attributes: Vec<(&str, String)>) -> Self {
        Self {
            kind: kind.to_string(),
            attributes: attributes.into_iter().collect(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key)
    }

    pub fn is_known(&self) -> bool {
        KNOWN_KINDS.contains(&self.kind.as_str())
    }

    /// Returns a copy of this tag with `key` set to `value`. The original is left untouched.
    pub fn with(&self, key: impl Into<String>, value: impl Into<String>) -> std::result::Result<Tag, ValidationError> {
        let key = key.into();
        if !is_valid_key(&key) {
            return Err(ValidationError::new(&self.kind, &key, "invalid attribute key"));
        }
        let mut attributes = self.attributes.clone();
        attributes.insert(key, value);
        Ok(Tag {
            kind: self.kind.clone(),
            attributes,
        })
    }

    /// Mentions a user by numeric id, or everyone when `qq` is `all`.
    pub fn at(qq: impl Display) -> std::result::Result<Tag, ValidationError> {
        let qq = qq.to_string();
        let qq = if qq == "all" { qq } else { numeric_id("at", "qq", qq)? };
        Ok(Self::known("at", vec![("qq", qq)]))
    }

    pub fn at_all() -> Tag {
        Self::known("at", vec![("qq", "all".to_string())])
    }

    /// A built-in emoticon.
    pub fn face(id: impl Display) -> std::result::Result<Tag, ValidationError> {
        let id = id.to_string();
        if id.parse::<u32>().is_err() {
            return Err(ValidationError::new(
                "face",
                "id",
                format!("expected a non-negative integer, got '{}'", id),
            ));
        }
        Ok(Self::known("face", vec![("id", id)]))
    }

    /// An image by file name, path, URL or `base64://` payload.
    pub fn image(file: impl Into<String>, image_type: ImageType) -> std::result::Result<Tag, ValidationError> {
        let mut attributes = vec![("file", non_empty("image", "file", file)?)];
        match image_type {
            ImageType::Normal => {}
            ImageType::Flash => attributes.push(("type", "flash".to_string())),
            ImageType::Show => attributes.push(("type", "show".to_string())),
        }
        Ok(Self::known("image", attributes))
    }

    /// A voice recording; `magic` asks the server to apply a voice changer.
    pub fn record(file: impl Into<String>, magic: bool) -> std::result::Result<Tag, ValidationError> {
        let mut attributes = vec![("file", non_empty("record", "file", file)?)];
        if magic {
            attributes.push(("magic", "1".to_string()));
        }
        Ok(Self::known("record", attributes))
    }

    pub fn video(file: impl Into<String>) -> std::result::Result<Tag, ValidationError> {
        Ok(Self::known("video", vec![("file", non_empty("video", "file", file)?)]))
    }

    /// Quotes an earlier message. Message ids may be negative.
    pub fn reply(id: impl Display) -> std::result::Result<Tag, ValidationError> {
        Ok(Self::known("reply", vec![("id", integer("reply", "id", id)?)]))
    }

    pub fn poke(qq: impl Display) -> std::result::Result<Tag, ValidationError> {
        Ok(Self::known("poke", vec![("qq", numeric_id("poke", "qq", qq)?)]))
    }

    pub fn share(url: impl Into<String>, title: impl Into<String>) -> std::result::Result<Tag, ValidationError> {
        Ok(Self::known(
            "share",
            vec![
                ("url", non_empty("share", "url", url)?),
                ("title", non_empty("share", "title", title)?),
            ],
        ))
    }

    pub fn location(lat: f64, lon: f64) -> std::result::Result<Tag, ValidationError> {
        if !lat.is_finite() {
            return Err(ValidationError::new("location", "lat", "must be a finite number"));
        }
        if !lon.is_finite() {
            return Err(ValidationError::new("location", "lon", "must be a finite number"));
        }
        Ok(Self::known(
            "location",
            vec![("lat", lat.to_string()), ("lon", lon.to_string())],
        ))
    }

    /// A song shared from one of the supported platforms.
    pub fn music(source: MusicSource, id: impl Display) -> std::result::Result<Tag, ValidationError> {
        Ok(Self::known(
            "music",
            vec![
                ("type", source.as_str().to_string()),
                ("id", numeric_id("music", "id", id)?),
            ],
        ))
    }

    pub fn custom_music(
        url: impl Into<String>,
        audio: impl Into<String>,
        title: impl Into<String>,
    ) -> std::result::Result<Tag, ValidationError> {
        Ok(Self::known(
            "music",
            vec![
                ("type", "custom".to_string()),
                ("url", non_empty("music", "url", url)?),
                ("audio", non_empty("music", "audio", audio)?),
                ("title", non_empty("music", "title", title)?),
            ],
        ))
    }

    /// A forward node referencing an existing message.
    pub fn node(id: impl Display) -> std::result::Result<Tag, ValidationError> {
        Ok(Self::known("node", vec![("id", integer("node", "id", id)?)]))
    }

    /// A forward node with custom sender and content.
    pub fn custom_node(
        name: impl Into<String>,
        uin: impl Display,
        content: impl Into<String>,
    ) -> std::result::Result<Tag, ValidationError> {
        Ok(Self::known(
            "node",
            vec![
                ("name", non_empty("node", "name", name)?),
                ("uin", numeric_id("node", "uin", uin)?),
                ("content", non_empty("node", "content", content)?),
            ],
        ))
    }

    pub fn json(data: impl Into<String>) -> std::result::Result<Tag, ValidationError> {
        Ok(Self::known("json", vec![("data", non_empty("json", "data", data)?)]))
    }

    pub fn xml(data: impl Into<String>) -> std::result::Result<Tag, ValidationError> {
        Ok(Self::known("xml", vec![("data", non_empty("xml", "data", data)?)]))
    }

    pub fn dice() -> Tag {
        Self::known("dice", Vec::new())
    }

    pub fn rps() -> Tag {
        Self::known("rps", Vec::new())
    }

    pub fn shake() -> Tag {
        Self::known("shake", Vec::new())
    }
}

/// One element of a parsed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Tag(Tag),
}

impl From<Tag> for Segment {
    fn from(tag: Tag) -> Self {
        Segment::Tag(tag)
    }
}

/// An ordered sequence of text and tag segments.
///
/// Building through [`MessageChain::push_text`] and friends keeps the chain normalized: empty
/// text is dropped and adjacent text is merged, which is the shape the parser produces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageChain(Vec<Segment>);

impl MessageChain {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.push_text(text);
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: Tag) -> Self {
        self.push_tag(tag);
        self
    }

    pub fn push_text(&mut self, text: impl Into<String>) {
        let text = text.into();
        if text.is_empty() {
            return;
        }
        match self.0.last_mut() {
            Some(Segment::Text(last)) => last.push_str(&text),
            _ => self.0.push(Segment::Text(text)),
        }
    }

    pub fn push_tag(&mut self, tag: Tag) {
        self.0.push(Segment::Tag(tag));
    }

    pub fn push(&mut self, segment: Segment) {
        match segment {
            Segment::Text(text) => self.push_text(text),
            Segment::Tag(tag) => self.push_tag(tag),
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    pub fn into_segments(self) -> Vec<Segment> {
        self.0
    }

    /// All tags in order of appearance.
    pub fn tags(&self) -> impl Iterator<Item = &Tag> {
        self.0.iter().filter_map(|segment| match segment {
            Segment::Tag(tag) => Some(tag),
            Segment::Text(_) => None,
        })
    }

    /// The text segments concatenated, with tags left out.
    pub fn plain_text(&self) -> String {
        self.0
            .iter()
            .filter_map(|segment| match segment {
                Segment::Text(text) => Some(text.as_str()),
                Segment::Tag(_) => None,
            })
            .collect()
    }

    /// Converts to the OneBot array form: `[{"type": .., "data": {..}}]`.
    pub fn to_array(&self) -> Value {
        let items = self
            .0
            .iter()
            .map(|segment| {
                let (kind, data) = match segment {
                    Segment::Text(text) => {
                        let mut data = Map::new();
                        data.insert("text".into(), Value::String(text.clone()));
                        ("text", data)
                    }
                    Segment::Tag(tag) => {
                        let data = tag
                            .attributes
                            .iter()
                            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
                            .collect();
                        (tag.kind.as_str(), data)
                    }
                };
                let mut item = Map::new();
                item.insert("type".into(), Value::String(kind.to_string()));
                item.insert("data".into(), Value::Object(data));
                Value::Object(item)
            })
            .collect();
        Value::Array(items)
    }

    /// Reads the OneBot array form. Elements that are not well-formed segments are skipped.
    pub fn from_array(value: &Value) -> Result<Self> {
        let items = value
            .as_array()
            .ok_or_else(|| RpcError::Protocol("message array expected".into()))?;
        let mut chain = MessageChain::new();
        for item in items {
            let Some(kind) = item.get("type").and_then(Value::as_str) else {
                warn!("skipping message segment without type: {}", item);
                continue;
            };
            let data = item.get("data").and_then(Value::as_object);
            if kind == "text" {
                if let Some(text) = data.and_then(|d| d.get("text")).and_then(Value::as_str) {
                    chain.push_text(text);
                }
                continue;
            }
            let attributes = data
                .into_iter()
                .flatten()
                .filter_map(|(key, value)| attribute_string(value).map(|value| (key.clone(), value)));
            match Tag::new(kind, attributes) {
                Ok(tag) => chain.push_tag(tag),
                Err(e) => warn!("skipping message segment: {}", e),
            }
        }
        Ok(chain)
    }
}

fn attribute_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

impl Deref for MessageChain {
    type Target = [Segment];

    fn deref(&self) -> &[Segment] {
        &self.0
    }
}

impl From<Vec<Segment>> for MessageChain {
    fn from(segments: Vec<Segment>) -> Self {
        let mut chain = MessageChain::new();
        for segment in segments {
            chain.push(segment);
        }
        chain
    }
}

impl From<Tag> for MessageChain {
    fn from(tag: Tag) -> Self {
        MessageChain(vec![Segment::Tag(tag)])
    }
}

impl IntoIterator for MessageChain {
    type Item = Segment;
    type IntoIter = std::vec::IntoIter<Segment>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a MessageChain {
    type Item = &'a Segment;
    type IntoIter = std::slice::Iter<'a, Segment>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
