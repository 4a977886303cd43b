//! Event classification and subscriber fan-out.
//!
//! Every inbound frame that is not the answer to a pending call becomes an [`Event`] with an
//! [`EventCategory`] taken from a fixed table over the frame's `post_type` and its sub-type
//! field. Subscribers registered for the category run first, in registration order, followed by
//! subscribers of the category's parent (e.g. `message.group` then `message`).
use std::{
    collections::HashMap,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use serde_json::Value;
use tracing::{error, trace, warn};

use crate::{
    codec::{parse_with, CodecOptions},
    message,
    tag::MessageChain,
};

/// The closed set of event categories a subscriber can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    SocketOpen,
    SocketClose,
    SocketError,
    SocketReconnecting,
    /// The reconnect budget is exhausted; the client stays closed.
    SocketReconnectFailed,
    /// A buffered outbound frame was evicted because the buffer was full.
    SocketBufferOverflow,
    /// Fired before an API call is transmitted.
    ApiPreSend,
    /// Fired after a response is matched to its call.
    ApiResponse,
    Message,
    MessagePrivate,
    MessageGroup,
    Notice,
    NoticeGroupUpload,
    NoticeGroupAdmin,
    NoticeGroupDecrease,
    NoticeGroupIncrease,
    NoticeGroupBan,
    NoticeFriendAdd,
    NoticeGroupRecall,
    NoticeFriendRecall,
    NoticeNotify,
    NoticeGroupCard,
    NoticeOfflineFile,
    NoticeClientStatus,
    NoticeEssence,
    Request,
    RequestFriend,
    RequestGroup,
    MetaEvent,
    MetaLifecycle,
    MetaHeartbeat,
    /// Frames no table entry matches, including responses nobody was waiting for.
    Unrecognized,
}

use EventCategory::*;

/// `(post_type, sub-type, category)`. A `None` sub-type is the post type's generic category.
const CATEGORY_TABLE: &[(&str, Option<&str>, EventCategory)] = &[
    ("message", None, Message),
    ("message", Some("private"), MessagePrivate),
    ("message", Some("group"), MessageGroup),
    ("notice", None, Notice),
    ("notice", Some("group_upload"), NoticeGroupUpload),
    ("notice", Some("group_admin"), NoticeGroupAdmin),
    ("notice", Some("group_decrease"), NoticeGroupDecrease),
    ("notice", Some("group_increase"), NoticeGroupIncrease),
    ("notice", Some("group_ban"), NoticeGroupBan),
    ("notice", Some("friend_add"), NoticeFriendAdd),
    ("notice", Some("group_recall"), NoticeGroupRecall),
    ("notice", Some("friend_recall"), NoticeFriendRecall),
    ("notice", Some("notify"), NoticeNotify),
    ("notice", Some("group_card"), NoticeGroupCard),
    ("notice", Some("offline_file"), NoticeOfflineFile),
    ("notice", Some("client_status"), NoticeClientStatus),
    ("notice", Some("essence"), NoticeEssence),
    ("request", None, Request),
    ("request", Some("friend"), RequestFriend),
    ("request", Some("group"), RequestGroup),
    ("meta_event", None, MetaEvent),
    ("meta_event", Some("lifecycle"), MetaLifecycle),
    ("meta_event", Some("heartbeat"), MetaHeartbeat),
];

/// The field holding the sub-type for each post type.
fn subtype_field(post_type: &str) -> Option<&'static str> {
    match post_type {
        "message" => Some("message_type"),
        "notice" => Some("notice_type"),
        "request" => Some("request_type"),
        "meta_event" => Some("meta_event_type"),
        _ => None,
    }
}

/// Determines the category of an event frame.
pub fn classify(frame: &Value) -> EventCategory {
    let Some(post_type) = frame.get("post_type").and_then(Value::as_str) else {
        return Unrecognized;
    };
    let subtype = subtype_field(post_type)
        .and_then(|field| frame.get(field))
        .and_then(Value::as_str);
    let lookup = |sub: Option<&str>| {
        CATEGORY_TABLE
            .iter()
            .find(|(p, s, _)| *p == post_type && *s == sub)
            .map(|(_, _, category)| *category)
    };
    subtype
        .and_then(|sub| lookup(Some(sub)))
        .or_else(|| lookup(None))
        .unwrap_or(Unrecognized)
}

impl EventCategory {
    /// The supertype whose subscribers also receive this category's events.
    pub fn parent(self) -> Option<EventCategory> {
        match self {
            MessagePrivate | MessageGroup => Some(Message),
            NoticeGroupUpload | NoticeGroupAdmin | NoticeGroupDecrease | NoticeGroupIncrease
            | NoticeGroupBan | NoticeFriendAdd | NoticeGroupRecall | NoticeFriendRecall
            | NoticeNotify | NoticeGroupCard | NoticeOfflineFile | NoticeClientStatus
            | NoticeEssence => Some(Notice),
            RequestFriend | RequestGroup => Some(Request),
            MetaLifecycle | MetaHeartbeat => Some(MetaEvent),
            _ => None,
        }
    }

    /// Whether events of this category carry a chat message.
    pub fn is_message(self) -> bool {
        matches!(self, Message | MessagePrivate | MessageGroup)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SocketOpen => "socket.open",
            SocketClose => "socket.close",
            SocketError => "socket.error",
            SocketReconnecting => "socket.reconnecting",
            SocketReconnectFailed => "socket.reconnect_failed",
            SocketBufferOverflow => "socket.buffer_overflow",
            ApiPreSend => "api.pre_send",
            ApiResponse => "api.response",
            Message => "message",
            MessagePrivate => "message.private",
            MessageGroup => "message.group",
            Notice => "notice",
            NoticeGroupUpload => "notice.group_upload",
            NoticeGroupAdmin => "notice.group_admin",
            NoticeGroupDecrease => "notice.group_decrease",
            NoticeGroupIncrease => "notice.group_increase",
            NoticeGroupBan => "notice.group_ban",
            NoticeFriendAdd => "notice.friend_add",
            NoticeGroupRecall => "notice.group_recall",
            NoticeFriendRecall => "notice.friend_recall",
            NoticeNotify => "notice.notify",
            NoticeGroupCard => "notice.group_card",
            NoticeOfflineFile => "notice.offline_file",
            NoticeClientStatus => "notice.client_status",
            NoticeEssence => "notice.essence",
            Request => "request",
            RequestFriend => "request.friend",
            RequestGroup => "request.group",
            MetaEvent => "meta_event",
            MetaLifecycle => "meta_event.lifecycle",
            MetaHeartbeat => "meta_event.heartbeat",
            Unrecognized => "unrecognized",
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chat message event with its content parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    /// The whole frame as received.
    pub payload: Value,
    /// The message in CQ-code text form.
    pub raw: String,
    pub segments: MessageChain,
}

/// What an event carries.
#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    Opened,
    Closed { code: Option<u16>, reason: String },
    Error { message: String },
    Reconnecting { attempt: u32, delay: Duration },
    ReconnectFailed { attempts: u32 },
    Overflow { evicted: String },
    PreSend(message::Request),
    Response(message::Response),
    Message(MessageEvent),
    /// Any other server frame.
    Post(Value),
}

/// One delivery to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub category: EventCategory,
    pub data: EventData,
}

impl Event {
    pub fn new(category: EventCategory, data: EventData) -> Self {
        Self { category, data }
    }

    /// Builds an event from a server frame, parsing the message content of message events.
    pub fn from_frame(frame: Value, codec: &CodecOptions) -> Self {
        let category = classify(&frame);
        if !category.is_message() {
            return Self::new(category, EventData::Post(frame));
        }
        let segments = match frame.get("message") {
            Some(Value::String(text)) => parse_with(text, codec),
            Some(array @ Value::Array(_)) => MessageChain::from_array(array).unwrap_or_default(),
            _ => MessageChain::new(),
        };
        let raw = match (frame.get("raw_message"), frame.get("message")) {
            (Some(Value::String(raw)), _) => raw.clone(),
            (_, Some(Value::String(text))) => text.clone(),
            _ => segments.to_text(codec),
        };
        Self::new(
            category,
            EventData::Message(MessageEvent {
                payload: frame,
                raw,
                segments,
            }),
        )
    }

    /// The server frame behind this event, if it came from the server.
    pub fn payload(&self) -> Option<&Value> {
        match &self.data {
            EventData::Message(message) => Some(&message.payload),
            EventData::Post(value) => Some(value),
            _ => None,
        }
    }

    pub fn message(&self) -> Option<&MessageEvent> {
        match &self.data {
            EventData::Message(message) => Some(message),
            _ => None,
        }
    }
}

/// Identifies a subscription for [`Dispatcher::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    handler: Handler,
    once: bool,
}

#[derive(Default)]
struct SubscriberTable {
    next_id: u64,
    by_category: HashMap<EventCategory, Vec<Subscription>>,
}

/// Outcome of one [`Dispatcher::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchReport {
    /// Handlers that ran to completion.
    pub delivered: usize,
    /// Handlers that panicked.
    pub panicked: usize,
}

/// Subscriber registry and fan-out.
///
/// Cloning gives another handle to the same registry. The table lock is never held while a
/// handler runs, so handlers may subscribe, unsubscribe or dispatch themselves.
#[derive(Clone, Default)]
pub struct Dispatcher {
    table: Arc<Mutex<SubscriberTable>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let count: usize = table.by_category.values().map(Vec::len).sum();
        f.debug_struct("Dispatcher").field("subscriptions", &count).finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `category`. A `once` subscription removes itself before its
    /// first invocation.
    pub fn subscribe<F>(&self, category: EventCategory, handler: F, once: bool) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.next_id += 1;
        let id = SubscriptionId(table.next_id);
        table.by_category.entry(category).or_default().push(Subscription {
            id,
            handler: Arc::new(handler),
            once,
        });
        id
    }

    /// Removes a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        for subscriptions in table.by_category.values_mut() {
            if let Some(index) = subscriptions.iter().position(|s| s.id == id) {
                subscriptions.remove(index);
                return true;
            }
        }
        false
    }

    /// Number of subscriptions registered directly for `category`.
    pub fn subscriber_count(&self, category: EventCategory) -> usize {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.by_category.get(&category).map_or(0, Vec::len)
    }

    /// Delivers `event` to the subscribers of its category, then to those of the parent
    /// category. Panicking handlers are logged and skipped.
    pub fn dispatch(&self, event: &Event) -> DispatchReport {
        let handlers = self.take_handlers(event.category);
        trace!("dispatching {} to {} handlers", event.category, handlers.len());
        let mut report = DispatchReport::default();
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => report.delivered += 1,
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!("event handler for {} panicked: {}", event.category, reason);
                    report.panicked += 1;
                }
            }
        }
        if report.delivered + report.panicked == 0 && event.category == Unrecognized {
            warn!("unrecognized frame dropped: no subscribers");
        }
        report
    }

    /// Snapshots the handlers for `category` and its parent, removing `once` subscriptions.
    fn take_handlers(&self, category: EventCategory) -> Vec<Handler> {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let mut handlers = Vec::new();
        for category in std::iter::once(category).chain(category.parent()) {
            if let Some(subscriptions) = table.by_category.get_mut(&category) {
                handlers.extend(subscriptions.iter().map(|s| Arc::clone(&s.handler)));
                subscriptions.retain(|s| !s.once);
            }
        }
        handlers
    }
}
