//! Connection lifecycle and frame routing.
//!
//! A [`Client`] owns one logical websocket connection. A background task drives it: connect,
//! pump frames in both directions, and on loss sweep pending calls and reconnect according to
//! the configured [`ReconnectPolicy`](crate::ReconnectPolicy). Inbound frames are handled one at
//! a time in arrival order; a response goes to the [`Correlator`] first and only frames it does
//! not claim reach the [`Dispatcher`].
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, trace, warn};

use crate::{
    codec::CodecOptions,
    config::ClientConfig,
    correlator::{CallHandle, Correlator},
    error::{Result, RpcError},
    event::{Dispatcher, Event, EventCategory, EventData, SubscriptionId},
    message::Frame,
    transport::{Connector, WsConnector, WsStream},
};

/// Lifecycle state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Closed,
    Connecting,
    Open,
}

/// A frame waiting to be written, remembering which call it belongs to.
#[derive(Debug)]
struct Outgoing {
    echo: Option<String>,
    text: String,
}

/// Where outbound frames go: the live socket when open, otherwise the optional buffer.
#[derive(Debug, Default)]
struct Outbound {
    sender: Option<mpsc::UnboundedSender<String>>,
    buffer: VecDeque<Outgoing>,
}

impl Outgoing {
    /// Whether the call behind this frame still wants it sent. Frames of calls that already
    /// timed out or were swept are dead.
    fn is_live(&self, correlator: &Correlator) -> bool {
        self.echo
            .as_deref()
            .map_or(true, |echo| correlator.is_pending(echo))
    }
}

/// The running connection task.
#[derive(Debug)]
struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// How a socket session ended.
enum SocketEnd {
    Closed { code: Option<u16>, reason: String },
    Failed(RpcError),
    Shutdown,
}

/// State shared between client handles and the connection task.
struct Shared {
    config: ClientConfig,
    codec: CodecOptions,
    connector: Arc<dyn Connector>,
    correlator: Correlator,
    dispatcher: Dispatcher,
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Outbound>,
    task: Mutex<Option<Running>>,
    /// Parent of every connection task's token; cancelled when the last client handle drops.
    root: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            debug!("connection state {:?} -> {:?}", state, next);
            *state = next;
            true
        });
    }

    fn emit(&self, category: EventCategory, data: EventData) {
        self.dispatcher.dispatch(&Event::new(category, data));
    }

    /// Sends a frame, buffers it, or fails with `NotConnected`.
    fn submit(&self, outgoing: Outgoing) -> Result<()> {
        let evicted = {
            let mut outbound = lock(&self.outbound);
            if let Some(sender) = &outbound.sender {
                return sender
                    .send(outgoing.text)
                    .map_err(|_| RpcError::NotConnected);
            }
            match self.config.outbound_buffer {
                Some(capacity) if capacity > 0 => {
                    outbound.buffer.retain(|frame| frame.is_live(&self.correlator));
                    outbound.buffer.push_back(outgoing);
                    if outbound.buffer.len() > capacity {
                        outbound.buffer.pop_front()
                    } else {
                        None
                    }
                }
                _ => return Err(RpcError::NotConnected),
            }
        };
        if let Some(evicted) = evicted {
            warn!("outbound buffer full, dropping oldest frame");
            if let Some(echo) = &evicted.echo {
                self.correlator.reject(echo, RpcError::NotConnected);
            }
            self.emit(
                EventCategory::SocketBufferOverflow,
                EventData::Overflow {
                    evicted: evicted.text,
                },
            );
        }
        Ok(())
    }

    /// Installs a fresh outbound channel, flushes buffered frames into it in order, and marks
    /// the connection open.
    fn open(&self) -> mpsc::UnboundedReceiver<String> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut outbound = lock(&self.outbound);
        for frame in outbound.buffer.drain(..) {
            if !frame.is_live(&self.correlator) {
                trace!("dropping buffered frame of finished call: {}", frame.text);
                continue;
            }
            // The receiver is alive in this scope.
            drop(sender.send(frame.text));
        }
        outbound.sender = Some(sender);
        self.set_state(ConnectionState::Open);
        receiver
    }

    /// Detaches the socket and fails every call that was waiting on it.
    fn lose_connection(&self) {
        lock(&self.outbound).sender = None;
        self.set_state(ConnectionState::Closed);
        self.correlator.cancel_all();
    }

    /// Final cleanup once no connection task is running.
    fn shut_down(&self) {
        {
            let mut outbound = lock(&self.outbound);
            outbound.sender = None;
            outbound.buffer.clear();
        }
        self.set_state(ConnectionState::Closed);
        self.correlator.cancel_all();
    }

    /// Routes one inbound text frame.
    fn handle_text(&self, text: &str) {
        trace!("received frame: {}", text);
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping malformed frame: {}", e);
                return;
            }
        };
        match frame {
            Frame::Response(response) => {
                if self.correlator.resolve(&response) {
                    self.emit(EventCategory::ApiResponse, EventData::Response(response));
                } else {
                    warn!("response for unknown call {}", response.echo);
                    let value = serde_json::to_value(&response).unwrap_or(Value::Null);
                    self.emit(EventCategory::Unrecognized, EventData::Post(value));
                }
            }
            Frame::Event(value) => {
                self.dispatcher.dispatch(&Event::from_frame(value, &self.codec));
            }
        }
    }
}

/// Pumps one socket until it closes, fails, or shutdown is requested.
async fn run_socket(
    shared: &Shared,
    stream: WsStream,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    token: &CancellationToken,
) -> SocketEnd {
    let (mut write, mut read) = stream.split();
    loop {
        tokio::select! {
            Some(text) = outgoing.recv() => {
                trace!("sending frame: {}", text);
                if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                    return SocketEnd::Failed(e.into());
                }
            }
            incoming = read.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => shared.handle_text(text.as_str()),
                Some(Ok(WsMessage::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => shared.handle_text(text),
                    Err(_) => warn!("dropping binary frame that is not UTF-8"),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.as_str().to_string()),
                        None => (None, String::new()),
                    };
                    return SocketEnd::Closed { code, reason };
                }
                // Pings are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => return SocketEnd::Failed(e.into()),
                None => {
                    return SocketEnd::Closed {
                        code: None,
                        reason: "stream ended".into(),
                    }
                }
            },
            _ = token.cancelled() => {
                if let Err(e) = write.send(WsMessage::Close(None)).await {
                    debug!("close frame not sent: {}", e);
                }
                return SocketEnd::Shutdown;
            }
        }
    }
}

/// Connects, serves, and reconnects until shutdown or the reconnect budget runs out.
async fn run_connection_loop(
    shared: Arc<Shared>,
    token: CancellationToken,
    ready: oneshot::Sender<Result<()>>,
) {
    let policy = shared.config.reconnect.clone();
    let mut ready = Some(ready);
    let mut attempts: u32 = 0;

    loop {
        shared.set_state(ConnectionState::Connecting);
        let connected = tokio::select! {
            result = shared.connector.connect() => result,
            _ = token.cancelled() => break,
        };

        match connected {
            Ok(stream) => {
                attempts = 0;
                let outgoing = shared.open();
                if let Some(ready) = ready.take() {
                    // connect() may have been abandoned by its caller.
                    drop(ready.send(Ok(())));
                }
                shared.emit(EventCategory::SocketOpen, EventData::Opened);

                let end = run_socket(&shared, stream, outgoing, &token).await;
                shared.lose_connection();
                match end {
                    SocketEnd::Closed { code, reason } => {
                        debug!("connection closed by server: {:?} {}", code, reason);
                        shared.emit(EventCategory::SocketClose, EventData::Closed { code, reason });
                    }
                    SocketEnd::Failed(e) => {
                        warn!("connection failed: {}", e);
                        let message = e.to_string();
                        shared.emit(
                            EventCategory::SocketError,
                            EventData::Error {
                                message: message.clone(),
                            },
                        );
                        shared.emit(
                            EventCategory::SocketClose,
                            EventData::Closed {
                                code: None,
                                reason: message,
                            },
                        );
                    }
                    SocketEnd::Shutdown => {
                        shared.emit(
                            EventCategory::SocketClose,
                            EventData::Closed {
                                code: None,
                                reason: "closed by client".into(),
                            },
                        );
                        break;
                    }
                }
            }
            Err(e) => {
                warn!("connect to {} failed: {}", shared.config.url, e);
                shared.set_state(ConnectionState::Closed);
                shared.emit(
                    EventCategory::SocketError,
                    EventData::Error {
                        message: e.to_string(),
                    },
                );
                if let Some(ready) = ready.take() {
                    drop(ready.send(Err(e)));
                }
            }
        }

        if !policy.enabled {
            break;
        }
        let attempt = attempts + 1;
        if policy.max_attempts.is_some_and(|max| attempt > max) {
            error!("giving up on {} after {} reconnect attempts", shared.config.url, attempts);
            shared.emit(
                EventCategory::SocketReconnectFailed,
                EventData::ReconnectFailed { attempts },
            );
            break;
        }
        attempts = attempt;
        let delay = policy.backoff.delay(attempt);
        warn!("reconnecting to {} in {:?} (attempt {})", shared.config.url, delay, attempt);
        shared.emit(
            EventCategory::SocketReconnecting,
            EventData::Reconnecting { attempt, delay },
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = token.cancelled() => break,
        }
    }

    shared.shut_down();
}

/// A handle to one logical connection. Cheap to clone; all clones share the connection.
///
/// Dropping the last handle stops the connection task. Call [`Client::close`] to shut down
/// explicitly and wait for it. Event handlers should hold a [`WeakClient`] rather than a
/// `Client`: the dispatcher owns its handlers, so a strong handle inside one keeps the
/// connection alive forever.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
    guard: Arc<DropGuard>,
}

/// A non-owning handle to a [`Client`], for use inside event handlers.
#[derive(Clone)]
pub struct WeakClient {
    shared: Weak<Shared>,
    guard: Weak<DropGuard>,
}

impl WeakClient {
    /// Returns a full handle, or `None` once every `Client` has been dropped.
    pub fn upgrade(&self) -> Option<Client> {
        Some(Client {
            guard: self.guard.upgrade()?,
            shared: self.shared.upgrade()?,
        })
    }
}

impl std::fmt::Debug for WeakClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakClient").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("url", &self.shared.config.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Creates a client that dials `config.url`. Nothing happens until [`Client::connect`].
    pub fn new(config: ClientConfig) -> Self {
        let connector = WsConnector::from_config(&config);
        Self::with_connector(config, connector)
    }

    /// Creates a client that obtains its sockets from `connector`.
    pub fn with_connector<C: Connector>(config: ClientConfig, connector: C) -> Self {
        let root = CancellationToken::new();
        let (state, _) = watch::channel(ConnectionState::Closed);
        let shared = Arc::new(Shared {
            codec: config.codec(),
            config,
            connector: Arc::new(connector),
            correlator: Correlator::new(),
            dispatcher: Dispatcher::new(),
            state,
            outbound: Mutex::new(Outbound::default()),
            task: Mutex::new(None),
            root: root.clone(),
        });
        Self {
            shared,
            guard: Arc::new(root.drop_guard()),
        }
    }

    /// A handle that does not keep the connection alive.
    pub fn downgrade(&self) -> WeakClient {
        WeakClient {
            shared: Arc::downgrade(&self.shared),
            guard: Arc::downgrade(&self.guard),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Codec settings to use when sending messages to this server.
    pub fn codec(&self) -> &CodecOptions {
        &self.shared.codec
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// A receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Number of calls waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.shared.correlator.pending_count()
    }

    /// Starts the connection task and waits for the first attempt.
    ///
    /// Returns `Ok` once the socket is open, or the error of the first attempt. With
    /// reconnection enabled the task keeps retrying in the background after a failed first
    /// attempt. If a connection task is already running this returns `Ok` immediately.
    pub async fn connect(&self) -> Result<()> {
        let ready = {
            let mut task = lock(&self.shared.task);
            if task.as_ref().is_some_and(|running| !running.handle.is_finished()) {
                return Ok(());
            }
            let token = self.shared.root.child_token();
            let (ready_tx, ready_rx) = oneshot::channel();
            let handle = tokio::spawn(run_connection_loop(
                Arc::clone(&self.shared),
                token.clone(),
                ready_tx,
            ));
            *task = Some(Running { token, handle });
            ready_rx
        };
        ready.await.unwrap_or(Err(RpcError::ConnectionLost))
    }

    /// Closes the connection, cancels any scheduled reconnect and fails all pending calls with
    /// [`RpcError::ConnectionLost`]. Closing a closed client does nothing.
    pub async fn close(&self) {
        let running = lock(&self.shared.task).take();
        if let Some(running) = running {
            running.token.cancel();
            if let Err(e) = running.handle.await {
                error!("connection task failed: {}", e);
            }
        }
        self.shared.shut_down();
    }

    /// Issues a call with the configured default timeout.
    pub fn call(&self, action: &str, params: Value) -> CallHandle {
        self.call_with_timeout(action, params, self.shared.config.request_timeout)
    }

    /// Issues a call. The returned handle resolves with the response `data`, or fails with
    /// `NotConnected`, `Timeout`, `ConnectionLost` or an API error. Must be called within a
    /// Tokio runtime.
    pub fn call_with_timeout(&self, action: &str, params: Value, timeout: Duration) -> CallHandle {
        let shared = &self.shared;
        let (request, handle) = shared.correlator.begin(action, params, timeout);
        shared.emit(EventCategory::ApiPreSend, EventData::PreSend(request.clone()));
        let sent = request.to_text().and_then(|text| {
            shared.submit(Outgoing {
                echo: Some(request.echo.clone()),
                text,
            })
        });
        if let Err(e) = sent {
            debug!("call {} ({}) not sent: {}", request.echo, action, e);
            shared.correlator.reject(&request.echo, e);
        }
        handle
    }

    /// Sends a typed request and deserializes the response data.
    pub async fn request<Req, Resp>(&self, action: &str, req: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let params = serde_json::to_value(req)?;
        let data = self.call(action, params).await?;
        Ok(serde_json::from_value(data)?)
    }

    /// Subscribes `handler` to `category` (and, through the category tree, to its subtypes).
    ///
    /// Handlers run on the connection task; long work or calls awaited from a handler should
    /// be spawned onto their own task. A handler that needs the client should capture
    /// [`Client::downgrade`] and upgrade it per event.
    pub fn on<F>(&self, category: EventCategory, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.shared.dispatcher.subscribe(category, handler, false)
    }

    /// Like [`Client::on`], but the handler runs at most once.
    pub fn once<F>(&self, category: EventCategory, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.shared.dispatcher.subscribe(category, handler, true)
    }

    /// Removes a subscription. Returns `false` if it was already gone.
    pub fn off(&self, id: SubscriptionId) -> bool {
        self.shared.dispatcher.unsubscribe(id)
    }
}
