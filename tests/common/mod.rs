//! A scripted OneBot server for integration tests.
//!
//! Each accepted websocket is handed to the test, which drives it frame by frame.

#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use cqrpc::{Client, ClientConfig, Event, EventCategory, ReconnectPolicy};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        Message,
    },
    WebSocketStream,
};

pub const WAIT: Duration = Duration::from_secs(5);

pub struct MockServer {
    addr: SocketAddr,
    connections: mpsc::UnboundedReceiver<ServerConn>,
    authorization: Arc<Mutex<Option<String>>>,
    handle: JoinHandle<()>,
}

pub struct ServerConn {
    ws: WebSocketStream<TcpStream>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, connections) = mpsc::unbounded_channel();
        let authorization = Arc::new(Mutex::new(None));
        let seen = authorization.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let seen = seen.clone();
                let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                    *seen.lock().unwrap() = req
                        .headers()
                        .get("Authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(String::from);
                    Ok(resp)
                };
                if let Ok(ws) = accept_hdr_async(stream, callback).await {
                    if tx.send(ServerConn { ws }).is_err() {
                        break;
                    }
                }
            }
        });
        Self {
            addr,
            connections,
            authorization,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Config for a client of this server that does not reconnect.
    pub fn config(&self) -> ClientConfig {
        ClientConfig::new(self.url()).reconnect(ReconnectPolicy::disabled())
    }

    pub async fn accept(&mut self) -> ServerConn {
        timeout(WAIT, self.connections.recv())
            .await
            .expect("no connection arrived")
            .expect("server stopped")
    }

    /// The `Authorization` header of the most recent handshake.
    pub fn authorization(&self) -> Option<String> {
        self.authorization.lock().unwrap().clone()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl ServerConn {
    /// Reads the next text frame as JSON.
    pub async fn recv_json(&mut self) -> Value {
        loop {
            let message = timeout(WAIT, self.ws.next())
                .await
                .expect("no frame arrived")
                .expect("connection ended")
                .unwrap();
            if let Message::Text(text) = message {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    pub async fn send_json(&mut self, value: Value) {
        self.ws.send(Message::Text(value.to_string().into())).await.unwrap();
    }

    /// Answers `request` successfully with `data`.
    pub async fn reply(&mut self, request: &Value, data: Value) {
        self.send_json(json!({
            "status": "ok",
            "retcode": 0,
            "data": data,
            "echo": request["echo"],
        }))
        .await;
    }

    /// Drops the TCP stream without a close handshake.
    pub fn abort(self) {
        drop(self.ws);
    }

    /// Performs a clean close handshake from the server side.
    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
        while let Ok(Some(_)) = timeout(WAIT, self.ws.next()).await {}
    }
}

/// Forwards every event of `category` into a channel.
pub fn collect(client: &Client, category: EventCategory) -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.on(category, move |event| {
        let _ = tx.send(event.clone());
    });
    rx
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(WAIT, rx.recv())
        .await
        .expect("no event arrived")
        .expect("subscription dropped")
}
