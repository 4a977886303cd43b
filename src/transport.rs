//! Establishing the websocket.
//!
//! The connection task asks a [`Connector`] for a fresh socket on every (re)connect attempt.
//! [`WsConnector`] dials the configured URL; other implementations can supply sockets from
//! anywhere, which is also how the reconnect logic is exercised without a server.

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue},
    MaybeTlsStream, WebSocketStream,
};
use tracing::trace;

use crate::{
    config::ClientConfig,
    error::{Result, RpcError},
};

/// The socket type the connection task drives.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens sockets for the connection task.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Opens a new socket. Called once per connect attempt.
    async fn connect(&self) -> Result<WsStream>;
}

/// Dials a websocket URL, authenticating with a bearer token when one is set.
#[derive(Debug, Clone)]
pub struct WsConnector {
    /// The endpoint to dial.
    url: String,
    /// Optional access token sent in the `Authorization` header.
    access_token: Option<String>,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, access_token: Option<String>) -> Self {
        Self {
            url: url.into(),
            access_token,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.url.clone(), config.access_token.clone())
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<WsStream> {
        let connect_error = |source| RpcError::Connect {
            source: Box::new(source),
        };
        let mut request = self.url.as_str().into_client_request().map_err(connect_error)?;
        if let Some(token) = &self.access_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| RpcError::Protocol(format!("invalid access token: {}", e)))?;
            request.headers_mut().insert("Authorization", value);
        }
        let (stream, _) = connect_async(request).await.map_err(connect_error)?;
        trace!("websocket connection established to: {}", self.url);
        Ok(stream)
    }
}
