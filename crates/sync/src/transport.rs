/// Transport seam for the realtime channel
///
/// A transport owns one physical connection and nothing else: connect, send,
/// receive, close. All reconnection, subscription, and reconciliation logic
/// lives above it in the connection supervisor.
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Channel closed")]
    Closed,
}

/// Factory for physical connections
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish one physical connection
    async fn connect(&self) -> Result<Box<dyn TransportLink>, TransportError>;
}

/// One live connection
#[async_trait]
pub trait TransportLink: Send {
    /// Best-effort frame send
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Next inbound frame; `None` once the connection is gone
    async fn recv(&mut self) -> Option<String>;

    /// Tear the connection down
    async fn close(&mut self);
}

/// Long-poll receive timeout; the gateway parks the request until frames
/// arrive or this elapses
const POLL_TIMEOUT: Duration = Duration::from_secs(90);

/// Production transport over the station gateway's HTTP channel endpoint
///
/// The channel is a handshake + long-poll receive loop with a separate publish
/// POST for outbound frames. A fresh client id is minted per transport so the
/// gateway can track connection identity across polls.
pub struct HttpChannelTransport {
    base_url: String,
    http: reqwest::Client,
    client_id: Uuid,
}

impl HttpChannelTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
            client_id: Uuid::new_v4(),
        }
    }
}

#[async_trait]
impl Transport for HttpChannelTransport {
    async fn connect(&self) -> Result<Box<dyn TransportLink>, TransportError> {
        let url = format!("{}/handshake", self.base_url);

        let response = self
            .http
            .get(&url)
            .query(&[("client", self.client_id.to_string())])
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?
            .error_for_status()
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let handshake: HandshakeResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        tracing::debug!(client = %self.client_id, cursor = %handshake.cursor, "channel handshake complete");

        Ok(Box::new(HttpChannelLink {
            base_url: self.base_url.clone(),
            http: self.http.clone(),
            client_id: self.client_id,
            cursor: handshake.cursor,
            buffered: VecDeque::new(),
            open: true,
        }))
    }
}

struct HttpChannelLink {
    base_url: String,
    http: reqwest::Client,
    client_id: Uuid,
    cursor: String,
    buffered: VecDeque<String>,
    open: bool,
}

#[async_trait]
impl TransportLink for HttpChannelLink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }

        let url = format!("{}/publish", self.base_url);
        self.http
            .post(&url)
            .query(&[("client", self.client_id.to_string())])
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(frame)
            .send()
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?
            .error_for_status()
            .map_err(|e| TransportError::Send(e.to_string()))?;

        Ok(())
    }

    async fn recv(&mut self) -> Option<String> {
        loop {
            if !self.open {
                return None;
            }

            if let Some(frame) = self.buffered.pop_front() {
                return Some(frame);
            }

            let url = format!("{}/poll", self.base_url);
            let response = self
                .http
                .get(&url)
                .query(&[
                    ("client", self.client_id.to_string()),
                    ("cursor", self.cursor.clone()),
                ])
                .timeout(POLL_TIMEOUT)
                .send()
                .await
                .and_then(|r| r.error_for_status());

            let body: PollResponse = match response {
                Ok(response) => match response.json().await {
                    Ok(body) => body,
                    Err(e) => {
                        tracing::warn!(error = %e, "channel poll returned an undecodable body");
                        self.open = false;
                        return None;
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "channel poll failed");
                    self.open = false;
                    return None;
                }
            };

            self.cursor = body.cursor;
            self.buffered.extend(body.frames);
        }
    }

    async fn close(&mut self) {
        self.open = false;
        self.buffered.clear();
    }
}

#[derive(Debug, Deserialize)]
struct HandshakeResponse {
    cursor: String,
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    cursor: String,
    #[serde(default)]
    frames: Vec<String>,
}

/// In-memory transport for tests and demos
///
/// Each `connect` yields a fresh link whose far end pops out of
/// [`InMemoryServer::accept`]. Dropping a [`ServerLink`] closes the client
/// side, which the supervisor observes as a connection loss.
pub struct InMemoryTransport {
    accept_tx: mpsc::UnboundedSender<ServerLink>,
    fail_connect: Arc<AtomicBool>,
}

impl InMemoryTransport {
    pub fn new() -> (Self, InMemoryServer) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let transport = Self {
            accept_tx,
            fail_connect: Arc::new(AtomicBool::new(false)),
        };
        (transport, InMemoryServer { accept_rx })
    }

    /// Make subsequent `connect` calls fail (simulates an unreachable gateway)
    pub fn set_connect_failing(&self, failing: bool) {
        self.fail_connect.store(failing, Ordering::SeqCst);
    }

    /// Shared switch for flipping connect failures from a test
    pub fn connect_failing_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.fail_connect)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn connect(&self) -> Result<Box<dyn TransportLink>, TransportError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("gateway unreachable".to_string()));
        }

        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();

        let server_link = ServerLink {
            inbound: client_rx,
            outbound: server_tx,
        };

        self.accept_tx
            .send(server_link)
            .map_err(|_| TransportError::Connect("server half dropped".to_string()))?;

        Ok(Box::new(InMemoryLink {
            tx: client_tx,
            rx: server_rx,
            open: true,
        }))
    }
}

/// Far end of the in-memory transport, held by the test/demo "server"
pub struct InMemoryServer {
    accept_rx: mpsc::UnboundedReceiver<ServerLink>,
}

impl InMemoryServer {
    /// Next established connection
    pub async fn accept(&mut self) -> Option<ServerLink> {
        self.accept_rx.recv().await
    }
}

/// Server half of one in-memory connection
pub struct ServerLink {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<String>,
}

impl ServerLink {
    /// Push a raw frame to the client
    pub fn send_raw(&self, frame: impl Into<String>) -> bool {
        self.outbound.send(frame.into()).is_ok()
    }

    /// Push a server message to the client
    pub fn send(&self, message: &crate::protocol::ServerMessage) -> bool {
        match serde_json::to_string(message) {
            Ok(frame) => self.send_raw(frame),
            Err(_) => false,
        }
    }

    /// Next client frame, decoded
    pub async fn recv(&mut self) -> Option<crate::protocol::ClientMessage> {
        loop {
            let frame = self.inbound.recv().await?;
            match serde_json::from_str(&frame) {
                Ok(message) => return Some(message),
                Err(_) => continue,
            }
        }
    }

    /// Try to read a client frame without waiting
    pub fn try_recv(&mut self) -> Option<crate::protocol::ClientMessage> {
        while let Ok(frame) = self.inbound.try_recv() {
            if let Ok(message) = serde_json::from_str(&frame) {
                return Some(message);
            }
        }
        None
    }
}

struct InMemoryLink {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
    open: bool,
}

#[async_trait]
impl TransportLink for InMemoryLink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(frame)
            .map_err(|_| TransportError::Send("server half dropped".to_string()))
    }

    async fn recv(&mut self) -> Option<String> {
        if !self.open {
            return None;
        }
        let frame = self.rx.recv().await;
        if frame.is_none() {
            self.open = false;
        }
        frame
    }

    async fn close(&mut self) {
        self.open = false;
        self.rx.close();
    }
}
