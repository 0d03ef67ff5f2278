//! # HYPERDESK Control
//!
//! The control plane: persistent duplex WebSocket connections carrying the
//! JSON protocol of `hyperdesk-proto` as text frames.
//!
//! The server accepts any number of peers and dispatches every decoded
//! inbound frame to a single async handler, sequentially per connection.
//! Malformed frames are logged and dropped without closing the connection.
//! The handler is a function value, not a back-pointer, so the component
//! graph stays acyclic.

#![warn(missing_docs)]
#![warn(clippy::all)]

use futures_util::{SinkExt, StreamExt};
use hyperdesk_proto::{Envelope, MessageType, ProtocolError, decode_message, encode_message};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_async, connect_async};

/// Control-plane errors.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket failure
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Frame failed to encode or decode
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Client method used before `connect`
    #[error("client is not connected")]
    NotConnected,

    /// The peer closed the connection
    #[error("connection closed by peer")]
    ConnectionClosed,
}

/// Async handler invoked for each decoded inbound envelope.
pub type MessageHandler =
    Arc<dyn Fn(Envelope) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct PeerHandle {
    outbound: mpsc::UnboundedSender<Message>,
    task: JoinHandle<()>,
}

/// WebSocket control server.
pub struct ControlServer {
    host: String,
    port: u16,
    handler: MessageHandler,
    peers: Arc<Mutex<HashMap<u64, PeerHandle>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    next_peer_id: Arc<AtomicU64>,
}

impl ControlServer {
    /// Create a server that will bind `host:port` on [`Self::start`].
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, handler: MessageHandler) -> Self {
        Self {
            host: host.into(),
            port,
            handler,
            peers: Arc::new(Mutex::new(HashMap::new())),
            accept_task: Mutex::new(None),
            next_peer_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Bind the listener and start accepting connections.
    ///
    /// Returns the bound port (useful when constructed with port 0).
    ///
    /// # Errors
    ///
    /// Returns an error if the bind fails.
    pub async fn start(&self) -> Result<u16, ControlError> {
        let listener = TcpListener::bind((self.host.as_str(), self.port)).await?;
        let port = listener.local_addr()?.port();
        tracing::info!("control server listening on {}:{port}", self.host);

        let handler = Arc::clone(&self.handler);
        let peers = Arc::clone(&self.peers);
        let next_peer_id = Arc::clone(&self.next_peer_id);
        let accept = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        tracing::debug!("control connection from {addr}");
                        let peer_id = next_peer_id.fetch_add(1, Ordering::Relaxed);
                        spawn_connection(
                            stream,
                            peer_id,
                            Arc::clone(&handler),
                            Arc::clone(&peers),
                        )
                        .await;
                    }
                    Err(error) => {
                        tracing::warn!("accept failed: {error}");
                        break;
                    }
                }
            }
        });
        *self.accept_task.lock().await = Some(accept);
        Ok(port)
    }

    /// Send a text frame to every connected peer.
    ///
    /// Peers whose connection task has died are discarded from the active
    /// set here.
    pub async fn broadcast(&self, message: String) {
        let mut peers = self.peers.lock().await;
        peers.retain(|peer_id, peer| {
            if peer.outbound.send(Message::Text(message.clone())).is_ok() {
                true
            } else {
                tracing::debug!("dropping dead peer {peer_id}");
                false
            }
        });
    }

    /// Encode and broadcast a message.
    ///
    /// # Errors
    ///
    /// Returns an error when the payload violates the message schema.
    pub async fn broadcast_message(
        &self,
        message_type: MessageType,
        payload: Map<String, Value>,
    ) -> Result<(), ControlError> {
        let frame = encode_message(message_type, payload, None)?;
        self.broadcast(frame).await;
        Ok(())
    }

    /// Number of currently connected peers.
    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    /// Close the listener, wind down connection tasks, clear the peer set.
    pub async fn stop(&self) {
        if let Some(accept) = self.accept_task.lock().await.take() {
            accept.abort();
            let _ = accept.await;
        }
        let peers: Vec<PeerHandle> = {
            let mut guard = self.peers.lock().await;
            guard.drain().map(|(_, peer)| peer).collect()
        };
        for peer in peers {
            drop(peer.outbound);
            let _ = peer.task.await;
        }
        tracing::info!("control server stopped");
    }
}

/// Complete the handshake for one inbound connection and run its duplex
/// loop: forward broadcasts out, decode inbound text frames into the
/// handler. The peer removes itself from the active set when the loop ends.
async fn spawn_connection(
    stream: TcpStream,
    peer_id: u64,
    handler: MessageHandler,
    peers: Arc<Mutex<HashMap<u64, PeerHandle>>>,
) {
    let websocket = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(error) => {
            tracing::warn!("websocket handshake failed: {error}");
            return;
        }
    };
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let task_peers = Arc::clone(&peers);

    let task = tokio::spawn(async move {
        let (mut sink, mut source) = websocket.split();
        loop {
            tokio::select! {
                outgoing = outbound_rx.recv() => {
                    match outgoing {
                        Some(message) => {
                            if sink.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                incoming = source.next() => {
                    match incoming {
                        Some(Ok(Message::Text(raw))) => match decode_message(&raw) {
                            Ok(envelope) => handler(envelope).await,
                            Err(error) => {
                                tracing::warn!("dropping bad frame: {error}");
                            }
                        },
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(error)) => {
                            tracing::debug!("connection error: {error}");
                            break;
                        }
                    }
                }
            }
        }
        task_peers.lock().await.remove(&peer_id);
    });

    peers.lock().await.insert(
        peer_id,
        PeerHandle {
            outbound: outbound_tx,
            task,
        },
    );
}

/// WebSocket control client. Holds exactly one connection.
pub struct ControlClient {
    websocket: Option<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl Default for ControlClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlClient {
    /// Create a disconnected client.
    #[must_use]
    pub fn new() -> Self {
        Self { websocket: None }
    }

    /// Connect to a control URL such as `ws://127.0.0.1:8765/`.
    ///
    /// # Errors
    ///
    /// Returns an error when the connection or handshake fails.
    pub async fn connect(&mut self, url: &str) -> Result<(), ControlError> {
        let (websocket, _) = connect_async(url).await?;
        self.websocket = Some(websocket);
        Ok(())
    }

    /// Encode and send one message.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotConnected`] before `connect`, a protocol
    /// error for schema violations, or a socket error.
    pub async fn send(
        &mut self,
        message_type: MessageType,
        payload: Map<String, Value>,
        request_id: Option<&str>,
    ) -> Result<(), ControlError> {
        let websocket = self.websocket.as_mut().ok_or(ControlError::NotConnected)?;
        let frame = encode_message(message_type, payload, request_id)?;
        websocket.send(Message::Text(frame)).await?;
        Ok(())
    }

    /// Receive the next decoded envelope, skipping non-text frames.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::ConnectionClosed`] when the server hangs up,
    /// or a protocol error for an invalid frame.
    pub async fn recv(&mut self) -> Result<Envelope, ControlError> {
        let websocket = self.websocket.as_mut().ok_or(ControlError::NotConnected)?;
        loop {
            match websocket.next().await {
                Some(Ok(Message::Text(raw))) => return Ok(decode_message(&raw)?),
                Some(Ok(Message::Close(_))) | None => return Err(ControlError::ConnectionClosed),
                Some(Ok(_)) => {}
                Some(Err(error)) => return Err(error.into()),
            }
        }
    }

    /// Close the connection.
    ///
    /// # Errors
    ///
    /// Returns a socket error if the close frame cannot be sent.
    pub async fn disconnect(&mut self) -> Result<(), ControlError> {
        if let Some(mut websocket) = self.websocket.take() {
            websocket.close(None).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;

    fn pairing_payload() -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("device_id".into(), json!("p1"));
        payload.insert("pair_code".into(), json!("123456"));
        payload
    }

    #[tokio::test]
    async fn test_client_to_handler_and_broadcast_back() {
        let (seen_tx, mut seen_rx) = unbounded_channel::<Envelope>();
        let handler: MessageHandler = Arc::new(move |envelope| {
            let seen_tx = seen_tx.clone();
            Box::pin(async move {
                let _ = seen_tx.send(envelope);
            })
        });
        let server = Arc::new(ControlServer::new("127.0.0.1", 0, handler));
        let port = server.start().await.unwrap();

        let mut client = ControlClient::new();
        client
            .connect(&format!("ws://127.0.0.1:{port}/"))
            .await
            .unwrap();
        client
            .send(MessageType::PairingRequest, pairing_payload(), None)
            .await
            .unwrap();

        let envelope = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.message_type, MessageType::PairingRequest);
        assert_eq!(envelope.payload_str("pair_code"), Some("123456"));

        // Broadcast reaches the connected client.
        let mut accept = Map::new();
        accept.insert("session_id".into(), json!("s1"));
        accept.insert("device_id".into(), json!("h1"));
        accept.insert("session_token".into(), json!("tok_0123456789abcdef"));
        server
            .broadcast_message(MessageType::PairingAccept, accept)
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), client.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.message_type, MessageType::PairingAccept);

        client.disconnect().await.unwrap();
        server.stop().await;
    }

    #[tokio::test]
    async fn test_bad_frames_do_not_close_the_connection() {
        let handler: MessageHandler = Arc::new(|_| Box::pin(async {}));
        let server = Arc::new(ControlServer::new("127.0.0.1", 0, handler));
        let port = server.start().await.unwrap();

        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/"))
            .await
            .unwrap();
        ws.send(Message::Text("{not json".into())).await.unwrap();
        // Still alive: a valid frame goes through afterwards.
        let frame =
            encode_message(MessageType::PairingRequest, pairing_payload(), None).unwrap();
        ws.send(Message::Text(frame)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(server.peer_count().await, 1);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_clears_peers() {
        let handler: MessageHandler = Arc::new(|_| Box::pin(async {}));
        let server = Arc::new(ControlServer::new("127.0.0.1", 0, handler));
        let port = server.start().await.unwrap();

        let mut client = ControlClient::new();
        client
            .connect(&format!("ws://127.0.0.1:{port}/"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.peer_count().await, 1);

        server.stop().await;
        assert_eq!(server.peer_count().await, 0);
    }
}
