//! Client half of the signaling connection.
//!
//! Requests are correlated with responses by order: the server answers
//! each connection's requests in arrival order, so a FIFO of pending
//! callers is enough. A timed-out caller stays in the queue so later
//! responses still line up with the right entries.

use crate::signaling::{ClientMessage, ServerMessage};
use crate::utils::{Error, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const NOTICE_CHANNEL_CAPACITY: usize = 64;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Connection-level happenings the controller reacts to. `Open` is only
/// emitted for reconnects; the initial connection is established before
/// the transport is handed out.
#[derive(Debug, Clone)]
pub enum TransportNotice {
    Open,
    Notification { method: String, data: Value },
    Closed,
}

#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn request(&self, method: &str, data: Value) -> Result<Value>;
    async fn notify(&self, method: &str, data: Value) -> Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<TransportNotice>;
    async fn close(&self);
}

pub struct WsSignalingTransport {
    url: String,
    request_timeout: Duration,
    writer: Mutex<Option<WsSink>>,
    pending: SyncMutex<VecDeque<oneshot::Sender<Result<Value>>>>,
    notices: broadcast::Sender<TransportNotice>,
    closed: AtomicBool,
}

impl WsSignalingTransport {
    pub async fn connect(
        server_url: &str,
        room_id: &str,
        peer_name: &str,
        request_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let url = format!(
            "{}/?roomId={}&peerName={}",
            server_url.trim_end_matches('/'),
            room_id,
            peer_name
        );
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        let transport = Arc::new(Self {
            url,
            request_timeout,
            writer: Mutex::new(None),
            pending: SyncMutex::new(VecDeque::new()),
            notices,
            closed: AtomicBool::new(false),
        });

        let (ws_stream, _) = connect_async(&transport.url).await?;
        transport.install(ws_stream).await;
        Ok(transport)
    }

    fn install<'a>(
        self: &'a Arc<Self>,
        ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let (sink, source) = ws_stream.split();
            *self.writer.lock().await = Some(sink);

            let transport = self.clone();
            tokio::spawn(async move {
                transport.read_loop(source).await;
            });
        })
    }

    async fn read_loop(self: Arc<Self>, mut source: WsSource) {
        while let Some(msg) = source.next().await {
            let text = match msg {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };

            let message: ServerMessage = match serde_json::from_str(&text) {
                Ok(message) => message,
                Err(e) => {
                    warn!("discarding malformed server message: {}", e);
                    continue;
                }
            };

            match message {
                ServerMessage::Response { ok, data, error } => {
                    let caller = self.pending.lock().pop_front();
                    match caller {
                        Some(caller) => {
                            let result = if ok {
                                Ok(data.unwrap_or(Value::Null))
                            } else {
                                Err(Error::Engine(
                                    error.unwrap_or_else(|| "request failed".to_string()),
                                ))
                            };
                            // The caller may have timed out already.
                            let _ = caller.send(result);
                        }
                        None => warn!("response without a pending request"),
                    }
                }
                ServerMessage::Notification { method, data } => {
                    let _ = self
                        .notices
                        .send(TransportNotice::Notification { method, data });
                }
            }
        }

        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        debug!("signaling connection lost, scheduling reconnect");
        *self.writer.lock().await = None;
        self.fail_pending("connection lost");
        let _ = self.notices.send(TransportNotice::Closed);

        // Reconnect until it works or the transport is closed for good.
        loop {
            tokio::time::sleep(RECONNECT_DELAY).await;
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            match connect_async(&self.url).await {
                Ok((ws_stream, _)) => {
                    self.install(ws_stream).await;
                    let _ = self.notices.send(TransportNotice::Open);
                    return;
                }
                Err(e) => warn!("reconnect attempt failed: {}", e),
            }
        }
    }

    fn fail_pending(&self, reason: &str) {
        let callers: Vec<_> = self.pending.lock().drain(..).collect();
        for caller in callers {
            let _ = caller.send(Err(Error::Peer(reason.to_string())));
        }
    }

    async fn send_message(&self, message: &ClientMessage) -> Result<()> {
        let json = serde_json::to_string(message)?;
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(sink) => {
                sink.send(Message::Text(json)).await?;
                Ok(())
            }
            None => Err(Error::Peer("not connected".to_string())),
        }
    }
}

#[async_trait]
impl SignalingTransport for WsSignalingTransport {
    async fn request(&self, method: &str, data: Value) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().push_back(tx);

        self.send_message(&ClientMessage::Request {
            method: method.to_string(),
            data,
        })
        .await?;

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Peer("connection lost".to_string())),
            Err(_) => Err(Error::Timeout(format!(
                "request \"{}\" timed out",
                method
            ))),
        }
    }

    async fn notify(&self, method: &str, data: Value) -> Result<()> {
        self.send_message(&ClientMessage::Notification {
            method: method.to_string(),
            data,
        })
        .await
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportNotice> {
        self.notices.subscribe()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
        self.fail_pending("transport closed");
    }
}
