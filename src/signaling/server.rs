use crate::room::RoomRegistry;
use crate::signaling::{ClientMessage, ServerMessage};
use crate::utils::{Error, Result};
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::handshake::server::{
    Request as HandshakeRequest, Response as HandshakeResponse,
};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

/// Outbound half of one client connection.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn send(&self, message: ServerMessage) -> Result<()>;
}

#[derive(Clone)]
pub struct WsConnection {
    sender: Arc<Mutex<SplitSink<WebSocketStream<TcpStream>, Message>>>,
}

impl WsConnection {
    pub fn new(sender: SplitSink<WebSocketStream<TcpStream>, Message>) -> Self {
        Self {
            sender: Arc::new(Mutex::new(sender)),
        }
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&self, message: ServerMessage) -> Result<()> {
        let json = serde_json::to_string(&message)?;
        let mut sender = self.sender.lock().await;
        sender.send(Message::Text(json)).await?;
        Ok(())
    }
}

pub struct SignalingServer {
    address: String,
    registry: Arc<RoomRegistry>,
}

impl SignalingServer {
    pub fn new(registry: Arc<RoomRegistry>, port: u16) -> Self {
        Self {
            address: format!("0.0.0.0:{}", port),
            registry,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.address).await?;
        info!("server successfully bound to {}", self.address);

        while let Ok((stream, addr)) = listener.accept().await {
            let registry = self.registry.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, registry).await {
                    error!("connection error [addr:{}]: {}", addr, e);
                }
            });
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<RoomRegistry>,
) -> Result<()> {
    let mut request_uri = None;
    let ws_stream = accept_hdr_async(stream, |req: &HandshakeRequest, resp: HandshakeResponse| {
        request_uri = Some(req.uri().to_string());
        Ok(resp)
    })
    .await?;

    let (room_id, peer_name) = request_uri
        .as_deref()
        .and_then(parse_room_query)
        .ok_or_else(|| {
            warn!("connection request without roomId and/or peerName [addr:{}]", addr);
            Error::Peer("connection request without roomId and/or peerName".to_string())
        })?;

    info!(
        "connection request [addr:{}, room_id:{}, peer_name:{}]",
        addr, room_id, peer_name
    );
    metrics::increment_counter!("signaling_connections_total");

    let (ws_sender, mut ws_receiver) = ws_stream.split();
    let conn: Arc<dyn Connection> = Arc::new(WsConnection::new(ws_sender));

    let room = registry.get_or_create(&room_id).await?;
    let session = room.handle_connection(&peer_name, conn.clone()).await?;

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                warn!("read error [peer:{}]: {}", peer_name, e);
                break;
            }
        };

        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let message: ClientMessage = match serde_json::from_str(&text) {
            Ok(message) => message,
            Err(e) => {
                warn!("discarding malformed message [peer:{}]: {}", peer_name, e);
                continue;
            }
        };

        // Requests are handled one at a time so responses go back in
        // arrival order; the client correlates them by that order.
        match message {
            ClientMessage::Request { method, data } => {
                let reply = match room.handle_request(&session, &method, &data).await {
                    Ok(data) => ServerMessage::response(data),
                    Err(e) => ServerMessage::error(e.to_string()),
                };
                conn.send(reply).await?;
            }
            ClientMessage::Notification { method, data } => {
                if let Err(e) = room.handle_notification(&session, &method, &data).await {
                    warn!(
                        "notification failed [peer:{}, method:{}]: {}",
                        peer_name, method, e
                    );
                }
            }
        }
    }

    room.handle_disconnect(&session).await;
    Ok(())
}

/// The client indicates the room id and its peer name in the URL query.
fn parse_room_query(uri: &str) -> Option<(String, String)> {
    let query = uri.split_once('?')?.1;
    let mut room_id = None;
    let mut peer_name = None;

    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("roomId", value)) if !value.is_empty() => room_id = Some(value.to_string()),
            Some(("peerName", value)) if !value.is_empty() => peer_name = Some(value.to_string()),
            _ => {}
        }
    }

    Some((room_id?, peer_name?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_room_and_peer_from_query() {
        let parsed = parse_room_query("/?roomId=demo&peerName=alice");
        assert_eq!(parsed, Some(("demo".to_string(), "alice".to_string())));

        let parsed = parse_room_query("/?peerName=alice&roomId=demo");
        assert_eq!(parsed, Some(("demo".to_string(), "alice".to_string())));
    }

    #[test]
    fn rejects_incomplete_query() {
        assert_eq!(parse_room_query("/"), None);
        assert_eq!(parse_room_query("/?roomId=demo"), None);
        assert_eq!(parse_room_query("/?roomId=&peerName=alice"), None);
    }
}
