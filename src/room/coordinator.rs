use crate::config::ServerConfig;
use crate::engine::{MediaRoom, MediaServer, MediaTransport};
use crate::peer::PeerSession;
use crate::signaling::Connection;
use crate::utils::{Error, Result};
use log::{debug, error, info};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};

/// One media room: owns the peer sessions, the protocol dispatch table and
/// the bitrate redistribution policy.
pub struct Room {
    room_id: String,
    config: Arc<ServerConfig>,
    media_room: Arc<dyn MediaRoom>,
    sessions: RwLock<HashMap<String, Arc<PeerSession>>>,
    /// Current ceiling. The lock doubles as the per-room critical section
    /// for recomputing and applying the policy.
    max_bitrate: Mutex<u32>,
    closed: AtomicBool,
    close_tx: broadcast::Sender<()>,
}

impl Room {
    pub async fn new(
        room_id: &str,
        media_server: &Arc<dyn MediaServer>,
        config: Arc<ServerConfig>,
    ) -> Result<Arc<Self>> {
        let media_room = media_server
            .create_room(room_id, &config.media_codecs)
            .await?;

        let (close_tx, _) = broadcast::channel(1);
        let max_bitrate = config.max_bitrate;
        Ok(Arc::new(Self {
            room_id: room_id.to_string(),
            config,
            media_room,
            sessions: RwLock::new(HashMap::new()),
            max_bitrate: Mutex::new(max_bitrate),
            closed: AtomicBool::new(false),
            close_tx,
        }))
    }

    pub fn id(&self) -> &str {
        &self.room_id
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn subscribe_close(&self) -> broadcast::Receiver<()> {
        self.close_tx.subscribe()
    }

    pub async fn current_max_bitrate(&self) -> u32 {
        *self.max_bitrate.lock().await
    }

    pub async fn sessions(&self) -> Vec<Arc<PeerSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Registers a peer session for an inbound connection. A reconnect
    /// under the same name replaces the stale entry.
    pub async fn handle_connection(
        self: &Arc<Self>,
        peer_name: &str,
        conn: Arc<dyn Connection>,
    ) -> Result<Arc<PeerSession>> {
        if self.closed() {
            return Err(Error::Room(format!(
                "room \"{}\" is closed",
                self.room_id
            )));
        }

        info!(
            "connection [room_id:{}, peer_name:{}]",
            self.room_id, peer_name
        );
        let session = Arc::new(PeerSession::new(peer_name, conn));
        self.sessions
            .write()
            .await
            .insert(peer_name.to_string(), session.clone());
        Ok(session)
    }

    /// Protocol dispatch for one inbound request, keyed by method name.
    pub async fn handle_request(
        self: &Arc<Self>,
        session: &Arc<PeerSession>,
        method: &str,
        data: &Value,
    ) -> Result<Value> {
        debug!(
            "request [room_id:{}, peer:{}, method:{}]",
            self.room_id,
            session.peer_name(),
            method
        );

        match method {
            "queryRoom" => self.media_room.receive_request(method, data).await,
            "join" => self.handle_join(session, data).await,
            _ => match session.media_peer() {
                Some(peer) => peer.receive_request(method, data).await,
                None => Err(Error::Peer(format!(
                    "no such peer \"{}\"",
                    session.peer_name()
                ))),
            },
        }
    }

    async fn handle_join(
        self: &Arc<Self>,
        session: &Arc<PeerSession>,
        data: &Value,
    ) -> Result<Value> {
        session.set_joining()?;

        let response = match self.media_room.receive_request("join", data).await {
            Ok(response) => response,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };

        let media_peer = match self.media_room.peer(session.peer_name()).await {
            Some(peer) => peer,
            None => {
                session.close().await;
                return Err(Error::Engine(format!(
                    "engine has no peer \"{}\" after join",
                    session.peer_name()
                )));
            }
        };

        session.bind_media_peer(self, media_peer);
        Ok(response)
    }

    /// Fire-and-forget notifications follow the same join-gated routing.
    pub async fn handle_notification(
        &self,
        session: &Arc<PeerSession>,
        method: &str,
        data: &Value,
    ) -> Result<()> {
        match session.media_peer() {
            Some(peer) => peer.receive_notification(method, data).await,
            None => {
                error!(
                    "cannot handle notification, peer not joined [room_id:{}, peer:{}, method:{}]",
                    self.room_id,
                    session.peer_name(),
                    method
                );
                Ok(())
            }
        }
    }

    /// Closes the session's engine peer immediately, then checks room
    /// emptiness after a grace delay so quick reconnects survive.
    pub async fn handle_disconnect(self: &Arc<Self>, session: &Arc<PeerSession>) {
        session.close().await;

        {
            let mut sessions = self.sessions.write().await;
            // A reconnect may already have replaced this entry.
            if let Some(current) = sessions.get(session.peer_name()) {
                if Arc::ptr_eq(current, session) {
                    sessions.remove(session.peer_name());
                }
            }
        }

        let room = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(room.config.room_grace_period).await;

            if room.media_room.closed() {
                return;
            }
            if room.media_room.peer_count().await == 0 {
                info!(
                    "last peer in the room left, closing the room [room_id:{}]",
                    room.room_id
                );
                room.close().await;
            }
        });
    }

    /// Idempotent; fires the close signal exactly once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("close() [room_id:{}]", self.room_id);
        self.media_room.close().await;
        let _ = self.close_tx.send(());
    }

    /// Recomputes the room-wide sending ceiling from the number of peers
    /// currently holding a send transport, and applies it to every open
    /// send transport. Per-transport failures are logged and skipped.
    pub async fn update_max_bitrate(&self) {
        if self.media_room.closed() {
            return;
        }

        let mut ceiling = self.max_bitrate.lock().await;

        let sessions = self.sessions().await;
        let mut send_transports: Vec<Arc<dyn MediaTransport>> = Vec::new();
        let mut num_senders = 0;
        for session in sessions {
            if let Some(peer) = session.media_peer() {
                let transports = peer.send_transports().await;
                if !transports.is_empty() {
                    num_senders += 1;
                }
                send_transports.extend(transports);
            }
        }

        let previous = *ceiling;
        let new_bitrate = compute_max_bitrate(num_senders, &self.config);
        *ceiling = new_bitrate;
        metrics::gauge!("room_max_bitrate", new_bitrate as f64);

        for transport in &send_transports {
            if let Err(e) = transport.set_max_bitrate(new_bitrate).await {
                error!(
                    "transport.set_max_bitrate() failed [id:{}]: {}",
                    transport.id(),
                    e
                );
            }
        }

        info!(
            "update_max_bitrate() [room_id:{}, senders:{}, before:{}kbps, now:{}kbps]",
            self.room_id,
            num_senders,
            previous / 1000,
            new_bitrate / 1000
        );
    }

    pub async fn log_status(&self) {
        if self.closed() {
            return;
        }
        info!(
            "log_status() [room_id:{}, sessions:{}, engine peers:{}]",
            self.room_id,
            self.sessions.read().await.len(),
            self.media_room.peer_count().await
        );
    }
}

/// Pure ceiling computation: full bitrate up to two senders, then a decay
/// by sender count, never below the configured floor.
pub fn compute_max_bitrate(num_senders: usize, config: &ServerConfig) -> u32 {
    if num_senders <= 2 {
        return config.max_bitrate;
    }

    let computed = (config.max_bitrate as f64 / ((num_senders - 1) as f64 * config.bitrate_factor))
        .round() as u32;
    computed.max(config.min_bitrate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::inproc::InprocMediaServer;
    use crate::signaling::ServerMessage;
    use async_trait::async_trait;
    use serde_json::json;

    struct RecordingConnection {
        sent: parking_lot::Mutex<Vec<ServerMessage>>,
    }

    impl RecordingConnection {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: parking_lot::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Connection for RecordingConnection {
        async fn send(&self, message: ServerMessage) -> Result<()> {
            self.sent.lock().push(message);
            Ok(())
        }
    }

    async fn test_room() -> Arc<Room> {
        let media_server: Arc<dyn MediaServer> = Arc::new(InprocMediaServer::new());
        Room::new("test-room", &media_server, Arc::new(ServerConfig::default()))
            .await
            .unwrap()
    }

    async fn join_peer(room: &Arc<Room>, name: &str) -> Arc<PeerSession> {
        let session = room
            .handle_connection(name, RecordingConnection::new())
            .await
            .unwrap();
        room.handle_request(&session, "join", &json!({ "peerName": name }))
            .await
            .unwrap();
        session
    }

    async fn open_send_transport(room: &Arc<Room>, session: &Arc<PeerSession>) -> String {
        let response = room
            .handle_request(session, "createTransport", &json!({ "direction": "send" }))
            .await
            .unwrap();
        // The bitrate trigger runs on the event pump; let it settle.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        response["id"].as_str().unwrap().to_string()
    }

    #[test]
    fn ceiling_is_full_bitrate_up_to_two_senders() {
        let config = ServerConfig::default();
        assert_eq!(compute_max_bitrate(0, &config), 1_000_000);
        assert_eq!(compute_max_bitrate(1, &config), 1_000_000);
        assert_eq!(compute_max_bitrate(2, &config), 1_000_000);
    }

    #[test]
    fn ceiling_decays_beyond_two_senders() {
        let config = ServerConfig::default();
        assert_eq!(compute_max_bitrate(3, &config), 666_667);
        assert_eq!(compute_max_bitrate(4, &config), 444_444);
    }

    #[test]
    fn ceiling_is_monotonic_and_floored() {
        let config = ServerConfig::default();
        let mut previous = u32::MAX;
        for n in 3..40 {
            let ceiling = compute_max_bitrate(n, &config);
            assert!(ceiling <= previous, "not monotonic at n={}", n);
            assert!(ceiling >= config.min_bitrate);
            previous = ceiling;
        }
        // round(1_000_000 / (29 * 0.75)) = 45_977, clamped to the floor.
        assert_eq!(compute_max_bitrate(30, &config), 50_000);
    }

    #[tokio::test]
    async fn requests_before_join_are_rejected() {
        let room = test_room().await;
        let session = room
            .handle_connection("alice", RecordingConnection::new())
            .await
            .unwrap();

        let err = room
            .handle_request(&session, "createTransport", &json!({ "direction": "send" }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no such peer"));
    }

    #[tokio::test]
    async fn query_room_is_allowed_before_join() {
        let room = test_room().await;
        let session = room
            .handle_connection("alice", RecordingConnection::new())
            .await
            .unwrap();

        let response = room
            .handle_request(&session, "queryRoom", &json!({}))
            .await
            .unwrap();
        assert!(response["rtpCapabilities"]["codecs"].is_array());
    }

    #[tokio::test]
    async fn ceiling_follows_sender_count() {
        let room = test_room().await;

        let alice = join_peer(&room, "alice").await;
        open_send_transport(&room, &alice).await;
        assert_eq!(room.current_max_bitrate().await, 1_000_000);

        let bob = join_peer(&room, "bob").await;
        open_send_transport(&room, &bob).await;
        assert_eq!(room.current_max_bitrate().await, 1_000_000);

        let carol = join_peer(&room, "carol").await;
        open_send_transport(&room, &carol).await;
        assert_eq!(room.current_max_bitrate().await, 666_667);
    }

    #[tokio::test]
    async fn recompute_is_idempotent() {
        let room = test_room().await;
        for name in ["alice", "bob", "carol"] {
            let session = join_peer(&room, name).await;
            open_send_transport(&room, &session).await;
        }

        assert_eq!(room.current_max_bitrate().await, 666_667);
        room.update_max_bitrate().await;
        room.update_max_bitrate().await;
        assert_eq!(room.current_max_bitrate().await, 666_667);
    }

    #[tokio::test]
    async fn engine_events_reach_other_connections() {
        let room = test_room().await;

        let alice_conn = RecordingConnection::new();
        let alice = room.handle_connection("alice", alice_conn.clone()).await.unwrap();
        room.handle_request(&alice, "join", &json!({ "peerName": "alice" }))
            .await
            .unwrap();

        let bob_conn = RecordingConnection::new();
        let bob = room.handle_connection("bob", bob_conn.clone()).await.unwrap();
        room.handle_request(&bob, "join", &json!({ "peerName": "bob" }))
            .await
            .unwrap();

        room.handle_request(&alice, "createProducer", &json!({ "source": "mic" }))
            .await
            .unwrap();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let methods: Vec<String> = bob_conn
            .sent
            .lock()
            .iter()
            .filter_map(|m| match m {
                ServerMessage::Notification { method, .. } => Some(method.clone()),
                _ => None,
            })
            .collect();
        assert!(methods.contains(&"newConsumer".to_string()), "got {:?}", methods);
    }

    #[tokio::test]
    async fn closing_send_transport_restores_ceiling() {
        let room = test_room().await;
        let alice = join_peer(&room, "alice").await;
        let bob = join_peer(&room, "bob").await;
        let carol = join_peer(&room, "carol").await;

        open_send_transport(&room, &alice).await;
        open_send_transport(&room, &bob).await;
        let carol_transport = open_send_transport(&room, &carol).await;
        assert_eq!(room.current_max_bitrate().await, 666_667);

        room.handle_request(&carol, "closeTransport", &json!({ "id": carol_transport }))
            .await
            .unwrap();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(room.current_max_bitrate().await, 1_000_000);
    }
}
