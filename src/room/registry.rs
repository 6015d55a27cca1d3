use crate::config::ServerConfig;
use crate::engine::MediaServer;
use crate::room::Room;
use crate::utils::Result;
use log::{error, info};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Process-wide map of rooms. Rooms are created lazily on the first
/// connection naming an unknown room id and deregistered when they close.
pub struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<String, Arc<Room>>>>,
    media_server: Arc<dyn MediaServer>,
    config: Arc<ServerConfig>,
}

impl RoomRegistry {
    pub fn new(media_server: Arc<dyn MediaServer>, config: Arc<ServerConfig>) -> Arc<Self> {
        Arc::new(Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            media_server,
            config,
        })
    }

    /// Idempotent lookup-or-create. The write lock spans the existence
    /// check and the insert, so two simultaneous first-connections for the
    /// same unknown id produce exactly one room. Engine failure propagates
    /// and registers nothing.
    pub async fn get_or_create(&self, room_id: &str) -> Result<Arc<Room>> {
        let mut rooms = self.rooms.write().await;

        if let Some(room) = rooms.get(room_id) {
            return Ok(room.clone());
        }

        info!("creating a new Room [room_id:{}]", room_id);
        let room = match Room::new(room_id, &self.media_server, self.config.clone()).await {
            Ok(room) => room,
            Err(e) => {
                error!("error creating a new Room [room_id:{}]: {}", room_id, e);
                return Err(e);
            }
        };
        rooms.insert(room_id.to_string(), room.clone());
        metrics::increment_counter!("rooms_created_total");

        // Deregister when the room closes; log status while it lives.
        let rooms_handle = self.rooms.clone();
        let registered_id = room_id.to_string();
        let watched = room.clone();
        let mut closed = room.subscribe_close();
        tokio::spawn(async move {
            let mut status = tokio::time::interval(STATUS_LOG_INTERVAL);
            status.tick().await;
            loop {
                tokio::select! {
                    _ = closed.recv() => break,
                    _ = status.tick() => watched.log_status().await,
                }
            }
            rooms_handle.write().await.remove(&registered_id);
            info!("Room closed and deregistered [room_id:{}]", registered_id);
        });

        Ok(room)
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    pub async fn rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::inproc::InprocMediaServer;
    use crate::signaling::{Connection, ServerMessage};
    use async_trait::async_trait;
    use serde_json::json;

    struct NullConnection;

    #[async_trait]
    impl Connection for NullConnection {
        async fn send(&self, _message: ServerMessage) -> Result<()> {
            Ok(())
        }
    }

    fn registry() -> Arc<RoomRegistry> {
        let media_server: Arc<dyn MediaServer> = Arc::new(InprocMediaServer::new());
        RoomRegistry::new(media_server, Arc::new(ServerConfig::default()))
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let registry = registry();
        let first = registry.get_or_create("room-1").await.unwrap();
        let second = registry.get_or_create("room-1").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test(start_paused = true)]
    async fn last_disconnect_closes_room_after_grace_period() {
        let registry = registry();
        let room = registry.get_or_create("room-1").await.unwrap();
        let mut closed = room.subscribe_close();

        let session = room
            .handle_connection("alice", Arc::new(NullConnection))
            .await
            .unwrap();
        room.handle_request(&session, "join", &json!({ "peerName": "alice" }))
            .await
            .unwrap();

        room.handle_disconnect(&session).await;
        assert!(!room.closed());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(room.closed());
        closed.recv().await.unwrap();

        // Let the deregistration task observe the close signal.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(registry.get("room-1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_grace_period_keeps_room_open() {
        let registry = registry();
        let room = registry.get_or_create("room-1").await.unwrap();

        let session = room
            .handle_connection("alice", Arc::new(NullConnection))
            .await
            .unwrap();
        room.handle_request(&session, "join", &json!({ "peerName": "alice" }))
            .await
            .unwrap();
        room.handle_disconnect(&session).await;

        // Rejoin well inside the grace period.
        tokio::time::sleep(Duration::from_secs(2)).await;
        let session = room
            .handle_connection("alice", Arc::new(NullConnection))
            .await
            .unwrap();
        room.handle_request(&session, "join", &json!({ "peerName": "alice" }))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!room.closed());
        assert!(registry.get("room-1").await.is_some());
    }
}
