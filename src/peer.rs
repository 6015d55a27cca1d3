use crate::engine::{ConsumerInfo, EngineEvent, MediaPeer};
use crate::room::Room;
use crate::signaling::{Connection, ServerMessage};
use crate::types::TransportDirection;
use crate::utils::{Error, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;

/// `Joining` is entered when a join request is forwarded to the engine and
/// `Joined` only once the engine peer handle is bound. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connected,
    Joining,
    Joined,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub timestamp: DateTime<Utc>,
    pub from_state: SessionState,
    pub to_state: SessionState,
}

/// Server-side representation of one connected client: one connection, at
/// most one engine peer handle, and the event pump relaying engine events
/// outward.
pub struct PeerSession {
    peer_name: String,
    conn: Arc<dyn Connection>,
    state: Mutex<SessionState>,
    transitions: Mutex<Vec<StateTransition>>,
    media_peer: RwLock<Option<Arc<dyn MediaPeer>>>,
}

impl PeerSession {
    pub fn new(peer_name: &str, conn: Arc<dyn Connection>) -> Self {
        Self {
            peer_name: peer_name.to_string(),
            conn,
            state: Mutex::new(SessionState::Connected),
            transitions: Mutex::new(Vec::new()),
            media_peer: RwLock::new(None),
        }
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn media_peer(&self) -> Option<Arc<dyn MediaPeer>> {
        self.media_peer.read().clone()
    }

    pub fn last_transition(&self) -> Option<StateTransition> {
        self.transitions.lock().last().cloned()
    }

    /// Applies a state transition if it is legal, recording it. Illegal
    /// transitions are rejected and logged.
    fn transition(&self, to_state: SessionState) -> bool {
        let mut state = self.state.lock();
        let from_state = *state;

        let valid = matches!(
            (from_state, to_state),
            (SessionState::Connected, SessionState::Joining)
                | (SessionState::Joining, SessionState::Joined)
                | (SessionState::Connected, SessionState::Closed)
                | (SessionState::Joining, SessionState::Closed)
                | (SessionState::Joined, SessionState::Closed)
        );

        if !valid {
            warn!(
                "invalid session transition [peer:{}, from:{:?}, to:{:?}]",
                self.peer_name, from_state, to_state
            );
            return false;
        }

        *state = to_state;
        self.transitions.lock().push(StateTransition {
            timestamp: Utc::now(),
            from_state,
            to_state,
        });
        debug!(
            "session transition [peer:{}, from:{:?}, to:{:?}]",
            self.peer_name, from_state, to_state
        );
        true
    }

    pub fn set_joining(&self) -> Result<()> {
        if self.transition(SessionState::Joining) {
            Ok(())
        } else {
            Err(Error::Peer(format!(
                "peer \"{}\" cannot join in state {:?}",
                self.peer_name,
                self.state()
            )))
        }
    }

    /// Binds the engine peer handle after a successful join and starts the
    /// event pump. Consumers created before the subscription are forwarded
    /// from the engine's snapshot.
    pub fn bind_media_peer(
        self: &Arc<Self>,
        room: &Arc<Room>,
        media_peer: Arc<dyn MediaPeer>,
    ) {
        let events = media_peer.subscribe();
        *self.media_peer.write() = Some(media_peer.clone());
        self.transition(SessionState::Joined);

        let session = self.clone();
        let room = room.clone();
        tokio::spawn(async move {
            for info in media_peer.existing_consumers().await {
                info!(
                    "media peer existing consumer [peer:{}, id:{}]",
                    session.peer_name, info.id
                );
                session
                    .forward_notification(new_consumer_notification(&info))
                    .await;
            }

            let mut events = events;
            loop {
                match events.recv().await {
                    Ok(event) => session.handle_engine_event(&room, event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            "engine event stream lagged [peer:{}, skipped:{}]",
                            session.peer_name, skipped
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn handle_engine_event(&self, room: &Arc<Room>, event: EngineEvent) {
        match &event {
            EngineEvent::NewTransport { id, direction } => {
                info!(
                    "media peer \"newtransport\" event [peer:{}, id:{}, direction:{:?}]",
                    self.peer_name, id, direction
                );
                if *direction == TransportDirection::Send {
                    room.update_max_bitrate().await;
                }
                return;
            }
            EngineEvent::TransportClosed { direction, .. } => {
                if *direction == TransportDirection::Send {
                    room.update_max_bitrate().await;
                }
            }
            _ => {}
        }

        if let Some(message) = notification_for(&event) {
            self.forward_notification(message).await;
        }
    }

    async fn forward_notification(&self, message: ServerMessage) {
        if let Err(e) = self.conn.send(message).await {
            warn!(
                "failed to forward notification [peer:{}]: {}",
                self.peer_name, e
            );
        }
    }

    /// Closes the session and its engine peer handle. Safe to call more
    /// than once.
    pub async fn close(&self) {
        {
            let state = self.state.lock();
            if *state == SessionState::Closed {
                return;
            }
        }
        self.transition(SessionState::Closed);

        let media_peer = self.media_peer.read().clone();
        if let Some(peer) = media_peer {
            if !peer.closed() {
                peer.close().await;
            }
        }
    }
}

fn new_consumer_notification(info: &ConsumerInfo) -> ServerMessage {
    ServerMessage::notification(
        "newConsumer",
        json!({
            "id": info.id,
            "peerName": info.peer_name,
            "source": info.source,
            "codec": info.codec,
            "supported": info.supported,
        }),
    )
}

/// Maps engine state-change events onto client notifications keyed by
/// entity kind and id. Transport creation is omitted: the creating client
/// already holds the response.
fn notification_for(event: &EngineEvent) -> Option<ServerMessage> {
    let message = match event {
        EngineEvent::NewPeer { name } => {
            ServerMessage::notification("newPeer", json!({ "name": name }))
        }
        EngineEvent::PeerClosed { name, originator } => ServerMessage::notification(
            "peerClosed",
            json!({ "name": name, "originator": originator }),
        ),
        EngineEvent::TransportClosed { id, originator, .. } => ServerMessage::notification(
            "transportClosed",
            json!({ "id": id, "originator": originator }),
        ),
        EngineEvent::ProducerClosed { id, originator } => ServerMessage::notification(
            "producerClosed",
            json!({ "id": id, "originator": originator }),
        ),
        EngineEvent::ProducerPaused { id, originator } => ServerMessage::notification(
            "producerPaused",
            json!({ "id": id, "originator": originator }),
        ),
        EngineEvent::ProducerResumed { id, originator } => ServerMessage::notification(
            "producerResumed",
            json!({ "id": id, "originator": originator }),
        ),
        EngineEvent::NewConsumer(info) => new_consumer_notification(info),
        EngineEvent::ConsumerClosed { id, originator } => ServerMessage::notification(
            "consumerClosed",
            json!({ "id": id, "originator": originator }),
        ),
        EngineEvent::ConsumerPaused { id, originator } => ServerMessage::notification(
            "consumerPaused",
            json!({ "id": id, "originator": originator }),
        ),
        EngineEvent::ConsumerResumed { id, originator } => ServerMessage::notification(
            "consumerResumed",
            json!({ "id": id, "originator": originator }),
        ),
        EngineEvent::ConsumerProfileChanged { id, profile } => ServerMessage::notification(
            "consumerProfileChanged",
            json!({ "id": id, "profile": profile }),
        ),
        EngineEvent::NewTransport { .. } | EngineEvent::NewProducer { .. } => return None,
    };
    Some(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NullConnection;

    #[async_trait]
    impl Connection for NullConnection {
        async fn send(&self, _message: ServerMessage) -> Result<()> {
            Ok(())
        }
    }

    fn session() -> PeerSession {
        PeerSession::new("alice", Arc::new(NullConnection))
    }

    #[test]
    fn join_flow_transitions() {
        let session = session();
        assert_eq!(session.state(), SessionState::Connected);
        assert!(session.transition(SessionState::Joining));
        assert!(session.transition(SessionState::Joined));
        assert!(session.transition(SessionState::Closed));
    }

    #[test]
    fn cannot_join_twice() {
        let session = session();
        assert!(session.set_joining().is_ok());
        assert!(session.set_joining().is_err());
    }

    #[test]
    fn closed_is_terminal() {
        let session = session();
        assert!(session.transition(SessionState::Closed));
        assert!(!session.transition(SessionState::Joining));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn join_failure_closes_directly() {
        let session = session();
        assert!(session.set_joining().is_ok());
        assert!(session.transition(SessionState::Closed));
        assert_eq!(session.state(), SessionState::Closed);
    }
}
