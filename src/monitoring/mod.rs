//! Introspection endpoint for live room state.
//!
//! Serves a JSON snapshot of every room, its peers and the current bitrate
//! ceiling. This is the diagnostic accessor used by operators and test
//! harnesses; nothing else in the crate reaches for ambient globals.

use crate::peer::SessionState;
use crate::room::RoomRegistry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use warp::Filter;

#[derive(Debug, Serialize)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub max_bitrate: u32,
    pub peers: Vec<PeerSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct PeerSnapshot {
    pub name: String,
    pub state: SessionState,
    pub since: Option<DateTime<Utc>>,
}

pub async fn snapshot(registry: &Arc<RoomRegistry>) -> Vec<RoomSnapshot> {
    let mut snapshots = Vec::new();
    for room in registry.rooms().await {
        let mut peers = Vec::new();
        for session in room.sessions().await {
            peers.push(PeerSnapshot {
                name: session.peer_name().to_string(),
                state: session.state(),
                since: session.last_transition().map(|t| t.timestamp),
            });
        }
        snapshots.push(RoomSnapshot {
            room_id: room.id().to_string(),
            max_bitrate: room.current_max_bitrate().await,
            peers,
        });
    }
    snapshots
}

pub async fn run_debug_server(registry: Arc<RoomRegistry>, port: u16) {
    let rooms = warp::path!("debug" / "rooms")
        .and(warp::get())
        .and(with_registry(registry))
        .and_then(handle_rooms);

    warp::serve(rooms).run(([0, 0, 0, 0], port)).await;
}

async fn handle_rooms(registry: Arc<RoomRegistry>) -> Result<impl warp::Reply, Infallible> {
    let snapshots = snapshot(&registry).await;
    Ok(warp::reply::json(&snapshots))
}

fn with_registry(
    registry: Arc<RoomRegistry>,
) -> impl Filter<Extract = (Arc<RoomRegistry>,), Error = Infallible> + Clone {
    warp::any().map(move || registry.clone())
}
