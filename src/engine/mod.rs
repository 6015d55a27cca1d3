//! Boundary to the media session engine.
//!
//! The engine performs the actual media plumbing (transport establishment,
//! packet forwarding, codec work). This layer only coordinates session
//! state, so the engine is addressed through these traits: a request or
//! notification per room/peer, and a lifecycle event stream per peer.

pub mod inproc;

use crate::types::{EffectiveProfile, MediaSource, Originator, TransportDirection};
use crate::utils::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Lifecycle events emitted by the engine for one peer's entities.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    NewPeer {
        name: String,
    },
    PeerClosed {
        name: String,
        originator: Originator,
    },
    NewTransport {
        id: String,
        direction: TransportDirection,
    },
    TransportClosed {
        id: String,
        direction: TransportDirection,
        originator: Originator,
    },
    NewProducer {
        id: String,
        source: MediaSource,
    },
    ProducerClosed {
        id: String,
        originator: Originator,
    },
    ProducerPaused {
        id: String,
        originator: Originator,
    },
    ProducerResumed {
        id: String,
        originator: Originator,
    },
    NewConsumer(ConsumerInfo),
    ConsumerClosed {
        id: String,
        originator: Originator,
    },
    ConsumerPaused {
        id: String,
        originator: Originator,
    },
    ConsumerResumed {
        id: String,
        originator: Originator,
    },
    ConsumerProfileChanged {
        id: String,
        profile: EffectiveProfile,
    },
}

/// Static description of a consumer as created by the engine.
#[derive(Debug, Clone)]
pub struct ConsumerInfo {
    pub id: String,
    /// Name of the peer producing the consumed media.
    pub peer_name: String,
    pub source: MediaSource,
    pub codec: String,
    /// Whether the observing peer is capable of receiving this media.
    pub supported: bool,
}

#[async_trait]
pub trait MediaServer: Send + Sync {
    /// Creates an engine room. Failure here is fatal for the room
    /// creation attempt; nothing is registered.
    async fn create_room(&self, room_id: &str, media_codecs: &[String])
        -> Result<Arc<dyn MediaRoom>>;
}

#[async_trait]
pub trait MediaRoom: Send + Sync {
    async fn receive_request(&self, method: &str, data: &Value) -> Result<Value>;
    async fn peer(&self, peer_name: &str) -> Option<Arc<dyn MediaPeer>>;
    async fn peer_count(&self) -> usize;
    fn closed(&self) -> bool;
    async fn close(&self);
}

#[async_trait]
pub trait MediaPeer: Send + Sync {
    fn name(&self) -> &str;
    fn closed(&self) -> bool;
    async fn receive_request(&self, method: &str, data: &Value) -> Result<Value>;
    async fn receive_notification(&self, method: &str, data: &Value) -> Result<()>;
    /// Currently open send transports, for bitrate cap application.
    async fn send_transports(&self) -> Vec<Arc<dyn MediaTransport>>;
    /// Consumers that already existed before the caller subscribed.
    async fn existing_consumers(&self) -> Vec<ConsumerInfo>;
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
    async fn close(&self);
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> &str;
    fn direction(&self) -> TransportDirection;
    async fn set_max_bitrate(&self, bitrate: u32) -> Result<()>;
}
