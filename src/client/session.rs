//! Boundary to the client-side media session engine.
//!
//! The session mirror performs the browser-side media work (capability
//! negotiation, local transports, tracks). The controller talks to it
//! through these traits and relays its protocol traffic over the
//! signaling transport via [`RequestSink`].

use crate::types::{EffectiveProfile, MediaKind, MediaSource, Originator, TransportDirection};
use crate::utils::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Opaque handle onto a capture or playback track. The media itself lives
/// in the browser layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
}

/// Outbound protocol relay handed to the session at join time.
#[async_trait]
pub trait RequestSink: Send + Sync {
    async fn request(&self, method: &str, data: Value) -> Result<Value>;
    async fn notify(&self, method: &str, data: Value) -> Result<()>;
}

#[derive(Clone)]
pub enum SessionEvent {
    NewPeer(Arc<dyn PeerHandle>),
    Closed { originator: Originator },
}

#[derive(Clone)]
pub enum PeerEvent {
    NewConsumer(Arc<dyn ConsumerHandle>),
    Closed { originator: Originator },
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Closed { originator: Originator },
}

#[derive(Debug, Clone)]
pub enum ProducerEvent {
    Closed { originator: Originator },
    Paused { originator: Originator },
    Resumed { originator: Originator },
}

#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    Closed { originator: Originator },
    Paused { originator: Originator },
    Resumed { originator: Originator },
    ProfileChanged { profile: EffectiveProfile },
}

/// One join's worth of session state. A fresh instance is created for
/// every (re)join, so there are never stale subscriptions to clean up.
#[async_trait]
pub trait ClientSession: Send + Sync {
    async fn join(&self, peer_name: &str, sink: Arc<dyn RequestSink>) -> Result<()>;
    /// Whether room negotiation permits sending this media kind.
    fn can_send(&self, kind: MediaKind) -> bool;
    async fn create_transport(&self, direction: TransportDirection)
        -> Result<Arc<dyn TransportHandle>>;
    async fn create_producer(
        &self,
        track: MediaTrack,
        source: MediaSource,
    ) -> Result<Arc<dyn ProducerHandle>>;
    /// Peers currently known to the session.
    fn peers(&self) -> Vec<Arc<dyn PeerHandle>>;
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;
    /// Feeds a server notification into the mirror.
    async fn receive_notification(&self, method: &str, data: &Value) -> Result<()>;
    async fn leave(&self);
}

pub trait PeerHandle: Send + Sync {
    fn name(&self) -> &str;
    fn consumers(&self) -> Vec<Arc<dyn ConsumerHandle>>;
    fn subscribe(&self) -> broadcast::Receiver<PeerEvent>;
}

#[async_trait]
pub trait TransportHandle: Send + Sync {
    fn id(&self) -> &str;
    fn direction(&self) -> TransportDirection;
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
    async fn close(&self);
}

#[async_trait]
pub trait ProducerHandle: Send + Sync {
    fn id(&self) -> &str;
    fn source(&self) -> MediaSource;
    fn codec(&self) -> String;
    fn track(&self) -> MediaTrack;
    fn locally_paused(&self) -> bool;
    fn remotely_paused(&self) -> bool;
    /// Starts sending over the given transport.
    async fn send(&self, transport: &Arc<dyn TransportHandle>) -> Result<()>;
    async fn pause(&self);
    async fn resume(&self);
    async fn close(&self);
    fn subscribe(&self) -> broadcast::Receiver<ProducerEvent>;
}

#[async_trait]
pub trait ConsumerHandle: Send + Sync {
    fn id(&self) -> &str;
    /// Name of the peer producing the consumed media.
    fn peer_name(&self) -> &str;
    fn source(&self) -> MediaSource;
    fn codec(&self) -> Option<String>;
    fn supported(&self) -> bool;
    fn locally_paused(&self) -> bool;
    fn remotely_paused(&self) -> bool;
    async fn pause(&self);
    /// Requests media reception over the given transport.
    async fn receive(&self, transport: &Arc<dyn TransportHandle>) -> Result<MediaTrack>;
    fn subscribe(&self) -> broadcast::Receiver<ConsumerEvent>;
}

/// Creates a fresh session mirror per (re)join.
pub trait SessionFactory: Send + Sync {
    fn create_session(&self) -> Arc<dyn ClientSession>;
}
