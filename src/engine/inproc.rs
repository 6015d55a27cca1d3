//! In-process media session engine.
//!
//! Tracks rooms, peers, transports, producers and consumers and emits the
//! same lifecycle events a real forwarding engine would, without doing any
//! media plumbing. Used by the server binary for development and by the
//! tests as the engine collaborator.

use crate::engine::{ConsumerInfo, EngineEvent, MediaPeer, MediaRoom, MediaServer, MediaTransport};
use crate::types::{EffectiveProfile, MediaSource, Originator, PauseState, TransportDirection};
use crate::utils::{Error, Result};
use async_trait::async_trait;
use log::debug;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 64;

pub struct InprocMediaServer;

impl InprocMediaServer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for InprocMediaServer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaServer for InprocMediaServer {
    async fn create_room(
        &self,
        room_id: &str,
        media_codecs: &[String],
    ) -> Result<Arc<dyn MediaRoom>> {
        if media_codecs.is_empty() {
            return Err(Error::Engine("no media codecs configured".to_string()));
        }

        let room = Arc::new_cyclic(|weak: &Weak<InprocRoom>| InprocRoom {
            room_id: room_id.to_string(),
            media_codecs: media_codecs.to_vec(),
            self_ref: weak.clone(),
            peers: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        Ok(room)
    }
}

pub struct InprocRoom {
    room_id: String,
    media_codecs: Vec<String>,
    self_ref: Weak<InprocRoom>,
    peers: RwLock<HashMap<String, Arc<InprocPeer>>>,
    closed: AtomicBool,
}

impl InprocRoom {
    fn supports_codec(&self, codec: &str) -> bool {
        self.media_codecs.iter().any(|c| c.eq_ignore_ascii_case(codec))
    }

    fn other_peers(&self, except: &str) -> Vec<Arc<InprocPeer>> {
        self.peers
            .read()
            .values()
            .filter(|p| p.name != except)
            .cloned()
            .collect()
    }

    fn handle_join(&self, data: &Value) -> Result<Value> {
        let peer_name = data
            .get("peerName")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Engine("join request without peerName".to_string()))?;

        let peer = {
            let mut peers = self.peers.write();
            if peers.contains_key(peer_name) {
                return Err(Error::Engine(format!(
                    "peername \"{}\" already taken",
                    peer_name
                )));
            }

            let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
            let peer = Arc::new(InprocPeer {
                name: peer_name.to_string(),
                room: self.self_ref.clone(),
                transports: Mutex::new(HashMap::new()),
                producers: Mutex::new(HashMap::new()),
                consumers: Mutex::new(HashMap::new()),
                events,
                closed: AtomicBool::new(false),
            });
            peers.insert(peer_name.to_string(), peer.clone());
            peer
        };

        let others = self.other_peers(peer_name);

        // Consumers for media already produced in the room. The events
        // end up in the new peer's `existing_consumers` snapshot since
        // nobody has subscribed yet.
        for other in &others {
            let producers: Vec<ProducerRecord> = other.producers.lock().values().cloned().collect();
            for producer in producers {
                peer.add_consumer(&other.name, &producer, self.supports_codec(&producer.codec));
            }
        }

        let mut peer_summaries = Vec::new();
        for other in &others {
            other.emit(EngineEvent::NewPeer {
                name: peer_name.to_string(),
            });
            peer_summaries.push(other.summary());
        }

        debug!(
            "engine peer joined [room_id:{}, peer:{}]",
            self.room_id, peer_name
        );

        Ok(json!({ "peers": peer_summaries }))
    }
}

#[async_trait]
impl MediaRoom for InprocRoom {
    async fn receive_request(&self, method: &str, data: &Value) -> Result<Value> {
        match method {
            "queryRoom" => Ok(json!({
                "rtpCapabilities": { "codecs": self.media_codecs }
            })),
            "join" => {
                if self.closed() {
                    return Err(Error::Engine("room is closed".to_string()));
                }
                self.handle_join(data)
            }
            _ => Err(Error::Engine(format!("unknown room method \"{}\"", method))),
        }
    }

    async fn peer(&self, peer_name: &str) -> Option<Arc<dyn MediaPeer>> {
        self.peers
            .read()
            .get(peer_name)
            .cloned()
            .map(|p| p as Arc<dyn MediaPeer>)
    }

    async fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let peers: Vec<Arc<InprocPeer>> = self.peers.read().values().cloned().collect();
        for peer in peers {
            peer.close_internal(Originator::Remote);
        }
    }
}

#[derive(Debug, Clone)]
struct ProducerRecord {
    id: String,
    source: MediaSource,
    codec: String,
    paused: PauseState,
}

#[derive(Debug, Clone)]
struct ConsumerRecord {
    info: ConsumerInfo,
    producer_id: String,
    paused: PauseState,
}

pub struct InprocPeer {
    name: String,
    room: Weak<InprocRoom>,
    transports: Mutex<HashMap<String, Arc<InprocTransport>>>,
    producers: Mutex<HashMap<String, ProducerRecord>>,
    consumers: Mutex<HashMap<String, ConsumerRecord>>,
    events: broadcast::Sender<EngineEvent>,
    closed: AtomicBool,
}

impl InprocPeer {
    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine; events before the session binds are
        // recovered through `existing_consumers`.
        let _ = self.events.send(event);
    }

    fn summary(&self) -> Value {
        let producers: Vec<Value> = self
            .producers
            .lock()
            .values()
            .map(|p| json!({ "id": p.id, "source": p.source }))
            .collect();
        json!({ "name": self.name, "producers": producers })
    }

    fn add_consumer(&self, producer_peer: &str, producer: &ProducerRecord, supported: bool) {
        let info = ConsumerInfo {
            id: Uuid::new_v4().to_string(),
            peer_name: producer_peer.to_string(),
            source: producer.source,
            codec: producer.codec.clone(),
            supported,
        };
        self.consumers.lock().insert(
            info.id.clone(),
            ConsumerRecord {
                info: info.clone(),
                producer_id: producer.id.clone(),
                paused: PauseState::default(),
            },
        );
        self.emit(EngineEvent::NewConsumer(info));
    }

    fn handle_create_transport(&self, data: &Value) -> Result<Value> {
        let direction = match data.get("direction").and_then(Value::as_str) {
            Some("send") => TransportDirection::Send,
            Some("recv") => TransportDirection::Recv,
            _ => {
                return Err(Error::Engine(
                    "createTransport without a valid direction".to_string(),
                ))
            }
        };

        let transport = Arc::new(InprocTransport {
            id: Uuid::new_v4().to_string(),
            direction,
            max_bitrate: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        let id = transport.id.clone();
        self.transports.lock().insert(id.clone(), transport);
        self.emit(EngineEvent::NewTransport {
            id: id.clone(),
            direction,
        });
        Ok(json!({ "id": id }))
    }

    fn handle_close_transport(&self, data: &Value) -> Result<Value> {
        let id = require_id(data)?;
        let transport = self
            .transports
            .lock()
            .remove(id)
            .ok_or_else(|| Error::Engine(format!("no transport with id \"{}\"", id)))?;
        transport.closed.store(true, Ordering::SeqCst);
        self.emit(EngineEvent::TransportClosed {
            id: id.to_string(),
            direction: transport.direction,
            originator: Originator::Local,
        });
        Ok(json!({}))
    }

    fn handle_create_producer(&self, data: &Value) -> Result<Value> {
        let source = match data.get("source").and_then(Value::as_str) {
            Some("mic") => MediaSource::Mic,
            Some("webcam") => MediaSource::Webcam,
            _ => {
                return Err(Error::Engine(
                    "createProducer without a valid source".to_string(),
                ))
            }
        };

        let codec = match source {
            MediaSource::Mic => "opus",
            MediaSource::Webcam => "VP8",
        };
        let producer = ProducerRecord {
            id: Uuid::new_v4().to_string(),
            source,
            codec: codec.to_string(),
            paused: PauseState::default(),
        };
        self.producers
            .lock()
            .insert(producer.id.clone(), producer.clone());
        self.emit(EngineEvent::NewProducer {
            id: producer.id.clone(),
            source,
        });

        if let Some(room) = self.room.upgrade() {
            let supported = room.supports_codec(&producer.codec);
            for other in room.other_peers(&self.name) {
                other.add_consumer(&self.name, &producer, supported);
            }
        }

        Ok(json!({ "id": producer.id }))
    }

    fn handle_close_producer(&self, data: &Value) -> Result<Value> {
        let id = require_id(data)?;
        self.producers
            .lock()
            .remove(id)
            .ok_or_else(|| Error::Engine(format!("no producer with id \"{}\"", id)))?;
        self.emit(EngineEvent::ProducerClosed {
            id: id.to_string(),
            originator: Originator::Local,
        });
        self.close_remote_consumers(id);
        Ok(json!({}))
    }

    fn handle_producer_pause(&self, data: &Value, paused: bool) -> Result<Value> {
        let id = require_id(data)?;
        {
            let mut producers = self.producers.lock();
            let producer = producers
                .get_mut(id)
                .ok_or_else(|| Error::Engine(format!("no producer with id \"{}\"", id)))?;
            producer.paused.set_paused(Originator::Local, paused);
        }
        self.emit(if paused {
            EngineEvent::ProducerPaused {
                id: id.to_string(),
                originator: Originator::Local,
            }
        } else {
            EngineEvent::ProducerResumed {
                id: id.to_string(),
                originator: Originator::Local,
            }
        });

        // Observers see the pause as a remote consumer pause.
        if let Some(room) = self.room.upgrade() {
            for other in room.other_peers(&self.name) {
                other.set_consumers_of_producer_paused(id, paused);
            }
        }
        Ok(json!({}))
    }

    fn handle_consumer_pause(&self, data: &Value, paused: bool) -> Result<Value> {
        let id = require_id(data)?;
        {
            let mut consumers = self.consumers.lock();
            let consumer = consumers
                .get_mut(id)
                .ok_or_else(|| Error::Engine(format!("no consumer with id \"{}\"", id)))?;
            consumer.paused.set_paused(Originator::Local, paused);
        }
        self.emit(if paused {
            EngineEvent::ConsumerPaused {
                id: id.to_string(),
                originator: Originator::Local,
            }
        } else {
            EngineEvent::ConsumerResumed {
                id: id.to_string(),
                originator: Originator::Local,
            }
        });
        Ok(json!({}))
    }

    fn handle_enable_consumer(&self, data: &Value) -> Result<Value> {
        let id = require_id(data)?;
        let supported = self
            .consumers
            .lock()
            .get(id)
            .map(|c| c.info.supported)
            .ok_or_else(|| Error::Engine(format!("no consumer with id \"{}\"", id)))?;
        if !supported {
            return Err(Error::Engine("consumer not supported".to_string()));
        }
        self.emit(EngineEvent::ConsumerProfileChanged {
            id: id.to_string(),
            profile: EffectiveProfile::Default,
        });
        Ok(json!({ "profile": "default" }))
    }

    fn set_consumers_of_producer_paused(&self, producer_id: &str, paused: bool) {
        let ids: Vec<String> = {
            let mut consumers = self.consumers.lock();
            consumers
                .values_mut()
                .filter(|c| c.producer_id == producer_id)
                .map(|c| {
                    c.paused.set_paused(Originator::Remote, paused);
                    c.info.id.clone()
                })
                .collect()
        };
        for id in ids {
            self.emit(if paused {
                EngineEvent::ConsumerPaused {
                    id,
                    originator: Originator::Remote,
                }
            } else {
                EngineEvent::ConsumerResumed {
                    id,
                    originator: Originator::Remote,
                }
            });
        }
    }

    fn close_remote_consumers(&self, producer_id: &str) {
        if let Some(room) = self.room.upgrade() {
            for other in room.other_peers(&self.name) {
                let ids: Vec<String> = {
                    let mut consumers = other.consumers.lock();
                    let ids: Vec<String> = consumers
                        .values()
                        .filter(|c| c.producer_id == producer_id)
                        .map(|c| c.info.id.clone())
                        .collect();
                    for id in &ids {
                        consumers.remove(id);
                    }
                    ids
                };
                for id in ids {
                    other.emit(EngineEvent::ConsumerClosed {
                        id,
                        originator: Originator::Remote,
                    });
                }
            }
        }
    }

    fn close_internal(&self, originator: Originator) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let transports: Vec<Arc<InprocTransport>> =
            self.transports.lock().drain().map(|(_, t)| t).collect();
        for transport in transports {
            transport.closed.store(true, Ordering::SeqCst);
            self.emit(EngineEvent::TransportClosed {
                id: transport.id.clone(),
                direction: transport.direction,
                originator,
            });
        }

        let producers: Vec<ProducerRecord> =
            self.producers.lock().drain().map(|(_, p)| p).collect();
        for producer in &producers {
            self.emit(EngineEvent::ProducerClosed {
                id: producer.id.clone(),
                originator,
            });
            self.close_remote_consumers(&producer.id);
        }

        let consumer_ids: Vec<String> = self.consumers.lock().drain().map(|(id, _)| id).collect();
        for id in consumer_ids {
            self.emit(EngineEvent::ConsumerClosed {
                id,
                originator,
            });
        }

        if let Some(room) = self.room.upgrade() {
            room.peers.write().remove(&self.name);
            for other in room.other_peers(&self.name) {
                other.emit(EngineEvent::PeerClosed {
                    name: self.name.clone(),
                    originator: Originator::Remote,
                });
            }
        }
    }
}

#[async_trait]
impl MediaPeer for InprocPeer {
    fn name(&self) -> &str {
        &self.name
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn receive_request(&self, method: &str, data: &Value) -> Result<Value> {
        if self.closed() {
            return Err(Error::Engine("peer is closed".to_string()));
        }
        match method {
            "createTransport" => self.handle_create_transport(data),
            "closeTransport" => self.handle_close_transport(data),
            "createProducer" => self.handle_create_producer(data),
            "closeProducer" => self.handle_close_producer(data),
            "pauseProducer" => self.handle_producer_pause(data, true),
            "resumeProducer" => self.handle_producer_pause(data, false),
            "pauseConsumer" => self.handle_consumer_pause(data, true),
            "resumeConsumer" => self.handle_consumer_pause(data, false),
            "enableConsumer" => self.handle_enable_consumer(data),
            "leave" => {
                self.close_internal(Originator::Local);
                Ok(json!({}))
            }
            _ => Err(Error::Engine(format!(
                "unknown peer method \"{}\"",
                method
            ))),
        }
    }

    async fn receive_notification(&self, method: &str, _data: &Value) -> Result<()> {
        debug!(
            "engine notification [peer:{}, method:{}]",
            self.name, method
        );
        Ok(())
    }

    async fn send_transports(&self) -> Vec<Arc<dyn MediaTransport>> {
        self.transports
            .lock()
            .values()
            .filter(|t| t.direction == TransportDirection::Send && !t.closed.load(Ordering::SeqCst))
            .cloned()
            .map(|t| t as Arc<dyn MediaTransport>)
            .collect()
    }

    async fn existing_consumers(&self) -> Vec<ConsumerInfo> {
        self.consumers
            .lock()
            .values()
            .map(|c| c.info.clone())
            .collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    async fn close(&self) {
        self.close_internal(Originator::Local);
    }
}

pub struct InprocTransport {
    id: String,
    direction: TransportDirection,
    max_bitrate: Mutex<Option<u32>>,
    closed: AtomicBool,
}

impl InprocTransport {
    pub fn max_bitrate(&self) -> Option<u32> {
        *self.max_bitrate.lock()
    }
}

#[async_trait]
impl MediaTransport for InprocTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn direction(&self) -> TransportDirection {
        self.direction
    }

    async fn set_max_bitrate(&self, bitrate: u32) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Engine("transport is closed".to_string()));
        }
        *self.max_bitrate.lock() = Some(bitrate);
        Ok(())
    }
}

fn require_id(data: &Value) -> Result<&str> {
    data.get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Engine("request without an id".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn room_with_codecs(codecs: &[&str]) -> Arc<dyn MediaRoom> {
        let server = InprocMediaServer::new();
        let codecs: Vec<String> = codecs.iter().map(|c| c.to_string()).collect();
        server.create_room("test-room", &codecs).await.unwrap()
    }

    async fn join(room: &Arc<dyn MediaRoom>, name: &str) -> Arc<dyn MediaPeer> {
        room.receive_request("join", &json!({ "peerName": name }))
            .await
            .unwrap();
        room.peer(name).await.unwrap()
    }

    #[tokio::test]
    async fn producer_fans_out_consumers() {
        let room = room_with_codecs(&["opus", "VP8"]).await;
        let alice = join(&room, "alice").await;
        let bob = join(&room, "bob").await;

        let mut bob_events = bob.subscribe();
        alice
            .receive_request("createProducer", &json!({ "source": "mic" }))
            .await
            .unwrap();

        match bob_events.recv().await.unwrap() {
            EngineEvent::NewConsumer(info) => {
                assert_eq!(info.peer_name, "alice");
                assert_eq!(info.source, MediaSource::Mic);
                assert!(info.supported);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn codec_mismatch_marks_consumer_unsupported() {
        let room = room_with_codecs(&["opus"]).await;
        let alice = join(&room, "alice").await;
        let bob = join(&room, "bob").await;

        let mut bob_events = bob.subscribe();
        alice
            .receive_request("createProducer", &json!({ "source": "webcam" }))
            .await
            .unwrap();

        match bob_events.recv().await.unwrap() {
            EngineEvent::NewConsumer(info) => {
                assert!(!info.supported);
                let err = bob
                    .receive_request("enableConsumer", &json!({ "id": info.id }))
                    .await
                    .unwrap_err();
                assert!(err.to_string().contains("not supported"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn duplicate_peer_name_is_rejected() {
        let room = room_with_codecs(&["opus"]).await;
        join(&room, "alice").await;

        let err = room
            .receive_request("join", &json!({ "peerName": "alice" }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already taken"));
    }

    #[tokio::test]
    async fn late_joiner_sees_existing_producers_as_consumers() {
        let room = room_with_codecs(&["opus", "VP8"]).await;
        let alice = join(&room, "alice").await;
        alice
            .receive_request("createProducer", &json!({ "source": "mic" }))
            .await
            .unwrap();

        let bob = join(&room, "bob").await;
        let existing = bob.existing_consumers().await;
        assert_eq!(existing.len(), 1);
        assert_eq!(existing[0].peer_name, "alice");
    }

    #[tokio::test]
    async fn closing_producer_closes_remote_consumers() {
        let room = room_with_codecs(&["opus"]).await;
        let alice = join(&room, "alice").await;
        let bob = join(&room, "bob").await;

        let mut bob_events = bob.subscribe();
        let response = alice
            .receive_request("createProducer", &json!({ "source": "mic" }))
            .await
            .unwrap();
        let producer_id = response["id"].as_str().unwrap().to_string();

        // Consume the NewConsumer event first.
        bob_events.recv().await.unwrap();

        alice
            .receive_request("closeProducer", &json!({ "id": producer_id }))
            .await
            .unwrap();
        match bob_events.recv().await.unwrap() {
            EngineEvent::ConsumerClosed { originator, .. } => {
                assert_eq!(originator, Originator::Remote);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(bob.existing_consumers().await.is_empty());
    }
}
