//! Client-side mirror of the room coordinator.
//!
//! Drives the join sequence against a fresh session mirror per (re)join,
//! owns the local producer lifecycle and projects every engine event into
//! the observable application state.

use crate::types::{MediaKind, MediaSource, Originator, PauseState, TransportDirection};
use crate::utils::{Error, Result};
use async_trait::async_trait;
use log::{debug, error, warn};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};

use super::devices::{DevicePreferences, MediaDevices, WebcamState, WebcamType};
use super::session::{
    ClientSession, ConsumerEvent, ConsumerHandle, PeerEvent, PeerHandle, ProducerEvent,
    ProducerHandle, RequestSink, SessionEvent, SessionFactory, TransportEvent, TransportHandle,
};
use super::state::{ClientState, ConsumerState, ProducerState, StateEvent};
use super::transport::{SignalingTransport, TransportNotice};

#[derive(Debug, Clone)]
pub struct RoomClientOptions {
    pub room_id: String,
    pub peer_name: String,
    /// Whether this client sends media at all.
    pub produce: bool,
    /// Keep fresh video consumers locally paused.
    pub audio_only: bool,
}

struct ClientInner {
    state: ClientState,
    session: Option<Arc<dyn ClientSession>>,
    send_transport: Option<Arc<dyn TransportHandle>>,
    recv_transport: Option<Arc<dyn TransportHandle>>,
    mic_producer: Option<Arc<dyn ProducerHandle>>,
    webcam_producer: Option<Arc<dyn ProducerHandle>>,
    webcams: WebcamState,
}

pub struct RoomClient {
    opts: RoomClientOptions,
    transport: Arc<dyn SignalingTransport>,
    session_factory: Arc<dyn SessionFactory>,
    devices: Arc<dyn MediaDevices>,
    prefs: Arc<dyn DevicePreferences>,
    state_tx: mpsc::UnboundedSender<StateEvent>,
    inner: Mutex<ClientInner>,
    closed: AtomicBool,
}

/// Relays the session mirror's protocol traffic over the signaling
/// transport.
struct TransportSink {
    transport: Arc<dyn SignalingTransport>,
}

#[async_trait]
impl RequestSink for TransportSink {
    async fn request(&self, method: &str, data: Value) -> Result<Value> {
        self.transport.request(method, data).await
    }

    async fn notify(&self, method: &str, data: Value) -> Result<()> {
        self.transport.notify(method, data).await
    }
}

impl RoomClient {
    pub fn new(
        opts: RoomClientOptions,
        transport: Arc<dyn SignalingTransport>,
        session_factory: Arc<dyn SessionFactory>,
        devices: Arc<dyn MediaDevices>,
        prefs: Arc<dyn DevicePreferences>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<StateEvent>) {
        let (state_tx, state_rx) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            opts,
            transport,
            session_factory,
            devices,
            prefs,
            state_tx,
            inner: Mutex::new(ClientInner {
                state: ClientState::New,
                session: None,
                send_transport: None,
                recv_transport: None,
                mic_producer: None,
                webcam_producer: None,
                webcams: WebcamState::default(),
            }),
            closed: AtomicBool::new(false),
        });
        (client, state_rx)
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn state(&self) -> ClientState {
        self.inner.lock().await.state
    }

    /// Starts the transport notice loop and performs the initial join.
    pub async fn start(self: &Arc<Self>) {
        let mut notices = self.transport.subscribe();
        let client = self.clone();
        tokio::spawn(async move {
            loop {
                match notices.recv().await {
                    Ok(TransportNotice::Notification { method, data }) => {
                        let session = client.inner.lock().await.session.clone();
                        if let Some(session) = session {
                            if let Err(e) = session.receive_notification(&method, &data).await {
                                warn!("notification rejected [method:{}]: {}", method, e);
                            }
                        }
                    }
                    Ok(TransportNotice::Open) => {
                        // Reconnect: full rejoin with a fresh mirror.
                        client.join_room().await;
                    }
                    Ok(TransportNotice::Closed) => {
                        if client.closed() {
                            break;
                        }
                        warn!("signaling transport lost, awaiting reconnect");
                        client.set_state(ClientState::Connecting).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.join_room().await;
    }

    pub async fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("close()");

        let session = {
            let mut inner = self.inner.lock().await;
            inner.state = ClientState::Closed;
            inner.session.take()
        };
        if let Some(session) = session {
            session.leave().await;
        }
        self.dispatch(StateEvent::RoomState(ClientState::Closed));

        // Give the mirror a moment to flush its leave notification.
        tokio::time::sleep(Duration::from_millis(250)).await;
        self.transport.close().await;
    }

    pub async fn mute_mic(&self) {
        debug!("mute_mic()");
        let producer = self.inner.lock().await.mic_producer.clone();
        if let Some(producer) = producer {
            producer.pause().await;
        }
    }

    pub async fn unmute_mic(&self) {
        debug!("unmute_mic()");
        let producer = self.inner.lock().await.mic_producer.clone();
        if let Some(producer) = producer {
            producer.resume().await;
        }
    }

    pub async fn enable_webcam(self: &Arc<Self>) {
        debug!("enable_webcam()");
        self.prefs.set_webcam_enabled(true);
        self.dispatch(StateEvent::WebcamInProgress(true));

        let result = {
            match self.update_webcams().await {
                Ok(()) => self.set_webcam_producer().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = result {
            error!("enable_webcam() failed: {}", e);
        }
        self.dispatch(StateEvent::WebcamInProgress(false));
    }

    pub async fn disable_webcam(self: &Arc<Self>) {
        debug!("disable_webcam()");
        self.prefs.set_webcam_enabled(false);

        let producer = self.inner.lock().await.webcam_producer.clone();
        match producer {
            Some(producer) => producer.close().await,
            None => error!("disable_webcam() failed: no webcam producer"),
        }
    }

    fn dispatch(&self, event: StateEvent) {
        let _ = self.state_tx.send(event);
    }

    async fn set_state(&self, state: ClientState) {
        self.inner.lock().await.state = state;
        self.dispatch(StateEvent::RoomState(state));
    }

    async fn session(&self) -> Option<Arc<dyn ClientSession>> {
        self.inner.lock().await.session.clone()
    }

    async fn join_room(self: &Arc<Self>) {
        if self.closed() {
            return;
        }
        debug!("join_room()");
        self.set_state(ClientState::Connecting).await;

        // A fresh mirror per (re)join; the previous one is torn down
        // first so no subscriptions survive into the new session.
        let session = self.session_factory.create_session();
        {
            let mut inner = self.inner.lock().await;
            let old = inner.session.take();
            inner.session = Some(session.clone());
            inner.send_transport = None;
            inner.recv_transport = None;
            inner.mic_producer = None;
            inner.webcam_producer = None;
            drop(inner);
            if let Some(old) = old {
                old.leave().await;
            }
        }
        self.watch_session(&session);

        if let Err(e) = self.try_join(&session).await {
            error!("join_room() failed: {}", e);
            self.close().await;
        }
    }

    /// The join sequence proper. Every step depends on the previous one;
    /// only the mic/webcam attempts are allowed to fail on their own.
    async fn try_join(self: &Arc<Self>, session: &Arc<dyn ClientSession>) -> Result<()> {
        let sink: Arc<dyn RequestSink> = Arc::new(TransportSink {
            transport: self.transport.clone(),
        });
        session.join(&self.opts.peer_name, sink).await?;

        let recv_transport = session.create_transport(TransportDirection::Recv).await?;
        self.watch_transport(&recv_transport);
        self.inner.lock().await.recv_transport = Some(recv_transport);

        if self.opts.produce {
            let send_transport = session.create_transport(TransportDirection::Send).await?;
            self.watch_transport(&send_transport);
            self.inner.lock().await.send_transport = Some(send_transport);

            // Mic and webcam attempts are independent; neither is fatal.
            let mic = async {
                if session.can_send(MediaKind::Audio) {
                    if let Err(e) = self.set_mic_producer().await {
                        error!("set_mic_producer() failed: {}", e);
                    }
                }
            };
            let webcam = async {
                if session.can_send(MediaKind::Video)
                    && self.prefs.webcam_enabled().unwrap_or(true)
                {
                    self.enable_webcam().await;
                }
            };
            tokio::join!(mic, webcam);
        }

        // Peers already present are registered without the join
        // notification so their arrival is not replayed.
        for peer in session.peers() {
            self.handle_peer(&peer, false).await;
        }

        self.set_state(ClientState::Connected).await;
        Ok(())
    }

    fn watch_session(self: &Arc<Self>, session: &Arc<dyn ClientSession>) {
        let mut events = session.subscribe();
        let client = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::NewPeer(peer)) => client.handle_peer(&peer, true).await,
                    Ok(SessionEvent::Closed { originator }) => {
                        if originator == Originator::Remote {
                            warn!("session remotely closed");
                        }
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn watch_transport(&self, transport: &Arc<dyn TransportHandle>) {
        let mut events = transport.subscribe();
        let id = transport.id().to_string();
        let direction = transport.direction();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let TransportEvent::Closed { originator } = event;
                debug!(
                    "transport \"close\" event [id:{}, direction:{:?}, originator:{:?}]",
                    id, direction, originator
                );
            }
        });
    }

    pub async fn set_mic_producer(self: &Arc<Self>) -> Result<()> {
        let session = self
            .session()
            .await
            .ok_or_else(|| Error::Media("not joined".to_string()))?;

        if !session.can_send(MediaKind::Audio) {
            return Err(Error::Media("cannot send audio".to_string()));
        }
        if self.inner.lock().await.mic_producer.is_some() {
            return Err(Error::Media("mic producer already exists".to_string()));
        }

        debug!("set_mic_producer() | acquiring audio track");
        let track = self.devices.get_user_media(MediaKind::Audio, None).await?;
        let producer = session.create_producer(track, MediaSource::Mic).await?;

        if let Err(e) = self.send_producer(&producer).await {
            producer.close().await;
            return Err(e);
        }

        self.inner.lock().await.mic_producer = Some(producer.clone());
        self.dispatch(StateEvent::AddProducer(ProducerState {
            id: producer.id().to_string(),
            source: MediaSource::Mic,
            device_label: None,
            device_type: None,
            paused: PauseState {
                locally_paused: producer.locally_paused(),
                remotely_paused: producer.remotely_paused(),
            },
            codec: producer.codec(),
            track: producer.track(),
        }));
        self.watch_producer(&producer);
        debug!("set_mic_producer() succeeded");
        Ok(())
    }

    pub async fn set_webcam_producer(self: &Arc<Self>) -> Result<()> {
        let session = self
            .session()
            .await
            .ok_or_else(|| Error::Media("not joined".to_string()))?;

        if !session.can_send(MediaKind::Video) {
            return Err(Error::Media("cannot send video".to_string()));
        }
        if self.inner.lock().await.webcam_producer.is_some() {
            return Err(Error::Media("webcam producer already exists".to_string()));
        }

        let device = self
            .inner
            .lock()
            .await
            .webcams
            .selected()
            .cloned()
            .ok_or_else(|| Error::Media("no webcam devices".to_string()))?;

        debug!("set_webcam_producer() | acquiring video track [device:{}]", device.label);
        let track = self
            .devices
            .get_user_media(MediaKind::Video, Some(&device.device_id))
            .await?;
        let producer = session.create_producer(track, MediaSource::Webcam).await?;

        if let Err(e) = self.send_producer(&producer).await {
            producer.close().await;
            return Err(e);
        }

        self.inner.lock().await.webcam_producer = Some(producer.clone());
        self.dispatch(StateEvent::AddProducer(ProducerState {
            id: producer.id().to_string(),
            source: MediaSource::Webcam,
            device_label: Some(device.label.clone()),
            device_type: Some(WebcamType::from_label(&device.label)),
            paused: PauseState {
                locally_paused: producer.locally_paused(),
                remotely_paused: producer.remotely_paused(),
            },
            codec: producer.codec(),
            track: producer.track(),
        }));
        self.watch_producer(&producer);
        debug!("set_webcam_producer() succeeded");
        Ok(())
    }

    async fn send_producer(&self, producer: &Arc<dyn ProducerHandle>) -> Result<()> {
        let send_transport = self
            .inner
            .lock()
            .await
            .send_transport
            .clone()
            .ok_or_else(|| Error::Media("no send transport".to_string()))?;
        producer.send(&send_transport).await
    }

    async fn update_webcams(&self) -> Result<()> {
        debug!("update_webcams()");
        let devices = self.devices.enumerate_video_inputs().await?;
        let can_change = {
            let mut inner = self.inner.lock().await;
            inner.webcams.update(devices);
            inner.webcams.can_change()
        };
        self.dispatch(StateEvent::CanChangeWebcam(can_change));
        Ok(())
    }

    fn watch_producer(self: &Arc<Self>, producer: &Arc<dyn ProducerHandle>) {
        let mut events = producer.subscribe();
        let client = self.clone();
        let id = producer.id().to_string();
        let source = producer.source();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ProducerEvent::Closed { originator }) => {
                        debug!(
                            "producer \"close\" event [source:{:?}, originator:{:?}]",
                            source, originator
                        );
                        let mut inner = client.inner.lock().await;
                        let slot = match source {
                            MediaSource::Mic => &mut inner.mic_producer,
                            MediaSource::Webcam => &mut inner.webcam_producer,
                        };
                        if slot.as_ref().map(|p| p.id() == id).unwrap_or(false) {
                            *slot = None;
                        }
                        drop(inner);
                        client.dispatch(StateEvent::RemoveProducer { id: id.clone() });
                        break;
                    }
                    Ok(ProducerEvent::Paused { originator }) => {
                        client.dispatch(StateEvent::ProducerPaused {
                            id: id.clone(),
                            originator,
                        });
                    }
                    Ok(ProducerEvent::Resumed { originator }) => {
                        client.dispatch(StateEvent::ProducerResumed {
                            id: id.clone(),
                            originator,
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn handle_peer(self: &Arc<Self>, peer: &Arc<dyn PeerHandle>, notify: bool) {
        let mut events = peer.subscribe();
        self.dispatch(StateEvent::AddPeer {
            name: peer.name().to_string(),
            notify,
        });

        for consumer in peer.consumers() {
            self.handle_consumer(&consumer).await;
        }

        let client = self.clone();
        let name = peer.name().to_string();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(PeerEvent::Closed { originator }) => {
                        debug!(
                            "peer \"close\" event [name:{}, originator:{:?}]",
                            name, originator
                        );
                        client.dispatch(StateEvent::RemovePeer { name: name.clone() });
                        break;
                    }
                    Ok(PeerEvent::NewConsumer(consumer)) => {
                        client.handle_consumer(&consumer).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn handle_consumer(self: &Arc<Self>, consumer: &Arc<dyn ConsumerHandle>) {
        let mut events = consumer.subscribe();
        let id = consumer.id().to_string();
        let peer_name = consumer.peer_name().to_string();

        self.dispatch(StateEvent::AddConsumer(ConsumerState {
            id: id.clone(),
            peer_name: peer_name.clone(),
            source: consumer.source(),
            supported: consumer.supported(),
            paused: PauseState {
                locally_paused: consumer.locally_paused(),
                remotely_paused: consumer.remotely_paused(),
            },
            profile: crate::types::EffectiveProfile::None,
            codec: consumer.codec(),
            track: None,
        }));

        // The audio-only preference keeps fresh video consumers locally
        // paused before any media is requested for them.
        if self.opts.audio_only
            && consumer.source().kind() == MediaKind::Video
            && !consumer.locally_paused()
        {
            consumer.pause().await;
        }

        let client = self.clone();
        let event_id = id.clone();
        let event_peer = peer_name.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConsumerEvent::Closed { originator }) => {
                        debug!(
                            "consumer \"close\" event [id:{}, originator:{:?}]",
                            event_id, originator
                        );
                        client.dispatch(StateEvent::RemoveConsumer {
                            id: event_id.clone(),
                            peer_name: event_peer.clone(),
                        });
                        break;
                    }
                    Ok(ConsumerEvent::Paused { originator }) => {
                        client.dispatch(StateEvent::ConsumerPaused {
                            id: event_id.clone(),
                            originator,
                        });
                    }
                    Ok(ConsumerEvent::Resumed { originator }) => {
                        client.dispatch(StateEvent::ConsumerResumed {
                            id: event_id.clone(),
                            originator,
                        });
                    }
                    Ok(ConsumerEvent::ProfileChanged { profile }) => {
                        client.dispatch(StateEvent::ConsumerProfile {
                            id: event_id.clone(),
                            profile,
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        // Unsupported consumers are recorded but never receive media.
        if !consumer.supported() {
            return;
        }

        let recv_transport = self.inner.lock().await.recv_transport.clone();
        match recv_transport {
            Some(transport) => match consumer.receive(&transport).await {
                Ok(track) => self.dispatch(StateEvent::ConsumerTrack { id, track }),
                Err(e) => {
                    error!("unexpected error while receiving a new consumer: {}", e)
                }
            },
            None => warn!("no receiving transport for consumer [id:{}]", id),
        }
    }
}
