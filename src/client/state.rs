//! Observable application state for the UI collaborator.
//!
//! The controller emits [`StateEvent`]s; [`AppState`] is the reducer that
//! projects them into a queryable snapshot. The UI may consume either.

use crate::types::{EffectiveProfile, MediaSource, Originator, PauseState};
use std::collections::HashMap;

use super::devices::WebcamType;
use super::session::MediaTrack;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    New,
    Connecting,
    Connected,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ProducerState {
    pub id: String,
    pub source: MediaSource,
    pub device_label: Option<String>,
    pub device_type: Option<WebcamType>,
    pub paused: PauseState,
    pub codec: String,
    pub track: MediaTrack,
}

#[derive(Debug, Clone)]
pub struct ConsumerState {
    pub id: String,
    pub peer_name: String,
    pub source: MediaSource,
    pub supported: bool,
    pub paused: PauseState,
    pub profile: EffectiveProfile,
    pub codec: Option<String>,
    pub track: Option<MediaTrack>,
}

#[derive(Debug, Clone)]
pub enum StateEvent {
    RoomState(ClientState),
    /// `notify` is false for peers that were already in the room at join
    /// time, so the UI does not replay "peer joined" side effects.
    AddPeer {
        name: String,
        notify: bool,
    },
    RemovePeer {
        name: String,
    },
    AddProducer(ProducerState),
    RemoveProducer {
        id: String,
    },
    ProducerPaused {
        id: String,
        originator: Originator,
    },
    ProducerResumed {
        id: String,
        originator: Originator,
    },
    AddConsumer(ConsumerState),
    RemoveConsumer {
        id: String,
        peer_name: String,
    },
    ConsumerPaused {
        id: String,
        originator: Originator,
    },
    ConsumerResumed {
        id: String,
        originator: Originator,
    },
    ConsumerProfile {
        id: String,
        profile: EffectiveProfile,
    },
    ConsumerTrack {
        id: String,
        track: MediaTrack,
    },
    CanChangeWebcam(bool),
    WebcamInProgress(bool),
}

#[derive(Debug, Default, Clone)]
pub struct PeerState {
    pub consumers: Vec<String>,
}

#[derive(Debug)]
pub struct AppState {
    pub room_state: ClientState,
    pub can_change_webcam: bool,
    pub webcam_in_progress: bool,
    pub peers: HashMap<String, PeerState>,
    pub producers: HashMap<String, ProducerState>,
    pub consumers: HashMap<String, ConsumerState>,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            room_state: ClientState::New,
            can_change_webcam: false,
            webcam_in_progress: false,
            peers: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }
}

impl AppState {
    pub fn apply(&mut self, event: StateEvent) {
        match event {
            StateEvent::RoomState(state) => self.room_state = state,
            StateEvent::AddPeer { name, .. } => {
                self.peers.entry(name).or_default();
            }
            StateEvent::RemovePeer { name } => {
                if let Some(peer) = self.peers.remove(&name) {
                    for consumer_id in peer.consumers {
                        self.consumers.remove(&consumer_id);
                    }
                }
            }
            StateEvent::AddProducer(producer) => {
                self.producers.insert(producer.id.clone(), producer);
            }
            StateEvent::RemoveProducer { id } => {
                self.producers.remove(&id);
            }
            StateEvent::ProducerPaused { id, originator } => {
                if let Some(producer) = self.producers.get_mut(&id) {
                    producer.paused.set_paused(originator, true);
                }
            }
            StateEvent::ProducerResumed { id, originator } => {
                if let Some(producer) = self.producers.get_mut(&id) {
                    producer.paused.set_paused(originator, false);
                }
            }
            StateEvent::AddConsumer(consumer) => {
                // A consumer always references a currently known peer.
                match self.peers.get_mut(&consumer.peer_name) {
                    Some(peer) => {
                        if !peer.consumers.contains(&consumer.id) {
                            peer.consumers.push(consumer.id.clone());
                        }
                        self.consumers.insert(consumer.id.clone(), consumer);
                    }
                    None => {}
                }
            }
            StateEvent::RemoveConsumer { id, peer_name } => {
                self.consumers.remove(&id);
                if let Some(peer) = self.peers.get_mut(&peer_name) {
                    peer.consumers.retain(|c| c != &id);
                }
            }
            StateEvent::ConsumerPaused { id, originator } => {
                if let Some(consumer) = self.consumers.get_mut(&id) {
                    consumer.paused.set_paused(originator, true);
                }
            }
            StateEvent::ConsumerResumed { id, originator } => {
                if let Some(consumer) = self.consumers.get_mut(&id) {
                    consumer.paused.set_paused(originator, false);
                }
            }
            StateEvent::ConsumerProfile { id, profile } => {
                if let Some(consumer) = self.consumers.get_mut(&id) {
                    consumer.profile = profile;
                }
            }
            StateEvent::ConsumerTrack { id, track } => {
                if let Some(consumer) = self.consumers.get_mut(&id) {
                    consumer.track = Some(track);
                }
            }
            StateEvent::CanChangeWebcam(flag) => self.can_change_webcam = flag,
            StateEvent::WebcamInProgress(flag) => self.webcam_in_progress = flag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MediaKind;

    fn consumer(id: &str, peer_name: &str) -> ConsumerState {
        ConsumerState {
            id: id.to_string(),
            peer_name: peer_name.to_string(),
            source: MediaSource::Webcam,
            supported: true,
            paused: PauseState::default(),
            profile: EffectiveProfile::None,
            codec: Some("VP8".to_string()),
            track: None,
        }
    }

    #[test]
    fn consumer_requires_known_peer() {
        let mut state = AppState::default();
        state.apply(StateEvent::AddConsumer(consumer("c1", "ghost")));
        assert!(state.consumers.is_empty());

        state.apply(StateEvent::AddPeer {
            name: "alice".to_string(),
            notify: true,
        });
        state.apply(StateEvent::AddConsumer(consumer("c1", "alice")));
        assert_eq!(state.consumers.len(), 1);
        assert_eq!(state.peers["alice"].consumers, vec!["c1".to_string()]);
    }

    #[test]
    fn removing_peer_removes_its_consumers() {
        let mut state = AppState::default();
        state.apply(StateEvent::AddPeer {
            name: "alice".to_string(),
            notify: true,
        });
        state.apply(StateEvent::AddConsumer(consumer("c1", "alice")));
        state.apply(StateEvent::RemovePeer {
            name: "alice".to_string(),
        });
        assert!(state.peers.is_empty());
        assert!(state.consumers.is_empty());
    }

    #[test]
    fn pause_events_touch_only_their_flag() {
        let mut state = AppState::default();
        state.apply(StateEvent::AddPeer {
            name: "alice".to_string(),
            notify: true,
        });
        state.apply(StateEvent::AddConsumer(consumer("c1", "alice")));

        state.apply(StateEvent::ConsumerPaused {
            id: "c1".to_string(),
            originator: Originator::Remote,
        });
        let paused = state.consumers["c1"].paused;
        assert!(paused.remotely_paused);
        assert!(!paused.locally_paused);
        assert!(!paused.is_active());

        state.apply(StateEvent::ConsumerResumed {
            id: "c1".to_string(),
            originator: Originator::Remote,
        });
        assert!(state.consumers["c1"].paused.is_active());
    }

    #[test]
    fn producer_pause_tracks_originator() {
        let mut state = AppState::default();
        state.apply(StateEvent::AddProducer(ProducerState {
            id: "p1".to_string(),
            source: MediaSource::Mic,
            device_label: None,
            device_type: None,
            paused: PauseState::default(),
            codec: "opus".to_string(),
            track: MediaTrack {
                id: "t1".to_string(),
                kind: MediaKind::Audio,
            },
        }));

        state.apply(StateEvent::ProducerPaused {
            id: "p1".to_string(),
            originator: Originator::Local,
        });
        assert!(state.producers["p1"].paused.locally_paused);
        assert!(!state.producers["p1"].paused.remotely_paused);
    }
}
