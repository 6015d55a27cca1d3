use serde::{Deserialize, Serialize};

/// Direction of a media transport as negotiated with the media engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Where a producer's media comes from on the sending peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaSource {
    Mic,
    Webcam,
}

impl MediaSource {
    pub fn kind(&self) -> MediaKind {
        match self {
            MediaSource::Mic => MediaKind::Audio,
            MediaSource::Webcam => MediaKind::Video,
        }
    }
}

/// Which side of the engine boundary caused a lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Originator {
    Local,
    Remote,
}

/// Quality profile currently delivered on a consumer. `None` means the
/// profile has not been negotiated yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectiveProfile {
    None,
    Low,
    Medium,
    High,
    Default,
}

/// Dual pause flags kept per producer/consumer. The entity is audible or
/// visible only while both flags are false.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PauseState {
    pub locally_paused: bool,
    pub remotely_paused: bool,
}

impl PauseState {
    pub fn is_active(&self) -> bool {
        !self.locally_paused && !self.remotely_paused
    }

    pub fn set_paused(&mut self, originator: Originator, paused: bool) {
        match originator {
            Originator::Local => self.locally_paused = paused,
            Originator::Remote => self.remotely_paused = paused,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_flags_are_independent() {
        let mut pause = PauseState::default();
        assert!(pause.is_active());

        pause.set_paused(Originator::Local, true);
        assert!(pause.locally_paused);
        assert!(!pause.remotely_paused);
        assert!(!pause.is_active());

        pause.set_paused(Originator::Remote, true);
        pause.set_paused(Originator::Local, false);
        assert!(!pause.locally_paused);
        assert!(pause.remotely_paused);
        assert!(!pause.is_active());

        pause.set_paused(Originator::Remote, false);
        assert!(pause.is_active());
    }

    #[test]
    fn source_maps_to_kind() {
        assert_eq!(MediaSource::Mic.kind(), MediaKind::Audio);
        assert_eq!(MediaSource::Webcam.kind(), MediaKind::Video);
    }
}
