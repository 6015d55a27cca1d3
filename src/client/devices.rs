//! Webcam device enumeration and selection.

use crate::types::MediaKind;
use crate::utils::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;

use super::session::MediaTrack;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub label: String,
}

/// Capture layer collaborator: device listing and track acquisition.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn enumerate_video_inputs(&self) -> Result<Vec<DeviceInfo>>;
    async fn get_user_media(&self, kind: MediaKind, device_id: Option<&str>)
        -> Result<MediaTrack>;
}

/// Persisted device preferences collaborator (cookie/local storage).
pub trait DevicePreferences: Send + Sync {
    fn webcam_enabled(&self) -> Option<bool>;
    fn set_webcam_enabled(&self, enabled: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WebcamType {
    Front,
    Back,
}

impl WebcamType {
    /// Device type is guessed from the human-readable label; there is no
    /// reliable capability flag for it.
    pub fn from_label(label: &str) -> Self {
        let label = label.to_lowercase();
        if label.contains("back") || label.contains("rear") {
            WebcamType::Back
        } else {
            WebcamType::Front
        }
    }
}

/// Enumerated video inputs keyed by device id, plus the current choice.
/// When the chosen device disappears the first available one is selected.
#[derive(Debug, Default)]
pub struct WebcamState {
    devices: HashMap<String, DeviceInfo>,
    order: Vec<String>,
    selected: Option<DeviceInfo>,
}

impl WebcamState {
    pub fn update(&mut self, devices: Vec<DeviceInfo>) {
        self.devices.clear();
        self.order.clear();
        for device in devices {
            self.order.push(device.device_id.clone());
            self.devices.insert(device.device_id.clone(), device);
        }

        let current_id = self.selected.as_ref().map(|d| d.device_id.clone());
        if self.devices.is_empty() {
            self.selected = None;
        } else if !current_id
            .map(|id| self.devices.contains_key(&id))
            .unwrap_or(false)
        {
            let first = &self.order[0];
            self.selected = self.devices.get(first).cloned();
        }
    }

    pub fn selected(&self) -> Option<&DeviceInfo> {
        self.selected.as_ref()
    }

    pub fn can_change(&self) -> bool {
        self.devices.len() >= 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str, label: &str) -> DeviceInfo {
        DeviceInfo {
            device_id: id.to_string(),
            label: label.to_string(),
        }
    }

    #[test]
    fn webcam_type_from_label() {
        assert_eq!(WebcamType::from_label("Back Camera"), WebcamType::Back);
        assert_eq!(WebcamType::from_label("REAR facing cam"), WebcamType::Back);
        assert_eq!(WebcamType::from_label("FaceTime HD Camera"), WebcamType::Front);
        assert_eq!(WebcamType::from_label(""), WebcamType::Front);
    }

    #[test]
    fn selects_first_device_when_none_chosen() {
        let mut state = WebcamState::default();
        state.update(vec![device("a", "cam a"), device("b", "cam b")]);
        assert_eq!(state.selected().unwrap().device_id, "a");
        assert!(state.can_change());
    }

    #[test]
    fn keeps_selection_while_device_present() {
        let mut state = WebcamState::default();
        state.update(vec![device("a", "cam a"), device("b", "cam b")]);
        state.update(vec![device("b", "cam b"), device("a", "cam a")]);
        assert_eq!(state.selected().unwrap().device_id, "a");
    }

    #[test]
    fn falls_back_when_selected_device_disappears() {
        let mut state = WebcamState::default();
        state.update(vec![device("a", "cam a"), device("b", "cam b")]);
        state.update(vec![device("b", "cam b")]);
        assert_eq!(state.selected().unwrap().device_id, "b");
        assert!(!state.can_change());
    }

    #[test]
    fn clears_selection_without_devices() {
        let mut state = WebcamState::default();
        state.update(vec![device("a", "cam a")]);
        state.update(vec![]);
        assert!(state.selected().is_none());
        assert!(!state.can_change());
    }
}
