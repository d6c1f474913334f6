//! Track lists and selections as seen by a client session.

use std::collections::HashMap;

use tvim_core::{TrackInfo, TrackType};

/// Track bookkeeping of one session.
#[derive(Debug, Default)]
pub(crate) struct TrackState {
    tracks: Vec<TrackInfo>,
    selected: HashMap<TrackType, String>,
    /// Last video size reported to the client.
    video_size: Option<(u32, u32)>,
}

impl TrackState {
    pub(crate) fn update_tracks(&mut self, tracks: Vec<TrackInfo>) {
        self.tracks = tracks;
    }

    /// Returns false when the selection did not change.
    pub(crate) fn update_selection(&mut self, track_type: TrackType, track_id: Option<String>) -> bool {
        match track_id {
            Some(id) => self.selected.insert(track_type, id.clone()).as_ref() != Some(&id),
            None => self.selected.remove(&track_type).is_some(),
        }
    }

    pub(crate) fn tracks(&self, track_type: TrackType) -> Vec<TrackInfo> {
        self.tracks
            .iter()
            .filter(|t| t.track_type == track_type)
            .cloned()
            .collect()
    }

    pub(crate) fn selected(&self, track_type: TrackType) -> Option<String> {
        self.selected.get(&track_type).cloned()
    }

    /// The selected video track's size, if it differs from the last one
    /// reported. Records it as reported.
    pub(crate) fn video_size_to_notify(&mut self) -> Option<(u32, u32)> {
        let selected = self.selected.get(&TrackType::Video)?;
        let size = self
            .tracks
            .iter()
            .find(|t| t.track_type == TrackType::Video && &t.id == selected)
            .and_then(TrackInfo::video_size)?;
        if self.video_size == Some(size) {
            return None;
        }
        self.video_size = Some(size);
        Some(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_change_detection() {
        let mut state = TrackState::default();
        assert!(state.update_selection(TrackType::Audio, Some("a1".into())));
        assert!(!state.update_selection(TrackType::Audio, Some("a1".into())));
        assert!(state.update_selection(TrackType::Audio, Some("a2".into())));
        assert!(state.update_selection(TrackType::Audio, None));
        assert!(!state.update_selection(TrackType::Audio, None));
    }

    #[test]
    fn test_video_size_once_per_transition() {
        let mut state = TrackState::default();
        state.update_tracks(vec![
            TrackInfo::video("v1", 1920, 1080),
            TrackInfo::video("v2", 1280, 720),
            TrackInfo::audio("a1", 2),
        ]);
        assert_eq!(state.video_size_to_notify(), None);

        state.update_selection(TrackType::Video, Some("v1".into()));
        assert_eq!(state.video_size_to_notify(), Some((1920, 1080)));
        assert_eq!(state.video_size_to_notify(), None);

        state.update_selection(TrackType::Video, Some("v2".into()));
        assert_eq!(state.video_size_to_notify(), Some((1280, 720)));

        // Same size under a new track list is not a transition
        state.update_tracks(vec![TrackInfo::video("v2", 1280, 720)]);
        assert_eq!(state.video_size_to_notify(), None);
    }

    #[test]
    fn test_tracks_by_type() {
        let mut state = TrackState::default();
        state.update_tracks(vec![
            TrackInfo::video("v1", 640, 480),
            TrackInfo::audio("a1", 2),
            TrackInfo::audio("a2", 6),
        ]);
        assert_eq!(state.tracks(TrackType::Audio).len(), 2);
        assert!(state.tracks(TrackType::Subtitle).is_empty());
    }
}
