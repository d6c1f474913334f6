//! Audio, video and subtitle track descriptions.

use serde::{Deserialize, Serialize};

/// Kind of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackType {
    Audio,
    Video,
    Subtitle,
}

/// One track a session can play.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub id: String,
    pub track_type: TrackType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub video_width: u32,
    #[serde(default)]
    pub video_height: u32,
    #[serde(default)]
    pub video_frame_rate: f32,
    #[serde(default)]
    pub audio_channel_count: u32,
}

impl TrackInfo {
    pub fn new(track_type: TrackType, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            track_type,
            language: None,
            video_width: 0,
            video_height: 0,
            video_frame_rate: 0.0,
            audio_channel_count: 0,
        }
    }

    pub fn video(id: impl Into<String>, width: u32, height: u32) -> Self {
        let mut track = Self::new(TrackType::Video, id);
        track.video_width = width;
        track.video_height = height;
        track
    }

    pub fn audio(id: impl Into<String>, channels: u32) -> Self {
        let mut track = Self::new(TrackType::Audio, id);
        track.audio_channel_count = channels;
        track
    }

    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Video size, for video tracks.
    pub fn video_size(&self) -> Option<(u32, u32)> {
        (self.track_type == TrackType::Video).then_some((self.video_width, self.video_height))
    }
}
