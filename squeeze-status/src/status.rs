//! Normalized player status snapshot.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transport state reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackMode {
    Play,
    Pause,
    #[default]
    Stop,
}

impl PlaybackMode {
    /// Parse the server's `mode` field. Anything unknown counts as stopped.
    pub fn from_server(mode: &str) -> Self {
        match mode {
            "play" => PlaybackMode::Play,
            "pause" => PlaybackMode::Pause,
            _ => PlaybackMode::Stop,
        }
    }
}

/// What a player is doing at one point in time.
///
/// A new snapshot is built for every update; consumers compare
/// [`timestamp`](Self::timestamp) to decide whether what they show is stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerStatus {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub cover_url: Option<String>,
    pub duration_ms: u64,
    pub position_ms: u64,
    pub is_playing: bool,
    pub mode: PlaybackMode,
    /// Mixer volume, 0-100, when reported
    pub volume: Option<u8>,
    /// Playing a remote stream such as internet radio
    pub remote: bool,
}

impl PlayerStatus {
    /// Time since the snapshot was taken.
    pub fn age(&self) -> Duration {
        self.age_at(Utc::now())
    }

    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.timestamp).to_std().unwrap_or_default()
    }

    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.is_stale_at(Utc::now(), max_age)
    }

    pub fn is_stale_at(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.age_at(now) > max_age
    }

    /// Playback position extrapolated to `now` while playing.
    pub fn position_at(&self, now: DateTime<Utc>) -> u64 {
        if !self.is_playing {
            return self.position_ms;
        }
        let elapsed = self.age_at(now).as_millis() as u64;
        let position = self.position_ms.saturating_add(elapsed);
        if self.duration_ms > 0 {
            position.min(self.duration_ms)
        } else {
            position
        }
    }
}
