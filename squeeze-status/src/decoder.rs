//! Decoding of raw player status payloads.
//!
//! The same payload shape arrives as a status push and as the result of a
//! one-shot `status` control request. Numeric fields are sometimes sent as
//! strings, so every number is read leniently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::artwork::ArtworkResolver;
use crate::error::{Result, StatusError};
use crate::status::{PlaybackMode, PlayerStatus};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawStatus {
    mode: Option<String>,
    #[serde(deserialize_with = "lenient_f64")]
    time: Option<f64>,
    #[serde(rename = "mixer volume", deserialize_with = "lenient_f64")]
    volume: Option<f64>,
    #[serde(deserialize_with = "lenient_f64")]
    remote: Option<f64>,
    current_title: Option<String>,
    playlist_loop: Vec<RawTrack>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawTrack {
    title: Option<String>,
    artist: Option<String>,
    album: Option<String>,
    remote_title: Option<String>,
    #[serde(deserialize_with = "lenient_f64")]
    duration: Option<f64>,
    artwork_url: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    coverid: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    artwork_track_id: Option<String>,
}

fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<f64>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Seconds (possibly fractional) to whole milliseconds.
fn seconds_to_ms(seconds: Option<f64>) -> u64 {
    match seconds {
        Some(s) if s.is_finite() && s > 0.0 => (s * 1000.0).round() as u64,
        _ => 0,
    }
}

/// Pick the title to display.
///
/// A remote stream's title wins only when present and either it is not a
/// URL or the track has no title of its own.
pub fn choose_title(track_title: &str, remote_title: Option<&str>) -> String {
    match remote_title.map(str::trim).filter(|r| !r.is_empty()) {
        Some(remote) if !looks_like_url(remote) || track_title.is_empty() => remote.to_string(),
        _ => track_title.to_string(),
    }
}

fn looks_like_url(text: &str) -> bool {
    url::Url::parse(text).is_ok_and(|url| url.has_host())
}

/// Turns raw status payloads into [`PlayerStatus`] snapshots.
#[derive(Debug, Clone)]
pub struct StatusDecoder {
    artwork: ArtworkResolver,
}

impl StatusDecoder {
    pub fn new(artwork: ArtworkResolver) -> Self {
        Self { artwork }
    }

    /// Decode a payload for `player_id`, timestamped now.
    pub fn decode(&self, player_id: &str, payload: &Value) -> Result<PlayerStatus> {
        self.decode_at(player_id, payload, Utc::now())
    }

    pub fn decode_at(&self, player_id: &str, payload: &Value, timestamp: DateTime<Utc>) -> Result<PlayerStatus> {
        if !payload.is_object() {
            return Err(StatusError::NotAnObject);
        }
        let raw = RawStatus::deserialize(payload)?;
        let track = raw.playlist_loop.into_iter().next().unwrap_or_default();

        let mode = raw
            .mode
            .as_deref()
            .map(PlaybackMode::from_server)
            .unwrap_or_default();
        let position_ms = match mode {
            PlaybackMode::Stop => 0,
            _ => seconds_to_ms(raw.time),
        };

        let track_title = track.title.unwrap_or_default();
        let remote_title = track.remote_title.or(raw.current_title);
        let title = choose_title(&track_title, remote_title.as_deref());

        let cover_url = track
            .artwork_url
            .or(track.coverid)
            .or(track.artwork_track_id)
            .and_then(|artwork| self.artwork.resolve(&artwork));

        let status = PlayerStatus {
            id: player_id.to_string(),
            timestamp,
            title,
            artist: track.artist.unwrap_or_default(),
            album: track.album.unwrap_or_default(),
            cover_url,
            duration_ms: seconds_to_ms(track.duration),
            position_ms,
            is_playing: mode == PlaybackMode::Play,
            mode,
            volume: raw.volume.map(|v| v.abs().clamp(0.0, 100.0).round() as u8),
            remote: raw.remote.is_some_and(|r| r != 0.0),
        };

        tracing::trace!(player = player_id, mode = ?status.mode, position_ms, "decoded status");
        Ok(status)
    }
}
