//! REST wire models for the per-player endpoints.

use serde::{Deserialize, Serialize};

use crate::common::types::GuildId;

/// Player connection state carried by `playerUpdate` frames and REST reads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    /// Unix timestamp in milliseconds.
    pub time: u64,
    /// Playback position in milliseconds.
    pub position: u64,
    /// Whether the worker holds a live voice connection.
    pub connected: bool,
    /// Voice gateway ping in milliseconds. -1 if not connected.
    pub ping: i64,
}

/// Voice credentials pushed to a worker.
///
/// `resume`/`sequence` ride along on resume attempts only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceState {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

/// `encodedTrack` field in a player update: null clears, omit keeps current.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackEncoded {
    /// JSON: null
    Clear,
    /// JSON: string
    Set(String),
}

impl Serialize for TrackEncoded {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Clear => serializer.serialize_none(),
            Self::Set(s) => serializer.serialize_str(s),
        }
    }
}

/// Track field in a player update request.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlayerTrack {
    /// Base64-encoded track. Null to stop. Omit to keep current.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoded: Option<TrackEncoded>,
    /// Track identifier to resolve. Mutually exclusive with `encoded`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    /// User data to attach to the track.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<serde_json::Value>,
}

/// Request body for PATCH /v4/sessions/{sessionId}/players/{guildId}.
///
/// Every field is optional; absent fields leave the remote value untouched,
/// which is what makes per-player update coalescing safe.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlayer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoded_track: Option<TrackEncoded>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<UpdatePlayerTrack>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    /// Filter parameters, passed through as-is.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceState>,
}

impl UpdatePlayer {
    pub fn is_empty(&self) -> bool {
        self.encoded_track.is_none()
            && self.track.is_none()
            && self.position.is_none()
            && self.end_time.is_none()
            && self.volume.is_none()
            && self.paused.is_none()
            && self.filters.is_none()
            && self.voice.is_none()
    }

    /// Merge `other` over `self`, later fields winning.
    pub fn merge(&mut self, other: UpdatePlayer) {
        if other.encoded_track.is_some() {
            self.encoded_track = other.encoded_track;
        }
        if other.track.is_some() {
            self.track = other.track;
        }
        if other.position.is_some() {
            self.position = other.position;
        }
        if other.end_time.is_some() {
            self.end_time = other.end_time;
        }
        if other.volume.is_some() {
            self.volume = other.volume;
        }
        if other.paused.is_some() {
            self.paused = other.paused;
        }
        if other.filters.is_some() {
            self.filters = other.filters;
        }
        if other.voice.is_some() {
            self.voice = other.voice;
        }
    }

    /// Fields whose remote effect must be observed before the caller resumes.
    pub fn requires_immediate_flush(&self) -> bool {
        self.encoded_track.is_some()
            || self.track.is_some()
            || self.paused.is_some()
            || self.position.is_some()
    }
}

/// Full remote player as returned by the worker REST endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePlayer {
    pub guild_id: GuildId,
    pub track: Option<crate::protocol::tracks::TrackData>,
    pub volume: i32,
    pub paused: bool,
    pub state: PlayerState,
    #[serde(default)]
    pub voice: serde_json::Value,
    #[serde(default)]
    pub filters: serde_json::Value,
}

/// `GET /sessions/{id}/players` response body.
#[derive(Debug, Deserialize)]
pub struct RemotePlayers {
    pub players: Vec<RemotePlayer>,
}

/// Lyrics object returned by the lyrics endpoints and `Lyrics*` ops.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lyrics {
    #[serde(default)]
    pub source_name: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub lines: Vec<LyricsLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LyricsLine {
    pub text: String,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub duration: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_track_null_vs_absent() {
        let mut update = UpdatePlayer::default();
        assert_eq!(serde_json::to_string(&update).unwrap(), "{}");

        update.encoded_track = Some(TrackEncoded::Clear);
        assert_eq!(
            serde_json::to_string(&update).unwrap(),
            r#"{"encodedTrack":null}"#
        );

        update.encoded_track = Some(TrackEncoded::Set("E1".into()));
        assert_eq!(
            serde_json::to_string(&update).unwrap(),
            r#"{"encodedTrack":"E1"}"#
        );
    }

    #[test]
    fn test_voice_state_serialization() {
        let voice = VoiceState {
            token: "T1".into(),
            endpoint: "c-iad01-x".into(),
            session_id: "S1".into(),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_string(&voice).unwrap(),
            r#"{"token":"T1","endpoint":"c-iad01-x","sessionId":"S1"}"#
        );
    }

    #[test]
    fn test_voice_state_resume_fields() {
        let voice = VoiceState {
            token: "T1".into(),
            endpoint: "e".into(),
            session_id: "S1".into(),
            resume: Some(true),
            sequence: Some(0),
            ..Default::default()
        };
        let json = serde_json::to_string(&voice).unwrap();
        assert!(json.contains(r#""resume":true"#));
        assert!(json.contains(r#""sequence":0"#));
    }

    #[test]
    fn test_merge_later_fields_win() {
        let mut base = UpdatePlayer {
            volume: Some(80),
            position: Some(100),
            ..Default::default()
        };
        base.merge(UpdatePlayer {
            volume: Some(100),
            paused: Some(true),
            ..Default::default()
        });
        assert_eq!(base.volume, Some(100));
        assert_eq!(base.position, Some(100));
        assert_eq!(base.paused, Some(true));
    }
}
