//! Player events delivered inside `op = "event"` frames.

use serde::Deserialize;

use crate::common::types::GuildId;

/// Events emitted by a worker for one player (op = "event").
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    #[serde(rename = "TrackStartEvent")]
    TrackStart {
        #[serde(rename = "guildId")]
        guild_id: GuildId,
        track: crate::protocol::tracks::TrackData,
    },

    #[serde(rename = "TrackEndEvent")]
    TrackEnd {
        #[serde(rename = "guildId")]
        guild_id: GuildId,
        track: crate::protocol::tracks::TrackData,
        reason: TrackEndReason,
    },

    #[serde(rename = "TrackExceptionEvent")]
    TrackException {
        #[serde(rename = "guildId")]
        guild_id: GuildId,
        track: crate::protocol::tracks::TrackData,
        exception: TrackException,
    },

    #[serde(rename = "TrackStuckEvent")]
    TrackStuck {
        #[serde(rename = "guildId")]
        guild_id: GuildId,
        track: crate::protocol::tracks::TrackData,
        #[serde(rename = "thresholdMs")]
        threshold_ms: u64,
    },

    /// Worker-side notification that the active track was swapped without a
    /// stop/start pair.
    #[serde(rename = "TrackChangeEvent")]
    TrackChange {
        #[serde(rename = "guildId")]
        guild_id: GuildId,
        track: crate::protocol::tracks::TrackData,
    },

    #[serde(rename = "WebSocketClosedEvent")]
    WebSocketClosed {
        #[serde(rename = "guildId")]
        guild_id: GuildId,
        code: u16,
        reason: String,
        /// `true` if the voice gateway closed the connection; `false` if the
        /// worker did.
        #[serde(rename = "byRemote")]
        by_remote: bool,
    },
}

impl EventPayload {
    pub fn guild_id(&self) -> &str {
        match self {
            Self::TrackStart { guild_id, .. }
            | Self::TrackEnd { guild_id, .. }
            | Self::TrackException { guild_id, .. }
            | Self::TrackStuck { guild_id, .. }
            | Self::TrackChange { guild_id, .. }
            | Self::WebSocketClosed { guild_id, .. } => guild_id,
        }
    }
}

/// Why a track stopped playing.
///
/// Serialized as camelCase to match the Lavalink v4 wire format exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackEndReason {
    /// Track played to the end. `mayStartNext = true`
    Finished,
    /// Track failed to start before providing any audio. `mayStartNext = true`
    LoadFailed,
    /// Player was explicitly stopped. `mayStartNext = false`
    Stopped,
    /// A new track started playing, replacing this one. `mayStartNext = false`
    Replaced,
    /// Player cleanup threshold reached. `mayStartNext = false`
    Cleanup,
}

impl TrackEndReason {
    /// Whether the runtime should advance to the next queued track.
    pub fn may_start_next(self) -> bool {
        matches!(self, Self::Finished | Self::LoadFailed)
    }
}

/// Exception severity levels.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
    Common,
    Suspicious,
    Fault,
}

/// Exception details for `TrackExceptionEvent`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackException {
    pub message: Option<String>,
    pub severity: Severity,
    pub cause: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_end_reason_deserialization() {
        let r: TrackEndReason = serde_json::from_str("\"finished\"").unwrap();
        assert_eq!(r, TrackEndReason::Finished);

        let r: TrackEndReason = serde_json::from_str("\"loadFailed\"").unwrap();
        assert_eq!(r, TrackEndReason::LoadFailed);

        let r: TrackEndReason = serde_json::from_str("\"cleanup\"").unwrap();
        assert_eq!(r, TrackEndReason::Cleanup);
    }

    #[test]
    fn test_may_start_next() {
        assert!(TrackEndReason::Finished.may_start_next());
        assert!(TrackEndReason::LoadFailed.may_start_next());
        assert!(!TrackEndReason::Replaced.may_start_next());
        assert!(!TrackEndReason::Stopped.may_start_next());
    }

    #[test]
    fn test_websocket_closed_event() {
        let json = r#"{"type":"WebSocketClosedEvent","guildId":"G","code":4015,"reason":"crash","byRemote":true}"#;
        let ev: EventPayload = serde_json::from_str(json).unwrap();
        match ev {
            EventPayload::WebSocketClosed { code, by_remote, .. } => {
                assert_eq!(code, 4015);
                assert!(by_remote);
            }
            other => panic!("wrong event: {other:?}"),
        }
    }
}
