//! Frames received from a worker over the control-plane WebSocket.
//!
//! Every text frame is a JSON object with a top-level `op` string. Ops the
//! runtime does not recognize are preserved and forwarded to the caller
//! rather than rejected, so workers can ship custom ops without breaking
//! older clients.

use serde::Deserialize;
use serde_json::Value;

use crate::{
    common::types::{GuildId, SessionId},
    protocol::{events::EventPayload, stats::StatsFrame},
};

/// Messages sent from a worker to the client over WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum IncomingMessage {
    Ready {
        resumed: bool,
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },
    #[serde(rename_all = "camelCase")]
    PlayerUpdate {
        guild_id: GuildId,
        state: crate::protocol::models::PlayerState,
    },
    Stats(StatsFrame),
    Event(EventPayload),
}

/// A decoded worker frame, including the ops serde cannot classify.
#[derive(Debug)]
pub enum WorkerFrame {
    Message(Box<IncomingMessage>),
    /// Op string starting with `Lyrics` — surfaced as a lyrics event.
    Lyrics { op: String, payload: Value },
    /// Anything else with a well-formed `op`; forwarded to the caller.
    Unknown { op: String, payload: Value },
}

impl WorkerFrame {
    /// Parse one text frame. Returns `None` for frames that are not JSON
    /// objects or lack an `op` string; those are logged and discarded by
    /// the node without being fatal.
    pub fn parse(text: &str) -> Option<Self> {
        if !text.trim_start().starts_with('{') {
            return None;
        }
        let value: Value = serde_json::from_str(text).ok()?;
        let op = value.get("op")?.as_str()?.to_string();

        if op.starts_with("Lyrics") {
            return Some(Self::Lyrics { op, payload: value });
        }
        match serde_json::from_value::<IncomingMessage>(value.clone()) {
            Ok(msg) => Some(Self::Message(Box::new(msg))),
            Err(_) => Some(Self::Unknown { op, payload: value }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ready() {
        let frame = WorkerFrame::parse(r#"{"op":"ready","resumed":false,"sessionId":"abc"}"#);
        match frame {
            Some(WorkerFrame::Message(msg)) => match *msg {
                IncomingMessage::Ready { resumed, session_id } => {
                    assert!(!resumed);
                    assert_eq!(session_id, "abc");
                }
                other => panic!("wrong message: {other:?}"),
            },
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn test_parse_player_update() {
        let frame = WorkerFrame::parse(
            r#"{"op":"playerUpdate","guildId":"G","state":{"time":1,"position":2,"connected":true,"ping":3}}"#,
        );
        match frame {
            Some(WorkerFrame::Message(msg)) => match *msg {
                IncomingMessage::PlayerUpdate { guild_id, state } => {
                    assert_eq!(guild_id, "G");
                    assert_eq!(state.position, 2);
                    assert!(state.connected);
                }
                other => panic!("wrong message: {other:?}"),
            },
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn test_lyrics_op_routed_by_prefix() {
        let frame = WorkerFrame::parse(r#"{"op":"LyricsFoundEvent","guildId":"G"}"#);
        assert!(
            matches!(frame, Some(WorkerFrame::Lyrics { ref op, .. }) if op == "LyricsFoundEvent")
        );
    }

    #[test]
    fn test_unknown_op_is_preserved() {
        let frame = WorkerFrame::parse(r#"{"op":"customThing","data":1}"#);
        assert!(matches!(frame, Some(WorkerFrame::Unknown { ref op, .. }) if op == "customThing"));
    }

    #[test]
    fn test_non_json_frames_are_dropped() {
        assert!(WorkerFrame::parse("ping").is_none());
        assert!(WorkerFrame::parse("[1,2]").is_none());
        assert!(WorkerFrame::parse(r#"{"noop":true}"#).is_none());
    }
}
