//! Caller-facing event bus.
//!
//! Everything the runtime observes — worker ops, voice lifecycle, failover —
//! fans out here as typed events over a single flume channel. Emission never
//! blocks; if the embedder stops draining, events queue unbounded.

use std::sync::Arc;

use serde_json::Value;

use crate::{
    common::types::{ChannelId, GuildId},
    node::Node,
    player::Player,
    protocol::{
        events::{TrackEndReason, TrackException},
        models::PlayerState,
    },
    track::Track,
};

/// Events surfaced to the embedding bot.
#[derive(Debug, Clone)]
pub enum AquaEvent {
    Debug {
        scope: String,
        message: String,
    },
    Error {
        guild_id: Option<GuildId>,
        message: String,
    },

    NodeConnect {
        node: Arc<Node>,
    },
    NodeReady {
        node: Arc<Node>,
        resumed: bool,
    },
    NodeDisconnect {
        node: Arc<Node>,
        code: Option<u16>,
        reason: String,
    },
    NodeError {
        node: Arc<Node>,
        message: String,
    },
    NodeDestroy {
        node: Arc<Node>,
    },
    NodeFailover {
        node: Arc<Node>,
    },
    NodeFailoverComplete {
        node: Arc<Node>,
        migrated: usize,
        failed: usize,
    },
    /// Unrecognized worker op, forwarded untouched.
    CustomOp {
        node: Arc<Node>,
        op: String,
        payload: Value,
    },

    PlayerCreate {
        player: Arc<Player>,
    },
    PlayerDestroy {
        player: Arc<Player>,
    },
    PlayerUpdate {
        player: Arc<Player>,
        state: PlayerState,
    },
    PlayerMove {
        player: Arc<Player>,
        old_channel: Option<ChannelId>,
        new_channel: Option<ChannelId>,
    },
    PlayerMigrated {
        old: Arc<Player>,
        new: Arc<Player>,
        node: Arc<Node>,
        reason: &'static str,
    },
    PlayerReconnected {
        old: Arc<Player>,
        new: Arc<Player>,
    },
    ReconnectionFailed {
        guild_id: GuildId,
        message: String,
    },

    TrackStart {
        player: Arc<Player>,
        track: Arc<Track>,
    },
    TrackEnd {
        player: Arc<Player>,
        track: Arc<Track>,
        reason: TrackEndReason,
    },
    TrackError {
        player: Arc<Player>,
        track: Option<Arc<Track>>,
        exception: TrackException,
    },
    TrackStuck {
        player: Arc<Player>,
        track: Option<Arc<Track>>,
        threshold_ms: u64,
    },
    TrackChange {
        player: Arc<Player>,
        track: Arc<Track>,
    },
    SocketClosed {
        player: Arc<Player>,
        code: u16,
        payload: Value,
    },
    QueueEnd {
        player: Arc<Player>,
    },
    AutoplayFailed {
        player: Arc<Player>,
        message: String,
    },
    Lyrics {
        player: Option<Arc<Player>>,
        track: Option<Arc<Track>>,
        op: String,
        payload: Value,
    },
}

/// Fan-out channel for [`AquaEvent`].
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: flume::Sender<AquaEvent>,
    rx: flume::Receiver<AquaEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    pub fn emit(&self, event: AquaEvent) {
        let _ = self.tx.send(event);
    }

    pub fn emit_debug(&self, scope: impl Into<String>, message: impl Into<String>) {
        self.emit(AquaEvent::Debug {
            scope: scope.into(),
            message: message.into(),
        });
    }

    pub fn emit_error(&self, guild_id: Option<GuildId>, message: impl Into<String>) {
        self.emit(AquaEvent::Error {
            guild_id,
            message: message.into(),
        });
    }

    /// Receiver handle. Cloned receivers share the queue: each event is
    /// delivered to exactly one of them, so drain from a single place.
    pub fn receiver(&self) -> flume::Receiver<AquaEvent> {
        self.rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_queue_without_a_consumer() {
        let bus = EventBus::new();
        bus.emit_debug("test", "one");
        bus.emit_debug("test", "two");
        let rx = bus.receiver();
        assert!(matches!(rx.try_recv().unwrap(), AquaEvent::Debug { .. }));
        assert!(matches!(rx.try_recv().unwrap(), AquaEvent::Debug { .. }));
        assert!(rx.try_recv().is_err());
    }
}
