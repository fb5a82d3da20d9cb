//! Distributed Lavalink v4 client runtime.
//!
//! Federates a bot process to one or more audio worker nodes and bridges
//! them to per-guild voice sessions delivered over the platform gateway.
//! The embedder forwards raw voice packets into [`Aqua::update_voice_state`]
//! and wires [`GatewaySend`] back into its gateway connection; everything
//! else — placement, reconciliation, failover, persistence — happens here.

pub mod aqua;
pub mod common;
pub mod error;
pub mod events;
pub mod node;
pub mod options;
pub mod player;
pub mod plugin;
pub mod protocol;
pub mod track;

pub use aqua::{Aqua, GatewaySend};
pub use error::{Error, Result};
pub use events::{AquaEvent, EventBus};
pub use node::Node;
pub use options::{AquaOptions, FailoverOptions, LoadBalancer, NodeConfig};
pub use player::{
    DestroyOptions, LoopMode, PlayOptions, Player, PlayerOptions,
};
pub use plugin::{AutoplayProvider, Plugin};
pub use track::{Requester, Track};
