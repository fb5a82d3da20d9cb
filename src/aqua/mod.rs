//! Top-level orchestrator: node and player registries, gateway demux,
//! placement, failover and persistence.

pub mod balancer;
pub mod failover;
pub mod persistence;
pub mod trace;

use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    common::types::GuildId,
    error::{Error, Result},
    events::{AquaEvent, EventBus},
    node::Node,
    options::{AquaOptions, NodeConfig},
    player::{
        connection::{ServerUpdate, StateUpdate},
        Player, PlayerOptions,
    },
    plugin::{AutoplayProvider, Plugin},
    protocol::tracks::LoadResult,
    track::{Requester, Track},
};

use failover::BrokenPlayer;
use trace::TraceBuffer;

/// Per-node readiness budget during [`Aqua::init`].
const NODE_TIMEOUT: Duration = Duration::from_secs(30);

/// Callback handed in by the embedder; receives opaque gateway packets
/// (voice joins and leaves) to forward to the platform.
pub type GatewaySend = Arc<dyn Fn(Value) + Send + Sync>;

pub struct Aqua {
    options: AquaOptions,
    events: EventBus,
    send: GatewaySend,
    client_id: RwLock<Option<String>>,

    nodes: DashMap<String, Arc<Node>>,
    players: DashMap<GuildId, Arc<Player>>,
    node_configs: Mutex<Vec<NodeConfig>>,

    pub(crate) broken_players: DashMap<GuildId, BrokenPlayer>,
    pub(crate) failover_queue: DashMap<String, u32>,
    pub(crate) last_failover_attempt: DashMap<String, u64>,
    pub(crate) rebuild_locks: DashSet<GuildId>,
    pub(crate) nodes_cache: Mutex<Option<(Vec<Arc<Node>>, std::time::Instant)>>,

    trace: Option<TraceBuffer>,
    autoplay_providers: DashMap<String, Arc<dyn AutoplayProvider>>,
    plugins: Mutex<Vec<Arc<dyn Plugin>>>,
    destroyed: std::sync::atomic::AtomicBool,
}

impl Aqua {
    pub fn new(send: GatewaySend, node_configs: Vec<NodeConfig>, options: AquaOptions) -> Arc<Self> {
        let trace = options
            .debug_trace
            .then(|| TraceBuffer::new(options.trace_max_entries));
        Arc::new(Self {
            options,
            events: EventBus::new(),
            send,
            client_id: RwLock::new(None),
            nodes: DashMap::new(),
            players: DashMap::new(),
            node_configs: Mutex::new(node_configs),
            broken_players: DashMap::new(),
            failover_queue: DashMap::new(),
            last_failover_attempt: DashMap::new(),
            rebuild_locks: DashSet::new(),
            nodes_cache: Mutex::new(None),
            trace,
            autoplay_providers: DashMap::new(),
            plugins: Mutex::new(Vec::new()),
            destroyed: std::sync::atomic::AtomicBool::new(false),
        })
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn options(&self) -> &AquaOptions {
        &self.options
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn client_id(&self) -> Option<String> {
        self.client_id.read().clone()
    }

    pub fn node(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.get(name).map(|n| n.clone())
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.iter().map(|n| n.clone()).collect()
    }

    pub fn player(&self, guild_id: &str) -> Option<Arc<Player>> {
        self.players.get(guild_id).map(|p| p.clone())
    }

    /// Lookup that fails on a missing guild.
    pub fn get(&self, guild_id: &str) -> Result<Arc<Player>> {
        self.player(guild_id)
            .ok_or_else(|| Error::PlayerNotFound(guild_id.to_string()))
    }

    pub fn players(&self) -> Vec<Arc<Player>> {
        self.players.iter().map(|p| p.clone()).collect()
    }

    pub(crate) fn gateway_send(&self, packet: Value) {
        self.record_trace("gateway_send", packet.clone());
        (self.send)(packet);
    }

    pub fn record_trace(&self, event: &str, data: Value) {
        if let Some(trace) = &self.trace {
            let entry = trace.record(event, data);
            if let Some(sink) = &self.options.trace_sink {
                sink(&entry);
            }
        }
    }

    /// The last `n` trace entries in chronological order; empty when tracing
    /// is off.
    pub fn get_trace(&self, n: usize) -> Vec<trace::TraceEntry> {
        self.trace.as_ref().map(|t| t.last(n)).unwrap_or_default()
    }

    pub fn register_autoplay_provider(&self, source: impl Into<String>, provider: Arc<dyn AutoplayProvider>) {
        self.autoplay_providers.insert(source.into(), provider);
    }

    pub fn register_plugin(&self, plugin: Arc<dyn Plugin>) {
        self.plugins.lock().push(plugin);
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Connect every configured node and run plugin loaders. Nodes that miss
    /// their readiness window stay registered and keep reconnecting in the
    /// background.
    pub async fn init(self: &Arc<Self>, client_id: impl Into<String>) -> Result<()> {
        let client_id = client_id.into();
        *self.client_id.write() = Some(client_id.clone());

        let configs = self.node_configs.lock().clone();
        for config in configs {
            if let Err(e) = self.add_node(config) {
                warn!("node registration failed: {e}");
            }
        }

        let waits = self
            .nodes()
            .into_iter()
            .map(|node| async move { node.wait_until_ready(NODE_TIMEOUT).await });
        let ready: Vec<bool> = futures::future::join_all(waits).await;
        info!(
            "init complete: {}/{} nodes ready",
            ready.iter().filter(|r| **r).count(),
            ready.len()
        );

        let plugins = self.plugins.lock().clone();
        for plugin in plugins {
            debug!("loading plugin {}", plugin.name());
            if let Err(e) = plugin.load(self).await {
                warn!("plugin {} failed to load: {e}", plugin.name());
            }
        }
        Ok(())
    }

    /// Register and connect a node at runtime.
    pub fn add_node(self: &Arc<Self>, config: NodeConfig) -> Result<Arc<Node>> {
        let node = Node::new(self, config, &self.options)?;
        if let Some(client_id) = self.client_id() {
            node.rest.set_user_id(client_id);
        }
        self.nodes.insert(node.name.clone(), node.clone());
        self.invalidate_nodes_cache();
        node.connect()?;
        Ok(node)
    }

    /// Tear everything down: players first, then nodes.
    pub async fn destroy(self: &Arc<Self>) {
        if self.destroyed.swap(true, std::sync::atomic::Ordering::AcqRel) {
            return;
        }
        let guilds: Vec<GuildId> = self.players.iter().map(|p| p.key().clone()).collect();
        for guild in guilds {
            let _ = self.destroy_player(&guild).await;
        }
        for node in self.nodes() {
            node.destroy().await;
        }
        self.nodes.clear();
        self.invalidate_nodes_cache();
    }

    // ── Player registry ─────────────────────────────────────────────────────

    /// Return the guild's player, reconnecting it if the requested voice
    /// channel differs, or create one on the best available node.
    pub async fn create_connection(self: &Arc<Self>, options: PlayerOptions) -> Result<Arc<Player>> {
        if let Some(existing) = self.player(&options.guild_id) {
            if !existing.is_destroyed() {
                if let Some(channel) = &options.voice_channel {
                    if existing.voice_channel_id().as_deref() != Some(channel.as_str()) {
                        existing.set_voice_channel(channel.clone())?;
                    }
                }
                return Ok(existing);
            }
        }

        let node = self.choose_node()?;
        self.create_player(node, options).await
    }

    /// Create a player on a specific node and join its voice channel.
    pub async fn create_player(
        self: &Arc<Self>,
        node: Arc<Node>,
        options: PlayerOptions,
    ) -> Result<Arc<Player>> {
        if options.guild_id.is_empty() {
            return Err(Error::invalid("guild id is empty"));
        }
        let player = Player::new(self, node.clone(), options.clone());
        self.players.insert(options.guild_id.clone(), player.clone());
        self.record_trace(
            "player_create",
            serde_json::json!({ "guild": options.guild_id, "node": node.name }),
        );
        player.connect(&options)?;
        self.events.emit(AquaEvent::PlayerCreate {
            player: player.clone(),
        });
        Ok(player)
    }

    /// Remove the player from the registry, then destroy it. The removal
    /// happens first so re-entrant destroys are no-ops.
    pub async fn destroy_player(&self, guild_id: &str) -> Result<()> {
        let Some((_, player)) = self.players.remove(guild_id) else {
            return Ok(());
        };
        player.destroy(Default::default()).await;
        Ok(())
    }

    /// Drop the registry entry without destroying the player; rebuild paths
    /// destroy the instance themselves with preservation flags.
    pub(crate) fn discard_player(&self, guild_id: &str) {
        self.players.remove(guild_id);
    }

    pub(crate) fn insert_player(&self, player: Arc<Player>) {
        self.players.insert(player.guild_id().to_string(), player);
    }

    // ── Gateway demux ───────────────────────────────────────────────────────

    /// Sole entry point for raw gateway voice packets (`{t, d}` shape).
    pub fn update_voice_state(&self, packet: &Value) {
        let Some(t) = packet.get("t").and_then(|t| t.as_str()) else {
            return;
        };
        let Some(d) = packet.get("d") else { return };
        let Some(guild_id) = d.get("guild_id").and_then(|g| g.as_str()) else {
            return;
        };
        let Some(player) = self.player(guild_id) else {
            return;
        };
        let Some(client_id) = self.client_id() else {
            return;
        };

        match t {
            "VOICE_STATE_UPDATE" => {
                let user_id = d.get("user_id").and_then(|u| u.as_str()).unwrap_or_default();
                if user_id != client_id {
                    return;
                }
                let update = StateUpdate {
                    session_id: d
                        .get("session_id")
                        .and_then(|s| s.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    channel_id: d
                        .get("channel_id")
                        .and_then(|c| c.as_str())
                        .map(str::to_string),
                    self_deaf: d.get("self_deaf").and_then(|v| v.as_bool()).unwrap_or(false),
                    self_mute: d.get("self_mute").and_then(|v| v.as_bool()).unwrap_or(false),
                    user_id: user_id.to_string(),
                    tx_id: Some(player.connection().tx_id()),
                };
                player.connection().set_state_update(&player, &client_id, update);
            }
            "VOICE_SERVER_UPDATE" => {
                let update = ServerUpdate {
                    endpoint: d
                        .get("endpoint")
                        .and_then(|e| e.as_str())
                        .map(str::to_string),
                    token: d
                        .get("token")
                        .and_then(|t| t.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    tx_id: Some(player.connection().tx_id()),
                };
                player.connection().set_server_update(&player, update);
            }
            _ => {}
        }
    }

    // ── Resolution ──────────────────────────────────────────────────────────

    /// Resolve a URL or search query into tracks. Bare queries get the
    /// configured search prefix.
    pub async fn resolve(
        self: &Arc<Self>,
        query: &str,
        requester: Option<Requester>,
        node: Option<Arc<Node>>,
    ) -> Result<Vec<Arc<Track>>> {
        let node = match node {
            Some(n) => n,
            None => self.choose_node()?,
        };
        let identifier = if query.starts_with("http://") || query.starts_with("https://") {
            query.to_string()
        } else {
            format!("{}:{}", self.options.default_search_platform, query)
        };

        let result = node.rest.load_tracks(&identifier).await?;
        let tracks = match result {
            LoadResult::Track(t) => vec![Track::from_data(t, None, requester, &node)],
            LoadResult::Playlist(p) => {
                let info = p.info.clone();
                p.tracks
                    .into_iter()
                    .map(|t| Track::from_data(t, Some(info.clone()), requester.clone(), &node))
                    .collect()
            }
            LoadResult::Search(results) => results
                .into_iter()
                .map(|t| Track::from_data(t, None, requester.clone(), &node))
                .collect(),
            LoadResult::Empty(_) => Vec::new(),
            LoadResult::Error(e) => {
                return Err(Error::invalid(
                    e.message.unwrap_or_else(|| "track load failed".into()),
                ))
            }
        };
        Ok(tracks)
    }

    /// One autoplay lookup round for `player`, dispatched on the seed's
    /// source.
    pub(crate) async fn autoplay_candidate(
        self: &Arc<Self>,
        player: &Arc<Player>,
        seed: &Arc<Track>,
        exclude: &[String],
    ) -> Result<Option<Arc<Track>>> {
        match seed.info.source_name.as_str() {
            "youtube" => {
                let id = &seed.info.identifier;
                let query = format!("https://www.youtube.com/watch?v={id}&list=RD{id}");
                let node = player.node();
                let result = node.rest.load_tracks(&query).await?;
                let candidates = match result {
                    LoadResult::Playlist(p) => p.tracks,
                    LoadResult::Search(tracks) => tracks,
                    LoadResult::Track(t) => vec![t],
                    _ => Vec::new(),
                };
                let pick = candidates
                    .into_iter()
                    .find(|t| t.info.identifier != *id && !exclude.contains(&t.info.identifier));
                Ok(pick.map(|t| Track::from_data(t, None, seed.requester.clone(), &node)))
            }
            source => {
                let provider = self.autoplay_providers.get(source).map(|p| p.clone());
                match provider {
                    Some(provider) => provider.recommend(player, seed, exclude).await,
                    None => Ok(None),
                }
            }
        }
    }
}

impl std::fmt::Debug for Aqua {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aqua")
            .field("nodes", &self.nodes.len())
            .field("players", &self.players.len())
            .finish_non_exhaustive()
    }
}
