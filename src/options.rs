//! Runtime configuration supplied by the embedding bot.

use std::sync::Arc;

use crate::aqua::trace::TraceEntry;

/// How players are placed onto connected nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalancer {
    /// Composite of CPU load, playing players, memory pressure and REST calls.
    #[default]
    LeastLoad,
    /// Ascending by issued REST calls.
    LeastRest,
    /// Shuffled.
    Random,
}

/// Tuning for the node-failover migration engine.
#[derive(Debug, Clone)]
pub struct FailoverOptions {
    pub enabled: bool,
    /// Per-node migration attempt cap.
    pub max_failover_attempts: u32,
    /// Per-node cooldown between failover rounds, in milliseconds.
    pub cooldown_ms: u64,
    /// Seek restored players back to their captured position.
    pub preserve_position: bool,
    /// Resume playback of the interrupted track after migration.
    pub resume_playback: bool,
    /// Concurrent migrations per batch.
    pub max_concurrent: usize,
}

impl Default for FailoverOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_failover_attempts: 5,
            cooldown_ms: 5_000,
            preserve_position: true,
            resume_playback: true,
            max_concurrent: 10,
        }
    }
}

/// Options recognized by [`crate::Aqua`].
#[derive(Clone)]
pub struct AquaOptions {
    /// Ask the embedder to delete the "now playing" message on track end.
    pub should_delete_message: bool,
    /// Search prefix applied to bare (non-URL) queries.
    pub default_search_platform: String,
    /// Destroy the player when its queue drains.
    pub leave_on_end: bool,
    /// Worker API version path segment.
    pub rest_version: String,
    /// Enable worker session resumption and persisted-player reload.
    pub auto_resume: bool,
    /// Never give up on node reconnection.
    pub infinite_reconnects: bool,
    pub load_balancer: LoadBalancer,
    /// Prefer HTTP/2 for large REST bodies.
    pub use_http2: bool,
    /// Move players to a region-affine node when the voice endpoint moves.
    pub auto_region_migrate: bool,
    pub failover: FailoverOptions,
    /// Queue URIs persisted per player.
    pub max_queue_save: usize,
    /// Tracks re-resolved per player on restore.
    pub max_tracks_restore: usize,
    /// Enable the diagnostic trace ring.
    pub debug_trace: bool,
    pub trace_max_entries: usize,
    /// Optional mirror of every trace entry (in addition to the ring).
    pub trace_sink: Option<Arc<dyn Fn(&TraceEntry) + Send + Sync>>,
    /// `Client-Name` header value, `<name>/<version>`.
    pub client_name: String,
}

impl Default for AquaOptions {
    fn default() -> Self {
        Self {
            should_delete_message: false,
            default_search_platform: "ytsearch".into(),
            leave_on_end: false,
            rest_version: "v4".into(),
            auto_resume: false,
            infinite_reconnects: false,
            load_balancer: LoadBalancer::default(),
            use_http2: false,
            auto_region_migrate: false,
            failover: FailoverOptions::default(),
            max_queue_save: 100,
            max_tracks_restore: 20,
            debug_trace: false,
            trace_max_entries: 3_000,
            trace_sink: None,
            client_name: concat!("aqualink/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

impl std::fmt::Debug for AquaOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AquaOptions")
            .field("default_search_platform", &self.default_search_platform)
            .field("rest_version", &self.rest_version)
            .field("auto_resume", &self.auto_resume)
            .field("infinite_reconnects", &self.infinite_reconnects)
            .field("load_balancer", &self.load_balancer)
            .field("use_http2", &self.use_http2)
            .field("auto_region_migrate", &self.auto_region_migrate)
            .finish_non_exhaustive()
    }
}

/// Connection settings for one worker node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Unique node identifier; defaults to `host` when empty.
    pub name: String,
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    /// Static `Authorization` header value.
    pub auth: String,
    /// Region affinity codes (three-letter, lowercase).
    pub regions: Vec<String>,
    /// Worker session id to resume with, if one was persisted.
    pub session_id: Option<String>,
    /// REST and WS handshake timeout.
    pub timeout: std::time::Duration,
    /// Base reconnect delay in milliseconds.
    pub reconnect_timeout: u64,
    /// Reconnect attempts before the node is destroyed.
    pub reconnect_tries: u32,
    /// Worker-side resume window, in seconds.
    pub resume_timeout: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: "127.0.0.1".into(),
            port: 2333,
            ssl: false,
            auth: "youshallnotpass".into(),
            regions: Vec::new(),
            session_id: None,
            timeout: std::time::Duration::from_secs(15),
            reconnect_timeout: 2_000,
            reconnect_tries: 3,
            resume_timeout: 60,
        }
    }
}

impl NodeConfig {
    pub fn identifier(&self) -> String {
        if self.name.is_empty() {
            self.host.clone()
        } else {
            self.name.clone()
        }
    }
}
