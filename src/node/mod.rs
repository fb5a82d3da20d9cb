//! Worker control plane: one WebSocket client per node.
//!
//! The node task owns the socket, feeds op frames into player dispatch and
//! drives the reconnect loop. REST traffic goes through the node's [`Rest`]
//! client, which shares this node's session id.

pub mod backoff;
pub mod rest;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};
use std::time::{Duration, Instant};

use dashmap::DashSet;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, http::HeaderValue, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    aqua::Aqua,
    common::types::{now_ms, GuildId},
    error::{Error, Result},
    events::AquaEvent,
    options::{AquaOptions, NodeConfig},
    protocol::{
        info::Info,
        opcodes::{IncomingMessage, WorkerFrame},
        stats::NodeStats,
    },
};

use backoff::Backoff;
use rest::Rest;

/// Watchdog on the post-open `/info` fetch.
const INFO_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
/// WS keepalive ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Memo window for the composite load score.
const SCORE_MEMO: Duration = Duration::from_secs(5);

/// Close codes that permanently invalidate the control-plane session.
const FATAL_CLOSE_CODES: [u16; 6] = [4003, 4004, 4010, 4011, 4012, 4015];

/// How one WS session ended; drives the outer reconnect loop.
enum SessionEnd {
    /// Peer closed with a code (or the stream ended without one).
    Closed(Option<u16>, String),
    /// Transport-level failure before or during the session.
    Failed(String),
}

pub struct Node {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    pub regions: Vec<String>,
    pub rest: Arc<Rest>,
    /// Guild ids of the players this node currently owns.
    pub players: DashSet<GuildId>,

    config: NodeConfig,
    aqua: Weak<Aqua>,
    connected: AtomicBool,
    destroyed: AtomicBool,
    info: Mutex<Option<Info>>,
    stats: Mutex<NodeStats>,
    run_task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    score_cache: Mutex<Option<(f64, Instant)>>,
}

impl Node {
    pub fn new(aqua: &Arc<Aqua>, config: NodeConfig, options: &AquaOptions) -> Result<Arc<Self>> {
        let rest = Arc::new(Rest::new(&config, options)?);
        Ok(Arc::new(Self {
            name: config.identifier(),
            host: config.host.clone(),
            port: config.port,
            ssl: config.ssl,
            regions: config
                .regions
                .iter()
                .map(|r| r.to_ascii_lowercase())
                .collect(),
            rest,
            players: DashSet::new(),
            config,
            aqua: Arc::downgrade(aqua),
            connected: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            info: Mutex::new(None),
            stats: Mutex::new(NodeStats::default()),
            run_task: Mutex::new(None),
            cancel: CancellationToken::new(),
            score_cache: Mutex::new(None),
        }))
    }

    pub fn aqua(&self) -> Option<Arc<Aqua>> {
        self.aqua.upgrade()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn session_id(&self) -> Option<String> {
        self.rest.session_id()
    }

    pub fn info(&self) -> Option<Info> {
        self.info.lock().clone()
    }

    pub fn stats(&self) -> NodeStats {
        self.stats.lock().clone()
    }

    /// Composite placement score; lower is better. Memoized briefly since
    /// the balancer recomputes it for every placement.
    pub fn load_score(&self) -> f64 {
        {
            let cache = self.score_cache.lock();
            if let Some((score, at)) = *cache {
                if at.elapsed() < SCORE_MEMO {
                    return score;
                }
            }
        }
        let stats = self.stats.lock();
        let cores = stats.cpu.cores.max(1) as f64;
        let mem_pressure = if stats.memory.reservable > 0 {
            stats.memory.used as f64 / stats.memory.reservable as f64
        } else {
            0.0
        };
        let score = 100.0 * stats.cpu.system_load / cores
            + 0.75 * stats.playing_players as f64
            + 40.0 * mem_pressure
            + 0.001 * self.rest.calls() as f64;
        drop(stats);
        *self.score_cache.lock() = Some((score, Instant::now()));
        score
    }

    /// Open the control plane and keep it open until destroyed.
    pub fn connect(self: &Arc<Self>) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::Destroyed("node"));
        }
        let mut task = self.run_task.lock();
        if task.is_some() {
            return Ok(());
        }
        let node = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            node.run().await;
        }));
        Ok(())
    }

    /// Wait (bounded) for the ready handshake to complete.
    pub async fn wait_until_ready(self: &Arc<Self>, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.is_destroyed() {
                return false;
            }
            if self.is_connected() && self.session_id().is_some() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    async fn run(self: &Arc<Self>) {
        let infinite = self
            .aqua()
            .map(|a| a.options().infinite_reconnects)
            .unwrap_or(false);
        let mut backoff = Backoff::new(
            self.config.reconnect_timeout,
            self.config.reconnect_tries,
            infinite,
        );

        loop {
            if self.is_destroyed() || self.cancel.is_cancelled() {
                break;
            }

            let end = self.run_session(&mut backoff).await;
            let was_connected = self.connected.swap(false, Ordering::AcqRel);

            let (code, reason) = match end {
                SessionEnd::Closed(code, reason) => (code, reason),
                SessionEnd::Failed(reason) => (None, reason),
            };
            if was_connected {
                info!("[{}] disconnected: {:?} {}", self.name, code, reason);
                if let Some(aqua) = self.aqua() {
                    aqua.events().emit(AquaEvent::NodeDisconnect {
                        node: Arc::clone(self),
                        code,
                        reason: reason.clone(),
                    });
                    aqua.on_node_disconnect(self).await;
                }
            }

            if self.is_destroyed() || self.cancel.is_cancelled() {
                break;
            }

            match code {
                Some(1000) if !infinite => {
                    self.destroy().await;
                    break;
                }
                Some(code) if FATAL_CLOSE_CODES.contains(&code) => {
                    if code == 4011 {
                        self.rest.set_session_id(None);
                    }
                    error!("[{}] fatal close code {code}; not reconnecting", self.name);
                    self.destroy().await;
                    break;
                }
                other => {
                    // Force a fresh handshake unless the worker is merely
                    // restarting (1001 keeps the session resumable).
                    if other != Some(1001) {
                        self.rest.set_session_id(None);
                    }
                }
            }

            if backoff.is_exhausted() {
                error!(
                    "[{}] giving up after {} reconnect attempts",
                    self.name,
                    backoff.attempt()
                );
                self.destroy().await;
                break;
            }
            let delay = backoff.next();
            debug!("[{}] reconnecting in {:?}", self.name, delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => break,
            }
        }
    }

    async fn run_session(self: &Arc<Self>, backoff: &mut Backoff) -> SessionEnd {
        let request = match self.build_request() {
            Ok(r) => r,
            Err(e) => return SessionEnd::Failed(e.to_string()),
        };
        let url = format!(
            "{}://{}:{}/v4/websocket",
            if self.ssl { "wss" } else { "ws" },
            self.host,
            self.port
        );
        debug!("[{}] connecting to {url}", self.name);

        let connect = tokio_tungstenite::connect_async(request);
        let ws = match tokio::time::timeout(self.config.timeout, connect).await {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => return SessionEnd::Failed(e.to_string()),
            Err(_) => return SessionEnd::Failed("websocket handshake timed out".into()),
        };

        self.connected.store(true, Ordering::Release);
        backoff.reset();
        info!("[{}] control plane connected", self.name);
        if let Some(aqua) = self.aqua() {
            aqua.events().emit(AquaEvent::NodeConnect {
                node: Arc::clone(self),
            });
        }
        self.spawn_info_fetch();

        let (mut write, mut read) = ws.split();
        let (tx, rx) = flume::unbounded::<Message>();

        let writer = tokio::spawn(async move {
            while let Ok(msg) = rx.recv_async().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_interval.tick().await; // immediate first tick

        let end = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    break SessionEnd::Closed(Some(1000), "shutting down".into());
                }
                _ = ping_interval.tick() => {
                    let payload = now_ms().to_be_bytes().to_vec();
                    let _ = tx.send(Message::Ping(payload.into()));
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text).await,
                        Some(Ok(Message::Pong(payload))) => self.handle_pong(&payload),
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (u16::from(f.code), f.reason.to_string()))
                                .unwrap_or((1006, String::new()));
                            break SessionEnd::Closed(Some(code), reason);
                        }
                        // Binary frames are not part of the protocol.
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break SessionEnd::Failed(e.to_string()),
                        None => break SessionEnd::Closed(None, "stream ended".into()),
                    }
                }
            }
        };

        writer.abort();
        end
    }

    fn build_request(&self) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
        let url = format!(
            "{}://{}:{}/v4/websocket",
            if self.ssl { "wss" } else { "ws" },
            self.host,
            self.port
        );
        let mut request = url
            .into_client_request()
            .map_err(|e| Error::invalid(e.to_string()))?;
        let headers = request.headers_mut();
        let header = |v: &str| HeaderValue::from_str(v).map_err(|e| Error::invalid(e.to_string()));
        headers.insert("Authorization", header(&self.config.auth)?);
        if let Some(aqua) = self.aqua() {
            if let Some(client_id) = aqua.client_id() {
                headers.insert("User-Id", header(&client_id)?);
            }
            headers.insert("Client-Name", header(&aqua.options().client_name)?);
        }
        if let Some(session_id) = self.session_id() {
            headers.insert("Session-Id", header(&session_id)?);
        }
        Ok(request)
    }

    fn spawn_info_fetch(self: &Arc<Self>) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            match tokio::time::timeout(INFO_FETCH_TIMEOUT, node.rest.get_info()).await {
                Ok(Ok(info)) => {
                    debug!("[{}] worker {}", node.name, info.version.semver);
                    *node.info.lock() = Some(info);
                }
                Ok(Err(e)) => {
                    warn!("[{}] info fetch failed: {e}", node.name);
                    if let Some(aqua) = node.aqua() {
                        aqua.events().emit(AquaEvent::NodeError {
                            node: Arc::clone(&node),
                            message: format!("info fetch failed: {e}"),
                        });
                    }
                }
                Err(_) => warn!("[{}] info fetch timed out", node.name),
            }
        });
    }

    // ── Frame dispatch ──────────────────────────────────────────────────────

    async fn handle_text(self: &Arc<Self>, text: &str) {
        let Some(frame) = WorkerFrame::parse(text) else {
            debug!("[{}] discarding malformed frame", self.name);
            return;
        };
        let Some(aqua) = self.aqua() else { return };

        match frame {
            WorkerFrame::Message(msg) => match *msg {
                IncomingMessage::Ready { resumed, session_id } => {
                    self.handle_ready(&aqua, resumed, session_id).await;
                }
                IncomingMessage::Stats(stats) => {
                    self.stats.lock().merge(&stats);
                }
                IncomingMessage::PlayerUpdate { guild_id, state } => {
                    if let Some(player) = aqua.player(&guild_id) {
                        player.update_state(state);
                        aqua.events().emit(AquaEvent::PlayerUpdate { player, state });
                    }
                }
                IncomingMessage::Event(event) => {
                    if let Some(player) = aqua.player(event.guild_id()) {
                        // Event reactions can issue REST traffic; keep the
                        // read loop responsive.
                        tokio::spawn(async move {
                            player.handle_event(event).await;
                        });
                    }
                }
            },
            WorkerFrame::Lyrics { op, payload } => {
                let player = payload
                    .get("guildId")
                    .and_then(|g| g.as_str())
                    .and_then(|g| aqua.player(g));
                let track = player.as_ref().and_then(|p| p.current());
                aqua.events().emit(AquaEvent::Lyrics {
                    player,
                    track,
                    op,
                    payload,
                });
            }
            WorkerFrame::Unknown { op, payload } => {
                debug!("[{}] custom op {op}", self.name);
                aqua.events().emit(AquaEvent::CustomOp {
                    node: Arc::clone(self),
                    op,
                    payload,
                });
            }
        }
    }

    async fn handle_ready(self: &Arc<Self>, aqua: &Arc<Aqua>, resumed: bool, session_id: String) {
        info!("[{}] ready (resumed={resumed})", self.name);
        let previous = self.rest.session_id();
        self.rest.set_session_id(Some(session_id.clone()));

        // A fresh session means our remote players no longer exist.
        if !resumed && previous.is_some_and(|p| p != session_id) {
            aqua.on_session_invalidated(self).await;
        }

        aqua.events().emit(AquaEvent::NodeReady {
            node: Arc::clone(self),
            resumed,
        });

        if aqua.options().auto_resume {
            if let Err(e) = self
                .rest
                .update_session(true, self.config.resume_timeout)
                .await
            {
                warn!("[{}] enabling session resume failed: {e}", self.name);
            }
        }

        aqua.rebuild_broken_players(self).await;
    }

    fn handle_pong(&self, payload: &[u8]) {
        if payload.len() == 8 {
            let sent = u64::from_be_bytes(payload.try_into().unwrap_or_default());
            let latency = now_ms().saturating_sub(sent) as i64;
            self.stats.lock().ping = latency;
        }
    }

    // ── Teardown ────────────────────────────────────────────────────────────

    /// Terminal, one-shot destroy.
    pub async fn destroy(self: &Arc<Self>) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("[{}] destroying node", self.name);
        self.cancel.cancel();
        self.connected.store(false, Ordering::Release);

        if let Some(aqua) = self.aqua() {
            aqua.events().emit(AquaEvent::NodeDestroy {
                node: Arc::clone(self),
            });
            aqua.on_node_destroyed(self).await;
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("connected", &self.is_connected())
            .field("players", &self.players.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_close_codes() {
        // Session-invalidating codes never reconnect; voice-level and
        // transient codes do.
        for code in [4003, 4004, 4010, 4011, 4012, 4015] {
            assert!(FATAL_CLOSE_CODES.contains(&code));
        }
        for code in [1001, 1006, 4006, 4009, 4014] {
            assert!(!FATAL_CLOSE_CODES.contains(&code));
        }
    }
}
