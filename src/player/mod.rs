//! Per-guild player aggregate.
//!
//! A player owns its queue, current track, history and voice connection,
//! and issues all playback mutations as coalesced REST updates against its
//! owning node. Destruction is terminal: no further mutation is observable.

pub mod batcher;
pub mod connection;
pub mod history;
pub mod payload;
pub mod queue;
pub mod region;
mod reconnect;

pub(crate) use reconnect::wait_for_track_start;

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, AtomicI64, AtomicU16, AtomicU64, AtomicU8, Ordering},
    Arc, Weak,
};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    aqua::Aqua,
    common::types::{now_ms, ChannelId, GuildId},
    error::{Error, Result},
    events::AquaEvent,
    node::Node,
    protocol::{
        events::{EventPayload, TrackEndReason},
        models::{PlayerState, TrackEncoded, UpdatePlayer},
        tracks::TrackData,
    },
    track::Track,
};

use batcher::UpdateBatcher;
use connection::Connection;
use history::CircularBuffer;
use queue::Queue;

/// Previous-track history depth.
const HISTORY_CAPACITY: usize = 50;
/// Identifier memory used to keep autoplay from repeating itself.
const PREVIOUS_IDENTIFIERS_CAP: usize = 20;
/// Autoplay lookup attempts before giving up.
const AUTOPLAY_MAX: u32 = 3;

/// Queue repetition behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum LoopMode {
    #[default]
    None = 0,
    Track = 1,
    Queue = 2,
}

impl LoopMode {
    /// Parse `0/1/2` or `none/track/queue`.
    pub fn parse(input: &str) -> Result<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "0" | "none" => Ok(Self::None),
            "1" | "track" => Ok(Self::Track),
            "2" | "queue" => Ok(Self::Queue),
            other => Err(Error::invalid(format!("invalid loop mode: {other}"))),
        }
    }

    pub fn from_index(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Track),
            2 => Ok(Self::Queue),
            other => Err(Error::invalid(format!("invalid loop mode: {other}"))),
        }
    }
}

/// Creation options for one guild player.
#[derive(Debug, Clone, Default)]
pub struct PlayerOptions {
    pub guild_id: GuildId,
    pub text_channel: Option<ChannelId>,
    pub voice_channel: Option<ChannelId>,
    pub default_volume: Option<u16>,
    pub deaf: bool,
    pub mute: bool,
}

/// Options for [`Player::play`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PlayOptions {
    pub paused: bool,
    pub start_time: Option<u64>,
    pub no_replace: bool,
}

/// What survives a [`Player::destroy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DestroyOptions {
    /// Keep the gateway voice session (no leave packet).
    pub preserve_client: bool,
    /// Skip the remote DELETE (the worker player is already gone or will be
    /// reused).
    pub skip_remote: bool,
    /// Keep the "now playing" message reference.
    pub preserve_message: bool,
    /// Keep queue, history and the data store.
    pub preserve_tracks: bool,
    /// Keep the in-flight reconnection marker.
    pub preserve_reconnecting: bool,
}

pub struct Player {
    guild_id: GuildId,
    aqua: Weak<Aqua>,
    node: RwLock<Arc<Node>>,
    connection: Connection,
    batcher: Arc<UpdateBatcher>,

    text_channel_id: Mutex<Option<ChannelId>>,
    voice_channel_id: Mutex<Option<ChannelId>>,
    volume: AtomicU16,
    loop_mode: AtomicU8,
    playing: AtomicBool,
    paused: AtomicBool,
    connected: AtomicBool,
    destroyed: AtomicBool,
    /// Voice recovery (fresh credentials expected) in progress.
    resuming: AtomicBool,
    /// Full rebuild sequence in flight; guards re-entry.
    reconnecting: AtomicBool,
    position: AtomicU64,
    timestamp: AtomicU64,
    ping: AtomicI64,
    deaf: AtomicBool,
    mute: AtomicBool,

    autoplay_enabled: AtomicBool,
    autoplay_seed: Mutex<Option<Arc<Track>>>,
    current: Mutex<Option<Arc<Track>>>,
    queue: Mutex<Queue>,
    previous: Mutex<CircularBuffer>,
    previous_identifiers: Mutex<VecDeque<String>>,
    now_playing_message: Mutex<Option<String>>,
    data_store: DashMap<String, Value>,

    watchdog: Mutex<Option<JoinHandle<()>>>,
    /// Epoch ms when the worker last reported the voice link down; 0 = up.
    voice_down_since: AtomicU64,
}

impl Player {
    pub fn new(aqua: &Arc<Aqua>, node: Arc<Node>, options: PlayerOptions) -> Arc<Self> {
        let volume = options.default_volume.unwrap_or(100).min(200);
        let batcher = UpdateBatcher::new(
            options.guild_id.clone(),
            node.rest.clone(),
            Arc::downgrade(aqua),
        );
        let player = Arc::new(Self {
            guild_id: options.guild_id.clone(),
            aqua: Arc::downgrade(aqua),
            connection: Connection::new(options.guild_id.clone()),
            batcher,
            text_channel_id: Mutex::new(options.text_channel),
            voice_channel_id: Mutex::new(options.voice_channel),
            volume: AtomicU16::new(volume),
            loop_mode: AtomicU8::new(LoopMode::None as u8),
            playing: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            resuming: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            position: AtomicU64::new(0),
            timestamp: AtomicU64::new(0),
            ping: AtomicI64::new(-1),
            deaf: AtomicBool::new(options.deaf),
            mute: AtomicBool::new(options.mute),
            autoplay_enabled: AtomicBool::new(false),
            autoplay_seed: Mutex::new(None),
            current: Mutex::new(None),
            queue: Mutex::new(Queue::new()),
            previous: Mutex::new(CircularBuffer::new(HISTORY_CAPACITY)),
            previous_identifiers: Mutex::new(VecDeque::new()),
            now_playing_message: Mutex::new(None),
            data_store: DashMap::new(),
            watchdog: Mutex::new(None),
            voice_down_since: AtomicU64::new(0),
            node: RwLock::new(node.clone()),
        });
        node.players.insert(options.guild_id);
        reconnect::spawn_watchdog(&player);
        player
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn guild_id(&self) -> &str {
        &self.guild_id
    }

    pub fn aqua(&self) -> Option<Arc<Aqua>> {
        self.aqua.upgrade()
    }

    pub fn node(&self) -> Arc<Node> {
        self.node.read().clone()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub(crate) fn batcher(&self) -> &Arc<UpdateBatcher> {
        &self.batcher
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_resuming(&self) -> bool {
        self.resuming.load(Ordering::Acquire)
    }

    pub fn set_resuming(&self, value: bool) {
        self.resuming.store(value, Ordering::Release);
    }

    pub(crate) fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::Acquire)
    }

    pub fn volume(&self) -> u16 {
        self.volume.load(Ordering::Acquire)
    }

    pub fn loop_mode(&self) -> LoopMode {
        match self.loop_mode.load(Ordering::Acquire) {
            1 => LoopMode::Track,
            2 => LoopMode::Queue,
            _ => LoopMode::None,
        }
    }

    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Acquire)
    }

    pub fn ping(&self) -> i64 {
        self.ping.load(Ordering::Acquire)
    }

    pub fn is_deaf(&self) -> bool {
        self.deaf.load(Ordering::Acquire)
    }

    pub fn is_mute(&self) -> bool {
        self.mute.load(Ordering::Acquire)
    }

    pub fn is_autoplay_enabled(&self) -> bool {
        self.autoplay_enabled.load(Ordering::Acquire)
    }

    pub fn set_autoplay(&self, enabled: bool) {
        self.autoplay_enabled.store(enabled, Ordering::Release);
    }

    pub fn autoplay_seed(&self) -> Option<Arc<Track>> {
        self.autoplay_seed.lock().clone()
    }

    pub fn set_autoplay_seed(&self, seed: Option<Arc<Track>>) {
        *self.autoplay_seed.lock() = seed;
    }

    pub fn current(&self) -> Option<Arc<Track>> {
        self.current.lock().clone()
    }

    pub fn text_channel_id(&self) -> Option<ChannelId> {
        self.text_channel_id.lock().clone()
    }

    pub fn voice_channel_id(&self) -> Option<ChannelId> {
        self.voice_channel_id.lock().clone()
    }

    pub fn queue_snapshot(&self) -> Vec<Arc<Track>> {
        self.queue.lock().to_vec()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn previous_track(&self) -> Option<Arc<Track>> {
        self.previous.lock().last().cloned()
    }

    pub fn previous_identifiers(&self) -> Vec<String> {
        self.previous_identifiers.lock().iter().cloned().collect()
    }

    pub fn now_playing_message(&self) -> Option<String> {
        self.now_playing_message.lock().clone()
    }

    pub fn set_now_playing_message(&self, id: Option<String>) {
        *self.now_playing_message.lock() = id;
    }

    // ── Data store ──────────────────────────────────────────────────────────

    pub fn set_data(&self, key: impl Into<String>, value: Value) {
        self.data_store.insert(key.into(), value);
    }

    pub fn get_data(&self, key: &str) -> Option<Value> {
        self.data_store.get(key).map(|v| v.clone())
    }

    pub fn clear_data(&self) {
        self.data_store.clear();
    }

    // ── Queue operations ────────────────────────────────────────────────────

    pub fn enqueue(&self, track: Arc<Track>) {
        self.queue.lock().enqueue(track);
    }

    pub fn enqueue_front(&self, track: Arc<Track>) {
        self.queue.lock().push_front(track);
    }

    pub fn shuffle(&self) {
        self.queue.lock().shuffle();
    }

    pub fn move_track(&self, from: usize, to: usize) {
        self.queue.lock().move_item(from, to);
    }

    pub fn swap_tracks(&self, i: usize, j: usize) {
        self.queue.lock().swap(i, j);
    }

    pub fn remove_track(&self, track: &Arc<Track>) -> bool {
        self.queue.lock().remove(track)
    }

    pub fn clear_queue(&self) {
        self.queue.lock().clear();
    }

    pub(crate) fn restore_previous_identifiers(&self, ids: Vec<String>) {
        let mut guard = self.previous_identifiers.lock();
        guard.clear();
        guard.extend(ids.into_iter().take(PREVIOUS_IDENTIFIERS_CAP));
    }

    fn remember_identifier(&self, identifier: &str) {
        let mut ids = self.previous_identifiers.lock();
        if ids.iter().any(|i| i == identifier) {
            return;
        }
        if ids.len() >= PREVIOUS_IDENTIFIERS_CAP {
            ids.pop_front();
        }
        ids.push_back(identifier.to_string());
    }

    // ── Gateway plumbing ────────────────────────────────────────────────────

    /// Emit the opaque voice-join packet through the orchestrator's `send`
    /// callback.
    pub fn send_voice_join(&self) {
        self.send_voice_packet(self.voice_channel_id(), self.is_deaf(), self.is_mute());
    }

    fn send_voice_leave(&self) {
        self.send_voice_packet(None, false, false);
    }

    pub(crate) fn send_voice_packet(
        &self,
        channel_id: Option<ChannelId>,
        self_deaf: bool,
        self_mute: bool,
    ) {
        let Some(aqua) = self.aqua() else { return };
        aqua.gateway_send(serde_json::json!({
            "op": 4,
            "d": {
                "guild_id": self.guild_id,
                "channel_id": channel_id,
                "self_deaf": self_deaf,
                "self_mute": self_mute,
            }
        }));
    }

    pub(crate) fn set_paused_flag(&self, value: bool) {
        self.paused.store(value, Ordering::Release);
    }

    pub(crate) fn set_deaf_mute(&self, deaf: bool, mute: bool) {
        self.deaf.store(deaf, Ordering::Release);
        self.mute.store(mute, Ordering::Release);
    }

    /// Called by the connection when the gateway moved us between channels.
    pub(crate) fn note_voice_channel_moved(
        self: &Arc<Self>,
        old_channel: Option<ChannelId>,
        new_channel: Option<ChannelId>,
    ) {
        *self.voice_channel_id.lock() = new_channel.clone();
        self.set_resuming(true);
        if let Some(aqua) = self.aqua() {
            aqua.events().emit(AquaEvent::PlayerMove {
                player: Arc::clone(self),
                old_channel,
                new_channel,
            });
        }
    }

    /// Region-affinity hook, called on every accepted voice server update.
    /// Returns whether a migration was scheduled instead of a voice update.
    pub(crate) fn maybe_migrate_for_region(self: &Arc<Self>, region: &str) -> bool {
        let Some(aqua) = self.aqua() else {
            return false;
        };
        if !aqua.options().auto_region_migrate {
            return false;
        }
        let node = self.node();
        if node.regions.iter().any(|r| r.eq_ignore_ascii_case(region)) {
            return false;
        }
        let Some(target) = aqua.find_best_node_for_region(region) else {
            return false;
        };
        if target.name == node.name {
            return false;
        }

        let guild_id = self.guild_id.clone();
        tokio::spawn(async move {
            if let Err(e) = aqua.move_player_to_node(&guild_id, &target, "region").await {
                warn!("[{guild_id}] region migration failed: {e}");
            }
        });
        true
    }

    // ── Playback operations ─────────────────────────────────────────────────

    /// Join the configured voice channel.
    pub fn connect(&self, options: &PlayerOptions) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::Destroyed("player"));
        }
        if let Some(channel) = &options.voice_channel {
            *self.voice_channel_id.lock() = Some(channel.clone());
        }
        self.deaf.store(options.deaf, Ordering::Release);
        self.mute.store(options.mute, Ordering::Release);
        self.send_voice_join();
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    /// Start playback. With no `track`, the queue head is dequeued.
    pub async fn play(self: &Arc<Self>, track: Option<Arc<Track>>, options: PlayOptions) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::Destroyed("player"));
        }
        if !self.is_connected() {
            return Err(Error::invalid("player is not connected to a voice channel"));
        }

        let track = match track {
            Some(t) => t,
            None => self
                .queue
                .lock()
                .dequeue()
                .ok_or_else(|| Error::invalid("queue is empty"))?,
        };

        let node = self.node();
        let search_platform = self
            .aqua()
            .map(|a| a.options().default_search_platform.clone())
            .unwrap_or_else(|| "ytsearch".into());
        let encoded = track.resolve(&node, &search_platform).await?;

        *self.current.lock() = Some(Arc::clone(&track));
        self.playing.store(true, Ordering::Release);
        self.paused.store(options.paused, Ordering::Release);
        self.position.store(options.start_time.unwrap_or(0), Ordering::Release);

        if options.no_replace {
            self.batcher.set_no_replace();
        }
        let update = UpdatePlayer {
            encoded_track: Some(TrackEncoded::Set(encoded)),
            position: options.start_time,
            paused: options.paused.then_some(true),
            ..Default::default()
        };
        self.batcher.batch(update, true).await
    }

    /// Idempotent pause/unpause.
    pub async fn pause(self: &Arc<Self>, paused: bool) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::Destroyed("player"));
        }
        if self.is_paused() == paused {
            return Ok(());
        }
        self.paused.store(paused, Ordering::Release);
        self.batcher
            .batch(
                UpdatePlayer {
                    paused: Some(paused),
                    ..Default::default()
                },
                true,
            )
            .await
    }

    /// Seek to an absolute position, clamped to the track duration when
    /// known.
    pub async fn seek(self: &Arc<Self>, position_ms: i64) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::Destroyed("player"));
        }
        if !self.is_playing() {
            return Err(Error::invalid("nothing is playing"));
        }
        let mut target = position_ms.max(0) as u64;
        if let Some(duration) = self.current().and_then(|t| t.duration()) {
            target = target.min(duration);
        }
        self.position.store(target, Ordering::Release);
        self.batcher
            .batch(
                UpdatePlayer {
                    position: Some(target),
                    ..Default::default()
                },
                true,
            )
            .await
    }

    /// Stop playback without destroying the player.
    pub async fn stop(self: &Arc<Self>) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::Destroyed("player"));
        }
        *self.current.lock() = None;
        self.playing.store(false, Ordering::Release);
        self.paused.store(false, Ordering::Release);
        self.position.store(0, Ordering::Release);
        self.batcher
            .batch(
                UpdatePlayer {
                    encoded_track: Some(TrackEncoded::Clear),
                    ..Default::default()
                },
                true,
            )
            .await
    }

    /// Clamp and apply volume. Batched: rides the next flush.
    pub async fn set_volume(self: &Arc<Self>, volume: i32) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::Destroyed("player"));
        }
        let clamped = volume.clamp(0, 200) as u16;
        self.volume.store(clamped, Ordering::Release);
        self.batcher
            .batch(
                UpdatePlayer {
                    volume: Some(clamped as i32),
                    ..Default::default()
                },
                false,
            )
            .await
    }

    pub fn set_loop(&self, mode: LoopMode) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::Destroyed("player"));
        }
        self.loop_mode.store(mode as u8, Ordering::Release);
        Ok(())
    }

    pub fn set_text_channel(&self, channel: ChannelId) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::Destroyed("player"));
        }
        *self.text_channel_id.lock() = Some(channel);
        Ok(())
    }

    /// Switch voice channels and re-emit the join packet.
    pub fn set_voice_channel(&self, channel: ChannelId) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::Destroyed("player"));
        }
        if channel.is_empty() {
            return Err(Error::invalid("voice channel id is empty"));
        }
        *self.voice_channel_id.lock() = Some(channel);
        self.send_voice_join();
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    /// Leave the voice channel, keeping the player alive.
    pub fn disconnect(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::Destroyed("player"));
        }
        self.send_voice_leave();
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    pub async fn replay(self: &Arc<Self>) -> Result<()> {
        self.seek(0).await
    }

    pub async fn skip(self: &Arc<Self>) -> Result<()> {
        self.stop().await
    }

    /// Lyrics for the current track, with worker-level fallbacks.
    pub async fn lyrics(
        self: &Arc<Self>,
        skip_track_source: bool,
    ) -> Result<Option<crate::protocol::models::Lyrics>> {
        let node = self.node();
        if let Some(lyrics) = node
            .rest
            .lyrics_for_player(&self.guild_id, skip_track_source)
            .await?
        {
            return Ok(Some(lyrics));
        }
        let Some(current) = self.current() else {
            return Ok(None);
        };
        if let Some(encoded) = current.encoded() {
            if let Some(lyrics) = node.rest.lyrics_find(&encoded).await? {
                return Ok(Some(lyrics));
            }
        }
        let query = format!("{} {}", current.info.title, current.info.author);
        node.rest.lyrics_search(query.trim()).await
    }

    // ── Worker frame handling ───────────────────────────────────────────────

    /// Apply one `playerUpdate` frame.
    pub fn update_state(&self, state: PlayerState) {
        self.position.store(state.position, Ordering::Release);
        self.timestamp.store(state.time, Ordering::Release);
        self.ping.store(state.ping, Ordering::Release);

        let was_connected = self.connected.swap(state.connected, Ordering::AcqRel);
        if was_connected && !state.connected {
            self.voice_down_since.store(now_ms(), Ordering::Release);
        } else if state.connected {
            self.voice_down_since.store(0, Ordering::Release);
        }
    }

    pub(crate) fn voice_down_since(&self) -> u64 {
        self.voice_down_since.load(Ordering::Acquire)
    }

    /// Dispatch one worker event for this guild.
    pub async fn handle_event(self: &Arc<Self>, event: EventPayload) {
        let Some(aqua) = self.aqua() else { return };
        match event {
            EventPayload::TrackStart { track, .. } => {
                self.playing.store(true, Ordering::Release);
                let track = self.current().unwrap_or_else(|| self.wrap_track(track));
                aqua.events().emit(AquaEvent::TrackStart {
                    player: Arc::clone(self),
                    track,
                });
            }
            EventPayload::TrackEnd { track, reason, .. } => {
                self.handle_track_end(&aqua, track, reason).await;
            }
            EventPayload::TrackException { exception, .. } => {
                let current = self.current();
                if let Err(e) = self.stop().await {
                    debug!("[{}] stop after track error: {e}", self.guild_id);
                }
                aqua.events().emit(AquaEvent::TrackError {
                    player: Arc::clone(self),
                    track: current,
                    exception,
                });
            }
            EventPayload::TrackStuck { threshold_ms, .. } => {
                let current = self.current();
                if let Err(e) = self.stop().await {
                    debug!("[{}] stop after stuck track: {e}", self.guild_id);
                }
                aqua.events().emit(AquaEvent::TrackStuck {
                    player: Arc::clone(self),
                    track: current,
                    threshold_ms,
                });
            }
            EventPayload::TrackChange { track, .. } => {
                let track = self.wrap_track(track);
                *self.current.lock() = Some(Arc::clone(&track));
                aqua.events().emit(AquaEvent::TrackChange {
                    player: Arc::clone(self),
                    track,
                });
            }
            EventPayload::WebSocketClosed { code, reason, by_remote, .. } => {
                let payload = serde_json::json!({
                    "code": code,
                    "reason": reason,
                    "byRemote": by_remote,
                });
                self.socket_closed(&aqua, code, payload).await;
            }
        }
    }

    fn wrap_track(self: &Arc<Self>, data: TrackData) -> Arc<Track> {
        Track::from_data(data, None, None, &self.node())
    }

    async fn handle_track_end(self: &Arc<Self>, aqua: &Arc<Aqua>, track: TrackData, reason: TrackEndReason) {
        let ended = self.current().unwrap_or_else(|| self.wrap_track(track));
        {
            self.previous.lock().push(Arc::clone(&ended));
        }
        self.remember_identifier(&ended.info.identifier);
        *self.autoplay_seed.lock() = Some(Arc::clone(&ended));

        if matches!(reason, TrackEndReason::LoadFailed | TrackEndReason::Cleanup) {
            if self.queue_len() == 0 {
                self.clear_data();
                *self.current.lock() = None;
                self.playing.store(false, Ordering::Release);
                aqua.events().emit(AquaEvent::QueueEnd {
                    player: Arc::clone(self),
                });
            } else {
                aqua.events().emit(AquaEvent::TrackEnd {
                    player: Arc::clone(self),
                    track: ended,
                    reason,
                });
                if let Err(e) = self.play(None, PlayOptions::default()).await {
                    aqua.events()
                        .emit_error(Some(self.guild_id.clone()), format!("advance failed: {e}"));
                }
            }
            return;
        }

        if reason == TrackEndReason::Finished {
            match self.loop_mode() {
                LoopMode::Track => self.enqueue_front(Arc::clone(&ended)),
                LoopMode::Queue => self.enqueue(Arc::clone(&ended)),
                LoopMode::None => {}
            }
        }

        if self.queue_len() > 0 {
            aqua.events().emit(AquaEvent::TrackEnd {
                player: Arc::clone(self),
                track: ended,
                reason,
            });
            if let Err(e) = self.play(None, PlayOptions::default()).await {
                aqua.events()
                    .emit_error(Some(self.guild_id.clone()), format!("advance failed: {e}"));
            }
            return;
        }

        if self.is_autoplay_enabled() && reason != TrackEndReason::Replaced {
            aqua.events().emit(AquaEvent::TrackEnd {
                player: Arc::clone(self),
                track: ended,
                reason,
            });
            self.autoplay().await;
            return;
        }

        aqua.events().emit(AquaEvent::TrackEnd {
            player: Arc::clone(self),
            track: ended,
            reason,
        });
        *self.current.lock() = None;
        self.playing.store(false, Ordering::Release);
        self.position.store(0, Ordering::Release);
        aqua.events().emit(AquaEvent::QueueEnd {
            player: Arc::clone(self),
        });
        if aqua.options().leave_on_end {
            let _ = aqua.destroy_player(&self.guild_id).await;
        }
    }

    /// Voice websocket close reaction table.
    async fn socket_closed(self: &Arc<Self>, aqua: &Arc<Aqua>, code: u16, payload: Value) {
        match code {
            // Session invalidated by the platform: unrecoverable.
            4022 => {
                aqua.events().emit(AquaEvent::SocketClosed {
                    player: Arc::clone(self),
                    code,
                    payload,
                });
                let _ = aqua.destroy_player(&self.guild_id).await;
            }
            // Voice server crashed: the session survives a resume.
            4015 => {
                if self.connection.attempt_resume(self).await {
                    return;
                }
                reconnect::start_reconnection(self, aqua, code, payload);
            }
            // Disconnected / moved / session no longer valid: rebuild.
            4014 | 4009 | 4006 => {
                reconnect::start_reconnection(self, aqua, code, payload);
            }
            _ => {
                aqua.events().emit(AquaEvent::SocketClosed {
                    player: Arc::clone(self),
                    code,
                    payload,
                });
            }
        }
    }

    // ── Autoplay ────────────────────────────────────────────────────────────

    /// Derive the next track from the last played one when the queue drains.
    pub async fn autoplay(self: &Arc<Self>) {
        let Some(aqua) = self.aqua() else { return };
        if !self.is_autoplay_enabled() || self.queue_len() > 0 || self.is_destroyed() {
            return;
        }
        let Some(seed) = self.autoplay_seed().or_else(|| self.previous_track()) else {
            return;
        };

        let known = self.previous_identifiers();
        for attempt in 1..=AUTOPLAY_MAX {
            match aqua.autoplay_candidate(self, &seed, &known).await {
                Ok(Some(track)) => {
                    self.enqueue(Arc::clone(&track));
                    if let Err(e) = self.play(None, PlayOptions::default()).await {
                        debug!("[{}] autoplay play failed: {e}", self.guild_id);
                        continue;
                    }
                    return;
                }
                Ok(None) => {
                    debug!("[{}] autoplay attempt {attempt} found nothing", self.guild_id);
                }
                Err(e) => {
                    debug!("[{}] autoplay attempt {attempt} failed: {e}", self.guild_id);
                }
            }
        }

        aqua.events().emit(AquaEvent::AutoplayFailed {
            player: Arc::clone(self),
            message: format!("no autoplay candidate after {AUTOPLAY_MAX} attempts"),
        });
        let _ = self.stop().await;
    }

    // ── Destruction ─────────────────────────────────────────────────────────

    /// Terminal teardown. One-shot: later calls are no-ops.
    pub async fn destroy(self: &Arc<Self>, options: DestroyOptions) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("[{}] destroying player", self.guild_id);

        if let Some(watchdog) = self.watchdog.lock().take() {
            watchdog.abort();
        }
        self.batcher.destroy();
        self.connection.teardown();

        if !options.preserve_message {
            *self.now_playing_message.lock() = None;
        }
        if !options.preserve_reconnecting {
            self.reconnecting.store(false, Ordering::Release);
        }
        if !options.preserve_tracks {
            self.queue.lock().clear();
            self.previous.lock().clear();
            self.previous_identifiers.lock().clear();
            self.data_store.clear();
        }
        if let Some(current) = self.current.lock().take() {
            current.dispose();
        }
        self.playing.store(false, Ordering::Release);

        if !options.preserve_client {
            self.send_voice_leave();
        }
        self.connected.store(false, Ordering::Release);

        let node = self.node();
        node.players.remove(&self.guild_id);
        if !options.skip_remote {
            if let Err(e) = node.rest.destroy_player(&self.guild_id).await {
                debug!("[{}] remote destroy: {e}", self.guild_id);
            }
        }

        if let Some(aqua) = self.aqua() {
            aqua.events().emit(AquaEvent::PlayerDestroy {
                player: Arc::clone(self),
            });
        }
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("guild_id", &self.guild_id)
            .field("playing", &self.is_playing())
            .field("paused", &self.is_paused())
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_mode_parsing() {
        assert_eq!(LoopMode::parse("none").unwrap(), LoopMode::None);
        assert_eq!(LoopMode::parse("TRACK").unwrap(), LoopMode::Track);
        assert_eq!(LoopMode::parse("2").unwrap(), LoopMode::Queue);
        assert!(LoopMode::parse("forever").is_err());
        assert_eq!(LoopMode::from_index(1).unwrap(), LoopMode::Track);
        assert!(LoopMode::from_index(3).is_err());
    }
}
