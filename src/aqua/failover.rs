//! Migration and failover: moving live players between worker nodes.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info, warn};

use crate::{
    aqua::Aqua,
    common::types::{now_ms, ChannelId, GuildId},
    error::{Error, Result},
    events::AquaEvent,
    node::Node,
    player::{
        connection::VoiceCredentials, DestroyOptions, LoopMode, PlayOptions, Player, PlayerOptions,
    },
    track::Track,
};

/// How long a captured broken player stays eligible for rebuild.
pub const BROKEN_PLAYER_TTL_MS: u64 = 300_000;
/// Settle delay before seeking a migrated track.
const SEEK_DELAY: Duration = Duration::from_millis(800);

#[derive(Debug, Clone)]
pub struct PlayerSnapshot {
    pub guild_id: GuildId,
    pub text_channel: Option<ChannelId>,
    pub voice_channel: Option<ChannelId>,
    pub volume: u16,
    pub paused: bool,
    /// Position advanced by wall-clock time since the last state frame,
    /// clamped to the track duration.
    pub position_adjusted: u64,
    pub current: Option<Arc<Track>>,
    pub queue: Vec<Arc<Track>>,
    pub loop_mode: LoopMode,
    pub autoplay_enabled: bool,
    pub autoplay_seed: Option<Arc<Track>>,
    pub previous_identifiers: Vec<String>,
    pub deaf: bool,
    pub mute: bool,
    pub connected: bool,
    pub voice: VoiceCredentials,
    pub now_playing_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BrokenPlayer {
    pub snapshot: PlayerSnapshot,
    pub original_node: String,
    pub broken_at: u64,
}

/// Capture everything needed to rebuild `player` elsewhere.
pub fn capture_player(player: &Arc<Player>) -> PlayerSnapshot {
    let mut position = player.position();
    if player.is_playing() && !player.is_paused() {
        let elapsed = now_ms().saturating_sub(player.timestamp());
        position = position.saturating_add(elapsed);
    }
    if let Some(duration) = player.current().and_then(|t| t.duration()) {
        position = position.min(duration);
    }

    PlayerSnapshot {
        guild_id: player.guild_id().to_string(),
        text_channel: player.text_channel_id(),
        voice_channel: player.voice_channel_id(),
        volume: player.volume(),
        paused: player.is_paused(),
        position_adjusted: position,
        current: player.current(),
        queue: player.queue_snapshot(),
        loop_mode: player.loop_mode(),
        autoplay_enabled: player.is_autoplay_enabled(),
        autoplay_seed: player.autoplay_seed(),
        previous_identifiers: player.previous_identifiers(),
        deaf: player.is_deaf(),
        mute: player.is_mute(),
        connected: player.is_connected(),
        voice: player.connection().credentials(),
        now_playing_message: player.now_playing_message(),
    }
}

impl Aqua {
    /// Atomically move one player onto `target`. The guild map never points
    /// at two live players: the old instance is discarded and destroyed
    /// before the replacement is inserted.
    pub async fn move_player_to_node(
        self: &Arc<Self>,
        guild_id: &str,
        target: &Arc<Node>,
        reason: &'static str,
    ) -> Result<Arc<Player>> {
        if target.is_destroyed() || !target.is_connected() {
            return Err(Error::invalid(format!("target node {} is unavailable", target.name)));
        }
        let old = self.get(guild_id)?;
        let snapshot = capture_player(&old);
        self.record_trace(
            "player_migrate",
            serde_json::json!({ "guild": guild_id, "to": target.name, "reason": reason }),
        );

        self.discard_player(guild_id);
        old.destroy(DestroyOptions {
            preserve_client: true,
            skip_remote: true,
            preserve_message: true,
            preserve_tracks: true,
            preserve_reconnecting: true,
        })
        .await;

        let new_player = self.rebuild_from_snapshot(target, &snapshot, true).await?;
        self.events().emit(AquaEvent::PlayerMigrated {
            old,
            new: new_player.clone(),
            node: target.clone(),
            reason,
        });
        Ok(new_player)
    }

    /// Recreate a player from a snapshot on `node` and restore playback.
    /// Restore-side failures are surfaced as events, not hard errors.
    pub(crate) async fn rebuild_from_snapshot(
        self: &Arc<Self>,
        node: &Arc<Node>,
        snapshot: &PlayerSnapshot,
        copy_voice: bool,
    ) -> Result<Arc<Player>> {
        let options = PlayerOptions {
            guild_id: snapshot.guild_id.clone(),
            text_channel: snapshot.text_channel.clone(),
            voice_channel: snapshot.voice_channel.clone(),
            default_volume: Some(snapshot.volume),
            deaf: snapshot.deaf,
            mute: snapshot.mute,
        };
        let player = Player::new(self, node.clone(), options);
        self.insert_player(player.clone());
        if snapshot.connected {
            // The gateway session is still live; no re-join packet needed.
            player.connect(&PlayerOptions {
                guild_id: snapshot.guild_id.clone(),
                voice_channel: snapshot.voice_channel.clone(),
                deaf: snapshot.deaf,
                mute: snapshot.mute,
                ..Default::default()
            })?;
        }

        let _ = player.set_loop(snapshot.loop_mode);
        player.set_autoplay(snapshot.autoplay_enabled);
        player.set_autoplay_seed(snapshot.autoplay_seed.clone());
        player.restore_previous_identifiers(snapshot.previous_identifiers.clone());
        player.set_now_playing_message(snapshot.now_playing_message.clone());
        for track in &snapshot.queue {
            let is_current = snapshot
                .current
                .as_ref()
                .is_some_and(|c| Arc::ptr_eq(c, track));
            if !is_current {
                player.enqueue(Arc::clone(track));
            }
        }

        if copy_voice && snapshot.voice.is_complete() {
            player
                .connection()
                .adopt_credentials(&player, snapshot.voice.clone());
        }

        if let Some(current) = &snapshot.current {
            if self.options().failover.resume_playback {
                self.restore_playback(&player, current, snapshot).await;
            }
        }
        Ok(player)
    }

    async fn restore_playback(
        self: &Arc<Self>,
        player: &Arc<Player>,
        current: &Arc<Track>,
        snapshot: &PlayerSnapshot,
    ) {
        // Every step is best-effort; collect failures without aborting.
        let mut errors: Vec<String> = Vec::new();

        if let Err(e) = player.play(Some(Arc::clone(current)), PlayOptions::default()).await {
            errors.push(format!("play: {e}"));
        } else if crate::player::wait_for_track_start(player).await {
            if self.options().failover.preserve_position && snapshot.position_adjusted > 0 {
                tokio::time::sleep(SEEK_DELAY).await;
                if let Err(e) = player.seek(snapshot.position_adjusted as i64).await {
                    errors.push(format!("seek: {e}"));
                }
            }
            if snapshot.paused {
                if let Err(e) = player.pause(true).await {
                    errors.push(format!("pause: {e}"));
                }
            }
        }

        for error in errors {
            self.events()
                .emit_error(Some(snapshot.guild_id.clone()), format!("restore: {error}"));
        }
    }

    // ── Node failure handling ───────────────────────────────────────────────

    /// Capture state for every player on a disconnecting node, then (if
    /// enabled and capacity exists) migrate them elsewhere.
    pub(crate) async fn on_node_disconnect(self: &Arc<Self>, node: &Arc<Node>) {
        self.invalidate_nodes_cache();
        self.capture_broken_players(node);

        if !self.options().failover.enabled {
            return;
        }
        let candidates: Vec<Arc<Node>> = self
            .least_used_nodes()
            .into_iter()
            .filter(|n| n.name != node.name)
            .collect();
        if candidates.is_empty() {
            debug!("[{}] no failover candidates; waiting for node return", node.name);
            return;
        }

        // Per-node cooldown and attempt cap.
        let now = now_ms();
        let cooldown = self.options().failover.cooldown_ms;
        if let Some(last) = self.last_failover_attempt.get(&node.name) {
            if now.saturating_sub(*last) < cooldown {
                debug!("[{}] failover cooling down", node.name);
                return;
            }
        }
        self.last_failover_attempt.insert(node.name.clone(), now);
        let attempts = {
            let mut entry = self.failover_queue.entry(node.name.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        if attempts > self.options().failover.max_failover_attempts {
            warn!("[{}] failover attempt cap reached", node.name);
            return;
        }

        self.events().emit(AquaEvent::NodeFailover { node: node.clone() });
        let (migrated, failed) = self.failover_players(node, candidates).await;
        info!("[{}] failover complete: {migrated} migrated, {failed} failed", node.name);
        self.events().emit(AquaEvent::NodeFailoverComplete {
            node: node.clone(),
            migrated,
            failed,
        });
    }

    fn capture_broken_players(&self, node: &Arc<Node>) {
        let now = now_ms();
        // Age out stale entries while we are here.
        self.broken_players
            .retain(|_, b| now.saturating_sub(b.broken_at) <= BROKEN_PLAYER_TTL_MS);

        for guild_id in node.players.iter().map(|g| g.clone()).collect::<Vec<_>>() {
            let Some(player) = self.player(&guild_id) else { continue };
            if player.is_destroyed() {
                continue;
            }
            self.broken_players.insert(
                guild_id.clone(),
                BrokenPlayer {
                    snapshot: capture_player(&player),
                    original_node: node.name.clone(),
                    broken_at: now,
                },
            );
        }
        self.record_trace(
            "broken_capture",
            serde_json::json!({ "node": node.name, "count": node.players.len() }),
        );
    }

    /// Migrate this node's players in bounded concurrent batches, balancing
    /// targets by load score plus how many players this batch already put
    /// on them.
    async fn failover_players(
        self: &Arc<Self>,
        node: &Arc<Node>,
        candidates: Vec<Arc<Node>>,
    ) -> (usize, usize) {
        let guilds: Vec<GuildId> = node.players.iter().map(|g| g.clone()).collect();
        let batch_size = self.options().failover.max_concurrent.max(1);
        let assigned: Arc<dashmap::DashMap<String, usize>> = Arc::new(dashmap::DashMap::new());

        let mut migrated = 0usize;
        let mut failed = 0usize;

        for chunk in guilds.chunks(batch_size) {
            let mut batch = FuturesUnordered::new();
            for guild_id in chunk {
                let aqua = Arc::clone(self);
                let guild_id = guild_id.clone();
                let candidates = candidates.clone();
                let assigned = Arc::clone(&assigned);
                batch.push(async move {
                    let target = candidates
                        .iter()
                        .min_by(|a, b| {
                            let a_load = a.load_score()
                                + assigned.get(&a.name).map(|c| *c).unwrap_or(0) as f64;
                            let b_load = b.load_score()
                                + assigned.get(&b.name).map(|c| *c).unwrap_or(0) as f64;
                            a_load.partial_cmp(&b_load).unwrap_or(std::cmp::Ordering::Equal)
                        })
                        .cloned();
                    let Some(target) = target else { return (guild_id, false) };
                    *assigned.entry(target.name.clone()).or_insert(0) += 1;

                    match aqua.move_player_to_node(&guild_id, &target, "failover").await {
                        Ok(_) => {
                            aqua.broken_players.remove(&guild_id);
                            (guild_id, true)
                        }
                        Err(e) => {
                            warn!("[{guild_id}] failover migration failed: {e}");
                            (guild_id, false)
                        }
                    }
                });
            }
            while let Some((_, ok)) = batch.next().await {
                if ok {
                    migrated += 1;
                } else {
                    failed += 1;
                }
            }
        }
        (migrated, failed)
    }

    /// Node destroy path: same capture + migrate flow, then registry cleanup.
    pub(crate) async fn on_node_destroyed(self: &Arc<Self>, node: &Arc<Node>) {
        self.on_node_disconnect(node).await;
        self.nodes.remove(&node.name);
        self.invalidate_nodes_cache();
    }

    /// The worker issued a fresh session: our remote players are gone, so
    /// the local ones bound to this node must go too.
    pub(crate) async fn on_session_invalidated(self: &Arc<Self>, node: &Arc<Node>) {
        let guilds: Vec<GuildId> = node.players.iter().map(|g| g.clone()).collect();
        if guilds.is_empty() {
            return;
        }
        warn!(
            "[{}] session invalidated; destroying {} bound players",
            node.name,
            guilds.len()
        );
        for guild_id in guilds {
            let _ = self.destroy_player(&guild_id).await;
        }
    }

    /// Rebuild broken players owned by a node that just became ready again.
    /// Entries older than the TTL are dropped; rebuilds are serialized
    /// per-guild by the lock set.
    pub(crate) async fn rebuild_broken_players(self: &Arc<Self>, node: &Arc<Node>) {
        let now = now_ms();
        let mine: Vec<(GuildId, BrokenPlayer)> = self
            .broken_players
            .iter()
            .filter(|entry| entry.original_node == node.name)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (guild_id, broken) in mine {
            if now.saturating_sub(broken.broken_at) > BROKEN_PLAYER_TTL_MS {
                self.broken_players.remove(&guild_id);
                continue;
            }
            if !self.rebuild_locks.insert(guild_id.clone()) {
                continue; // rebuild already running for this guild
            }
            self.broken_players.remove(&guild_id);

            if let Some(existing) = self.player(&guild_id) {
                if !existing.is_destroyed() {
                    // Already recovered through another path (failover).
                    self.rebuild_locks.remove(&guild_id);
                    continue;
                }
                self.discard_player(&guild_id);
            }

            debug!("[{guild_id}] rebuilding broken player on {}", node.name);
            match self.rebuild_from_snapshot(node, &broken.snapshot, true).await {
                Ok(_) => {
                    self.record_trace(
                        "broken_rebuild",
                        serde_json::json!({ "guild": guild_id, "node": node.name }),
                    );
                }
                Err(e) => {
                    warn!("[{guild_id}] broken player rebuild failed: {e}");
                    self.events()
                        .emit_error(Some(guild_id.clone()), format!("rebuild failed: {e}"));
                }
            }
            self.rebuild_locks.remove(&guild_id);
        }

        // Node is healthy again; reset its failover bookkeeping.
        self.failover_queue.remove(&node.name);
        self.last_failover_attempt.remove(&node.name);
        self.invalidate_nodes_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_defaults_are_inert() {
        let snapshot = PlayerSnapshot {
            guild_id: "G".into(),
            text_channel: None,
            voice_channel: None,
            volume: 100,
            paused: false,
            position_adjusted: 0,
            current: None,
            queue: Vec::new(),
            loop_mode: LoopMode::None,
            autoplay_enabled: false,
            autoplay_seed: None,
            previous_identifiers: Vec::new(),
            deaf: false,
            mute: false,
            connected: false,
            voice: VoiceCredentials::default(),
            now_playing_message: None,
        };
        assert!(!snapshot.voice.is_complete());
        assert!(snapshot.current.is_none());
    }
}
