//! Voice-session recovery: the rebuild sequence and the watchdog.
//!
//! When the voice websocket dies with a rebuild-worthy close code the player
//! is torn down locally (keeping the gateway session and the remote player)
//! and recreated from a snapshot. The watchdog covers the quieter failure
//! mode where the voice link just stays down without a close frame.

use std::sync::{atomic::Ordering, Arc};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    aqua::Aqua,
    events::AquaEvent,
    player::{DestroyOptions, LoopMode, PlayOptions, Player, PlayerOptions},
    track::Track,
};

/// Rebuild attempts before giving up.
const RECONNECT_MAX: u32 = 3;
/// Linear backoff step between rebuild attempts.
const RETRY_BACKOFF_BASE_MS: u64 = 1_500;
/// Backoff ceiling.
const RETRY_BACKOFF_MAX_MS: u64 = 5_000;
/// Settle time before seeking a restored track.
const SEEK_DELAY: Duration = Duration::from_millis(800);
/// Settle time before re-pausing a restored track.
const PAUSE_DELAY: Duration = Duration::from_millis(1_200);
/// Positions under this are not worth seeking back to.
const SEEK_THRESHOLD_MS: u64 = 5_000;
/// How long to wait for the worker's TrackStart after a restore play.
const TRACK_START_TIMEOUT: Duration = Duration::from_secs(5);

/// Watchdog cadence.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(15);
/// Voice link downtime before recovery kicks in.
const VOICE_DOWN_THRESHOLD_MS: u64 = 10_000;
/// Downtime multiplier after which a credential-less player is abandoned.
const VOICE_ABANDON_MULTIPLIER: u64 = 3;
/// Pause between the two halves of the mute toggle.
const MUTE_TOGGLE_WAIT: Duration = Duration::from_millis(300);

struct Snapshot {
    volume: u16,
    position: u64,
    paused: bool,
    loop_mode: LoopMode,
    autoplay_enabled: bool,
    autoplay_seed: Option<Arc<Track>>,
    current: Option<Arc<Track>>,
    queue: Vec<Arc<Track>>,
    previous_identifiers: Vec<String>,
    text_channel: Option<String>,
    voice_channel: Option<String>,
    deaf: bool,
    mute: bool,
}

fn capture(player: &Arc<Player>) -> Snapshot {
    Snapshot {
        volume: player.volume(),
        position: player.position(),
        paused: player.is_paused(),
        loop_mode: player.loop_mode(),
        autoplay_enabled: player.is_autoplay_enabled(),
        autoplay_seed: player.autoplay_seed(),
        current: player.current(),
        queue: player.queue_snapshot(),
        previous_identifiers: player.previous_identifiers(),
        text_channel: player.text_channel_id(),
        voice_channel: player.voice_channel_id(),
        deaf: player.is_deaf(),
        mute: player.is_mute(),
    }
}

/// Kick off the rebuild sequence. A single in-flight flag prevents
/// re-entry; concurrent close codes collapse into one rebuild.
pub(super) fn start_reconnection(player: &Arc<Player>, aqua: &Arc<Aqua>, code: u16, payload: Value) {
    if player.reconnecting.swap(true, Ordering::AcqRel) {
        return;
    }
    let player = Arc::clone(player);
    let aqua = Arc::clone(aqua);
    tokio::spawn(async move {
        run_reconnection(player, aqua, code, payload).await;
    });
}

async fn run_reconnection(old: Arc<Player>, aqua: Arc<Aqua>, code: u16, payload: Value) {
    let guild_id = old.guild_id().to_string();
    let snapshot = capture(&old);

    aqua.discard_player(&guild_id);
    old.destroy(DestroyOptions {
        preserve_client: true,
        skip_remote: true,
        preserve_reconnecting: true,
        ..Default::default()
    })
    .await;

    for attempt in 1..=RECONNECT_MAX {
        let delay = (RETRY_BACKOFF_BASE_MS * attempt as u64).min(RETRY_BACKOFF_MAX_MS);
        tokio::time::sleep(Duration::from_millis(delay)).await;

        match try_rebuild(&aqua, &guild_id, &snapshot).await {
            Ok(new_player) => {
                aqua.events().emit(AquaEvent::PlayerReconnected {
                    old: Arc::clone(&old),
                    new: new_player,
                });
                return;
            }
            Err(e) => {
                warn!("[{guild_id}] voice rebuild attempt {attempt} failed: {e}");
            }
        }
    }

    aqua.events().emit(AquaEvent::ReconnectionFailed {
        guild_id: guild_id.clone(),
        message: format!("gave up after {RECONNECT_MAX} rebuild attempts"),
    });
    aqua.events().emit(AquaEvent::SocketClosed {
        player: old,
        code,
        payload,
    });
}

async fn try_rebuild(
    aqua: &Arc<Aqua>,
    guild_id: &str,
    snapshot: &Snapshot,
) -> crate::error::Result<Arc<Player>> {
    let options = PlayerOptions {
        guild_id: guild_id.to_string(),
        text_channel: snapshot.text_channel.clone(),
        voice_channel: snapshot.voice_channel.clone(),
        default_volume: Some(snapshot.volume),
        deaf: snapshot.deaf,
        mute: snapshot.mute,
    };
    let player = aqua.create_connection(options).await?;

    player.set_loop(snapshot.loop_mode)?;
    player.set_autoplay(snapshot.autoplay_enabled);
    player.set_autoplay_seed(snapshot.autoplay_seed.clone());
    player.restore_previous_identifiers(snapshot.previous_identifiers.clone());

    // Interrupted track goes back to the head exactly once, then the rest
    // of the old queue behind it.
    for track in &snapshot.queue {
        let is_current = snapshot
            .current
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(c, track));
        if !is_current {
            player.enqueue(Arc::clone(track));
        }
    }

    if let Some(current) = &snapshot.current {
        player.play(Some(Arc::clone(current)), PlayOptions::default()).await?;

        if wait_for_track_start(&player).await {
            if snapshot.position > SEEK_THRESHOLD_MS {
                tokio::time::sleep(SEEK_DELAY).await;
                if let Err(e) = player.seek(snapshot.position as i64).await {
                    debug!("[{guild_id}] restore seek failed: {e}");
                }
            }
            if snapshot.paused {
                tokio::time::sleep(PAUSE_DELAY).await;
                if let Err(e) = player.pause(true).await {
                    debug!("[{guild_id}] restore pause failed: {e}");
                }
            }
        }
    }

    Ok(player)
}

/// Poll for the worker's TrackStart (observable as `playing`).
pub(crate) async fn wait_for_track_start(player: &Arc<Player>) -> bool {
    let deadline = tokio::time::Instant::now() + TRACK_START_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if player.is_playing() {
            return true;
        }
        if player.is_destroyed() {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    player.is_playing()
}

/// Periodic voice-health check, one task per player.
pub(super) fn spawn_watchdog(player: &Arc<Player>) {
    let weak = Arc::downgrade(player);
    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(WATCHDOG_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(player) = weak.upgrade() else { break };
            if player.is_destroyed() {
                break;
            }
            if player.is_reconnecting() {
                continue;
            }
            check_voice_health(&player).await;
        }
    });
    *player.watchdog.lock() = Some(handle);
}

async fn check_voice_health(player: &Arc<Player>) {
    let down_since = player.voice_down_since();
    if down_since == 0 {
        return;
    }
    let downtime = crate::common::types::now_ms().saturating_sub(down_since);
    if downtime < VOICE_DOWN_THRESHOLD_MS {
        return;
    }

    let conn = player.connection();
    let has_creds = conn.has_valid_voice_data();

    if !has_creds && downtime >= VOICE_DOWN_THRESHOLD_MS * VOICE_ABANDON_MULTIPLIER {
        warn!("[{}] voice abandoned; destroying player", player.guild_id());
        if let Some(aqua) = player.aqua() {
            let _ = aqua.destroy_player(player.guild_id()).await;
        }
        return;
    }

    if conn.reconnect_attempts() >= super::connection::MAX_RECONNECT_ATTEMPTS {
        return;
    }

    debug!("[{}] voice link down {downtime}ms; recovering", player.guild_id());
    if has_creds && conn.attempt_resume(player).await {
        return;
    }

    // Provoke a fresh VOICE_STATE_UPDATE from the gateway, then re-push the
    // credentials we hold.
    let channel = player.voice_channel_id();
    player.send_voice_packet(channel.clone(), player.is_deaf(), true);
    tokio::time::sleep(MUTE_TOGGLE_WAIT).await;
    player.send_voice_packet(channel, player.is_deaf(), player.is_mute());
    conn.resend_voice_update(player, true);
}
