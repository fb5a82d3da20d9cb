//! Per-player voice credential state machine.
//!
//! Consumes gateway `VOICE_STATE_UPDATE` / `VOICE_SERVER_UPDATE` packets,
//! reconciles `(sessionId, endpoint, token, region)` and pushes coalesced
//! voice updates to the owning node. Stale packets are dropped by txId,
//! duplicate updates by fingerprint.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{
    atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    common::types::{now_ms, GuildId},
    player::{
        payload::{PayloadPool, VoicePayload},
        region::extract_region,
        Player,
    },
    protocol::models::VoiceState,
};

/// Voice credentials go stale if the gateway stays silent this long.
pub const VOICE_DATA_TIMEOUT_MS: u64 = 90_000;
/// Coalescing window for voice updates.
pub const VOICE_FLUSH_DELAY: Duration = Duration::from_millis(50);
/// Grace period after the gateway reports a null channel.
pub const NULL_CHANNEL_GRACE: Duration = Duration::from_secs(15);
/// Resume attempts before giving up on the voice session.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;
/// Consecutive failures before giving up regardless of attempt count.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;
/// Base delay between resume attempts.
const RECONNECT_DELAY_MS: u64 = 2_000;
/// Resume backoff ceiling.
const RESUME_BACKOFF_MAX_MS: u64 = 60_000;
/// Minimum spacing between gateway voice-state re-requests.
const VOICE_REQUEST_INTERVAL_MS: u64 = 1_500;

// State flag bits.
pub const CONNECTED: u8 = 1 << 0;
pub const UPDATE_SCHEDULED: u8 = 1 << 1;
pub const DISCONNECTING: u8 = 1 << 2;
pub const ATTEMPTING_RESUME: u8 = 1 << 3;
pub const VOICE_DATA_STALE: u8 = 1 << 4;

/// `VOICE_SERVER_UPDATE` payload, demuxed by the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct ServerUpdate {
    pub endpoint: Option<String>,
    pub token: String,
    pub tx_id: Option<u64>,
}

/// `VOICE_STATE_UPDATE` payload, demuxed by the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    pub session_id: String,
    pub channel_id: Option<String>,
    pub self_deaf: bool,
    pub self_mute: bool,
    pub user_id: String,
    pub tx_id: Option<u64>,
}

#[derive(Debug, Default, Clone)]
pub struct VoiceCredentials {
    pub session_id: Option<String>,
    pub endpoint: Option<String>,
    pub token: Option<String>,
    pub region: Option<String>,
    pub last_endpoint: Option<String>,
    pub last_voice_data_update: u64,
}

impl VoiceCredentials {
    pub fn is_complete(&self) -> bool {
        self.session_id.is_some() && self.endpoint.is_some() && self.token.is_some()
    }
}

pub struct Connection {
    guild_id: GuildId,
    creds: Mutex<VoiceCredentials>,
    flags: AtomicU8,
    /// Per-generation stamp used to drop stale gateway packets.
    tx_id: AtomicU64,
    /// Bumped on every accepted server update; detects races across awaits.
    state_generation: AtomicU64,
    /// Monotonic within an endpoint; resets when the endpoint changes.
    sequence: AtomicU64,
    reconnect_attempts: AtomicU32,
    consecutive_failures: AtomicU32,
    last_voice_request: AtomicU64,
    last_sent_fingerprint: AtomicU64,
    null_channel_timer: Mutex<Option<JoinHandle<()>>>,
    flush_timer: Mutex<Option<JoinHandle<()>>>,
    pool: Mutex<PayloadPool>,
    pending: Mutex<Option<Box<VoicePayload>>>,
}

impl Connection {
    pub fn new(guild_id: GuildId) -> Self {
        Self {
            guild_id,
            creds: Mutex::new(VoiceCredentials::default()),
            flags: AtomicU8::new(0),
            tx_id: AtomicU64::new(0),
            state_generation: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
            reconnect_attempts: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
            last_voice_request: AtomicU64::new(0),
            last_sent_fingerprint: AtomicU64::new(0),
            null_channel_timer: Mutex::new(None),
            flush_timer: Mutex::new(None),
            pool: Mutex::new(PayloadPool::new()),
            pending: Mutex::new(None),
        }
    }

    pub fn flags(&self) -> u8 {
        self.flags.load(Ordering::Acquire)
    }

    fn set_flag(&self, bit: u8) {
        self.flags.fetch_or(bit, Ordering::AcqRel);
    }

    fn clear_flag(&self, bit: u8) {
        self.flags.fetch_and(!bit, Ordering::AcqRel);
    }

    pub fn is_connected(&self) -> bool {
        self.flags() & CONNECTED != 0
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    pub(crate) fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Acquire)
    }

    /// Current generation stamp for outgoing gateway packets. Stamping is a
    /// read; the generation only advances when new voice credentials are
    /// accepted, so packets stamped before that point compare stale.
    pub fn tx_id(&self) -> u64 {
        self.tx_id.load(Ordering::Acquire)
    }

    fn bump_tx_id(&self) {
        self.tx_id.fetch_add(1, Ordering::AcqRel);
    }

    pub fn region(&self) -> Option<String> {
        self.creds.lock().region.clone()
    }

    pub fn credentials(&self) -> VoiceCredentials {
        self.creds.lock().clone()
    }

    /// Copy credentials from a player being migrated away from, then force a
    /// voice update against the new node.
    pub fn adopt_credentials(&self, player: &Arc<Player>, creds: VoiceCredentials) {
        {
            let mut guard = self.creds.lock();
            *guard = creds;
            guard.last_voice_data_update = now_ms();
        }
        self.bump_tx_id();
        self.clear_flag(VOICE_DATA_STALE);
        self.set_flag(CONNECTED);
        self.resend_voice_update(player, true);
    }

    /// Credentials are usable only while fresh.
    pub fn has_valid_voice_data(&self) -> bool {
        let creds = self.creds.lock();
        creds.is_complete()
            && now_ms().saturating_sub(creds.last_voice_data_update) <= VOICE_DATA_TIMEOUT_MS
    }

    // ── Gateway inputs ──────────────────────────────────────────────────────

    pub fn set_server_update(&self, player: &Arc<Player>, data: ServerUpdate) {
        if player.is_destroyed() || data.token.is_empty() {
            return;
        }
        let endpoint = match data.endpoint.as_deref() {
            Some(e) if !e.is_empty() => e.to_string(),
            // Voice server being reallocated; a follow-up packet will carry
            // the new endpoint.
            _ => return,
        };
        if let Some(tx) = data.tx_id {
            if tx < self.tx_id.load(Ordering::Acquire) {
                debug!("[{}] dropping stale voice server update", self.guild_id);
                return;
            }
        }

        let region = {
            let mut creds = self.creds.lock();
            if creds.endpoint.as_deref() == Some(endpoint.as_str())
                && creds.token.as_deref() == Some(data.token.as_str())
            {
                return;
            }
            self.state_generation.fetch_add(1, Ordering::AcqRel);
            // New credential generation: packets stamped before this point
            // are stale from here on.
            self.bump_tx_id();

            if creds.last_endpoint.as_deref() != Some(endpoint.as_str()) {
                self.sequence.store(0, Ordering::Release);
                self.reconnect_attempts.store(0, Ordering::Release);
                self.consecutive_failures.store(0, Ordering::Release);
            }
            let region = extract_region(&endpoint);
            creds.region = Some(region.clone());
            creds.last_endpoint = Some(endpoint.clone());
            creds.endpoint = Some(endpoint);
            creds.token = Some(data.token);
            creds.last_voice_data_update = now_ms();
            region
        };
        self.clear_flag(VOICE_DATA_STALE);

        // A fresh voice server means the stream must be reopened.
        if player.is_paused() {
            player.set_paused_flag(false);
        }

        if !player.maybe_migrate_for_region(&region) {
            self.schedule_voice_update(player, false);
        }
    }

    pub fn set_state_update(&self, player: &Arc<Player>, client_id: &str, data: StateUpdate) {
        if player.is_destroyed() || data.user_id != client_id {
            return;
        }
        if let Some(tx) = data.tx_id {
            if tx < self.tx_id.load(Ordering::Acquire) {
                debug!("[{}] dropping stale voice state update", self.guild_id);
                return;
            }
        }

        let Some(channel_id) = data.channel_id else {
            self.start_null_channel_grace(player);
            return;
        };
        self.cancel_null_channel_grace();

        let mut changed = false;
        let old_channel = player.voice_channel_id();
        if old_channel.as_deref() != Some(channel_id.as_str()) {
            player.note_voice_channel_moved(old_channel, Some(channel_id.clone()));
            changed = true;
        }
        {
            let mut creds = self.creds.lock();
            if creds.session_id.as_deref() != Some(data.session_id.as_str()) {
                creds.session_id = Some(data.session_id);
                creds.last_voice_data_update = now_ms();
                changed = true;
            }
        }
        player.set_deaf_mute(data.self_deaf, data.self_mute);
        self.set_flag(CONNECTED);

        if changed {
            self.schedule_voice_update(player, false);
        }
    }

    fn start_null_channel_grace(&self, player: &Arc<Player>) {
        let mut timer = self.null_channel_timer.lock();
        if timer.is_some() {
            return;
        }
        debug!("[{}] null voice channel; starting disconnect grace", self.guild_id);
        let player = Arc::clone(player);
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(NULL_CHANNEL_GRACE).await;
            player.connection().disconnect(&player).await;
        }));
    }

    fn cancel_null_channel_grace(&self) {
        if let Some(timer) = self.null_channel_timer.lock().take() {
            timer.abort();
        }
    }

    // ── Voice update scheduling ─────────────────────────────────────────────

    /// Rebuild the pending payload and arm the flush timer. Repeated calls
    /// within the window refresh the payload; only one timer runs.
    pub fn schedule_voice_update(&self, player: &Arc<Player>, force: bool) {
        {
            let creds = self.creds.lock();
            if !creds.is_complete() {
                return;
            }
            let mut pending = self.pending.lock();
            let mut payload = pending
                .take()
                .unwrap_or_else(|| self.pool.lock().acquire());
            payload.voice = VoiceState {
                token: creds.token.clone().unwrap_or_default(),
                endpoint: creds.endpoint.clone().unwrap_or_default(),
                session_id: creds.session_id.clone().unwrap_or_default(),
                channel_id: player.voice_channel_id(),
                resume: None,
                sequence: None,
            };
            payload.volume = Some(player.volume() as i32);
            *pending = Some(payload);
        }
        if force {
            self.last_sent_fingerprint.store(0, Ordering::Release);
        }

        if self.flags() & UPDATE_SCHEDULED != 0 {
            return;
        }
        self.set_flag(UPDATE_SCHEDULED);
        let player = Arc::clone(player);
        let mut timer = self.flush_timer.lock();
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(VOICE_FLUSH_DELAY).await;
            let conn = player.connection();
            conn.clear_flag(UPDATE_SCHEDULED);
            conn.execute_voice_update(&player).await;
        }));
    }

    /// Re-send the current credentials, optionally bypassing the
    /// duplicate-fingerprint guard.
    pub fn resend_voice_update(&self, player: &Arc<Player>, force: bool) {
        self.schedule_voice_update(player, force);
    }

    async fn execute_voice_update(&self, player: &Arc<Player>) {
        if player.is_destroyed() || !self.has_valid_voice_data() {
            self.drop_pending();
            return;
        }
        let Some(payload) = self.pending.lock().take() else {
            return;
        };

        let fingerprint = Self::fingerprint(&payload);
        if fingerprint == self.last_sent_fingerprint.load(Ordering::Acquire) {
            debug!("[{}] voice update unchanged; dropping", self.guild_id);
            self.pool.lock().release(payload);
            return;
        }

        let update = payload.to_update();
        self.pool.lock().release(payload);
        match player.batcher().batch(update, true).await {
            Ok(()) => {
                self.last_sent_fingerprint.store(fingerprint, Ordering::Release);
            }
            Err(e) => {
                warn!("[{}] voice update failed: {e}", self.guild_id);
            }
        }
    }

    fn fingerprint(payload: &VoicePayload) -> u64 {
        let mut hasher = DefaultHasher::new();
        payload.voice.session_id.hash(&mut hasher);
        payload.voice.token.hash(&mut hasher);
        payload.voice.endpoint.hash(&mut hasher);
        payload.voice.channel_id.hash(&mut hasher);
        payload.volume.hash(&mut hasher);
        hasher.finish().max(1)
    }

    fn drop_pending(&self) {
        if let Some(payload) = self.pending.lock().take() {
            self.pool.lock().release(payload);
        }
    }

    // ── Resume protocol ─────────────────────────────────────────────────────

    /// Try to re-attach the worker's voice session in place. Returns whether
    /// the resume payload was delivered.
    fn attempt_resume_boxed<'a>(
        &'a self,
        player: &'a Arc<Player>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send + 'a>> {
        Box::pin(self.attempt_resume(player))
    }

    pub async fn attempt_resume(&self, player: &Arc<Player>) -> bool {
        if player.is_destroyed()
            || self.reconnect_attempts.load(Ordering::Acquire) >= MAX_RECONNECT_ATTEMPTS
            || self.flags() & (ATTEMPTING_RESUME | DISCONNECTING) != 0
        {
            return false;
        }

        if !self.has_valid_voice_data() {
            // Credentials are missing or stale; if the player is mid-recovery
            // poke the gateway for a fresh voice state instead.
            if player.is_resuming() {
                self.request_voice_state(player);
            }
            return false;
        }

        self.set_flag(ATTEMPTING_RESUME);
        let generation = self.state_generation.load(Ordering::Acquire);

        let update = {
            let creds = self.creds.lock();
            let mut payload = self.pool.lock().acquire();
            payload.voice = VoiceState {
                token: creds.token.clone().unwrap_or_default(),
                endpoint: creds.endpoint.clone().unwrap_or_default(),
                session_id: creds.session_id.clone().unwrap_or_default(),
                channel_id: player.voice_channel_id(),
                resume: Some(true),
                sequence: Some(self.sequence()),
            };
            let update = payload.to_update();
            self.pool.lock().release(payload);
            update
        };

        let result = player.batcher().batch(update, true).await;

        if self.state_generation.load(Ordering::Acquire) != generation {
            debug!("[{}] voice state changed mid-resume; aborting", self.guild_id);
            self.clear_flag(ATTEMPTING_RESUME);
            return false;
        }

        match result {
            Ok(()) => {
                self.reconnect_attempts.store(0, Ordering::Release);
                self.consecutive_failures.store(0, Ordering::Release);
                player.set_resuming(false);
                self.clear_flag(ATTEMPTING_RESUME);
                true
            }
            Err(e) => {
                warn!("[{}] resume attempt failed: {e}", self.guild_id);
                let attempts = self.reconnect_attempts.fetch_add(1, Ordering::AcqRel) + 1;
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                self.clear_flag(ATTEMPTING_RESUME);

                if attempts < MAX_RECONNECT_ATTEMPTS && failures < MAX_CONSECUTIVE_FAILURES {
                    let delay = resume_backoff(attempts);
                    let player = Arc::clone(player);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        player.connection().attempt_resume_boxed(&player).await;
                    });
                } else {
                    self.disconnect(player).await;
                }
                false
            }
        }
    }

    /// Ask the gateway to re-emit our voice state, at most once per
    /// [`VOICE_REQUEST_INTERVAL_MS`].
    fn request_voice_state(&self, player: &Arc<Player>) {
        let now = now_ms();
        let last = self.last_voice_request.load(Ordering::Acquire);
        if now.saturating_sub(last) < VOICE_REQUEST_INTERVAL_MS {
            return;
        }
        self.last_voice_request.store(now, Ordering::Release);
        player.send_voice_join();
    }

    // ── Teardown ────────────────────────────────────────────────────────────

    /// Drop credentials and ask the orchestrator to destroy the player.
    pub async fn disconnect(&self, player: &Arc<Player>) {
        if self.flags() & DISCONNECTING != 0 {
            return;
        }
        self.set_flag(DISCONNECTING);
        self.cancel_timers();
        {
            let mut creds = self.creds.lock();
            creds.session_id = None;
            creds.endpoint = None;
            creds.token = None;
        }
        self.set_flag(VOICE_DATA_STALE);
        self.clear_flag(CONNECTED);

        if let Some(aqua) = player.aqua() {
            if let Err(e) = aqua.destroy_player(&self.guild_id).await {
                debug!("[{}] destroy on disconnect: {e}", self.guild_id);
            }
        }
        self.clear_flag(DISCONNECTING);
    }

    /// Cancel timers and drop the pending payload; called from player
    /// destruction.
    pub fn teardown(&self) {
        self.cancel_timers();
        self.drop_pending();
    }

    fn cancel_timers(&self) {
        self.cancel_null_channel_grace();
        if let Some(timer) = self.flush_timer.lock().take() {
            timer.abort();
        }
    }
}

fn resume_backoff(attempt: u32) -> Duration {
    let exp = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis((RECONNECT_DELAY_MS * exp).min(RESUME_BACKOFF_MAX_MS))
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("guild_id", &self.guild_id)
            .field("flags", &self.flags())
            .field("sequence", &self.sequence())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_backoff_is_capped() {
        assert_eq!(resume_backoff(1), Duration::from_millis(2_000));
        assert_eq!(resume_backoff(2), Duration::from_millis(4_000));
        for attempt in 1..32 {
            assert!(resume_backoff(attempt) <= Duration::from_millis(RESUME_BACKOFF_MAX_MS));
        }
    }

    #[test]
    fn test_credentials_completeness() {
        let mut creds = VoiceCredentials::default();
        assert!(!creds.is_complete());
        creds.session_id = Some("S".into());
        creds.endpoint = Some("e".into());
        assert!(!creds.is_complete());
        creds.token = Some("T".into());
        assert!(creds.is_complete());
    }

    #[test]
    fn test_stale_credentials_are_invalid() {
        let conn = Connection::new("G".into());
        {
            let mut creds = conn.creds.lock();
            creds.session_id = Some("S".into());
            creds.endpoint = Some("e".into());
            creds.token = Some("T".into());
            creds.last_voice_data_update = now_ms() - VOICE_DATA_TIMEOUT_MS - 1;
        }
        assert!(!conn.has_valid_voice_data());
    }

    #[test]
    fn test_tx_id_stamping_is_a_read() {
        let conn = Connection::new("G".into());
        let a = conn.tx_id();
        let b = conn.tx_id();
        assert_eq!(a, b);
    }

    #[test]
    fn test_tx_id_advances_per_generation() {
        let conn = Connection::new("G".into());
        let stamped = conn.tx_id();
        conn.bump_tx_id();
        // A packet stamped before the generation change now compares stale.
        assert!(stamped < conn.tx_id());
    }
}
