//! Per-player coalescing of REST player updates.
//!
//! Field writes merge into a single pending struct and flush together.
//! Track, pause and position changes flush immediately so their remote
//! effect is observed before the caller resumes; everything else rides the
//! next scheduled flush. At most one flush is in flight per player; batches
//! arriving mid-flight accumulate into the next one.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    aqua::Aqua,
    common::types::GuildId,
    error::{Error, Result},
    node::rest::Rest,
    protocol::models::UpdatePlayer,
};

#[derive(Default)]
struct Pending {
    update: UpdatePlayer,
    no_replace: bool,
    scheduled: bool,
}

pub struct UpdateBatcher {
    guild_id: GuildId,
    rest: Arc<Rest>,
    aqua: Weak<Aqua>,
    pending: Mutex<Pending>,
    /// Serializes flushes; callers of an immediate batch wait here.
    flush_lock: tokio::sync::Mutex<()>,
    destroyed: AtomicBool,
}

impl UpdateBatcher {
    pub fn new(guild_id: GuildId, rest: Arc<Rest>, aqua: Weak<Aqua>) -> Arc<Self> {
        Arc::new(Self {
            guild_id,
            rest,
            aqua,
            pending: Mutex::new(Pending::default()),
            flush_lock: tokio::sync::Mutex::new(()),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Merge `fields` into the pending update. Flushes before returning when
    /// `immediate` or any immediate-flush field is present; otherwise a
    /// single deferred flush is scheduled.
    pub async fn batch(self: &Arc<Self>, fields: UpdatePlayer, immediate: bool) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(Error::Destroyed("update batcher"));
        }
        let flush_now = immediate || fields.requires_immediate_flush();
        {
            let mut pending = self.pending.lock();
            pending.update.merge(fields);
        }

        if flush_now {
            return self.flush().await;
        }

        let should_spawn = {
            let mut pending = self.pending.lock();
            if pending.scheduled {
                false
            } else {
                pending.scheduled = true;
                true
            }
        };
        if should_spawn {
            let batcher = Arc::clone(self);
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                // Error already surfaced on the bus inside flush.
                let _ = batcher.flush().await;
            });
        }
        Ok(())
    }

    /// Mark the next flush as `noReplace` (used by play to avoid clobbering
    /// a track the worker already started).
    pub fn set_no_replace(&self) {
        self.pending.lock().no_replace = true;
    }

    /// Push the pending update to the worker. No implicit retry: on error
    /// an event is emitted and the caller's state machine decides.
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().await;
        let (update, no_replace) = {
            let mut pending = self.pending.lock();
            pending.scheduled = false;
            if pending.update.is_empty() {
                return Ok(());
            }
            (
                std::mem::take(&mut pending.update),
                std::mem::take(&mut pending.no_replace),
            )
        };

        debug!("[{}] flushing player update", self.guild_id);
        match self.rest.update_player(&self.guild_id, &update, no_replace).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.handle_flush_error(&e);
                Err(e)
            }
        }
    }

    /// A 404 that does not blame the session means the remote player is
    /// gone; the local one follows it. Session-blaming 404s already cleared
    /// the node session id inside the REST layer.
    fn handle_flush_error(&self, error: &Error) {
        let Some(aqua) = self.aqua.upgrade() else { return };
        aqua.events().emit_error(
            Some(self.guild_id.clone()),
            format!("player update failed: {error}"),
        );
        if error.is_not_found() && !error.blames_session() {
            warn!("[{}] remote player is gone; destroying local player", self.guild_id);
            let guild_id = self.guild_id.clone();
            tokio::spawn(async move {
                let _ = aqua.destroy_player(&guild_id).await;
            });
        }
    }

    /// Drop pending fields and refuse further batches.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        let mut pending = self.pending.lock();
        pending.update = UpdatePlayer::default();
        pending.no_replace = false;
        pending.scheduled = false;
    }
}

impl std::fmt::Debug for UpdateBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateBatcher")
            .field("guild_id", &self.guild_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        aqua::GatewaySend,
        events::AquaEvent,
        options::{AquaOptions, NodeConfig},
    };

    fn batcher() -> (Arc<Aqua>, Arc<UpdateBatcher>) {
        let send: GatewaySend = Arc::new(|_| {});
        let aqua = Aqua::new(send, Vec::new(), AquaOptions::default());
        let rest = Arc::new(Rest::new(&NodeConfig::default(), &AquaOptions::default()).unwrap());
        let batcher = UpdateBatcher::new("G".into(), rest, Arc::downgrade(&aqua));
        (aqua, batcher)
    }

    #[tokio::test]
    async fn test_batches_merge_until_flush() {
        let (_aqua, b) = batcher();
        b.batch(
            UpdatePlayer {
                volume: Some(80),
                ..Default::default()
            },
            false,
        )
        .await
        .unwrap();
        b.batch(
            UpdatePlayer {
                volume: Some(90),
                ..Default::default()
            },
            false,
        )
        .await
        .unwrap();
        let pending = b.pending.lock();
        assert_eq!(pending.update.volume, Some(90));
    }

    #[tokio::test]
    async fn test_destroyed_batcher_refuses() {
        let (_aqua, b) = batcher();
        b.destroy();
        let err = b
            .batch(UpdatePlayer::default(), false)
            .await
            .expect_err("destroyed batcher must refuse");
        assert!(matches!(err, Error::Destroyed(_)));
    }

    #[tokio::test]
    async fn test_immediate_fields_force_flush() {
        // paused is an immediate-flush field; the flush fails fast (the
        // node never completed a handshake) and must surface an error
        // event.
        let (aqua, b) = batcher();
        let events = aqua.events().receiver();
        let result = b
            .batch(
                UpdatePlayer {
                    paused: Some(true),
                    ..Default::default()
                },
                false,
            )
            .await;
        assert!(result.is_err());
        assert!(matches!(
            events.try_recv().unwrap(),
            AquaEvent::Error { .. }
        ));
    }
}
