//! Reusable voice-update payloads.
//!
//! The reconcile path builds a payload on every credential change; pooling
//! the structs keeps that path free of steady-state allocation. Each
//! connection owns its pool — no cross-task sharing.

use crate::protocol::models::{UpdatePlayer, VoiceState};

/// Free-list capacity per connection.
pub const POOL_SIZE: usize = 12;

/// One pooled voice update: the credential set plus the player volume that
/// rides along on the first flush.
#[derive(Debug, Default)]
pub struct VoicePayload {
    pub voice: VoiceState,
    pub volume: Option<i32>,
}

impl VoicePayload {
    fn reset(&mut self) {
        self.voice = VoiceState::default();
        self.volume = None;
    }

    /// Convert into the REST body shape.
    pub fn to_update(&self) -> UpdatePlayer {
        UpdatePlayer {
            voice: Some(self.voice.clone()),
            volume: self.volume,
            ..Default::default()
        }
    }
}

/// Fixed-capacity free list of [`VoicePayload`].
#[derive(Debug)]
pub struct PayloadPool {
    free: Vec<Box<VoicePayload>>,
}

impl Default for PayloadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadPool {
    pub fn new() -> Self {
        Self {
            free: Vec::with_capacity(POOL_SIZE),
        }
    }

    pub fn acquire(&mut self) -> Box<VoicePayload> {
        self.free.pop().unwrap_or_default()
    }

    /// Return a payload to the pool. Fields are reset here so stale
    /// credentials can never leak into the next acquire.
    pub fn release(&mut self, mut payload: Box<VoicePayload>) {
        if self.free.len() >= POOL_SIZE {
            return; // pool full — just drop
        }
        payload.reset();
        self.free.push(payload);
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_resets_fields() {
        let mut pool = PayloadPool::new();
        let mut p = pool.acquire();
        p.voice.token = "T".into();
        p.volume = Some(80);
        pool.release(p);

        let p = pool.acquire();
        assert!(p.voice.token.is_empty());
        assert!(p.volume.is_none());
    }

    #[test]
    fn test_pool_is_bounded() {
        let mut pool = PayloadPool::new();
        let payloads: Vec<_> = (0..POOL_SIZE + 4).map(|_| pool.acquire()).collect();
        for p in payloads {
            pool.release(p);
        }
        assert_eq!(pool.available(), POOL_SIZE);
    }

    #[test]
    fn test_to_update_carries_voice_and_volume() {
        let mut p = VoicePayload::default();
        p.voice.session_id = "S1".into();
        p.volume = Some(100);
        let update = p.to_update();
        assert_eq!(update.volume, Some(100));
        assert_eq!(update.voice.unwrap().session_id, "S1");
    }
}
