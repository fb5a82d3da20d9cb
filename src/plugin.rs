//! Extension seams: init-time plugins and autoplay providers.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{aqua::Aqua, error::Result, player::Player, track::Track};

/// Hook invoked once at orchestrator init.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    async fn load(&self, aqua: &Arc<Aqua>) -> Result<()>;
}

/// Source-specific autoplay lookup.
///
/// Registered per `sourceName` (e.g. `spotify`, `soundcloud`); consulted
/// when the queue drains with autoplay enabled. `exclude` carries recently
/// played identifiers the provider should avoid repeating.
#[async_trait]
pub trait AutoplayProvider: Send + Sync {
    async fn recommend(
        &self,
        player: &Arc<Player>,
        seed: &Arc<Track>,
        exclude: &[String],
    ) -> Result<Option<Arc<Track>>>;
}
