//! Durable player persistence across process restarts.
//!
//! One line-delimited JSON file: a header carrying worker session ids, then
//! one compact record per player. Writes go through an exclusive lock file
//! and an atomic tmp-then-rename so a crash can never leave a torn file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::{
    aqua::Aqua,
    error::{Error, Result},
    player::{PlayOptions, PlayerOptions},
    track::{Requester, Track},
};

/// Players restored concurrently per batch.
const PLAYER_BATCH_SIZE: usize = 20;

/// One persisted player, short keys to keep restart files small.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SavedPlayer {
    /// Guild id.
    g: String,
    /// Text channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    t: Option<String>,
    /// Voice channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    v: Option<String>,
    /// Current track URI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    u: Option<String>,
    /// Position in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    p: Option<u64>,
    /// Timestamp of the last state frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ts: Option<u64>,
    /// Upcoming queue URIs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    q: Vec<String>,
    /// Requester, `id:username`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    r: Option<String>,
    vol: u16,
    pa: bool,
    pl: bool,
    /// "Now playing" UI message id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nw: Option<String>,
    resuming: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    #[serde(rename = "type")]
    kind: String,
    data: serde_json::Map<String, Value>,
}

fn lock_path(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".lock");
    PathBuf::from(p)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".tmp");
    PathBuf::from(p)
}

/// Exclusive-create lock file holding our pid; removed on drop.
struct FileLock {
    path: PathBuf,
}

impl FileLock {
    fn acquire(save_path: &Path) -> Result<Self> {
        let path = lock_path(save_path);
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                use std::io::Write;
                let _ = write!(file, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let owner = std::fs::read_to_string(&path).unwrap_or_default();
                Err(Error::SaveFileLocked(owner.trim().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Aqua {
    /// Persist every live player plus the node session map to `path`.
    pub async fn save_players(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let _lock = FileLock::acquire(path)?;
        let tmp = tmp_path(path);

        let mut sessions = serde_json::Map::new();
        for node in self.nodes() {
            if let Some(session_id) = node.session_id() {
                sessions.insert(node.name.clone(), Value::String(session_id));
            }
        }
        let header = Header {
            kind: "node_sessions".into(),
            data: sessions,
        };

        let max_queue = self.options().max_queue_save;
        let records: Vec<SavedPlayer> = self
            .players()
            .iter()
            .filter(|p| !p.is_destroyed())
            .map(|player| {
                let current = player.current();
                SavedPlayer {
                    g: player.guild_id().to_string(),
                    t: player.text_channel_id(),
                    v: player.voice_channel_id(),
                    u: current.as_ref().and_then(|c| c.info.uri.clone()),
                    p: Some(player.position()),
                    ts: Some(player.timestamp()),
                    q: player
                        .queue_snapshot()
                        .iter()
                        .filter_map(|t| t.info.uri.clone())
                        .take(max_queue)
                        .collect(),
                    r: current
                        .as_ref()
                        .and_then(|c| c.requester.as_ref())
                        .map(Requester::to_saved),
                    vol: player.volume(),
                    pa: player.is_paused(),
                    pl: player.is_playing(),
                    nw: player.now_playing_message(),
                    resuming: true,
                }
            })
            .collect();

        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut contents = serde_json::to_string(&header)?;
        contents.push('\n');
        for record in &records {
            contents.push_str(&serde_json::to_string(record)?);
            contents.push('\n');
        }
        file.write_all(contents.as_bytes()).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, path).await?;
        info!("saved {} players to {}", records.len(), path.display());
        Ok(records.len())
    }

    /// Restore players written by [`Aqua::save_players`]. Persisted session
    /// ids are applied to matching nodes first so their next handshake
    /// resumes instead of starting fresh. The file is truncated afterwards.
    pub async fn load_players(self: &Arc<Self>, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(0);
        }
        let _lock = FileLock::acquire(path)?;
        let contents = tokio::fs::read_to_string(path).await?;
        let mut lines = contents.lines().filter(|l| !l.trim().is_empty());

        if let Some(first) = lines.next() {
            match serde_json::from_str::<Header>(first) {
                Ok(header) if header.kind == "node_sessions" => {
                    self.apply_saved_sessions(&header.data);
                }
                _ => warn!("save file missing session header; skipping session resume"),
            }
        }

        let records: Vec<SavedPlayer> = lines
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("skipping corrupt save record: {e}");
                    None
                }
            })
            .collect();

        let mut restored = 0usize;
        for chunk in records.chunks(PLAYER_BATCH_SIZE) {
            let mut batch = FuturesUnordered::new();
            for record in chunk {
                let aqua = Arc::clone(self);
                let record = record.clone();
                batch.push(async move { aqua.restore_player(record).await });
            }
            while let Some(result) = batch.next().await {
                match result {
                    Ok(()) => restored += 1,
                    Err(e) => warn!("player restore failed: {e}"),
                }
            }
        }

        tokio::fs::write(path, b"").await?;
        info!("restored {restored} players from {}", path.display());
        Ok(restored)
    }

    fn apply_saved_sessions(&self, sessions: &serde_json::Map<String, Value>) {
        for (name, session_id) in sessions {
            let Some(session_id) = session_id.as_str() else { continue };
            {
                let mut configs = self.node_configs.lock();
                if let Some(config) = configs.iter_mut().find(|c| c.identifier() == *name) {
                    config.session_id = Some(session_id.to_string());
                }
            }
            if let Some(node) = self.node(name) {
                if !node.is_connected() {
                    debug!("[{name}] adopting persisted session id");
                    node.rest.set_session_id(Some(session_id.to_string()));
                }
            }
        }
    }

    async fn restore_player(self: &Arc<Self>, record: SavedPlayer) -> Result<()> {
        let Some(voice_channel) = record.v.clone() else {
            // Without a voice channel there is nothing to reconnect.
            return Ok(());
        };
        let player = self
            .create_connection(PlayerOptions {
                guild_id: record.g.clone(),
                text_channel: record.t.clone(),
                voice_channel: Some(voice_channel),
                default_volume: Some(record.vol.min(200)),
                ..Default::default()
            })
            .await?;
        player.set_now_playing_message(record.nw.clone());

        let requester = record.r.as_deref().and_then(Requester::from_saved);
        let max_restore = self.options().max_tracks_restore;
        let mut budget = max_restore;

        let current = record.u.as_ref().filter(|_| budget > 0).map(|uri| {
            budget -= 1;
            Track::from_uri(uri.clone(), requester.clone())
        });
        for uri in record.q.iter().take(budget) {
            player.enqueue(Track::from_uri(uri.clone(), requester.clone()));
        }

        if let (Some(track), true) = (current, record.pl) {
            player.play(Some(track), PlayOptions::default()).await?;
            if crate::player::wait_for_track_start(&player).await {
                if self.options().failover.preserve_position {
                    if let Some(position) = record.p.filter(|p| *p > 0) {
                        tokio::time::sleep(std::time::Duration::from_millis(800)).await;
                        if let Err(e) = player.seek(position as i64).await {
                            debug!("[{}] restore seek failed: {e}", record.g);
                        }
                    }
                }
                if record.pa {
                    if let Err(e) = player.pause(true).await {
                        debug!("[{}] restore pause failed: {e}", record.g);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saved_player_short_keys() {
        let record = SavedPlayer {
            g: "G".into(),
            t: Some("T".into()),
            v: Some("V".into()),
            u: Some("https://example.com/a".into()),
            p: Some(30_000),
            ts: Some(1),
            q: vec!["u1".into(), "u2".into()],
            r: Some("1:someone".into()),
            vol: 60,
            pa: true,
            pl: true,
            nw: None,
            resuming: true,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains(r#""g":"G""#));
        assert!(json.contains(r#""vol":60"#));
        assert!(json.contains(r#""pa":true"#));
        assert!(!json.contains("nw")); // absent optionals are omitted

        let parsed: SavedPlayer = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.q, vec!["u1", "u2"]);
        assert_eq!(parsed.p, Some(30_000));
    }

    #[test]
    fn test_header_round_trip() {
        let json = r#"{"type":"node_sessions","data":{"main":"abc123"}}"#;
        let header: Header = serde_json::from_str(json).unwrap();
        assert_eq!(header.kind, "node_sessions");
        assert_eq!(header.data["main"], "abc123");
    }

    #[test]
    fn test_lock_file_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let save = dir.path().join("players.jsonl");
        let lock = FileLock::acquire(&save).unwrap();
        let second = FileLock::acquire(&save);
        assert!(matches!(second, Err(Error::SaveFileLocked(_))));
        drop(lock);
        assert!(FileLock::acquire(&save).is_ok());
    }

    #[test]
    fn test_lock_records_owner_pid() {
        let dir = tempfile::tempdir().unwrap();
        let save = dir.path().join("players.jsonl");
        let _lock = FileLock::acquire(&save).unwrap();
        let owner = std::fs::read_to_string(lock_path(&save)).unwrap();
        assert_eq!(owner, std::process::id().to_string());
    }
}
