//! Per-node REST client for the worker HTTP API.
//!
//! One instance per node, sharing that node's connection pool. All paths are
//! rooted at the configured API version (`/v4` by default) and carry the
//! worker session id once the ready handshake has issued one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::{header, Client, Method};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    options::{AquaOptions, NodeConfig},
    protocol::{
        info::Info,
        models::{Lyrics, RemotePlayer, RemotePlayers, UpdatePlayer},
        session::{SessionInfo, SessionUpdate},
        stats::StatsFrame,
        tracks::{LoadResult, TrackData},
    },
    track::is_valid_base64,
};

/// Response body cap, in bytes.
pub const MAX_RESPONSE_SIZE: usize = 10_485_760;
/// Bodies at or above this size may go over HTTP/2.
pub const HTTP2_THRESHOLD: usize = 1_024;
/// Idle timeout for the HTTP/2 session pool.
const HTTP2_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

pub struct Rest {
    base: String,
    auth: String,
    version: String,
    client: Client,
    /// Long-lived prior-knowledge HTTP/2 client, present when opted in.
    h2_client: Option<Client>,
    session_id: RwLock<Option<String>>,
    user_id: RwLock<Option<String>>,
    client_name: String,
    timeout: Duration,
    calls: AtomicU64,
}

impl Rest {
    pub fn new(config: &NodeConfig, options: &AquaOptions) -> Result<Self> {
        let scheme = if config.ssl { "https" } else { "http" };
        let client = Client::builder()
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()?;
        let h2_client = if options.use_http2 {
            Some(
                Client::builder()
                    .http2_prior_knowledge()
                    .timeout(config.timeout)
                    .pool_idle_timeout(HTTP2_IDLE_TIMEOUT)
                    .gzip(true)
                    .brotli(true)
                    .deflate(true)
                    .build()?,
            )
        } else {
            None
        };

        Ok(Self {
            base: format!("{scheme}://{}:{}", config.host, config.port),
            auth: config.auth.clone(),
            version: options.rest_version.clone(),
            client,
            h2_client,
            session_id: RwLock::new(config.session_id.clone()),
            user_id: RwLock::new(None),
            client_name: options.client_name.clone(),
            timeout: config.timeout,
            calls: AtomicU64::new(0),
        })
    }

    /// REST calls issued so far; feeds the `leastRest` balancer policy.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    pub fn set_session_id(&self, session_id: Option<String>) {
        *self.session_id.write() = session_id;
    }

    pub fn set_user_id(&self, user_id: impl Into<String>) {
        *self.user_id.write() = Some(user_id.into());
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}{}", self.base, self.version, path)
    }

    fn session_path(&self, rest: &str) -> Result<String> {
        let sid = self
            .session_id()
            .ok_or_else(|| Error::invalid("node has not completed its ready handshake"))?;
        Ok(format!("/sessions/{sid}{rest}"))
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Option<Value>> {
        let url = self.url(path);
        self.calls.fetch_add(1, Ordering::Relaxed);

        let body_bytes = body.map(serde_json::to_vec).transpose()?;
        let client = match (&self.h2_client, &body_bytes) {
            (Some(h2), Some(bytes)) if bytes.len() >= HTTP2_THRESHOLD => h2,
            _ => &self.client,
        };

        let mut builder = client
            .request(method, &url)
            .timeout(self.timeout)
            .header(header::AUTHORIZATION, &self.auth)
            .header("Client-Name", &self.client_name);
        if !query.is_empty() {
            builder = builder.query(query);
        }
        if let Some(uid) = self.user_id.read().as_deref() {
            builder = builder.header("User-Id", uid);
        }
        if let Some(sid) = self.session_id.read().as_deref() {
            builder = builder.header("Session-Id", sid);
        }
        if let Some(bytes) = body_bytes {
            builder = builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(bytes);
        }

        let response = builder.send().await.map_err(|e| {
            debug!("request to {url} failed: {e}");
            Error::from(e)
        })?;

        let status = response.status();
        let bytes = self.read_bounded(response, &url).await?;

        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let parsed = if bytes.is_empty() {
            None
        } else {
            serde_json::from_slice::<Value>(&bytes).ok()
        };

        if !status.is_success() {
            warn!("worker returned {status} for {url}");
            return Err(Error::Http {
                status: status.as_u16(),
                url,
                body: parsed,
            });
        }
        Ok(parsed)
    }

    /// Drain the body, enforcing [`MAX_RESPONSE_SIZE`].
    async fn read_bounded(&self, response: reqwest::Response, url: &str) -> Result<Vec<u8>> {
        if let Some(len) = response.content_length() {
            if len as usize > MAX_RESPONSE_SIZE {
                return Err(Error::ResponseTooLarge {
                    url: url.to_string(),
                    limit: MAX_RESPONSE_SIZE,
                });
            }
        }
        let mut stream = response.bytes_stream();
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if buf.len() + chunk.len() > MAX_RESPONSE_SIZE {
                return Err(Error::ResponseTooLarge {
                    url: url.to_string(),
                    limit: MAX_RESPONSE_SIZE,
                });
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf)
    }

    fn parse<T: serde::de::DeserializeOwned>(value: Option<Value>) -> Result<T> {
        let value = value.ok_or_else(|| Error::invalid("worker sent an empty response"))?;
        Ok(serde_json::from_value(value)?)
    }

    // ── Players ─────────────────────────────────────────────────────────────

    /// PATCH `/sessions/{sid}/players/{guild}?noReplace={bool}`.
    ///
    /// A 404 blaming the session id clears it, forcing the node through a
    /// fresh ready handshake before further player traffic.
    pub async fn update_player(
        &self,
        guild_id: &str,
        update: &UpdatePlayer,
        no_replace: bool,
    ) -> Result<Option<RemotePlayer>> {
        let path = self.session_path(&format!("/players/{guild_id}"))?;
        let body = serde_json::to_value(update)?;
        let result = self
            .request(
                Method::PATCH,
                &path,
                &[("noReplace", no_replace.to_string())],
                Some(&body),
            )
            .await;
        match result {
            Ok(value) => Ok(value
                .map(serde_json::from_value::<RemotePlayer>)
                .transpose()?),
            Err(e) => {
                if e.is_not_found() && e.blames_session() {
                    warn!("worker dropped our session; clearing session id");
                    self.set_session_id(None);
                }
                Err(e)
            }
        }
    }

    /// GET `/sessions/{sid}/players`.
    pub async fn get_players(&self) -> Result<Vec<RemotePlayer>> {
        let path = self.session_path("/players")?;
        let value = self.request(Method::GET, &path, &[], None).await?;
        let players: RemotePlayers = Self::parse(value)?;
        Ok(players.players)
    }

    /// GET `/sessions/{sid}/players/{guild}`.
    pub async fn get_player(&self, guild_id: &str) -> Result<RemotePlayer> {
        let path = self.session_path(&format!("/players/{guild_id}"))?;
        let value = self.request(Method::GET, &path, &[], None).await?;
        Self::parse(value)
    }

    /// DELETE `/sessions/{sid}/players/{guild}`.
    pub async fn destroy_player(&self, guild_id: &str) -> Result<()> {
        let path = self.session_path(&format!("/players/{guild_id}"))?;
        self.request(Method::DELETE, &path, &[], None).await?;
        Ok(())
    }

    // ── Tracks ──────────────────────────────────────────────────────────────

    /// GET `/loadtracks?identifier=…`.
    pub async fn load_tracks(&self, identifier: &str) -> Result<LoadResult> {
        let value = self
            .request(
                Method::GET,
                "/loadtracks",
                &[("identifier", identifier.to_string())],
                None,
            )
            .await?;
        Self::parse(value)
    }

    /// GET `/decodetrack?encodedTrack=…`. Invalid base64 fails locally
    /// without a request.
    pub async fn decode_track(&self, encoded: &str) -> Result<TrackData> {
        if !is_valid_base64(encoded) {
            return Err(Error::invalid("encoded track is not valid base64"));
        }
        let value = self
            .request(
                Method::GET,
                "/decodetrack",
                &[("encodedTrack", encoded.to_string())],
                None,
            )
            .await?;
        Self::parse(value)
    }

    /// POST `/decodetracks`.
    pub async fn decode_tracks(&self, encoded: &[String]) -> Result<Vec<TrackData>> {
        if let Some(bad) = encoded.iter().find(|e| !is_valid_base64(e)) {
            return Err(Error::invalid(format!("invalid encoded track: {bad}")));
        }
        let body = serde_json::json!({ "tracks": encoded });
        let value = self
            .request(Method::POST, "/decodetracks", &[], Some(&body))
            .await?;
        #[derive(serde::Deserialize)]
        struct Tracks {
            tracks: Vec<TrackData>,
        }
        let tracks: Tracks = Self::parse(value)?;
        Ok(tracks.tracks)
    }

    // ── Worker capability & load ────────────────────────────────────────────

    pub async fn get_stats(&self) -> Result<StatsFrame> {
        let value = self.request(Method::GET, "/stats", &[], None).await?;
        Self::parse(value)
    }

    pub async fn get_info(&self) -> Result<Info> {
        let value = self.request(Method::GET, "/info", &[], None).await?;
        Self::parse(value)
    }

    /// GET `/version` — unversioned, plain-text.
    pub async fn get_version(&self) -> Result<String> {
        let url = format!("{}/version", self.base);
        self.calls.fetch_add(1, Ordering::Relaxed);
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .header(header::AUTHORIZATION, &self.auth)
            .send()
            .await?;
        let status = response.status();
        let bytes = self.read_bounded(response, &url).await?;
        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
                url,
                body: serde_json::from_slice(&bytes).ok(),
            });
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    // ── Route planner ───────────────────────────────────────────────────────

    pub async fn route_planner_status(&self) -> Result<Option<Value>> {
        self.request(Method::GET, "/routeplanner/status", &[], None)
            .await
    }

    pub async fn route_planner_free_address(&self, address: &str) -> Result<()> {
        let body = serde_json::json!({ "address": address });
        self.request(Method::POST, "/routeplanner/free/address", &[], Some(&body))
            .await?;
        Ok(())
    }

    pub async fn route_planner_free_all(&self) -> Result<()> {
        self.request(Method::POST, "/routeplanner/free/all", &[], None)
            .await?;
        Ok(())
    }

    // ── Lyrics ──────────────────────────────────────────────────────────────

    /// GET `/sessions/{sid}/players/{guild}/track/lyrics`. `Ok(None)` when
    /// the worker has no lyrics for the playing track.
    pub async fn lyrics_for_player(
        &self,
        guild_id: &str,
        skip_track_source: bool,
    ) -> Result<Option<Lyrics>> {
        let path = self.session_path(&format!("/players/{guild_id}/track/lyrics"))?;
        let result = self
            .request(
                Method::GET,
                &path,
                &[("skipTrackSource", skip_track_source.to_string())],
                None,
            )
            .await;
        Self::optional_lyrics(result)
    }

    /// GET `/lyrics?track={encoded}`.
    pub async fn lyrics_find(&self, encoded: &str) -> Result<Option<Lyrics>> {
        if !is_valid_base64(encoded) {
            return Err(Error::invalid("encoded track is not valid base64"));
        }
        let result = self
            .request(Method::GET, "/lyrics", &[("track", encoded.to_string())], None)
            .await;
        Self::optional_lyrics(result)
    }

    /// GET `/lyrics/search?query=…`.
    pub async fn lyrics_search(&self, query: &str) -> Result<Option<Lyrics>> {
        let result = self
            .request(
                Method::GET,
                "/lyrics/search",
                &[("query", query.to_string())],
                None,
            )
            .await;
        Self::optional_lyrics(result)
    }

    fn optional_lyrics(result: Result<Option<Value>>) -> Result<Option<Lyrics>> {
        match result {
            Ok(value) => Ok(value.map(serde_json::from_value).transpose()?),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    // ── Session ─────────────────────────────────────────────────────────────

    /// PATCH `/sessions/{sid}` — enable worker-side resumption.
    pub async fn update_session(&self, resuming: bool, timeout: u64) -> Result<SessionInfo> {
        let path = self.session_path("")?;
        let body = serde_json::to_value(SessionUpdate { resuming, timeout })?;
        let value = self.request(Method::PATCH, &path, &[], Some(&body)).await?;
        Self::parse(value)
    }
}

impl std::fmt::Debug for Rest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rest")
            .field("base", &self.base)
            .field("version", &self.version)
            .field("calls", &self.calls())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{AquaOptions, NodeConfig};

    fn rest() -> Rest {
        Rest::new(&NodeConfig::default(), &AquaOptions::default()).unwrap()
    }

    #[test]
    fn test_url_is_versioned() {
        let rest = rest();
        assert_eq!(rest.url("/loadtracks"), "http://127.0.0.1:2333/v4/loadtracks");
    }

    #[test]
    fn test_session_path_requires_handshake() {
        let rest = rest();
        assert!(rest.session_path("/players").is_err());
        rest.set_session_id(Some("abc".into()));
        assert_eq!(rest.session_path("/players").unwrap(), "/sessions/abc/players");
    }

    #[tokio::test]
    async fn test_decode_rejects_bad_base64_without_request() {
        let rest = rest();
        let before = rest.calls();
        assert!(rest.decode_track("not base64!").await.is_err());
        assert!(rest.decode_tracks(&["x".into()]).await.is_err());
        assert_eq!(rest.calls(), before);
    }
}
