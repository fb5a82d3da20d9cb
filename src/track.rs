//! The track carrier attached to players, queues and history.

use std::sync::{Arc, Weak};

use base64::alphabet;
use parking_lot::RwLock;

use crate::{
    error::{Error, Result},
    node::Node,
    protocol::tracks::{LoadResult, PlaylistInfo, TrackData, TrackInfo},
};

/// Who asked for this track, as `id` + display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub id: String,
    pub username: String,
}

impl Requester {
    /// Persistence form, `id:username`.
    pub fn to_saved(&self) -> String {
        format!("{}:{}", self.id, self.username)
    }

    pub fn from_saved(s: &str) -> Option<Self> {
        let (id, username) = s.split_once(':')?;
        Some(Self {
            id: id.to_string(),
            username: username.to_string(),
        })
    }
}

/// A playable item.
///
/// Metadata is fixed at creation; only the encoded blob is filled in lazily
/// when a track created from a bare URI is first played. Either `encoded`
/// or `info.uri` is always non-empty.
#[derive(Debug)]
pub struct Track {
    pub info: TrackInfo,
    pub playlist: Option<PlaylistInfo>,
    pub requester: Option<Requester>,
    pub user_data: serde_json::Value,
    encoded: RwLock<Option<String>>,
    node: RwLock<Weak<Node>>,
}

impl Track {
    /// Wrap a wire track coming off a load/decode response.
    pub fn from_data(
        data: TrackData,
        playlist: Option<PlaylistInfo>,
        requester: Option<Requester>,
        node: &Arc<Node>,
    ) -> Arc<Self> {
        Arc::new(Self {
            info: data.info,
            playlist,
            requester,
            user_data: data.user_data,
            encoded: RwLock::new(Some(data.encoded)),
            node: RwLock::new(Arc::downgrade(node)),
        })
    }

    /// Create an unresolved track from a URI (used by the restore paths).
    pub fn from_uri(uri: impl Into<String>, requester: Option<Requester>) -> Arc<Self> {
        let uri = uri.into();
        Arc::new(Self {
            info: TrackInfo {
                identifier: uri.clone(),
                uri: Some(uri),
                ..Default::default()
            },
            playlist: None,
            requester,
            user_data: serde_json::Value::Null,
            encoded: RwLock::new(None),
            node: RwLock::new(Weak::new()),
        })
    }

    /// The encoded blob, if this track has been resolved.
    pub fn encoded(&self) -> Option<String> {
        self.encoded.read().clone()
    }

    pub fn set_node(&self, node: &Arc<Node>) {
        *self.node.write() = Arc::downgrade(node);
    }

    pub fn node(&self) -> Option<Arc<Node>> {
        self.node.read().upgrade()
    }

    /// Duration in milliseconds, `None` for streams and unresolved tracks.
    pub fn duration(&self) -> Option<u64> {
        (self.info.length > 0 && !self.info.is_stream).then_some(self.info.length)
    }

    /// Ensure the encoded blob exists, resolving through `node` if needed.
    ///
    /// Unresolved tracks are looked up by URI when they have one, otherwise
    /// by a `<platform>:<identifier>` search.
    pub async fn resolve(&self, node: &Arc<Node>, search_platform: &str) -> Result<String> {
        if let Some(encoded) = self.encoded() {
            return Ok(encoded);
        }

        let identifier = match self.info.uri.as_deref() {
            Some(uri) if !uri.is_empty() => uri.to_string(),
            _ => format!("{}:{}", search_platform, self.info.identifier),
        };

        let result = node.rest.load_tracks(&identifier).await?;
        let data = match result {
            LoadResult::Track(t) => t,
            LoadResult::Playlist(p) => p
                .tracks
                .into_iter()
                .next()
                .ok_or_else(|| Error::invalid("playlist resolved empty"))?,
            LoadResult::Search(tracks) => tracks
                .into_iter()
                .next()
                .ok_or_else(|| Error::invalid(format!("no results for {identifier}")))?,
            LoadResult::Empty(_) => {
                return Err(Error::invalid(format!("no results for {identifier}")))
            }
            LoadResult::Error(e) => {
                return Err(Error::invalid(
                    e.message.unwrap_or_else(|| "track load failed".into()),
                ))
            }
        };

        let encoded = data.encoded.clone();
        *self.encoded.write() = Some(data.encoded);
        self.set_node(node);
        Ok(encoded)
    }

    /// Release the cached resolution. Tracks that only carry an encoded blob
    /// (no URI to re-resolve by) keep it.
    pub fn dispose(&self) {
        if self.info.uri.as_deref().is_some_and(|u| !u.is_empty()) {
            *self.encoded.write() = None;
        }
        *self.node.write() = Weak::new();
    }
}

/// Validate a string against the encoded-track alphabet without decoding.
///
/// Accepts standard and URL-safe base64 characters plus padding; rejects
/// lengths that no base64 encoding can produce (`len % 4 == 1`).
pub fn is_valid_base64(s: &str) -> bool {
    if s.is_empty() || s.len() % 4 == 1 {
        return false;
    }
    s.bytes().all(|b| {
        alphabet::STANDARD.as_str().as_bytes().contains(&b)
            || alphabet::URL_SAFE.as_str().as_bytes().contains(&b)
            || b == b'='
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_validator_accepts_wire_blobs() {
        assert!(is_valid_base64("QAAAjQIAJVJpY2sgQXN0bGV5"));
        assert!(is_valid_base64("abcd"));
        assert!(is_valid_base64("ab=="));
        assert!(is_valid_base64("ab-_"));
        // Length mod 4 == 2 and 3 are accepted; only == 1 is impossible.
        assert!(is_valid_base64("abcde"));
    }

    #[test]
    fn test_base64_validator_rejects_bad_input() {
        assert!(!is_valid_base64(""));
        assert!(!is_valid_base64("a")); // len % 4 == 1
        assert!(!is_valid_base64("ab d"));
        assert!(!is_valid_base64("ab!d"));
    }

    #[test]
    fn test_requester_saved_round_trip() {
        let r = Requester {
            id: "123".into(),
            username: "someone".into(),
        };
        assert_eq!(r.to_saved(), "123:someone");
        assert_eq!(Requester::from_saved("123:someone").unwrap(), r);
        assert!(Requester::from_saved("nodelimiter").is_none());
    }

    #[test]
    fn test_from_uri_is_unresolved() {
        let t = Track::from_uri("https://example.com/x", None);
        assert!(t.encoded().is_none());
        assert_eq!(t.info.uri.as_deref(), Some("https://example.com/x"));
    }
}
