//! Track wire models for load/decode endpoints and event payloads.

use serde::{Deserialize, Serialize};

use crate::protocol::events::Severity;

/// A single audio track as carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackData {
    /// Base64-encoded track data.
    pub encoded: String,
    /// Track metadata.
    pub info: TrackInfo,
    /// Plugin-specific info, passed through untouched.
    #[serde(default)]
    pub plugin_info: serde_json::Value,
    /// User-provided data attached to the track.
    #[serde(default)]
    pub user_data: serde_json::Value,
}

/// Metadata for an audio track.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub identifier: String,
    pub is_seekable: bool,
    pub author: String,
    /// Duration in milliseconds. 0 for streams.
    pub length: u64,
    pub is_stream: bool,
    /// Position at capture, in milliseconds.
    pub position: u64,
    pub title: String,
    pub uri: Option<String>,
    pub artwork_url: Option<String>,
    pub isrc: Option<String>,
    pub source_name: String,
}

/// Result of a track load operation (`GET /loadtracks`).
#[derive(Debug, Deserialize)]
#[serde(tag = "loadType", content = "data", rename_all = "camelCase")]
pub enum LoadResult {
    /// A single track was loaded.
    Track(TrackData),
    /// A playlist was loaded.
    Playlist(PlaylistData),
    /// A search returned results.
    Search(Vec<TrackData>),
    /// No matches found.
    Empty(serde_json::Value),
    /// An error occurred during loading.
    Error(LoadError),
}

/// Playlist data returned from a load operation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistData {
    pub info: PlaylistInfo,
    #[serde(default)]
    pub plugin_info: serde_json::Value,
    pub tracks: Vec<TrackData>,
}

/// Playlist metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    pub name: String,
    /// Index of the selected track, or -1 if none.
    pub selected_track: i32,
}

/// Error from a failed track load.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadError {
    pub message: Option<String>,
    pub severity: Severity,
    pub cause: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_result_track() {
        let json = r#"{
            "loadType": "track",
            "data": {
                "encoded": "QAAA",
                "info": {
                    "identifier": "dQw4",
                    "isSeekable": true,
                    "author": "a",
                    "length": 1000,
                    "isStream": false,
                    "position": 0,
                    "title": "t",
                    "uri": "https://example.com",
                    "artworkUrl": null,
                    "isrc": null,
                    "sourceName": "youtube"
                }
            }
        }"#;
        let result: LoadResult = serde_json::from_str(json).unwrap();
        match result {
            LoadResult::Track(t) => {
                assert_eq!(t.encoded, "QAAA");
                assert_eq!(t.info.source_name, "youtube");
            }
            other => panic!("wrong load type: {other:?}"),
        }
    }

    #[test]
    fn test_load_result_empty() {
        let result: LoadResult = serde_json::from_str(r#"{"loadType":"empty","data":{}}"#).unwrap();
        assert!(matches!(result, LoadResult::Empty(_)));
    }

    #[test]
    fn test_load_result_error() {
        let json = r#"{"loadType":"error","data":{"message":"m","severity":"common","cause":"c"}}"#;
        let result: LoadResult = serde_json::from_str(json).unwrap();
        assert!(matches!(result, LoadResult::Error(_)));
    }
}
