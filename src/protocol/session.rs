use serde::{Deserialize, Serialize};

/// Request body for PATCH /v4/sessions/{sessionId}.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdate {
    pub resuming: bool,
    /// Worker-side resume window, in seconds.
    pub timeout: u64,
}

/// Response from PATCH /v4/sessions/{sessionId}.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub resuming: bool,
    pub timeout: u64,
}
