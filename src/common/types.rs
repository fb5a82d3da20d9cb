/// Strongly typed identifiers.
pub type GuildId = String;
pub type SessionId = String;
pub type ChannelId = String;

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
