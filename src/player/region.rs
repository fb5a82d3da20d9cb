//! Region-code extraction from voice endpoint hostnames.
//!
//! Endpoints look like `c-gru20-abc.example.com:443`; the three-letter
//! token identifies the geographic voice server group and drives
//! region-affine node placement.

use std::sync::OnceLock;

use regex::Regex;

fn primary_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^c-([a-z]{3})\d*-").unwrap())
}

fn fallback_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-([a-z]{3})\d*-").unwrap())
}

/// Extract a region code from a voice endpoint.
///
/// The scheme, path and port are stripped and the first hostname label is
/// matched lowercase. Unknown shapes yield `"unknown"` rather than an error
/// so affinity routing degrades to load-only placement.
pub fn extract_region(endpoint: &str) -> String {
    let host = endpoint
        .trim()
        .trim_start_matches("wss://")
        .trim_start_matches("ws://")
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host = host.split(['/', '?']).next().unwrap_or(host);
    let host = host.split(':').next().unwrap_or(host);

    let first_label = host.split('.').next().unwrap_or(host).to_ascii_lowercase();
    if first_label.is_empty() {
        return "unknown".into();
    }

    if let Some(caps) = primary_pattern().captures(&first_label) {
        return caps[1].to_string();
    }
    if let Some(caps) = fallback_pattern().captures(&first_label) {
        return caps[1].to_string();
    }

    let stripped: String = first_label
        .chars()
        .rev()
        .skip_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if stripped.is_empty() {
        "unknown".into()
    } else {
        stripped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_pattern() {
        assert_eq!(extract_region("c-gru20-abc.example"), "gru");
        assert_eq!(extract_region("c-iad01-x"), "iad");
    }

    #[test]
    fn test_strips_scheme_port_and_path() {
        assert_eq!(extract_region("wss://c-gru20-abc.example:443/ws"), "gru");
        assert_eq!(extract_region("https://C-GRU20-ABC.example"), "gru");
    }

    #[test]
    fn test_fallback_token() {
        assert_eq!(extract_region("voice-sao5-main.example"), "sao");
    }

    #[test]
    fn test_trailing_digit_strip() {
        assert_eq!(extract_region("frankfurt3.example.com"), "frankfurt");
    }

    #[test]
    fn test_unknown() {
        assert_eq!(extract_region(""), "unknown");
        assert_eq!(extract_region("12345.example"), "unknown");
    }

    #[test]
    fn test_extraction_is_stable() {
        let ep = "c-gru20-abc.example";
        assert_eq!(extract_region(ep), extract_region(ep));
    }
}
