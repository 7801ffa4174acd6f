//! Channel naming.
//!
//! `agent-{id}` unicast, `hub-broadcast` fan-out, `coordination:{event}`
//! mode events, `system:{event}` diagnostics.

pub const HUB_BROADCAST: &str = "hub-broadcast";

pub fn agent_channel(agent_id: &str) -> String {
    format!("agent-{agent_id}")
}

pub fn coordination_channel(event: &str) -> String {
    format!("coordination:{event}")
}

pub fn system_channel(event: &str) -> String {
    format!("system:{event}")
}

/// Directory-safe rendering of a channel name for the file transport.
pub fn sanitize_channel(channel: &str) -> String {
    channel
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '*') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Glob-lite matching: `*` matches any run of characters.
pub fn matches_pattern(channel: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return channel == pattern;
    }

    let mut rest = channel;
    for (idx, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        match rest.find(part) {
            Some(pos) => {
                // Anchored at the start for the first literal segment.
                if idx == 0 && pos != 0 {
                    return false;
                }
                rest = &rest[pos + part.len()..];
            }
            None => return false,
        }
    }
    // Anchored at the end unless the pattern ends with `*`.
    parts.last().map(|p| p.is_empty()).unwrap_or(false) || rest.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names() {
        assert_eq!(agent_channel("worker-agent-3"), "agent-worker-agent-3");
        assert_eq!(coordination_channel("mode-change"), "coordination:mode-change");
        assert_eq!(system_channel("status"), "system:status");
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize_channel("coordination:mode"), "coordination_mode");
        assert_eq!(sanitize_channel("agent-a/b"), "agent-a_b");
    }

    #[test]
    fn test_pattern_matching() {
        assert!(matches_pattern("agent-w1", "agent-*"));
        assert!(matches_pattern("system:status", "system:*"));
        assert!(matches_pattern("hub-broadcast", "hub-broadcast"));
        assert!(matches_pattern("anything", "*"));
        assert!(!matches_pattern("agent-w1", "system:*"));
        assert!(!matches_pattern("xagent-w1", "agent-*"));
        assert!(!matches_pattern("agent-w1-extra", "agent-w1"));
        assert!(matches_pattern("coordination:x:end", "coordination:*:end"));
        assert!(!matches_pattern("coordination:x:middle", "coordination:*:end"));
    }
}
