//! Host agent status events
//!
//! The host agent writes one JSON [`Event`] per line to its supervisor. The
//! sequence is always booting (all flags false), at most one running event,
//! then a final exiting event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of the host agent's health
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub running: bool,
    /// Running, but at least one startup requirement failed
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub exiting: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub ssh_local_port: u16,
}

fn is_zero(port: &u16) -> bool {
    *port == 0
}

/// A timestamped status change
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Filled with the current time at emission when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    pub status: Status,
}

impl Event {
    /// Wrap a status in an event without a timestamp
    pub fn new(status: Status) -> Self {
        Self { time: None, status }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_booting_event_is_compact() {
        let event = Event::new(Status {
            ssh_local_port: 60022,
            ..Default::default()
        });
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"status":{"sshLocalPort":60022}}"#
        );
    }

    #[test]
    fn test_degraded_event_fields() {
        let event = Event::new(Status {
            running: true,
            degraded: true,
            errors: vec!["mount failed".to_string()],
            ..Default::default()
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"]["running"], true);
        assert_eq!(json["status"]["degraded"], true);
        assert_eq!(json["status"]["errors"][0], "mount failed");
        assert!(json["status"].get("exiting").is_none());
    }

    #[test]
    fn test_parse_exiting_event() {
        let event: Event = serde_json::from_str(
            r#"{"time":"2024-01-02T03:04:05Z","status":{"exiting":true}}"#,
        )
        .unwrap();
        assert!(event.status.exiting);
        assert!(event.time.is_some());
    }
}
