//! Build event wire format.
//!
//! Events are appended to a per-build log by the store and streamed to
//! consumers in insertion order. The JSON encoding is externally visible
//! and uses a `type` discriminator.

use serde::{Deserialize, Serialize};

use super::build::{BuildInput, BuildStatus};
use super::plan::PlanId;
use super::resource::Version;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OriginSource {
    Stdout,
    Stderr,
}

/// Which step, and which of its output streams, an event came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub source: OriginSource,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Log {
        origin: Origin,
        payload: String,
    },
    /// Emitted by the store itself on build start and finish.
    Status {
        status: BuildStatus,
        time: i64,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<Origin>,
    },
    Initialize {
        plan_id: PlanId,
        step_name: String,
    },
    Start {
        plan_id: PlanId,
        step_name: String,
        time: i64,
    },
    Finish {
        plan_id: PlanId,
        step_name: String,
        exit_status: i32,
        time: i64,
    },
    Input {
        input: BuildInput,
    },
    Output {
        resource: String,
        version: Version,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_event_encoding_is_discriminated() {
        let event = Event::Log {
            origin: Origin {
                source: OriginSource::Stdout,
                id: "1".to_string(),
            },
            payload: "hello this is a payload".to_string(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "log");
        assert_eq!(json["origin"]["source"], "stdout");
        assert_eq!(json["payload"], "hello this is a payload");

        let decoded: Event = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn status_event_encodes_status_name() {
        let event = Event::Status {
            status: BuildStatus::Succeeded,
            time: 100,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["status"], "succeeded");
    }
}
