//! Reporting types for pipeline state and liveness.

use serde::{Deserialize, Serialize};

/// Snapshot of a pipeline's queue as seen by the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobsState {
    pub priority: i64,
    pub pipeline: String,
    pub driver: String,
    pub queue: String,
    /// Messages ready in the main queue
    pub active: i64,
    /// Messages published with a delay
    pub delayed: i64,
    /// Whether a listener is subscribed
    pub ready: bool,
}

/// Liveness check result: 200 when the state channel answers, 500 otherwise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: u16,
}

impl Status {
    pub const HEALTHY: u16 = 200;
    pub const UNHEALTHY: u16 = 500;

    pub fn healthy() -> Self {
        Self {
            code: Self::HEALTHY,
        }
    }

    pub fn unhealthy() -> Self {
        Self {
            code: Self::UNHEALTHY,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.code == Self::HEALTHY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serializes_with_field_names() {
        let state = JobsState {
            priority: 10,
            pipeline: "emails".to_string(),
            driver: "amqp".to_string(),
            queue: "q".to_string(),
            active: 3,
            delayed: 1,
            ready: true,
        };
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["pipeline"], "emails");
        assert_eq!(value["active"], 3);
        assert_eq!(value["ready"], true);
    }

    #[test]
    fn test_status_codes() {
        assert!(Status::healthy().is_healthy());
        assert_eq!(Status::unhealthy().code, 500);
    }
}
