//! Registered interest of a waiting execution in a signal, message or error.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ExecRef, ExecutionId, Timestamp};

/// Key of an error subscription that catches every error code.
pub const ANY_ERROR: &str = "*";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionKind {
    Signal,
    Message,
    Error,
}

impl std::fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionKind::Signal => write!(f, "signal"),
            SubscriptionKind::Message => write!(f, "message"),
            SubscriptionKind::Error => write!(f, "error"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventSubscription {
    pub id: Uuid,
    pub instance_id: Uuid,
    /// Execution that owns the subscription: the waiting token for catch
    /// events, the activity scope for boundary events.
    pub execution: ExecutionId,
    pub kind: SubscriptionKind,
    /// Signal name, message name or error code.
    pub key: String,
    /// Catching element (intermediate event, receive task or boundary).
    pub activity_id: String,
    /// Resolved once from the correlation-key expression.
    pub correlation_value: Option<serde_json::Value>,
    pub created_at: Timestamp,
}

impl EventSubscription {
    pub fn exec_ref(&self) -> ExecRef {
        ExecRef::new(self.instance_id, self.execution)
    }

    /// Message match: the name must be equal and, when the subscription
    /// carries a correlation value, the incoming key must equal it.
    pub fn matches_message(&self, name: &str, correlation_key: Option<&serde_json::Value>) -> bool {
        if self.kind != SubscriptionKind::Message || self.key != name {
            return false;
        }
        match (&self.correlation_value, correlation_key) {
            (None, _) => true,
            (Some(expected), Some(given)) => expected == given,
            (Some(_), None) => false,
        }
    }

    pub fn catches_error(&self, code: &str) -> bool {
        self.kind == SubscriptionKind::Error && (self.key == code || self.key == ANY_ERROR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn message_sub(correlation: Option<serde_json::Value>) -> EventSubscription {
        EventSubscription {
            id: Uuid::now_v7(),
            instance_id: Uuid::now_v7(),
            execution: ExecutionId(1),
            kind: SubscriptionKind::Message,
            key: "paid".into(),
            activity_id: "wait_payment".into(),
            correlation_value: correlation,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_message_matching() {
        let keyed = message_sub(Some(json!("order-1")));
        assert!(keyed.matches_message("paid", Some(&json!("order-1"))));
        assert!(!keyed.matches_message("paid", Some(&json!("order-2"))));
        assert!(!keyed.matches_message("paid", None));
        assert!(!keyed.matches_message("shipped", Some(&json!("order-1"))));

        let open = message_sub(None);
        assert!(open.matches_message("paid", None));
        assert!(open.matches_message("paid", Some(&json!(42))));
    }

    #[test]
    fn test_catch_any_error() {
        let mut sub = message_sub(None);
        sub.kind = SubscriptionKind::Error;
        sub.key = ANY_ERROR.into();
        assert!(sub.catches_error("E42"));
        sub.key = "E1".into();
        assert!(!sub.catches_error("E42"));
    }
}
