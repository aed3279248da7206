use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An inbound domain event (e.g. "subject_created", "form_submitted").
/// Delivery is at-least-once, so consumers deduplicate on
/// `(event_type, subject_id, occurred_at)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_type: String,
    pub subject_id: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl DomainEvent {
    /// Deduplication key for at-least-once ingestion.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.event_type,
            self.subject_id,
            self.occurred_at.timestamp_millis()
        )
    }
}

/// Kind of outbound side effect handed to the dispatch collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchKind {
    Message,
    ExternalAction,
}

/// A side-effecting action sent across the collaborator boundary.
///
/// The engine owns only the idempotency key and the retry classification of
/// the outcome; everything inside `config` is opaque to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchAction {
    pub kind: DispatchKind,
    pub idempotency_key: String,
    pub subject_id: String,
    pub config: serde_json::Value,
}

/// Successful result of a collaborator dispatch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchOutcome {
    /// Provider-side reference (message id, CRM record id, ...), if any.
    pub external_ref: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_key_is_stable() {
        let at = Utc::now();
        let a = DomainEvent {
            event_type: "form_submitted".into(),
            subject_id: "subject-1".into(),
            occurred_at: at,
            payload: serde_json::json!({"form": "rsvp"}),
        };
        let b = DomainEvent {
            payload: serde_json::json!({}),
            ..a.clone()
        };
        assert_eq!(a.dedup_key(), b.dedup_key());
    }
}
