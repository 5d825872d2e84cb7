use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub fn now_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

fn is_zero(count: &u32) -> bool {
    *count == 0
}

/// The wire record stored in Redis. Immutable once pushed; the retry path
/// produces a new descriptor via [`JobDescriptor::next_retry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub class: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<f64>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_count: u32,
    /// Present only while the descriptor sits in a schedule zset waiting to
    /// be promoted to the priority end of its queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_retry: Option<bool>,
}

impl JobDescriptor {
    pub fn new(class: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            class: class.into(),
            args,
            enqueued_at: Some(now_secs()),
            retry_count: 0,
            priority_retry: None,
        }
    }

    pub fn next_retry(&self) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            priority_retry: None,
            ..self.clone()
        }
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to serialize job descriptor")
    }

    pub fn decode(payload: &str) -> Result<Self> {
        serde_json::from_str(payload)
            .with_context(|| format!("malformed job descriptor: {payload}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedJob {
    #[serde(flatten)]
    pub job: JobDescriptor,
    pub failed_at: f64,
    pub error: String,
    #[serde(default)]
    pub backtrace: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn descriptor_round_trip_preserves_all_fields() {
        let descriptor = JobDescriptor {
            class: "SendEmail".to_string(),
            args: vec![json!(42), json!("hi"), json!({"nested": [1, 2]})],
            enqueued_at: Some(1_700_000_000.123456),
            retry_count: 2,
            priority_retry: Some(true),
        };
        let payload = descriptor.encode().unwrap();
        assert_eq!(JobDescriptor::decode(&payload).unwrap(), descriptor);
    }

    #[test]
    fn absent_retry_count_defaults_to_zero() {
        let descriptor = JobDescriptor::decode(r#"{"class":"A","args":[]}"#).unwrap();
        assert_eq!(descriptor.retry_count, 0);
        assert_eq!(descriptor.enqueued_at, None);
        assert_eq!(descriptor.priority_retry, None);
    }

    #[test]
    fn zero_retry_count_and_empty_flags_are_not_serialized() {
        let descriptor = JobDescriptor::new("A", vec![]);
        let payload = descriptor.encode().unwrap();
        assert!(!payload.contains("retry_count"));
        assert!(!payload.contains("priority_retry"));
    }

    #[test]
    fn next_retry_increments_count_and_clears_priority_flag() {
        let mut descriptor = JobDescriptor::new("A", vec![json!(1)]);
        descriptor.priority_retry = Some(true);
        let retry = descriptor.next_retry();
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.priority_retry, None);
        assert_eq!(retry.enqueued_at, descriptor.enqueued_at);
        assert_eq!(retry.args, descriptor.args);
    }

    #[test]
    fn decode_rejects_malformed_payloads() {
        assert!(JobDescriptor::decode("not json").is_err());
        assert!(JobDescriptor::decode(r#"{"args":[]}"#).is_err());
    }

    #[test]
    fn failed_job_flattens_descriptor_fields() {
        let record = FailedJob {
            job: JobDescriptor {
                class: "F".to_string(),
                args: vec![json!("x")],
                enqueued_at: Some(1.5),
                retry_count: 3,
                priority_retry: None,
            },
            failed_at: 2.5,
            error: "boom".to_string(),
            backtrace: vec!["frame".to_string()],
        };
        let payload = serde_json::to_string(&record).unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["class"], "F");
        assert_eq!(value["retry_count"], 3);
        assert_eq!(value["error"], "boom");
        let parsed: FailedJob = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed, record);
    }
}
