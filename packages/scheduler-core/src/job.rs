//! The `Job` data model (§3) and the re-enqueue backoff arithmetic shared
//! by the Operation Processor's admission step (§4.3.1) and the Priority
//! Queue's unrecoverable-timeout path (§4.4).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use typed_builder::TypedBuilder;

use crate::ids::{JobId, UserId};
use crate::operation::OperationKind;

/// A queued unit of work (§3 "Job").
///
/// `job_id` is queue-assigned and therefore absent from the builder — it
/// is set once by [`crate::queue::JobQueue::enqueue`]. `requeue_count` is
/// absent on first enqueue and carried out-of-band on the envelope (not
/// inside `data`) so the processor can strip it before handing `data` to
/// the handler (§4.3.2 step 8, §9 redesign flag).
#[derive(Debug, Clone, TypedBuilder)]
pub struct Job {
    #[builder(default, setter(skip))]
    pub job_id: JobId,
    pub operation_kind: OperationKind,
    pub user_id: UserId,
    pub data: Value,
    #[builder(default_code = "synthesize_idempotency_key(user_id, operation_kind, &data)")]
    pub idempotency_key: String,
    #[builder(default_code = "Utc::now()")]
    pub enqueued_at: DateTime<Utc>,
    #[builder(default)]
    pub requeue_count: u32,
    /// Execution-failure retry attempts consumed so far (§4.4, §7). Distinct
    /// from `requeue_count`: this counts attempts that acquired the agent
    /// lock and ran the handler, not admission-contention backoffs.
    #[builder(default)]
    pub retry_count: u32,
}

impl Job {
    /// Assigns the queue-owned id; called exactly once by the queue on
    /// insertion.
    pub fn with_job_id(mut self, job_id: JobId) -> Self {
        self.job_id = job_id;
        self
    }

    /// The scrubbed payload handed to the handler: `data` with
    /// `requeue_count` never present, because it was never stored there
    /// in the first place (§4.3.2 step 8).
    pub fn handler_payload(&self) -> &Value {
        &self.data
    }
}

/// Builds a deterministic key from `(user_id, kind, data)` when the caller
/// doesn't supply an `idempotencyKey` (§3). Two enqueues with identical
/// user, kind and payload synthesize the same key.
fn synthesize_idempotency_key(user_id: UserId, kind: OperationKind, data: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_uuid().as_bytes());
    hasher.update(kind.as_str().as_bytes());
    hasher.update(data.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// `requeueCount ← (data.requeueCount ?? 0) + 1` and
/// `delay ← min(2s · 2^(requeueCount−1), 30s)` (§4.3.1 step 3, §8
/// boundary behaviours, §7 retry-not-an-error bullet).
///
/// Returns the new count and the delay to schedule the re-enqueue with.
pub fn next_requeue(current_requeue_count: u32) -> (u32, Duration) {
    let new_count = current_requeue_count + 1;
    let delay = backoff_delay(new_count);
    (new_count, delay)
}

/// `min(2s · 2^(n−1), 30s)` for `n >= 1`.
pub fn backoff_delay(requeue_count: u32) -> Duration {
    debug_assert!(requeue_count >= 1);
    let exponent = requeue_count.saturating_sub(1).min(4); // 2^4 * 2s = 32s already caps at 30s
    let millis = 2_000u64.saturating_mul(1u64 << exponent);
    Duration::from_millis(millis.min(30_000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_requeue_uses_a_two_second_delay() {
        let (count, delay) = next_requeue(0);
        assert_eq!(count, 1);
        assert_eq!(delay, Duration::from_secs(2));
    }

    #[test]
    fn delay_doubles_each_requeue_until_the_cap() {
        let expected_ms = [2_000, 4_000, 8_000, 16_000, 30_000, 30_000, 30_000];
        let mut count = 0;
        for expected in expected_ms {
            let (new_count, delay) = next_requeue(count);
            assert_eq!(delay, Duration::from_millis(expected));
            count = new_count;
        }
    }

    #[test]
    fn fourteenth_and_later_requeues_use_the_thirty_second_cap() {
        assert_eq!(backoff_delay(14), Duration::from_secs(30));
        assert_eq!(backoff_delay(50), Duration::from_secs(30));
    }

    #[test]
    fn requeue_count_is_monotone_across_successive_requeues() {
        let (first, _) = next_requeue(0);
        let (second, _) = next_requeue(first);
        assert_eq!(second, first + 1);
    }

    #[test]
    fn idempotency_key_defaults_to_a_deterministic_synthesis() {
        let user = UserId::new();
        let data = serde_json::json!({"orderId": "ORD-1"});

        let job_a = Job::builder()
            .operation_kind(OperationKind::SubmitOrder)
            .user_id(user)
            .data(data.clone())
            .build();
        let job_b = Job::builder()
            .operation_kind(OperationKind::SubmitOrder)
            .user_id(user)
            .data(data)
            .build();

        assert_eq!(job_a.idempotency_key, job_b.idempotency_key);
    }

    #[test]
    fn handler_payload_never_carries_requeue_count_because_it_was_never_stored_there() {
        let job = Job::builder()
            .operation_kind(OperationKind::SubmitOrder)
            .user_id(UserId::new())
            .data(serde_json::json!({"orderId": "ORD-1"}))
            .requeue_count(3)
            .build();

        assert!(job.handler_payload().get("requeueCount").is_none());
    }
}
