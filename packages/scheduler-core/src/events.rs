//! The four lifecycle events the processor broadcasts (§4.3.4), plus the
//! pass-through shape handlers use via `onEmit` for arbitrary well-formed
//! events.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::ids::JobId;
use crate::operation::OperationKind;

/// The wire shape every broadcast carries: `{ type, payload, timestamp }`
/// (§4.3.2 step 12, §6.2).
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// The four events the processor itself emits.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Started {
        job_id: JobId,
        operation_kind: OperationKind,
    },
    Progress {
        job_id: JobId,
        operation_kind: OperationKind,
        progress: u8,
        label: Option<String>,
    },
    Completed {
        job_id: JobId,
        operation_kind: OperationKind,
        result: Value,
    },
    Failed {
        job_id: JobId,
        operation_kind: OperationKind,
        error: String,
    },
}

impl JobEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            JobEvent::Started { .. } => "JOB_STARTED",
            JobEvent::Progress { .. } => "JOB_PROGRESS",
            JobEvent::Completed { .. } => "JOB_COMPLETED",
            JobEvent::Failed { .. } => "JOB_FAILED",
        }
    }

    /// Stamps the event with the current time, producing the shape every
    /// collaborator broadcast call sends over the wire.
    pub fn into_broadcast(self, now: DateTime<Utc>) -> BroadcastEvent {
        let event_type = self.event_type().to_string();
        let payload = match self {
            JobEvent::Started {
                job_id,
                operation_kind,
            } => serde_json::json!({ "jobId": job_id, "operationKind": operation_kind.as_str() }),
            JobEvent::Progress {
                job_id,
                operation_kind,
                progress,
                label,
            } => serde_json::json!({
                "jobId": job_id,
                "operationKind": operation_kind.as_str(),
                "progress": progress,
                "label": label,
            }),
            JobEvent::Completed {
                job_id,
                operation_kind,
                result,
            } => serde_json::json!({
                "jobId": job_id,
                "operationKind": operation_kind.as_str(),
                "result": result,
            }),
            JobEvent::Failed {
                job_id,
                operation_kind,
                error,
            } => serde_json::json!({
                "jobId": job_id,
                "operationKind": operation_kind.as_str(),
                "error": error,
            }),
        };
        BroadcastEvent {
            event_type,
            payload,
            timestamp: now,
        }
    }
}

/// An arbitrary handler-emitted event passed through `onEmit` without the
/// processor knowing its shape in advance.
#[derive(Debug, Clone)]
pub struct CustomEvent {
    pub event_type: String,
    pub payload: Value,
}

impl CustomEvent {
    pub fn into_broadcast(self, now: DateTime<Utc>) -> BroadcastEvent {
        BroadcastEvent {
            event_type: self.event_type,
            payload: self.payload,
            timestamp: now,
        }
    }
}
