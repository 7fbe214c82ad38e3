//! Job intake.
//!
//! Change-feed records and direct invocations carry the same contract: a
//! record id plus the request fields. Both end up as a [`Job`] on the
//! [`RenderQueue`].

use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::job::{Job, JobPayload};
use crate::queue::{JobHandle, QueueError, RenderQueue};

/// Error type for intake parsing
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed event: {0}")]
    Malformed(String),

    #[error("Event has no usable id")]
    MissingId,
}

/// What an incoming event turned into.
#[derive(Debug, Clone, PartialEq)]
pub enum IntakeEvent {
    Job(Job),
    /// Valid event that does not concern this service
    Ignored { reason: String },
}

/// Record ids may be numbers or strings.
fn record_id(value: Option<&Value>) -> Result<String, IntakeError> {
    let id = match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };
    if id.is_empty() {
        Err(IntakeError::MissingId)
    } else {
        Ok(id)
    }
}

fn payload_from(value: Value) -> Result<JobPayload, IntakeError> {
    if !value.is_object() {
        return Err(IntakeError::Malformed("request fields must be an object".to_string()));
    }
    Ok(serde_json::from_value(value)?)
}

/// Interpret one event.
///
/// Accepts a change-feed record `{"type": "INSERT", "table": ..., "record": {...}}`
/// or a direct invocation `{"id": ..., "data": {...}}`. Change-feed events
/// for other tables or of other types are ignored.
pub fn parse_event(value: Value, table: &str) -> Result<IntakeEvent, IntakeError> {
    let mut object = match value {
        Value::Object(object) => object,
        _ => return Err(IntakeError::Malformed("event must be a JSON object".to_string())),
    };

    if let Some(record) = object.remove("record") {
        let event_type = object.get("type").and_then(Value::as_str).unwrap_or("");
        if !event_type.eq_ignore_ascii_case("INSERT") {
            return Ok(IntakeEvent::Ignored {
                reason: format!("event type '{}'", event_type),
            });
        }
        if let Some(source) = object.get("table").and_then(Value::as_str) {
            if source != table {
                return Ok(IntakeEvent::Ignored {
                    reason: format!("table '{}'", source),
                });
            }
        }

        let id = record_id(record.get("id"))?;
        let payload = payload_from(record)?;
        return Ok(IntakeEvent::Job(Job::new(id, payload)));
    }

    let id = record_id(object.get("id"))?;
    let data = object
        .remove("data")
        .ok_or_else(|| IntakeError::Malformed("missing 'data' or 'record'".to_string()))?;
    let payload = payload_from(data)?;
    Ok(IntakeEvent::Job(Job::new(id, payload)))
}

/// Interpret a standalone document, as handed to a one-off invocation.
///
/// Events are parsed as usual; a bare request object (no `id`, `data` or
/// `record`) becomes a job with a generated `local-<uuid>` id.
pub fn job_from_document(value: Value, table: &str) -> Result<IntakeEvent, IntakeError> {
    let is_event = value
        .as_object()
        .map(|o| o.contains_key("id") || o.contains_key("data") || o.contains_key("record"))
        .unwrap_or(false);
    if is_event {
        return parse_event(value, table);
    }

    let payload = payload_from(value)?;
    Ok(IntakeEvent::Job(Job::new(
        format!("local-{}", Uuid::new_v4()),
        payload,
    )))
}

/// Parse one line of a newline-delimited feed.
pub fn parse_line(line: &str, table: &str) -> Result<IntakeEvent, IntakeError> {
    parse_event(serde_json::from_str(line)?, table)
}

/// Log the outcome of a job once it settles.
pub fn watch_handle(handle: JobHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        let job_id = handle.job_id().to_string();
        match handle.wait().await {
            Ok(job) => info!(
                job_id = %job_id,
                output_url = job.output_url.as_deref().unwrap_or(""),
                "Job settled: completed"
            ),
            Err(QueueError::Failed(failed)) => warn!(
                job_id = %job_id,
                retries = failed.job.retry_count,
                error = %failed.error,
                "Job settled: failed"
            ),
            Err(e) => warn!(job_id = %job_id, error = %e, "Job did not settle"),
        }
    })
}

/// Totals of a feed run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub enqueued: usize,
    pub ignored: usize,
    pub rejected: usize,
}

/// Read newline-delimited events and enqueue the jobs they describe.
///
/// Returns at end of input or once the queue stops admitting jobs. Bad
/// lines are logged and skipped.
pub async fn run_line_feed<R>(
    reader: R,
    queue: Arc<RenderQueue>,
    table: &str,
) -> std::io::Result<FeedStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut stats = FeedStats::default();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse_line(line, table) {
            Ok(IntakeEvent::Job(job)) => match queue.enqueue(job) {
                Ok(handle) => {
                    stats.enqueued += 1;
                    watch_handle(handle);
                }
                Err(QueueError::ShuttingDown) => {
                    info!("Queue is shutting down, closing feed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to enqueue job");
                    stats.rejected += 1;
                }
            },
            Ok(IntakeEvent::Ignored { reason }) => {
                debug!(reason = %reason, "Ignoring event");
                stats.ignored += 1;
            }
            Err(e) => {
                warn!(error = %e, "Rejecting malformed event");
                stats.rejected += 1;
            }
        }
    }

    info!(
        enqueued = stats.enqueued,
        ignored = stats.ignored,
        rejected = stats.rejected,
        "Feed closed"
    );
    Ok(stats)
}
