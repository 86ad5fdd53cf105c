use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Once,
    Recurring,
}

/// One scheduled handler invocation (or series of them).
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledJob {
    pub job_id: String,
    pub script_uri: String,
    pub handler_name: String,
    pub kind: JobKind,
    pub name: String,
    pub next_fire_at: DateTime<Utc>,
    /// Recurrence interval; `None` for one-off jobs.
    #[serde(skip)]
    pub interval: Option<Duration>,
}

/// A job popped from the queue, ready to dispatch. `scheduled_for` is the
/// slot that triggered the fire; `skipped` counts coalesced missed slots.
#[derive(Debug, Clone)]
pub struct DueJob {
    pub job: ScheduledJob,
    pub scheduled_for: DateTime<Utc>,
    pub skipped: u64,
}

/// Parse a script-supplied timestamp. Only explicit UTC is accepted: a
/// trailing `Z` or `+00:00` offset. Anything else is `ScheduleBadTime`.
pub fn parse_utc(input: &str) -> EngineResult<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(input)
        .map_err(|e| EngineError::ScheduleBadTime(format!("'{input}': {e}")))?;
    if parsed.offset().local_minus_utc() != 0 {
        return Err(EngineError::ScheduleBadTime(format!(
            "'{input}': timestamps must be UTC"
        )));
    }
    Ok(parsed.with_timezone(&Utc))
}

/// Convert a script-supplied interval in minutes into a `Duration`.
pub fn interval_from_minutes(minutes: f64) -> EngineResult<Duration> {
    if !minutes.is_finite() || minutes <= 0.0 {
        return Err(EngineError::ScheduleBadTime(
            "intervalMinutes must be a positive number".into(),
        ));
    }
    let secs = (minutes * 60.0).round() as i64;
    if secs < 1 {
        return Err(EngineError::ScheduleBadTime(
            "intervalMinutes is below one second".into(),
        ));
    }
    Ok(Duration::seconds(secs))
}

/// Advance a due job: returns the dispatchable `DueJob` plus the job's next
/// occurrence (`None` for one-off jobs, which are consumed).
///
/// Recurring jobs advance `next_fire_at` by whole intervals. When the queue
/// fell more than one interval behind, the missed slots coalesce into this
/// single fire and their count is reported.
pub fn advance(job: &ScheduledJob, now: DateTime<Utc>) -> (DueJob, Option<ScheduledJob>) {
    let scheduled_for = job.next_fire_at;

    match (job.kind, job.interval) {
        (JobKind::Recurring, Some(interval)) => {
            // Whole slots between the firing slot and now fold into this one
            // run; the next slot always lands strictly after now, back on
            // the fixed grid.
            let behind = now - scheduled_for;
            let skipped = (behind.num_milliseconds() / interval.num_milliseconds()).max(0) as u64;

            let mut next = job.clone();
            next.next_fire_at = scheduled_for + interval * (skipped as i32 + 1);

            (
                DueJob {
                    job: job.clone(),
                    scheduled_for,
                    skipped,
                },
                Some(next),
            )
        }
        _ => (
            DueJob {
                job: job.clone(),
                scheduled_for,
                skipped: 0,
            },
            None,
        ),
    }
}
