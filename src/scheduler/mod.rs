pub mod jobs;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::EngineResult;
use jobs::{DueJob, JobKind, ScheduledJob};

/// The scheduled-job table. Jobs live in memory only: a script's `init` is
/// the single source of truth, so a reload clears and re-registers them.
///
/// Cloning is cheap — clones share the same underlying data via Arc.
#[derive(Clone)]
pub struct Scheduler {
    jobs: Arc<Mutex<HashMap<String, ScheduledJob>>>,
    /// Woken whenever the earliest deadline may have moved.
    notify: Arc<Notify>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn notified(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Register a one-off job. An existing job with the same (script, name)
    /// is replaced.
    pub fn register_once(
        &self,
        script_uri: &str,
        handler_name: &str,
        run_at: DateTime<Utc>,
        name: Option<String>,
    ) -> EngineResult<String> {
        self.insert(ScheduledJob {
            job_id: Uuid::new_v4().to_string(),
            script_uri: script_uri.to_string(),
            handler_name: handler_name.to_string(),
            kind: JobKind::Once,
            name: name.unwrap_or_else(|| handler_name.to_string()),
            next_fire_at: run_at,
            interval: None,
        })
    }

    /// Register a recurring job. An existing job with the same (script, name)
    /// is replaced, which is what makes reload idempotent.
    pub fn register_recurring(
        &self,
        script_uri: &str,
        handler_name: &str,
        interval: Duration,
        start_at: Option<DateTime<Utc>>,
        name: Option<String>,
    ) -> EngineResult<String> {
        self.insert(ScheduledJob {
            job_id: Uuid::new_v4().to_string(),
            script_uri: script_uri.to_string(),
            handler_name: handler_name.to_string(),
            kind: JobKind::Recurring,
            name: name.unwrap_or_else(|| handler_name.to_string()),
            next_fire_at: start_at.unwrap_or_else(|| Utc::now() + interval),
            interval: Some(interval),
        })
    }

    fn insert(&self, job: ScheduledJob) -> EngineResult<String> {
        let job_id = job.job_id.clone();
        let mut jobs = self.jobs.lock().expect("scheduler poisoned");
        // Names are unique per script: re-registering replaces the prior job.
        jobs.retain(|_, j| !(j.script_uri == job.script_uri && j.name == job.name));
        jobs.insert(job_id.clone(), job);
        drop(jobs);
        self.notify.notify_one();
        Ok(job_id)
    }

    /// Remove every job owned by a script (reload/unload sweep, and the
    /// script-facing `clearAll`).
    pub fn clear_script(&self, script_uri: &str) {
        let mut jobs = self.jobs.lock().expect("scheduler poisoned");
        jobs.retain(|_, j| j.script_uri != script_uri);
        drop(jobs);
        self.notify.notify_one();
    }

    pub fn jobs_for_script(&self, script_uri: &str) -> Vec<ScheduledJob> {
        let jobs = self.jobs.lock().expect("scheduler poisoned");
        let mut out: Vec<ScheduledJob> = jobs
            .values()
            .filter(|j| j.script_uri == script_uri)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().expect("scheduler poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest deadline across all jobs, for the dispatch loop's sleep.
    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        let jobs = self.jobs.lock().expect("scheduler poisoned");
        jobs.values().map(|j| j.next_fire_at).min()
    }

    /// Pop everything due at `now`, advancing recurring jobs and consuming
    /// one-off jobs. Missed recurring slots coalesce (see `jobs::advance`).
    pub fn collect_due(&self, now: DateTime<Utc>) -> Vec<DueJob> {
        let mut jobs = self.jobs.lock().expect("scheduler poisoned");
        let due_ids: Vec<String> = jobs
            .values()
            .filter(|j| j.next_fire_at <= now)
            .map(|j| j.job_id.clone())
            .collect();

        let mut due = Vec::with_capacity(due_ids.len());
        for id in due_ids {
            let Some(job) = jobs.remove(&id) else { continue };
            let (fired, next) = jobs::advance(&job, now);
            if let Some(next) = next {
                jobs.insert(next.job_id.clone(), next);
            }
            due.push(fired);
        }
        due.sort_by_key(|d| d.scheduled_for);
        due
    }
}
