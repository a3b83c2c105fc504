//! Cron style recurring jobs.
//!
//! Each scheduled job gets a timer loop that sleeps until the next firing and
//! spawns the job on a [`TaskTracker`]. [`Scheduler::stop`] cancels every
//! timer and then waits for the tracker to drain, so no job invocation is
//! running once it returns.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use cron::Schedule;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::supervise::panic_message;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid cron spec '{spec}': {reason}")]
    InvalidSpec { spec: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

pub type Job = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct JobEntry {
    spec: String,
    schedule: Arc<Schedule>,
    job: Job,
    timer: Option<CancellationToken>,
}

pub struct Scheduler {
    jobs: DashMap<JobId, JobEntry>,
    root: Mutex<CancellationToken>,
    running: AtomicBool,
    tracker: TaskTracker,
    next_id: AtomicU64,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            jobs: DashMap::new(),
            root: Mutex::new(CancellationToken::new()),
            running: AtomicBool::new(false),
            tracker: TaskTracker::new(),
            next_id: AtomicU64::new(1),
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("jobs", &self.jobs.len())
            .field("running", &self.is_running())
            .field("in_flight", &self.tracker.len())
            .finish()
    }
}

/// Accepts 5-field (minute resolution) and 6/7-field (second resolution)
/// expressions, plus `@daily` style shorthands.
///
/// 5-field specs use the classic crontab day-of-week numbering (0-7, where
/// both 0 and 7 are Sunday); it is rewritten to the 1-7 (Sunday = 1) form the
/// parser expects.
pub fn parse_spec(spec: &str) -> Result<Schedule, SchedulerError> {
    let invalid = |reason: String| SchedulerError::InvalidSpec {
        spec: spec.to_string(),
        reason,
    };

    let fields: Vec<&str> = spec.split_whitespace().collect();
    let normalized = if fields.len() == 5 {
        let dow = crontab_weekdays(fields[4]).map_err(invalid)?;
        format!("0 {} {dow}", fields[..4].join(" "))
    } else {
        spec.trim().to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))
}

/// Rewrite a crontab day-of-week field. Named days and `*` pass through.
fn crontab_weekdays(field: &str) -> Result<String, String> {
    let mut out = Vec::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => (base, Some(step)),
            None => (item, None),
        };
        let numeric = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
        let bounds = match base.split_once('-') {
            Some((lo, hi)) if numeric(lo) && numeric(hi) => Some((lo, Some(hi))),
            None if numeric(base) => Some((base, None)),
            _ => None,
        };
        let Some((lo, hi)) = bounds else {
            out.push(item.to_string());
            continue;
        };

        let weekday = |s: &str| match s.parse::<u32>() {
            Ok(n) if n <= 7 => Ok(n),
            _ => Err(format!("day of week '{s}' out of range 0-7")),
        };
        let lo = weekday(lo)?;
        // `n/step` runs to the end of the week.
        let hi = match (hi, step) {
            (Some(hi), _) => weekday(hi)?,
            (None, Some(_)) => 6,
            (None, None) => lo,
        };
        if lo > hi {
            return Err(format!("day of week range '{base}' is reversed"));
        }
        let step = match step {
            Some(s) => s
                .parse::<usize>()
                .ok()
                .filter(|s| *s > 0)
                .ok_or_else(|| format!("bad day of week step '{s}'"))?,
            None => 1,
        };
        for n in (lo..=hi).step_by(step) {
            out.push(((n % 7) + 1).to_string());
        }
    }
    Ok(out.join(","))
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a recurring job. Starts firing immediately if the scheduler runs,
    /// otherwise on [`Scheduler::start`].
    pub fn schedule<F, Fut>(&self, spec: &str, job: F) -> Result<JobId, SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let schedule = Arc::new(parse_spec(spec)?);
        let job: Job = Arc::new(move || job().boxed());
        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let timer = if self.is_running() {
            Some(self.spawn_timer(id, schedule.clone(), job.clone()))
        } else {
            None
        };
        self.jobs.insert(
            id,
            JobEntry {
                spec: spec.to_string(),
                schedule,
                job,
                timer,
            },
        );
        tracing::debug!(job = id.0, spec, "job scheduled");
        Ok(id)
    }

    /// Stop future firings of `id`. An invocation already running is not interrupted.
    pub fn unschedule(&self, id: JobId) -> bool {
        match self.jobs.remove(&id) {
            Some((_, entry)) => {
                if let Some(timer) = entry.timer {
                    timer.cancel();
                }
                tracing::debug!(job = id.0, spec = %entry.spec, "job unscheduled");
                true
            }
            None => false,
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.root.lock() = CancellationToken::new();

        for mut entry in self.jobs.iter_mut() {
            let id = *entry.key();
            let timer = self.spawn_timer(id, entry.schedule.clone(), entry.job.clone());
            entry.timer = Some(timer);
        }
        tracing::info!(jobs = self.jobs.len(), "scheduler started");
    }

    /// Cancel every timer and wait until running invocations finish.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let root = self.root.lock().clone();
        root.cancel();
        for mut entry in self.jobs.iter_mut() {
            entry.timer = None;
        }

        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
        tracing::info!("scheduler stopped, in-flight jobs drained");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn spawn_timer(&self, id: JobId, schedule: Arc<Schedule>, job: Job) -> CancellationToken {
        let token = self.root.lock().child_token();
        let cancel = token.clone();
        let tracker = self.tracker.clone();

        self.tracker.spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    break;
                };
                let delay = (next - Utc::now()).to_std().unwrap_or_default();

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                let job = job.clone();
                tracker.spawn(async move {
                    if let Err(panic) = AssertUnwindSafe(async move { job().await })
                        .catch_unwind()
                        .await
                    {
                        tracing::error!(job = id.0, reason = %panic_message(&*panic), "job panicked");
                    }
                });
            }
        });

        token
    }
}
