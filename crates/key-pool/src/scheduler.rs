//! Cron-driven job scheduler
//!
//! Each registered job gets its own timer task that sleeps until the next
//! fire time of its cron expression. A firing spawns the job body on its own
//! task, so a slow job never delays its timer or any other job. A firing that
//! finds the previous run of the same job still in progress is skipped.
//!
//! Expressions use the `cron` crate syntax with a leading seconds field. The
//! usual five-field crontab form is accepted and runs at second zero; its
//! numeric days of week keep crontab meaning (0 and 7 are Sunday, 1 is Monday).
//!
//! Job failures are logged, counted and sent to the notifier; the job stays
//! scheduled. Rescheduling swaps the expression in place and wakes the
//! job's timer so the new next fire time takes effect immediately.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use upstream::Notifier;

use crate::error::{Error, Result};

/// Work a scheduler can run.
///
/// `Ok(Some(message))` is delivered to the notifier; `Ok(None)` is a quiet
/// success.
pub trait Job: Send + Sync {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + '_>>;
}

/// Parse a cron expression, accepting five-field crontab syntax.
pub fn parse_expression(expression: &str) -> Result<cron::Schedule> {
    let invalid = |reason: String| Error::InvalidExpression {
        expression: expression.to_string(),
        reason,
    };

    let trimmed = expression.trim();
    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    let normalized = if let &[minute, hour, day, month, weekday] = fields.as_slice() {
        let weekday = crontab_weekdays(weekday).map_err(invalid)?;
        format!("0 {minute} {hour} {day} {month} {weekday}")
    } else {
        trimmed.to_string()
    };
    cron::Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))
}

/// Upcoming firings sampled by [`fire_spacing`].
const SPACING_SAMPLES: usize = 16;

/// Widest gap between consecutive fire times over the next few firings.
///
/// `None` when the expression fires fewer than twice from now on.
pub fn fire_spacing(expression: &str) -> Result<Option<Duration>> {
    let schedule = parse_expression(expression)?;
    let fires: Vec<DateTime<Utc>> = schedule.upcoming(Utc).take(SPACING_SAMPLES).collect();
    Ok(fires
        .windows(2)
        .filter_map(|pair| (pair[1] - pair[0]).to_std().ok())
        .max())
}

/// Rewrite a crontab day-of-week field for the `cron` crate.
///
/// Crontab counts 0-7 from Sunday (7 is Sunday again); `cron` counts 1-7 from
/// Sunday. Numeric items are expanded to explicit days so ranges ending on
/// Sunday (`5-7`) stay valid. Named items pass through untouched.
fn crontab_weekdays(field: &str) -> std::result::Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut names = Vec::new();
    let mut days = BTreeSet::new();
    for item in field.split(',') {
        if item.chars().any(|c| c.is_ascii_alphabetic()) {
            names.push(item.to_string());
            continue;
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, parse_weekday_number(step)?),
            None => (item, 1),
        };
        if step == 0 {
            return Err(format!("day-of-week step must be positive: {item}"));
        }
        let (first, last) = match range.split_once('-') {
            _ if range == "*" => (0, 6),
            Some((first, last)) => (parse_weekday_number(first)?, parse_weekday_number(last)?),
            None if item.contains('/') => (parse_weekday_number(range)?, 6),
            None => {
                let day = parse_weekday_number(range)?;
                (day, day)
            }
        };
        if first > 7 || last > 7 {
            return Err(format!("day of week must be between 0 and 7: {item}"));
        }
        if first > last {
            return Err(format!("day-of-week range is inverted: {item}"));
        }
        days.extend((first..=last).step_by(step as usize).map(|day| day % 7 + 1));
    }

    Ok(names
        .into_iter()
        .chain(days.into_iter().map(|day| day.to_string()))
        .collect::<Vec<_>>()
        .join(","))
}

fn parse_weekday_number(value: &str) -> std::result::Result<u8, String> {
    value
        .parse()
        .map_err(|_| format!("not a day-of-week number: {value:?}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Scheduled,
    Running,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    Failed(String),
    /// Fired while the previous run was still going
    Skipped,
}

impl JobOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Succeeded => "succeeded",
            JobOutcome::Failed(_) => "failed",
            JobOutcome::Skipped => "skipped",
        }
    }
}

/// Snapshot of one job's schedule for operators.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleInfo {
    pub name: String,
    pub expression: String,
    pub next_run: Option<DateTime<Utc>>,
    pub state: JobState,
    pub last_run: Option<DateTime<Utc>>,
    pub last_outcome: Option<JobOutcome>,
}

struct ScheduleEntry {
    expression: String,
    schedule: cron::Schedule,
    next_run: Option<DateTime<Utc>>,
}

struct JobSlot {
    name: String,
    job: Arc<dyn Job>,
    entry: Mutex<ScheduleEntry>,
    last: Mutex<Option<(DateTime<Utc>, JobOutcome)>>,
    running: AtomicBool,
    changed: Notify,
}

impl JobSlot {
    async fn info(&self) -> ScheduleInfo {
        let entry = self.entry.lock().await;
        let last = self.last.lock().await.clone();
        let state = if self.running.load(Ordering::Acquire) {
            JobState::Running
        } else {
            JobState::Scheduled
        };
        ScheduleInfo {
            name: self.name.clone(),
            expression: entry.expression.clone(),
            next_run: entry.next_run,
            state,
            last_run: last.as_ref().map(|(at, _)| *at),
            last_outcome: last.map(|(_, outcome)| outcome),
        }
    }

    /// Move `next_run` past `fired_at`.
    async fn advance(&self, fired_at: DateTime<Utc>) {
        let mut entry = self.entry.lock().await;
        let from = fired_at.max(Utc::now());
        entry.next_run = entry.schedule.after(&from).next();
    }

    async fn record(&self, outcome: JobOutcome) {
        metrics::counter!(
            "keypool_ticks_total",
            "job" => self.name.clone(),
            "outcome" => outcome.label()
        )
        .increment(1);
        *self.last.lock().await = Some((Utc::now(), outcome));
    }
}

/// Clears the running flag when a run ends, panics included.
struct RunningGuard(Arc<JobSlot>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
    }
}

pub struct Scheduler {
    slots: RwLock<BTreeMap<String, Arc<JobSlot>>>,
    notifier: Arc<dyn Notifier>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Scheduler {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            slots: RwLock::new(BTreeMap::new()),
            notifier,
            timers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Register `job` under `name`. Its timer starts with `start`, or at
    /// once if the scheduler is already running.
    pub async fn add_job(
        &self,
        name: &str,
        expression: &str,
        job: Arc<dyn Job>,
    ) -> Result<ScheduleInfo> {
        let schedule = parse_expression(expression)?;
        let mut slots = self.slots.write().await;
        if slots.contains_key(name) {
            return Err(Error::DuplicateJob(name.to_string()));
        }

        let next_run = schedule.upcoming(Utc).next();
        let slot = Arc::new(JobSlot {
            name: name.to_string(),
            job,
            entry: Mutex::new(ScheduleEntry {
                expression: expression.trim().to_string(),
                schedule,
                next_run,
            }),
            last: Mutex::new(None),
            running: AtomicBool::new(false),
            changed: Notify::new(),
        });
        slots.insert(name.to_string(), slot.clone());

        // `start` flips `started` under the slots lock, so exactly one of the
        // two spawns this slot's timer
        if self.started.load(Ordering::Acquire) {
            let handle = spawn_timer(slot.clone(), self.notifier.clone());
            self.timers.lock().await.push(handle);
        }
        drop(slots);

        info!(job = name, expression, next_run = ?next_run, "job registered");
        Ok(slot.info().await)
    }

    /// Start every job's timer. Calling twice is a no-op.
    pub async fn start(&self) {
        let slots = self.slots.read().await;
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut timers = self.timers.lock().await;
        for slot in slots.values() {
            timers.push(spawn_timer(slot.clone(), self.notifier.clone()));
        }
        info!(jobs = slots.len(), "scheduler started");
    }

    /// Stop all timers. Runs already in flight finish on their own.
    pub async fn stop(&self) {
        self.started.store(false, Ordering::Release);
        let mut timers = self.timers.lock().await;
        for handle in timers.drain(..) {
            handle.abort();
        }
        info!("scheduler stopped");
    }

    /// Replace a job's cron expression.
    ///
    /// An invalid expression is rejected before anything changes.
    pub async fn reschedule(&self, name: &str, expression: &str) -> Result<ScheduleInfo> {
        let schedule = parse_expression(expression)?;
        let slot = self.slot(name).await?;
        {
            let mut entry = slot.entry.lock().await;
            entry.next_run = schedule.upcoming(Utc).next();
            entry.expression = expression.trim().to_string();
            entry.schedule = schedule;
            info!(
                job = name,
                expression = %entry.expression,
                next_run = ?entry.next_run,
                "job rescheduled"
            );
        }
        slot.changed.notify_one();
        Ok(slot.info().await)
    }

    /// Every job, ordered by name.
    pub async fn info(&self) -> Vec<ScheduleInfo> {
        let slots: Vec<Arc<JobSlot>> = self.slots.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(slots.len());
        for slot in slots {
            infos.push(slot.info().await);
        }
        infos
    }

    pub async fn job_info(&self, name: &str) -> Result<ScheduleInfo> {
        Ok(self.slot(name).await?.info().await)
    }

    /// Fire a job now, outside its schedule.
    ///
    /// Returns `false` when the job was skipped because it is already running.
    pub async fn trigger(&self, name: &str) -> Result<bool> {
        let slot = self.slot(name).await?;
        info!(job = name, "manual trigger");
        Ok(dispatch(&slot, &self.notifier).await)
    }

    async fn slot(&self, name: &str) -> Result<Arc<JobSlot>> {
        self.slots
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownJob(name.to_string()))
    }
}

fn spawn_timer(slot: Arc<JobSlot>, notifier: Arc<dyn Notifier>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let next = slot.entry.lock().await.next_run;
            let Some(next) = next else {
                debug!(job = %slot.name, "no upcoming fire time, waiting for reschedule");
                slot.changed.notified().await;
                continue;
            };

            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    slot.advance(next).await;
                    dispatch(&slot, &notifier).await;
                }
                _ = slot.changed.notified() => {
                    debug!(job = %slot.name, "schedule changed, recomputing next run");
                }
            }
        }
    })
}

/// Start a run unless one is already in progress.
async fn dispatch(slot: &Arc<JobSlot>, notifier: &Arc<dyn Notifier>) -> bool {
    if slot
        .running
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        info!(job = %slot.name, "previous run still in progress, skipping");
        slot.record(JobOutcome::Skipped).await;
        return false;
    }

    let guard = RunningGuard(slot.clone());
    let notifier = notifier.clone();
    tokio::spawn(async move {
        run_once(guard, notifier).await;
    });
    true
}

async fn run_once(guard: RunningGuard, notifier: Arc<dyn Notifier>) {
    let slot = &guard.0;
    let run_id = uuid::Uuid::new_v4().as_simple().to_string();
    let started = Instant::now();
    info!(job = %slot.name, run_id = %run_id, "job started");

    // Inner task so a panicking body still ends in a recorded outcome
    let job = slot.job.clone();
    let result = match tokio::spawn(async move { job.run().await }).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(e) => Err(format!("job aborted: {e}")),
    };
    let elapsed = started.elapsed();
    metrics::histogram!("keypool_tick_duration_seconds", "job" => slot.name.clone())
        .record(elapsed.as_secs_f64());

    match result {
        Ok(message) => {
            info!(
                job = %slot.name,
                run_id = %run_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "job finished"
            );
            slot.record(JobOutcome::Succeeded).await;
            if let Some(text) = message {
                notifier.notify(&slot.name, &text).await;
            }
        }
        Err(e) => {
            error!(
                job = %slot.name,
                run_id = %run_id,
                error = %e,
                elapsed_ms = elapsed.as_millis() as u64,
                "job failed, staying scheduled"
            );
            slot.record(JobOutcome::Failed(e.clone())).await;
            notifier
                .notify(&slot.name, &format!("{} failed: {e}", slot.name))
                .await;
        }
    }
}
