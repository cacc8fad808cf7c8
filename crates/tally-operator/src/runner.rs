//! Scheduled report runner
//!
//! One dispatch fiber consumes register/remove commands from the
//! ScheduledReport reconciler; each registered report gets its own fiber
//! that advances the reporting window through wall-clock time. A fiber
//! processes its windows strictly serially, so overlapping windows for the
//! same report cannot run concurrently, and `lastReportTime` only ever
//! moves forward and never past the current wall clock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use tally_common::clock::jitter;
use tally_common::Result;

use crate::crd::{
    Schedule, SchedulePeriod, ScheduledReport, ScheduledReportPhase, ScheduledReportStatus,
};
use crate::naming::scheduled_report_table_name;
use crate::reconcile::report::run_report_window;
use crate::reconcile::Ctx;
use crate::store::ObjectKey;

/// Backoff for a failed window, doubling per attempt.
const WINDOW_BACKOFF: Duration = Duration::from_secs(15);

/// Backoff ceiling for a failed window.
const MAX_WINDOW_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// Attempts per window before the schedule is marked Failed.
const MAX_WINDOW_ATTEMPTS: u32 = 10;

/// Upper bound on the jitter added after a window closes.
const WINDOW_JITTER: Duration = Duration::from_secs(60);

enum Command {
    Register(Arc<ScheduledReport>),
    Remove(String),
}

struct Job {
    spec: crate::crd::ScheduledReportSpec,
    cancel: watch::Sender<bool>,
}

pub struct ScheduledReportRunner {
    ctx: Arc<Ctx>,
    stop: watch::Receiver<bool>,
    tx: mpsc::UnboundedSender<Command>,
    rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
}

impl ScheduledReportRunner {
    pub fn new(ctx: Arc<Ctx>, stop: watch::Receiver<bool>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            ctx,
            stop,
            tx,
            rx: parking_lot::Mutex::new(Some(rx)),
        })
    }

    /// Register or update a scheduled report; an unchanged spec keeps its
    /// running fiber.
    pub fn register(&self, scheduled: Arc<ScheduledReport>) {
        let _ = self.tx.send(Command::Register(scheduled));
    }

    /// Cancel the fiber for a key.
    pub fn remove(&self, key: &str) {
        let _ = self.tx.send(Command::Remove(key.to_string()));
    }

    /// Dispatch loop. Runs until the stop signal fires, then cancels every
    /// fiber.
    pub async fn run(self: Arc<Self>) {
        let Some(mut rx) = self.rx.lock().take() else {
            return;
        };
        let mut stop = self.stop.clone();
        let mut jobs: HashMap<String, Job> = HashMap::new();
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                command = rx.recv() => match command {
                    Some(Command::Register(scheduled)) => self.upsert(&mut jobs, scheduled),
                    Some(Command::Remove(key)) => {
                        if let Some(job) = jobs.remove(&key) {
                            debug!(%key, "cancelling scheduled report fiber");
                            let _ = job.cancel.send(true);
                        }
                    }
                    None => break,
                },
            }
        }
        for (_, job) in jobs.drain() {
            let _ = job.cancel.send(true);
        }
    }

    fn upsert(&self, jobs: &mut HashMap<String, Job>, scheduled: Arc<ScheduledReport>) {
        let Some(namespace) = kube::ResourceExt::namespace(scheduled.as_ref()) else {
            return;
        };
        let key = format!(
            "{namespace}/{}",
            kube::ResourceExt::name_any(scheduled.as_ref())
        );
        if let Some(existing) = jobs.get(&key) {
            if existing.spec == scheduled.spec {
                return;
            }
            let _ = existing.cancel.send(true);
        }
        info!(%key, "starting scheduled report fiber");
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let ctx = Arc::clone(&self.ctx);
        let stop = self.stop.clone();
        let object_key = ObjectKey::new(namespace, kube::ResourceExt::name_any(scheduled.as_ref()));
        tokio::spawn(run_fiber(ctx, object_key, stop, cancel_rx));
        jobs.insert(
            key,
            Job {
                spec: scheduled.spec.clone(),
                cancel: cancel_tx,
            },
        );
    }
}

/// Outcome of one scheduling step.
#[derive(Debug, PartialEq)]
pub(crate) enum StepOutcome {
    /// A window was materialized; its end becomes the new watermark.
    Materialized(DateTime<Utc>),
    /// The next window has not closed yet.
    SleepUntil(DateTime<Utc>),
}

/// Advance one step: materialize the next closed window, or report how
/// long to sleep. `local_last` carries the watermark across steps so a
/// lagging cache cannot replay a window.
pub(crate) async fn step(
    ctx: &Ctx,
    key: &ObjectKey,
    scheduled: &ScheduledReport,
    local_last: Option<DateTime<Utc>>,
) -> Result<StepOutcome> {
    let status = scheduled.status.clone().unwrap_or_default();
    let last = match (status.last_report_time, local_last) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    let now = ctx.clock.now();
    let (start, end) = next_window(
        &scheduled.spec.schedule,
        scheduled.spec.reporting_start,
        last,
        now,
    );
    if end > now {
        return Ok(StepOutcome::SleepUntil(end));
    }

    let query = ctx
        .stores
        .generation_queries
        .get(&key.namespace, &scheduled.spec.generation_query)
        .ok_or_else(|| {
            tally_common::Error::DependencyNotReady(format!(
                "ReportGenerationQuery {} does not exist",
                scheduled.spec.generation_query
            ))
        })?;
    let table = scheduled_report_table_name(&key.name);
    let create_table = status.table_name.is_none() && local_last.is_none();
    debug!(%key, %start, %end, "materializing scheduled report window");
    run_report_window(
        ctx,
        &key.namespace,
        &query,
        &table,
        start,
        end,
        &scheduled.spec.inputs,
        create_table,
    )
    .await?;

    ctx.status
        .scheduled_report(
            &key.namespace,
            &key.name,
            &ScheduledReportStatus {
                phase: ScheduledReportPhase::Active,
                last_report_time: Some(end),
                table_name: Some(table),
                message: status.message,
            },
        )
        .await?;
    Ok(StepOutcome::Materialized(end))
}

async fn run_fiber(
    ctx: Arc<Ctx>,
    key: ObjectKey,
    mut stop: watch::Receiver<bool>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut local_last: Option<DateTime<Utc>> = None;
    let mut attempts = 0u32;
    let mut backoff = WINDOW_BACKOFF;
    loop {
        if *stop.borrow() || *cancel.borrow() {
            return;
        }
        let Some(scheduled) = ctx.stores.scheduled_reports.get(&key.namespace, &key.name) else {
            debug!(%key, "scheduled report gone, fiber exiting");
            return;
        };
        if scheduled.spec.suspend {
            return;
        }
        match step(&ctx, &key, &scheduled, local_last).await {
            Ok(StepOutcome::Materialized(end)) => {
                local_last = Some(end);
                attempts = 0;
                backoff = WINDOW_BACKOFF;
            }
            Ok(StepOutcome::SleepUntil(end)) => {
                let now = ctx.clock.now();
                let wait = (end - now).to_std().unwrap_or_default() + jitter(WINDOW_JITTER);
                debug!(%key, until = %end, "next window still open, sleeping");
                tokio::select! {
                    _ = ctx.clock.sleep(wait) => {}
                    _ = stop.changed() => return,
                    _ = cancel.changed() => return,
                }
            }
            Err(err) if err.is_terminal() => {
                warn!(%key, error = %err, "scheduled report failed terminally");
                mark_failed(&ctx, &key, &err).await;
                return;
            }
            Err(err) => {
                attempts += 1;
                if attempts >= MAX_WINDOW_ATTEMPTS {
                    warn!(%key, error = %err, "scheduled report exceeded its retry budget");
                    mark_failed(&ctx, &key, &err).await;
                    return;
                }
                warn!(%key, error = %err, attempts, "scheduled report window failed, backing off");
                tokio::select! {
                    _ = ctx.clock.sleep(backoff) => {}
                    _ = stop.changed() => return,
                    _ = cancel.changed() => return,
                }
                backoff = (backoff * 2).min(MAX_WINDOW_BACKOFF);
            }
        }
    }
}

async fn mark_failed(ctx: &Ctx, key: &ObjectKey, err: &tally_common::Error) {
    let mut status = ctx
        .stores
        .scheduled_reports
        .get(&key.namespace, &key.name)
        .and_then(|s| s.status.clone())
        .unwrap_or_default();
    status.phase = ScheduledReportPhase::Failed;
    status.message = Some(err.to_string());
    if let Err(patch_err) = ctx
        .status
        .scheduled_report(&key.namespace, &key.name, &status)
        .await
    {
        warn!(%key, error = %patch_err, "failed to record Failed phase");
    }
}

/// Compute the next reporting window after `last` (or `reporting_start`,
/// whichever is later). The end is the first period boundary strictly
/// after the start, shifted by the schedule's phase.
pub fn next_window(
    schedule: &Schedule,
    reporting_start: Option<DateTime<Utc>>,
    last: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let phase = chrono::Duration::seconds(schedule.phase_seconds as i64);
    let start = match (reporting_start, last) {
        (Some(a), Some(b)) => a.max(b),
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => truncate(schedule.period, now - phase) + phase,
    };
    let end = advance(schedule.period, truncate(schedule.period, start - phase)) + phase;
    (start, end)
}

fn truncate(period: SchedulePeriod, t: DateTime<Utc>) -> DateTime<Utc> {
    let day = Utc
        .with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0)
        .single()
        .unwrap_or(t);
    match period {
        SchedulePeriod::Hourly => day + chrono::Duration::hours(t.hour() as i64),
        SchedulePeriod::Daily => day,
        SchedulePeriod::Weekly => {
            day - chrono::Duration::days(t.weekday().num_days_from_monday() as i64)
        }
        SchedulePeriod::Monthly => Utc
            .with_ymd_and_hms(t.year(), t.month(), 1, 0, 0, 0)
            .single()
            .unwrap_or(day),
    }
}

fn advance(period: SchedulePeriod, t: DateTime<Utc>) -> DateTime<Utc> {
    match period {
        SchedulePeriod::Hourly => t + chrono::Duration::hours(1),
        SchedulePeriod::Daily => t + chrono::Duration::days(1),
        SchedulePeriod::Weekly => t + chrono::Duration::days(7),
        SchedulePeriod::Monthly => {
            let (year, month) = if t.month() == 12 {
                (t.year() + 1, 1)
            } else {
                (t.year(), t.month() + 1)
            };
            Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
                .single()
                .unwrap_or(t)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::SchedulePeriod;
    use crate::reconcile::Stores;
    use crate::testutil::*;
    use tally_common::clock::FakeClock;

    fn hourly() -> Schedule {
        Schedule {
            period: SchedulePeriod::Hourly,
            phase_seconds: 0,
        }
    }

    #[test]
    fn window_aligns_to_the_next_boundary() {
        let (start, end) = next_window(
            &hourly(),
            Some(ts(2019, 1, 1, 10, 30)),
            None,
            ts(2019, 1, 1, 12, 0),
        );
        assert_eq!(start, ts(2019, 1, 1, 10, 30));
        assert_eq!(end, ts(2019, 1, 1, 11, 0));
    }

    #[test]
    fn window_on_a_boundary_spans_a_full_period() {
        let (start, end) = next_window(
            &hourly(),
            None,
            Some(ts(2019, 1, 1, 10, 0)),
            ts(2019, 1, 1, 12, 0),
        );
        assert_eq!(start, ts(2019, 1, 1, 10, 0));
        assert_eq!(end, ts(2019, 1, 1, 11, 0));
    }

    #[test]
    fn last_report_time_wins_over_older_reporting_start() {
        let (start, _) = next_window(
            &hourly(),
            Some(ts(2019, 1, 1, 0, 0)),
            Some(ts(2019, 1, 1, 9, 0)),
            ts(2019, 1, 1, 12, 0),
        );
        assert_eq!(start, ts(2019, 1, 1, 9, 0));
    }

    #[test]
    fn monthly_windows_handle_year_wrap() {
        let schedule = Schedule {
            period: SchedulePeriod::Monthly,
            phase_seconds: 0,
        };
        let (start, end) = next_window(
            &schedule,
            None,
            Some(ts(2018, 12, 1, 0, 0)),
            ts(2019, 1, 15, 0, 0),
        );
        assert_eq!(start, ts(2018, 12, 1, 0, 0));
        assert_eq!(end, ts(2019, 1, 1, 0, 0));
    }

    #[test]
    fn phase_shifts_the_boundary() {
        let schedule = Schedule {
            period: SchedulePeriod::Daily,
            phase_seconds: 3600,
        };
        let (start, end) = next_window(
            &schedule,
            Some(ts(2019, 1, 1, 12, 0)),
            None,
            ts(2019, 1, 2, 12, 0),
        );
        assert_eq!(start, ts(2019, 1, 1, 12, 0));
        assert_eq!(end, ts(2019, 1, 2, 1, 0));
    }

    #[test]
    fn first_window_without_history_covers_the_current_period() {
        let (start, end) = next_window(&hourly(), None, None, ts(2019, 1, 1, 10, 42));
        assert_eq!(start, ts(2019, 1, 1, 10, 0));
        assert_eq!(end, ts(2019, 1, 1, 11, 0));
    }

    fn step_ctx(clock: Arc<FakeClock>) -> Arc<Ctx> {
        let stores = Stores::new();
        let status = FakeStatusWriter::new(
            Arc::clone(&stores.reports),
            Arc::clone(&stores.scheduled_reports),
            Arc::clone(&stores.data_sources),
            Arc::clone(&stores.generation_queries),
            Arc::clone(&stores.presto_tables),
        );
        Arc::new(Ctx {
            namespace: "tally".into(),
            stores,
            hive: RecordingHive::new(),
            presto: RecordingPresto::new(),
            status,
            clock,
            log_report: false,
        })
    }

    #[tokio::test]
    async fn catch_up_materializes_back_to_back_then_sleeps() {
        // Hourly schedule created three hours late: three windows close
        // back-to-back before the fiber would sleep.
        let now = ts(2019, 1, 1, 12, 0);
        let clock = Arc::new(FakeClock::new(now));
        let ctx = step_ctx(clock);
        ctx.stores
            .generation_queries
            .apply(generation_query("tally", "q", "SELECT 1"));
        let mut scheduled = scheduled_report("tally", "catchup", "q", SchedulePeriod::Hourly);
        scheduled.spec.reporting_start = Some(ts(2019, 1, 1, 9, 0));
        ctx.stores.scheduled_reports.apply(scheduled);

        let key = ObjectKey::new("tally", "catchup");
        let mut local_last = None;
        let mut ends = Vec::new();
        loop {
            let scheduled = ctx.stores.scheduled_reports.get("tally", "catchup").unwrap();
            match step(&ctx, &key, &scheduled, local_last).await.unwrap() {
                StepOutcome::Materialized(end) => {
                    local_last = Some(end);
                    ends.push(end);
                }
                StepOutcome::SleepUntil(until) => {
                    assert_eq!(until, ts(2019, 1, 1, 13, 0));
                    break;
                }
            }
        }
        assert_eq!(
            ends,
            vec![
                ts(2019, 1, 1, 10, 0),
                ts(2019, 1, 1, 11, 0),
                ts(2019, 1, 1, 12, 0)
            ]
        );
        let status = ctx
            .stores
            .scheduled_reports
            .get("tally", "catchup")
            .unwrap()
            .status
            .clone()
            .unwrap();
        assert_eq!(status.last_report_time, Some(now));
        assert!(status.last_report_time.unwrap() <= ctx.clock.now());
    }

    #[tokio::test]
    async fn future_start_sleeps_without_any_traffic() {
        let now = ts(2019, 1, 1, 12, 0);
        let clock = Arc::new(FakeClock::new(now));
        let ctx = step_ctx(clock);
        ctx.stores
            .generation_queries
            .apply(generation_query("tally", "q", "SELECT 1"));
        let mut scheduled = scheduled_report("tally", "future", "q", SchedulePeriod::Hourly);
        scheduled.spec.reporting_start = Some(ts(2019, 1, 2, 0, 0));
        ctx.stores.scheduled_reports.apply(scheduled.clone());

        let key = ObjectKey::new("tally", "future");
        let outcome = step(&ctx, &key, &scheduled, None).await.unwrap();
        assert_eq!(outcome, StepOutcome::SleepUntil(ts(2019, 1, 2, 1, 0)));
    }

    #[tokio::test]
    async fn output_table_is_created_once_across_windows() {
        let now = ts(2019, 1, 1, 12, 0);
        let clock = Arc::new(FakeClock::new(now));
        let ctx = step_ctx(clock);
        let hive = RecordingHive::new();
        let ctx = Arc::new(Ctx {
            namespace: ctx.namespace.clone(),
            stores: ctx.stores.clone(),
            hive: hive.clone(),
            presto: Arc::clone(&ctx.presto),
            status: Arc::clone(&ctx.status),
            clock: Arc::clone(&ctx.clock),
            log_report: false,
        });
        ctx.stores
            .generation_queries
            .apply(generation_query("tally", "q", "SELECT 1"));
        let mut scheduled = scheduled_report("tally", "s", "q", SchedulePeriod::Hourly);
        scheduled.spec.reporting_start = Some(ts(2019, 1, 1, 10, 0));
        ctx.stores.scheduled_reports.apply(scheduled);

        let key = ObjectKey::new("tally", "s");
        let mut local_last = None;
        for _ in 0..2 {
            let scheduled = ctx.stores.scheduled_reports.get("tally", "s").unwrap();
            match step(&ctx, &key, &scheduled, local_last).await.unwrap() {
                StepOutcome::Materialized(end) => local_last = Some(end),
                StepOutcome::SleepUntil(_) => break,
            }
        }
        let ddl = hive.queries();
        let creates = ddl
            .iter()
            .filter(|q| q.contains("CREATE EXTERNAL TABLE"))
            .count();
        assert_eq!(creates, 1, "table created exactly once, got: {ddl:?}");
    }
}
