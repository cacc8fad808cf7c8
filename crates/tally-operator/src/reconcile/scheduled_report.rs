//! ScheduledReport reconciler
//!
//! Keeps the scheduled runner's registry in step with the declared
//! resources and patches the Active/Disabled phase. Deletion events cancel
//! the runner fiber for the key.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use tally_common::Result;

use crate::crd::ScheduledReportPhase;
use crate::runner::ScheduledReportRunner;
use crate::store::{EventHook, ObjectKey};

use super::{Ctx, Reconciler};

pub struct ScheduledReportReconciler {
    ctx: Arc<Ctx>,
    runner: Arc<ScheduledReportRunner>,
}

impl ScheduledReportReconciler {
    pub fn new(ctx: Arc<Ctx>, runner: Arc<ScheduledReportRunner>) -> Arc<Self> {
        Arc::new(Self { ctx, runner })
    }
}

#[async_trait]
impl Reconciler for ScheduledReportReconciler {
    fn kind(&self) -> &'static str {
        "ScheduledReport"
    }

    async fn sync(&self, key: &str) -> Result<()> {
        let Some(parsed) = ObjectKey::parse(key) else {
            return Ok(());
        };
        let Some(scheduled) = self
            .ctx
            .stores
            .scheduled_reports
            .get(&parsed.namespace, &parsed.name)
        else {
            debug!(key, "scheduled report deleted, cancelling runner");
            self.runner.remove(key);
            return Ok(());
        };

        let mut status = scheduled.status.clone().unwrap_or_default();

        if self
            .ctx
            .stores
            .generation_queries
            .get(&parsed.namespace, &scheduled.spec.generation_query)
            .is_none()
        {
            self.runner.remove(key);
            status.phase = ScheduledReportPhase::Failed;
            status.message = Some(format!(
                "unknown ReportGenerationQuery {}",
                scheduled.spec.generation_query
            ));
            return self
                .ctx
                .status
                .scheduled_report(&parsed.namespace, &parsed.name, &status)
                .await;
        }

        if scheduled.spec.suspend {
            self.runner.remove(key);
            if status.phase != ScheduledReportPhase::Disabled {
                status.phase = ScheduledReportPhase::Disabled;
                status.message = None;
                return self
                    .ctx
                    .status
                    .scheduled_report(&parsed.namespace, &parsed.name, &status)
                    .await;
            }
            return Ok(());
        }

        self.runner.register(Arc::clone(&scheduled));
        if status.phase != ScheduledReportPhase::Active {
            status.phase = ScheduledReportPhase::Active;
            status.message = None;
            return self
                .ctx
                .status
                .scheduled_report(&parsed.namespace, &parsed.name, &status)
                .await;
        }
        Ok(())
    }
}

/// Store hook that cancels the runner fiber as soon as the delete event
/// arrives, without waiting for the queue to drain.
pub struct CancelRunnerOnDelete {
    runner: Arc<ScheduledReportRunner>,
}

impl CancelRunnerOnDelete {
    pub fn new(runner: Arc<ScheduledReportRunner>) -> Arc<Self> {
        Arc::new(Self { runner })
    }
}

impl EventHook for CancelRunnerOnDelete {
    fn on_change(&self, _key: &ObjectKey) {}

    fn on_delete(&self, key: &ObjectKey) {
        self.runner.remove(&key.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{SchedulePeriod, ScheduledReportStatus};
    use crate::testutil::*;
    use tokio::sync::watch;

    fn test_ctx() -> (Arc<Ctx>, Arc<ScheduledReportRunner>) {
        let stores = super::super::Stores::new();
        let status = FakeStatusWriter::new(
            Arc::clone(&stores.reports),
            Arc::clone(&stores.scheduled_reports),
            Arc::clone(&stores.data_sources),
            Arc::clone(&stores.generation_queries),
            Arc::clone(&stores.presto_tables),
        );
        let ctx = Arc::new(Ctx {
            namespace: "tally".into(),
            stores,
            hive: RecordingHive::new(),
            presto: RecordingPresto::new(),
            status,
            clock: Arc::new(tally_common::clock::FakeClock::new(ts(2019, 1, 10, 0, 0))),
            log_report: false,
        });
        let (_tx, stop) = watch::channel(false);
        let runner = ScheduledReportRunner::new(Arc::clone(&ctx), stop);
        (ctx, runner)
    }

    fn phase(ctx: &Ctx, name: &str) -> ScheduledReportPhase {
        ctx.stores
            .scheduled_reports
            .get("tally", name)
            .unwrap()
            .status
            .as_ref()
            .unwrap()
            .phase
    }

    #[tokio::test]
    async fn valid_schedule_becomes_active() {
        let (ctx, runner) = test_ctx();
        ctx.stores
            .generation_queries
            .apply(generation_query("tally", "q", "SELECT 1"));
        ctx.stores.scheduled_reports.apply(scheduled_report(
            "tally",
            "hourly",
            "q",
            SchedulePeriod::Hourly,
        ));

        let reconciler = ScheduledReportReconciler::new(Arc::clone(&ctx), runner);
        reconciler.sync("tally/hourly").await.unwrap();
        assert_eq!(phase(&ctx, "hourly"), ScheduledReportPhase::Active);
    }

    #[tokio::test]
    async fn unknown_query_fails_the_schedule() {
        let (ctx, runner) = test_ctx();
        ctx.stores.scheduled_reports.apply(scheduled_report(
            "tally",
            "hourly",
            "ghost",
            SchedulePeriod::Hourly,
        ));
        let reconciler = ScheduledReportReconciler::new(Arc::clone(&ctx), runner);
        reconciler.sync("tally/hourly").await.unwrap();
        assert_eq!(phase(&ctx, "hourly"), ScheduledReportPhase::Failed);
    }

    #[tokio::test]
    async fn suspend_disables_and_preserves_progress() {
        let (ctx, runner) = test_ctx();
        ctx.stores
            .generation_queries
            .apply(generation_query("tally", "q", "SELECT 1"));
        let mut scheduled = scheduled_report("tally", "hourly", "q", SchedulePeriod::Hourly);
        scheduled.status = Some(ScheduledReportStatus {
            phase: ScheduledReportPhase::Active,
            last_report_time: Some(ts(2019, 1, 9, 23, 0)),
            table_name: Some("scheduled_report_hourly".into()),
            message: None,
        });
        scheduled.spec.suspend = true;
        ctx.stores.scheduled_reports.apply(scheduled);

        let reconciler = ScheduledReportReconciler::new(Arc::clone(&ctx), runner);
        reconciler.sync("tally/hourly").await.unwrap();

        let status = ctx
            .stores
            .scheduled_reports
            .get("tally", "hourly")
            .unwrap()
            .status
            .clone()
            .unwrap();
        assert_eq!(status.phase, ScheduledReportPhase::Disabled);
        assert_eq!(status.last_report_time, Some(ts(2019, 1, 9, 23, 0)));
        assert_eq!(status.table_name.as_deref(), Some("scheduled_report_hourly"));
    }
}
