//! Due-pledge scheduler and retry sweep
//!
//! Both sweeps select candidate pledges, push each through the
//! [`PledgeProcessor`] and collect one [`ChargeOutcome`] per candidate. A
//! pledge that errors or panics becomes a failed outcome; only failing to
//! read the candidate list aborts a sweep.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::db::models::{format_timestamp, Pledge};
use crate::db::{pledges, PledgeDb, TenantContext};
use crate::error::Result;
use crate::outcome::{BatchSummary, ChargeOutcome};
use crate::processor::PledgeProcessor;

/// Combined result of one due sweep followed by one retry sweep
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub due: Vec<ChargeOutcome>,
    pub retried: Vec<ChargeOutcome>,
}

impl SweepReport {
    pub fn summary(&self) -> BatchSummary {
        let due = BatchSummary::from_outcomes(&self.due);
        let retried = BatchSummary::from_outcomes(&self.retried);
        BatchSummary {
            processed: due.processed + retried.processed,
            succeeded: due.succeeded + retried.succeeded,
            failed: due.failed + retried.failed,
        }
    }
}

pub struct PledgeScheduler {
    processor: Arc<PledgeProcessor>,
    worker_count: usize,
}

impl PledgeScheduler {
    /// `worker_count` bounds how many pledges are in flight at once (min 1)
    pub fn new(processor: Arc<PledgeProcessor>, worker_count: usize) -> Self {
        Self {
            processor,
            worker_count: worker_count.max(1),
        }
    }

    fn db(&self) -> &PledgeDb {
        self.processor.db()
    }

    /// Charge every ACTIVE pledge whose `next_charge_at` has arrived
    pub async fn process_due_pledges(&self, tenant_id: Option<&str>) -> Result<Vec<ChargeOutcome>> {
        self.process_due_pledges_at(tenant_id, Utc::now()).await
    }

    pub async fn process_due_pledges_at(
        &self,
        tenant_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ChargeOutcome>> {
        let tenant = tenant_id.map(TenantContext::new);
        let now_str = format_timestamp(now);

        let due = self
            .db()
            .with_conn(|conn| pledges::list_due_pledges(conn, tenant.as_ref(), &now_str))?;
        info!(tenant_id = ?tenant_id, count = due.len(), "Processing due pledges");

        let outcomes = self.run_batch(due, now).await;
        let summary = BatchSummary::from_outcomes(&outcomes);
        info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Due pledge sweep complete"
        );
        Ok(outcomes)
    }

    /// Re-attempt failing ACTIVE pledges whose tenant retry cooldown has elapsed
    pub async fn retry_failed_pledges(&self, tenant_id: Option<&str>) -> Result<Vec<ChargeOutcome>> {
        self.retry_failed_pledges_at(tenant_id, Utc::now()).await
    }

    pub async fn retry_failed_pledges_at(
        &self,
        tenant_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ChargeOutcome>> {
        let tenant = tenant_id.map(TenantContext::new);

        let candidates = self
            .db()
            .with_conn(|conn| pledges::list_retry_candidates(conn, tenant.as_ref()))?;

        let eligible: Vec<Pledge> = candidates
            .into_iter()
            .filter(|pledge| self.cooldown_elapsed(pledge, now))
            .collect();
        info!(tenant_id = ?tenant_id, count = eligible.len(), "Retrying failed pledges");

        let outcomes = self.run_batch(eligible, now).await;
        let summary = BatchSummary::from_outcomes(&outcomes);
        info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Retry sweep complete"
        );
        Ok(outcomes)
    }

    /// `last_failed_at <= now - retry_interval` for the pledge's tenant
    ///
    /// A tenant whose settings cannot be read keeps the pledge; the processor
    /// hits the same error before charging and reports it in the outcome.
    fn cooldown_elapsed(&self, pledge: &Pledge, now: DateTime<Utc>) -> bool {
        let Some(last_failed_at) = pledge.last_failed_at.as_deref() else {
            return false;
        };

        let ctx = TenantContext::new(&pledge.tenant_id);
        match self.processor.settings().get(self.db(), &ctx) {
            Ok(settings) => {
                let cutoff = format_timestamp(now - settings.retry_interval());
                last_failed_at <= cutoff.as_str()
            }
            Err(e) => {
                warn!(pledge_id = %pledge.id, error = %e, "Tenant settings unavailable for retry check");
                true
            }
        }
    }

    /// Process a batch, preserving input order in the outcomes
    async fn run_batch(&self, pledges: Vec<Pledge>, now: DateTime<Utc>) -> Vec<ChargeOutcome> {
        stream::iter(pledges)
            .map(|pledge| {
                let processor = Arc::clone(&self.processor);
                async move {
                    let result = AssertUnwindSafe(processor.process(&pledge, now))
                        .catch_unwind()
                        .await;
                    match result {
                        Ok(Ok(outcome)) => outcome,
                        Ok(Err(e)) => {
                            error!(pledge_id = %pledge.id, error = %e, "Pledge processing failed");
                            ChargeOutcome::failed(&pledge.id, e.to_string())
                        }
                        Err(_) => {
                            error!(pledge_id = %pledge.id, "Pledge processing panicked");
                            ChargeOutcome::failed(&pledge.id, "Internal error while processing pledge")
                        }
                    }
                }
            })
            .buffered(self.worker_count)
            .collect()
            .await
    }

    /// Due sweep followed by retry sweep
    pub async fn run_once(&self, tenant_id: Option<&str>) -> Result<SweepReport> {
        let due = self.process_due_pledges(tenant_id).await?;
        let retried = self.retry_failed_pledges(tenant_id).await?;
        Ok(SweepReport { due, retried })
    }

    /// Sweep every `interval` until `shutdown` fires
    ///
    /// A sweep that cannot read its candidates is logged and retried on the
    /// next tick.
    pub async fn run(
        &self,
        tenant_id: Option<String>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "Pledge scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once(tenant_id.as_deref()).await {
                        Ok(report) => {
                            let summary = report.summary();
                            debug!(processed = summary.processed, "Sweep finished");
                        }
                        Err(e) => error!(error = %e, "Pledge sweep failed"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("Pledge scheduler shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::Frequency;
    use crate::db::pledges::CreatePledgeInput;
    use crate::events::EventBus;
    use crate::gateway::MockGateway;
    use crate::notify::RecordingNotifier;
    use crate::processor::ProcessorConfig;
    use crate::settings::{SettingsCache, TenantPledgeSettings};
    use chrono::{NaiveDate, TimeZone};

    fn scheduler(gateway: Arc<MockGateway>, worker_count: usize) -> (Arc<PledgeDb>, PledgeScheduler) {
        let db = Arc::new(PledgeDb::open_in_memory().unwrap());
        let processor = PledgeProcessor::new(
            db.clone(),
            gateway,
            Arc::new(RecordingNotifier::new()),
            Arc::new(SettingsCache::new(Duration::from_secs(60), TenantPledgeSettings::default())),
            Arc::new(EventBus::new()),
            ProcessorConfig::default(),
        );
        (db, PledgeScheduler::new(Arc::new(processor), worker_count))
    }

    fn create(db: &PledgeDb, tenant: &str, id: &str, next: DateTime<Utc>) {
        let ctx = TenantContext::new(tenant);
        db.with_conn(|conn| {
            pledges::create_pledge(
                conn,
                &ctx,
                CreatePledgeInput {
                    id: Some(id.to_string()),
                    donor_id: "donor-1".to_string(),
                    donor_name: None,
                    donor_email: None,
                    fund_id: "general".to_string(),
                    amount_cents: 1000,
                    currency: "USD".to_string(),
                    frequency: Frequency::Monthly,
                    start_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
                    end_date: None,
                    next_charge_at: Some(next),
                    payment_method_token: Some("tok_visa".to_string()),
                    payment_method_last4: None,
                    payment_method_brand: None,
                    is_anonymous: false,
                    dedication_note: None,
                },
            )
        })
        .unwrap();
    }

    #[tokio::test]
    async fn test_due_sweep_scopes_tenant_and_skips_future() {
        let (db, scheduler) = scheduler(Arc::new(MockGateway::new()), 1);
        let now = Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap();
        create(&db, "chapel", "due", now - chrono::Duration::days(1));
        create(&db, "chapel", "future", now + chrono::Duration::days(1));
        create(&db, "abbey", "other-tenant", now - chrono::Duration::days(1));

        let outcomes = scheduler.process_due_pledges_at(Some("chapel"), now).await.unwrap();
        let ids: Vec<&str> = outcomes.iter().map(|o| o.pledge_id.as_str()).collect();
        assert_eq!(ids, vec!["due"]);
        assert!(outcomes[0].success);

        // Charged pledge is no longer due
        let again = scheduler.process_due_pledges_at(Some("chapel"), now).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_workers_keep_input_order() {
        let (db, scheduler) = scheduler(Arc::new(MockGateway::new()), 4);
        let now = Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap();
        for i in 0..6 {
            create(&db, "chapel", &format!("p-{}", i), now - chrono::Duration::hours(10 - i));
        }

        let outcomes = scheduler.process_due_pledges_at(None, now).await.unwrap();
        let ids: Vec<String> = outcomes.iter().map(|o| o.pledge_id.clone()).collect();
        assert_eq!(ids, (0..6).map(|i| format!("p-{}", i)).collect::<Vec<_>>());
        assert!(outcomes.iter().all(|o| o.success));
    }

    #[test]
    fn test_sweep_report_summary() {
        let report = SweepReport {
            due: vec![ChargeOutcome::succeeded("a", "t"), ChargeOutcome::failed("b", "x")],
            retried: vec![ChargeOutcome::failed("c", "x")],
        };
        assert_eq!(
            report.summary(),
            BatchSummary { processed: 3, succeeded: 1, failed: 2 }
        );
    }
}
