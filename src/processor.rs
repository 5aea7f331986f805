//! Pledge Processor - one charge attempt for one pledge
//!
//! Flow per invocation:
//! 1. Parse the pledge terms (bad rows error out before any write)
//! 2. Claim the pledge so no other run charges it concurrently
//! 3. Complete pledges whose end date has passed, refuse pledges with an
//!    unresolved PENDING charge
//! 4. Open a PENDING charge, call the gateway once (bounded by a timeout)
//! 5. Finalize charge, donation and pledge state in one transaction
//! 6. Emit events and notify the donor (best-effort)
//! 7. Release the claim

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::calendar::{next_charge_date, Frequency};
use crate::db::charges::{self, CreateChargeInput};
use crate::db::donations::{self, CreateDonationInput};
use crate::db::models::{format_timestamp, pledge_statuses, Charge, Pledge};
use crate::db::pledges::{self, SuccessUpdate};
use crate::db::{PledgeDb, TenantContext};
use crate::error::{BillingError, Result};
use crate::events::{BillingEvent, EventBus};
use crate::gateway::{GatewayResponse, PaymentGateway};
use crate::notify::{failure_message, receipt_message, Message, Notifier};
use crate::outcome::ChargeOutcome;
use crate::settings::SettingsCache;

pub const NO_PAYMENT_METHOD: &str = "No payment method configured.";
pub const GATEWAY_TIMED_OUT: &str = "Payment gateway timed out";
pub const ALREADY_PROCESSING: &str = "Pledge is already being processed";
pub const PLEDGE_ENDED: &str = "Pledge ended";

/// Processor tuning
#[derive(Debug, Clone, Copy)]
pub struct ProcessorConfig {
    /// Upper bound on a single gateway call
    pub gateway_timeout: Duration,
    /// Age after which another run's claim may be taken over
    pub claim_stale_after: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            gateway_timeout: Duration::from_secs(30),
            claim_stale_after: Duration::from_secs(900),
        }
    }
}

/// Charge orchestration for a single pledge
pub struct PledgeProcessor {
    db: Arc<PledgeDb>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
    settings: Arc<SettingsCache>,
    events: Arc<EventBus>,
    config: ProcessorConfig,
}

/// Parsed pledge terms needed to finalize a charge
#[derive(Debug, Clone, Copy)]
struct Terms {
    frequency: Frequency,
    end_date: Option<NaiveDate>,
}

/// Gateway result reduced to what finalization needs
enum Attempt {
    Approved(String),
    Failed(String),
}

impl PledgeProcessor {
    pub fn new(
        db: Arc<PledgeDb>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        settings: Arc<SettingsCache>,
        events: Arc<EventBus>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            db,
            gateway,
            notifier,
            settings,
            events,
            config,
        }
    }

    pub fn db(&self) -> &Arc<PledgeDb> {
        &self.db
    }

    pub fn settings(&self) -> &Arc<SettingsCache> {
        &self.settings
    }

    /// Process one pledge as selected by a sweep
    ///
    /// Declines and gateway errors come back as `Ok` with `success = false`.
    /// `Err` means the pledge could not be processed at all (bad stored data,
    /// storage failure); the caller reports it in that pledge's outcome.
    pub async fn process(&self, pledge: &Pledge, now: DateTime<Utc>) -> Result<ChargeOutcome> {
        let ctx = TenantContext::new(&pledge.tenant_id);
        let terms = Terms {
            frequency: pledge.frequency()?,
            end_date: pledge.end_date()?,
        };
        pledge.next_charge_at()?;
        let settings = self.settings.get(&self.db, &ctx)?;

        let claim_token = Uuid::new_v4().to_string();
        if !self.claim(&ctx, pledge, &claim_token)? {
            return self.skipped_unclaimed(&ctx, pledge);
        }

        let result = self
            .charge_claimed(&ctx, pledge, terms, settings.max_failures_before_pause, now)
            .await;

        if let Err(e) = self
            .db
            .with_conn(|conn| pledges::release_claim(conn, &ctx, &pledge.id, &claim_token))
        {
            warn!(pledge_id = %pledge.id, error = %e, "Failed to release pledge claim");
        }

        result
    }

    /// Claim age is wall-clock time, not the sweep's billing `now`, which
    /// may lag far behind in a long batch
    fn claim(&self, ctx: &TenantContext, pledge: &Pledge, token: &str) -> Result<bool> {
        let stale_after = chrono::Duration::from_std(self.config.claim_stale_after)
            .map_err(|e| BillingError::Config(format!("Invalid claim_stale_after: {}", e)))?;
        let claimed_at = Utc::now();
        let now_str = format_timestamp(claimed_at);
        let stale_before = format_timestamp(claimed_at - stale_after);

        self.db.with_conn(|conn| {
            pledges::claim_pledge(
                conn,
                ctx,
                &pledge.id,
                &pledge.updated_at,
                token,
                &now_str,
                &stale_before,
            )
        })
    }

    /// Claim refused: either another run holds it or the row moved on since selection
    fn skipped_unclaimed(&self, ctx: &TenantContext, pledge: &Pledge) -> Result<ChargeOutcome> {
        let current = self
            .db
            .with_conn(|conn| pledges::get_pledge(conn, ctx, &pledge.id))?
            .ok_or_else(|| BillingError::NotFound(format!("Pledge {}", pledge.id)))?;

        let reason = if current.status != pledge_statuses::ACTIVE {
            format!("Pledge is no longer active ({})", current.status)
        } else {
            ALREADY_PROCESSING.to_string()
        };

        debug!(pledge_id = %pledge.id, %reason, "Skipping pledge");
        self.events.emit(BillingEvent::PledgeSkipped {
            tenant_id: ctx.tenant_id.clone(),
            pledge_id: pledge.id.clone(),
            reason: reason.clone(),
        });
        Ok(ChargeOutcome::failed(&pledge.id, reason))
    }

    async fn charge_claimed(
        &self,
        ctx: &TenantContext,
        pledge: &Pledge,
        terms: Terms,
        max_failures: u32,
        now: DateTime<Utc>,
    ) -> Result<ChargeOutcome> {
        let now_str = format_timestamp(now);

        if let Some(end_date) = terms.end_date {
            if end_date <= now.date_naive() {
                self.db
                    .with_conn(|conn| pledges::mark_completed(conn, ctx, &pledge.id, &now_str))?;
                info!(pledge_id = %pledge.id, %end_date, "Pledge ended before charge, marked completed");
                self.events.emit(BillingEvent::PledgeCompleted {
                    tenant_id: ctx.tenant_id.clone(),
                    pledge_id: pledge.id.clone(),
                });
                return Ok(ChargeOutcome::failed(&pledge.id, PLEDGE_ENDED));
            }
        }

        if let Some(pending) = self
            .db
            .with_conn(|conn| charges::find_pending_charge(conn, ctx, &pledge.id))?
        {
            let reason = format!(
                "Unresolved pending charge {} must be reconciled before retrying",
                pending.id
            );
            warn!(pledge_id = %pledge.id, charge_id = %pending.id, "Refusing to charge over a pending charge");
            self.events.emit(BillingEvent::PledgeSkipped {
                tenant_id: ctx.tenant_id.clone(),
                pledge_id: pledge.id.clone(),
                reason: reason.clone(),
            });
            return Ok(ChargeOutcome::failed(&pledge.id, reason));
        }

        let charge = self.db.with_conn(|conn| {
            charges::create_pending_charge(
                conn,
                ctx,
                CreateChargeInput {
                    pledge_id: &pledge.id,
                    amount_cents: pledge.amount_cents,
                    currency: &pledge.currency,
                    cycle_start: &pledge.next_charge_at,
                    created_at: &now_str,
                },
            )
        })?;
        debug!(pledge_id = %pledge.id, charge_id = %charge.id, "Opened pending charge");

        match self.attempt(pledge, &charge).await {
            Attempt::Approved(transaction_id) => {
                self.finalize_success(ctx, pledge, terms, &charge, &transaction_id, now)
                    .await
            }
            Attempt::Failed(reason) => {
                self.finalize_failure(ctx, pledge, &charge, &reason, max_failures, now)
                    .await
            }
        }
    }

    async fn attempt(&self, pledge: &Pledge, charge: &Charge) -> Attempt {
        let Some(token) = pledge.payment_method_token.as_deref() else {
            return Attempt::Failed(NO_PAYMENT_METHOD.to_string());
        };

        let call = self
            .gateway
            .attempt(token, charge.amount_cents, &charge.currency);

        match tokio::time::timeout(self.config.gateway_timeout, call).await {
            Ok(Ok(GatewayResponse::Approved { transaction_id })) => Attempt::Approved(transaction_id),
            Ok(Ok(GatewayResponse::Declined { reason })) => Attempt::Failed(reason),
            Ok(Err(e)) => {
                warn!(pledge_id = %pledge.id, charge_id = %charge.id, error = %e, "Gateway call failed");
                Attempt::Failed(e.to_string())
            }
            Err(_) => {
                warn!(
                    pledge_id = %pledge.id,
                    charge_id = %charge.id,
                    timeout_secs = self.config.gateway_timeout.as_secs_f64(),
                    "Gateway call timed out"
                );
                Attempt::Failed(GATEWAY_TIMED_OUT.to_string())
            }
        }
    }

    async fn finalize_success(
        &self,
        ctx: &TenantContext,
        pledge: &Pledge,
        terms: Terms,
        charge: &Charge,
        transaction_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ChargeOutcome> {
        let now_str = format_timestamp(now);
        let candidate = next_charge_date(now, terms.frequency);
        let completed = terms
            .end_date
            .is_some_and(|end_date| candidate.date_naive() >= end_date);
        let next_charge_at = if completed {
            pledge.next_charge_at.clone()
        } else {
            format_timestamp(candidate)
        };
        let status = if completed {
            pledge_statuses::COMPLETED
        } else {
            pledge_statuses::ACTIVE
        };

        let (charge, _updated) = self
            .db
            .transaction(|conn| {
                let charge = charges::mark_succeeded(conn, ctx, &charge.id, transaction_id, &now_str)?;
                donations::record_donation(
                    conn,
                    ctx,
                    CreateDonationInput {
                        pledge,
                        charge_id: &charge.id,
                        amount_cents: charge.amount_cents,
                        currency: &charge.currency,
                        created_at: &now_str,
                    },
                )?;
                let updated = pledges::record_success(
                    conn,
                    ctx,
                    &pledge.id,
                    &SuccessUpdate {
                        charged_at: &now_str,
                        next_charge_at: &next_charge_at,
                        status,
                        amount_cents: charge.amount_cents,
                    },
                )?;
                Ok((charge, updated))
            })
            .map_err(|e| {
                error!(
                    pledge_id = %pledge.id,
                    charge_id = %charge.id,
                    %transaction_id,
                    error = %e,
                    "Approved charge could not be recorded, left pending for reconciliation"
                );
                e
            })?;

        info!(
            tenant_id = %ctx.tenant_id,
            pledge_id = %pledge.id,
            charge_id = %charge.id,
            %transaction_id,
            amount_cents = charge.amount_cents,
            %next_charge_at,
            completed,
            "Pledge charged"
        );

        self.events.emit(BillingEvent::ChargeSucceeded {
            tenant_id: ctx.tenant_id.clone(),
            pledge_id: pledge.id.clone(),
            charge_id: charge.id.clone(),
            transaction_id: transaction_id.to_string(),
            amount_cents: charge.amount_cents,
            currency: charge.currency.clone(),
        });
        if completed {
            self.events.emit(BillingEvent::PledgeCompleted {
                tenant_id: ctx.tenant_id.clone(),
                pledge_id: pledge.id.clone(),
            });
        }

        self.notify(pledge, receipt_message(pledge, &charge)).await;
        Ok(ChargeOutcome::succeeded(&pledge.id, transaction_id))
    }

    async fn finalize_failure(
        &self,
        ctx: &TenantContext,
        pledge: &Pledge,
        charge: &Charge,
        reason: &str,
        max_failures: u32,
        now: DateTime<Utc>,
    ) -> Result<ChargeOutcome> {
        let now_str = format_timestamp(now);

        let updated = self.db.transaction(|conn| {
            charges::mark_failed(conn, ctx, &charge.id, reason, &now_str)?;
            pledges::record_failure(conn, ctx, &pledge.id, &now_str, reason, max_failures)
        })?;
        let paused = updated.status == pledge_statuses::FAILED;

        warn!(
            tenant_id = %ctx.tenant_id,
            pledge_id = %pledge.id,
            charge_id = %charge.id,
            %reason,
            failure_count = updated.failure_count,
            paused,
            "Pledge charge failed"
        );

        self.events.emit(BillingEvent::ChargeFailed {
            tenant_id: ctx.tenant_id.clone(),
            pledge_id: pledge.id.clone(),
            charge_id: charge.id.clone(),
            reason: reason.to_string(),
            failure_count: updated.failure_count,
        });
        if paused {
            self.events.emit(BillingEvent::PledgePaused {
                tenant_id: ctx.tenant_id.clone(),
                pledge_id: pledge.id.clone(),
                failure_count: updated.failure_count,
            });
        }

        self.notify(pledge, failure_message(pledge, reason, paused)).await;
        Ok(ChargeOutcome::failed(&pledge.id, reason))
    }

    /// Best-effort donor message; errors are logged only
    async fn notify(&self, pledge: &Pledge, message: Message) {
        let Some(recipient) = pledge.donor_email.as_deref() else {
            debug!(pledge_id = %pledge.id, "No donor email, skipping notification");
            return;
        };

        if let Err(e) = self
            .notifier
            .send(recipient, &message.subject, &message.text_body, &message.html_body)
            .await
        {
            warn!(pledge_id = %pledge.id, error = %e, "Failed to send donor notification");
        }
    }
}
