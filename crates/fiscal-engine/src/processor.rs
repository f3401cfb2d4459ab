//! # Invoice Processor
//!
//! Drives one attempt through a pass of the authorization flow.
//!
//! ## One Pass
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │ claimed attempt (processing, passes = n)                               │
//! │                                                                         │
//! │  n > max_passes ──► verify reserved number, else error (budget spent)  │
//! │                                                                         │
//! │  1. credentials ◄── CertificateAuthSession                             │
//! │  2. reservation ◄── SequenceGate (tuple locked until end of pass)      │
//! │  3. earlier number now behind the sequence? ──► look it up             │
//! │       our voucher ──────────► completed                                │
//! │       another voucher ──────► number released, continue with next     │
//! │       no voucher ───────────► error (manual reconciliation)            │
//! │  4. validate, record number, submit                                    │
//! │       approved ─────────────► completed                                │
//! │       out of sequence ──────► our voucher? completed, else released    │
//! │       token refused ────────► session dropped, stays processing        │
//! │       other rejection ──────► error (cause, code, class stored)        │
//! │       never sent ───────────► stays processing, number released       │
//! │       transport failure ────► stays processing, number kept            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A transport failure never moves an attempt to `error`: the authority may
//! have acted on the request. The next pass sees the number behind the
//! sequence and looks the voucher up instead of submitting again.
//!
//! Every write after the claim carries the pass count it was claimed with.
//! If the attempt was reclaimed as stale in the meantime the write is
//! refused and this pass stops without touching the record.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, error, info, instrument, warn};

use fiscal_core::lifecycle::{self, Transition};
use fiscal_core::{
    AttemptState, AuthorizationOutcome, AuthorizationResult, AuthorizedVoucher, InvoiceAttempt,
    NewInvoiceAttempt, Rejection, RejectionClass, RejectionTable,
};
use fiscal_db::{AttemptFailure, Database};

use crate::auth_session::{CertificateAuthSession, Credentials};
use crate::authorization::InvoiceAuthorizationClient;
use crate::config::{EngineConfig, SchedulerSettings};
use crate::error::{FiscalError, FiscalResult};
use crate::sequence::{Reservation, SequenceGate};

/// What the authority holds under a number this attempt reserved.
enum Remote {
    Ours(AuthorizedVoucher),
    /// Another voucher holds it, so this attempt was never authorized there.
    Taken(String),
    /// Behind the sequence with no voucher to show for it.
    Missing(String),
}

/// Dates sent to the authority are local calendar dates.
pub(crate) fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

pub struct InvoiceProcessor {
    db: Database,
    client: Arc<InvoiceAuthorizationClient>,
    gate: Arc<SequenceGate>,
    settings: SchedulerSettings,
    conflict_retries: u32,
}

impl InvoiceProcessor {
    pub fn new(
        db: Database,
        client: Arc<InvoiceAuthorizationClient>,
        gate: Arc<SequenceGate>,
        config: &EngineConfig,
    ) -> Self {
        InvoiceProcessor {
            db,
            client,
            gate,
            settings: config.scheduler.clone(),
            conflict_retries: config.sequence.conflict_retries,
        }
    }

    /// Wires the real authority clients from configuration.
    ///
    /// ## Errors
    /// `CertificateInvalid` if a configured certificate cannot be loaded.
    pub fn from_config(config: &EngineConfig, db: Database) -> FiscalResult<Self> {
        let auth = Arc::new(CertificateAuthSession::from_config(
            config,
            Arc::new(db.sessions()),
        )?);
        let client = Arc::new(InvoiceAuthorizationClient::from_config(
            config,
            auth,
            Arc::new(RejectionTable::standard()),
        )?);
        let gate = Arc::new(SequenceGate::new(client.clone(), &config.sequence));
        Ok(Self::new(db, client, gate, config))
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn client(&self) -> &Arc<InvoiceAuthorizationClient> {
        &self.client
    }

    pub fn auth(&self) -> &Arc<CertificateAuthSession> {
        self.client.auth()
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    // =========================================================================
    // Caller Operations
    // =========================================================================

    /// Records a `pending` attempt for a completed sale under the branch's
    /// active taxpayer configuration.
    ///
    /// ## Errors
    /// - `NotFound` if the branch has no active configuration
    /// - `Domain` if the invoice data is invalid
    /// - `Database(UniqueViolation)` if the sale already has an attempt
    pub async fn create_attempt(&self, input: NewInvoiceAttempt) -> FiscalResult<InvoiceAttempt> {
        let config = self
            .db
            .taxpayers()
            .active_for_branch(&input.branch_id)
            .await?
            .ok_or_else(|| FiscalError::not_found("TaxpayerConfig", &input.branch_id))?;

        Ok(self.db.attempts().create(&input, &config).await?)
    }

    pub async fn get_attempt(&self, sale_id: &str) -> FiscalResult<InvoiceAttempt> {
        self.db
            .attempts()
            .get_by_sale(sale_id)
            .await?
            .ok_or_else(|| FiscalError::not_found("InvoiceAttempt", sale_id))
    }

    /// Runs a pass for the sale's attempt now, if it can be claimed.
    ///
    /// Completed and failed attempts are reported as they are. An attempt
    /// another worker is processing is reported as pending.
    #[instrument(skip(self))]
    pub async fn submit_for_authorization(&self, sale_id: &str) -> FiscalResult<AuthorizationResult> {
        let attempt = self.get_attempt(sale_id).await?;
        let stale_before = Utc::now() - self.settings.stale_after();

        let current = match self.run_candidate(attempt.clone(), stale_before).await? {
            Some(processed) => processed,
            None => self.reload(&attempt.id).await?,
        };
        Ok(current.to_result())
    }

    /// Operator re-arm of a failed attempt: `error → pending`.
    ///
    /// The reserved number and pass count are reset; the sale keeps its
    /// single attempt record.
    pub async fn rearm(&self, sale_id: &str, reason: &str) -> FiscalResult<InvoiceAttempt> {
        let attempt = self.get_attempt(sale_id).await?;
        lifecycle::apply(attempt.state, Transition::Rearm)?;

        let reason = if reason.trim().is_empty() {
            "no reason given"
        } else {
            reason.trim()
        };
        Ok(self.db.attempts().rearm(&attempt.id, reason).await?)
    }

    // =========================================================================
    // Passes
    // =========================================================================

    /// Claims `attempt` (or reclaims it if stale) and runs a pass.
    ///
    /// Returns `None` when the attempt could not be claimed.
    pub async fn run_candidate(
        &self,
        attempt: InvoiceAttempt,
        stale_before: DateTime<Utc>,
    ) -> FiscalResult<Option<InvoiceAttempt>> {
        let repo = self.db.attempts();
        let claimed = match attempt.state {
            AttemptState::Pending => repo.claim(&attempt.id).await?,
            AttemptState::Processing => repo.reclaim_stale(&attempt.id, stale_before).await?,
            AttemptState::Completed | AttemptState::Error => None,
        };

        match claimed {
            Some(claimed) => Ok(Some(self.process(claimed).await?)),
            None => {
                debug!(attempt_id = %attempt.id, state = %attempt.state, "Attempt not claimable");
                Ok(None)
            }
        }
    }

    /// Runs one pass for an attempt this worker has claimed.
    ///
    /// Returns the attempt as left by the pass: `completed`, `error`, or
    /// still `processing` when the pass was deferred.
    #[instrument(skip(self, attempt), fields(attempt_id = %attempt.id, passes = attempt.passes))]
    pub async fn process(&self, attempt: InvoiceAttempt) -> FiscalResult<InvoiceAttempt> {
        if attempt.state != AttemptState::Processing {
            return Err(FiscalError::InvariantViolation(format!(
                "attempt {} processed while {}",
                attempt.id, attempt.state
            )));
        }

        match self.run_pass(&attempt).await {
            Ok(done) => Ok(done),
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "Pass deferred");
                self.db
                    .attempts()
                    .append_log(&attempt.id, &format!("pass {} deferred: {}", attempt.passes, e))
                    .await?;
                self.reload(&attempt.id).await
            }
            Err(FiscalError::CertificateInvalid(reason)) => {
                self.fail(
                    &attempt,
                    AttemptFailure::local(format!("certificate invalid: {}", reason)),
                )
                .await
            }
            Err(FiscalError::Domain(e)) => {
                self.fail(&attempt, AttemptFailure::local(e.to_string()))
                    .await
            }
            Err(e @ FiscalError::ClaimLost { .. }) => {
                warn!(error = %e, "Pass abandoned to the newer claim");
                self.reload(&attempt.id).await
            }
            Err(e @ FiscalError::InvariantViolation(_)) => {
                error!(error = %e, "Invariant violated while processing");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn run_pass(&self, attempt: &InvoiceAttempt) -> FiscalResult<InvoiceAttempt> {
        if attempt.passes > self.settings.max_passes {
            return self.exhaust(attempt).await;
        }

        let credentials = self.client.auth().get_valid_token(&attempt.taxpayer_id).await?;
        let reservation = self.reserve(&credentials, attempt).await?;
        let repo = self.db.attempts();

        // The earlier submission's answer was lost; if its number is no
        // longer ahead of the sequence it may be ours.
        if let Some(previous) = attempt.number {
            if reservation.last() >= previous {
                info!(previous, last = reservation.last(), "Reconciling earlier submission");
                match self.own_voucher(attempt, &credentials, previous).await? {
                    Remote::Ours(voucher) => return self.complete_reconciled(attempt, voucher).await,
                    Remote::Taken(reason) => {
                        warn!(previous, reason = %reason, "Reserved number spent elsewhere, renumbering");
                        repo.release_reservation(&attempt.id, attempt.passes, &reason)
                            .await?;
                    }
                    Remote::Missing(reason) => {
                        return self
                            .fail(
                                attempt,
                                AttemptFailure::local(format!(
                                    "manual reconciliation required: {}",
                                    reason
                                )),
                            )
                            .await;
                    }
                }
            }
        }

        let number = reservation.number();
        let invoice_date = today();
        let request = InvoiceAuthorizationClient::build_request(attempt, number, invoice_date)?;

        repo.record_reservation(&attempt.id, attempt.passes, number, invoice_date)
            .await?;

        let outcome = match self.client.submit(&credentials, &request).await {
            Ok(outcome) => outcome,
            // An earlier lost request may still hold the same number.
            Err(e @ FiscalError::Unsent { .. }) if attempt.number != Some(number) => {
                repo.release_reservation(&attempt.id, attempt.passes, &e.to_string())
                    .await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let done = match outcome {
            AuthorizationOutcome::Approved(approval) => {
                if approval.number != number {
                    return Err(FiscalError::InvariantViolation(format!(
                        "authority approved number {} for a request of {}",
                        approval.number, number
                    )));
                }
                repo.complete(&attempt.id, attempt.passes, &approval, invoice_date, "authorized")
                    .await?
            }
            AuthorizationOutcome::Rejected(rejection) => {
                self.on_rejection(attempt, &credentials, number, rejection)
                    .await?
            }
        };

        drop(reservation);
        Ok(done)
    }

    async fn reserve(
        &self,
        credentials: &Credentials,
        attempt: &InvoiceAttempt,
    ) -> FiscalResult<Reservation> {
        let mut conflicts = 0;
        loop {
            match self
                .gate
                .reserve_next(credentials, attempt.point_of_sale, attempt.document_type)
                .await
            {
                Err(FiscalError::SequenceConflict { .. }) if conflicts < self.conflict_retries => {
                    conflicts += 1;
                    debug!(conflicts, "Sequence busy, waiting again");
                }
                other => return other,
            }
        }
    }

    async fn on_rejection(
        &self,
        attempt: &InvoiceAttempt,
        credentials: &Credentials,
        number: i64,
        rejection: Rejection,
    ) -> FiscalResult<InvoiceAttempt> {
        match rejection.class {
            RejectionClass::ExpiredCredentials => {
                // Refused before numbering: the number is unused.
                self.db
                    .attempts()
                    .release_reservation(&attempt.id, attempt.passes, &rejection.cause())
                    .await?;
                Err(FiscalError::BusinessRejection(rejection))
            }
            RejectionClass::NumberOutOfSequence => {
                // The request itself was refused; only an earlier one can
                // have landed on this number.
                match self.own_voucher(attempt, credentials, number).await? {
                    Remote::Ours(voucher) => self.complete_reconciled(attempt, voucher).await,
                    Remote::Taken(reason) | Remote::Missing(reason) => {
                        warn!(number, reason = %reason, "Number refused, renumbering next pass");
                        self.db
                            .attempts()
                            .release_reservation(
                                &attempt.id,
                                attempt.passes,
                                &format!("{}; {}", rejection.cause(), reason),
                            )
                            .await?;
                        self.reload(&attempt.id).await
                    }
                }
            }
            RejectionClass::MissingReceiverTaxCondition | RejectionClass::Permanent => {
                let failure = AttemptFailure {
                    message: rejection.cause(),
                    code: rejection.code,
                    class: Some(rejection.class),
                };
                self.fail(attempt, failure).await
            }
        }
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Completes the attempt from the authority's record of its voucher.
    async fn complete_reconciled(
        &self,
        attempt: &InvoiceAttempt,
        voucher: AuthorizedVoucher,
    ) -> FiscalResult<InvoiceAttempt> {
        info!(number = voucher.number, "Ambiguous submission reconciled");
        Ok(self
            .db
            .attempts()
            .complete(
                &attempt.id,
                attempt.passes,
                &voucher.into_approval(),
                today(),
                "reconciled",
            )
            .await?)
    }

    /// Looks `number` up and decides whether it holds this attempt's voucher.
    async fn own_voucher(
        &self,
        attempt: &InvoiceAttempt,
        credentials: &Credentials,
        number: i64,
    ) -> FiscalResult<Remote> {
        let voucher = self
            .client
            .lookup(credentials, attempt.point_of_sale, attempt.document_type, number)
            .await?;

        let Some(voucher) = voucher else {
            return Ok(Remote::Missing(format!(
                "number {} is behind the authority's sequence but has no voucher",
                number
            )));
        };
        if let Some(difference) = voucher.mismatch_with(attempt) {
            return Ok(Remote::Taken(format!(
                "number {} was authorized for another voucher: {}",
                number, difference
            )));
        }
        if let Some(other) = self
            .db
            .attempts()
            .completed_with_number(
                &attempt.taxpayer_id,
                attempt.point_of_sale,
                attempt.document_type,
                number,
                &attempt.id,
            )
            .await?
        {
            return Ok(Remote::Taken(format!(
                "number {} is already completed by attempt {}",
                number, other
            )));
        }
        Ok(Remote::Ours(voucher))
    }

    /// Ends an attempt that ran out of passes.
    ///
    /// A reserved number is checked one last time so an authorized voucher
    /// is never left as an error.
    async fn exhaust(&self, attempt: &InvoiceAttempt) -> FiscalResult<InvoiceAttempt> {
        let spent = format!("retry budget exhausted after {} passes", self.settings.max_passes);

        let Some(number) = attempt.number else {
            return self.fail(attempt, AttemptFailure::local(spent)).await;
        };

        let verified = match self.client.auth().get_valid_token(&attempt.taxpayer_id).await {
            Ok(credentials) => self.own_voucher(attempt, &credentials, number).await,
            Err(e) => Err(e),
        };

        match verified {
            Ok(Remote::Ours(voucher)) => self.complete_reconciled(attempt, voucher).await,
            Ok(Remote::Taken(reason) | Remote::Missing(reason)) => {
                self.fail(attempt, AttemptFailure::local(format!("{}; {}", spent, reason)))
                    .await
            }
            Err(e) => {
                warn!(error = %e, number, "Could not verify reserved number");
                self.fail(
                    attempt,
                    AttemptFailure::local(format!(
                        "{}; number {} unverified, manual reconciliation required",
                        spent, number
                    )),
                )
                .await
            }
        }
    }

    async fn fail(
        &self,
        attempt: &InvoiceAttempt,
        failure: AttemptFailure,
    ) -> FiscalResult<InvoiceAttempt> {
        Ok(self
            .db
            .attempts()
            .fail(&attempt.id, attempt.passes, &failure)
            .await?)
    }

    async fn reload(&self, id: &str) -> FiscalResult<InvoiceAttempt> {
        self.db
            .attempts()
            .get_by_id(id)
            .await?
            .ok_or_else(|| FiscalError::not_found("InvoiceAttempt", id))
    }
}
