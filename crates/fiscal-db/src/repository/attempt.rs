//! # Invoice Attempt Repository
//!
//! Persistence for the attempt state machine.
//!
//! ## Transitions
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  create()          INSERT                      → pending               │
//! │  claim()           pending    WHERE state=…    → processing  passes+1  │
//! │  reclaim_stale()   processing AND stale        → processing  passes+1  │
//! │  record_reservation() processing               (number, invoice date)  │
//! │  release_reservation() processing              number cleared          │
//! │  complete()        processing                  → completed             │
//! │  fail()            processing                  → error                 │
//! │  rearm()           error                       → pending               │
//! │  auto_rearm()      error AND auto_rearms < n   → pending  auto_rearms+1│
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each transition is a single `UPDATE ... WHERE state = <source> RETURNING *`.
//! The row either moves and comes back, or nothing happens; a second worker
//! racing for the same move gets `None` (claims) or
//! [`DbError::StateConflict`] (everything else).
//!
//! Writes made after a claim also carry the pass count the worker claimed
//! with (`AND passes = ?`). A worker whose attempt was reclaimed in the
//! meantime gets [`DbError::ClaimLost`] and must stop touching the row.
//!
//! `UNIQUE(sale_id)` keeps one record per sale, so a re-armed attempt reuses
//! its row and a sale can never hold two completed attempts.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use fiscal_core::lifecycle::{self, Transition};
use fiscal_core::validation::validate_new_attempt;
use fiscal_core::{
    Approval, AttemptState, Concept, CoreError, Correction, DocumentType, InvoiceAmounts,
    InvoiceAttempt, NewInvoiceAttempt, Receiver, ReceiverDocType, ReceiverTaxCondition,
    RejectionClass, ServicePeriod, TaxLine, TaxpayerConfig, TaxpayerId,
};

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, FromRow)]
struct AttemptRow {
    id: String,
    sale_id: String,
    branch_id: String,
    taxpayer_config_id: String,
    taxpayer_id: String,
    point_of_sale: i64,
    document_type: i64,
    concept: i64,
    receiver_doc_type: i64,
    receiver_doc_number: i64,
    receiver_tax_condition: Option<i64>,
    net_cents: i64,
    exempt_cents: i64,
    untaxed_cents: i64,
    tax_cents: i64,
    total_cents: i64,
    tax_lines: String,
    service_from: Option<NaiveDate>,
    service_to: Option<NaiveDate>,
    payment_due: Option<NaiveDate>,
    state: AttemptState,
    number: Option<i64>,
    authorization_code: Option<String>,
    authorization_expiry: Option<NaiveDate>,
    invoice_date: Option<NaiveDate>,
    error_message: Option<String>,
    error_code: Option<i64>,
    rejection_class: Option<RejectionClass>,
    passes: i64,
    auto_rearms: i64,
    log: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

fn invalid<E: std::fmt::Display>(e: E) -> DbError {
    DbError::InvalidData(e.to_string())
}

impl TryFrom<AttemptRow> for InvoiceAttempt {
    type Error = DbError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        let tax_lines: Vec<TaxLine> = serde_json::from_str(&row.tax_lines)?;

        let service_period = match (row.service_from, row.service_to, row.payment_due) {
            (Some(from), Some(to), Some(payment_due)) => Some(ServicePeriod {
                from,
                to,
                payment_due,
            }),
            _ => None,
        };

        Ok(InvoiceAttempt {
            taxpayer_id: TaxpayerId::parse(&row.taxpayer_id).map_err(invalid)?,
            point_of_sale: u32::try_from(row.point_of_sale).map_err(invalid)?,
            document_type: DocumentType::from_code(row.document_type).map_err(invalid)?,
            concept: Concept::from_code(row.concept).map_err(invalid)?,
            receiver: Receiver {
                doc_type: ReceiverDocType::from_code(row.receiver_doc_type).map_err(invalid)?,
                doc_number: u64::try_from(row.receiver_doc_number).map_err(invalid)?,
                tax_condition: row
                    .receiver_tax_condition
                    .map(ReceiverTaxCondition::from_code)
                    .transpose()
                    .map_err(invalid)?,
            },
            amounts: InvoiceAmounts {
                net_cents: row.net_cents,
                exempt_cents: row.exempt_cents,
                untaxed_cents: row.untaxed_cents,
                tax_cents: row.tax_cents,
                total_cents: row.total_cents,
                tax_lines,
            },
            service_period,
            passes: u32::try_from(row.passes).map_err(invalid)?,
            auto_rearms: u32::try_from(row.auto_rearms).map_err(invalid)?,
            id: row.id,
            sale_id: row.sale_id,
            branch_id: row.branch_id,
            taxpayer_config_id: row.taxpayer_config_id,
            state: row.state,
            number: row.number,
            authorization_code: row.authorization_code,
            authorization_expiry: row.authorization_expiry,
            invoice_date: row.invoice_date,
            error_message: row.error_message,
            error_code: row.error_code,
            rejection_class: row.rejection_class,
            log: row.log,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

/// One timestamped audit line.
fn log_line(message: &str) -> String {
    format!(
        "{} {}\n",
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        message
    )
}

// =============================================================================
// Inputs and Read Models
// =============================================================================

/// Why an attempt moved to `error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    /// Human-readable cause, stored verbatim.
    pub message: String,
    /// Stable code of the rejection, if the authority sent one.
    pub code: Option<i64>,
    /// Classification, for business rejections.
    pub class: Option<RejectionClass>,
}

impl AttemptFailure {
    /// A failure that did not come from the authority's rule set.
    pub fn local(message: impl Into<String>) -> Self {
        AttemptFailure {
            message: message.into(),
            code: None,
            class: None,
        }
    }
}

/// Number of attempts in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StateCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub error: i64,
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for invoice attempt operations.
#[derive(Debug, Clone)]
pub struct InvoiceAttemptRepository {
    pool: SqlitePool,
}

impl InvoiceAttemptRepository {
    /// Creates a new InvoiceAttemptRepository.
    pub fn new(pool: SqlitePool) -> Self {
        InvoiceAttemptRepository { pool }
    }

    /// Creates a `pending` attempt for a sale under `config`.
    ///
    /// ## Errors
    /// - `DbError::Domain` if the input fails validation
    /// - `DbError::UniqueViolation` if the sale already has an attempt
    pub async fn create(
        &self,
        input: &NewInvoiceAttempt,
        config: &TaxpayerConfig,
    ) -> DbResult<InvoiceAttempt> {
        validate_new_attempt(input).map_err(CoreError::from)?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let tax_lines = serde_json::to_string(&input.amounts.tax_lines)?;
        let period = input.service_period;

        let row = sqlx::query_as::<_, AttemptRow>(
            r#"
            INSERT INTO invoice_attempts (
                id, sale_id, branch_id, taxpayer_config_id, taxpayer_id, point_of_sale,
                document_type, concept,
                receiver_doc_type, receiver_doc_number, receiver_tax_condition,
                net_cents, exempt_cents, untaxed_cents, tax_cents, total_cents, tax_lines,
                service_from, service_to, payment_due,
                state, passes, auto_rearms, log, created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6,
                ?7, ?8,
                ?9, ?10, ?11,
                ?12, ?13, ?14, ?15, ?16, ?17,
                ?18, ?19, ?20,
                'pending', 0, 0, ?21, ?22, ?22
            )
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(&input.sale_id)
        .bind(&input.branch_id)
        .bind(&config.id)
        .bind(config.taxpayer_id.as_str())
        .bind(config.point_of_sale as i64)
        .bind(input.document_type.code())
        .bind(input.concept.code())
        .bind(input.receiver.doc_type.code())
        .bind(input.receiver.doc_number as i64)
        .bind(input.receiver.tax_condition.map(ReceiverTaxCondition::code))
        .bind(input.amounts.net_cents)
        .bind(input.amounts.exempt_cents)
        .bind(input.amounts.untaxed_cents)
        .bind(input.amounts.tax_cents)
        .bind(input.amounts.total_cents)
        .bind(tax_lines)
        .bind(period.map(|p| p.from))
        .bind(period.map(|p| p.to))
        .bind(period.map(|p| p.payment_due))
        .bind(log_line("created"))
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::UniqueViolation { .. } => DbError::duplicate("sale_id", &input.sale_id),
            other => other,
        })?;

        info!(
            attempt_id = %id,
            sale_id = %input.sale_id,
            taxpayer = %config.taxpayer_id,
            pos = config.point_of_sale,
            "Invoice attempt created"
        );

        row.try_into()
    }

    /// Gets an attempt by ID.
    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<InvoiceAttempt>> {
        sqlx::query_as::<_, AttemptRow>("SELECT * FROM invoice_attempts WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(InvoiceAttempt::try_from)
            .transpose()
    }

    /// Gets the attempt for a sale.
    pub async fn get_by_sale(&self, sale_id: &str) -> DbResult<Option<InvoiceAttempt>> {
        sqlx::query_as::<_, AttemptRow>("SELECT * FROM invoice_attempts WHERE sale_id = ?1")
            .bind(sale_id)
            .fetch_optional(&self.pool)
            .await?
            .map(InvoiceAttempt::try_from)
            .transpose()
    }

    // -------------------------------------------------------------------------
    // Claims
    // -------------------------------------------------------------------------

    /// Atomically claims a `pending` attempt for processing.
    ///
    /// Returns `None` if the attempt was not `pending` (someone else won).
    pub async fn claim(&self, id: &str) -> DbResult<Option<InvoiceAttempt>> {
        let row = sqlx::query_as::<_, AttemptRow>(
            r#"
            UPDATE invoice_attempts SET
                state = 'processing',
                passes = passes + 1,
                updated_at = ?2,
                log = log || ?3
            WHERE id = ?1 AND state = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .bind(log_line("claimed for processing"))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let attempt = InvoiceAttempt::try_from(row)?;
                debug!(attempt_id = %id, passes = attempt.passes, "Attempt claimed");
                Ok(Some(attempt))
            }
            None => Ok(None),
        }
    }

    /// Atomically reclaims a `processing` attempt whose last update is older
    /// than `stale_before`.
    ///
    /// Returns `None` if the attempt is not stale `processing`.
    pub async fn reclaim_stale(
        &self,
        id: &str,
        stale_before: DateTime<Utc>,
    ) -> DbResult<Option<InvoiceAttempt>> {
        let row = sqlx::query_as::<_, AttemptRow>(
            r#"
            UPDATE invoice_attempts SET
                passes = passes + 1,
                updated_at = ?3,
                log = log || ?4
            WHERE id = ?1 AND state = 'processing' AND updated_at < ?2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(stale_before)
        .bind(Utc::now())
        .bind(log_line("reclaimed after stale processing"))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let attempt = InvoiceAttempt::try_from(row)?;
                warn!(attempt_id = %id, passes = attempt.passes, "Stale attempt reclaimed");
                Ok(Some(attempt))
            }
            None => Ok(None),
        }
    }

    /// Stores the number reserved for the submission about to be sent.
    pub async fn record_reservation(
        &self,
        id: &str,
        claimed_passes: u32,
        number: i64,
        invoice_date: NaiveDate,
    ) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE invoice_attempts SET
                number = ?3,
                invoice_date = ?4,
                updated_at = ?5,
                log = log || ?6
            WHERE id = ?1 AND state = 'processing' AND passes = ?2
            "#,
        )
        .bind(id)
        .bind(claimed_passes as i64)
        .bind(number)
        .bind(invoice_date)
        .bind(Utc::now())
        .bind(log_line(&format!("reserved number {}", number)))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self
                .conflict(id, claimed_passes, AttemptState::Processing)
                .await);
        }
        Ok(())
    }

    /// Forgets the reserved number of a `processing` attempt.
    ///
    /// Only for numbers known to be unused by this attempt: the authority
    /// refused the submission, the request never left, or the authority's
    /// record of the number belongs to another voucher.
    pub async fn release_reservation(
        &self,
        id: &str,
        claimed_passes: u32,
        reason: &str,
    ) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE invoice_attempts SET
                number = NULL,
                invoice_date = NULL,
                updated_at = ?3,
                log = log || ?4
            WHERE id = ?1 AND state = 'processing' AND passes = ?2
            "#,
        )
        .bind(id)
        .bind(claimed_passes as i64)
        .bind(Utc::now())
        .bind(log_line(&format!("reservation released: {}", reason)))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self
                .conflict(id, claimed_passes, AttemptState::Processing)
                .await);
        }
        Ok(())
    }

    /// Explains why a fenced write to a `processing` attempt matched no row.
    async fn conflict(&self, id: &str, claimed_passes: u32, expected: AttemptState) -> DbError {
        let current = sqlx::query_as::<_, (AttemptState, i64)>(
            "SELECT state, passes FROM invoice_attempts WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await;

        match current {
            Ok(Some((state, passes))) if state == expected && passes != claimed_passes as i64 => {
                warn!(
                    attempt_id = %id,
                    claimed = claimed_passes,
                    current = passes,
                    "Write refused, attempt was reclaimed"
                );
                DbError::ClaimLost {
                    id: id.to_string(),
                    claimed: claimed_passes,
                    current: u32::try_from(passes).unwrap_or(u32::MAX),
                }
            }
            Ok(Some(_)) => DbError::state_conflict(id, expected),
            Ok(None) => DbError::not_found("InvoiceAttempt", id),
            Err(e) => e.into(),
        }
    }

    // -------------------------------------------------------------------------
    // Terminal Transitions
    // -------------------------------------------------------------------------

    /// Moves a `processing` attempt to `completed`.
    ///
    /// `note` is appended to the log (for example "authorized" or
    /// "reconciled").
    pub async fn complete(
        &self,
        id: &str,
        claimed_passes: u32,
        approval: &Approval,
        today: NaiveDate,
        note: &str,
    ) -> DbResult<InvoiceAttempt> {
        lifecycle::validate_completion(
            &approval.authorization_code,
            approval.authorization_expiry,
            today,
        )?;

        let now = Utc::now();
        let mut message = format!(
            "{}: number {} code {} expires {}",
            note, approval.number, approval.authorization_code, approval.authorization_expiry
        );
        for obs in &approval.observations {
            message.push_str(&format!(" | observation {}", obs));
        }

        let row = sqlx::query_as::<_, AttemptRow>(
            r#"
            UPDATE invoice_attempts SET
                state = 'completed',
                number = ?3,
                authorization_code = ?4,
                authorization_expiry = ?5,
                error_message = NULL,
                error_code = NULL,
                rejection_class = NULL,
                completed_at = ?6,
                updated_at = ?6,
                log = log || ?7
            WHERE id = ?1 AND state = 'processing' AND passes = ?2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(claimed_passes as i64)
        .bind(approval.number)
        .bind(&approval.authorization_code)
        .bind(approval.authorization_expiry)
        .bind(now)
        .bind(log_line(&message))
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Err(self
                .conflict(id, claimed_passes, Transition::Complete.source())
                .await);
        };

        info!(
            attempt_id = %id,
            number = approval.number,
            note = %note,
            "Attempt completed"
        );

        row.try_into()
    }

    /// Moves a `processing` attempt to `error` with a stored cause.
    pub async fn fail(
        &self,
        id: &str,
        claimed_passes: u32,
        failure: &AttemptFailure,
    ) -> DbResult<InvoiceAttempt> {
        let row = sqlx::query_as::<_, AttemptRow>(
            r#"
            UPDATE invoice_attempts SET
                state = 'error',
                authorization_code = NULL,
                authorization_expiry = NULL,
                error_message = ?3,
                error_code = ?4,
                rejection_class = ?5,
                updated_at = ?6,
                log = log || ?7
            WHERE id = ?1 AND state = 'processing' AND passes = ?2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(claimed_passes as i64)
        .bind(&failure.message)
        .bind(failure.code)
        .bind(failure.class)
        .bind(Utc::now())
        .bind(log_line(&format!("error: {}", failure.message)))
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Err(self
                .conflict(id, claimed_passes, Transition::Fail.source())
                .await);
        };

        warn!(
            attempt_id = %id,
            code = ?failure.code,
            class = ?failure.class,
            cause = %failure.message,
            "Attempt failed"
        );

        row.try_into()
    }

    /// Operator re-arm: `error → pending`.
    pub async fn rearm(&self, id: &str, reason: &str) -> DbResult<InvoiceAttempt> {
        self.rearm_inner(id, &format!("re-armed by operator: {}", reason), None, None)
            .await
    }

    /// Corrective-rule re-arm: applies `correction` and moves `error → pending`
    /// only while the attempt has been auto re-armed fewer than `limit` times.
    pub async fn auto_rearm(
        &self,
        id: &str,
        correction: Correction,
        limit: u32,
    ) -> DbResult<InvoiceAttempt> {
        let message = format!("re-armed automatically: {}", correction.describe());
        self.rearm_inner(id, &message, Some(correction), Some(limit))
            .await
    }

    async fn rearm_inner(
        &self,
        id: &str,
        message: &str,
        correction: Option<Correction>,
        auto_limit: Option<u32>,
    ) -> DbResult<InvoiceAttempt> {
        let tax_condition = correction.map(|c| match c {
            Correction::SetReceiverTaxCondition(condition) => condition.code(),
        });

        let row = sqlx::query_as::<_, AttemptRow>(
            r#"
            UPDATE invoice_attempts SET
                state = 'pending',
                number = NULL,
                invoice_date = NULL,
                error_message = NULL,
                error_code = NULL,
                rejection_class = NULL,
                passes = 0,
                receiver_tax_condition = COALESCE(?2, receiver_tax_condition),
                auto_rearms = auto_rearms + ?3,
                updated_at = ?5,
                log = log || ?6
            WHERE id = ?1 AND state = 'error' AND (?4 IS NULL OR auto_rearms < ?4)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(tax_condition)
        .bind(if auto_limit.is_some() { 1i64 } else { 0i64 })
        .bind(auto_limit.map(|l| l as i64))
        .bind(Utc::now())
        .bind(log_line(message))
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::state_conflict(id, Transition::Rearm.source()))?;

        info!(attempt_id = %id, message = %message, "Attempt re-armed");

        row.try_into()
    }

    /// Appends a timestamped line to the attempt's log.
    pub async fn append_log(&self, id: &str, message: &str) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE invoice_attempts SET
                log = log || ?2,
                updated_at = ?3
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(log_line(message))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("InvoiceAttempt", id));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Scheduler Selections
    // -------------------------------------------------------------------------

    /// Attempts the scheduler should run: `pending` ones last touched before
    /// `pending_before` and `processing` ones last touched before
    /// `stale_before`, oldest first.
    pub async fn list_reclaimable(
        &self,
        pending_before: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> DbResult<Vec<InvoiceAttempt>> {
        sqlx::query_as::<_, AttemptRow>(
            r#"
            SELECT * FROM invoice_attempts
            WHERE (state = 'pending' AND updated_at < ?1)
               OR (state = 'processing' AND updated_at < ?2)
            ORDER BY created_at ASC
            LIMIT ?3
            "#,
        )
        .bind(pending_before)
        .bind(stale_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(InvoiceAttempt::try_from)
        .collect()
    }

    /// `error` attempts with an auto-correctable rejection that have been
    /// auto re-armed fewer than `rearm_limit` times.
    pub async fn list_auto_correctable(
        &self,
        rearm_limit: u32,
        limit: u32,
    ) -> DbResult<Vec<InvoiceAttempt>> {
        let classes: Vec<RejectionClass> = RejectionClass::ALL
            .into_iter()
            .filter(|c| c.is_auto_correctable())
            .collect();
        if classes.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (0..classes.len())
            .map(|i| format!("?{}", i + 3))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            r#"
            SELECT * FROM invoice_attempts
            WHERE state = 'error'
              AND auto_rearms < ?1
              AND rejection_class IN ({})
            ORDER BY updated_at ASC
            LIMIT ?2
            "#,
            placeholders
        );

        let mut query = sqlx::query_as::<_, AttemptRow>(&sql)
            .bind(rearm_limit as i64)
            .bind(limit as i64);
        for class in classes {
            query = query.bind(class);
        }

        query
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(InvoiceAttempt::try_from)
            .collect()
    }

    /// Number of attempts per state.
    pub async fn count_by_state(&self) -> DbResult<StateCounts> {
        let rows: Vec<(AttemptState, i64)> = sqlx::query_as(
            "SELECT state, COUNT(*) FROM invoice_attempts GROUP BY state",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StateCounts::default();
        for (state, count) in rows {
            match state {
                AttemptState::Pending => counts.pending = count,
                AttemptState::Processing => counts.processing = count,
                AttemptState::Completed => counts.completed = count,
                AttemptState::Error => counts.error = count,
            }
        }
        Ok(counts)
    }

    /// Highest number completed locally for a sequence tuple.
    pub async fn max_completed_number(
        &self,
        taxpayer_id: &TaxpayerId,
        point_of_sale: u32,
        document_type: DocumentType,
    ) -> DbResult<Option<i64>> {
        let max: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(number) FROM invoice_attempts
            WHERE taxpayer_id = ?1
              AND point_of_sale = ?2
              AND document_type = ?3
              AND state = 'completed'
            "#,
        )
        .bind(taxpayer_id.as_str())
        .bind(point_of_sale as i64)
        .bind(document_type.code())
        .fetch_one(&self.pool)
        .await?;
        Ok(max)
    }

    /// The attempt, other than `exclude_id`, that completed with `number`.
    pub async fn completed_with_number(
        &self,
        taxpayer_id: &TaxpayerId,
        point_of_sale: u32,
        document_type: DocumentType,
        number: i64,
        exclude_id: &str,
    ) -> DbResult<Option<String>> {
        let id: Option<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM invoice_attempts
            WHERE taxpayer_id = ?1
              AND point_of_sale = ?2
              AND document_type = ?3
              AND number = ?4
              AND state = 'completed'
              AND id <> ?5
            "#,
        )
        .bind(taxpayer_id.as_str())
        .bind(point_of_sale as i64)
        .bind(document_type.code())
        .bind(number)
        .bind(exclude_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    /// Document types completed locally under a point of sale.
    pub async fn completed_document_types(
        &self,
        taxpayer_id: &TaxpayerId,
        point_of_sale: u32,
    ) -> DbResult<Vec<DocumentType>> {
        let codes: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT document_type FROM invoice_attempts
            WHERE taxpayer_id = ?1 AND point_of_sale = ?2 AND state = 'completed'
            ORDER BY document_type
            "#,
        )
        .bind(taxpayer_id.as_str())
        .bind(point_of_sale as i64)
        .fetch_all(&self.pool)
        .await?;

        codes
            .into_iter()
            .map(|code| DocumentType::from_code(code).map_err(invalid))
            .collect()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use chrono::Duration;
    use fiscal_core::{Money, RemoteMessage, VatRate};

    async fn setup() -> (Database, TaxpayerConfig) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let config = db
            .taxpayers()
            .register(
                "branch-1",
                &TaxpayerId::parse("20123456786").unwrap(),
                3,
                None,
            )
            .await
            .unwrap();
        (db, config)
    }

    fn new_attempt(sale_id: &str) -> NewInvoiceAttempt {
        NewInvoiceAttempt {
            sale_id: sale_id.to_string(),
            branch_id: "branch-1".to_string(),
            document_type: DocumentType::InvoiceB,
            concept: Concept::Products,
            receiver: Receiver::final_consumer(),
            amounts: InvoiceAmounts::from_lines(
                vec![TaxLine::compute(VatRate::TwentyOne, Money::from_cents(10_000))],
                Money::zero(),
                Money::zero(),
            ),
            service_period: None,
        }
    }

    fn approval(number: i64) -> Approval {
        Approval {
            number,
            authorization_code: "76123456789012".to_string(),
            authorization_expiry: Utc::now().date_naive() + Duration::days(10),
            observations: vec![RemoteMessage::new(10217, "informativa")],
        }
    }

    fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    #[tokio::test]
    async fn test_create_and_read_back() {
        let (db, config) = setup().await;
        let repo = db.attempts();

        let created = repo.create(&new_attempt("sale-1"), &config).await.unwrap();
        assert_eq!(created.state, AttemptState::Pending);
        assert_eq!(created.point_of_sale, 3);
        assert_eq!(created.amounts.total().to_wire(), "121.00");
        assert_eq!(created.amounts.tax_lines[0].rate, VatRate::TwentyOne);
        assert_eq!(created.log_lines().count(), 1);

        let by_sale = repo.get_by_sale("sale-1").await.unwrap().unwrap();
        assert_eq!(by_sale.id, created.id);
        assert!(repo.get_by_sale("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_one_attempt_per_sale() {
        let (db, config) = setup().await;
        let repo = db.attempts();

        repo.create(&new_attempt("sale-1"), &config).await.unwrap();
        let err = repo
            .create(&new_attempt("sale-1"), &config)
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[tokio::test]
    async fn test_create_validates() {
        let (db, config) = setup().await;
        let mut input = new_attempt("sale-1");
        input.amounts.total_cents += 1;

        let err = db.attempts().create(&input, &config).await.unwrap_err();
        assert!(matches!(err, DbError::Domain(_)));
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let (db, config) = setup().await;
        let repo = db.attempts();
        let attempt = repo.create(&new_attempt("sale-1"), &config).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let repo = repo.clone();
            let id = attempt.id.clone();
            handles.push(tokio::spawn(async move { repo.claim(&id).await.unwrap() }));
        }

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        let claimed = repo.get_by_id(&attempt.id).await.unwrap().unwrap();
        assert_eq!(claimed.state, AttemptState::Processing);
        assert_eq!(claimed.passes, 1);
    }

    #[tokio::test]
    async fn test_complete_flow() {
        let (db, config) = setup().await;
        let repo = db.attempts();
        let attempt = repo.create(&new_attempt("sale-1"), &config).await.unwrap();

        repo.claim(&attempt.id).await.unwrap().unwrap();
        repo.record_reservation(&attempt.id, 1, 42, today())
            .await
            .unwrap();
        let done = repo
            .complete(&attempt.id, 1, &approval(42), today(), "authorized")
            .await
            .unwrap();

        assert_eq!(done.state, AttemptState::Completed);
        assert_eq!(done.number, Some(42));
        assert_eq!(done.authorization_code.as_deref(), Some("76123456789012"));
        assert!(done.completed_at.is_some());
        assert!(done.log.contains("observation 10217: informativa"));

        assert_eq!(
            repo.max_completed_number(&config.taxpayer_id, 3, DocumentType::InvoiceB)
                .await
                .unwrap(),
            Some(42)
        );
    }

    #[tokio::test]
    async fn test_complete_requires_processing() {
        let (db, config) = setup().await;
        let repo = db.attempts();
        let attempt = repo.create(&new_attempt("sale-1"), &config).await.unwrap();

        let err = repo
            .complete(&attempt.id, 1, &approval(1), today(), "authorized")
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::StateConflict { .. }));
    }

    #[tokio::test]
    async fn test_complete_rejects_unusable_authorization() {
        let (db, config) = setup().await;
        let repo = db.attempts();
        let attempt = repo.create(&new_attempt("sale-1"), &config).await.unwrap();
        repo.claim(&attempt.id).await.unwrap();

        let mut empty = approval(1);
        empty.authorization_code = String::new();
        assert!(matches!(
            repo.complete(&attempt.id, 1, &empty, today(), "authorized").await,
            Err(DbError::Domain(_))
        ));

        let mut expired = approval(1);
        expired.authorization_expiry = today() - Duration::days(1);
        assert!(matches!(
            repo.complete(&attempt.id, 1, &expired, today(), "authorized").await,
            Err(DbError::Domain(_))
        ));

        let still = repo.get_by_id(&attempt.id).await.unwrap().unwrap();
        assert_eq!(still.state, AttemptState::Processing);
    }

    #[tokio::test]
    async fn test_fail_and_rearm() {
        let (db, config) = setup().await;
        let repo = db.attempts();
        let attempt = repo.create(&new_attempt("sale-1"), &config).await.unwrap();
        repo.claim(&attempt.id).await.unwrap();
        repo.record_reservation(&attempt.id, 1, 7, today()).await.unwrap();

        let failure = AttemptFailure {
            message: "10246: Condicion Frente al IVA del receptor obligatoria".to_string(),
            code: Some(10246),
            class: Some(RejectionClass::MissingReceiverTaxCondition),
        };
        let failed = repo.fail(&attempt.id, 1, &failure).await.unwrap();
        assert_eq!(failed.state, AttemptState::Error);
        assert!(failed.authorization_code.is_none());
        assert_eq!(failed.error_code, Some(10246));
        assert!(failed
            .log
            .contains("error: 10246: Condicion Frente al IVA del receptor obligatoria"));

        let rearmed = repo.rearm(&attempt.id, "customer data fixed").await.unwrap();
        assert_eq!(rearmed.state, AttemptState::Pending);
        assert_eq!(rearmed.passes, 0);
        assert_eq!(rearmed.number, None);
        assert_eq!(rearmed.auto_rearms, 0);
        assert!(rearmed.error_message.is_none());

        // Only error attempts can be re-armed
        assert!(matches!(
            repo.rearm(&attempt.id, "again").await,
            Err(DbError::StateConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_auto_rearm_is_one_shot() {
        let (db, config) = setup().await;
        let repo = db.attempts();
        let mut input = new_attempt("sale-1");
        input.receiver.tax_condition = None;
        let attempt = repo.create(&input, &config).await.unwrap();

        let failure = AttemptFailure {
            message: "10246: falta condicion".to_string(),
            code: Some(10246),
            class: Some(RejectionClass::MissingReceiverTaxCondition),
        };
        repo.claim(&attempt.id).await.unwrap();
        repo.fail(&attempt.id, 1, &failure).await.unwrap();

        let eligible = repo.list_auto_correctable(1, 10).await.unwrap();
        assert_eq!(eligible.len(), 1);

        let correction =
            Correction::SetReceiverTaxCondition(ReceiverTaxCondition::FinalConsumer);
        let rearmed = repo.auto_rearm(&attempt.id, correction, 1).await.unwrap();
        assert_eq!(rearmed.auto_rearms, 1);
        assert_eq!(
            rearmed.receiver.tax_condition,
            Some(ReceiverTaxCondition::FinalConsumer)
        );

        repo.claim(&attempt.id).await.unwrap();
        repo.fail(&attempt.id, 1, &failure).await.unwrap();

        assert!(repo.list_auto_correctable(1, 10).await.unwrap().is_empty());
        assert!(matches!(
            repo.auto_rearm(&attempt.id, correction, 1).await,
            Err(DbError::StateConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_reclaim_stale() {
        let (db, config) = setup().await;
        let repo = db.attempts();
        let attempt = repo.create(&new_attempt("sale-1"), &config).await.unwrap();
        repo.claim(&attempt.id).await.unwrap();

        // Not stale yet
        let cutoff = Utc::now() - Duration::minutes(5);
        assert!(repo.reclaim_stale(&attempt.id, cutoff).await.unwrap().is_none());

        let future_cutoff = Utc::now() + Duration::seconds(1);
        let reclaimed = repo
            .reclaim_stale(&attempt.id, future_cutoff)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.state, AttemptState::Processing);
        assert_eq!(reclaimed.passes, 2);
    }

    #[tokio::test]
    async fn test_reclaimed_attempt_refuses_the_first_worker() {
        let (db, config) = setup().await;
        let repo = db.attempts();
        let attempt = repo.create(&new_attempt("sale-1"), &config).await.unwrap();
        let first = repo.claim(&attempt.id).await.unwrap().unwrap();

        let second = repo
            .reclaim_stale(&attempt.id, Utc::now() + Duration::seconds(1))
            .await
            .unwrap()
            .unwrap();
        repo.record_reservation(&attempt.id, second.passes, 1, today())
            .await
            .unwrap();

        let err = repo
            .record_reservation(&attempt.id, first.passes, 2, today())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::ClaimLost { claimed: 1, current: 2, .. }));
        assert!(matches!(
            repo.complete(&attempt.id, first.passes, &approval(2), today(), "authorized")
                .await,
            Err(DbError::ClaimLost { .. })
        ));
        assert!(matches!(
            repo.release_reservation(&attempt.id, first.passes, "lost").await,
            Err(DbError::ClaimLost { .. })
        ));

        let current = repo.get_by_id(&attempt.id).await.unwrap().unwrap();
        assert_eq!(current.number, Some(1));
        assert_eq!(current.state, AttemptState::Processing);

        let done = repo
            .complete(&attempt.id, second.passes, &approval(1), today(), "authorized")
            .await
            .unwrap();
        assert_eq!(done.state, AttemptState::Completed);
    }

    #[tokio::test]
    async fn test_list_reclaimable() {
        let (db, config) = setup().await;
        let repo = db.attempts();
        let a = repo.create(&new_attempt("sale-1"), &config).await.unwrap();
        let b = repo.create(&new_attempt("sale-2"), &config).await.unwrap();
        let c = repo.create(&new_attempt("sale-3"), &config).await.unwrap();
        repo.claim(&b.id).await.unwrap();
        repo.claim(&c.id).await.unwrap();
        repo.record_reservation(&c.id, 1, 1, today()).await.unwrap();
        repo.complete(&c.id, 1, &approval(1), today(), "authorized")
            .await
            .unwrap();

        let now = Utc::now() + Duration::seconds(1);
        let all = repo.list_reclaimable(now, now, 10).await.unwrap();
        let ids: Vec<_> = all.iter().map(|x| x.id.clone()).collect();
        assert_eq!(ids, vec![a.id.clone(), b.id.clone()]);

        let long_ago = Utc::now() - Duration::hours(1);
        assert!(repo
            .list_reclaimable(long_ago, long_ago, 10)
            .await
            .unwrap()
            .is_empty());

        assert_eq!(repo.list_reclaimable(now, now, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_count_by_state_and_log() {
        let (db, config) = setup().await;
        let repo = db.attempts();
        let a = repo.create(&new_attempt("sale-1"), &config).await.unwrap();
        repo.create(&new_attempt("sale-2"), &config).await.unwrap();
        repo.claim(&a.id).await.unwrap();

        let counts = repo.count_by_state().await.unwrap();
        assert_eq!(
            counts,
            StateCounts {
                pending: 1,
                processing: 1,
                completed: 0,
                error: 0
            }
        );

        repo.append_log(&a.id, "transport failure: timeout").await.unwrap();
        let a = repo.get_by_id(&a.id).await.unwrap().unwrap();
        let lines: Vec<_> = a.log_lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[2].ends_with("transport failure: timeout"));

        assert!(matches!(
            repo.append_log("missing", "x").await,
            Err(DbError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_completed_number_is_unique_per_tuple() {
        let (db, config) = setup().await;
        let repo = db.attempts();
        let a = repo.create(&new_attempt("sale-1"), &config).await.unwrap();
        let b = repo.create(&new_attempt("sale-2"), &config).await.unwrap();

        repo.claim(&a.id).await.unwrap();
        repo.complete(&a.id, 1, &approval(5), today(), "authorized")
            .await
            .unwrap();

        let tp = &config.taxpayer_id;
        assert_eq!(
            repo.completed_with_number(tp, 3, DocumentType::InvoiceB, 5, &b.id)
                .await
                .unwrap(),
            Some(a.id.clone())
        );
        assert!(repo
            .completed_with_number(tp, 3, DocumentType::InvoiceB, 5, &a.id)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            repo.completed_document_types(tp, 3).await.unwrap(),
            vec![DocumentType::InvoiceB]
        );

        repo.claim(&b.id).await.unwrap();
        assert!(repo
            .complete(&b.id, 1, &approval(5), today(), "authorized")
            .await
            .is_err());
    }
}
