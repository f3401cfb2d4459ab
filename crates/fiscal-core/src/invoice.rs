//! # Invoice Model
//!
//! The invoice attempt record, the authorization request built from it and
//! the outcomes the authority can return.
//!
//! ## Request Shape
//! ```text
//! AuthorizationRequest
//! ├── header:  point_of_sale, document_type, count = 1
//! └── detail
//!     ├── concept, receiver (doc type, number, tax condition)
//!     ├── invoice_date, service period (services only)
//!     ├── number_from = number_to = reserved number
//!     ├── net / exempt / untaxed / tax / total
//!     ├── tax lines [{ rate_id, base, amount }]
//!     └── currency "PES", rate 1
//! ```
//!
//! Building a request validates the attempt first, so nothing invalid ever
//! consumes a reserved number.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};
use crate::lifecycle::AttemptState;
use crate::money::Money;
use crate::rejection::{Rejection, RejectionClass};
use crate::types::{
    Concept, DocumentType, ReceiverDocType, ReceiverTaxCondition, TaxpayerId, VatRate,
};
use crate::validation;
use crate::{LOCAL_CURRENCY, LOCAL_CURRENCY_RATE, VOUCHERS_PER_REQUEST};

// =============================================================================
// Amounts
// =============================================================================

/// One line of the VAT breakdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct TaxLine {
    pub rate: VatRate,
    /// Taxable base in cents.
    pub base_cents: i64,
    /// Tax amount in cents.
    pub amount_cents: i64,
}

impl TaxLine {
    /// Builds a line computing the tax from the base.
    pub fn compute(rate: VatRate, base: Money) -> Self {
        TaxLine {
            rate,
            base_cents: base.cents(),
            amount_cents: base.calculate_tax(rate.rate()).cents(),
        }
    }

    pub fn base(&self) -> Money {
        Money::from_cents(self.base_cents)
    }

    pub fn amount(&self) -> Money {
        Money::from_cents(self.amount_cents)
    }
}

/// Invoice totals, all in cents.
///
/// `total = net + exempt + untaxed + tax` and the tax lines add up to
/// `tax`. See [`validation::validate_amounts`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct InvoiceAmounts {
    pub net_cents: i64,
    pub exempt_cents: i64,
    pub untaxed_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
    pub tax_lines: Vec<TaxLine>,
}

impl InvoiceAmounts {
    /// Builds consistent amounts from taxed lines plus exempt and untaxed
    /// components.
    ///
    /// ```rust
    /// use fiscal_core::invoice::{InvoiceAmounts, TaxLine};
    /// use fiscal_core::money::Money;
    /// use fiscal_core::types::VatRate;
    ///
    /// let amounts = InvoiceAmounts::from_lines(
    ///     vec![TaxLine::compute(VatRate::TwentyOne, Money::from_cents(10_000))],
    ///     Money::zero(),
    ///     Money::zero(),
    /// );
    /// assert_eq!(amounts.total().to_wire(), "121.00");
    /// ```
    pub fn from_lines(tax_lines: Vec<TaxLine>, exempt: Money, untaxed: Money) -> Self {
        let net: Money = tax_lines.iter().map(TaxLine::base).sum();
        let tax: Money = tax_lines.iter().map(TaxLine::amount).sum();
        InvoiceAmounts {
            net_cents: net.cents(),
            exempt_cents: exempt.cents(),
            untaxed_cents: untaxed.cents(),
            tax_cents: tax.cents(),
            total_cents: (net + exempt + untaxed + tax).cents(),
            tax_lines,
        }
    }

    /// Amounts of a class C document: a single untaxed net total.
    pub fn without_vat(total: Money) -> Self {
        InvoiceAmounts {
            net_cents: total.cents(),
            exempt_cents: 0,
            untaxed_cents: 0,
            tax_cents: 0,
            total_cents: total.cents(),
            tax_lines: Vec::new(),
        }
    }

    pub fn net(&self) -> Money {
        Money::from_cents(self.net_cents)
    }

    pub fn exempt(&self) -> Money {
        Money::from_cents(self.exempt_cents)
    }

    pub fn untaxed(&self) -> Money {
        Money::from_cents(self.untaxed_cents)
    }

    pub fn tax(&self) -> Money {
        Money::from_cents(self.tax_cents)
    }

    pub fn total(&self) -> Money {
        Money::from_cents(self.total_cents)
    }
}

// =============================================================================
// Receiver
// =============================================================================

/// Who the invoice is issued to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Receiver {
    pub doc_type: ReceiverDocType,
    /// Document number; 0 for an unidentified final consumer.
    pub doc_number: u64,
    /// VAT condition. Optional on input, the authority requires it.
    pub tax_condition: Option<ReceiverTaxCondition>,
}

impl Receiver {
    /// An anonymous final consumer.
    pub fn final_consumer() -> Self {
        Receiver {
            doc_type: ReceiverDocType::Unidentified,
            doc_number: 0,
            tax_condition: Some(ReceiverTaxCondition::FinalConsumer),
        }
    }
}

/// Service period reported by service invoices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ServicePeriod {
    #[ts(as = "String")]
    pub from: NaiveDate,
    #[ts(as = "String")]
    pub to: NaiveDate,
    #[ts(as = "String")]
    pub payment_due: NaiveDate,
}

// =============================================================================
// Invoice Attempt
// =============================================================================

/// Input for creating an attempt from a completed sale.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct NewInvoiceAttempt {
    /// Sale reference; at most one attempt exists per sale.
    pub sale_id: String,
    pub branch_id: String,
    pub document_type: DocumentType,
    pub concept: Concept,
    pub receiver: Receiver,
    pub amounts: InvoiceAmounts,
    pub service_period: Option<ServicePeriod>,
}

/// One authorization attempt for a sale.
///
/// `state` is the single source of truth for what has been sent; the `log`
/// is an append-only audit trail and never drives decisions.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct InvoiceAttempt {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub sale_id: String,
    pub branch_id: String,

    /// Taxpayer configuration resolved when the attempt was created.
    pub taxpayer_config_id: String,
    pub taxpayer_id: TaxpayerId,
    pub point_of_sale: u32,

    pub document_type: DocumentType,
    pub concept: Concept,
    pub receiver: Receiver,
    pub amounts: InvoiceAmounts,
    pub service_period: Option<ServicePeriod>,

    pub state: AttemptState,

    /// Number reserved for the most recent submission, or the authorized
    /// number once completed.
    pub number: Option<i64>,
    pub authorization_code: Option<String>,
    #[ts(as = "Option<String>")]
    pub authorization_expiry: Option<NaiveDate>,
    #[ts(as = "Option<String>")]
    pub invoice_date: Option<NaiveDate>,

    /// Most recent failure, verbatim.
    pub error_message: Option<String>,
    /// Stable code of the most recent rejection.
    pub error_code: Option<i64>,
    pub rejection_class: Option<RejectionClass>,

    /// Times the attempt entered `processing`.
    pub passes: u32,
    /// Times an automated corrective rule re-armed the attempt.
    pub auto_rearms: u32,

    /// Newline separated, timestamped audit lines.
    pub log: String,

    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
    #[ts(as = "Option<String>")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl InvoiceAttempt {
    /// The caller-facing status.
    pub fn status(&self) -> AuthorizationStatus {
        match self.state {
            AttemptState::Pending | AttemptState::Processing => AuthorizationStatus::Pending,
            AttemptState::Completed => AuthorizationStatus::Authorized,
            AttemptState::Error => AuthorizationStatus::Failed,
        }
    }

    /// Collapses the record into what callers outside the subsystem see.
    pub fn to_result(&self) -> AuthorizationResult {
        let reason = match self.state {
            AttemptState::Completed => None,
            AttemptState::Error => self.error_message.clone(),
            AttemptState::Pending | AttemptState::Processing => self
                .error_message
                .clone()
                .or_else(|| Some("awaiting authorization".to_string())),
        };

        AuthorizationResult {
            sale_id: self.sale_id.clone(),
            status: self.status(),
            number: if self.state == AttemptState::Completed {
                self.number
            } else {
                None
            },
            authorization_code: self.authorization_code.clone(),
            authorization_expiry: self.authorization_expiry,
            reason,
        }
    }

    pub fn log_lines(&self) -> impl Iterator<Item = &str> {
        self.log.lines().filter(|l| !l.is_empty())
    }

    /// Whether an automated corrective rule may still re-arm this attempt.
    pub fn is_auto_correctable(&self, rearm_limit: u32) -> bool {
        self.state == AttemptState::Error
            && self.auto_rearms < rearm_limit
            && self
                .rejection_class
                .map(RejectionClass::is_auto_correctable)
                .unwrap_or(false)
    }
}

// =============================================================================
// Caller-Facing Result
// =============================================================================

/// Status reported to callers: pending, authorized or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum AuthorizationStatus {
    Pending,
    Authorized,
    Failed,
}

/// Outcome of `submit_for_authorization`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct AuthorizationResult {
    pub sale_id: String,
    pub status: AuthorizationStatus,
    pub number: Option<i64>,
    pub authorization_code: Option<String>,
    #[ts(as = "Option<String>")]
    pub authorization_expiry: Option<NaiveDate>,
    pub reason: Option<String>,
}

// =============================================================================
// Authorization Request
// =============================================================================

/// Detail of a single-voucher authorization request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationDetail {
    pub concept: Concept,
    pub receiver_doc_type: ReceiverDocType,
    pub receiver_doc_number: u64,
    pub receiver_tax_condition: Option<ReceiverTaxCondition>,
    pub invoice_date: NaiveDate,
    pub service_period: Option<ServicePeriod>,
    pub number_from: i64,
    pub number_to: i64,
    pub amounts: InvoiceAmounts,
    pub currency: &'static str,
    pub currency_rate: &'static str,
}

/// Everything the authorization service needs besides credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub point_of_sale: u32,
    pub document_type: DocumentType,
    pub count: u32,
    pub detail: AuthorizationDetail,
}

impl AuthorizationRequest {
    /// Builds the request for `attempt` under the reserved `number`.
    ///
    /// Validates the attempt's receiver, amounts and service period first.
    pub fn build(
        attempt: &InvoiceAttempt,
        number: i64,
        invoice_date: NaiveDate,
    ) -> CoreResult<Self> {
        if number < 1 {
            return Err(CoreError::IncompleteAuthorization {
                reason: format!("reserved number must be positive, got {}", number),
            });
        }

        validation::validate_point_of_sale(attempt.point_of_sale)?;
        validation::validate_receiver(attempt.document_type, &attempt.receiver)?;
        validation::validate_amounts(attempt.document_type, &attempt.amounts)?;
        validation::validate_service_period(attempt.concept, attempt.service_period.as_ref())?;

        Ok(AuthorizationRequest {
            point_of_sale: attempt.point_of_sale,
            document_type: attempt.document_type,
            count: VOUCHERS_PER_REQUEST,
            detail: AuthorizationDetail {
                concept: attempt.concept,
                receiver_doc_type: attempt.receiver.doc_type,
                receiver_doc_number: attempt.receiver.doc_number,
                receiver_tax_condition: attempt.receiver.tax_condition,
                invoice_date,
                service_period: if attempt.concept.requires_service_period() {
                    attempt.service_period
                } else {
                    None
                },
                number_from: number,
                number_to: number,
                amounts: attempt.amounts.clone(),
                currency: LOCAL_CURRENCY,
                currency_rate: LOCAL_CURRENCY_RATE,
            },
        })
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// An error or observation returned by the authority, kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct RemoteMessage {
    pub code: i64,
    pub message: String,
}

impl RemoteMessage {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        RemoteMessage {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for RemoteMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// An accepted authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Approval {
    pub number: i64,
    pub authorization_code: String,
    pub authorization_expiry: NaiveDate,
    /// Informational observations attached to an accepted voucher.
    pub observations: Vec<RemoteMessage>,
}

/// What one authorization request produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationOutcome {
    Approved(Approval),
    Rejected(Rejection),
}

/// A voucher as recorded by the authority, fetched during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedVoucher {
    pub point_of_sale: u32,
    pub document_type: DocumentType,
    pub number: i64,
    pub receiver_doc_type: ReceiverDocType,
    pub receiver_doc_number: u64,
    pub total: Money,
    pub net: Money,
    pub tax: Money,
    /// VAT breakdown as the authority recorded it; empty when none.
    pub tax_lines: Vec<TaxLine>,
    pub invoice_date: Option<NaiveDate>,
    pub authorization_code: String,
    pub authorization_expiry: NaiveDate,
}

fn sorted_lines(lines: &[TaxLine]) -> Vec<TaxLine> {
    let mut sorted = lines.to_vec();
    sorted.sort_by_key(|l| (l.rate.id(), l.base_cents, l.amount_cents));
    sorted
}

impl AuthorizedVoucher {
    /// Checks that this voucher is the one `attempt` submitted.
    ///
    /// Compares the receiver, the whole amount breakdown and, once the
    /// attempt has submitted, the invoice date. Two vouchers for the same
    /// receiver, breakdown and day are indistinguishable here.
    ///
    /// Returns the first mismatch found, if any.
    pub fn mismatch_with(&self, attempt: &InvoiceAttempt) -> Option<String> {
        if self.document_type != attempt.document_type {
            return Some(format!(
                "document type {:?} differs from {:?}",
                self.document_type, attempt.document_type
            ));
        }
        if self.point_of_sale != attempt.point_of_sale {
            return Some(format!(
                "point of sale {} differs from {}",
                self.point_of_sale, attempt.point_of_sale
            ));
        }
        if self.receiver_doc_type != attempt.receiver.doc_type
            || self.receiver_doc_number != attempt.receiver.doc_number
        {
            return Some(format!(
                "receiver {:?} {} differs from {:?} {}",
                self.receiver_doc_type,
                self.receiver_doc_number,
                attempt.receiver.doc_type,
                attempt.receiver.doc_number
            ));
        }
        if self.total != attempt.amounts.total() {
            return Some(format!(
                "total {} differs from {}",
                self.total.to_wire(),
                attempt.amounts.total().to_wire()
            ));
        }
        if self.net != attempt.amounts.net() || self.tax != attempt.amounts.tax() {
            return Some(format!(
                "net {} tax {} differ from net {} tax {}",
                self.net.to_wire(),
                self.tax.to_wire(),
                attempt.amounts.net().to_wire(),
                attempt.amounts.tax().to_wire()
            ));
        }
        if sorted_lines(&self.tax_lines) != sorted_lines(&attempt.amounts.tax_lines) {
            return Some(format!(
                "{} VAT lines differ from the attempt's {}",
                self.tax_lines.len(),
                attempt.amounts.tax_lines.len()
            ));
        }
        if let (Some(remote), Some(local)) = (self.invoice_date, attempt.invoice_date) {
            if remote != local {
                return Some(format!("invoice date {} differs from {}", remote, local));
            }
        }
        if self.authorization_code.trim().is_empty() {
            return Some("voucher has no authorization code".to_string());
        }
        None
    }

    pub fn into_approval(self) -> Approval {
        Approval {
            number: self.number,
            authorization_code: self.authorization_code,
            authorization_expiry: self.authorization_expiry,
            observations: Vec::new(),
        }
    }
}

// =============================================================================
// Test Fixtures
// =============================================================================


// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::fixtures::attempt;
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_build_request_for_121() {
        let request = AuthorizationRequest::build(&attempt(), 42, date(2026, 3, 2)).unwrap();

        assert_eq!(request.point_of_sale, 3);
        assert_eq!(request.document_type, DocumentType::InvoiceB);
        assert_eq!(request.count, 1);

        let detail = &request.detail;
        assert_eq!(detail.number_from, 42);
        assert_eq!(detail.number_to, 42);
        assert_eq!(detail.amounts.total().to_wire(), "121.00");
        assert_eq!(detail.amounts.net().to_wire(), "100.00");
        assert_eq!(detail.amounts.tax().to_wire(), "21.00");
        assert_eq!(detail.amounts.tax_lines.len(), 1);
        assert_eq!(detail.amounts.tax_lines[0].rate.id(), 5);
        assert_eq!(detail.currency, "PES");
        assert_eq!(detail.currency_rate, "1");
        assert!(detail.service_period.is_none());
    }

    #[test]
    fn test_build_rejects_inconsistent_amounts() {
        let mut a = attempt();
        a.amounts.total_cents = 12_000;
        let err = AuthorizationRequest::build(&a, 1, date(2026, 3, 2)).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn test_build_drops_period_for_products() {
        let mut a = attempt();
        a.service_period = Some(ServicePeriod {
            from: date(2026, 2, 1),
            to: date(2026, 2, 28),
            payment_due: date(2026, 3, 10),
        });
        let request = AuthorizationRequest::build(&a, 1, date(2026, 3, 2)).unwrap();
        assert!(request.detail.service_period.is_none());
    }

    #[test]
    fn test_build_requires_period_for_services() {
        let mut a = attempt();
        a.concept = Concept::Services;
        assert!(AuthorizationRequest::build(&a, 1, date(2026, 3, 2)).is_err());
    }

    #[test]
    fn test_status_mapping() {
        let mut a = attempt();
        assert_eq!(a.status(), AuthorizationStatus::Pending);
        assert_eq!(a.to_result().reason.as_deref(), Some("awaiting authorization"));

        a.state = AttemptState::Error;
        a.error_message = Some("10242: falta condicion".to_string());
        let result = a.to_result();
        assert_eq!(result.status, AuthorizationStatus::Failed);
        assert_eq!(result.reason.as_deref(), Some("10242: falta condicion"));
        assert_eq!(result.number, None);

        a.state = AttemptState::Completed;
        a.number = Some(42);
        a.authorization_code = Some("76123456789012".to_string());
        let result = a.to_result();
        assert_eq!(result.status, AuthorizationStatus::Authorized);
        assert_eq!(result.number, Some(42));
        assert!(result.reason.is_none());
    }

    fn voucher_for_121() -> AuthorizedVoucher {
        AuthorizedVoucher {
            point_of_sale: 3,
            document_type: DocumentType::InvoiceB,
            number: 42,
            receiver_doc_type: ReceiverDocType::Unidentified,
            receiver_doc_number: 0,
            total: Money::from_cents(12_100),
            net: Money::from_cents(10_000),
            tax: Money::from_cents(2_100),
            tax_lines: vec![TaxLine::compute(VatRate::TwentyOne, Money::from_cents(10_000))],
            invoice_date: Some(date(2026, 3, 2)),
            authorization_code: "76123456789012".to_string(),
            authorization_expiry: date(2026, 3, 12),
        }
    }

    #[test]
    fn test_voucher_match() {
        let a = attempt();
        let voucher = voucher_for_121();
        assert!(voucher.mismatch_with(&a).is_none());

        let other = AuthorizedVoucher {
            total: Money::from_cents(5_000),
            ..voucher
        };
        let reason = other.mismatch_with(&a).unwrap();
        assert!(reason.contains("total 50.00"));
    }

    #[test]
    fn test_same_total_different_breakdown_is_not_ours() {
        let a = attempt();

        // 121.00 with no VAT at all: same receiver, same total.
        let untaxed = AuthorizedVoucher {
            net: Money::from_cents(12_100),
            tax: Money::zero(),
            tax_lines: Vec::new(),
            ..voucher_for_121()
        };
        let reason = untaxed.mismatch_with(&a).unwrap();
        assert!(reason.contains("net 121.00 tax 0.00"));

        // Same net and tax split over a different rate.
        let other_rate = AuthorizedVoucher {
            tax_lines: vec![TaxLine {
                rate: VatRate::TenPointFive,
                base_cents: 10_000,
                amount_cents: 2_100,
            }],
            ..voucher_for_121()
        };
        assert!(other_rate.mismatch_with(&a).unwrap().contains("VAT lines"));
    }

    #[test]
    fn test_voucher_from_another_day_is_not_ours() {
        let mut a = attempt();
        a.invoice_date = Some(date(2026, 3, 3));
        let reason = voucher_for_121().mismatch_with(&a).unwrap();
        assert!(reason.contains("invoice date 2026-03-02"));

        // Before any submission there is no local date to compare.
        a.invoice_date = None;
        assert!(voucher_for_121().mismatch_with(&a).is_none());
    }

    #[test]
    fn test_auto_correctable_is_one_shot() {
        let mut a = attempt();
        a.state = AttemptState::Error;
        a.rejection_class = Some(RejectionClass::MissingReceiverTaxCondition);
        assert!(a.is_auto_correctable(1));

        a.auto_rearms = 1;
        assert!(!a.is_auto_correctable(1));

        a.auto_rearms = 0;
        a.rejection_class = Some(RejectionClass::Permanent);
        assert!(!a.is_auto_correctable(1));
    }
}
