//! # Validation Module
//!
//! Business rule validation, run before anything reaches the authority.
//!
//! ## Validation Rules
//!
//! ### CUIT
//! - Exactly 11 ASCII digits
//! - Check digit: weights `5 4 3 2 7 6 5 4 3 2`, `11 - (sum mod 11)`,
//!   where 11 maps to 0 and 10 is never valid
//!
//! ### Amounts
//! - No negative component
//! - `total = net + exempt + untaxed + tax`
//! - Tax lines add up to `tax`; their bases add up to `net`
//! - Each line's amount matches its rate within one cent
//! - Class C documents carry no VAT at all
//!
//! ### Receiver
//! - Unidentified consumers use document number 0
//! - CUIT receivers carry a valid CUIT
//! - Class A documents require a CUIT receiver

use crate::error::ValidationError;
use crate::invoice::{InvoiceAmounts, NewInvoiceAttempt, Receiver, ServicePeriod};
use crate::money::Money;
use crate::types::{Concept, DocumentClass, DocumentType, ReceiverDocType, ReceiverTaxCondition};
use crate::MAX_POINT_OF_SALE;

const CUIT_WEIGHTS: [u32; 10] = [5, 4, 3, 2, 7, 6, 5, 4, 3, 2];

/// Highest DNI number in use, with headroom.
const MAX_DNI: u64 = 99_999_999;

// =============================================================================
// Identifier Validation
// =============================================================================

/// Validates an 11-digit CUIT including its check digit.
pub fn validate_cuit(digits: &str) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidFormat {
        field: "cuit".to_string(),
        reason: reason.to_string(),
    };

    if digits.len() != 11 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("must be exactly 11 digits"));
    }

    let values: Vec<u32> = digits.bytes().map(|b| (b - b'0') as u32).collect();
    let sum: u32 = values
        .iter()
        .zip(CUIT_WEIGHTS.iter())
        .map(|(d, w)| d * w)
        .sum();

    let expected = match 11 - (sum % 11) {
        11 => 0,
        10 => return Err(invalid("no valid check digit exists for this prefix")),
        n => n,
    };

    if values[10] != expected {
        return Err(invalid("check digit does not match"));
    }
    Ok(())
}

/// Validates a point-of-sale number.
pub fn validate_point_of_sale(point_of_sale: u32) -> Result<(), ValidationError> {
    if point_of_sale == 0 || point_of_sale > MAX_POINT_OF_SALE {
        return Err(ValidationError::OutOfRange {
            field: "point_of_sale".to_string(),
            min: 1,
            max: MAX_POINT_OF_SALE as i64,
        });
    }
    Ok(())
}

// =============================================================================
// Receiver Validation
// =============================================================================

/// Validates the receiver against the document class.
pub fn validate_receiver(
    document_type: DocumentType,
    receiver: &Receiver,
) -> Result<(), ValidationError> {
    match receiver.doc_type {
        ReceiverDocType::Unidentified => {
            if receiver.doc_number != 0 {
                return Err(ValidationError::not_allowed(
                    "receiver.doc_number",
                    "must be 0 for an unidentified receiver",
                ));
            }
        }
        ReceiverDocType::Cuit | ReceiverDocType::Cuil => {
            validate_cuit(&format!("{:011}", receiver.doc_number))?;
        }
        ReceiverDocType::Dni => {
            if receiver.doc_number == 0 || receiver.doc_number > MAX_DNI {
                return Err(ValidationError::OutOfRange {
                    field: "receiver.doc_number".to_string(),
                    min: 1,
                    max: MAX_DNI as i64,
                });
            }
        }
    }

    if document_type.class() == DocumentClass::A {
        if receiver.doc_type != ReceiverDocType::Cuit {
            return Err(ValidationError::not_allowed(
                "receiver.doc_type",
                "class A documents require a CUIT receiver",
            ));
        }
        if receiver.tax_condition == Some(ReceiverTaxCondition::FinalConsumer) {
            return Err(ValidationError::not_allowed(
                "receiver.tax_condition",
                "class A documents cannot be issued to a final consumer",
            ));
        }
    }

    Ok(())
}

// =============================================================================
// Amount Validation
// =============================================================================

fn non_negative(field: &str, cents: i64) -> Result<(), ValidationError> {
    if cents < 0 {
        return Err(ValidationError::Negative {
            field: field.to_string(),
        });
    }
    Ok(())
}

/// Sums amounts, rejecting input whose sum does not fit in cents.
fn checked_sum(
    field: &str,
    amounts: impl IntoIterator<Item = Money>,
) -> Result<Money, ValidationError> {
    amounts
        .into_iter()
        .try_fold(Money::zero(), |acc, m| acc.checked_add(m))
        .ok_or_else(|| ValidationError::OutOfRange {
            field: field.to_string(),
            min: 0,
            max: i64::MAX,
        })
}

fn must_equal(field: &str, expected: Money, actual: Money) -> Result<(), ValidationError> {
    if expected != actual {
        return Err(ValidationError::Mismatch {
            field: field.to_string(),
            expected: expected.to_wire(),
            actual: actual.to_wire(),
        });
    }
    Ok(())
}

/// Validates that the amounts are internally consistent.
pub fn validate_amounts(
    document_type: DocumentType,
    amounts: &InvoiceAmounts,
) -> Result<(), ValidationError> {
    non_negative("net", amounts.net_cents)?;
    non_negative("exempt", amounts.exempt_cents)?;
    non_negative("untaxed", amounts.untaxed_cents)?;
    non_negative("tax", amounts.tax_cents)?;

    if amounts.total_cents <= 0 {
        return Err(ValidationError::not_allowed("total", "must be greater than zero"));
    }

    let components = checked_sum(
        "total",
        [amounts.net(), amounts.exempt(), amounts.untaxed(), amounts.tax()],
    )?;
    must_equal("total", components, amounts.total())?;

    if document_type.class() == DocumentClass::C {
        if !amounts.tax_lines.is_empty() || amounts.tax_cents != 0 {
            return Err(ValidationError::not_allowed(
                "tax_lines",
                "class C documents do not itemize VAT",
            ));
        }
        if amounts.exempt_cents != 0 || amounts.untaxed_cents != 0 {
            return Err(ValidationError::not_allowed(
                "exempt",
                "class C documents report a single net amount",
            ));
        }
        return Ok(());
    }

    if amounts.net_cents > 0 && amounts.tax_lines.is_empty() {
        return Err(ValidationError::required("tax_lines"));
    }

    for line in &amounts.tax_lines {
        non_negative("tax_lines.base", line.base_cents)?;
        non_negative("tax_lines.amount", line.amount_cents)?;

        let expected = line.base().calculate_tax(line.rate.rate());
        if (expected - line.amount()).abs().cents() > 1 {
            return Err(ValidationError::Mismatch {
                field: format!("tax_lines[{}].amount", line.rate.id()),
                expected: expected.to_wire(),
                actual: line.amount().to_wire(),
            });
        }
    }

    let tax_sum = checked_sum("tax", amounts.tax_lines.iter().map(|l| l.amount()))?;
    must_equal("tax", tax_sum, amounts.tax())?;

    let base_sum = checked_sum("net", amounts.tax_lines.iter().map(|l| l.base()))?;
    must_equal("net", base_sum, amounts.net())?;

    Ok(())
}

// =============================================================================
// Period Validation
// =============================================================================

/// Services need a well-ordered service period.
pub fn validate_service_period(
    concept: Concept,
    period: Option<&ServicePeriod>,
) -> Result<(), ValidationError> {
    if !concept.requires_service_period() {
        return Ok(());
    }
    let period = period.ok_or_else(|| ValidationError::required("service_period"))?;
    if period.from > period.to {
        return Err(ValidationError::not_allowed(
            "service_period",
            "start date is after end date",
        ));
    }
    Ok(())
}

// =============================================================================
// Attempt Validation
// =============================================================================

fn required_text(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::required(field));
    }
    Ok(())
}

/// Validates a new attempt before it is stored.
pub fn validate_new_attempt(input: &NewInvoiceAttempt) -> Result<(), ValidationError> {
    required_text("sale_id", &input.sale_id)?;
    required_text("branch_id", &input.branch_id)?;
    validate_receiver(input.document_type, &input.receiver)?;
    validate_amounts(input.document_type, &input.amounts)?;
    validate_service_period(input.concept, input.service_period.as_ref())?;
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoice::TaxLine;
    use crate::types::VatRate;
    use chrono::NaiveDate;

    fn amounts_121() -> InvoiceAmounts {
        InvoiceAmounts::from_lines(
            vec![TaxLine::compute(VatRate::TwentyOne, Money::from_cents(10_000))],
            Money::zero(),
            Money::zero(),
        )
    }

    #[test]
    fn test_valid_cuits() {
        for cuit in ["20111111112", "20123456786", "30712345671", "20333333334"] {
            assert!(validate_cuit(cuit).is_ok(), "{}", cuit);
        }
    }

    #[test]
    fn test_invalid_cuits() {
        assert!(validate_cuit("20111111113").is_err());
        assert!(validate_cuit("2011111111").is_err());
        assert!(validate_cuit("2011111111a").is_err());
        assert!(validate_cuit("").is_err());
    }

    #[test]
    fn test_point_of_sale_range() {
        assert!(validate_point_of_sale(1).is_ok());
        assert!(validate_point_of_sale(99_998).is_ok());
        assert!(validate_point_of_sale(0).is_err());
        assert!(validate_point_of_sale(99_999).is_err());
    }

    #[test]
    fn test_amounts_121_are_valid() {
        assert!(validate_amounts(DocumentType::InvoiceB, &amounts_121()).is_ok());
    }

    #[test]
    fn test_total_mismatch() {
        let mut amounts = amounts_121();
        amounts.total_cents = 12_101;
        let err = validate_amounts(DocumentType::InvoiceB, &amounts).unwrap_err();
        assert!(matches!(err, ValidationError::Mismatch { ref field, .. } if field == "total"));
    }

    #[test]
    fn test_tax_line_amount_tolerance() {
        let mut amounts = amounts_121();
        amounts.tax_lines[0].amount_cents = 2_101;
        amounts.tax_cents = 2_101;
        amounts.total_cents = 12_101;
        assert!(validate_amounts(DocumentType::InvoiceB, &amounts).is_ok());

        amounts.tax_lines[0].amount_cents = 2_150;
        amounts.tax_cents = 2_150;
        amounts.total_cents = 12_150;
        assert!(validate_amounts(DocumentType::InvoiceB, &amounts).is_err());
    }

    #[test]
    fn test_overflowing_amounts_are_rejected() {
        let mut amounts = amounts_121();
        amounts.net_cents = i64::MAX;
        amounts.tax_cents = 1;
        let err = validate_amounts(DocumentType::InvoiceB, &amounts).unwrap_err();
        assert!(matches!(err, ValidationError::OutOfRange { ref field, .. } if field == "total"));

        // Each line is fine on its own; the bases do not fit in one sum.
        let half = Money::from_cents(i64::MAX / 2 + 1);
        let line = TaxLine::compute(VatRate::TwentyOne, half);
        let mut amounts = amounts_121();
        amounts.tax_lines = vec![line, line];
        amounts.net_cents = 0;
        amounts.tax_cents = line.amount_cents * 2;
        amounts.total_cents = amounts.tax_cents;
        let err = validate_amounts(DocumentType::InvoiceB, &amounts).unwrap_err();
        assert!(matches!(err, ValidationError::OutOfRange { ref field, .. } if field == "net"));
    }

    #[test]
    fn test_missing_tax_lines() {
        let mut amounts = amounts_121();
        amounts.tax_lines.clear();
        assert!(validate_amounts(DocumentType::InvoiceB, &amounts).is_err());
    }

    #[test]
    fn test_class_c_has_no_vat() {
        let plain = InvoiceAmounts::without_vat(Money::from_cents(12_100));
        assert!(validate_amounts(DocumentType::InvoiceC, &plain).is_ok());
        assert!(validate_amounts(DocumentType::InvoiceC, &amounts_121()).is_err());
    }

    #[test]
    fn test_negative_component() {
        let mut amounts = amounts_121();
        amounts.exempt_cents = -100;
        amounts.total_cents = 12_000;
        assert!(matches!(
            validate_amounts(DocumentType::InvoiceB, &amounts),
            Err(ValidationError::Negative { .. })
        ));
    }

    #[test]
    fn test_receiver_rules() {
        assert!(validate_receiver(DocumentType::InvoiceB, &Receiver::final_consumer()).is_ok());

        let anonymous_with_number = Receiver {
            doc_number: 123,
            ..Receiver::final_consumer()
        };
        assert!(validate_receiver(DocumentType::InvoiceB, &anonymous_with_number).is_err());

        let company = Receiver {
            doc_type: ReceiverDocType::Cuit,
            doc_number: 30_712_345_671,
            tax_condition: Some(ReceiverTaxCondition::RegisteredTaxpayer),
        };
        assert!(validate_receiver(DocumentType::InvoiceA, &company).is_ok());

        let bad_cuit = Receiver {
            doc_number: 30_712_345_670,
            ..company.clone()
        };
        assert!(validate_receiver(DocumentType::InvoiceA, &bad_cuit).is_err());

        assert!(validate_receiver(DocumentType::InvoiceA, &Receiver::final_consumer()).is_err());
    }

    #[test]
    fn test_service_period() {
        let d = |day| NaiveDate::from_ymd_opt(2026, 2, day).unwrap();
        let ok = ServicePeriod {
            from: d(1),
            to: d(28),
            payment_due: d(28),
        };
        let reversed = ServicePeriod {
            from: d(28),
            to: d(1),
            payment_due: d(28),
        };

        assert!(validate_service_period(Concept::Products, None).is_ok());
        assert!(validate_service_period(Concept::Services, None).is_err());
        assert!(validate_service_period(Concept::Services, Some(&ok)).is_ok());
        assert!(validate_service_period(Concept::Services, Some(&reversed)).is_err());
    }

    #[test]
    fn test_new_attempt_requires_sale_id() {
        let input = NewInvoiceAttempt {
            sale_id: "  ".to_string(),
            branch_id: "branch-1".to_string(),
            document_type: DocumentType::InvoiceB,
            concept: Concept::Products,
            receiver: Receiver::final_consumer(),
            amounts: amounts_121(),
            service_period: None,
        };
        assert!(matches!(
            validate_new_attempt(&input),
            Err(ValidationError::Required { .. })
        ));
    }
}
