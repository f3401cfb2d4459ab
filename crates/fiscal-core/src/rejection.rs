//! # Rejection Classification
//!
//! Maps the authority's rejection codes to a [`RejectionClass`] that decides
//! what happens next.
//!
//! ## Lookup Order
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │  1. Code table     stable numeric codes, the primary key           │
//! │  2. Phrase table   lowercase substrings of the message, only for   │
//! │                    codes the code table does not know              │
//! │  3. Default        Permanent (never retried automatically)         │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A rejection carrying several messages takes the class of the most
//! actionable one: an out-of-sequence number wins (it needs reconciliation
//! first), then expired credentials; otherwise an auto-correctable class
//! applies only when every message agrees on it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use ts_rs::TS;

use crate::invoice::{InvoiceAttempt, RemoteMessage};
use crate::types::{DocumentClass, ReceiverTaxCondition};

/// What a rejection means for the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum RejectionClass {
    /// The receiver's VAT condition is missing or rejected. A corrective
    /// rule can infer it and re-arm once.
    MissingReceiverTaxCondition,
    /// The number is not the next one the authority expects. The voucher may
    /// already exist remotely, so the attempt goes through reconciliation.
    NumberOutOfSequence,
    /// The token or signature was refused. Renew the session and retry.
    ExpiredCredentials,
    /// Anything else. Needs an operator.
    Permanent,
}

impl RejectionClass {
    pub const ALL: [RejectionClass; 4] = [
        RejectionClass::MissingReceiverTaxCondition,
        RejectionClass::NumberOutOfSequence,
        RejectionClass::ExpiredCredentials,
        RejectionClass::Permanent,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            RejectionClass::MissingReceiverTaxCondition => "missing_receiver_tax_condition",
            RejectionClass::NumberOutOfSequence => "number_out_of_sequence",
            RejectionClass::ExpiredCredentials => "expired_credentials",
            RejectionClass::Permanent => "permanent",
        }
    }

    /// A corrective rule may fix the attempt's content and re-arm it.
    pub const fn is_auto_correctable(self) -> bool {
        matches!(self, RejectionClass::MissingReceiverTaxCondition)
    }

    /// Resubmitting unchanged may succeed.
    pub const fn is_retryable(self) -> bool {
        matches!(self, RejectionClass::ExpiredCredentials)
    }

    fn priority(self) -> u8 {
        match self {
            RejectionClass::NumberOutOfSequence => 3,
            RejectionClass::ExpiredCredentials => 2,
            RejectionClass::MissingReceiverTaxCondition => 1,
            RejectionClass::Permanent => 0,
        }
    }
}

impl fmt::Display for RejectionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Rejection
// =============================================================================

/// A business rejection: every message the authority returned, verbatim,
/// plus its classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub messages: Vec<RemoteMessage>,
    pub class: RejectionClass,
    /// Code of the message that decided the class.
    pub code: Option<i64>,
}

impl Rejection {
    /// Human-readable cause: all messages joined in the order received.
    pub fn cause(&self) -> String {
        if self.messages.is_empty() {
            return "rejected without a reason".to_string();
        }
        self.messages
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

// =============================================================================
// Classification Table
// =============================================================================

/// One known code.
#[derive(Debug, Clone)]
pub struct RejectionRule {
    pub class: RejectionClass,
    pub description: &'static str,
}

/// Extensible table of rejection codes and fallback phrases.
#[derive(Debug, Clone)]
pub struct RejectionTable {
    by_code: HashMap<i64, RejectionRule>,
    phrases: Vec<(String, RejectionClass)>,
}

impl RejectionTable {
    /// Empty table: every rejection classifies as [`RejectionClass::Permanent`].
    pub fn empty() -> Self {
        RejectionTable {
            by_code: HashMap::new(),
            phrases: Vec::new(),
        }
    }

    /// The codes the authorization service is known to return.
    pub fn standard() -> Self {
        let mut table = Self::empty();

        table
            .register(
                10016,
                RejectionClass::NumberOutOfSequence,
                "number or date is not the next to authorize",
            )
            .register(
                10242,
                RejectionClass::MissingReceiverTaxCondition,
                "receiver VAT condition is mandatory",
            )
            .register(
                10246,
                RejectionClass::MissingReceiverTaxCondition,
                "receiver VAT condition is mandatory under RG 5616",
            )
            .register(
                10243,
                RejectionClass::Permanent,
                "receiver VAT condition not valid for the document class",
            )
            .register(
                600,
                RejectionClass::ExpiredCredentials,
                "token dates did not validate",
            )
            .register(
                601,
                RejectionClass::Permanent,
                "represented CUIT not included in the token",
            )
            .register(10013, RejectionClass::Permanent, "receiver document is invalid")
            .register(10015, RejectionClass::Permanent, "receiver CUIT is not registered")
            .register(10048, RejectionClass::Permanent, "total does not match its components")
            .register(10070, RejectionClass::Permanent, "VAT breakdown does not match the VAT total");

        table
            .register_phrase("condicion frente al iva", RejectionClass::MissingReceiverTaxCondition)
            .register_phrase("condición frente al iva", RejectionClass::MissingReceiverTaxCondition)
            .register_phrase("condicionivareceptor", RejectionClass::MissingReceiverTaxCondition)
            .register_phrase("proximo a autorizar", RejectionClass::NumberOutOfSequence)
            .register_phrase("próximo a autorizar", RejectionClass::NumberOutOfSequence);

        table
    }

    /// Adds or replaces a code.
    pub fn register(
        &mut self,
        code: i64,
        class: RejectionClass,
        description: &'static str,
    ) -> &mut Self {
        self.by_code.insert(code, RejectionRule { class, description });
        self
    }

    /// Adds a fallback phrase, matched case-insensitively.
    pub fn register_phrase(&mut self, phrase: &str, class: RejectionClass) -> &mut Self {
        self.phrases.push((phrase.to_lowercase(), class));
        self
    }

    pub fn rule(&self, code: i64) -> Option<&RejectionRule> {
        self.by_code.get(&code)
    }

    /// Classifies a single message.
    pub fn classify_message(&self, message: &RemoteMessage) -> RejectionClass {
        if let Some(rule) = self.by_code.get(&message.code) {
            return rule.class;
        }
        let text = message.message.to_lowercase();
        self.phrases
            .iter()
            .find(|(phrase, _)| text.contains(phrase.as_str()))
            .map(|(_, class)| *class)
            .unwrap_or(RejectionClass::Permanent)
    }

    /// Classifies the full set of messages of one rejection.
    pub fn classify(&self, messages: Vec<RemoteMessage>) -> Rejection {
        let classified: Vec<(RejectionClass, i64)> = messages
            .iter()
            .map(|m| (self.classify_message(m), m.code))
            .collect();

        let winner = classified
            .iter()
            .copied()
            .max_by_key(|(class, _)| class.priority());

        let (class, code) = match winner {
            None => (RejectionClass::Permanent, None),
            Some((class, code)) if class.is_auto_correctable() => {
                if classified.iter().all(|(c, _)| *c == class) {
                    (class, Some(code))
                } else {
                    let first_permanent = classified
                        .iter()
                        .find(|(c, _)| *c == RejectionClass::Permanent)
                        .map(|(_, code)| *code);
                    (RejectionClass::Permanent, first_permanent.or(Some(code)))
                }
            }
            Some((class, code)) => (class, Some(code)),
        };

        Rejection {
            messages,
            class,
            code,
        }
    }
}

impl Default for RejectionTable {
    fn default() -> Self {
        Self::standard()
    }
}

// =============================================================================
// Corrective Rules
// =============================================================================

/// A change an automated rule applies before re-arming an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correction {
    SetReceiverTaxCondition(ReceiverTaxCondition),
}

impl Correction {
    pub fn apply(self, attempt: &mut InvoiceAttempt) {
        match self {
            Correction::SetReceiverTaxCondition(condition) => {
                attempt.receiver.tax_condition = Some(condition);
            }
        }
    }

    pub fn describe(self) -> String {
        match self {
            Correction::SetReceiverTaxCondition(condition) => format!(
                "receiver tax condition set to {:?} ({})",
                condition,
                condition.code()
            ),
        }
    }
}

/// The VAT condition implied by the document class.
///
/// Class A is only issued to registered taxpayers; B and C default to a
/// final consumer.
pub fn infer_receiver_tax_condition(class: DocumentClass) -> ReceiverTaxCondition {
    match class {
        DocumentClass::A => ReceiverTaxCondition::RegisteredTaxpayer,
        DocumentClass::B | DocumentClass::C => ReceiverTaxCondition::FinalConsumer,
    }
}

/// The correction for an attempt rejected with an auto-correctable class.
///
/// Returns `None` when the rejection is not auto-correctable or the inferred
/// value is already what was sent.
pub fn correction_for(attempt: &InvoiceAttempt) -> Option<Correction> {
    match attempt.rejection_class? {
        RejectionClass::MissingReceiverTaxCondition => {
            let inferred = infer_receiver_tax_condition(attempt.document_type.class());
            if attempt.receiver.tax_condition == Some(inferred) {
                None
            } else {
                Some(Correction::SetReceiverTaxCondition(inferred))
            }
        }
        _ => None,
    }
}
