//! # Domain Types
//!
//! Identifiers and the authority's code tables used throughout the
//! fiscal authorization subsystem.
//!
//! ## Type Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │   TaxpayerId    │   │  DocumentType   │   │    VatRate      │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  11-digit CUIT  │   │  1  Invoice A   │   │  3  0%          │       │
//! │  │  mod-11 check   │   │  6  Invoice B   │   │  4  10.5%       │       │
//! │  └─────────────────┘   │  11 Invoice C   │   │  5  21%         │       │
//! │                        │  ... notes      │   │  6  27%         │       │
//! │  ┌─────────────────┐   └─────────────────┘   └─────────────────┘       │
//! │  │ TaxpayerConfig  │                                                    │
//! │  │  ─────────────  │   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │  branch_id      │   │ ReceiverDocType │   │ReceiverTaxCond. │       │
//! │  │  point_of_sale  │   │  80 CUIT        │   │  1 Registered   │       │
//! │  │  active flag    │   │  96 DNI         │   │  5 Final cons.  │       │
//! │  └─────────────────┘   │  99 Unidentified│   │  6 Monotax      │       │
//! │                        └─────────────────┘   └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Numeric codes are the authority's own. They are stored as integers and
//! sent on the wire unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::validation::validate_cuit;

// =============================================================================
// Tax Rate
// =============================================================================

/// Tax rate represented in basis points (bps).
///
/// 1 basis point = 0.01%, so 2100 bps = 21%.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct TaxRate(u32);

impl TaxRate {
    /// Creates a tax rate from basis points.
    #[inline]
    pub const fn from_bps(bps: u32) -> Self {
        TaxRate(bps)
    }

    /// Returns the rate in basis points.
    #[inline]
    pub const fn bps(&self) -> u32 {
        self.0
    }

    /// Zero tax rate.
    #[inline]
    pub const fn zero() -> Self {
        TaxRate(0)
    }
}

impl Default for TaxRate {
    fn default() -> Self {
        TaxRate::zero()
    }
}

// =============================================================================
// Taxpayer Identifier
// =============================================================================

/// A taxpayer's fiscal identifier (CUIT): eleven digits with a mod-11
/// check digit.
///
/// The constructor strips the usual `20-12345678-6` separators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[serde(try_from = "String", into = "String")]
#[ts(export)]
pub struct TaxpayerId(String);

impl TaxpayerId {
    /// Parses and validates a CUIT.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let digits: String = raw.chars().filter(|c| *c != '-' && *c != ' ').collect();
        validate_cuit(&digits)?;
        Ok(TaxpayerId(digits))
    }

    /// The eleven digits, without separators.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric form, as the authority's `Cuit` element expects.
    pub fn as_u64(&self) -> u64 {
        // validated as eleven ASCII digits on construction
        self.0.bytes().fold(0u64, |acc, b| acc * 10 + (b - b'0') as u64)
    }
}

impl fmt::Display for TaxpayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TaxpayerId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        TaxpayerId::parse(&value)
    }
}

impl From<TaxpayerId> for String {
    fn from(id: TaxpayerId) -> Self {
        id.0
    }
}

// =============================================================================
// Document Type
// =============================================================================

/// Letter class of a fiscal document.
///
/// The class decides whether VAT is itemized (A), included (B) or absent (C).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
pub enum DocumentClass {
    A,
    B,
    C,
}

/// Fiscal document type, with the authority's numeric code as discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
#[ts(export)]
pub enum DocumentType {
    InvoiceA = 1,
    DebitNoteA = 2,
    CreditNoteA = 3,
    InvoiceB = 6,
    DebitNoteB = 7,
    CreditNoteB = 8,
    InvoiceC = 11,
    DebitNoteC = 12,
    CreditNoteC = 13,
}

impl DocumentType {
    /// All supported document types.
    pub const ALL: [DocumentType; 9] = [
        DocumentType::InvoiceA,
        DocumentType::DebitNoteA,
        DocumentType::CreditNoteA,
        DocumentType::InvoiceB,
        DocumentType::DebitNoteB,
        DocumentType::CreditNoteB,
        DocumentType::InvoiceC,
        DocumentType::DebitNoteC,
        DocumentType::CreditNoteC,
    ];

    /// The authority's numeric code.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Looks up a document type by the authority's code.
    pub fn from_code(code: i64) -> CoreResult<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.code() as i64 == code)
            .ok_or(CoreError::UnknownCode {
                kind: "document type",
                code,
            })
    }

    /// The document's letter class.
    pub const fn class(self) -> DocumentClass {
        match self {
            DocumentType::InvoiceA | DocumentType::DebitNoteA | DocumentType::CreditNoteA => {
                DocumentClass::A
            }
            DocumentType::InvoiceB | DocumentType::DebitNoteB | DocumentType::CreditNoteB => {
                DocumentClass::B
            }
            DocumentType::InvoiceC | DocumentType::DebitNoteC | DocumentType::CreditNoteC => {
                DocumentClass::C
            }
        }
    }
}

// =============================================================================
// Concept
// =============================================================================

/// What the invoice covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
#[ts(export)]
pub enum Concept {
    Products = 1,
    Services = 2,
    ProductsAndServices = 3,
}

impl Concept {
    pub const fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i64) -> CoreResult<Self> {
        match code {
            1 => Ok(Concept::Products),
            2 => Ok(Concept::Services),
            3 => Ok(Concept::ProductsAndServices),
            _ => Err(CoreError::UnknownCode {
                kind: "concept",
                code,
            }),
        }
    }

    /// Services must report the service period and payment due date.
    pub const fn requires_service_period(self) -> bool {
        !matches!(self, Concept::Products)
    }
}

// =============================================================================
// Receiver Document Type
// =============================================================================

/// How the invoice receiver is identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
#[ts(export)]
pub enum ReceiverDocType {
    Cuit = 80,
    Cuil = 86,
    Dni = 96,
    /// Anonymous final consumer; the document number must be 0.
    Unidentified = 99,
}

impl ReceiverDocType {
    pub const fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i64) -> CoreResult<Self> {
        match code {
            80 => Ok(ReceiverDocType::Cuit),
            86 => Ok(ReceiverDocType::Cuil),
            96 => Ok(ReceiverDocType::Dni),
            99 => Ok(ReceiverDocType::Unidentified),
            _ => Err(CoreError::UnknownCode {
                kind: "receiver document type",
                code,
            }),
        }
    }
}

// =============================================================================
// Receiver Tax Condition
// =============================================================================

/// The receiver's VAT condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
#[ts(export)]
pub enum ReceiverTaxCondition {
    RegisteredTaxpayer = 1,
    Exempt = 4,
    FinalConsumer = 5,
    Monotax = 6,
    Uncategorized = 7,
    SocialMonotax = 13,
    PromotedIndependentWorker = 16,
}

impl ReceiverTaxCondition {
    pub const fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i64) -> CoreResult<Self> {
        match code {
            1 => Ok(ReceiverTaxCondition::RegisteredTaxpayer),
            4 => Ok(ReceiverTaxCondition::Exempt),
            5 => Ok(ReceiverTaxCondition::FinalConsumer),
            6 => Ok(ReceiverTaxCondition::Monotax),
            7 => Ok(ReceiverTaxCondition::Uncategorized),
            13 => Ok(ReceiverTaxCondition::SocialMonotax),
            16 => Ok(ReceiverTaxCondition::PromotedIndependentWorker),
            _ => Err(CoreError::UnknownCode {
                kind: "receiver tax condition",
                code,
            }),
        }
    }
}

// =============================================================================
// VAT Rate
// =============================================================================

/// VAT rates with the authority's rate identifier as discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
#[ts(export)]
pub enum VatRate {
    Zero = 3,
    TenPointFive = 4,
    TwentyOne = 5,
    TwentySeven = 6,
    Five = 8,
    TwoPointFive = 9,
}

impl VatRate {
    pub const fn id(self) -> i32 {
        self as i32
    }

    pub fn from_id(id: i64) -> CoreResult<Self> {
        match id {
            3 => Ok(VatRate::Zero),
            4 => Ok(VatRate::TenPointFive),
            5 => Ok(VatRate::TwentyOne),
            6 => Ok(VatRate::TwentySeven),
            8 => Ok(VatRate::Five),
            9 => Ok(VatRate::TwoPointFive),
            _ => Err(CoreError::UnknownCode {
                kind: "VAT rate",
                code: id,
            }),
        }
    }

    /// The rate as basis points.
    pub const fn rate(self) -> TaxRate {
        match self {
            VatRate::Zero => TaxRate::from_bps(0),
            VatRate::TenPointFive => TaxRate::from_bps(1_050),
            VatRate::TwentyOne => TaxRate::from_bps(2_100),
            VatRate::TwentySeven => TaxRate::from_bps(2_700),
            VatRate::Five => TaxRate::from_bps(500),
            VatRate::TwoPointFive => TaxRate::from_bps(250),
        }
    }
}

// =============================================================================
// Taxpayer Configuration
// =============================================================================

/// Fiscal identity used by one branch of the business.
///
/// At most one configuration is active per branch. Registering a new one
/// deactivates the previous configuration for that branch.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct TaxpayerConfig {
    /// Unique identifier (UUID v4).
    pub id: String,

    /// Branch (store) this configuration applies to.
    pub branch_id: String,

    /// Taxpayer CUIT.
    pub taxpayer_id: TaxpayerId,

    /// Point of sale registered with the authority for electronic invoices.
    pub point_of_sale: u32,

    /// Registered legal name, for diagnostics only.
    pub legal_name: Option<String>,

    /// Whether this is the branch's current configuration.
    pub active: bool,

    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,

    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Authentication Session
// =============================================================================

/// A session ticket issued by the authentication service for one taxpayer.
///
/// Token and signature are opaque. A session is never used past
/// `expires_at`; callers renew before `expires_at - margin`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub taxpayer_id: TaxpayerId,
    pub token: String,
    pub sign: String,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AuthSession {
    /// Whether the session stays valid for at least `margin` after `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        self.expires_at - margin > now
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> chrono::Duration {
        (self.expires_at - now).max(chrono::Duration::zero())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
