//! # fiscal-core: Pure Logic for Electronic Invoice Authorization
//!
//! This crate is the **heart** of the fiscal authorization subsystem. It
//! contains the invoice model, the attempt lifecycle state machine and the
//! rejection classification table as pure functions with zero I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                   Fiscal Authorization Architecture                     │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │            Retail platform (sales, stock, back office)          │   │
//! │  │       completed sale ──► create_attempt / submit_for_auth       │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                fiscal-engine (remote authority)                 │   │
//! │  │   session cache ─► sequence gate ─► WSFE client ─► scheduler    │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ fiscal-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │  invoice  │  │ lifecycle │  │ rejection │  │ validation│  │   │
//! │  │   │  Attempt  │  │  states   │  │  table    │  │  CUIT     │  │   │
//! │  │   │  Request  │  │  moves    │  │  rules    │  │  amounts  │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    fiscal-db (Database Layer)                   │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Identifiers and authority code tables (CUIT, document types, VAT rates)
//! - [`money`] - Money type with integer arithmetic (no floating point!)
//! - [`invoice`] - Invoice attempts, authorization requests and outcomes
//! - [`lifecycle`] - The attempt state machine
//! - [`rejection`] - Classification of the authority's rejections
//! - [`validation`] - Business rule validation
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use fiscal_core::money::Money;
//! use fiscal_core::types::VatRate;
//!
//! let net = Money::from_cents(10_000); // 100.00
//! let tax = net.calculate_tax(VatRate::TwentyOne.rate());
//!
//! assert_eq!(tax.cents(), 2_100);
//! assert_eq!((net + tax).to_wire(), "121.00");
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod invoice;
pub mod lifecycle;
pub mod money;
pub mod rejection;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use invoice::{
    Approval, AuthorizationDetail, AuthorizationOutcome, AuthorizationRequest,
    AuthorizationResult, AuthorizationStatus, AuthorizedVoucher, InvoiceAmounts, InvoiceAttempt,
    NewInvoiceAttempt, Receiver, RemoteMessage, ServicePeriod, TaxLine,
};
pub use lifecycle::{AttemptState, Transition};
pub use money::Money;
pub use rejection::{Correction, Rejection, RejectionClass, RejectionTable};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Currency code the authority expects for local-currency invoices.
pub const LOCAL_CURRENCY: &str = "PES";

/// Exchange rate reported for local-currency invoices.
pub const LOCAL_CURRENCY_RATE: &str = "1";

/// Invoices are always requested one at a time.
pub const VOUCHERS_PER_REQUEST: u32 = 1;

/// Highest point-of-sale number the authority accepts.
pub const MAX_POINT_OF_SALE: u32 = 99_998;
