//! # fiscal-engine: Tax Authority Integration
//!
//! Everything that talks to the tax authority, and the lifecycle of an
//! authorization attempt around those calls.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Authorization Flow                              │
//! │                                                                         │
//! │  submit_for_authorization(sale)        ReconciliationScheduler (tick)  │
//! │               │                                   │                     │
//! │               └──────────────┬────────────────────┘                     │
//! │                              ▼                                          │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                      InvoiceProcessor                            │  │
//! │  │                                                                  │  │
//! │  │  claim ─► credentials ─► reserve last+1 ─► record ─► submit     │  │
//! │  │    │           │               │                        │        │  │
//! │  │    │           ▼               ▼                        ▼        │  │
//! │  │    │   CertificateAuth   SequenceGate        InvoiceAuthorization│  │
//! │  │    │   Session (WSAA)    (per-tuple lock)    Client (WSFE)       │  │
//! │  │    ▼                                                             │  │
//! │  │  fiscal-db: pending → processing → completed | error            │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │                                                                         │
//! │  Ambiguous outcomes (timeouts, out-of-sequence rejections) are         │
//! │  resolved by looking the reserved number up at the authority and       │
//! │  completing the attempt only if the voucher matches it.                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Remote Protocol
//! - [`signer`] - Login ticket request and CMS signing
//! - [`wsaa`] - Authentication service client (`loginCms`)
//! - [`wsfe`] - Invoice service client (`FECAESolicitar` and friends)
//! - [`xml`] - SOAP envelope helpers
//!
//! ### Authorization
//! - [`auth_session`] - Keyed session cache with single-flight renewal
//! - [`authorization`] - Request building, timeouts, session invalidation
//! - [`sequence`] - Per-tuple number reservation
//! - [`processor`] - Attempt lifecycle driver and reconciliation
//!
//! ### Operations
//! - [`scheduler`] - Background reclaim and corrective passes
//! - [`diagnostics`] - Read-only operator checks
//! - [`config`] - Engine configuration
//! - [`error`] - Engine error taxonomy
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fiscal_engine::{EngineConfig, InvoiceProcessor, ReconciliationScheduler};
//! use fiscal_db::Database;
//!
//! let config = EngineConfig::load(None)?;
//! let processor = Arc::new(InvoiceProcessor::from_config(&config, database)?);
//!
//! let (scheduler, handle) =
//!     ReconciliationScheduler::new(processor.clone(), config.scheduler.clone());
//! tokio::spawn(scheduler.run());
//!
//! let result = processor.submit_for_authorization("sale-42").await?;
//! println!("{:?} {:?}", result.status, result.number);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

// Remote protocol
pub mod signer;
pub mod wsaa;
pub mod wsfe;
pub mod xml;

// Authorization
pub mod auth_session;
pub mod authorization;
pub mod processor;
pub mod sequence;

// Operations
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod scheduler;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use auth_session::{CertificateAuthSession, Credentials, SessionStore};
pub use authorization::InvoiceAuthorizationClient;
pub use config::{EngineConfig, Environment};
pub use diagnostics::{CheckResult, CheckStatus, DiagnosticsProbe, DiagnosticsReport, SequenceTarget};
pub use error::{FiscalError, FiscalResult};
pub use processor::InvoiceProcessor;
pub use scheduler::{ReconcileReport, ReconciliationScheduler, SchedulerHandle};
pub use sequence::{Reservation, SequenceGate, SequenceKey};
pub use signer::{CertificateInfo, CmsSigner, TicketSigner};
pub use wsaa::{AuthService, LoginTicket, WsaaClient};
pub use wsfe::{InvoiceService, ServerStatus, WsfeClient};
