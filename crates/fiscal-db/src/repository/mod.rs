//! # Repository Module
//!
//! Database repository implementations for the fiscal authorization subsystem.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repository Pattern                                   │
//! │                                                                         │
//! │  InvoiceProcessor                                                      │
//! │       │                                                                 │
//! │       │  db.attempts().claim(id)                                       │
//! │       ▼                                                                 │
//! │  InvoiceAttemptRepository                                              │
//! │  ├── create(&self, input, config)                                      │
//! │  ├── claim / reclaim_stale    (conditional UPDATE ... RETURNING)       │
//! │  ├── record_reservation                                                │
//! │  ├── complete / fail / rearm  (conditional UPDATE ... RETURNING)       │
//! │  └── list_reclaimable / list_auto_correctable                          │
//! │       │                                                                 │
//! │       │  SQL Query                                                      │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! │                                                                         │
//! │  Every transition names its source state in the WHERE clause, so two   │
//! │  workers can never both win the same move.                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`attempt::InvoiceAttemptRepository`] - Attempt lifecycle
//! - [`session::AuthSessionRepository`] - Persisted session tickets
//! - [`taxpayer::TaxpayerConfigRepository`] - Per-branch fiscal identity

pub mod attempt;
pub mod session;
pub mod taxpayer;
