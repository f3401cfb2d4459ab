//! # Sequence Gate
//!
//! Serializes number reservation per `(taxpayer, point of sale, document
//! type)`. The authority only accepts `last + 1`, so two submissions for
//! the same tuple must never overlap:
//!
//! ```text
//! reserve_next(tuple)
//!   ├── lock tuple (bounded wait, SequenceConflict on timeout)
//!   ├── last = FECompUltimoAutorizado(tuple)
//!   └── Reservation { next = last + 1, guard }
//!          │
//!          └── held across submission, released on drop
//! ```
//!
//! Locks are process-local. Independent processes issuing on the same tuple
//! are outside what this gate can prevent; the authority's out-of-sequence
//! rejection and reconciliation cover that case.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use fiscal_core::{DocumentType, TaxpayerId};

use crate::auth_session::Credentials;
use crate::authorization::InvoiceAuthorizationClient;
use crate::config::SequenceSettings;
use crate::error::{FiscalError, FiscalResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SequenceKey {
    pub taxpayer_id: TaxpayerId,
    pub point_of_sale: u32,
    pub document_type: DocumentType,
}

/// Exclusive right to submit `number` for a tuple.
///
/// The tuple stays locked until this is dropped.
#[derive(Debug)]
pub struct Reservation {
    key: SequenceKey,
    last: i64,
    number: i64,
    _guard: OwnedMutexGuard<()>,
}

impl Reservation {
    pub fn key(&self) -> &SequenceKey {
        &self.key
    }

    /// Last number the authority reported when the reservation was made.
    pub fn last(&self) -> i64 {
        self.last
    }

    pub fn number(&self) -> i64 {
        self.number
    }
}

pub struct SequenceGate {
    client: Arc<InvoiceAuthorizationClient>,
    locks: DashMap<SequenceKey, Arc<Mutex<()>>>,
    lock_wait: Duration,
}

impl SequenceGate {
    pub fn new(client: Arc<InvoiceAuthorizationClient>, settings: &SequenceSettings) -> Self {
        SequenceGate {
            client,
            locks: DashMap::new(),
            lock_wait: settings.lock_wait(),
        }
    }

    /// Locks the tuple and reserves the number after the authority's last.
    ///
    /// ## Errors
    /// - `SequenceConflict` if the tuple stays locked longer than the
    ///   configured wait
    /// - whatever querying the last number fails with; the lock is released
    pub async fn reserve_next(
        &self,
        credentials: &Credentials,
        point_of_sale: u32,
        document_type: DocumentType,
    ) -> FiscalResult<Reservation> {
        let key = SequenceKey {
            taxpayer_id: credentials.taxpayer_id.clone(),
            point_of_sale,
            document_type,
        };
        let lock = self.locks.entry(key.clone()).or_default().clone();

        let guard = match tokio::time::timeout(self.lock_wait, lock.lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                warn!(
                    taxpayer = %key.taxpayer_id,
                    pos = point_of_sale,
                    doc = ?document_type,
                    waited = ?self.lock_wait,
                    "Sequence lock wait exceeded"
                );
                return Err(FiscalError::SequenceConflict {
                    point_of_sale,
                    document_type,
                    waited: self.lock_wait,
                });
            }
        };

        let last = self
            .client
            .last_authorized(credentials, point_of_sale, document_type)
            .await?;

        debug!(
            taxpayer = %key.taxpayer_id,
            pos = point_of_sale,
            doc = ?document_type,
            last,
            next = last + 1,
            "Number reserved"
        );

        Ok(Reservation {
            key,
            last,
            number: last + 1,
            _guard: guard,
        })
    }

    /// Whether a reservation is currently held for the tuple.
    pub fn is_held(&self, key: &SequenceKey) -> bool {
        self.locks
            .get(key)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixtures, taxpayer, test_config, FakeAuthority, TestEngine};
    use fiscal_core::AuthorizationOutcome;

    async fn gate(engine: &TestEngine, lock_wait_ms: u64) -> SequenceGate {
        SequenceGate::new(
            engine.client.clone(),
            &SequenceSettings {
                lock_wait_ms,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_reserves_last_plus_one() {
        let engine = TestEngine::start().await;
        engine.authority.set_last(3, DocumentType::InvoiceB, 41);
        let gate = gate(&engine, 1_000).await;
        let creds = engine.auth.get_valid_token(&taxpayer()).await.unwrap();

        let reservation = gate
            .reserve_next(&creds, 3, DocumentType::InvoiceB)
            .await
            .unwrap();
        assert_eq!(reservation.last(), 41);
        assert_eq!(reservation.number(), 42);
        assert!(gate.is_held(reservation.key()));

        let key = reservation.key().clone();
        drop(reservation);
        assert!(!gate.is_held(&key));
    }

    #[tokio::test]
    async fn test_held_tuple_times_out_with_conflict() {
        let engine = TestEngine::start().await;
        let gate = gate(&engine, 50).await;
        let creds = engine.auth.get_valid_token(&taxpayer()).await.unwrap();

        let _held = gate
            .reserve_next(&creds, 3, DocumentType::InvoiceB)
            .await
            .unwrap();
        let err = gate
            .reserve_next(&creds, 3, DocumentType::InvoiceB)
            .await
            .unwrap_err();
        assert!(matches!(err, FiscalError::SequenceConflict { point_of_sale: 3, .. }));
        assert!(err.is_retryable());

        // Other tuples are independent.
        gate.reserve_next(&creds, 3, DocumentType::InvoiceA)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_query_releases_lock() {
        let engine = TestEngine::start().await;
        let gate = gate(&engine, 50).await;
        let creds = engine.auth.get_valid_token(&taxpayer()).await.unwrap();

        engine.authority.set_unreachable(true);
        assert!(gate
            .reserve_next(&creds, 3, DocumentType::InvoiceB)
            .await
            .is_err());

        engine.authority.set_unreachable(false);
        gate.reserve_next(&creds, 3, DocumentType::InvoiceB)
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submissions_are_gapless() {
        let engine = TestEngine::with_parts(
            test_config(),
            FakeAuthority::new().with_latency(Duration::from_millis(5)),
        )
        .await;
        let gate = Arc::new(gate(&engine, 10_000).await);
        let creds = engine.auth.get_valid_token(&taxpayer()).await.unwrap();
        let today = chrono::Local::now().date_naive();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let gate = gate.clone();
            let client = engine.client.clone();
            let creds = creds.clone();
            handles.push(tokio::spawn(async move {
                let reservation = gate
                    .reserve_next(&creds, 3, DocumentType::InvoiceB)
                    .await
                    .unwrap();
                let outcome = client
                    .authorize(&fixtures::attempt(), &creds, reservation.number(), today)
                    .await
                    .unwrap();
                match outcome {
                    AuthorizationOutcome::Approved(a) => a.number,
                    AuthorizationOutcome::Rejected(r) => panic!("rejected: {}", r.cause()),
                }
            }));
        }

        let mut numbers = Vec::new();
        for handle in handles {
            numbers.push(handle.await.unwrap());
        }
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=20).collect::<Vec<i64>>());
        assert_eq!(engine.authority.last_number(3, DocumentType::InvoiceB), 20);
    }
}
