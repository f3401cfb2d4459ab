//! # Certificate Auth Session
//!
//! Keyed, TTL-bound cache of login tickets with single-flight renewal.
//!
//! ## Token Lookup
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    get_valid_token(taxpayer)                            │
//! │                                                                         │
//! │  1. In-memory cache fresh (expires > now + margin)? ── yes ──► return  │
//! │                            │ no                                         │
//! │  2. Take the taxpayer's renewal lock (one renewal in flight per key)   │
//! │                            │                                            │
//! │  3. Cache fresh now? (another caller renewed while we waited) ─► return│
//! │                            │ no                                         │
//! │  4. Persisted session fresh? ── yes ──► cache it, return               │
//! │                            │ no                                         │
//! │  5. Sign a new login request, call loginCms with backoff on transport  │
//! │     failures, persist and cache the ticket                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A session is never handed out past `expires_at - margin`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use fiscal_core::{AuthSession, TaxpayerId};
use fiscal_db::AuthSessionRepository;

use crate::config::{AuthSettings, EngineConfig};
use crate::error::{FiscalError, FiscalResult};
use crate::signer::{CertificateInfo, CmsSigner, LoginTicketRequest, TicketSigner};
use crate::wsaa::{AuthService, WsaaClient};

/// Longest wait between two renewal requests.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

// =============================================================================
// Credentials
// =============================================================================

/// What the invoice service needs to authenticate a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub taxpayer_id: TaxpayerId,
    pub token: String,
    pub sign: String,
    pub expires_at: DateTime<Utc>,
}

impl From<&AuthSession> for Credentials {
    fn from(session: &AuthSession) -> Self {
        Credentials {
            taxpayer_id: session.taxpayer_id.clone(),
            token: session.token.clone(),
            sign: session.sign.clone(),
            expires_at: session.expires_at,
        }
    }
}

// =============================================================================
// Session Store
// =============================================================================

/// Where tickets survive restarts.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, taxpayer_id: &TaxpayerId) -> FiscalResult<Option<AuthSession>>;
    async fn save(&self, session: &AuthSession) -> FiscalResult<()>;
    async fn remove(&self, taxpayer_id: &TaxpayerId) -> FiscalResult<()>;
}

#[async_trait]
impl SessionStore for AuthSessionRepository {
    async fn load(&self, taxpayer_id: &TaxpayerId) -> FiscalResult<Option<AuthSession>> {
        Ok(self.get(taxpayer_id).await?)
    }

    async fn save(&self, session: &AuthSession) -> FiscalResult<()> {
        Ok(self.upsert(session).await?)
    }

    async fn remove(&self, taxpayer_id: &TaxpayerId) -> FiscalResult<()> {
        self.delete(taxpayer_id).await?;
        Ok(())
    }
}

// =============================================================================
// Certificate Auth Session
// =============================================================================

pub struct CertificateAuthSession {
    service: Arc<dyn AuthService>,
    store: Arc<dyn SessionStore>,
    signers: DashMap<TaxpayerId, Arc<dyn TicketSigner>>,
    cache: DashMap<TaxpayerId, AuthSession>,
    renewals: DashMap<TaxpayerId, Arc<Mutex<()>>>,
    settings: AuthSettings,
}

impl CertificateAuthSession {
    pub fn new(
        service: Arc<dyn AuthService>,
        store: Arc<dyn SessionStore>,
        settings: AuthSettings,
    ) -> Self {
        CertificateAuthSession {
            service,
            store,
            signers: DashMap::new(),
            cache: DashMap::new(),
            renewals: DashMap::new(),
            settings,
        }
    }

    /// Builds the session manager from configuration, loading every
    /// configured certificate.
    ///
    /// ## Errors
    /// `CertificateInvalid` if any configured certificate or key is unusable.
    pub fn from_config(config: &EngineConfig, store: Arc<dyn SessionStore>) -> FiscalResult<Self> {
        let service = Arc::new(WsaaClient::from_settings(&config.service)?);
        let session = Self::new(service, store, config.auth.clone());

        for cred in &config.credentials {
            let signer = CmsSigner::from_files(&cred.certificate_path, &cred.key_path)?;
            info!(
                taxpayer = %cred.taxpayer_id,
                subject = %signer.info().subject,
                not_after = %signer.info().not_after,
                "Certificate loaded"
            );
            session.register_signer(cred.taxpayer_id.clone(), Arc::new(signer));
        }

        Ok(session)
    }

    pub fn register_signer(&self, taxpayer_id: TaxpayerId, signer: Arc<dyn TicketSigner>) {
        self.signers.insert(taxpayer_id, signer);
    }

    /// Taxpayers with a configured certificate.
    pub fn taxpayers(&self) -> Vec<TaxpayerId> {
        let mut ids: Vec<TaxpayerId> = self.signers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn certificate_info(&self, taxpayer_id: &TaxpayerId) -> Option<CertificateInfo> {
        self.signers.get(taxpayer_id)?.certificate()
    }

    pub fn safety_margin(&self) -> chrono::Duration {
        self.settings.safety_margin()
    }

    /// Returns credentials valid for at least the safety margin, renewing
    /// first when needed.
    ///
    /// ## Errors
    /// - `AuthUnavailable` if the service could not issue a ticket
    /// - `CertificateInvalid` if no usable certificate is configured
    pub async fn get_valid_token(&self, taxpayer_id: &TaxpayerId) -> FiscalResult<Credentials> {
        if let Some(session) = self.fresh_cached(taxpayer_id) {
            return Ok(Credentials::from(&session));
        }

        let lock = self
            .renewals
            .entry(taxpayer_id.clone())
            .or_default()
            .clone();
        let _renewal = lock.lock().await;

        if let Some(session) = self.fresh_cached(taxpayer_id) {
            debug!(taxpayer = %taxpayer_id, "Session renewed by a concurrent caller");
            return Ok(Credentials::from(&session));
        }

        if let Some(session) = self.store.load(taxpayer_id).await? {
            if session.is_fresh(Utc::now(), self.settings.safety_margin()) {
                debug!(taxpayer = %taxpayer_id, expires_at = %session.expires_at, "Session restored");
                let credentials = Credentials::from(&session);
                self.cache.insert(taxpayer_id.clone(), session);
                return Ok(credentials);
            }
        }

        let session = self.renew(taxpayer_id).await?;
        Ok(Credentials::from(&session))
    }

    /// The current session without renewing, fresh or not.
    pub async fn current(&self, taxpayer_id: &TaxpayerId) -> FiscalResult<Option<AuthSession>> {
        if let Some(session) = self.cache.get(taxpayer_id) {
            return Ok(Some(session.clone()));
        }
        self.store.load(taxpayer_id).await
    }

    /// Drops the session so the next call renews.
    ///
    /// Used when the invoice service rejects a token the cache still
    /// considered valid.
    pub async fn invalidate(&self, taxpayer_id: &TaxpayerId) -> FiscalResult<()> {
        self.cache.remove(taxpayer_id);
        self.store.remove(taxpayer_id).await?;
        warn!(taxpayer = %taxpayer_id, "Session invalidated");
        Ok(())
    }

    fn fresh_cached(&self, taxpayer_id: &TaxpayerId) -> Option<AuthSession> {
        let session = self.cache.get(taxpayer_id)?;
        session
            .is_fresh(Utc::now(), self.settings.safety_margin())
            .then(|| session.clone())
    }

    async fn renew(&self, taxpayer_id: &TaxpayerId) -> FiscalResult<AuthSession> {
        let signer = self
            .signers
            .get(taxpayer_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| {
                FiscalError::CertificateInvalid(format!(
                    "no certificate configured for taxpayer {}",
                    taxpayer_id
                ))
            })?;

        let mut backoff = ExponentialBackoff {
            initial_interval: self.settings.initial_backoff(),
            max_interval: MAX_BACKOFF,
            multiplier: 2.0,
            max_elapsed_time: Some(self.settings.retry_budget()),
            ..Default::default()
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let request = LoginTicketRequest::new(
                &self.settings.service_name,
                Utc::now(),
                self.settings.ticket_ttl(),
            );
            let signed = signer.sign(&request.to_xml())?;

            let err = match self.service.login(&signed).await {
                Ok(ticket) => {
                    if ticket.expires_at <= Utc::now() {
                        return Err(FiscalError::AuthUnavailable(format!(
                            "issued ticket already expired at {}",
                            ticket.expires_at
                        )));
                    }
                    let session = AuthSession {
                        taxpayer_id: taxpayer_id.clone(),
                        token: ticket.token,
                        sign: ticket.sign,
                        generated_at: ticket.generated_at,
                        expires_at: ticket.expires_at,
                    };
                    self.store.save(&session).await?;
                    self.cache.insert(taxpayer_id.clone(), session.clone());
                    info!(
                        taxpayer = %taxpayer_id,
                        expires_at = %session.expires_at,
                        attempt,
                        "Session renewed"
                    );
                    return Ok(session);
                }
                Err(e @ (FiscalError::TransportFailure { .. } | FiscalError::Unsent { .. })) => e,
                Err(e) => return Err(e),
            };

            let delay = if attempt < self.settings.max_attempts {
                backoff.next_backoff()
            } else {
                None
            };
            match delay {
                Some(delay) => {
                    warn!(
                        taxpayer = %taxpayer_id,
                        attempt,
                        ?delay,
                        error = %err,
                        "Login failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(FiscalError::AuthUnavailable(format!(
                        "authentication service unreachable after {} attempts: {}",
                        attempt, err
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeAuthService, MemorySessionStore, StaticSigner};
    use fiscal_db::{Database, DbConfig};

    fn taxpayer() -> TaxpayerId {
        TaxpayerId::parse("20123456786").unwrap()
    }

    fn settings() -> AuthSettings {
        AuthSettings {
            initial_backoff_ms: 10,
            ..Default::default()
        }
    }

    fn session_for(
        service: Arc<FakeAuthService>,
        store: Arc<dyn SessionStore>,
    ) -> CertificateAuthSession {
        let auth = CertificateAuthSession::new(service, store, settings());
        auth.register_signer(taxpayer(), Arc::new(StaticSigner::default()));
        auth
    }

    fn stored(expires_in: chrono::Duration) -> AuthSession {
        let now = Utc::now();
        AuthSession {
            taxpayer_id: taxpayer(),
            token: "stored-token".into(),
            sign: "stored-sign".into(),
            generated_at: now,
            expires_at: now + expires_in,
        }
    }

    #[tokio::test]
    async fn test_fresh_session_makes_no_remote_call() {
        let service = Arc::new(FakeAuthService::new());
        let store = Arc::new(MemorySessionStore::default());
        store.save(&stored(chrono::Duration::hours(6))).await.unwrap();
        let auth = session_for(service.clone(), store);

        for _ in 0..3 {
            let creds = auth.get_valid_token(&taxpayer()).await.unwrap();
            assert_eq!(creds.token, "stored-token");
        }
        assert_eq!(service.calls(), 0);
    }

    #[tokio::test]
    async fn test_session_inside_margin_is_renewed() {
        let service = Arc::new(FakeAuthService::new());
        let store = Arc::new(MemorySessionStore::default());
        store.save(&stored(chrono::Duration::minutes(2))).await.unwrap();
        let auth = session_for(service.clone(), store.clone());

        let creds = auth.get_valid_token(&taxpayer()).await.unwrap();
        assert_eq!(creds.token, "token-1");
        assert_eq!(service.calls(), 1);

        let persisted = store.load(&taxpayer()).await.unwrap().unwrap();
        assert_eq!(persisted.token, "token-1");
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_renewal() {
        let service = Arc::new(FakeAuthService::new().with_delay(Duration::from_millis(50)));
        let auth = Arc::new(session_for(
            service.clone(),
            Arc::new(MemorySessionStore::default()),
        ));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let auth = auth.clone();
            handles.push(tokio::spawn(async move {
                auth.get_valid_token(&taxpayer()).await.unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().token, "token-1");
        }
        assert_eq!(service.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failures_are_retried() {
        let service = Arc::new(FakeAuthService::new());
        service.fail_next(FiscalError::transport("login", "connection reset"));
        service.fail_next(FiscalError::timeout("login", Duration::from_secs(15)));
        let auth = session_for(service.clone(), Arc::new(MemorySessionStore::default()));

        let creds = auth.get_valid_token(&taxpayer()).await.unwrap();
        assert_eq!(creds.token, "token-3");
        assert_eq!(service.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_service_is_auth_unavailable() {
        let service = Arc::new(FakeAuthService::new());
        for _ in 0..10 {
            service.fail_next(FiscalError::transport("connect", "refused"));
        }
        let auth = session_for(service.clone(), Arc::new(MemorySessionStore::default()));

        let err = auth.get_valid_token(&taxpayer()).await.unwrap_err();
        assert!(matches!(err, FiscalError::AuthUnavailable(ref m) if m.contains("4 attempts")));
        assert_eq!(service.calls(), 4);
    }

    #[tokio::test]
    async fn test_already_authenticated_is_not_retried() {
        let service = Arc::new(FakeAuthService::new());
        service.fail_next(FiscalError::AuthUnavailable("a valid ticket already exists".into()));
        let auth = session_for(service.clone(), Arc::new(MemorySessionStore::default()));

        assert!(matches!(
            auth.get_valid_token(&taxpayer()).await,
            Err(FiscalError::AuthUnavailable(_))
        ));
        assert_eq!(service.calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_certificate() {
        let service = Arc::new(FakeAuthService::new());
        let auth = CertificateAuthSession::new(
            service.clone(),
            Arc::new(MemorySessionStore::default()),
            settings(),
        );

        let err = auth.get_valid_token(&taxpayer()).await.unwrap_err();
        assert!(matches!(err, FiscalError::CertificateInvalid(_)));
        assert!(err.is_fatal());
        assert_eq!(service.calls(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_forces_renewal() {
        let service = Arc::new(FakeAuthService::new());
        let auth = session_for(service.clone(), Arc::new(MemorySessionStore::default()));

        auth.get_valid_token(&taxpayer()).await.unwrap();
        auth.invalidate(&taxpayer()).await.unwrap();
        assert!(auth.current(&taxpayer()).await.unwrap().is_none());

        let creds = auth.get_valid_token(&taxpayer()).await.unwrap();
        assert_eq!(creds.token, "token-2");
        assert_eq!(service.calls(), 2);
    }

    #[tokio::test]
    async fn test_database_store_survives_restart() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let service = Arc::new(FakeAuthService::new());

        let first = session_for(service.clone(), Arc::new(db.sessions()));
        first.get_valid_token(&taxpayer()).await.unwrap();

        // A new manager over the same database reuses the stored ticket.
        let second = session_for(service.clone(), Arc::new(db.sessions()));
        let creds = second.get_valid_token(&taxpayer()).await.unwrap();
        assert_eq!(creds.token, "token-1");
        assert_eq!(service.calls(), 1);
    }
}
