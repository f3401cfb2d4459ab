//! # Test Support
//!
//! In-memory stand-ins for both authority services plus a fully wired
//! engine over an in-memory database.
//!
//! ```text
//! TestEngine
//! ├── Database (in-memory, migrated, one taxpayer config for branch-1)
//! ├── FakeAuthService ─► CertificateAuthSession (StaticSigner)
//! └── FakeAuthority   ─► InvoiceAuthorizationClient ─► SequenceGate
//!                                                   └► InvoiceProcessor
//! ```
//!
//! `FakeAuthority` behaves like the real sequence rules: it only accepts
//! `last + 1` for a tuple and answers anything else with code 10016.
//! Individual calls can be scripted to time out, to time out after the
//! voucher was recorded, or to be rejected.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use dashmap::DashMap;

use fiscal_core::{
    Approval, AuthSession, AuthorizationOutcome, AuthorizationRequest, AuthorizedVoucher,
    DocumentType, InvoiceAttempt, Money, ReceiverDocType, RejectionTable, RemoteMessage,
    TaxpayerConfig, TaxpayerId,
};
use fiscal_db::{Database, DbConfig};

use crate::auth_session::{CertificateAuthSession, Credentials, SessionStore};
use crate::authorization::InvoiceAuthorizationClient;
use crate::config::EngineConfig;
use crate::diagnostics::DiagnosticsProbe;
use crate::error::{FiscalError, FiscalResult};
use crate::processor::InvoiceProcessor;
use crate::scheduler::{ReconciliationScheduler, SchedulerHandle};
use crate::sequence::SequenceGate;
use crate::signer::{CertificateInfo, TicketSigner};
use crate::wsaa::{AuthService, LoginTicket};
use crate::wsfe::{InvoiceService, ServerStatus};

/// Taxpayer every fixture is issued under.
pub const TAXPAYER: &str = "20123456786";

pub fn taxpayer() -> TaxpayerId {
    TaxpayerId::parse(TAXPAYER).expect("fixture taxpayer id is valid")
}

// =============================================================================
// Fixtures
// =============================================================================

pub mod fixtures {
    use chrono::Utc;

    use fiscal_core::{
        AttemptState, Concept, DocumentType, InvoiceAmounts, InvoiceAttempt, Money,
        NewInvoiceAttempt, Receiver, TaxLine, VatRate,
    };

    /// 100.00 net at 21% for an unidentified final consumer: 121.00.
    pub fn amounts() -> InvoiceAmounts {
        InvoiceAmounts::from_lines(
            vec![TaxLine::compute(VatRate::TwentyOne, Money::from_cents(10_000))],
            Money::zero(),
            Money::zero(),
        )
    }

    pub fn new_attempt(sale_id: &str) -> NewInvoiceAttempt {
        NewInvoiceAttempt {
            sale_id: sale_id.to_string(),
            branch_id: "branch-1".to_string(),
            document_type: DocumentType::InvoiceB,
            concept: Concept::Products,
            receiver: Receiver::final_consumer(),
            amounts: amounts(),
            service_period: None,
        }
    }

    /// A claimed attempt on point of sale 3, as a worker sees it.
    pub fn attempt() -> InvoiceAttempt {
        let now = Utc::now();
        InvoiceAttempt {
            id: "attempt-1".to_string(),
            sale_id: "sale-1".to_string(),
            branch_id: "branch-1".to_string(),
            taxpayer_config_id: "config-1".to_string(),
            taxpayer_id: super::taxpayer(),
            point_of_sale: 3,
            document_type: DocumentType::InvoiceB,
            concept: Concept::Products,
            receiver: Receiver::final_consumer(),
            amounts: amounts(),
            service_period: None,
            state: AttemptState::Processing,
            number: None,
            authorization_code: None,
            authorization_expiry: None,
            invoice_date: None,
            error_message: None,
            error_code: None,
            rejection_class: None,
            passes: 1,
            auto_rearms: 0,
            log: String::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// A self-signed certificate and its PKCS#8 key, both PEM, valid from
/// `from_days` to `to_days` relative to now.
pub fn self_signed(from_days: i64, to_days: i64) -> (Vec<u8>, Vec<u8>) {
    build_self_signed(from_days, to_days).expect("self-signed test certificate")
}

fn build_self_signed(
    from_days: i64,
    to_days: i64,
) -> Result<(Vec<u8>, Vec<u8>), openssl::error::ErrorStack> {
    use openssl::asn1::Asn1Time;
    use openssl::bn::BigNum;
    use openssl::hash::MessageDigest;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::x509::{X509Builder, X509NameBuilder};

    let key = PKey::from_rsa(Rsa::generate(2048)?)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("CN", "fiscal test")?;
    name.append_entry_by_text("serialNumber", &format!("CUIT {}", TAXPAYER))?;
    let name = name.build();

    let now = Utc::now().timestamp();
    let serial = BigNum::from_u32(1)?.to_asn1_integer()?;
    let not_before = Asn1Time::from_unix(now + from_days * 86_400)?;
    let not_after = Asn1Time::from_unix(now + to_days * 86_400)?;

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(&key)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.sign(&key, MessageDigest::sha256())?;

    Ok((builder.build().to_pem()?, key.private_key_to_pem_pkcs8()?))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Authentication Fakes
// =============================================================================

/// Signer that base64-encodes the request instead of signing it.
#[derive(Debug, Clone, Default)]
pub struct StaticSigner {
    pub info: Option<CertificateInfo>,
}

impl StaticSigner {
    /// A signer reporting a certificate that expires in `days`.
    pub fn expiring_in(days: i64) -> Self {
        let now = Utc::now();
        StaticSigner {
            info: Some(CertificateInfo {
                subject: "CN=fiscal test".to_string(),
                not_before: now - chrono::Duration::days(365),
                not_after: now + chrono::Duration::days(days),
            }),
        }
    }
}

impl TicketSigner for StaticSigner {
    fn sign(&self, request: &str) -> FiscalResult<String> {
        if let Some(info) = &self.info {
            info.check_validity(Utc::now())?;
        }
        Ok(STANDARD.encode(request))
    }

    fn certificate(&self) -> Option<CertificateInfo> {
        self.info.clone()
    }
}

/// Authentication service issuing `token-N` for the N-th call.
pub struct FakeAuthService {
    calls: AtomicUsize,
    failures: Mutex<VecDeque<FiscalError>>,
    delay: Duration,
    ttl: chrono::Duration,
}

impl FakeAuthService {
    pub fn new() -> Self {
        FakeAuthService {
            calls: AtomicUsize::new(0),
            failures: Mutex::new(VecDeque::new()),
            delay: Duration::ZERO,
            ttl: chrono::Duration::hours(12),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Makes the next call that would succeed fail with `error` instead.
    pub fn fail_next(&self, error: FiscalError) {
        lock(&self.failures).push_back(error);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for FakeAuthService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthService for FakeAuthService {
    async fn login(&self, _signed_request: &str) -> FiscalResult<LoginTicket> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(err) = lock(&self.failures).pop_front() {
            return Err(err);
        }
        let now = Utc::now();
        Ok(LoginTicket {
            token: format!("token-{}", n),
            sign: format!("sign-{}", n),
            generated_at: now,
            expires_at: now + self.ttl,
        })
    }
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: DashMap<TaxpayerId, AuthSession>,
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, taxpayer_id: &TaxpayerId) -> FiscalResult<Option<AuthSession>> {
        Ok(self.sessions.get(taxpayer_id).map(|s| s.clone()))
    }

    async fn save(&self, session: &AuthSession) -> FiscalResult<()> {
        self.sessions
            .insert(session.taxpayer_id.clone(), session.clone());
        Ok(())
    }

    async fn remove(&self, taxpayer_id: &TaxpayerId) -> FiscalResult<()> {
        self.sessions.remove(taxpayer_id);
        Ok(())
    }
}

// =============================================================================
// Fake Authority
// =============================================================================

/// A scripted answer for the next `authorize` call.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// The request is lost before the authority sees it.
    Timeout,
    /// The connection is refused, so nothing is sent.
    Refused,
    /// The authority records the voucher but the answer is lost.
    TimeoutAfterRecording,
    /// The authority rejects with these messages.
    Reject(Vec<RemoteMessage>),
}

type Tuple = (u32, DocumentType);

#[derive(Default)]
struct Ledger {
    last: HashMap<Tuple, i64>,
    vouchers: HashMap<(u32, DocumentType, i64), AuthorizedVoucher>,
    script: VecDeque<Scripted>,
    expired_tokens: HashSet<String>,
    status: Option<ServerStatus>,
    unreachable: bool,
}

impl Ledger {
    fn record(&mut self, voucher: AuthorizedVoucher) {
        self.last
            .insert((voucher.point_of_sale, voucher.document_type), voucher.number);
        self.vouchers.insert(
            (voucher.point_of_sale, voucher.document_type, voucher.number),
            voucher,
        );
    }

    fn accept(
        &mut self,
        request: &AuthorizationRequest,
        rejections: &RejectionTable,
    ) -> AuthorizationOutcome {
        let tuple = (request.point_of_sale, request.document_type);
        let expected = self.last.get(&tuple).copied().unwrap_or(0) + 1;
        let number = request.detail.number_from;

        if number != expected {
            return AuthorizationOutcome::Rejected(rejections.classify(vec![RemoteMessage::new(
                10016,
                "El numero o fecha del comprobante no se corresponde con el proximo a autorizar. \
                 Consultar metodo FECompUltimoAutorizado.",
            )]));
        }

        let voucher = AuthorizedVoucher {
            point_of_sale: request.point_of_sale,
            document_type: request.document_type,
            number,
            receiver_doc_type: request.detail.receiver_doc_type,
            receiver_doc_number: request.detail.receiver_doc_number,
            total: request.detail.amounts.total(),
            net: request.detail.amounts.net(),
            tax: request.detail.amounts.tax(),
            tax_lines: request.detail.amounts.tax_lines.clone(),
            invoice_date: Some(request.detail.invoice_date),
            authorization_code: authorization_code(number),
            authorization_expiry: request.detail.invoice_date + chrono::Duration::days(10),
        };
        let approval = voucher.clone().into_approval();
        self.record(voucher);
        AuthorizationOutcome::Approved(approval)
    }
}

fn authorization_code(number: i64) -> String {
    format!("{:014}", 76_000_000_000_000i64 + number)
}

/// In-memory invoice service with the authority's sequencing rules.
pub struct FakeAuthority {
    ledger: Mutex<Ledger>,
    rejections: RejectionTable,
    latency: Duration,
    authorize_calls: AtomicUsize,
    last_calls: AtomicUsize,
    lookup_calls: AtomicUsize,
}

impl FakeAuthority {
    pub fn new() -> Self {
        FakeAuthority {
            ledger: Mutex::new(Ledger::default()),
            rejections: RejectionTable::standard(),
            latency: Duration::ZERO,
            authorize_calls: AtomicUsize::new(0),
            last_calls: AtomicUsize::new(0),
            lookup_calls: AtomicUsize::new(0),
        }
    }

    /// Delays every call, to widen race windows.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn script(&self, answer: Scripted) {
        lock(&self.ledger).script.push_back(answer);
    }

    /// Rejects every call made with `token` as if its dates no longer
    /// validated.
    pub fn expire_token(&self, token: &str) {
        lock(&self.ledger).expired_tokens.insert(token.to_string());
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.ledger).unreachable = unreachable;
    }

    pub fn set_status(&self, status: ServerStatus) {
        lock(&self.ledger).status = Some(status);
    }

    pub fn set_last(&self, point_of_sale: u32, document_type: DocumentType, number: i64) {
        lock(&self.ledger)
            .last
            .insert((point_of_sale, document_type), number);
    }

    /// Another system authorizes the next number of the tuple, untaxed and
    /// for an unidentified receiver; returns it.
    pub fn issue_elsewhere(
        &self,
        point_of_sale: u32,
        document_type: DocumentType,
        total: Money,
    ) -> i64 {
        let mut ledger = lock(&self.ledger);
        let number = ledger
            .last
            .get(&(point_of_sale, document_type))
            .copied()
            .unwrap_or(0)
            + 1;
        let today = Utc::now().date_naive();
        ledger.record(AuthorizedVoucher {
            point_of_sale,
            document_type,
            number,
            receiver_doc_type: ReceiverDocType::Unidentified,
            receiver_doc_number: 0,
            total,
            net: total,
            tax: Money::zero(),
            tax_lines: Vec::new(),
            invoice_date: Some(today),
            authorization_code: authorization_code(number),
            authorization_expiry: today + chrono::Duration::days(10),
        });
        number
    }

    pub fn last_number(&self, point_of_sale: u32, document_type: DocumentType) -> i64 {
        lock(&self.ledger)
            .last
            .get(&(point_of_sale, document_type))
            .copied()
            .unwrap_or(0)
    }

    pub fn voucher_count(&self) -> usize {
        lock(&self.ledger).vouchers.len()
    }

    pub fn authorize_calls(&self) -> usize {
        self.authorize_calls.load(Ordering::SeqCst)
    }

    pub fn last_authorized_calls(&self) -> usize {
        self.last_calls.load(Ordering::SeqCst)
    }

    pub fn lookup_calls(&self) -> usize {
        self.lookup_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn expired(&self, credentials: &Credentials) -> Option<fiscal_core::Rejection> {
        lock(&self.ledger)
            .expired_tokens
            .contains(&credentials.token)
            .then(|| {
                self.rejections.classify(vec![RemoteMessage::new(
                    600,
                    "ValidacionDeToken: No validaron las fechas del token GenTime, ExpTime, NowUTC",
                )])
            })
    }

    fn reachable(&self, operation: &'static str) -> FiscalResult<()> {
        if lock(&self.ledger).unreachable {
            return Err(FiscalError::unsent(operation, "connection refused"));
        }
        Ok(())
    }

    fn authorize_now(
        &self,
        credentials: &Credentials,
        request: &AuthorizationRequest,
    ) -> FiscalResult<AuthorizationOutcome> {
        const OP: &str = "FECAESolicitar";
        self.reachable(OP)?;
        if let Some(rejection) = self.expired(credentials) {
            return Ok(AuthorizationOutcome::Rejected(rejection));
        }

        let mut ledger = lock(&self.ledger);
        match ledger.script.pop_front() {
            Some(Scripted::Timeout) => Err(FiscalError::timeout(OP, Duration::from_secs(15))),
            Some(Scripted::Refused) => Err(FiscalError::unsent(OP, "connection refused")),
            Some(Scripted::TimeoutAfterRecording) => {
                ledger.accept(request, &self.rejections);
                Err(FiscalError::timeout(OP, Duration::from_secs(15)))
            }
            Some(Scripted::Reject(messages)) => Ok(AuthorizationOutcome::Rejected(
                self.rejections.classify(messages),
            )),
            None => Ok(ledger.accept(request, &self.rejections)),
        }
    }
}

impl Default for FakeAuthority {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InvoiceService for FakeAuthority {
    async fn authorize(
        &self,
        credentials: &Credentials,
        request: &AuthorizationRequest,
    ) -> FiscalResult<AuthorizationOutcome> {
        self.authorize_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.authorize_now(credentials, request)
    }

    async fn last_authorized(
        &self,
        credentials: &Credentials,
        point_of_sale: u32,
        document_type: DocumentType,
    ) -> FiscalResult<i64> {
        self.last_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.reachable("FECompUltimoAutorizado")?;
        if let Some(rejection) = self.expired(credentials) {
            return Err(FiscalError::BusinessRejection(rejection));
        }
        Ok(self.last_number(point_of_sale, document_type))
    }

    async fn lookup(
        &self,
        _credentials: &Credentials,
        point_of_sale: u32,
        document_type: DocumentType,
        number: i64,
    ) -> FiscalResult<Option<AuthorizedVoucher>> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.reachable("FECompConsultar")?;
        Ok(lock(&self.ledger)
            .vouchers
            .get(&(point_of_sale, document_type, number))
            .cloned())
    }

    async fn server_status(&self) -> FiscalResult<ServerStatus> {
        self.reachable("FEDummy")?;
        Ok(lock(&self.ledger).status.clone().unwrap_or(ServerStatus {
            app_server: "OK".to_string(),
            db_server: "OK".to_string(),
            auth_server: "OK".to_string(),
        }))
    }
}

// =============================================================================
// Wired Engine
// =============================================================================

/// Configuration with no waiting: attempts are eligible as soon as they are
/// written and `processing` is stale immediately.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.auth.initial_backoff_ms = 10;
    config.sequence.lock_wait_ms = 2_000;
    config.scheduler.min_age_secs = 0;
    config.scheduler.stale_after_secs = 0;
    config.scheduler.max_passes = 5;
    config
}

pub struct TestEngine {
    pub db: Database,
    pub config: EngineConfig,
    pub taxpayer: TaxpayerConfig,
    pub auth_service: Arc<FakeAuthService>,
    pub authority: Arc<FakeAuthority>,
    pub auth: Arc<CertificateAuthSession>,
    pub client: Arc<InvoiceAuthorizationClient>,
    pub processor: Arc<InvoiceProcessor>,
}

impl TestEngine {
    pub async fn start() -> Self {
        Self::with_parts(test_config(), FakeAuthority::new()).await
    }

    pub async fn with_parts(config: EngineConfig, authority: FakeAuthority) -> Self {
        let db = Database::new(DbConfig::in_memory())
            .await
            .expect("in-memory database");
        let taxpayer = db
            .taxpayers()
            .register("branch-1", &taxpayer(), 3, Some("Fiscal Test SA"))
            .await
            .expect("taxpayer config");

        let auth_service = Arc::new(FakeAuthService::new());
        let auth = Arc::new(CertificateAuthSession::new(
            auth_service.clone(),
            Arc::new(db.sessions()),
            config.auth.clone(),
        ));
        auth.register_signer(taxpayer.taxpayer_id.clone(), Arc::new(StaticSigner::expiring_in(200)));

        let authority = Arc::new(authority);
        let client = Arc::new(InvoiceAuthorizationClient::new(
            authority.clone(),
            auth.clone(),
            config.service.request_timeout(),
        ));
        let gate = Arc::new(SequenceGate::new(client.clone(), &config.sequence));
        let processor = Arc::new(InvoiceProcessor::new(
            db.clone(),
            client.clone(),
            gate,
            &config,
        ));

        TestEngine {
            db,
            config,
            taxpayer,
            auth_service,
            authority,
            auth,
            client,
            processor,
        }
    }

    /// Creates a `pending` attempt for `sale_id` on branch-1.
    pub async fn create(&self, sale_id: &str) -> InvoiceAttempt {
        self.processor
            .create_attempt(fixtures::new_attempt(sale_id))
            .await
            .expect("attempt created")
    }

    pub async fn reload(&self, sale_id: &str) -> InvoiceAttempt {
        self.processor
            .get_attempt(sale_id)
            .await
            .expect("attempt exists")
    }

    pub fn scheduler(&self) -> (ReconciliationScheduler, SchedulerHandle) {
        ReconciliationScheduler::new(self.processor.clone(), self.config.scheduler.clone())
    }

    pub fn diagnostics(&self) -> DiagnosticsProbe {
        DiagnosticsProbe::new(self.client.clone(), self.db.clone())
    }
}
