//! # Invoice Authorization Client
//!
//! Every call to the invoice service goes through here. The client adds two
//! things on top of [`InvoiceService`]:
//!
//! - a hard deadline per call; an expired deadline is a `TransportFailure`
//!   and says nothing about whether the authority acted on the request
//! - session invalidation whenever the authority refuses the token, so the
//!   next call renews it

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tracing::{debug, error, info, warn};

use fiscal_core::{
    AuthorizationOutcome, AuthorizationRequest, AuthorizedVoucher, DocumentType, InvoiceAttempt,
    Rejection, RejectionClass, RejectionTable,
};

use crate::auth_session::{CertificateAuthSession, Credentials};
use crate::config::EngineConfig;
use crate::error::{FiscalError, FiscalResult};
use crate::wsfe::{InvoiceService, ServerStatus, WsfeClient};

pub struct InvoiceAuthorizationClient {
    service: Arc<dyn InvoiceService>,
    auth: Arc<CertificateAuthSession>,
    timeout: Duration,
}

impl InvoiceAuthorizationClient {
    pub fn new(
        service: Arc<dyn InvoiceService>,
        auth: Arc<CertificateAuthSession>,
        timeout: Duration,
    ) -> Self {
        InvoiceAuthorizationClient {
            service,
            auth,
            timeout,
        }
    }

    /// Client over the SOAP service configured in `config`.
    pub fn from_config(
        config: &EngineConfig,
        auth: Arc<CertificateAuthSession>,
        rejections: Arc<RejectionTable>,
    ) -> FiscalResult<Self> {
        let service = WsfeClient::from_settings(&config.service, rejections)?;
        Ok(Self::new(
            Arc::new(service),
            auth,
            config.service.request_timeout(),
        ))
    }

    pub fn auth(&self) -> &Arc<CertificateAuthSession> {
        &self.auth
    }

    /// Validates `attempt` and builds the request for `number`.
    pub fn build_request(
        attempt: &InvoiceAttempt,
        number: i64,
        invoice_date: NaiveDate,
    ) -> FiscalResult<AuthorizationRequest> {
        Ok(AuthorizationRequest::build(attempt, number, invoice_date)?)
    }

    /// Builds and submits the request for `attempt` under `number`.
    pub async fn authorize(
        &self,
        attempt: &InvoiceAttempt,
        credentials: &Credentials,
        number: i64,
        invoice_date: NaiveDate,
    ) -> FiscalResult<AuthorizationOutcome> {
        if credentials.taxpayer_id != attempt.taxpayer_id {
            return Err(FiscalError::InvariantViolation(format!(
                "credentials for {} used for an attempt of {}",
                credentials.taxpayer_id, attempt.taxpayer_id
            )));
        }
        let request = Self::build_request(attempt, number, invoice_date)?;
        self.submit(credentials, &request).await
    }

    /// Submits an already validated request.
    ///
    /// ## Errors
    /// `TransportFailure` when the call fails or exceeds the deadline. The
    /// authority may still have authorized the voucher.
    pub async fn submit(
        &self,
        credentials: &Credentials,
        request: &AuthorizationRequest,
    ) -> FiscalResult<AuthorizationOutcome> {
        debug!(
            taxpayer = %credentials.taxpayer_id,
            pos = request.point_of_sale,
            doc = ?request.document_type,
            number = request.detail.number_from,
            "Submitting authorization request"
        );

        let outcome = self
            .guarded(
                "FECAESolicitar",
                credentials,
                self.service.authorize(credentials, request),
            )
            .await?;

        match &outcome {
            AuthorizationOutcome::Approved(approval) => info!(
                taxpayer = %credentials.taxpayer_id,
                pos = request.point_of_sale,
                number = approval.number,
                code = %approval.authorization_code,
                "Voucher authorized"
            ),
            AuthorizationOutcome::Rejected(rejection) => {
                warn!(
                    taxpayer = %credentials.taxpayer_id,
                    pos = request.point_of_sale,
                    number = request.detail.number_from,
                    class = %rejection.class,
                    cause = %rejection.cause(),
                    "Voucher rejected"
                );
                self.on_rejection(credentials, rejection).await;
            }
        }

        Ok(outcome)
    }

    pub async fn last_authorized(
        &self,
        credentials: &Credentials,
        point_of_sale: u32,
        document_type: DocumentType,
    ) -> FiscalResult<i64> {
        let last = self
            .guarded(
                "FECompUltimoAutorizado",
                credentials,
                self.service
                    .last_authorized(credentials, point_of_sale, document_type),
            )
            .await?;

        if last < 0 {
            return Err(FiscalError::InvariantViolation(format!(
                "authority reported negative last number {} for pos {} {:?}",
                last, point_of_sale, document_type
            )));
        }
        Ok(last)
    }

    pub async fn lookup(
        &self,
        credentials: &Credentials,
        point_of_sale: u32,
        document_type: DocumentType,
        number: i64,
    ) -> FiscalResult<Option<AuthorizedVoucher>> {
        self.guarded(
            "FECompConsultar",
            credentials,
            self.service
                .lookup(credentials, point_of_sale, document_type, number),
        )
        .await
    }

    pub async fn server_status(&self) -> FiscalResult<ServerStatus> {
        match tokio::time::timeout(self.timeout, self.service.server_status()).await {
            Ok(result) => result,
            Err(_) => Err(FiscalError::timeout("FEDummy", self.timeout)),
        }
    }

    async fn guarded<T>(
        &self,
        operation: &'static str,
        credentials: &Credentials,
        call: impl Future<Output = FiscalResult<T>>,
    ) -> FiscalResult<T> {
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(FiscalError::timeout(operation, self.timeout)),
        };

        if let Err(FiscalError::BusinessRejection(rejection)) = &result {
            self.on_rejection(credentials, rejection).await;
        }
        result
    }

    async fn on_rejection(&self, credentials: &Credentials, rejection: &Rejection) {
        if rejection.class != RejectionClass::ExpiredCredentials {
            return;
        }
        if let Err(e) = self.auth.invalidate(&credentials.taxpayer_id).await {
            error!(
                taxpayer = %credentials.taxpayer_id,
                error = %e,
                "Failed to invalidate refused session"
            );
        }
    }
}
