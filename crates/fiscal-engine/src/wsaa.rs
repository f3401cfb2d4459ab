//! # Authentication Service Client
//!
//! SOAP client for the authority's authentication service (`loginCms`).
//!
//! ```text
//! POST LoginCms
//!   <loginCms><in0>base64 CMS</in0></loginCms>
//!        │
//!        ▼
//! <loginCmsReturn>  (escaped XML)
//!   <loginTicketResponse>
//!     <header><generationTime/><expirationTime/></header>
//!     <credentials><token/><sign/></credentials>
//!   </loginTicketResponse>
//! </loginCmsReturn>
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::ServiceSettings;
use crate::error::{FiscalError, FiscalResult};
use crate::xml::{Element, SoapFault};

const SOAP_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const WSAA_NS: &str = "http://wsaa.view.sua.dvadac.desein.afip.gov";

/// A ticket issued by the authentication service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginTicket {
    pub token: String,
    pub sign: String,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Exchanges a signed login request for a ticket.
#[async_trait]
pub trait AuthService: Send + Sync {
    async fn login(&self, signed_request: &str) -> FiscalResult<LoginTicket>;
}

/// HTTP client for `loginCms`.
#[derive(Debug, Clone)]
pub struct WsaaClient {
    http: reqwest::Client,
    url: String,
}

impl WsaaClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> FiscalResult<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(WsaaClient {
            http,
            url: url.into(),
        })
    }

    pub fn from_settings(settings: &ServiceSettings) -> FiscalResult<Self> {
        Self::new(settings.auth_url(), settings.request_timeout())
    }

    fn envelope(signed_request: &str) -> String {
        format!(
            concat!(
                r#"<soapenv:Envelope xmlns:soapenv="{}" xmlns:wsaa="{}">"#,
                "<soapenv:Header/>",
                "<soapenv:Body>",
                "<wsaa:loginCms><wsaa:in0>{}</wsaa:in0></wsaa:loginCms>",
                "</soapenv:Body>",
                "</soapenv:Envelope>"
            ),
            SOAP_NS, WSAA_NS, signed_request
        )
    }
}

#[async_trait]
impl AuthService for WsaaClient {
    async fn login(&self, signed_request: &str) -> FiscalResult<LoginTicket> {
        debug!(url = %self.url, "Requesting login ticket");

        let response = self
            .http
            .post(&self.url)
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", "\"\"")
            .body(Self::envelope(signed_request))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        // Faults come back with HTTP 500 and still need classifying.
        match parse_login_response(&body) {
            Err(FiscalError::TransportFailure { .. }) if !status.is_success() => Err(
                FiscalError::transport("login", format!("HTTP {}", status)),
            ),
            other => other,
        }
    }
}

/// Parses a `loginCms` response envelope.
pub(crate) fn parse_login_response(body: &str) -> FiscalResult<LoginTicket> {
    let root = Element::parse(body)?;
    if let Some(fault) = root.fault() {
        return Err(classify_fault(fault));
    }

    let ret = root
        .find("loginCmsReturn")
        .ok_or_else(|| FiscalError::transport("login", "response has no loginCmsReturn"))?;
    let ticket = Element::parse(ret.text())?;

    let field = |path: &[&str]| {
        ticket
            .path(path)
            .map(Element::text)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                FiscalError::transport("login", format!("ticket is missing {}", path.join("/")))
            })
    };

    Ok(LoginTicket {
        token: field(&["credentials", "token"])?.to_string(),
        sign: field(&["credentials", "sign"])?.to_string(),
        generated_at: parse_time(field(&["header", "generationTime"])?)?,
        expires_at: parse_time(field(&["header", "expirationTime"])?)?,
    })
}

fn parse_time(raw: &str) -> FiscalResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| FiscalError::transport("login", format!("bad timestamp {}: {}", raw, e)))
}

fn classify_fault(fault: SoapFault) -> FiscalError {
    let code = fault.code.to_lowercase();
    if code.contains("alreadyauthenticated") {
        warn!(fault = %fault, "Authority already holds a valid ticket for this certificate");
        FiscalError::AuthUnavailable(format!(
            "a valid ticket already exists, retry after it expires ({})",
            fault
        ))
    } else if code.contains("cms") || code.contains("cert") {
        FiscalError::CertificateInvalid(fault.to_string())
    } else {
        FiscalError::AuthUnavailable(fault.to_string())
    }
}
