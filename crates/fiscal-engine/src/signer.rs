//! # Login Ticket Signing
//!
//! The authentication service only accepts a login ticket request (TRA)
//! signed as CMS/PKCS#7 with the certificate the authority issued to the
//! taxpayer.
//!
//! ```text
//! LoginTicketRequest ──to_xml──► TRA ──CmsSigner::sign──► base64(DER CMS)
//!                                                          │
//!                                                          ▼
//!                                              WsaaClient::login (loginCms)
//! ```
//!
//! A certificate that is expired, not yet valid, or paired with the wrong
//! key is reported as `CertificateInvalid` before anything is sent.

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::cms::{CMSOptions, CmsContentInfo};
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use serde::Serialize;
use tracing::debug;

use crate::error::{FiscalError, FiscalResult};

// =============================================================================
// Login Ticket Request
// =============================================================================

/// The document the authentication service signs a ticket for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginTicketRequest {
    pub unique_id: u32,
    pub generation_time: DateTime<Utc>,
    pub expiration_time: DateTime<Utc>,
    pub service: String,
}

impl LoginTicketRequest {
    /// A request valid from a few minutes ago until `now + ttl`.
    ///
    /// Generation time is backdated to tolerate clock skew with the
    /// authority.
    pub fn new(service: &str, now: DateTime<Utc>, ttl: chrono::Duration) -> Self {
        LoginTicketRequest {
            unique_id: (now.timestamp() & u32::MAX as i64) as u32,
            generation_time: now - chrono::Duration::minutes(10),
            expiration_time: now + ttl,
            service: service.to_string(),
        }
    }

    pub fn to_xml(&self) -> String {
        format!(
            concat!(
                r#"<?xml version="1.0" encoding="UTF-8"?>"#,
                r#"<loginTicketRequest version="1.0">"#,
                "<header>",
                "<uniqueId>{}</uniqueId>",
                "<generationTime>{}</generationTime>",
                "<expirationTime>{}</expirationTime>",
                "</header>",
                "<service>{}</service>",
                "</loginTicketRequest>"
            ),
            self.unique_id,
            self.generation_time.to_rfc3339_opts(SecondsFormat::Secs, false),
            self.expiration_time.to_rfc3339_opts(SecondsFormat::Secs, false),
            crate::xml::escape(&self.service),
        )
    }
}

// =============================================================================
// Certificate Info
// =============================================================================

/// What diagnostics report about a certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateInfo {
    pub subject: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl CertificateInfo {
    /// Whole days until expiry; negative once expired.
    pub fn days_left(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now).num_days()
    }

    pub fn check_validity(&self, now: DateTime<Utc>) -> FiscalResult<()> {
        if now < self.not_before {
            return Err(FiscalError::CertificateInvalid(format!(
                "certificate {} is not valid before {}",
                self.subject, self.not_before
            )));
        }
        if now > self.not_after {
            return Err(FiscalError::CertificateInvalid(format!(
                "certificate {} expired at {}",
                self.subject, self.not_after
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Signer
// =============================================================================

/// Produces the signed, encoded login request.
pub trait TicketSigner: Send + Sync {
    /// Signs `request` and returns base64 DER CMS.
    fn sign(&self, request: &str) -> FiscalResult<String>;

    /// The signing certificate, when there is one to report on.
    fn certificate(&self) -> Option<CertificateInfo> {
        None
    }
}

/// Signs with an X.509 certificate and its RSA private key.
pub struct CmsSigner {
    cert: X509,
    key: PKey<Private>,
    info: CertificateInfo,
}

impl std::fmt::Debug for CmsSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmsSigner")
            .field("subject", &self.info.subject)
            .field("not_after", &self.info.not_after)
            .finish_non_exhaustive()
    }
}

impl CmsSigner {
    /// Loads a PEM certificate and PEM private key.
    ///
    /// ## Errors
    /// `CertificateInvalid` if either cannot be parsed or the key does not
    /// belong to the certificate.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> FiscalResult<Self> {
        let cert = X509::from_pem(cert_pem).map_err(|e| {
            FiscalError::CertificateInvalid(format!("unreadable certificate: {}", e))
        })?;
        let key = PKey::private_key_from_pem(key_pem).map_err(|e| {
            FiscalError::CertificateInvalid(format!("unreadable private key: {}", e))
        })?;

        if !cert.public_key()?.public_eq(&key) {
            return Err(FiscalError::CertificateInvalid(
                "private key does not match the certificate".into(),
            ));
        }

        let info = CertificateInfo {
            subject: subject_of(&cert),
            not_before: to_utc(cert.not_before())?,
            not_after: to_utc(cert.not_after())?,
        };

        Ok(CmsSigner { cert, key, info })
    }

    pub fn from_files(cert_path: &Path, key_path: &Path) -> FiscalResult<Self> {
        let read = |path: &Path| {
            std::fs::read(path).map_err(|e| {
                FiscalError::CertificateInvalid(format!("cannot read {}: {}", path.display(), e))
            })
        };
        Self::from_pem(&read(cert_path)?, &read(key_path)?)
    }

    pub fn info(&self) -> &CertificateInfo {
        &self.info
    }
}

impl TicketSigner for CmsSigner {
    fn sign(&self, request: &str) -> FiscalResult<String> {
        self.info.check_validity(Utc::now())?;

        let cms = CmsContentInfo::sign(
            Some(&self.cert),
            Some(&self.key),
            None,
            Some(request.as_bytes()),
            CMSOptions::BINARY,
        )?;
        let der = cms.to_der()?;

        debug!(subject = %self.info.subject, bytes = der.len(), "Login request signed");
        Ok(STANDARD.encode(der))
    }

    fn certificate(&self) -> Option<CertificateInfo> {
        Some(self.info.clone())
    }
}

fn subject_of(cert: &X509) -> String {
    cert.subject_name()
        .entries()
        .filter_map(|entry| {
            let key = entry.object().nid().short_name().ok()?;
            let value = entry.data().as_utf8().ok()?;
            Some(format!("{}={}", key, value))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn to_utc(time: &Asn1TimeRef) -> FiscalResult<DateTime<Utc>> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    let secs = diff.days as i64 * 86_400 + diff.secs as i64;
    DateTime::from_timestamp(secs, 0).ok_or_else(|| {
        FiscalError::CertificateInvalid(format!("validity date out of range: {}", time))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::self_signed;

    #[test]
    fn test_login_request_xml() {
        let now = DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let tra = LoginTicketRequest::new("wsfe", now, chrono::Duration::hours(12));
        let xml = tra.to_xml();

        assert!(xml.contains("<service>wsfe</service>"));
        assert!(xml.contains("<generationTime>2026-03-01T11:50:00+00:00</generationTime>"));
        assert!(xml.contains("<expirationTime>2026-03-02T00:00:00+00:00</expirationTime>"));
        assert!(xml.contains(&format!("<uniqueId>{}</uniqueId>", tra.unique_id)));
        crate::xml::Element::parse(&xml).unwrap();
    }

    #[test]
    fn test_sign_produces_cms() {
        let (cert, key) = self_signed(-1, 365);
        let signer = CmsSigner::from_pem(&cert, &key).unwrap();

        let encoded = signer.sign("<loginTicketRequest/>").unwrap();
        let der = STANDARD.decode(encoded).unwrap();
        CmsContentInfo::from_der(&der).unwrap();

        let info = signer.certificate().unwrap();
        assert!(info.subject.contains("CN=fiscal test"));
        assert!(info.days_left(Utc::now()) >= 363);
    }

    #[test]
    fn test_expired_certificate_rejected() {
        let (cert, key) = self_signed(-30, -1);
        let signer = CmsSigner::from_pem(&cert, &key).unwrap();
        let err = signer.sign("<x/>").unwrap_err();
        assert!(matches!(err, FiscalError::CertificateInvalid(ref m) if m.contains("expired")));
    }

    #[test]
    fn test_not_yet_valid_certificate_rejected() {
        let (cert, key) = self_signed(2, 30);
        let signer = CmsSigner::from_pem(&cert, &key).unwrap();
        assert!(matches!(
            signer.sign("<x/>"),
            Err(FiscalError::CertificateInvalid(_))
        ));
    }

    #[test]
    fn test_mismatched_key_rejected() {
        let (cert, _) = self_signed(-1, 30);
        let (_, other_key) = self_signed(-1, 30);
        let err = CmsSigner::from_pem(&cert, &other_key).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_garbage_pem_rejected() {
        assert!(matches!(
            CmsSigner::from_pem(b"nope", b"nope"),
            Err(FiscalError::CertificateInvalid(_))
        ));
        assert!(matches!(
            CmsSigner::from_files(Path::new("/nonexistent/c.pem"), Path::new("/nonexistent/k.pem")),
            Err(FiscalError::CertificateInvalid(_))
        ));
    }
}
