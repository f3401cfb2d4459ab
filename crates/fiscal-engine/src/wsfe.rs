//! # Invoice Service Client
//!
//! SOAP client for the authority's electronic invoice service.
//!
//! | Operation                | Used for                                  |
//! |--------------------------|-------------------------------------------|
//! | `FECAESolicitar`         | requesting an authorization code          |
//! | `FECompUltimoAutorizado` | sequencing: last number for a tuple       |
//! | `FECompConsultar`        | reconciling an ambiguous submission       |
//! | `FEDummy`                | diagnostics: service health               |
//!
//! Header-level `Errors/Err` and detail-level `Observaciones/Obs` are both
//! kept verbatim and classified with the rejection table. The response
//! detail is a list even for a single voucher.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, warn};

use fiscal_core::{
    Approval, AuthorizationOutcome, AuthorizationRequest, AuthorizedVoucher, DocumentType, Money,
    ReceiverDocType, RejectionTable, RemoteMessage, TaxLine, VatRate,
};

use crate::auth_session::Credentials;
use crate::config::ServiceSettings;
use crate::error::{FiscalError, FiscalResult};
use crate::xml::{escape, Element};

const SOAP_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const WSFE_NS: &str = "http://ar.gov.afip.dif.FEV1/";

/// "No data found" for a voucher lookup.
const NO_DATA_CODE: i64 = 602;

const DATE_FORMAT: &str = "%Y%m%d";

// =============================================================================
// Service Trait
// =============================================================================

/// Health of the authority's servers as reported by `FEDummy`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub app_server: String,
    pub db_server: String,
    pub auth_server: String,
}

impl ServerStatus {
    pub fn is_ok(&self) -> bool {
        [&self.app_server, &self.db_server, &self.auth_server]
            .iter()
            .all(|s| s.eq_ignore_ascii_case("OK"))
    }
}

/// The authority's invoice service.
#[async_trait]
pub trait InvoiceService: Send + Sync {
    /// Requests an authorization code for one voucher.
    async fn authorize(
        &self,
        credentials: &Credentials,
        request: &AuthorizationRequest,
    ) -> FiscalResult<AuthorizationOutcome>;

    /// Last number the authority authorized for the tuple (0 if none).
    async fn last_authorized(
        &self,
        credentials: &Credentials,
        point_of_sale: u32,
        document_type: DocumentType,
    ) -> FiscalResult<i64>;

    /// The authorized voucher with this number, if the authority has one.
    async fn lookup(
        &self,
        credentials: &Credentials,
        point_of_sale: u32,
        document_type: DocumentType,
        number: i64,
    ) -> FiscalResult<Option<AuthorizedVoucher>>;

    async fn server_status(&self) -> FiscalResult<ServerStatus>;
}

// =============================================================================
// SOAP Client
// =============================================================================

#[derive(Debug, Clone)]
pub struct WsfeClient {
    http: reqwest::Client,
    url: String,
    rejections: Arc<RejectionTable>,
}

impl WsfeClient {
    pub fn new(
        url: impl Into<String>,
        timeout: Duration,
        rejections: Arc<RejectionTable>,
    ) -> FiscalResult<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(WsfeClient {
            http,
            url: url.into(),
            rejections,
        })
    }

    pub fn from_settings(
        settings: &ServiceSettings,
        rejections: Arc<RejectionTable>,
    ) -> FiscalResult<Self> {
        Self::new(settings.invoice_url(), settings.request_timeout(), rejections)
    }

    /// Posts `body` as `action` and returns the `{action}Result` element.
    async fn call(&self, action: &'static str, body: String) -> FiscalResult<Element> {
        debug!(action, url = %self.url, "Calling invoice service");

        let response = self
            .http
            .post(&self.url)
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", format!("\"{}{}\"", WSFE_NS, action))
            .body(envelope(&body))
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        let root = match Element::parse(&text) {
            Ok(root) => root,
            Err(_) if !status.is_success() => {
                return Err(FiscalError::transport(action, format!("HTTP {}", status)))
            }
            Err(e) => return Err(e),
        };
        if let Some(fault) = root.fault() {
            return Err(FiscalError::transport(action, format!("SOAP fault {}", fault)));
        }

        let result_name = format!("{}Result", action);
        root.find(&result_name).cloned().ok_or_else(|| {
            FiscalError::transport(action, format!("response has no {}", result_name))
        })
    }
}

#[async_trait]
impl InvoiceService for WsfeClient {
    async fn authorize(
        &self,
        credentials: &Credentials,
        request: &AuthorizationRequest,
    ) -> FiscalResult<AuthorizationOutcome> {
        let result = self
            .call("FECAESolicitar", authorize_body(credentials, request))
            .await?;
        parse_authorize(&result, &self.rejections)
    }

    async fn last_authorized(
        &self,
        credentials: &Credentials,
        point_of_sale: u32,
        document_type: DocumentType,
    ) -> FiscalResult<i64> {
        let body = format!(
            "<ar:FECompUltimoAutorizado>{}<ar:PtoVta>{}</ar:PtoVta><ar:CbteTipo>{}</ar:CbteTipo></ar:FECompUltimoAutorizado>",
            auth_block(credentials),
            point_of_sale,
            document_type.code()
        );
        let result = self.call("FECompUltimoAutorizado", body).await?;

        let errors = messages(&result, "Errors", "Err");
        if !errors.is_empty() {
            return Err(FiscalError::BusinessRejection(self.rejections.classify(errors)));
        }
        remote_field(&result, "CbteNro", "FECompUltimoAutorizado", |s| {
            s.parse::<i64>().ok()
        })
    }

    async fn lookup(
        &self,
        credentials: &Credentials,
        point_of_sale: u32,
        document_type: DocumentType,
        number: i64,
    ) -> FiscalResult<Option<AuthorizedVoucher>> {
        let body = format!(
            "<ar:FECompConsultar>{}<ar:FeCompConsReq><ar:CbteTipo>{}</ar:CbteTipo><ar:CbteNro>{}</ar:CbteNro><ar:PtoVta>{}</ar:PtoVta></ar:FeCompConsReq></ar:FECompConsultar>",
            auth_block(credentials),
            document_type.code(),
            number,
            point_of_sale
        );
        let result = self.call("FECompConsultar", body).await?;
        parse_lookup(&result, &self.rejections)
    }

    async fn server_status(&self) -> FiscalResult<ServerStatus> {
        let result = self
            .call("FEDummy", "<ar:FEDummy/>".to_string())
            .await?;
        Ok(ServerStatus {
            app_server: result.child_text("AppServer").unwrap_or_default().to_string(),
            db_server: result.child_text("DbServer").unwrap_or_default().to_string(),
            auth_server: result.child_text("AuthServer").unwrap_or_default().to_string(),
        })
    }
}

// =============================================================================
// Request Building
// =============================================================================

fn envelope(body: &str) -> String {
    format!(
        r#"<soapenv:Envelope xmlns:soapenv="{}" xmlns:ar="{}"><soapenv:Header/><soapenv:Body>{}</soapenv:Body></soapenv:Envelope>"#,
        SOAP_NS, WSFE_NS, body
    )
}

fn auth_block(credentials: &Credentials) -> String {
    format!(
        "<ar:Auth><ar:Token>{}</ar:Token><ar:Sign>{}</ar:Sign><ar:Cuit>{}</ar:Cuit></ar:Auth>",
        escape(&credentials.token),
        escape(&credentials.sign),
        credentials.taxpayer_id.as_u64()
    )
}

fn tag(out: &mut String, name: &str, value: impl std::fmt::Display) {
    out.push_str(&format!("<ar:{0}>{1}</ar:{0}>", name, value));
}

fn authorize_body(credentials: &Credentials, request: &AuthorizationRequest) -> String {
    let detail = &request.detail;
    let amounts = &detail.amounts;

    let mut det = String::new();
    tag(&mut det, "Concepto", detail.concept.code());
    tag(&mut det, "DocTipo", detail.receiver_doc_type.code());
    tag(&mut det, "DocNro", detail.receiver_doc_number);
    tag(&mut det, "CbteDesde", detail.number_from);
    tag(&mut det, "CbteHasta", detail.number_to);
    tag(&mut det, "CbteFch", detail.invoice_date.format(DATE_FORMAT));
    tag(&mut det, "ImpTotal", amounts.total().to_wire());
    tag(&mut det, "ImpTotConc", amounts.untaxed().to_wire());
    tag(&mut det, "ImpNeto", amounts.net().to_wire());
    tag(&mut det, "ImpOpEx", amounts.exempt().to_wire());
    tag(&mut det, "ImpTrib", Money::zero().to_wire());
    tag(&mut det, "ImpIVA", amounts.tax().to_wire());
    if let Some(period) = &detail.service_period {
        tag(&mut det, "FchServDesde", period.from.format(DATE_FORMAT));
        tag(&mut det, "FchServHasta", period.to.format(DATE_FORMAT));
        tag(&mut det, "FchVtoPago", period.payment_due.format(DATE_FORMAT));
    }
    tag(&mut det, "MonId", detail.currency);
    tag(&mut det, "MonCotiz", detail.currency_rate);
    if !amounts.tax_lines.is_empty() {
        det.push_str("<ar:Iva>");
        for line in &amounts.tax_lines {
            det.push_str("<ar:AlicIva>");
            tag(&mut det, "Id", line.rate.id());
            tag(&mut det, "BaseImp", line.base().to_wire());
            tag(&mut det, "Importe", line.amount().to_wire());
            det.push_str("</ar:AlicIva>");
        }
        det.push_str("</ar:Iva>");
    }
    if let Some(condition) = detail.receiver_tax_condition {
        tag(&mut det, "CondicionIVAReceptorId", condition.code());
    }

    format!(
        concat!(
            "<ar:FECAESolicitar>{}<ar:FeCAEReq>",
            "<ar:FeCabReq><ar:CantReg>{}</ar:CantReg><ar:PtoVta>{}</ar:PtoVta><ar:CbteTipo>{}</ar:CbteTipo></ar:FeCabReq>",
            "<ar:FeDetReq><ar:FECAEDetRequest>{}</ar:FECAEDetRequest></ar:FeDetReq>",
            "</ar:FeCAEReq></ar:FECAESolicitar>"
        ),
        auth_block(credentials),
        request.count,
        request.point_of_sale,
        request.document_type.code(),
        det
    )
}

// =============================================================================
// Response Parsing
// =============================================================================

fn messages(parent: &Element, container: &str, item: &str) -> Vec<RemoteMessage> {
    parent
        .child(container)
        .map(|c| {
            c.children_named(item)
                .map(|m| {
                    RemoteMessage::new(
                        m.child_text("Code")
                            .and_then(|code| code.parse().ok())
                            .unwrap_or(0),
                        m.child_text("Msg").unwrap_or_default(),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

fn remote_field<T>(
    parent: &Element,
    name: &str,
    operation: &'static str,
    parse: impl FnOnce(&str) -> Option<T>,
) -> FiscalResult<T> {
    let raw = parent.child_text(name).unwrap_or_default();
    parse(raw).ok_or_else(|| {
        FiscalError::transport(operation, format!("unreadable {} '{}'", name, raw))
    })
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT).ok()
}

fn parse_authorize(
    result: &Element,
    rejections: &RejectionTable,
) -> FiscalResult<AuthorizationOutcome> {
    const OP: &str = "FECAESolicitar";

    let errors = messages(result, "Errors", "Err");
    let details = result
        .child("FeDetResp")
        .map(|d| d.children_named("FECAEDetResponse").collect::<Vec<_>>())
        .unwrap_or_default();
    if details.len() > 1 {
        warn!(count = details.len(), "More than one detail for a single-voucher request");
    }

    let Some(detail) = details.first().copied() else {
        if errors.is_empty() {
            return Err(FiscalError::transport(OP, "response has neither detail nor errors"));
        }
        return Ok(AuthorizationOutcome::Rejected(rejections.classify(errors)));
    };

    let observations = messages(detail, "Observaciones", "Obs");
    let approved = detail.child_text("Resultado") == Some("A");
    let code = detail.child_text("CAE").unwrap_or_default();

    if approved && !code.is_empty() {
        return Ok(AuthorizationOutcome::Approved(Approval {
            number: remote_field(detail, "CbteDesde", OP, |s| s.parse().ok())?,
            authorization_code: code.to_string(),
            authorization_expiry: remote_field(detail, "CAEFchVto", OP, parse_date)?,
            observations,
        }));
    }

    let mut all = errors;
    all.extend(observations);
    Ok(AuthorizationOutcome::Rejected(rejections.classify(all)))
}

fn parse_tax_lines(voucher: &Element) -> FiscalResult<Vec<TaxLine>> {
    const OP: &str = "FECompConsultar";

    let Some(iva) = voucher.child("Iva") else {
        return Ok(Vec::new());
    };
    iva.children_named("AlicIva")
        .map(|line| -> FiscalResult<TaxLine> {
            Ok(TaxLine {
                rate: remote_field(line, "Id", OP, |s| {
                    s.parse().ok().and_then(|id| VatRate::from_id(id).ok())
                })?,
                base_cents: remote_field(line, "BaseImp", OP, |s| Money::from_wire(s).ok())?
                    .cents(),
                amount_cents: remote_field(line, "Importe", OP, |s| Money::from_wire(s).ok())?
                    .cents(),
            })
        })
        .collect()
}

fn parse_lookup(
    result: &Element,
    rejections: &RejectionTable,
) -> FiscalResult<Option<AuthorizedVoucher>> {
    const OP: &str = "FECompConsultar";

    let errors = messages(result, "Errors", "Err");
    if errors.iter().any(|e| e.code == NO_DATA_CODE) {
        return Ok(None);
    }
    if !errors.is_empty() {
        return Err(FiscalError::BusinessRejection(rejections.classify(errors)));
    }

    let Some(voucher) = result.child("ResultGet") else {
        return Ok(None);
    };
    if voucher.child_text("Resultado") != Some("A") {
        return Ok(None);
    }

    Ok(Some(AuthorizedVoucher {
        point_of_sale: remote_field(voucher, "PtoVta", OP, |s| s.parse().ok())?,
        document_type: remote_field(voucher, "CbteTipo", OP, |s| {
            s.parse().ok().and_then(|c| DocumentType::from_code(c).ok())
        })?,
        number: remote_field(voucher, "CbteDesde", OP, |s| s.parse().ok())?,
        receiver_doc_type: remote_field(voucher, "DocTipo", OP, |s| {
            s.parse().ok().and_then(|c| ReceiverDocType::from_code(c).ok())
        })?,
        receiver_doc_number: remote_field(voucher, "DocNro", OP, |s| s.parse().ok())?,
        total: remote_field(voucher, "ImpTotal", OP, |s| Money::from_wire(s).ok())?,
        net: remote_field(voucher, "ImpNeto", OP, |s| Money::from_wire(s).ok())?,
        tax: remote_field(voucher, "ImpIVA", OP, |s| Money::from_wire(s).ok())?,
        tax_lines: parse_tax_lines(voucher)?,
        invoice_date: voucher.child_text("CbteFch").and_then(parse_date),
        authorization_code: remote_field(voucher, "CodAutorizacion", OP, |s| {
            (!s.is_empty()).then(|| s.to_string())
        })?,
        authorization_expiry: remote_field(voucher, "FchVto", OP, parse_date)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use crate::testing::fixtures;
    use fiscal_core::{RejectionClass, TaxpayerId};
    use wiremock::matchers::{body_string_contains, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials() -> Credentials {
        Credentials {
            taxpayer_id: TaxpayerId::parse("20123456786").unwrap(),
            token: "tok<en>".into(),
            sign: "sig".into(),
            expires_at: DateTime::<Utc>::MAX_UTC,
        }
    }

    fn respond(action: &str, inner: &str) -> String {
        format!(
            concat!(
                r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">"#,
                r#"<soap:Body><{0}Response xmlns="http://ar.gov.afip.dif.FEV1/">"#,
                "<{0}Result>{1}</{0}Result>",
                "</{0}Response></soap:Body></soap:Envelope>"
            ),
            action, inner
        )
    }

    async fn client(server: &MockServer) -> WsfeClient {
        WsfeClient::new(
            server.uri(),
            Duration::from_secs(5),
            Arc::new(RejectionTable::standard()),
        )
        .unwrap()
    }

    fn request() -> AuthorizationRequest {
        let attempt = fixtures::attempt();
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        AuthorizationRequest::build(&attempt, 8, date).unwrap()
    }

    #[test]
    fn test_authorize_body() {
        let body = authorize_body(&credentials(), &request());

        assert!(body.contains("<ar:Token>tok&lt;en&gt;</ar:Token>"));
        assert!(body.contains("<ar:Cuit>20123456786</ar:Cuit>"));
        assert!(body.contains("<ar:CantReg>1</ar:CantReg><ar:PtoVta>3</ar:PtoVta><ar:CbteTipo>6</ar:CbteTipo>"));
        assert!(body.contains("<ar:CbteDesde>8</ar:CbteDesde><ar:CbteHasta>8</ar:CbteHasta>"));
        assert!(body.contains("<ar:CbteFch>20260301</ar:CbteFch>"));
        assert!(body.contains("<ar:ImpTotal>121.00</ar:ImpTotal>"));
        assert!(body.contains("<ar:ImpNeto>100.00</ar:ImpNeto>"));
        assert!(body.contains("<ar:ImpIVA>21.00</ar:ImpIVA>"));
        assert!(body.contains("<ar:MonId>PES</ar:MonId><ar:MonCotiz>1</ar:MonCotiz>"));
        assert!(body.contains(
            "<ar:AlicIva><ar:Id>5</ar:Id><ar:BaseImp>100.00</ar:BaseImp><ar:Importe>21.00</ar:Importe></ar:AlicIva>"
        ));
        assert!(!body.contains("FchServDesde"));
        Element::parse(&envelope(&body)).unwrap();
    }

    #[test]
    fn test_parse_approved() {
        let root = Element::parse(&respond(
            "FECAESolicitar",
            concat!(
                "<FeCabResp><Resultado>A</Resultado></FeCabResp>",
                "<FeDetResp><FECAEDetResponse>",
                "<CbteDesde>8</CbteDesde><CbteHasta>8</CbteHasta><Resultado>A</Resultado>",
                "<Observaciones><Obs><Code>10217</Code><Msg>informativa</Msg></Obs></Observaciones>",
                "<CAE>76091234567890</CAE><CAEFchVto>20260311</CAEFchVto>",
                "</FECAEDetResponse></FeDetResp>"
            ),
        ))
        .unwrap();
        let result = root.find("FECAESolicitarResult").unwrap();

        match parse_authorize(result, &RejectionTable::standard()).unwrap() {
            AuthorizationOutcome::Approved(approval) => {
                assert_eq!(approval.number, 8);
                assert_eq!(approval.authorization_code, "76091234567890");
                assert_eq!(
                    approval.authorization_expiry,
                    NaiveDate::from_ymd_opt(2026, 3, 11).unwrap()
                );
                assert_eq!(approval.observations.len(), 1);
            }
            other => panic!("expected approval, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejected_collects_errors_and_observations() {
        let root = Element::parse(&respond(
            "FECAESolicitar",
            concat!(
                "<FeCabResp><Resultado>R</Resultado></FeCabResp>",
                "<FeDetResp><FECAEDetResponse><Resultado>R</Resultado>",
                "<Observaciones><Obs><Code>10242</Code><Msg>El campo Condicion Frente al IVA del receptor es obligatorio</Msg></Obs></Observaciones>",
                "<CAE></CAE><CAEFchVto></CAEFchVto>",
                "</FECAEDetResponse></FeDetResp>"
            ),
        ))
        .unwrap();
        let result = root.find("FECAESolicitarResult").unwrap();

        match parse_authorize(result, &RejectionTable::standard()).unwrap() {
            AuthorizationOutcome::Rejected(rejection) => {
                assert_eq!(rejection.class, RejectionClass::MissingReceiverTaxCondition);
                assert_eq!(rejection.code, Some(10242));
                assert!(rejection.cause().contains("Condicion Frente al IVA"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_header_errors_without_detail() {
        let root = Element::parse(&respond(
            "FECAESolicitar",
            "<Errors><Err><Code>600</Code><Msg>ValidacionDeToken: token expirado</Msg></Err></Errors>",
        ))
        .unwrap();
        let result = root.find("FECAESolicitarResult").unwrap();

        match parse_authorize(result, &RejectionTable::standard()).unwrap() {
            AuthorizationOutcome::Rejected(rejection) => {
                assert_eq!(rejection.class, RejectionClass::ExpiredCredentials);
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_empty_result_is_transport_failure() {
        let root = Element::parse(&respond("FECAESolicitar", "<FeCabResp/>")).unwrap();
        let result = root.find("FECAESolicitarResult").unwrap();
        assert!(matches!(
            parse_authorize(result, &RejectionTable::standard()),
            Err(FiscalError::TransportFailure { .. })
        ));
    }

    #[tokio::test]
    async fn test_authorize_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("SOAPAction", "\"http://ar.gov.afip.dif.FEV1/FECAESolicitar\""))
            .and(body_string_contains("<ar:CbteDesde>8</ar:CbteDesde>"))
            .respond_with(ResponseTemplate::new(200).set_body_string(respond(
                "FECAESolicitar",
                concat!(
                    "<FeDetResp><FECAEDetResponse><CbteDesde>8</CbteDesde><Resultado>A</Resultado>",
                    "<CAE>76091234567890</CAE><CAEFchVto>20260311</CAEFchVto>",
                    "</FECAEDetResponse></FeDetResp>"
                ),
            )))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = client(&server)
            .await
            .authorize(&credentials(), &request())
            .await
            .unwrap();
        assert!(matches!(outcome, AuthorizationOutcome::Approved(_)));
    }

    #[tokio::test]
    async fn test_last_authorized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("<ar:PtoVta>3</ar:PtoVta><ar:CbteTipo>6</ar:CbteTipo>"))
            .respond_with(ResponseTemplate::new(200).set_body_string(respond(
                "FECompUltimoAutorizado",
                "<PtoVta>3</PtoVta><CbteTipo>6</CbteTipo><CbteNro>41</CbteNro>",
            )))
            .mount(&server)
            .await;

        let last = client(&server)
            .await
            .last_authorized(&credentials(), 3, DocumentType::InvoiceB)
            .await
            .unwrap();
        assert_eq!(last, 41);
    }

    #[tokio::test]
    async fn test_last_authorized_errors_are_rejections() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(respond(
                "FECompUltimoAutorizado",
                "<Errors><Err><Code>600</Code><Msg>No validaron las firmas</Msg></Err></Errors>",
            )))
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .last_authorized(&credentials(), 3, DocumentType::InvoiceB)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FiscalError::BusinessRejection(ref r) if r.class == RejectionClass::ExpiredCredentials
        ));
    }

    #[tokio::test]
    async fn test_lookup_found_and_missing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("<ar:CbteNro>8</ar:CbteNro>"))
            .respond_with(ResponseTemplate::new(200).set_body_string(respond(
                "FECompConsultar",
                concat!(
                    "<ResultGet><Concepto>1</Concepto><DocTipo>99</DocTipo><DocNro>0</DocNro>",
                    "<CbteDesde>8</CbteDesde><CbteHasta>8</CbteHasta><CbteFch>20260301</CbteFch>",
                    "<ImpTotal>121</ImpTotal><ImpNeto>100</ImpNeto><ImpIVA>21</ImpIVA>",
                    "<Iva><AlicIva><Id>5</Id><BaseImp>100</BaseImp><Importe>21</Importe></AlicIva></Iva>",
                    "<Resultado>A</Resultado>",
                    "<CodAutorizacion>76091234567890</CodAutorizacion><FchVto>20260311</FchVto>",
                    "<PtoVta>3</PtoVta><CbteTipo>6</CbteTipo></ResultGet>"
                ),
            )))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("<ar:CbteNro>9</ar:CbteNro>"))
            .respond_with(ResponseTemplate::new(200).set_body_string(respond(
                "FECompConsultar",
                "<Errors><Err><Code>602</Code><Msg>Sin Resultados</Msg></Err></Errors>",
            )))
            .mount(&server)
            .await;

        let client = client(&server).await;
        let voucher = client
            .lookup(&credentials(), 3, DocumentType::InvoiceB, 8)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(voucher.total, Money::from_cents(12_100));
        assert_eq!(voucher.tax, Money::from_cents(2_100));
        assert_eq!(voucher.tax_lines.len(), 1);
        assert_eq!(voucher.tax_lines[0].rate, VatRate::TwentyOne);
        assert_eq!(voucher.receiver_doc_type, ReceiverDocType::Unidentified);
        assert!(voucher.mismatch_with(&fixtures::attempt()).is_none());

        assert!(client
            .lookup(&credentials(), 3, DocumentType::InvoiceB, 9)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_server_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("SOAPAction", "\"http://ar.gov.afip.dif.FEV1/FEDummy\""))
            .respond_with(ResponseTemplate::new(200).set_body_string(respond(
                "FEDummy",
                "<AppServer>OK</AppServer><DbServer>OK</DbServer><AuthServer>OK</AuthServer>",
            )))
            .mount(&server)
            .await;

        let status = client(&server).await.server_status().await.unwrap();
        assert!(status.is_ok());
    }

    #[tokio::test]
    async fn test_soap_fault_is_transport_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string(
                "<soap:Envelope><soap:Body><soap:Fault><faultcode>soap:Server</faultcode><faultstring>boom</faultstring></soap:Fault></soap:Body></soap:Envelope>",
            ))
            .mount(&server)
            .await;

        let err = client(&server).await.server_status().await.unwrap_err();
        assert!(matches!(err, FiscalError::TransportFailure { .. }));
        assert!(err.to_string().contains("boom"));
    }
}
