//! # HTTP API
//!
//! | Method | Path                              | Operation                   |
//! |--------|-----------------------------------|-----------------------------|
//! | POST   | /invoices                         | create_attempt              |
//! | GET    | /invoices/{sale_id}               | get_attempt                 |
//! | POST   | /invoices/{sale_id}/authorize     | submit_for_authorization    |
//! | POST   | /invoices/{sale_id}/rearm         | operator re-arm             |
//! | GET    | /taxpayers                        | active configurations       |
//! | POST   | /taxpayers                        | register a branch config    |
//! | DELETE | /taxpayers/{id}                   | deactivate a config         |
//! | GET    | /diagnostics/{taxpayer_id}        | diagnostics report          |
//! | POST   | /reconcile                        | scheduler tick, now         |
//! | GET    | /health                           | liveness + attempt counts   |

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use fiscal_core::{
    AuthorizationResult, DocumentType, InvoiceAttempt, NewInvoiceAttempt, TaxpayerConfig,
    TaxpayerId,
};
use fiscal_db::StateCounts;
use fiscal_engine::{
    DiagnosticsProbe, DiagnosticsReport, InvoiceProcessor, ReconcileReport, SchedulerHandle,
    SequenceTarget,
};

use crate::error::ApiError;

type ApiResult<T> = Result<T, ApiError>;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<InvoiceProcessor>,
    pub diagnostics: Arc<DiagnosticsProbe>,
    pub scheduler: SchedulerHandle,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/invoices", post(create_invoice))
        .route("/invoices/{sale_id}", get(get_invoice))
        .route("/invoices/{sale_id}/authorize", post(authorize_invoice))
        .route("/invoices/{sale_id}/rearm", post(rearm_invoice))
        .route("/taxpayers", get(list_taxpayers).post(register_taxpayer))
        .route("/taxpayers/{id}", delete(deactivate_taxpayer))
        .route("/diagnostics/{taxpayer_id}", get(diagnostics))
        .route("/reconcile", post(reconcile))
        .route("/health", get(health))
        .with_state(state)
}

// =============================================================================
// Invoices
// =============================================================================

async fn create_invoice(
    State(state): State<AppState>,
    Json(input): Json<NewInvoiceAttempt>,
) -> ApiResult<(StatusCode, Json<InvoiceAttempt>)> {
    let attempt = state.processor.create_attempt(input).await?;
    info!(sale_id = %attempt.sale_id, attempt_id = %attempt.id, "Attempt created");
    Ok((StatusCode::CREATED, Json(attempt)))
}

async fn get_invoice(
    State(state): State<AppState>,
    Path(sale_id): Path<String>,
) -> ApiResult<Json<InvoiceAttempt>> {
    Ok(Json(state.processor.get_attempt(&sale_id).await?))
}

async fn authorize_invoice(
    State(state): State<AppState>,
    Path(sale_id): Path<String>,
) -> ApiResult<Json<AuthorizationResult>> {
    Ok(Json(state.processor.submit_for_authorization(&sale_id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct RearmRequest {
    #[serde(default)]
    pub reason: String,
}

async fn rearm_invoice(
    State(state): State<AppState>,
    Path(sale_id): Path<String>,
    Json(request): Json<RearmRequest>,
) -> ApiResult<Json<InvoiceAttempt>> {
    let attempt = state.processor.rearm(&sale_id, &request.reason).await?;
    info!(sale_id = %sale_id, reason = %request.reason, "Attempt re-armed by operator");
    Ok(Json(attempt))
}

// =============================================================================
// Taxpayer Configurations
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct RegisterTaxpayer {
    pub branch_id: String,
    pub taxpayer_id: TaxpayerId,
    pub point_of_sale: u32,
    #[serde(default)]
    pub legal_name: Option<String>,
}

async fn list_taxpayers(State(state): State<AppState>) -> ApiResult<Json<Vec<TaxpayerConfig>>> {
    Ok(Json(state.processor.db().taxpayers().list_active().await?))
}

async fn register_taxpayer(
    State(state): State<AppState>,
    Json(request): Json<RegisterTaxpayer>,
) -> ApiResult<(StatusCode, Json<TaxpayerConfig>)> {
    let config = state
        .processor
        .db()
        .taxpayers()
        .register(
            &request.branch_id,
            &request.taxpayer_id,
            request.point_of_sale,
            request.legal_name.as_deref(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(config)))
}

async fn deactivate_taxpayer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.processor.db().taxpayers().deactivate(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Operations
// =============================================================================

/// Optional single sequence tuple; both fields or neither.
#[derive(Debug, Default, Deserialize)]
pub struct DiagnosticsQuery {
    pub point_of_sale: Option<u32>,
    pub document_type: Option<DocumentType>,
}

async fn diagnostics(
    State(state): State<AppState>,
    Path(taxpayer_id): Path<String>,
    Query(query): Query<DiagnosticsQuery>,
) -> ApiResult<Json<DiagnosticsReport>> {
    let taxpayer_id =
        TaxpayerId::parse(&taxpayer_id).map_err(|e| ApiError::bad_request(e.to_string()))?;

    let targets = match (query.point_of_sale, query.document_type) {
        (Some(point_of_sale), Some(document_type)) => vec![SequenceTarget {
            point_of_sale,
            document_type,
        }],
        (None, None) => Vec::new(),
        _ => {
            return Err(ApiError::bad_request(
                "point_of_sale and document_type go together",
            ))
        }
    };

    Ok(Json(state.diagnostics.run(&taxpayer_id, &targets).await))
}

async fn reconcile(State(state): State<AppState>) -> ApiResult<Json<ReconcileReport>> {
    Ok(Json(state.scheduler.run_once().await?))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: bool,
    /// `(total, applied)`
    pub migrations: Option<(usize, usize)>,
    pub attempts: Option<StateCounts>,
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let db = state.processor.db();
    let database = db.health_check().await;
    let migrations = db.migration_status().await.ok();
    let attempts = db.attempts().count_by_state().await.ok();

    let current = matches!(migrations, Some((total, applied)) if total == applied);
    let (status, label) = if database && current {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    (
        status,
        Json(HealthResponse {
            status: label,
            database,
            migrations,
            attempts,
        }),
    )
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use fiscal_engine::testing::{fixtures, test_config, FakeAuthority, TestEngine, TAXPAYER};
    use fiscal_engine::ReconciliationScheduler;

    struct TestApp {
        engine: TestEngine,
        router: Router,
    }

    impl TestApp {
        async fn start() -> Self {
            let mut config = test_config();
            config.scheduler.enabled = false;
            let engine = TestEngine::with_parts(config, FakeAuthority::new()).await;

            let (scheduler, handle) =
                ReconciliationScheduler::new(engine.processor.clone(), engine.config.scheduler.clone());
            tokio::spawn(scheduler.run());

            let router = router(AppState {
                processor: engine.processor.clone(),
                diagnostics: Arc::new(engine.diagnostics()),
                scheduler: handle,
            });
            TestApp { engine, router }
        }

        async fn call(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
            let request = Request::builder().method(method).uri(uri);
            let request = match body {
                Some(body) => request
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string())),
                None => request.body(Body::empty()),
            }
            .unwrap();

            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            let value = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap()
            };
            (status, value)
        }
    }

    fn new_invoice(sale_id: &str) -> Value {
        serde_json::to_value(fixtures::new_attempt(sale_id)).unwrap()
    }

    #[tokio::test]
    async fn test_create_authorize_and_read_back() {
        let app = TestApp::start().await;

        let (status, created) = app
            .call(Method::POST, "/invoices", Some(new_invoice("sale-1")))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["state"], "pending");

        let (status, result) = app
            .call(Method::POST, "/invoices/sale-1/authorize", None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["status"], "authorized");
        assert_eq!(result["number"], 1);

        let (status, attempt) = app.call(Method::GET, "/invoices/sale-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(attempt["state"], "completed");
        assert_eq!(attempt["authorization_code"], result["authorization_code"]);
    }

    #[tokio::test]
    async fn test_errors_carry_codes() {
        let app = TestApp::start().await;

        let (status, body) = app.call(Method::GET, "/invoices/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");

        app.call(Method::POST, "/invoices", Some(new_invoice("sale-1")))
            .await;
        let (status, body) = app
            .call(Method::POST, "/invoices", Some(new_invoice("sale-1")))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "duplicate");

        let (status, body) = app
            .call(
                Method::POST,
                "/invoices/sale-1/rearm",
                Some(json!({ "reason": "retry" })),
            )
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "validation");
    }

    #[tokio::test]
    async fn test_unknown_branch_is_not_found() {
        let app = TestApp::start().await;
        let mut invoice = new_invoice("sale-1");
        invoice["branch_id"] = json!("branch-9");

        let (status, body) = app.call(Method::POST, "/invoices", Some(invoice)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn test_register_moves_branch_to_new_config() {
        let app = TestApp::start().await;

        let (status, config) = app
            .call(
                Method::POST,
                "/taxpayers",
                Some(json!({
                    "branch_id": "branch-1",
                    "taxpayer_id": TAXPAYER,
                    "point_of_sale": 4,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(config["point_of_sale"], 4);

        let (_, active) = app.call(Method::GET, "/taxpayers", None).await;
        let active = active.as_array().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0]["id"], config["id"]);

        let (_, created) = app
            .call(Method::POST, "/invoices", Some(new_invoice("sale-1")))
            .await;
        assert_eq!(created["point_of_sale"], 4);

        let uri = format!("/taxpayers/{}", config["id"].as_str().unwrap());
        let (status, _) = app.call(Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = app
            .call(Method::POST, "/invoices", Some(new_invoice("sale-2")))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_reconcile_runs_a_tick() {
        let app = TestApp::start().await;
        app.engine.create("sale-1").await;
        app.engine.create("sale-2").await;

        let (status, report) = app.call(Method::POST, "/reconcile", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["selected"], 2);
        assert_eq!(report["completed"], 2);
    }

    #[tokio::test]
    async fn test_diagnostics_endpoint() {
        let app = TestApp::start().await;

        let (status, _) = app.call(Method::GET, "/diagnostics/not-a-cuit", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = app
            .call(Method::GET, &format!("/diagnostics/{}?point_of_sale=3", TAXPAYER), None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // The sequence is compared only under an existing session.
        app.engine
            .auth
            .get_valid_token(&fiscal_engine::testing::taxpayer())
            .await
            .unwrap();
        let uri = format!(
            "/diagnostics/{}?point_of_sale=3&document_type=invoice_b",
            TAXPAYER
        );
        let (status, report) = app.call(Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["taxpayer_id"], TAXPAYER);
        let names: Vec<&str> = report["checks"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec!["connectivity", "certificate", "session", "sequence:3:6"]
        );
    }

    #[tokio::test]
    async fn test_health_reports_counts() {
        let app = TestApp::start().await;
        app.engine.create("sale-1").await;

        let (status, body) = app.call(Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["attempts"]["pending"], 1);
        assert_eq!(body["migrations"][0], body["migrations"][1]);
    }
}
