//! # Diagnostics Probe
//!
//! Read-only operator checks for one taxpayer. Nothing here changes attempt
//! state or logs in, and nothing here fails: every problem becomes a `fail`
//! or `warn` check in the report. The sequence comparison only runs on a
//! session that is already cached and unexpired.
//!
//! | Check        | ok                        | warn                          | fail                          |
//! |--------------|---------------------------|-------------------------------|-------------------------------|
//! | connectivity | all servers report OK     | a server reports degraded     | unreachable                   |
//! | certificate  | 30+ days left             | under 30 days left            | expired, not yet valid, none  |
//! | session      | cached, beyond the margin | none cached, or within margin | (never)                       |
//! | sequence     | remote == local           | remote > local, no session    | remote < local, query failed  |

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use fiscal_core::{DocumentType, TaxpayerId};
use fiscal_db::Database;

use crate::auth_session::Credentials;
use crate::authorization::InvoiceAuthorizationClient;
use crate::error::FiscalResult;

/// Certificates closer than this to expiry produce a warning.
const CERTIFICATE_WARN_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

impl CheckResult {
    fn new(name: impl Into<String>, status: CheckStatus, detail: impl Into<String>) -> Self {
        CheckResult {
            name: name.into(),
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    pub taxpayer_id: TaxpayerId,
    pub generated_at: DateTime<Utc>,
    pub checks: Vec<CheckResult>,
}

impl DiagnosticsReport {
    /// The worst status among all checks.
    pub fn overall(&self) -> CheckStatus {
        self.checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(CheckStatus::Ok)
    }

    pub fn check(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }
}

/// A sequence tuple to compare, under the probed taxpayer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceTarget {
    pub point_of_sale: u32,
    pub document_type: DocumentType,
}

pub struct DiagnosticsProbe {
    client: Arc<InvoiceAuthorizationClient>,
    db: Database,
}

impl DiagnosticsProbe {
    pub fn new(client: Arc<InvoiceAuthorizationClient>, db: Database) -> Self {
        DiagnosticsProbe { client, db }
    }

    /// Runs every check for `taxpayer_id`.
    ///
    /// With no `targets`, the sequence check covers every document type
    /// completed locally under the taxpayer's active points of sale.
    pub async fn run(
        &self,
        taxpayer_id: &TaxpayerId,
        targets: &[SequenceTarget],
    ) -> DiagnosticsReport {
        let mut checks = vec![
            self.connectivity().await,
            self.certificate(taxpayer_id),
            self.session(taxpayer_id).await,
        ];
        checks.extend(self.sequence(taxpayer_id, targets).await);

        let report = DiagnosticsReport {
            taxpayer_id: taxpayer_id.clone(),
            generated_at: Utc::now(),
            checks,
        };
        info!(taxpayer = %taxpayer_id, overall = ?report.overall(), "Diagnostics finished");
        report
    }

    async fn connectivity(&self) -> CheckResult {
        const NAME: &str = "connectivity";
        let started = Instant::now();

        match self.client.server_status().await {
            Ok(status) => {
                let detail = format!(
                    "app={} db={} auth={} in {}ms",
                    status.app_server,
                    status.db_server,
                    status.auth_server,
                    started.elapsed().as_millis()
                );
                let outcome = if status.is_ok() {
                    CheckStatus::Ok
                } else {
                    CheckStatus::Warn
                };
                CheckResult::new(NAME, outcome, detail)
            }
            Err(e) => CheckResult::new(NAME, CheckStatus::Fail, e.to_string()),
        }
    }

    fn certificate(&self, taxpayer_id: &TaxpayerId) -> CheckResult {
        const NAME: &str = "certificate";
        let Some(info) = self.client.auth().certificate_info(taxpayer_id) else {
            return CheckResult::new(NAME, CheckStatus::Fail, "no certificate configured");
        };

        let now = Utc::now();
        if let Err(e) = info.check_validity(now) {
            return CheckResult::new(NAME, CheckStatus::Fail, e.to_string());
        }

        let days = info.days_left(now);
        let detail = format!(
            "{} valid {} to {}, {} days left",
            info.subject,
            info.not_before.date_naive(),
            info.not_after.date_naive(),
            days
        );
        let status = if days < CERTIFICATE_WARN_DAYS {
            CheckStatus::Warn
        } else {
            CheckStatus::Ok
        };
        CheckResult::new(NAME, status, detail)
    }

    async fn session(&self, taxpayer_id: &TaxpayerId) -> CheckResult {
        const NAME: &str = "session";
        let auth = self.client.auth();

        let session = match auth.current(taxpayer_id).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                return CheckResult::new(NAME, CheckStatus::Warn, "no session cached");
            }
            Err(e) => return CheckResult::new(NAME, CheckStatus::Warn, e.to_string()),
        };

        let now = Utc::now();
        let remaining = session.remaining(now);
        let detail = format!(
            "expires {} ({} min left)",
            session.expires_at,
            remaining.num_minutes()
        );
        if session.is_fresh(now, auth.safety_margin()) {
            CheckResult::new(NAME, CheckStatus::Ok, detail)
        } else {
            CheckResult::new(NAME, CheckStatus::Warn, format!("renewal due, {}", detail))
        }
    }

    async fn sequence(
        &self,
        taxpayer_id: &TaxpayerId,
        targets: &[SequenceTarget],
    ) -> Vec<CheckResult> {
        let targets = if targets.is_empty() {
            match self.default_targets(taxpayer_id).await {
                Ok(found) => found,
                Err(e) => {
                    return vec![CheckResult::new("sequence", CheckStatus::Fail, e.to_string())];
                }
            }
        } else {
            targets.to_vec()
        };

        if targets.is_empty() {
            return vec![CheckResult::new(
                "sequence",
                CheckStatus::Warn,
                "nothing completed locally to compare",
            )];
        }

        let credentials = match self.client.auth().current(taxpayer_id).await {
            Ok(Some(session)) if session.is_fresh(Utc::now(), chrono::Duration::zero()) => {
                Credentials::from(&session)
            }
            Ok(_) => {
                return vec![CheckResult::new(
                    "sequence",
                    CheckStatus::Warn,
                    "no live session, sequence not compared",
                )];
            }
            Err(e) => {
                return vec![CheckResult::new("sequence", CheckStatus::Fail, e.to_string())];
            }
        };

        let mut checks = Vec::with_capacity(targets.len());
        for target in targets {
            let name = format!(
                "sequence:{}:{}",
                target.point_of_sale,
                target.document_type.code()
            );

            let remote = self
                .client
                .last_authorized(&credentials, target.point_of_sale, target.document_type)
                .await;
            let local = self
                .db
                .attempts()
                .max_completed_number(taxpayer_id, target.point_of_sale, target.document_type)
                .await;

            let check = match (remote, local) {
                (Ok(remote), Ok(local)) => compare(name, remote, local.unwrap_or(0)),
                (Err(e), _) => CheckResult::new(name, CheckStatus::Fail, e.to_string()),
                (_, Err(e)) => CheckResult::new(name, CheckStatus::Fail, e.to_string()),
            };
            debug!(check = %check.name, status = ?check.status, "Sequence compared");
            checks.push(check);
        }
        checks
    }

    async fn default_targets(&self, taxpayer_id: &TaxpayerId) -> FiscalResult<Vec<SequenceTarget>> {
        let mut points: Vec<u32> = self
            .db
            .taxpayers()
            .active_for_taxpayer(taxpayer_id)
            .await?
            .into_iter()
            .map(|c| c.point_of_sale)
            .collect();
        points.dedup();

        let mut targets = Vec::new();
        for point_of_sale in points {
            for document_type in self
                .db
                .attempts()
                .completed_document_types(taxpayer_id, point_of_sale)
                .await?
            {
                targets.push(SequenceTarget {
                    point_of_sale,
                    document_type,
                });
            }
        }
        Ok(targets)
    }
}

fn compare(name: String, remote: i64, local: i64) -> CheckResult {
    let detail = format!("remote last {}, local last {}", remote, local);
    let status = match remote.cmp(&local) {
        std::cmp::Ordering::Equal => CheckStatus::Ok,
        // Issued elsewhere, or an outcome we never learned.
        std::cmp::Ordering::Greater => CheckStatus::Warn,
        std::cmp::Ordering::Less => CheckStatus::Fail,
    };
    CheckResult::new(name, status, detail)
}
