//! # Engine Configuration
//!
//! Configuration for the authorization engine.
//!
//! ## Configuration Sources (Priority Order)
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     FISCAL_ENVIRONMENT=production                                      │
//! │     FISCAL_TAXPAYER_ID=20123456786                                     │
//! │     FISCAL_CERT_PATH=/etc/fiscal/cert.pem                              │
//! │                                                                         │
//! │  2. Config File (fiscal.toml)                                          │
//! │     [service]                                                           │
//! │     environment = "sandbox"                                            │
//! │     [[credentials]]                                                     │
//! │     taxpayer_id = "20123456786"                                        │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     environment = sandbox, request timeout = 15s                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Certificates and keys are referenced by path only. Nothing secret is
//! compiled in.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use fiscal_core::TaxpayerId;

use crate::error::{FiscalError, FiscalResult};

// =============================================================================
// Environment
// =============================================================================

/// Which deployment of the tax authority to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Homologation services. Vouchers have no fiscal validity.
    #[default]
    Sandbox,
    Production,
}

impl Environment {
    pub fn default_auth_url(self) -> &'static str {
        match self {
            Environment::Sandbox => "https://wsaahomo.afip.gov.ar/ws/services/LoginCms",
            Environment::Production => "https://wsaa.afip.gov.ar/ws/services/LoginCms",
        }
    }

    pub fn default_invoice_url(self) -> &'static str {
        match self {
            Environment::Sandbox => "https://wswhomo.afip.gov.ar/wsfev1/service.asmx",
            Environment::Production => "https://servicios1.afip.gov.ar/wsfev1/service.asmx",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Sandbox => write!(f, "sandbox"),
            Environment::Production => write!(f, "production"),
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = FiscalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sandbox" | "homologation" | "homo" => Ok(Environment::Sandbox),
            "production" | "prod" => Ok(Environment::Production),
            _ => Err(FiscalError::InvalidConfig(format!(
                "Unknown environment: {}",
                s
            ))),
        }
    }
}

// =============================================================================
// Service Settings
// =============================================================================

/// Remote endpoints and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    #[serde(default)]
    pub environment: Environment,

    /// Overrides the environment's authentication endpoint.
    #[serde(default)]
    pub auth_url: Option<String>,

    /// Overrides the environment's invoice endpoint.
    #[serde(default)]
    pub invoice_url: Option<String>,

    /// Timeout applied to every remote call.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    15
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            auth_url: None,
            invoice_url: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ServiceSettings {
    pub fn auth_url(&self) -> &str {
        self.auth_url
            .as_deref()
            .unwrap_or_else(|| self.environment.default_auth_url())
    }

    pub fn invoice_url(&self) -> &str {
        self.invoice_url
            .as_deref()
            .unwrap_or_else(|| self.environment.default_invoice_url())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// =============================================================================
// Auth Settings
// =============================================================================

/// Login ticket settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    /// Service name the ticket is requested for.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Requested ticket lifetime. The authority caps it at 12 hours.
    #[serde(default = "default_ticket_ttl")]
    pub ticket_ttl_secs: u64,

    /// Sessions closer than this to expiry are renewed.
    #[serde(default = "default_safety_margin")]
    pub safety_margin_secs: u64,

    /// Total time spent retrying a renewal.
    #[serde(default = "default_retry_budget")]
    pub retry_budget_secs: u64,

    /// Maximum renewal requests per `get_valid_token` call.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
}

fn default_service_name() -> String {
    "wsfe".to_string()
}

fn default_ticket_ttl() -> u64 {
    12 * 60 * 60
}

fn default_safety_margin() -> u64 {
    300
}

fn default_retry_budget() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    4
}

fn default_initial_backoff() -> u64 {
    500
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            ticket_ttl_secs: default_ticket_ttl(),
            safety_margin_secs: default_safety_margin(),
            retry_budget_secs: default_retry_budget(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
        }
    }
}

impl AuthSettings {
    pub fn ticket_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ticket_ttl_secs as i64)
    }

    pub fn safety_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.safety_margin_secs as i64)
    }

    pub fn retry_budget(&self) -> Duration {
        Duration::from_secs(self.retry_budget_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }
}

// =============================================================================
// Sequence Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceSettings {
    /// How long a submission waits for the tuple's lock before giving up.
    #[serde(default = "default_lock_wait")]
    pub lock_wait_ms: u64,

    /// Immediate retries after a lock timeout within one pass.
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,
}

fn default_lock_wait() -> u64 {
    30_000
}

fn default_conflict_retries() -> u32 {
    2
}

impl Default for SequenceSettings {
    fn default() -> Self {
        Self {
            lock_wait_ms: default_lock_wait(),
            conflict_retries: default_conflict_retries(),
        }
    }
}

impl SequenceSettings {
    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }
}

// =============================================================================
// Scheduler Settings
// =============================================================================

/// Background reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Attempts per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// `pending` attempts younger than this are left to the direct trigger.
    #[serde(default = "default_min_age")]
    pub min_age_secs: u64,

    /// `processing` attempts untouched for this long are reclaimed.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    /// Passes through `processing` before an attempt is given up.
    #[serde(default = "default_max_passes")]
    pub max_passes: u32,

    /// Automated re-arms allowed per attempt.
    #[serde(default = "default_auto_rearm_limit")]
    pub auto_rearm_limit: u32,
}

fn default_true() -> bool {
    true
}

fn default_interval() -> u64 {
    60
}

fn default_batch_size() -> u32 {
    25
}

fn default_min_age() -> u64 {
    30
}

fn default_stale_after() -> u64 {
    300
}

fn default_max_passes() -> u32 {
    10
}

fn default_auto_rearm_limit() -> u32 {
    1
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval(),
            batch_size: default_batch_size(),
            min_age_secs: default_min_age(),
            stale_after_secs: default_stale_after(),
            max_passes: default_max_passes(),
            auto_rearm_limit: default_auto_rearm_limit(),
        }
    }
}

impl SchedulerSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn min_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.min_age_secs as i64)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }
}

// =============================================================================
// Database / HTTP Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file. Defaults to the platform data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Write-lock wait for concurrent passes.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_max_connections() -> u32 {
    5
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl DatabaseSettings {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// The configured path, or `fiscal.db` in the platform data directory.
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            directories::ProjectDirs::from("com", "fiscal", "authorization")
                .map(|dirs| dirs.data_dir().join("fiscal.db"))
                .unwrap_or_else(|| PathBuf::from("fiscal.db"))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8088
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// Certificate and key a taxpayer signs login requests with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialSettings {
    pub taxpayer_id: TaxpayerId,
    /// PEM X.509 certificate issued by the authority.
    pub certificate_path: PathBuf,
    /// PEM private key matching the certificate.
    pub key_path: PathBuf,
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub service: ServiceSettings,

    #[serde(default)]
    pub auth: AuthSettings,

    #[serde(default)]
    pub sequence: SequenceSettings,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub http: HttpSettings,

    #[serde(default)]
    pub credentials: Vec<CredentialSettings>,
}

impl EngineConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (fiscal.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> FiscalResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading fiscal config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = Self::from_toml(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(contents: &str) -> FiscalResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> FiscalResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| FiscalError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Fiscal config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> FiscalResult<()> {
        for (name, raw) in [
            ("auth_url", self.service.auth_url()),
            ("invoice_url", self.service.invoice_url()),
        ] {
            let parsed = url::Url::parse(raw)
                .map_err(|e| FiscalError::InvalidConfig(format!("{} is not a URL: {}", name, e)))?;
            if parsed.scheme() != "https" && parsed.scheme() != "http" {
                return Err(FiscalError::InvalidConfig(format!(
                    "{} must be http(s), got: {}",
                    name, raw
                )));
            }
        }

        if self.service.environment == Environment::Production {
            let insecure = [self.service.auth_url(), self.service.invoice_url()]
                .iter()
                .any(|u| u.starts_with("http://"));
            if insecure {
                return Err(FiscalError::InvalidConfig(
                    "production endpoints must use https".into(),
                ));
            }
        }

        if self.service.request_timeout_secs == 0 {
            return Err(FiscalError::InvalidConfig(
                "request_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.auth.safety_margin_secs >= self.auth.ticket_ttl_secs {
            return Err(FiscalError::InvalidConfig(
                "safety_margin_secs must be shorter than ticket_ttl_secs".into(),
            ));
        }

        if self.auth.max_attempts == 0 {
            return Err(FiscalError::InvalidConfig(
                "max_attempts must be greater than 0".into(),
            ));
        }

        if self.scheduler.batch_size == 0 {
            return Err(FiscalError::InvalidConfig(
                "batch_size must be greater than 0".into(),
            ));
        }

        if self.scheduler.max_passes == 0 {
            return Err(FiscalError::InvalidConfig(
                "max_passes must be greater than 0".into(),
            ));
        }

        if self.scheduler.interval_secs == 0 {
            return Err(FiscalError::InvalidConfig(
                "interval_secs must be greater than 0".into(),
            ));
        }

        // A pass still waiting on the authority must not look abandoned.
        let longest_pass = self.longest_pass_secs();
        if self.scheduler.stale_after_secs <= longest_pass {
            return Err(FiscalError::InvalidConfig(format!(
                "stale_after_secs must exceed {} (login budget, every lock wait and three request timeouts)",
                longest_pass
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for cred in &self.credentials {
            if !seen.insert(cred.taxpayer_id.clone()) {
                return Err(FiscalError::InvalidConfig(format!(
                    "credentials for {} listed twice",
                    cred.taxpayer_id
                )));
            }
        }

        Ok(())
    }

    /// Upper bound on one processing pass: a login that exhausts its retry
    /// budget, the first lock wait plus every conflict retry, and the
    /// last-number query, submission and lookup.
    pub fn longest_pass_secs(&self) -> u64 {
        let timeout = self.service.request_timeout_secs;
        let login = self.auth.retry_budget_secs + u64::from(self.auth.max_attempts) * timeout;
        let lock_waits =
            (u64::from(self.sequence.conflict_retries) + 1) * self.sequence.lock_wait_ms.div_ceil(1000);
        login + lock_waits + timeout * 3
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(env) = std::env::var("FISCAL_ENVIRONMENT") {
            match env.parse() {
                Ok(parsed) => {
                    debug!(environment = %env, "Overriding environment from environment");
                    self.service.environment = parsed;
                }
                Err(_) => warn!(environment = %env, "Unknown environment in FISCAL_ENVIRONMENT"),
            }
        }

        if let Ok(path) = std::env::var("FISCAL_DB_PATH") {
            self.database.path = Some(PathBuf::from(path));
        }

        if let Ok(secs) = std::env::var("FISCAL_REQUEST_TIMEOUT_SECS") {
            if let Ok(s) = secs.parse::<u64>() {
                self.service.request_timeout_secs = s;
            }
        }

        if let Ok(port) = std::env::var("FISCAL_HTTP_PORT") {
            if let Ok(p) = port.parse::<u16>() {
                debug!(port = p, "Overriding HTTP port from environment");
                self.http.port = p;
            }
        }

        // A single taxpayer can be configured entirely from the environment.
        let taxpayer = std::env::var("FISCAL_TAXPAYER_ID").ok();
        let cert = std::env::var("FISCAL_CERT_PATH").ok();
        let key = std::env::var("FISCAL_KEY_PATH").ok();
        if let (Some(taxpayer), Some(cert), Some(key)) = (taxpayer, cert, key) {
            match TaxpayerId::parse(&taxpayer) {
                Ok(taxpayer_id) => {
                    self.credentials.retain(|c| c.taxpayer_id != taxpayer_id);
                    self.credentials.push(CredentialSettings {
                        taxpayer_id,
                        certificate_path: PathBuf::from(cert),
                        key_path: PathBuf::from(key),
                    });
                }
                Err(e) => warn!(error = %e, "Ignoring invalid FISCAL_TAXPAYER_ID"),
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "fiscal", "authorization")
            .map(|dirs| dirs.config_dir().join("fiscal.toml"))
    }

    pub fn credentials_for(&self, taxpayer_id: &TaxpayerId) -> Option<&CredentialSettings> {
        self.credentials
            .iter()
            .find(|c| &c.taxpayer_id == taxpayer_id)
    }
}
