//! # Taxpayer Configuration Repository
//!
//! Which CUIT and point of sale each branch invoices under.
//!
//! Configurations are deactivated, never deleted, because attempts keep a
//! reference to the configuration they were created with.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use fiscal_core::validation::validate_point_of_sale;
use fiscal_core::{TaxpayerConfig, TaxpayerId};

#[derive(Debug, FromRow)]
struct TaxpayerConfigRow {
    id: String,
    branch_id: String,
    taxpayer_id: String,
    point_of_sale: i64,
    legal_name: Option<String>,
    active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TaxpayerConfigRow> for TaxpayerConfig {
    type Error = DbError;

    fn try_from(row: TaxpayerConfigRow) -> Result<Self, Self::Error> {
        Ok(TaxpayerConfig {
            taxpayer_id: TaxpayerId::parse(&row.taxpayer_id)
                .map_err(|e| DbError::InvalidData(e.to_string()))?,
            point_of_sale: u32::try_from(row.point_of_sale)
                .map_err(|e| DbError::InvalidData(e.to_string()))?,
            id: row.id,
            branch_id: row.branch_id,
            legal_name: row.legal_name,
            active: row.active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, branch_id, taxpayer_id, point_of_sale, legal_name, active,
           created_at, updated_at
    FROM taxpayer_configs
"#;

/// Repository for taxpayer configuration operations.
#[derive(Debug, Clone)]
pub struct TaxpayerConfigRepository {
    pool: SqlitePool,
}

impl TaxpayerConfigRepository {
    /// Creates a new TaxpayerConfigRepository.
    pub fn new(pool: SqlitePool) -> Self {
        TaxpayerConfigRepository { pool }
    }

    /// Registers the configuration a branch invoices under from now on.
    ///
    /// The branch's previous active configuration is deactivated in the same
    /// transaction.
    pub async fn register(
        &self,
        branch_id: &str,
        taxpayer_id: &TaxpayerId,
        point_of_sale: u32,
        legal_name: Option<&str>,
    ) -> DbResult<TaxpayerConfig> {
        validate_point_of_sale(point_of_sale).map_err(fiscal_core::CoreError::from)?;

        let now = Utc::now();
        let config = TaxpayerConfig {
            id: Uuid::new_v4().to_string(),
            branch_id: branch_id.to_string(),
            taxpayer_id: taxpayer_id.clone(),
            point_of_sale,
            legal_name: legal_name.map(str::to_string),
            active: true,
            created_at: now,
            updated_at: now,
        };

        let mut tx = self.pool.begin().await?;

        let replaced = sqlx::query(
            r#"
            UPDATE taxpayer_configs
            SET active = 0, updated_at = ?1
            WHERE branch_id = ?2 AND active = 1
            "#,
        )
        .bind(now)
        .bind(branch_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            r#"
            INSERT INTO taxpayer_configs (
                id, branch_id, taxpayer_id, point_of_sale, legal_name, active,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)
            "#,
        )
        .bind(&config.id)
        .bind(&config.branch_id)
        .bind(config.taxpayer_id.as_str())
        .bind(config.point_of_sale as i64)
        .bind(&config.legal_name)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::UniqueViolation { .. } => DbError::duplicate(
                "point_of_sale",
                format!("{}/{}", taxpayer_id, point_of_sale),
            ),
            other => other,
        })?;

        tx.commit().await?;

        info!(
            branch_id = %branch_id,
            taxpayer = %taxpayer_id,
            pos = point_of_sale,
            replaced,
            "Taxpayer configuration registered"
        );

        Ok(config)
    }

    /// Deactivates a configuration.
    pub async fn deactivate(&self, id: &str) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE taxpayer_configs
            SET active = 0, updated_at = ?2
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("TaxpayerConfig", id));
        }

        debug!(id = %id, "Taxpayer configuration deactivated");
        Ok(())
    }

    /// Gets a configuration by ID, active or not.
    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<TaxpayerConfig>> {
        let sql = format!("{} WHERE id = ?1", SELECT_COLUMNS);
        sqlx::query_as::<_, TaxpayerConfigRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(TaxpayerConfig::try_from)
            .transpose()
    }

    /// The branch's active configuration, if any.
    pub async fn active_for_branch(&self, branch_id: &str) -> DbResult<Option<TaxpayerConfig>> {
        let sql = format!("{} WHERE branch_id = ?1 AND active = 1", SELECT_COLUMNS);
        sqlx::query_as::<_, TaxpayerConfigRow>(&sql)
            .bind(branch_id)
            .fetch_optional(&self.pool)
            .await?
            .map(TaxpayerConfig::try_from)
            .transpose()
    }

    /// Active configurations of one taxpayer, ordered by point of sale.
    pub async fn active_for_taxpayer(
        &self,
        taxpayer_id: &TaxpayerId,
    ) -> DbResult<Vec<TaxpayerConfig>> {
        let sql = format!(
            "{} WHERE taxpayer_id = ?1 AND active = 1 ORDER BY point_of_sale",
            SELECT_COLUMNS
        );
        sqlx::query_as::<_, TaxpayerConfigRow>(&sql)
            .bind(taxpayer_id.as_str())
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(TaxpayerConfig::try_from)
            .collect()
    }

    /// All active configurations, ordered by branch.
    pub async fn list_active(&self) -> DbResult<Vec<TaxpayerConfig>> {
        let sql = format!("{} WHERE active = 1 ORDER BY branch_id", SELECT_COLUMNS);
        sqlx::query_as::<_, TaxpayerConfigRow>(&sql)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(TaxpayerConfig::try_from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    fn cuit(raw: &str) -> TaxpayerId {
        TaxpayerId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_register_replaces_active_config() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.taxpayers();

        let first = repo
            .register("branch-1", &cuit("20123456786"), 3, Some("Kiosco Uno"))
            .await
            .unwrap();
        let second = repo
            .register("branch-1", &cuit("20123456786"), 4, None)
            .await
            .unwrap();

        let active = repo.active_for_branch("branch-1").await.unwrap().unwrap();
        assert_eq!(active.id, second.id);
        assert_eq!(active.point_of_sale, 4);

        let old = repo.get_by_id(&first.id).await.unwrap().unwrap();
        assert!(!old.active);
        assert_eq!(old.legal_name.as_deref(), Some("Kiosco Uno"));
    }

    #[tokio::test]
    async fn test_point_of_sale_unique_per_taxpayer() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.taxpayers();

        repo.register("branch-1", &cuit("20123456786"), 3, None)
            .await
            .unwrap();
        let err = repo
            .register("branch-2", &cuit("20123456786"), 3, None)
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());

        // Same POS number under another taxpayer is fine
        repo.register("branch-2", &cuit("20111111112"), 3, None)
            .await
            .unwrap();
        assert_eq!(repo.list_active().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_deactivate() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.taxpayers();

        let config = repo
            .register("branch-1", &cuit("20123456786"), 3, None)
            .await
            .unwrap();
        repo.deactivate(&config.id).await.unwrap();

        assert!(repo.active_for_branch("branch-1").await.unwrap().is_none());
        assert!(repo
            .active_for_taxpayer(&cuit("20123456786"))
            .await
            .unwrap()
            .is_empty());
        assert!(matches!(
            repo.deactivate("missing").await,
            Err(DbError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_rejects_invalid_point_of_sale() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let err = db
            .taxpayers()
            .register("branch-1", &cuit("20123456786"), 0, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Domain(_)));
    }
}
