//! # Authentication Session Repository
//!
//! One ticket per taxpayer. Writes replace the previous ticket.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use fiscal_core::{AuthSession, TaxpayerId};

#[derive(Debug, FromRow)]
struct AuthSessionRow {
    taxpayer_id: String,
    token: String,
    sign: String,
    generated_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<AuthSessionRow> for AuthSession {
    type Error = DbError;

    fn try_from(row: AuthSessionRow) -> Result<Self, Self::Error> {
        Ok(AuthSession {
            taxpayer_id: TaxpayerId::parse(&row.taxpayer_id)
                .map_err(|e| DbError::InvalidData(e.to_string()))?,
            token: row.token,
            sign: row.sign,
            generated_at: row.generated_at,
            expires_at: row.expires_at,
        })
    }
}

/// Repository for persisted session tickets.
#[derive(Debug, Clone)]
pub struct AuthSessionRepository {
    pool: SqlitePool,
}

impl AuthSessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        AuthSessionRepository { pool }
    }

    /// The stored ticket for a taxpayer, expired or not.
    pub async fn get(&self, taxpayer_id: &TaxpayerId) -> DbResult<Option<AuthSession>> {
        sqlx::query_as::<_, AuthSessionRow>(
            r#"
            SELECT taxpayer_id, token, sign, generated_at, expires_at
            FROM auth_sessions
            WHERE taxpayer_id = ?1
            "#,
        )
        .bind(taxpayer_id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .map(AuthSession::try_from)
        .transpose()
    }

    /// Stores a ticket, replacing any prior one for the taxpayer.
    pub async fn upsert(&self, session: &AuthSession) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO auth_sessions (
                taxpayer_id, token, sign, generated_at, expires_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (taxpayer_id) DO UPDATE SET
                token = excluded.token,
                sign = excluded.sign,
                generated_at = excluded.generated_at,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(session.taxpayer_id.as_str())
        .bind(&session.token)
        .bind(&session.sign)
        .bind(session.generated_at)
        .bind(session.expires_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        debug!(
            taxpayer = %session.taxpayer_id,
            expires_at = %session.expires_at,
            "Session stored"
        );
        Ok(())
    }

    /// Removes the stored ticket. Returns whether one existed.
    pub async fn delete(&self, taxpayer_id: &TaxpayerId) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM auth_sessions WHERE taxpayer_id = ?1")
            .bind(taxpayer_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
