//! IaC repo roots tracked by the catalog scanner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::error::CoreError;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IacRepo {
    pub id: i64,
    pub kind: String,
    pub root_path: String,
    pub url: Option<String>,
    pub branch: Option<String>,
    pub last_commit: Option<String>,
    pub enabled: bool,
    pub last_scan_at: Option<DateTime<Utc>>,
}

impl IacRepo {
    pub async fn upsert(pool: &PgPool, kind: &str, root_path: &str) -> Result<Self, CoreError> {
        sqlx::query_as::<_, IacRepo>(
            r#"
            INSERT INTO iac_repos (kind, root_path, enabled)
            VALUES ($1, $2, true)
            ON CONFLICT (kind, root_path) DO UPDATE SET kind = EXCLUDED.kind
            RETURNING *
            "#,
        )
        .bind(kind)
        .bind(root_path)
        .fetch_one(pool)
        .await
        .map_err(CoreError::from)
    }

    pub async fn mark_scanned(pool: &PgPool, id: i64) -> Result<(), CoreError> {
        sqlx::query("UPDATE iac_repos SET last_scan_at = now() WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await
            .map_err(CoreError::from)?;
        Ok(())
    }

    pub async fn list_enabled(pool: &PgPool) -> Result<Vec<Self>, CoreError> {
        sqlx::query_as::<_, IacRepo>("SELECT * FROM iac_repos WHERE enabled")
            .fetch_all(pool)
            .await
            .map_err(CoreError::from)
    }
}
