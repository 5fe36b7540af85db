//! Runtime stacks: one row per distinct Compose project observed on a host.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::error::CoreError;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RuntimeStack {
    pub id: i64,
    pub host_id: i64,
    pub project: String,
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RuntimeStack {
    pub async fn upsert(pool: &PgPool, host_id: i64, project: &str) -> Result<Self, CoreError> {
        sqlx::query_as::<_, RuntimeStack>(
            r#"
            INSERT INTO runtime_stacks (host_id, project, created_at, updated_at)
            VALUES ($1, $2, now(), now())
            ON CONFLICT (host_id, project) DO UPDATE SET updated_at = now()
            RETURNING *
            "#,
        )
        .bind(host_id)
        .bind(project)
        .fetch_one(pool)
        .await
        .map_err(CoreError::from)
    }

    pub async fn find_by_host_and_project(
        pool: &PgPool,
        host_id: i64,
        project: &str,
    ) -> Result<Option<Self>, CoreError> {
        sqlx::query_as::<_, RuntimeStack>(
            "SELECT * FROM runtime_stacks WHERE host_id = $1 AND project = $2",
        )
        .bind(host_id)
        .bind(project)
        .fetch_optional(pool)
        .await
        .map_err(CoreError::from)
    }

    pub async fn list_for_host(pool: &PgPool, host_id: i64) -> Result<Vec<Self>, CoreError> {
        sqlx::query_as::<_, RuntimeStack>("SELECT * FROM runtime_stacks WHERE host_id = $1")
            .bind(host_id)
            .fetch_all(pool)
            .await
            .map_err(CoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::host::Host;
    use std::collections::HashMap;

    #[sqlx::test(migrations = "./migrations")]
    async fn upsert_is_idempotent_per_host_project(pool: PgPool) {
        let host = Host::upsert(&pool, "h1", "10.0.0.1", &HashMap::new(), &[], None)
            .await
            .unwrap();

        let s1 = RuntimeStack::upsert(&pool, host.id, "web").await.unwrap();
        let s2 = RuntimeStack::upsert(&pool, host.id, "web").await.unwrap();
        assert_eq!(s1.id, s2.id);

        let found = RuntimeStack::find_by_host_and_project(&pool, host.id, "web")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, s1.id);

        let list = RuntimeStack::list_for_host(&pool, host.id).await.unwrap();
        assert_eq!(list.len(), 1);
    }
}
