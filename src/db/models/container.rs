//! Observed containers, one row per `(host_id, container_id)`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::PgPool;

use crate::error::CoreError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortMapping {
    pub ip: Option<String>,
    pub public_port: Option<u16>,
    pub private_port: u16,
    #[serde(rename = "type")]
    pub typ: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountInfo {
    pub source: String,
    pub destination: String,
    pub mode: String,
    #[serde(rename = "type")]
    pub typ: String,
}

/// Everything the Fleet Scanner learned about one container during a scan.
#[derive(Debug, Clone)]
pub struct ScannedContainer {
    pub container_id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
    pub ports: Vec<PortMapping>,
    pub labels: HashMap<String, String>,
    pub env: Vec<String>,
    pub networks: serde_json::Value,
    pub mounts: Vec<MountInfo>,
    pub created_ts: Option<DateTime<Utc>>,
    pub ip_addr: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Container {
    pub id: i64,
    pub host_id: i64,
    pub stack_id: Option<i64>,
    pub container_id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
    pub ports: Json<Vec<PortMapping>>,
    pub labels: Json<HashMap<String, String>>,
    pub env: Json<Vec<String>>,
    pub networks: Json<serde_json::Value>,
    pub mounts: Json<Vec<MountInfo>>,
    pub created_ts: Option<DateTime<Utc>>,
    pub ip_addr: Option<String>,
    pub deployment_stamp_id: Option<i64>,
    pub deployment_hash: Option<String>,
    pub owner: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Container {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.0.get(key).map(|s| s.as_str())
    }

    pub async fn upsert(
        pool: &PgPool,
        host_id: i64,
        stack_id: Option<i64>,
        c: &ScannedContainer,
    ) -> Result<Self, CoreError> {
        sqlx::query_as::<_, Container>(
            r#"
            INSERT INTO containers (
                host_id, stack_id, container_id, name, image, state, status,
                ports, labels, env, networks, mounts, created_ts, ip_addr, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, now())
            ON CONFLICT (host_id, container_id) DO UPDATE SET
                stack_id = EXCLUDED.stack_id,
                name = EXCLUDED.name,
                image = EXCLUDED.image,
                state = EXCLUDED.state,
                status = EXCLUDED.status,
                ports = EXCLUDED.ports,
                labels = EXCLUDED.labels,
                env = EXCLUDED.env,
                networks = EXCLUDED.networks,
                mounts = EXCLUDED.mounts,
                created_ts = EXCLUDED.created_ts,
                ip_addr = EXCLUDED.ip_addr,
                updated_at = now()
            RETURNING *
            "#,
        )
        .bind(host_id)
        .bind(stack_id)
        .bind(&c.container_id)
        .bind(&c.name)
        .bind(&c.image)
        .bind(&c.state)
        .bind(&c.status)
        .bind(Json(&c.ports))
        .bind(Json(&c.labels))
        .bind(Json(&c.env))
        .bind(Json(&c.networks))
        .bind(Json(&c.mounts))
        .bind(c.created_ts)
        .bind(&c.ip_addr)
        .fetch_one(pool)
        .await
        .map_err(CoreError::from)
    }

    /// Delete any container row for this host whose long ID is not in
    /// `seen_ids`. Returns the number of rows pruned.
    pub async fn prune_missing(
        pool: &PgPool,
        host_id: i64,
        seen_ids: &[String],
    ) -> Result<u64, CoreError> {
        let result = sqlx::query(
            "DELETE FROM containers WHERE host_id = $1 AND NOT (container_id = ANY($2))",
        )
        .bind(host_id)
        .bind(seen_ids)
        .execute(pool)
        .await
        .map_err(CoreError::from)?;
        Ok(result.rows_affected())
    }

    pub async fn list_for_host(pool: &PgPool, host_id: i64) -> Result<Vec<Self>, CoreError> {
        sqlx::query_as::<_, Container>("SELECT * FROM containers WHERE host_id = $1")
            .bind(host_id)
            .fetch_all(pool)
            .await
            .map_err(CoreError::from)
    }

    /// Containers across the whole fleet labelled with the given sanitized
    /// compose project name; used by the Drift Engine and the Orchestrator's
    /// stamp association.
    pub async fn list_by_project(pool: &PgPool, project: &str) -> Result<Vec<Self>, CoreError> {
        sqlx::query_as::<_, Container>(
            "SELECT * FROM containers WHERE labels->>'com.docker.compose.project' = $1",
        )
        .bind(project)
        .fetch_all(pool)
        .await
        .map_err(CoreError::from)
    }

    /// Batch-associate every container currently labelled with `project`
    /// to a deployment stamp. Idempotent; safe to retry.
    pub async fn associate_with_stamp(
        pool: &PgPool,
        project: &str,
        stamp_id: i64,
        deployment_hash: &str,
    ) -> Result<u64, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE containers
            SET deployment_stamp_id = $1, deployment_hash = $2, updated_at = now()
            WHERE labels->>'com.docker.compose.project' = $3
            "#,
        )
        .bind(stamp_id)
        .bind(deployment_hash)
        .bind(project)
        .execute(pool)
        .await
        .map_err(CoreError::from)?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::host::Host;
    use std::collections::HashMap;

    fn sample(container_id: &str, project: &str) -> ScannedContainer {
        let mut labels = HashMap::new();
        labels.insert("com.docker.compose.project".to_string(), project.to_string());
        ScannedContainer {
            container_id: container_id.to_string(),
            name: format!("/{project}-api-1"),
            image: "nginx:latest".to_string(),
            state: "running".to_string(),
            status: "Up 2 hours".to_string(),
            ports: vec![PortMapping {
                ip: Some("0.0.0.0".to_string()),
                public_port: Some(8080),
                private_port: 80,
                typ: "tcp".to_string(),
            }],
            labels,
            env: vec!["FOO=bar".to_string()],
            networks: serde_json::json!({}),
            mounts: vec![],
            created_ts: Some(Utc::now()),
            ip_addr: Some("172.17.0.2".to_string()),
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn upsert_then_prune_removes_missing(pool: PgPool) {
        let host = Host::upsert(&pool, "h1", "10.0.0.1", &HashMap::new(), &[], None)
            .await
            .unwrap();

        Container::upsert(&pool, host.id, None, &sample("c1", "web"))
            .await
            .unwrap();
        Container::upsert(&pool, host.id, None, &sample("c2", "web"))
            .await
            .unwrap();

        let all = Container::list_for_host(&pool, host.id).await.unwrap();
        assert_eq!(all.len(), 2);

        let pruned = Container::prune_missing(&pool, host.id, &["c1".to_string()])
            .await
            .unwrap();
        assert_eq!(pruned, 1);

        let remaining = Container::list_for_host(&pool, host.id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].container_id, "c1");
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn associate_with_stamp_updates_by_project_label(pool: PgPool) {
        let host = Host::upsert(&pool, "h1", "10.0.0.1", &HashMap::new(), &[], None)
            .await
            .unwrap();
        Container::upsert(&pool, host.id, None, &sample("c1", "web"))
            .await
            .unwrap();

        let updated = Container::associate_with_stamp(&pool, "web", 42, "abc123")
            .await
            .unwrap();
        assert_eq!(updated, 1);

        let containers = Container::list_by_project(&pool, "web").await.unwrap();
        assert_eq!(containers[0].deployment_stamp_id, Some(42));
        assert_eq!(containers[0].deployment_hash.as_deref(), Some("abc123"));
    }
}
