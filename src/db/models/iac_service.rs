//! Per-service rows parsed out of a stack's compose file.

use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::PgPool;

use crate::error::CoreError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvFileRef {
    pub path: String,
    pub sops: bool,
}

/// A single service block as normalized out of the compose model, ready to
/// upsert. Dual-shape YAML (mapping vs. list for `environment`/`ports`/
/// `labels`) is normalized before this point by the IaC scanner.
#[derive(Debug, Clone)]
pub struct ScannedService {
    pub service_name: String,
    pub container_name: Option<String>,
    pub image: Option<String>,
    pub labels: std::collections::HashMap<String, String>,
    pub env_keys: Vec<String>,
    pub env_files: Vec<EnvFileRef>,
    pub ports: Vec<String>,
    pub volumes: Vec<String>,
    pub deploy: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IacService {
    pub id: i64,
    pub stack_id: i64,
    pub service_name: String,
    pub container_name: Option<String>,
    pub image: Option<String>,
    pub labels: Json<std::collections::HashMap<String, String>>,
    pub env_keys: Vec<String>,
    pub env_files: Json<Vec<EnvFileRef>>,
    pub ports: Json<Vec<String>>,
    pub volumes: Json<Vec<String>>,
    pub deploy: Json<serde_json::Value>,
}

impl IacService {
    pub async fn upsert(
        pool: &PgPool,
        stack_id: i64,
        s: &ScannedService,
    ) -> Result<Self, CoreError> {
        sqlx::query_as::<_, IacService>(
            r#"
            INSERT INTO iac_services (
                stack_id, service_name, container_name, image, labels,
                env_keys, env_files, ports, volumes, deploy
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (stack_id, service_name) DO UPDATE SET
                container_name = EXCLUDED.container_name,
                image = EXCLUDED.image,
                labels = EXCLUDED.labels,
                env_keys = EXCLUDED.env_keys,
                env_files = EXCLUDED.env_files,
                ports = EXCLUDED.ports,
                volumes = EXCLUDED.volumes,
                deploy = EXCLUDED.deploy
            RETURNING *
            "#,
        )
        .bind(stack_id)
        .bind(&s.service_name)
        .bind(&s.container_name)
        .bind(&s.image)
        .bind(Json(&s.labels))
        .bind(&s.env_keys)
        .bind(Json(&s.env_files))
        .bind(Json(&s.ports))
        .bind(Json(&s.volumes))
        .bind(Json(&s.deploy))
        .fetch_one(pool)
        .await
        .map_err(CoreError::from)
    }

    pub async fn list_for_stack(pool: &PgPool, stack_id: i64) -> Result<Vec<Self>, CoreError> {
        sqlx::query_as::<_, IacService>("SELECT * FROM iac_services WHERE stack_id = $1")
            .bind(stack_id)
            .fetch_all(pool)
            .await
            .map_err(CoreError::from)
    }

    pub async fn prune_missing(
        pool: &PgPool,
        stack_id: i64,
        seen_names: &[String],
    ) -> Result<u64, CoreError> {
        let result = sqlx::query(
            "DELETE FROM iac_services WHERE stack_id = $1 AND NOT (service_name = ANY($2))",
        )
        .bind(stack_id)
        .bind(seen_names)
        .execute(pool)
        .await
        .map_err(CoreError::from)?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::iac_repo::IacRepo;
    use crate::db::models::iac_stack::{DeployKind, IacStack, ScopeKind, SopsStatus};
    use std::collections::HashMap;

    async fn sample_stack(pool: &PgPool) -> IacStack {
        let repo = IacRepo::upsert(pool, "compose", "/data/docker-compose")
            .await
            .unwrap();
        IacStack::upsert(
            pool,
            repo.id,
            ScopeKind::Host,
            "h1",
            "web",
            "h1/web",
            Some("docker-compose.yml"),
            DeployKind::Compose,
            SopsStatus::None,
        )
        .await
        .unwrap()
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn upsert_then_prune(pool: PgPool) {
        let stack = sample_stack(&pool).await;

        let svc = ScannedService {
            service_name: "api".to_string(),
            container_name: Some("web-api-1".to_string()),
            image: Some("web:latest".to_string()),
            labels: HashMap::new(),
            env_keys: vec!["FOO".to_string()],
            env_files: vec![EnvFileRef { path: ".env".to_string(), sops: false }],
            ports: vec!["8080:80".to_string()],
            volumes: vec![],
            deploy: serde_json::json!({}),
        };
        IacService::upsert(&pool, stack.id, &svc).await.unwrap();

        let svc2 = ScannedService { service_name: "db".to_string(), ..svc.clone() };
        IacService::upsert(&pool, stack.id, &svc2).await.unwrap();

        let all = IacService::list_for_stack(&pool, stack.id).await.unwrap();
        assert_eq!(all.len(), 2);

        let pruned = IacService::prune_missing(&pool, stack.id, &["api".to_string()])
            .await
            .unwrap();
        assert_eq!(pruned, 1);

        let remaining = IacService::list_for_stack(&pool, stack.id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].service_name, "api");
    }
}
