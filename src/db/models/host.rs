//! Host directory storage: `(name, address, vars, groups, owner)`.
//!
//! Hosts are created and updated by an external inventory import (out of
//! scope here); the core only reads and upserts them, and never deletes a
//! row on its own.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::PgPool;

use crate::error::CoreError;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Host {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub vars: Json<HashMap<String, String>>,
    pub groups: Vec<String>,
    pub owner: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Host {
    pub fn vars(&self) -> &HashMap<String, String> {
        &self.vars.0
    }

    /// A host is local if `vars.docker_local` is truthy, or its address is
    /// loopback/the literal `local` marker.
    pub fn is_local(&self) -> bool {
        if let Some(v) = self.vars().get("docker_local") {
            if matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes") {
                return true;
            }
        }
        matches!(self.address.as_str(), "local" | "localhost" | "127.0.0.1" | "::1")
    }

    /// Per-host Docker transport override, if `vars.docker_host` is set.
    pub fn docker_host_override(&self) -> Option<&str> {
        self.vars().get("docker_host").map(|s| s.as_str())
    }

    pub async fn find_by_name(pool: &PgPool, name: &str) -> Result<Option<Self>, CoreError> {
        sqlx::query_as::<_, Host>("SELECT * FROM hosts WHERE name = $1")
            .bind(name)
            .fetch_optional(pool)
            .await
            .map_err(CoreError::from)
    }

    pub async fn find_by_id(pool: &PgPool, id: i64) -> Result<Option<Self>, CoreError> {
        sqlx::query_as::<_, Host>("SELECT * FROM hosts WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(CoreError::from)
    }

    pub async fn list_all(pool: &PgPool) -> Result<Vec<Self>, CoreError> {
        sqlx::query_as::<_, Host>("SELECT * FROM hosts ORDER BY name")
            .fetch_all(pool)
            .await
            .map_err(CoreError::from)
    }

    /// Insert or refresh a host row by name.
    pub async fn upsert(
        pool: &PgPool,
        name: &str,
        address: &str,
        vars: &HashMap<String, String>,
        groups: &[String],
        owner: Option<&str>,
    ) -> Result<Self, CoreError> {
        sqlx::query_as::<_, Host>(
            r#"
            INSERT INTO hosts (name, address, vars, groups, owner, updated_at)
            VALUES ($1, $2, $3, $4, $5, now())
            ON CONFLICT (name) DO UPDATE SET
                address = EXCLUDED.address,
                vars = EXCLUDED.vars,
                groups = EXCLUDED.groups,
                owner = EXCLUDED.owner,
                updated_at = now()
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(address)
        .bind(Json(vars))
        .bind(groups)
        .bind(owner)
        .fetch_one(pool)
        .await
        .map_err(CoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_vars(local: bool) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        if local {
            vars.insert("docker_local".to_string(), "true".to_string());
        }
        vars
    }

    #[test]
    fn is_local_true_for_docker_local_var() {
        let host = Host {
            id: 1,
            name: "h1".into(),
            address: "10.0.0.5".into(),
            vars: Json(sample_vars(true)),
            groups: vec![],
            owner: None,
            updated_at: Utc::now(),
        };
        assert!(host.is_local());
    }

    #[test]
    fn is_local_true_for_loopback_address() {
        let host = Host {
            id: 1,
            name: "h1".into(),
            address: "127.0.0.1".into(),
            vars: Json(sample_vars(false)),
            groups: vec![],
            owner: None,
            updated_at: Utc::now(),
        };
        assert!(host.is_local());
    }

    #[test]
    fn is_local_false_for_remote_address() {
        let host = Host {
            id: 1,
            name: "h1".into(),
            address: "10.0.0.5".into(),
            vars: Json(sample_vars(false)),
            groups: vec![],
            owner: None,
            updated_at: Utc::now(),
        };
        assert!(!host.is_local());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn upsert_then_find_by_name(pool: PgPool) {
        let mut vars = HashMap::new();
        vars.insert("ansible_user".to_string(), "deploy".to_string());

        let created = Host::upsert(
            &pool,
            "h1",
            "10.0.0.5",
            &vars,
            &["prod".to_string()],
            Some("team-a"),
        )
        .await
        .unwrap();
        assert_eq!(created.name, "h1");

        let found = Host::find_by_name(&pool, "h1").await.unwrap().unwrap();
        assert_eq!(found.address, "10.0.0.5");
        assert_eq!(found.groups, vec!["prod".to_string()]);

        // Upserting again updates in place rather than duplicating.
        let updated = Host::upsert(&pool, "h1", "10.0.0.6", &vars, &["prod".to_string()], None)
            .await
            .unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.address, "10.0.0.6");

        let all = Host::list_all(&pool).await.unwrap();
        assert_eq!(all.len(), 1);
    }
}
