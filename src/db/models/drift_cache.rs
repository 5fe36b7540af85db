//! Per-stack drift cache: the cheap first tier of the drift algorithm.
//!
//! One row per stack. `bundle_hash` covers the whole stack directory; when
//! it no longer matches what the IaC scanner just computed, every cached
//! per-service hash is stale and the entire map is cleared so the second
//! tier recomputes from scratch.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::PgPool;

use crate::error::CoreError;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StackDriftCache {
    pub stack_id: i64,
    pub bundle_hash: String,
    pub docker_config_cache: Json<HashMap<String, String>>,
    pub last_updated: DateTime<Utc>,
}

impl StackDriftCache {
    pub async fn find(pool: &PgPool, stack_id: i64) -> Result<Option<Self>, CoreError> {
        sqlx::query_as::<_, StackDriftCache>(
            "SELECT * FROM stack_drift_cache WHERE stack_id = $1",
        )
        .bind(stack_id)
        .fetch_optional(pool)
        .await
        .map_err(CoreError::from)
    }

    /// Refresh the bundle hash. If it changed from what was stored, the
    /// per-service cache is dropped; callers should not trust any entries
    /// in the returned row's `docker_config_cache` when that happens and
    /// should recompute from the Docker client.
    pub async fn refresh_bundle_hash(
        pool: &PgPool,
        stack_id: i64,
        bundle_hash: &str,
    ) -> Result<Self, CoreError> {
        let existing = Self::find(pool, stack_id).await?;
        let bundle_changed = existing
            .as_ref()
            .map(|c| c.bundle_hash != bundle_hash)
            .unwrap_or(true);

        let cache: HashMap<String, String> = if bundle_changed {
            HashMap::new()
        } else {
            existing.map(|c| c.docker_config_cache.0).unwrap_or_default()
        };

        sqlx::query_as::<_, StackDriftCache>(
            r#"
            INSERT INTO stack_drift_cache (stack_id, bundle_hash, docker_config_cache, last_updated)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (stack_id) DO UPDATE SET
                bundle_hash = EXCLUDED.bundle_hash,
                docker_config_cache = EXCLUDED.docker_config_cache,
                last_updated = now()
            RETURNING *
            "#,
        )
        .bind(stack_id)
        .bind(bundle_hash)
        .bind(Json(cache))
        .fetch_one(pool)
        .await
        .map_err(CoreError::from)
    }

    /// Overwrite the whole per-service hash map in one shot, dropping any
    /// key not present in `cache` (a service removed from the stack, or a
    /// container that stopped running). Used by the second drift tier once
    /// it has recomputed hashes for every currently-relevant service.
    pub async fn replace_service_cache(
        pool: &PgPool,
        stack_id: i64,
        cache: &HashMap<String, String>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE stack_drift_cache
            SET docker_config_cache = $2,
                last_updated = now()
            WHERE stack_id = $1
            "#,
        )
        .bind(stack_id)
        .bind(Json(cache.clone()))
        .execute(pool)
        .await
        .map_err(CoreError::from)?;
        Ok(())
    }

    /// Record a service's rendered-config hash once the second drift tier
    /// has computed it, so the next scan can skip recomputation.
    pub async fn set_service_hash(
        pool: &PgPool,
        stack_id: i64,
        service_name: &str,
        rendered_hash: &str,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE stack_drift_cache
            SET docker_config_cache = jsonb_set(
                    coalesce(docker_config_cache, '{}'::jsonb),
                    ARRAY[$2],
                    to_jsonb($3::text)
                ),
                last_updated = now()
            WHERE stack_id = $1
            "#,
        )
        .bind(stack_id)
        .bind(service_name)
        .bind(rendered_hash)
        .execute(pool)
        .await
        .map_err(CoreError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::iac_repo::IacRepo;
    use crate::db::models::iac_stack::{DeployKind, IacStack, ScopeKind, SopsStatus};

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
    async fn bundle_hash_change_clears_service_cache(pool: PgPool) {
        let stack = sample_stack(&pool).await;

        StackDriftCache::refresh_bundle_hash(&pool, stack.id, "bundle-a")
            .await
            .unwrap();
        StackDriftCache::set_service_hash(&pool, stack.id, "api", "cfg-hash-1")
            .await
            .unwrap();

        let cached = StackDriftCache::find(&pool, stack.id).await.unwrap().unwrap();
        assert_eq!(cached.docker_config_cache.0.get("api"), Some(&"cfg-hash-1".to_string()));

        // Same bundle hash again: cache survives.
        let same = StackDriftCache::refresh_bundle_hash(&pool, stack.id, "bundle-a")
            .await
            .unwrap();
        assert_eq!(same.docker_config_cache.0.get("api"), Some(&"cfg-hash-1".to_string()));

        // Bundle changed: cache wiped.
        let changed = StackDriftCache::refresh_bundle_hash(&pool, stack.id, "bundle-b")
            .await
            .unwrap();
        assert!(changed.docker_config_cache.0.is_empty());
    }
}
