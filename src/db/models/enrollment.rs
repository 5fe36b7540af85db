//! Per-service enrollment state, keyed by `(stack_id, service_name)`.
//!
//! Tracks whether a service has ever been touched by an orchestrated deploy
//! and what it last saw, so the Drift Engine and Auto-DevOps policy can
//! tell a freshly-discovered service apart from one under management.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::error::CoreError;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ServiceEnrollment {
    pub stack_id: i64,
    pub service_name: String,
    pub last_deploy_uid: Option<String>,
    pub last_spec_digest: Option<String>,
    pub enrolled: bool,
    pub first_seen: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServiceEnrollment {
    /// Ensure a row exists for a newly-discovered service, defaulting to
    /// not-enrolled. Does not clobber an existing row.
    pub async fn ensure_seen(
        pool: &PgPool,
        stack_id: i64,
        service_name: &str,
    ) -> Result<Self, CoreError> {
        sqlx::query_as::<_, ServiceEnrollment>(
            r#"
            INSERT INTO service_enrollment_state (stack_id, service_name, enrolled, first_seen, updated_at)
            VALUES ($1, $2, false, now(), now())
            ON CONFLICT (stack_id, service_name) DO UPDATE SET updated_at = service_enrollment_state.updated_at
            RETURNING *
            "#,
        )
        .bind(stack_id)
        .bind(service_name)
        .fetch_one(pool)
        .await
        .map_err(CoreError::from)
    }

    pub async fn find(
        pool: &PgPool,
        stack_id: i64,
        service_name: &str,
    ) -> Result<Option<Self>, CoreError> {
        sqlx::query_as::<_, ServiceEnrollment>(
            "SELECT * FROM service_enrollment_state WHERE stack_id = $1 AND service_name = $2",
        )
        .bind(stack_id)
        .bind(service_name)
        .fetch_optional(pool)
        .await
        .map_err(CoreError::from)
    }

    /// Called once the orchestrator applies a deploy for this service:
    /// marks it enrolled and records what was just deployed.
    pub async fn record_deploy(
        pool: &PgPool,
        stack_id: i64,
        service_name: &str,
        deploy_uid: &str,
        spec_digest: &str,
    ) -> Result<Self, CoreError> {
        sqlx::query_as::<_, ServiceEnrollment>(
            r#"
            INSERT INTO service_enrollment_state (
                stack_id, service_name, last_deploy_uid, last_spec_digest,
                enrolled, first_seen, updated_at
            )
            VALUES ($1, $2, $3, $4, true, now(), now())
            ON CONFLICT (stack_id, service_name) DO UPDATE SET
                last_deploy_uid = EXCLUDED.last_deploy_uid,
                last_spec_digest = EXCLUDED.last_spec_digest,
                enrolled = true,
                updated_at = now()
            RETURNING *
            "#,
        )
        .bind(stack_id)
        .bind(service_name)
        .bind(deploy_uid)
        .bind(spec_digest)
        .fetch_one(pool)
        .await
        .map_err(CoreError::from)
    }

    pub async fn list_for_stack(pool: &PgPool, stack_id: i64) -> Result<Vec<Self>, CoreError> {
        sqlx::query_as::<_, ServiceEnrollment>(
            "SELECT * FROM service_enrollment_state WHERE stack_id = $1",
        )
        .bind(stack_id)
        .fetch_all(pool)
        .await
        .map_err(CoreError::from)
    }
}
