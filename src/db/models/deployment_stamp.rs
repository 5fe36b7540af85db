//! Deployment stamps: an immutable record of every apply attempt.
//!
//! A stamp is created `pending` and then promoted to `success` or `failed`;
//! once in a terminal state a row is never mutated again. The latest
//! `success` stamp for a stack is the drift baseline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentMethod {
    Compose,
    Script,
    Manual,
}

impl DeploymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentMethod::Compose => "compose",
            DeploymentMethod::Script => "script",
            DeploymentMethod::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentStatus {
    Pending,
    Success,
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeploymentStatus::Pending),
            "success" => Some(DeploymentStatus::Success),
            "failed" => Some(DeploymentStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeploymentStamp {
    pub id: i64,
    pub stack_id: i64,
    pub deployment_hash: String,
    pub deployment_timestamp: DateTime<Utc>,
    pub deployment_method: String,
    pub deployment_user: Option<String>,
    pub deployment_env_hash: Option<String>,
    pub deployment_status: String,
}

impl DeploymentStamp {
    pub fn status(&self) -> DeploymentStatus {
        DeploymentStatus::parse(&self.deployment_status).unwrap_or(DeploymentStatus::Pending)
    }

    pub async fn create_pending(
        pool: &PgPool,
        stack_id: i64,
        deployment_hash: &str,
        method: DeploymentMethod,
        deployment_user: Option<&str>,
        deployment_env_hash: Option<&str>,
    ) -> Result<Self, CoreError> {
        sqlx::query_as::<_, DeploymentStamp>(
            r#"
            INSERT INTO deployment_stamps (
                stack_id, deployment_hash, deployment_timestamp, deployment_method,
                deployment_user, deployment_env_hash, deployment_status
            )
            VALUES ($1, $2, now(), $3, $4, $5, 'pending')
            RETURNING *
            "#,
        )
        .bind(stack_id)
        .bind(deployment_hash)
        .bind(method.as_str())
        .bind(deployment_user)
        .bind(deployment_env_hash)
        .fetch_one(pool)
        .await
        .map_err(CoreError::from)
    }

    /// Move a pending stamp to a terminal state. Refuses to touch a stamp
    /// that is already terminal.
    pub async fn finish(
        pool: &PgPool,
        id: i64,
        status: DeploymentStatus,
    ) -> Result<Self, CoreError> {
        if matches!(status, DeploymentStatus::Pending) {
            return Err(CoreError::stage_failed("cannot finish a stamp into pending"));
        }
        sqlx::query_as::<_, DeploymentStamp>(
            r#"
            UPDATE deployment_stamps
            SET deployment_status = $1
            WHERE id = $2 AND deployment_status = 'pending'
            RETURNING *
            "#,
        )
        .bind(status.as_str())
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(CoreError::from)?
        .ok_or_else(|| CoreError::conflict("deployment stamp is no longer pending"))
    }

    pub async fn find_by_id(pool: &PgPool, id: i64) -> Result<Option<Self>, CoreError> {
        sqlx::query_as::<_, DeploymentStamp>("SELECT * FROM deployment_stamps WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(CoreError::from)
    }

    /// The most recent successful stamp for a stack, i.e. the drift baseline.
    pub async fn latest_success(
        pool: &PgPool,
        stack_id: i64,
    ) -> Result<Option<Self>, CoreError> {
        sqlx::query_as::<_, DeploymentStamp>(
            r#"
            SELECT * FROM deployment_stamps
            WHERE stack_id = $1 AND deployment_status = 'success'
            ORDER BY deployment_timestamp DESC
            LIMIT 1
            "#,
        )
        .bind(stack_id)
        .fetch_optional(pool)
        .await
        .map_err(CoreError::from)
    }

    pub async fn list_for_stack(pool: &PgPool, stack_id: i64) -> Result<Vec<Self>, CoreError> {
        sqlx::query_as::<_, DeploymentStamp>(
            "SELECT * FROM deployment_stamps WHERE stack_id = $1 ORDER BY deployment_timestamp DESC",
        )
        .bind(stack_id)
        .fetch_all(pool)
        .await
        .map_err(CoreError::from)
    }
}
