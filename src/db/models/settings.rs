//! Auto-DevOps settings overrides, keyed by level + key.
//!
//! `level` is one of `global`, `group`, `host`, `stack`; `key` is empty for
//! `global`, the group/host name for those levels, and
//! `<scope_kind>|<scope_name>|<stack_name>` for `stack`. The policy
//! evaluator only consults `stack`, `group`, `global` (see [`super::iac_stack`]
//! for the per-stack override field) — host-level rows are stored for data
//! completeness but are not part of the resolution chain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutoDevopsValue {
    Enable,
    Disable,
}

impl AutoDevopsValue {
    pub fn as_str(self) -> &'static str {
        match self {
            AutoDevopsValue::Enable => "enable",
            AutoDevopsValue::Disable => "disable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "enable" => Some(AutoDevopsValue::Enable),
            "disable" => Some(AutoDevopsValue::Disable),
            _ => None,
        }
    }

    pub fn as_bool(self) -> bool {
        matches!(self, AutoDevopsValue::Enable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettingsLevel {
    Global,
    Group,
    Host,
    Stack,
}

impl SettingsLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            SettingsLevel::Global => "global",
            SettingsLevel::Group => "group",
            SettingsLevel::Host => "host",
            SettingsLevel::Stack => "stack",
        }
    }
}

/// Builds the `key` column value for a stack-scoped override.
pub fn stack_key(scope_kind: &str, scope_name: &str, stack_name: &str) -> String {
    format!("{scope_kind}|{scope_name}|{stack_name}")
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SettingsOverride {
    pub id: i64,
    pub level: String,
    pub key: String,
    pub auto_devops: String,
    pub updated_at: DateTime<Utc>,
}

impl SettingsOverride {
    pub fn auto_devops(&self) -> AutoDevopsValue {
        AutoDevopsValue::parse(&self.auto_devops).unwrap_or(AutoDevopsValue::Disable)
    }

    pub async fn set(
        pool: &PgPool,
        level: SettingsLevel,
        key: &str,
        value: AutoDevopsValue,
    ) -> Result<Self, CoreError> {
        sqlx::query_as::<_, SettingsOverride>(
            r#"
            INSERT INTO settings_overrides (level, key, auto_devops, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (level, key) DO UPDATE SET
                auto_devops = EXCLUDED.auto_devops,
                updated_at = now()
            RETURNING *
            "#,
        )
        .bind(level.as_str())
        .bind(key)
        .bind(value.as_str())
        .fetch_one(pool)
        .await
        .map_err(CoreError::from)
    }

    pub async fn clear(pool: &PgPool, level: SettingsLevel, key: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM settings_overrides WHERE level = $1 AND key = $2")
            .bind(level.as_str())
            .bind(key)
            .execute(pool)
            .await
            .map_err(CoreError::from)?;
        Ok(())
    }

    pub async fn find(
        pool: &PgPool,
        level: SettingsLevel,
        key: &str,
    ) -> Result<Option<Self>, CoreError> {
        sqlx::query_as::<_, SettingsOverride>(
            "SELECT * FROM settings_overrides WHERE level = $1 AND key = $2",
        )
        .bind(level.as_str())
        .bind(key)
        .fetch_optional(pool)
        .await
        .map_err(CoreError::from)
    }

    pub async fn global(pool: &PgPool) -> Result<Option<Self>, CoreError> {
        Self::find(pool, SettingsLevel::Global, "").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_key_joins_scope_parts() {
        assert_eq!(stack_key("host", "h1", "web"), "host|h1|web");
    }

    #[test]
    fn auto_devops_value_as_bool() {
        assert!(AutoDevopsValue::Enable.as_bool());
        assert!(!AutoDevopsValue::Disable.as_bool());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn set_then_find_then_clear(pool: PgPool) {
        SettingsOverride::set(&pool, SettingsLevel::Global, "", AutoDevopsValue::Enable)
            .await
            .unwrap();

        let found = SettingsOverride::global(&pool).await.unwrap().unwrap();
        assert_eq!(found.auto_devops(), AutoDevopsValue::Enable);

        SettingsOverride::set(&pool, SettingsLevel::Global, "", AutoDevopsValue::Disable)
            .await
            .unwrap();
        let updated = SettingsOverride::global(&pool).await.unwrap().unwrap();
        assert_eq!(updated.auto_devops(), AutoDevopsValue::Disable);

        SettingsOverride::clear(&pool, SettingsLevel::Global, "").await.unwrap();
        assert!(SettingsOverride::global(&pool).await.unwrap().is_none());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn stack_level_key_encoding(pool: PgPool) {
        let key = stack_key("host", "h1", "web");
        SettingsOverride::set(&pool, SettingsLevel::Stack, &key, AutoDevopsValue::Enable)
            .await
            .unwrap();

        let found = SettingsOverride::find(&pool, SettingsLevel::Stack, &key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.level, "stack");
        assert_eq!(found.auto_devops(), AutoDevopsValue::Enable);
    }
}
