//! Auto-DevOps Policy: the tri-state resolution chain deciding whether a
//! stack is allowed to auto-deploy on drift, plus the origin of that
//! decision for observability.

use sqlx::PgPool;

use crate::config::PolicyConfig;
use crate::db::models::host::Host;
use crate::db::models::iac_stack::{IacStack, ScopeKind};
use crate::db::models::settings::{AutoDevopsValue, SettingsLevel, SettingsOverride};
use crate::error::CoreError;

/// Where a policy decision came from, first definite rung in the
/// resolution chain that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyOrigin {
    Stack,
    Group,
    Global,
    Env,
    Fallback,
}

impl PolicyOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyOrigin::Stack => "stack",
            PolicyOrigin::Group => "group",
            PolicyOrigin::Global => "global",
            PolicyOrigin::Env => "env",
            PolicyOrigin::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyDecision {
    pub enabled: bool,
    pub origin: PolicyOrigin,
}

/// Resolve whether `stack` is allowed to auto-deploy, walking the chain
/// stack override → group override (ascending name) → global override →
/// env default → fallback `disable`. Stops at the first rung with a
/// definite value.
pub async fn resolve(
    pool: &PgPool,
    cfg: &PolicyConfig,
    stack: &IacStack,
) -> Result<PolicyDecision, CoreError> {
    if let Some(raw) = &stack.auto_devops_override {
        if let Some(value) = AutoDevopsValue::parse(raw) {
            return Ok(PolicyDecision { enabled: value.as_bool(), origin: PolicyOrigin::Stack });
        }
    }

    for group in groups_for(pool, stack).await? {
        if let Some(row) = SettingsOverride::find(pool, SettingsLevel::Group, &group).await? {
            return Ok(PolicyDecision { enabled: row.auto_devops().as_bool(), origin: PolicyOrigin::Group });
        }
    }

    if let Some(row) = SettingsOverride::global(pool).await? {
        return Ok(PolicyDecision { enabled: row.auto_devops().as_bool(), origin: PolicyOrigin::Global });
    }

    if let Some(enabled) = cfg.devops_apply_default {
        return Ok(PolicyDecision { enabled, origin: PolicyOrigin::Env });
    }

    Ok(PolicyDecision { enabled: false, origin: PolicyOrigin::Fallback })
}

/// Group names relevant to a stack's scope, in ascending order: the scope
/// name itself when the stack is group-scoped, or the owning host's
/// groups when it is host-scoped.
async fn groups_for(pool: &PgPool, stack: &IacStack) -> Result<Vec<String>, CoreError> {
    let mut groups = match stack.scope_kind() {
        ScopeKind::Group => vec![stack.scope_name.clone()],
        ScopeKind::Host => Host::find_by_name(pool, &stack.scope_name)
            .await?
            .map(|h| h.groups.clone())
            .unwrap_or_default(),
    };
    groups.sort();
    Ok(groups)
}
