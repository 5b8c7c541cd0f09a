use std::collections::{HashMap, HashSet};

use anyhow::Context;

use crate::{Caller, CommentId, Db, Error, Target, UserId, COMMENTS_RESOURCE};

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
#[serde(transparent)]
pub struct PermissionId(pub i64);

/// A stored grant, matched by the slow path and compiled into [`AclSnapshot`]s
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRow {
    pub id: PermissionId,
    pub resource: String,
    pub action: String,
    pub role_name: Option<String>,
    pub user_id: Option<UserId>,
    pub allow: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPermission {
    pub resource: String,
    pub action: String,
    #[serde(default)]
    pub role_name: Option<String>,
    #[serde(default)]
    pub user_id: Option<UserId>,
    pub allow: bool,
}

impl NewPermission {
    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_name(&self.resource)?;
        crate::validate_string(&self.action)?;
        if self.action.is_empty() {
            return Err(Error::InvalidRequest(String::from("action is required")));
        }
        if let Some(r) = &self.role_name {
            crate::validate_name(r)?;
        }
        Ok(())
    }
}

/// Comment-specific context passed alongside an authorization request
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Subject {
    pub user_id: Option<UserId>,
    pub target: Option<Target>,
    pub comment_id: Option<CommentId>,
}

/// Configuration of the resolver, fixed for the lifetime of a server
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResolverPolicy {
    /// User id that bypasses every check
    pub root_user_id: Option<UserId>,

    /// Role name that bypasses every check, compared case-insensitively
    pub root_role: String,

    /// Whether a role claimed through a request header is honored for the bypass
    pub trust_role_claim: bool,

    /// Whether permission rows are consulted when the engine snapshot says no
    pub fallback: bool,
}

impl Default for ResolverPolicy {
    fn default() -> ResolverPolicy {
        ResolverPolicy {
            root_user_id: Some(UserId(1)),
            root_role: String::from("root"),
            trust_role_claim: true,
            fallback: true,
        }
    }
}

/// One step of a resolution, as recorded in [`Decision::trail`]
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize)]
#[serde(tag = "check", rename_all = "kebab-case")]
pub enum RuleCheck {
    RoleClaim { claim: String, matched: bool },
    RootUser { matched: bool },
    Engine { allowed: bool },
    EngineError { error: String },
    FallbackDisabled,
    PermissionRows { found: usize },
    RowMatch { id: PermissionId, rule: RowRule },
    FallbackError { error: String },
    NoMatch,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RowRule {
    Role { name: String },
    User { id: UserId },
    Unrestricted,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub trail: Vec<RuleCheck>,
}

impl Decision {
    fn push(&mut self, check: RuleCheck) {
        self.trail.push(check);
    }

    fn allow(mut self) -> Decision {
        self.allowed = true;
        self
    }

    fn deny(mut self) -> Decision {
        self.allowed = false;
        self
    }
}

fn short_action(action: &str) -> &str {
    action.rsplit(':').next().unwrap_or(action)
}

/// Role to granted-actions map compiled from permission rows
///
/// This is the fast path of the resolver. It only knows about role rows and
/// may lag behind the permission table until it gets reloaded.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AclSnapshot {
    by_role: HashMap<String, HashSet<String>>,
    root_role: String,
}

impl AclSnapshot {
    pub fn compile(rows: &[PermissionRow], root_role: &str) -> AclSnapshot {
        let mut by_role: HashMap<String, HashSet<String>> = HashMap::new();
        for r in rows.iter().filter(|r| r.allow) {
            if let Some(role) = &r.role_name {
                by_role
                    .entry(role.to_lowercase())
                    .or_default()
                    .insert(format!("{}:{}", r.resource, short_action(&r.action)));
            }
        }
        AclSnapshot {
            by_role,
            root_role: root_role.to_lowercase(),
        }
    }

    /// Number of role grants in the snapshot
    pub fn len(&self) -> usize {
        self.by_role.values().map(|a| a.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn can(&self, caller: &Caller, resource: &str, action: &str) -> bool {
        let action = format!("{resource}:{}", short_action(action));
        caller.roles.iter().any(|r| {
            let r = r.to_lowercase();
            (caller.user.is_some() && r == self.root_role)
                || self.by_role.get(&r).map_or(false, |a| a.contains(&action))
        })
    }
}

/// Returns the first row granting `caller` the action, along with the rule it matched by
pub fn evaluate_rows<'a>(
    rows: &'a [PermissionRow],
    caller: &Caller,
) -> Option<(&'a PermissionRow, RowRule)> {
    rows.iter().find_map(|r| {
        if let Some(role) = r.role_name.as_ref().filter(|role| caller.has_role(role)) {
            return Some((r, RowRule::Role { name: role.clone() }));
        }
        if let Some(user) = r.user_id.filter(|u| caller.user == Some(*u)) {
            return Some((r, RowRule::User { id: user }));
        }
        if r.allow && r.role_name.is_none() && r.user_id.is_none() {
            return Some((r, RowRule::Unrestricted));
        }
        None
    })
}

impl ResolverPolicy {
    fn role_claim_matches(&self, caller: &Caller) -> Option<(String, bool)> {
        if !self.trust_role_claim {
            return None;
        }
        caller
            .role_claim
            .as_ref()
            .map(|c| (c.clone(), c.eq_ignore_ascii_case(&self.root_role)))
    }

    /// Whether the caller gets unfiltered access to privileged listings
    pub fn is_privileged(&self, caller: &Caller) -> bool {
        self.role_claim_matches(caller).map_or(false, |(_, m)| m)
            || (self.root_user_id.is_some() && caller.user == self.root_user_id)
            || (caller.user.is_some() && caller.has_role(&self.root_role))
    }

    /// Decides whether `caller` may perform `action` (a full `resource:action` name)
    pub async fn resolve<D: Db>(
        &self,
        db: &mut D,
        caller: &Caller,
        action: &str,
        subject: &Subject,
    ) -> Decision {
        let mut decision = Decision::default();

        if let Some((claim, matched)) = self.role_claim_matches(caller) {
            decision.push(RuleCheck::RoleClaim { claim, matched });
            if matched {
                return decision.allow();
            }
        }
        if self.root_user_id.is_some() {
            let matched = caller.user.is_some() && caller.user == self.root_user_id;
            decision.push(RuleCheck::RootUser { matched });
            if matched {
                return decision.allow();
            }
        }

        match db.acl_can(caller, action).await {
            Ok(true) => {
                decision.push(RuleCheck::Engine { allowed: true });
                return decision.allow();
            }
            Ok(false) => decision.push(RuleCheck::Engine { allowed: false }),
            Err(e) => {
                tracing::warn!(?e, action, "access control engine failed, trying permission rows");
                decision.push(RuleCheck::EngineError {
                    error: format!("{e:#}"),
                });
            }
        }

        if !self.fallback {
            decision.push(RuleCheck::FallbackDisabled);
            return decision.deny();
        }

        let actions = [String::from(action), String::from(short_action(action))];
        let rows = match db
            .permission_rows(COMMENTS_RESOURCE, &actions)
            .await
            .with_context(|| format!("listing permission rows for {action:?}"))
        {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(?e, ?subject, "permission fallback failed, denying");
                decision.push(RuleCheck::FallbackError {
                    error: format!("{e:#}"),
                });
                return decision.deny();
            }
        };
        decision.push(RuleCheck::PermissionRows { found: rows.len() });
        match evaluate_rows(&rows, caller) {
            Some((row, rule)) => {
                tracing::debug!(row = row.id.0, ?rule, action, "permission row matched");
                decision.push(RuleCheck::RowMatch { id: row.id, rule });
                decision.allow()
            }
            None => {
                decision.push(RuleCheck::NoMatch);
                decision.deny()
            }
        }
    }
}
