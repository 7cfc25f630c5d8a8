use thiserror::Error;

use super::context::RequestContext;
use super::filter::Filter;
use super::operation::Operation;
use super::policy::PolicyTable;
use super::role_rank::RoleRank;
use super::rule::{DenyReason, Rule, Verdict};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthzError {
    #[error("operation denied: {0}")]
    Denied(DenyReason),

    #[error("authentication required")]
    Unauthenticated,
}

/// Folded result of a rule chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Proceed over rows matching the (possibly narrowed) filter.
    Allow(Filter),
    Deny(DenyReason),
}

/// Run `rules` in order. The first Allow or Deny wins; an exhausted chain denies.
pub fn fold_chain(
    rules: &[Rule],
    ctx: &RequestContext,
    op: &Operation,
    ranks: &RoleRank,
) -> Decision {
    for rule in rules {
        match rule.evaluate(ctx, op, ranks) {
            Verdict::Allow => return Decision::Allow(op.filter.clone()),
            Verdict::AllowFiltered(predicate) => {
                let mut filter = op.filter.clone();
                filter.and(predicate);
                return Decision::Allow(filter);
            }
            Verdict::Deny(reason) => return Decision::Deny(reason),
            Verdict::Skip => {}
        }
    }
    Decision::Deny(DenyReason::NoRuleAllowed)
}

/// Stateless decision engine shared across requests.
#[derive(Debug, Clone)]
pub struct AuthorizationEngine {
    ranks: RoleRank,
    policies: PolicyTable,
}

impl AuthorizationEngine {
    pub fn new(ranks: RoleRank, policies: PolicyTable) -> Self {
        Self { ranks, policies }
    }

    pub fn standard() -> Self {
        Self::new(RoleRank::standard(), PolicyTable::standard())
    }

    pub fn ranks(&self) -> &RoleRank {
        &self.ranks
    }

    pub fn decide(&self, ctx: &RequestContext, op: &Operation) -> Decision {
        let rules = self.policies.chain(op.entity, op.kind);
        fold_chain(rules, ctx, op, &self.ranks)
    }

    /// Authorize `op`, returning it with its filter narrowed as the chain
    /// requires.
    pub fn authorize(&self, ctx: &RequestContext, mut op: Operation) -> Result<Operation, AuthzError> {
        let decision = self.decide(ctx, &op);
        let caller = ctx.identity().map(|i| i.id);

        match decision {
            Decision::Allow(filter) => {
                metrics::counter!(
                    "authz_decisions_total",
                    "entity" => op.entity.as_str(),
                    "decision" => "allow"
                )
                .increment(1);
                tracing::debug!(
                    entity = %op.entity,
                    kind = ?op.kind,
                    caller = ?caller,
                    narrowed = filter != op.filter,
                    "Operation allowed"
                );
                op.filter = filter;
                Ok(op)
            }
            Decision::Deny(reason) => {
                metrics::counter!(
                    "authz_decisions_total",
                    "entity" => op.entity.as_str(),
                    "decision" => reason.as_str()
                )
                .increment(1);
                tracing::info!(
                    entity = %op.entity,
                    kind = ?op.kind,
                    caller = ?caller,
                    reason = %reason,
                    "Operation denied"
                );
                match reason {
                    DenyReason::Anonymous => Err(AuthzError::Unauthenticated),
                    other => Err(AuthzError::Denied(other)),
                }
            }
        }
    }
}

impl Default for AuthorizationEngine {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::filter::{Field, Predicate};
    use crate::authz::operation::{EntityKind, OperationKind};
    use crate::models::{Identity, NewRefreshToken, RefreshToken, Role};
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn caller(role: Role) -> RequestContext {
        RequestContext::authenticated(Identity::new(
            format!("sub-{}", Uuid::new_v4()),
            "caller".into(),
            role,
            Utc::now(),
        ))
    }

    fn token_owned_by(owner: Uuid) -> RefreshToken {
        let now = Utc::now();
        NewRefreshToken {
            id: Uuid::new_v4(),
            owner_id: owner,
            lineage_id: Uuid::new_v4(),
            token_hash: RefreshToken::hash_token(&Uuid::new_v4().to_string()),
            expires_at: now + Duration::days(1),
            created_at: now,
            issued_at: now,
            ip_address: None,
            user_agent: None,
        }
        .into_token(1)
    }

    #[test]
    fn test_role_then_owner_chain() {
        let ranks = RoleRank::standard();
        let chain = [Rule::AllowIfRole(Role::Moderator), Rule::AllowIfOwner];
        let user = caller(Role::User);
        let user_id = user.identity().map(|i| i.id).unwrap_or_default();

        let own = Operation::mutation(EntityKind::Post, OperationKind::UpdateOne)
            .targeting_owner(user_id);
        assert!(matches!(fold_chain(&chain, &user, &own, &ranks), Decision::Allow(_)));

        let foreign = Operation::mutation(EntityKind::Post, OperationKind::UpdateOne)
            .targeting_owner(Uuid::new_v4());
        assert_eq!(
            fold_chain(&chain, &user, &foreign, &ranks),
            Decision::Deny(DenyReason::NoRuleAllowed)
        );
    }

    #[test]
    fn test_query_never_leaks_foreign_rows() {
        let engine = AuthorizationEngine::standard();
        let user = caller(Role::User);
        let user_id = user.identity().map(|i| i.id).unwrap_or_default();
        let other = Uuid::new_v4();

        // Even an explicit request for another owner's rows is narrowed.
        let op = Operation::query(EntityKind::RefreshToken)
            .with_predicate(Predicate::Eq(Field::OwnerId, other));
        let allowed = engine.authorize(&user, op).unwrap();

        let rows = [token_owned_by(user_id), token_owned_by(other)];
        let visible: Vec<_> = rows.iter().filter(|r| allowed.filter.matches(*r)).collect();
        assert!(visible.is_empty());

        let unfiltered = engine
            .authorize(&user, Operation::query(EntityKind::RefreshToken))
            .unwrap();
        let visible: Vec<_> = rows.iter().filter(|r| unfiltered.filter.matches(*r)).collect();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].owner_id, user_id);
    }

    #[test]
    fn test_admin_query_is_unfiltered() {
        let engine = AuthorizationEngine::standard();
        let admin = caller(Role::Admin);
        let op = engine
            .authorize(&admin, Operation::query(EntityKind::RefreshToken))
            .unwrap();
        assert!(op.filter.is_empty());
    }

    #[test]
    fn test_anonymous_api_key_query_is_unauthenticated() {
        let engine = AuthorizationEngine::standard();
        assert_eq!(
            engine
                .authorize(&RequestContext::anonymous(), Operation::query(EntityKind::ApiKey))
                .unwrap_err(),
            AuthzError::Unauthenticated
        );
    }

    #[test]
    fn test_system_context_bypasses() {
        let engine = AuthorizationEngine::standard();
        let op = Operation::mutation(EntityKind::RefreshToken, OperationKind::DeleteOne)
            .targeting_owner(Uuid::new_v4());
        assert!(engine.authorize(&RequestContext::system(), op).is_ok());
    }

    #[test]
    fn test_guest_cannot_create_category() {
        let engine = AuthorizationEngine::standard();
        let op = Operation::mutation(EntityKind::PostCategory, OperationKind::Create);
        assert_eq!(
            engine.authorize(&caller(Role::Guest), op.clone()).unwrap_err(),
            AuthzError::Denied(DenyReason::NoRuleAllowed)
        );
        assert!(engine.authorize(&caller(Role::Moderator), op).is_ok());
    }

    #[test]
    fn test_empty_chain_denies() {
        let engine = AuthorizationEngine::new(RoleRank::standard(), PolicyTable::new());
        assert!(engine
            .authorize(&caller(Role::Admin), Operation::query(EntityKind::Post))
            .is_err());
    }
}
