use std::fmt;

use super::context::{RequestContext, TrustMarker};
use super::filter::Predicate;
use super::operation::Operation;
use super::role_rank::RoleRank;
use crate::models::Role;

/// Why a chain denied an operation. Never shown to callers verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// No identity on a chain that requires one.
    Anonymous,
    /// Every rule skipped.
    NoRuleAllowed,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::Anonymous => "anonymous",
            DenyReason::NoRuleAllowed => "no_rule_allowed",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    /// Allow, but only over rows matching the predicate.
    AllowFiltered(Predicate),
    Deny(DenyReason),
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    AlwaysAllow,
    AllowIfSystem,
    /// Allow while completing an external login for the targeted subject.
    AllowIfOAuthFlow,
    DenyIfAnonymous,
    AllowIfRole(Role),
    AllowIfOwner,
}

impl Rule {
    pub fn evaluate(&self, ctx: &RequestContext, op: &Operation, ranks: &RoleRank) -> Verdict {
        match self {
            Rule::AlwaysAllow => Verdict::Allow,
            Rule::AllowIfSystem => match ctx.trust() {
                TrustMarker::System => Verdict::Allow,
                _ => Verdict::Skip,
            },
            Rule::AllowIfOAuthFlow => match ctx.trust() {
                TrustMarker::OAuthFlow { subject }
                    if op.target_subject.as_deref() == Some(subject.as_str()) =>
                {
                    Verdict::Allow
                }
                _ => Verdict::Skip,
            },
            Rule::DenyIfAnonymous => {
                if ctx.is_authenticated() {
                    Verdict::Skip
                } else {
                    Verdict::Deny(DenyReason::Anonymous)
                }
            }
            Rule::AllowIfRole(floor) => {
                if ranks.is_authorized(ctx.identity(), *floor) {
                    Verdict::Allow
                } else {
                    Verdict::Skip
                }
            }
            Rule::AllowIfOwner => Self::ownership(ctx, op),
        }
    }

    fn ownership(ctx: &RequestContext, op: &Operation) -> Verdict {
        let (Some(caller), Some(field)) = (ctx.identity(), op.entity.owner_field()) else {
            return Verdict::Skip;
        };
        if op.kind.is_query() {
            return Verdict::AllowFiltered(Predicate::Eq(field, caller.id));
        }
        if op.target_owner == Some(caller.id) {
            Verdict::Allow
        } else {
            Verdict::Skip
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::filter::Field;
    use crate::authz::operation::{EntityKind, OperationKind};
    use crate::models::Identity;
    use chrono::Utc;

    fn ctx(role: Role) -> RequestContext {
        RequestContext::authenticated(Identity::new(
            "sub".into(),
            "name".into(),
            role,
            Utc::now(),
        ))
    }

    #[test]
    fn test_system_marker_only_from_system_context() {
        let ranks = RoleRank::standard();
        let op = Operation::query(EntityKind::ApiKey);
        assert_eq!(
            Rule::AllowIfSystem.evaluate(&RequestContext::system(), &op, &ranks),
            Verdict::Allow
        );
        assert_eq!(
            Rule::AllowIfSystem.evaluate(&ctx(Role::Admin), &op, &ranks),
            Verdict::Skip
        );
    }

    #[test]
    fn test_oauth_flow_requires_matching_subject() {
        let ranks = RoleRank::standard();
        let flow = RequestContext::oauth_flow("twitch|42");
        let op = Operation::mutation(EntityKind::Identity, OperationKind::Create);

        assert_eq!(
            Rule::AllowIfOAuthFlow.evaluate(&flow, &op.clone().targeting_subject("twitch|42"), &ranks),
            Verdict::Allow
        );
        assert_eq!(
            Rule::AllowIfOAuthFlow.evaluate(&flow, &op.clone().targeting_subject("twitch|43"), &ranks),
            Verdict::Skip
        );
        assert_eq!(Rule::AllowIfOAuthFlow.evaluate(&flow, &op, &ranks), Verdict::Skip);
    }

    #[test]
    fn test_ownership_injects_filter_on_query() {
        let ranks = RoleRank::standard();
        let caller = ctx(Role::User);
        let id = caller.identity().map(|i| i.id);
        let verdict = Rule::AllowIfOwner.evaluate(&caller, &Operation::query(EntityKind::Post), &ranks);
        assert_eq!(
            Some(verdict),
            id.map(|id| Verdict::AllowFiltered(Predicate::Eq(Field::OwnerId, id)))
        );
    }

    #[test]
    fn test_ownership_skips_on_foreign_mutation_and_unowned_kind() {
        let ranks = RoleRank::standard();
        let caller = ctx(Role::User);
        let foreign = Operation::mutation(EntityKind::Post, OperationKind::UpdateOne)
            .targeting_owner(uuid::Uuid::new_v4());
        assert_eq!(Rule::AllowIfOwner.evaluate(&caller, &foreign, &ranks), Verdict::Skip);

        let category = Operation::query(EntityKind::PostCategory);
        assert_eq!(Rule::AllowIfOwner.evaluate(&caller, &category, &ranks), Verdict::Skip);
    }

    #[test]
    fn test_deny_if_anonymous() {
        let ranks = RoleRank::standard();
        let op = Operation::query(EntityKind::ApiKey);
        assert_eq!(
            Rule::DenyIfAnonymous.evaluate(&RequestContext::anonymous(), &op, &ranks),
            Verdict::Deny(DenyReason::Anonymous)
        );
        assert_eq!(Rule::DenyIfAnonymous.evaluate(&ctx(Role::Guest), &op, &ranks), Verdict::Skip);
    }
}
