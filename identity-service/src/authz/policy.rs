use std::collections::HashMap;

use super::operation::{EntityKind, OperationKind};
use super::rule::Rule;
use crate::models::Role;

/// "Self or role >= floor".
///
/// Queries check the role first so a qualifying caller sees the unfiltered
/// set; an ownership filter cannot be lifted once injected. Mutations try
/// ownership first and fall back to the role.
pub fn self_or_role(kind: OperationKind, floor: Role) -> [Rule; 2] {
    if kind.is_query() {
        [Rule::AllowIfRole(floor), Rule::AllowIfOwner]
    } else {
        [Rule::AllowIfOwner, Rule::AllowIfRole(floor)]
    }
}

/// Ordered rule chains per (entity, operation kind). A missing chain denies.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    chains: HashMap<(EntityKind, OperationKind), Vec<Rule>>,
}

impl PolicyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chain(
        mut self,
        entity: EntityKind,
        kinds: &[OperationKind],
        build: impl Fn(OperationKind) -> Vec<Rule>,
    ) -> Self {
        for kind in kinds {
            self.chains.insert((entity, *kind), build(*kind));
        }
        self
    }

    pub fn chain(&self, entity: EntityKind, kind: OperationKind) -> &[Rule] {
        self.chains
            .get(&(entity, kind))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn standard() -> Self {
        use OperationKind::*;
        const QUERY: &[OperationKind] = &[Query];
        const CREATE_OR_UPDATE_ONE: &[OperationKind] = &[Create, UpdateOne];
        const BULK_OR_DELETE: &[OperationKind] = &[Update, DeleteOne, Delete];

        let chain = |head: &[Rule], tail: [Rule; 2]| {
            let mut rules = head.to_vec();
            rules.extend(tail);
            rules
        };

        let mut table = Self::new()
            .with_chain(EntityKind::Identity, QUERY, |_| vec![Rule::AlwaysAllow])
            .with_chain(EntityKind::Identity, CREATE_OR_UPDATE_ONE, |k| {
                chain(&[Rule::AllowIfOAuthFlow], self_or_role(k, Role::Admin))
            })
            .with_chain(EntityKind::Identity, BULK_OR_DELETE, |k| {
                chain(&[], self_or_role(k, Role::Admin))
            });

        for entity in [EntityKind::Post, EntityKind::Comment] {
            table = table
                .with_chain(entity, QUERY, |_| vec![Rule::AlwaysAllow])
                .with_chain(entity, &OperationKind::MUTATIONS, |k| {
                    chain(&[Rule::AllowIfSystem], self_or_role(k, Role::Moderator))
                });
        }

        table
            .with_chain(EntityKind::PostCategory, QUERY, |_| vec![Rule::AlwaysAllow])
            .with_chain(EntityKind::PostCategory, &OperationKind::MUTATIONS, |_| {
                vec![Rule::AllowIfSystem, Rule::AllowIfRole(Role::Moderator)]
            })
            .with_chain(EntityKind::ApiKey, QUERY, |_| {
                vec![Rule::AllowIfSystem, Rule::DenyIfAnonymous, Rule::AllowIfOwner]
            })
            .with_chain(EntityKind::ApiKey, &OperationKind::MUTATIONS, |k| {
                chain(&[Rule::AllowIfSystem], self_or_role(k, Role::Admin))
            })
            .with_chain(EntityKind::RefreshToken, QUERY, |k| {
                chain(
                    &[Rule::AllowIfSystem, Rule::DenyIfAnonymous],
                    self_or_role(k, Role::Admin),
                )
            })
            .with_chain(EntityKind::RefreshToken, CREATE_OR_UPDATE_ONE, |k| {
                chain(
                    &[Rule::AllowIfSystem, Rule::AllowIfOAuthFlow],
                    self_or_role(k, Role::Admin),
                )
            })
            .with_chain(EntityKind::RefreshToken, BULK_OR_DELETE, |k| {
                chain(&[Rule::AllowIfSystem], self_or_role(k, Role::Admin))
            })
    }
}
