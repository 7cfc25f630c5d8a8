use std::fmt;
use uuid::Uuid;

use super::filter::{Field, Filter, Predicate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Identity,
    Post,
    Comment,
    PostCategory,
    ApiKey,
    RefreshToken,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Identity,
        EntityKind::Post,
        EntityKind::Comment,
        EntityKind::PostCategory,
        EntityKind::ApiKey,
        EntityKind::RefreshToken,
    ];

    /// Column referencing the owning identity, if the kind has one.
    pub fn owner_field(&self) -> Option<Field> {
        match self {
            EntityKind::Identity => Some(Field::Id),
            EntityKind::Post
            | EntityKind::Comment
            | EntityKind::ApiKey
            | EntityKind::RefreshToken => Some(Field::OwnerId),
            EntityKind::PostCategory => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Identity => "identity",
            EntityKind::Post => "post",
            EntityKind::Comment => "comment",
            EntityKind::PostCategory => "post_category",
            EntityKind::ApiKey => "api_key",
            EntityKind::RefreshToken => "refresh_token",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Query,
    Create,
    UpdateOne,
    Update,
    DeleteOne,
    Delete,
}

impl OperationKind {
    pub const MUTATIONS: [OperationKind; 5] = [
        OperationKind::Create,
        OperationKind::UpdateOne,
        OperationKind::Update,
        OperationKind::DeleteOne,
        OperationKind::Delete,
    ];

    pub fn is_query(&self) -> bool {
        matches!(self, OperationKind::Query)
    }
}

/// A data operation presented to the engine.
///
/// Queries carry a filter the engine may narrow. Mutations carry the owner
/// (and, for identities, the provider subject) of the row they target, as
/// loaded by the caller before asking.
#[derive(Debug, Clone)]
pub struct Operation {
    pub entity: EntityKind,
    pub kind: OperationKind,
    pub filter: Filter,
    pub target_owner: Option<Uuid>,
    pub target_subject: Option<String>,
}

impl Operation {
    pub fn query(entity: EntityKind) -> Self {
        Self::new(entity, OperationKind::Query)
    }

    pub fn mutation(entity: EntityKind, kind: OperationKind) -> Self {
        Self::new(entity, kind)
    }

    fn new(entity: EntityKind, kind: OperationKind) -> Self {
        Self {
            entity,
            kind,
            filter: Filter::new(),
            target_owner: None,
            target_subject: None,
        }
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.filter.and(predicate);
        self
    }

    pub fn targeting_owner(mut self, owner: Uuid) -> Self {
        self.target_owner = Some(owner);
        self
    }

    pub fn targeting_subject(mut self, subject: impl Into<String>) -> Self {
        self.target_subject = Some(subject.into());
        self
    }
}
