//! Structural row filters the engine can narrow and the store can render.

use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

use crate::models::{ApiKey, Identity, RefreshToken};

/// Filterable column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Id,
    OwnerId,
    LineageId,
}

impl Field {
    pub fn column(&self) -> &'static str {
        match self {
            Field::Id => "id",
            Field::OwnerId => "owner_id",
            Field::LineageId => "lineage_id",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Eq(Field, Uuid),
    In(Field, Vec<Uuid>),
}

impl Predicate {
    fn holds<R: Filterable + ?Sized>(&self, row: &R) -> bool {
        match self {
            Predicate::Eq(field, value) => row.field(*field) == Some(*value),
            Predicate::In(field, values) => row
                .field(*field)
                .is_some_and(|v| values.contains(&v)),
        }
    }
}

/// Conjunction of predicates. An empty filter matches every row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    predicates: Vec<Predicate>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Narrow the filter. Existing predicates are kept, so a narrowed filter
    /// never matches a row the original did not.
    pub fn and(&mut self, predicate: Predicate) {
        self.predicates.push(predicate);
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn matches<R: Filterable + ?Sized>(&self, row: &R) -> bool {
        self.predicates.iter().all(|p| p.holds(row))
    }

    /// Append `WHERE ...` (or `AND ...` when `has_where`) for this filter.
    pub fn push_sql(&self, qb: &mut QueryBuilder<'_, Postgres>, has_where: bool) {
        if self.predicates.is_empty() {
            return;
        }
        qb.push(if has_where { " AND " } else { " WHERE " });
        let mut separated = qb.separated(" AND ");
        for predicate in &self.predicates {
            match predicate {
                Predicate::Eq(field, value) => {
                    separated.push(format!("{} = ", field.column()));
                    separated.push_bind_unseparated(*value);
                }
                Predicate::In(field, values) => {
                    separated.push(format!("{} = ANY(", field.column()));
                    separated.push_bind_unseparated(values.clone());
                    separated.push_unseparated(")");
                }
            }
        }
    }
}

/// Rows that expose the filterable columns.
pub trait Filterable {
    fn field(&self, field: Field) -> Option<Uuid>;
}

impl Filterable for RefreshToken {
    fn field(&self, field: Field) -> Option<Uuid> {
        match field {
            Field::Id => Some(self.id),
            Field::OwnerId => Some(self.owner_id),
            Field::LineageId => Some(self.lineage_id),
        }
    }
}

impl Filterable for ApiKey {
    fn field(&self, field: Field) -> Option<Uuid> {
        match field {
            Field::Id => Some(self.id),
            Field::OwnerId => Some(self.owner_id),
            Field::LineageId => None,
        }
    }
}

impl Filterable for Identity {
    fn field(&self, field: Field) -> Option<Uuid> {
        match field {
            Field::Id => Some(self.id),
            Field::OwnerId | Field::LineageId => None,
        }
    }
}
