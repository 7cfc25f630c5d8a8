//! Per-operation authorization: ordered rule chains over role rank,
//! ownership and internal trust markers.

mod context;
mod engine;
mod filter;
mod operation;
mod policy;
mod role_rank;
mod rule;

pub use context::{RequestContext, TrustMarker};
pub use engine::{fold_chain, AuthorizationEngine, AuthzError, Decision};
pub use filter::{Field, Filter, Filterable, Predicate};
pub use operation::{EntityKind, Operation, OperationKind};
pub use policy::{self_or_role, PolicyTable};
pub use role_rank::RoleRank;
pub use rule::{DenyReason, Rule, Verdict};
