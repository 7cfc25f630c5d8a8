use crate::models::{Identity, Role};

/// Total order over roles, built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct RoleRank {
    ranks: [u8; 4],
}

impl RoleRank {
    /// GUEST < USER < MODERATOR < ADMIN.
    pub fn standard() -> Self {
        Self::from_order([Role::Guest, Role::User, Role::Moderator, Role::Admin])
    }

    /// Build a table from roles listed lowest first.
    pub fn from_order(order: [Role; 4]) -> Self {
        let mut ranks = [0u8; 4];
        for (rank, role) in order.iter().enumerate() {
            ranks[Self::slot(*role)] = rank as u8;
        }
        Self { ranks }
    }

    fn slot(role: Role) -> usize {
        match role {
            Role::Guest => 0,
            Role::User => 1,
            Role::Moderator => 2,
            Role::Admin => 3,
        }
    }

    pub fn rank(&self, role: Role) -> u8 {
        self.ranks[Self::slot(role)]
    }

    /// Meets-or-exceeds: `rank(role) >= rank(floor)`.
    pub fn meets(&self, role: Role, floor: Role) -> bool {
        self.rank(role) >= self.rank(floor)
    }

    /// An identity is present and its role meets `floor`.
    pub fn is_authorized(&self, identity: Option<&Identity>, floor: Role) -> bool {
        identity.is_some_and(|i| self.meets(i.role, floor))
    }

    /// Strictly exceeds a peer: `rank(a) > rank(b)`.
    pub fn outranks(&self, a: Role, b: Role) -> bool {
        self.rank(a) > self.rank(b)
    }
}

impl Default for RoleRank {
    fn default() -> Self {
        Self::standard()
    }
}
