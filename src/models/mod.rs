pub mod conversation;
pub mod event;
pub mod message;

use uuid::Uuid;

/// Resolved identity of the caller, supplied by the external identity
/// collaborator. The core never performs authentication itself; it trusts
/// the capability flags handed to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Uuid,
    pub admin: bool,
}

impl Actor {
    pub fn user(id: Uuid) -> Self {
        Self { id, admin: false }
    }

    pub fn admin(id: Uuid) -> Self {
        Self { id, admin: true }
    }
}
