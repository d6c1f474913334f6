//! Identity types: users, uids, callers, clients and session tokens.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// ============================================================================
// Users
// ============================================================================

/// A user profile on the device.
///
/// Every piece of broker state is keyed by user first. The sentinel
/// [`UserId::CURRENT`] is resolved to the active user by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(i32);

impl UserId {
    /// The primary (owner) user.
    pub const SYSTEM: UserId = UserId(0);

    /// Placeholder meaning "whoever is the active user right now".
    pub const CURRENT: UserId = UserId(-2);

    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    pub const fn as_i32(&self) -> i32 {
        self.0
    }

    /// Returns true for the [`UserId::CURRENT`] sentinel.
    pub const fn is_current_sentinel(&self) -> bool {
        self.0 == Self::CURRENT.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::SYSTEM
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for UserId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

/// Process uid of a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(u32);

impl Uid {
    /// The privileged system uid. May act on behalf of any user.
    pub const SYSTEM: Uid = Uid(1000);

    pub const fn new(uid: u32) -> Self {
        Self(uid)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    pub const fn is_system(&self) -> bool {
        self.0 == Self::SYSTEM.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Permissions & Caller Identity
// ============================================================================

/// Capability permissions checked by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Change parental controls, blocked ratings, and unblock content.
    ModifyParentalControls,
    /// Acquire and release hardware pass-through devices.
    TvInputHardware,
    /// Capture frames from a hardware input.
    CaptureTvInput,
}

/// Identity of the process making a broker call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub pid: u32,
    pub uid: Uid,
    /// The user the calling process runs as.
    pub user_id: UserId,
    #[serde(default)]
    pub permissions: BTreeSet<Permission>,
}

impl CallerIdentity {
    pub fn new(pid: u32, uid: Uid, user_id: UserId) -> Self {
        Self {
            pid,
            uid,
            user_id,
            permissions: BTreeSet::new(),
        }
    }

    /// The broker's own identity, used for internal cascades.
    pub fn system() -> Self {
        let mut caller = Self::new(std::process::id(), Uid::SYSTEM, UserId::SYSTEM);
        caller.permissions = [
            Permission::ModifyParentalControls,
            Permission::TvInputHardware,
            Permission::CaptureTvInput,
        ]
        .into_iter()
        .collect();
        caller
    }

    #[must_use]
    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permissions.insert(permission);
        self
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    pub fn is_system(&self) -> bool {
        self.uid.is_system()
    }
}

// ============================================================================
// Clients & Sessions
// ============================================================================

/// Identifies one connected client process (its callback channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(u64);

impl ClientId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Opaque session capability minted by the broker.
///
/// Tokens are handed out from a monotonically increasing counter owned by
/// the broker and are never reused for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(u64);

impl SessionToken {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_user_sentinel() {
        assert!(UserId::CURRENT.is_current_sentinel());
        assert!(!UserId::new(10).is_current_sentinel());
        assert_eq!(UserId::CURRENT.as_i32(), -2);
    }

    #[test]
    fn test_system_caller_has_every_permission() {
        let caller = CallerIdentity::system();
        assert!(caller.is_system());
        assert!(caller.has_permission(Permission::ModifyParentalControls));
        assert!(caller.has_permission(Permission::TvInputHardware));
        assert!(caller.has_permission(Permission::CaptureTvInput));
    }

    #[test]
    fn test_app_caller_permissions() {
        let caller = CallerIdentity::new(42, Uid::new(10_057), UserId::new(10))
            .with_permission(Permission::CaptureTvInput);
        assert!(!caller.is_system());
        assert!(caller.has_permission(Permission::CaptureTvInput));
        assert!(!caller.has_permission(Permission::TvInputHardware));
    }

    #[test]
    fn test_session_token_display() {
        assert_eq!(SessionToken::new(7).to_string(), "session-7");
        assert_eq!(ClientId::new(3).to_string(), "client-3");
    }
}
