//! Group model.
//!
//! A group is a small, flat member set with no server-side state. Every
//! member carries its own device id, and the local device is always a
//! member of its own groups.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Maximum members per group.
pub const MAX_GROUP_MEMBERS: usize = 15;

/// One group member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    /// Stable device identifier.
    pub device_id: String,
    /// Display name at join time.
    pub display_name: String,
    /// Exchange public key, when known.
    pub public_key: Option<[u8; 32]>,
    /// When the member joined.
    pub joined_at: DateTime<Utc>,
}

/// A messaging group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Group identifier, unique per creator.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// The local device's id within this group.
    pub self_device_id: String,
    /// Member set, unique by device id. Always contains self.
    pub members: Vec<GroupMember>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Device id of the creator.
    pub created_by: String,
}

impl Group {
    /// Create a group containing only the local device.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        self_device_id: impl Into<String>,
        self_display_name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let self_device_id = self_device_id.into();
        Self {
            id: id.into(),
            name: name.into(),
            self_device_id: self_device_id.clone(),
            members: vec![GroupMember {
                device_id: self_device_id.clone(),
                display_name: self_display_name.into(),
                public_key: None,
                joined_at: now,
            }],
            created_at: now,
            created_by: self_device_id,
        }
    }

    /// Whether a device is a member.
    pub fn has_member(&self, device_id: &str) -> bool {
        self.members.iter().any(|m| m.device_id == device_id)
    }

    /// Look up a member by device id.
    pub fn member(&self, device_id: &str) -> Option<&GroupMember> {
        self.members.iter().find(|m| m.device_id == device_id)
    }

    /// Add a member.
    ///
    /// Adding a device that is already a member is a no-op (returns
    /// `Ok(false)`), so membership updates arriving over multiple paths
    /// stay idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::GroupFull`] at [`MAX_GROUP_MEMBERS`].
    pub fn add_member(&mut self, member: GroupMember) -> Result<bool, SyncError> {
        if self.has_member(&member.device_id) {
            return Ok(false);
        }
        if self.members.len() >= MAX_GROUP_MEMBERS {
            return Err(SyncError::GroupFull { group_id: self.id.clone(), max: MAX_GROUP_MEMBERS });
        }
        self.members.push(member);
        Ok(true)
    }

    /// Remove a member. The local device cannot be removed.
    pub fn remove_member(&mut self, device_id: &str) -> bool {
        if device_id == self.self_device_id {
            return false;
        }
        let before = self.members.len();
        self.members.retain(|m| m.device_id != device_id);
        self.members.len() != before
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).single().unwrap()
    }

    fn member(device_id: &str) -> GroupMember {
        GroupMember {
            device_id: device_id.to_owned(),
            display_name: device_id.to_owned(),
            public_key: None,
            joined_at: now(),
        }
    }

    #[test]
    fn new_group_contains_self() {
        let group = Group::new("g1", "lounge", "dev-self", "me", now());
        assert!(group.has_member("dev-self"));
        assert_eq!(group.created_by, "dev-self");
        assert_eq!(group.members.len(), 1);
    }

    #[test]
    fn duplicate_member_is_a_noop() {
        let mut group = Group::new("g1", "lounge", "dev-self", "me", now());
        assert!(group.add_member(member("dev-a")).unwrap());
        assert!(!group.add_member(member("dev-a")).unwrap());
        assert_eq!(group.members.len(), 2);
    }

    #[test]
    fn member_cap_is_enforced() {
        let mut group = Group::new("g1", "lounge", "dev-self", "me", now());
        for i in 1..MAX_GROUP_MEMBERS {
            group.add_member(member(&format!("dev-{i}"))).unwrap();
        }
        assert_eq!(group.members.len(), MAX_GROUP_MEMBERS);

        let err = group.add_member(member("dev-overflow")).unwrap_err();
        assert!(matches!(err, SyncError::GroupFull { max: MAX_GROUP_MEMBERS, .. }));
    }

    #[test]
    fn self_cannot_be_removed() {
        let mut group = Group::new("g1", "lounge", "dev-self", "me", now());
        group.add_member(member("dev-a")).unwrap();

        assert!(!group.remove_member("dev-self"));
        assert!(group.remove_member("dev-a"));
        assert!(group.has_member("dev-self"));
    }
}
