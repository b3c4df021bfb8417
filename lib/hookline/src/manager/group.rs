//! Named sets of policies toggled together.

use serde::Serialize;

use crate::policy::PolicyName;

/// Activation counters of a group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GroupMetadata {
    /// Times the group was enabled.
    pub enabled_count: u64,
    /// Member activations that failed, over the group's lifetime.
    pub failed_count: u64,
}

/// A group and its activation history.
///
/// Groups own no engine ids: enabling or disabling one enables or disables
/// each member through the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Group {
    /// Group name.
    pub name: String,
    /// Members, in creation order, without duplicates.
    pub members: Vec<PolicyName>,
    /// Whether the group is currently enabled.
    pub enabled: bool,
    /// Creation time, milliseconds since the Unix epoch.
    pub created_at: u64,
    /// Last enable time.
    pub enabled_at: Option<u64>,
    /// Last disable time.
    pub disabled_at: Option<u64>,
    /// Counters.
    pub metadata: GroupMetadata,
}

impl Group {
    pub(crate) fn new(name: String, members: Vec<PolicyName>, created_at: u64) -> Self {
        let mut unique = Vec::with_capacity(members.len());
        for member in members {
            if !unique.contains(&member) {
                unique.push(member);
            }
        }
        Self {
            name,
            members: unique,
            enabled: false,
            created_at,
            enabled_at: None,
            disabled_at: None,
            metadata: GroupMetadata::default(),
        }
    }
}

/// A member that could not be switched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberFailure {
    /// Policy name.
    pub name: PolicyName,
    /// Failure message.
    pub error: String,
}

/// Outcome of enabling or disabling a group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupReport {
    /// Group name.
    pub group: String,
    /// `false` when the group was already in the requested state.
    pub changed: bool,
    /// Members switched by this call.
    pub switched: Vec<PolicyName>,
    /// Members already in the requested state.
    pub unchanged: Vec<PolicyName>,
    /// Members that failed; the others were still processed.
    pub failed: Vec<MemberFailure>,
}

impl GroupReport {
    pub(crate) fn new(group: &str) -> Self {
        Self {
            group: group.to_string(),
            ..Self::default()
        }
    }

    /// Returns `true` if no member failed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}
