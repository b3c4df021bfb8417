//! Serializable views of the manager state.

use std::collections::BTreeMap;

use serde::Serialize;

use super::{ConditionalStatus, Group};
use crate::chain::Phase;
use crate::policy::PolicyName;

/// Number of handlers on each chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChainLengths {
    /// Dispatch chain.
    pub dispatch: usize,
    /// Request chain.
    pub request: usize,
    /// Response chain.
    pub response: usize,
}

/// A registration whose handler is gone from its chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthIssue {
    /// Policy whose registration is incomplete.
    pub name: PolicyName,
    /// Chains the handler is missing from.
    pub missing: Vec<Phase>,
}

/// Consistency between bookkeeping and chain contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Health {
    /// `true` iff `issues` is empty.
    pub healthy: bool,
    /// Inconsistencies found.
    pub issues: Vec<HealthIssue>,
    /// Current chain lengths.
    pub chains: ChainLengths,
}

/// Snapshot returned by [`InterceptorManager::get_status`](super::InterceptorManager::get_status).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStatus {
    /// Every group, by name.
    pub groups: BTreeMap<String, Group>,
    /// Every conditional interceptor, by policy name.
    pub conditional: BTreeMap<PolicyName, ConditionalStatus>,
    /// Policies whose handlers are all present on the chains.
    pub active_interceptors: Vec<PolicyName>,
    /// Bookkeeping checks.
    pub health: Health,
}

impl ManagerStatus {
    /// Returns `true` if `name` is installed and intact.
    #[must_use]
    pub fn is_active(&self, name: PolicyName) -> bool {
        self.active_interceptors.contains(&name)
    }
}

/// Outcome of [`InterceptorManager::cleanup`](super::InterceptorManager::cleanup).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Policies that were uninstalled.
    pub disabled: Vec<PolicyName>,
    /// Cleanup callbacks that ran.
    pub callbacks: usize,
    /// Errors collected along the way; cleanup itself never fails.
    pub errors: Vec<String>,
}

impl CleanupReport {
    /// Returns `true` if every step succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}
