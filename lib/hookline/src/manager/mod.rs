//! Registry of active policies, groups and conditional interceptors.
//!
//! The manager is the only component that installs or ejects policy handlers.
//! For every active policy it keeps the [`Registration`] returned by the
//! engine, and [`InterceptorManager::get_status`] checks those ids against the
//! live chain contents rather than trusting its own bookkeeping.
//!
//! ```
//! use hookline::manager::{Condition, ConditionalConfig, InterceptorManager};
//! # use hookline::{ClientConfig, Engine, Response};
//! # use tower::util::BoxCloneService;
//! # let transport = BoxCloneService::new(tower::service_fn(|_req| async {
//! #     Ok::<_, hookline::Error>(Response::new(200, Default::default(), ""))
//! # }));
//! # let manager = InterceptorManager::new(Engine::new(transport, ClientConfig::default()));
//!
//! manager.create_group("resilience", ["retry", "rate_limit"])?;
//! manager.enable_group("resilience")?;
//! manager.add_conditional_interceptor(
//!     "cache",
//!     ConditionalConfig::new(Condition::path_prefix("/catalog")),
//! )?;
//! manager.enable_interceptor("cache")?;
//!
//! let status = manager.get_status();
//! assert_eq!(status.active_interceptors.len(), 3);
//! assert!(status.health.healthy);
//! # Ok::<(), hookline::Error>(())
//! ```

mod conditional;
mod group;
mod status;

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

pub use conditional::{Condition, ConditionalConfig, ConditionalStatus};
pub use group::{Group, GroupMetadata, GroupReport, MemberFailure};
pub use status::{ChainLengths, CleanupReport, Health, HealthIssue, ManagerStatus};

use conditional::ConditionalState;

use crate::engine::{Engine, Registration};
use crate::policy::{Policy, PolicyName, PolicyOptions, PolicyStats};
use crate::{Error, Result};

/// Teardown callback run once by [`InterceptorManager::cleanup`].
pub type CleanupCallback = Box<dyn FnOnce() -> Result<()> + Send>;

/// Milliseconds since the Unix epoch.
pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

fn count(len: usize) -> u64 {
    u64::try_from(len).unwrap_or(u64::MAX)
}

fn known(name: &str) -> Result<PolicyName> {
    name.parse()
        .map_err(|_| Error::not_found(format!("unknown interceptor '{name}'")))
}

#[derive(Debug, Clone, Copy)]
struct Active {
    registration: Registration,
    conditional: bool,
}

#[derive(Default)]
struct ManagerState {
    policies: BTreeMap<PolicyName, Arc<dyn Policy>>,
    active: BTreeMap<PolicyName, Active>,
    groups: BTreeMap<String, Group>,
    conditionals: BTreeMap<PolicyName, Arc<ConditionalState>>,
    cleanup: Vec<CleanupCallback>,
}

impl ManagerState {
    /// The policy instance for `name`, built from defaults on first use.
    fn policy(&mut self, name: PolicyName) -> Result<Arc<dyn Policy>> {
        if let Some(policy) = self.policies.get(&name) {
            return Ok(Arc::clone(policy));
        }
        let policy = PolicyOptions::default_for(name).build()?;
        self.policies.insert(name, Arc::clone(&policy));
        Ok(policy)
    }
}

/// Installs, ejects and reports policies on an [`Engine`].
pub struct InterceptorManager {
    engine: Engine,
    state: Mutex<ManagerState>,
}

impl fmt::Debug for InterceptorManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("InterceptorManager")
            .field("active", &state.active.keys().collect::<Vec<_>>())
            .field("groups", &state.groups.keys().collect::<Vec<_>>())
            .field("conditionals", &state.conditionals.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl InterceptorManager {
    /// Manager for `engine`, with nothing installed.
    #[must_use]
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            state: Mutex::default(),
        }
    }

    /// The managed engine.
    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Policies
    // ========================================================================

    /// Replace the instance of the policy `options` configure.
    ///
    /// An active policy is reinstalled with the new instance, keeping its
    /// conditional gate if it has one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the options are invalid.
    pub fn configure(&self, options: PolicyOptions) -> Result<()> {
        let name = options.name();
        let policy = options.build()?;

        let mut state = self.state();
        state.policies.insert(name, policy);
        if let Some(active) = state.active.remove(&name) {
            self.engine.uninstall(&active.registration);
            self.install(&mut state, name)?;
            debug!(interceptor = %name, "reinstalled with new options");
        }
        Ok(())
    }

    /// Configure then enable a policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the options are invalid.
    pub fn use_policy(&self, options: PolicyOptions) -> Result<()> {
        let name = options.name();
        self.configure(options)?;
        self.enable(name).map(|_| ())
    }

    /// The current instance of `name`, built from defaults if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the default options fail to build.
    pub fn policy(&self, name: PolicyName) -> Result<Arc<dyn Policy>> {
        self.state().policy(name)
    }

    /// Counters of every policy built so far.
    #[must_use]
    pub fn stats(&self) -> BTreeMap<PolicyName, PolicyStats> {
        self.state()
            .policies
            .iter()
            .map(|(name, policy)| (*name, policy.stats()))
            .collect()
    }

    /// Drop the accumulated state of every policy.
    pub fn reset_policies(&self) {
        for policy in self.state().policies.values() {
            policy.reset();
        }
    }

    fn install(&self, state: &mut ManagerState, name: PolicyName) -> Result<()> {
        let policy = state.policy(name)?;
        let (interceptors, conditional) = match state.conditionals.get(&name) {
            Some(gate) => (gate.wrap(policy.interceptors()), true),
            None => (policy.interceptors(), false),
        };
        let registration = self.engine.install(interceptors);
        state.active.insert(
            name,
            Active {
                registration,
                conditional,
            },
        );
        Ok(())
    }

    fn enable_locked(&self, state: &mut ManagerState, name: PolicyName) -> Result<bool> {
        if let Some(active) = state.active.get(&name).copied() {
            let missing = self.engine.missing(&active.registration);
            if missing.is_empty() {
                debug!(interceptor = %name, "interceptor already enabled");
                return Ok(false);
            }
            warn!(interceptor = %name, ?missing, "handlers were ejected externally, reinstalling");
            self.engine.uninstall(&active.registration);
            state.active.remove(&name);
        }

        self.install(state, name)?;
        info!(interceptor = %name, "interceptor enabled");
        Ok(true)
    }

    fn disable_locked(&self, state: &mut ManagerState, name: PolicyName) -> bool {
        let Some(active) = state.active.remove(&name) else {
            debug!(interceptor = %name, "interceptor already disabled");
            return false;
        };
        let missing = self.engine.uninstall(&active.registration);
        if !missing.is_empty() {
            warn!(interceptor = %name, ?missing, "handlers were already ejected");
        }
        info!(interceptor = %name, "interceptor disabled");
        true
    }

    /// Install `name`; returns `false` if it was already installed and intact.
    ///
    /// # Errors
    ///
    /// Returns an error if the policy cannot be built.
    pub fn enable(&self, name: PolicyName) -> Result<bool> {
        let mut state = self.state();
        self.enable_locked(&mut state, name)
    }

    /// Eject `name`; returns `false` if it was not installed.
    pub fn disable(&self, name: PolicyName) -> bool {
        let mut state = self.state();
        self.disable_locked(&mut state, name)
    }

    /// [`enable`](Self::enable) by registry name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if `name` is not a known policy.
    pub fn enable_interceptor(&self, name: &str) -> Result<bool> {
        self.enable(known(name)?)
    }

    /// [`disable`](Self::disable) by registry name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if `name` is not a known policy.
    pub fn disable_interceptor(&self, name: &str) -> Result<bool> {
        Ok(self.disable(known(name)?))
    }

    /// Returns `true` if `name` is installed and all its handlers are present.
    #[must_use]
    pub fn is_enabled(&self, name: PolicyName) -> bool {
        self.state()
            .active
            .get(&name)
            .is_some_and(|active| self.engine.missing(&active.registration).is_empty())
    }

    // ========================================================================
    // Groups
    // ========================================================================

    /// Define group `name`, initially disabled. An existing group of the same
    /// name is replaced; policies it enabled stay enabled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the name is empty, there are no
    /// members, or a member is not a known policy.
    pub fn create_group<I, S>(&self, name: &str, members: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if name.is_empty() {
            return Err(Error::validation("group name must not be empty"));
        }
        let members = members
            .into_iter()
            .map(|member| member.as_ref().parse::<PolicyName>())
            .collect::<Result<Vec<_>>>()?;
        if members.is_empty() {
            return Err(Error::validation(format!("group '{name}' has no members")));
        }

        let group = Group::new(name.to_string(), members, epoch_millis());
        let mut state = self.state();
        if let Some(previous) = state.groups.insert(name.to_string(), group) {
            debug!(group = name, was_enabled = previous.enabled, "replaced existing group");
        }
        info!(group = name, "group created");
        Ok(())
    }

    /// Enable every member of group `name`.
    ///
    /// Enabling an enabled group is a no-op reported with `changed = false`.
    /// A failing member is reported and does not stop the others.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the group does not exist.
    pub fn enable_group(&self, name: &str) -> Result<GroupReport> {
        let mut state = self.state();
        let members = match state.groups.get(name) {
            None => return Err(Error::not_found(format!("unknown group '{name}'"))),
            Some(group) if group.enabled => {
                debug!(group = name, "group already enabled");
                return Ok(GroupReport::new(name));
            }
            Some(group) => group.members.clone(),
        };

        let mut report = GroupReport::new(name);
        report.changed = true;
        for member in members {
            match self.enable_locked(&mut state, member) {
                Ok(true) => report.switched.push(member),
                Ok(false) => report.unchanged.push(member),
                Err(err) => {
                    warn!(group = name, interceptor = %member, error = %err, "group member failed to enable");
                    report.failed.push(MemberFailure {
                        name: member,
                        error: err.to_string(),
                    });
                }
            }
        }

        if let Some(group) = state.groups.get_mut(name) {
            group.enabled = true;
            group.enabled_at = Some(epoch_millis());
            group.metadata.enabled_count += 1;
            group.metadata.failed_count += count(report.failed.len());
        }
        info!(
            group = name,
            switched = report.switched.len(),
            failed = report.failed.len(),
            "group enabled"
        );
        Ok(report)
    }

    /// Disable every member of group `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the group does not exist.
    pub fn disable_group(&self, name: &str) -> Result<GroupReport> {
        let mut state = self.state();
        let members = match state.groups.get(name) {
            None => return Err(Error::not_found(format!("unknown group '{name}'"))),
            Some(group) if !group.enabled => {
                debug!(group = name, "group already disabled");
                return Ok(GroupReport::new(name));
            }
            Some(group) => group.members.clone(),
        };

        let mut report = GroupReport::new(name);
        report.changed = true;
        for member in members {
            if self.disable_locked(&mut state, member) {
                report.switched.push(member);
            } else {
                report.unchanged.push(member);
            }
        }

        if let Some(group) = state.groups.get_mut(name) {
            group.enabled = false;
            group.disabled_at = Some(epoch_millis());
        }
        info!(group = name, switched = report.switched.len(), "group disabled");
        Ok(report)
    }

    /// Flip group `name`, returning its new state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the group does not exist.
    pub fn toggle_group(&self, name: &str) -> Result<bool> {
        let enabled = self
            .state()
            .groups
            .get(name)
            .map(|group| group.enabled)
            .ok_or_else(|| Error::not_found(format!("unknown group '{name}'")))?;

        if enabled {
            self.disable_group(name)?;
        } else {
            self.enable_group(name)?;
        }
        Ok(!enabled)
    }

    // ========================================================================
    // Conditional interceptors
    // ========================================================================

    /// Gate policy `name` behind `config.predicate`.
    ///
    /// Replaces any conditional of the same name. If the policy is active
    /// (plain or conditional) it is reinstalled behind the new gate;
    /// otherwise it stays disabled until [`enable_interceptor`](Self::enable_interceptor).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `name` is not a known policy, or the
    /// options are invalid or configure another policy.
    pub fn add_conditional_interceptor(&self, name: &str, config: ConditionalConfig) -> Result<()> {
        let name: PolicyName = name.parse()?;
        let policy = match config.options {
            Some(options) if options.name() != name => {
                return Err(Error::validation(format!(
                    "options for '{}' given to conditional '{name}'",
                    options.name()
                )));
            }
            Some(options) => Some(options.build()?),
            None => None,
        };

        let mut state = self.state();
        if let Some(policy) = policy {
            state.policies.insert(name, policy);
        }
        let was_active = state.active.remove(&name);
        if let Some(active) = was_active {
            self.engine.uninstall(&active.registration);
        }
        let replaced = state
            .conditionals
            .insert(name, Arc::new(ConditionalState::new(name, config.predicate)))
            .is_some();
        if was_active.is_some() {
            self.install(&mut state, name)?;
        }

        info!(
            interceptor = %name,
            replaced,
            enabled = was_active.is_some(),
            "conditional interceptor added"
        );
        Ok(())
    }

    /// Remove the conditional for `name`, ejecting its gated handlers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if there is no such conditional.
    pub fn remove_conditional_interceptor(&self, name: &str) -> Result<()> {
        let name = known(name)?;
        let mut state = self.state();
        if state.conditionals.remove(&name).is_none() {
            return Err(Error::not_found(format!(
                "no conditional interceptor '{name}'"
            )));
        }
        if state.active.get(&name).is_some_and(|active| active.conditional) {
            self.disable_locked(&mut state, name);
        }
        info!(interceptor = %name, "conditional interceptor removed");
        Ok(())
    }

    // ========================================================================
    // Status and teardown
    // ========================================================================

    /// Snapshot of groups, conditionals and the policies actually on the chains.
    #[must_use]
    pub fn get_status(&self) -> ManagerStatus {
        let state = self.state();

        let mut active_interceptors = Vec::new();
        let mut issues = Vec::new();
        for (name, active) in &state.active {
            let missing = self.engine.missing(&active.registration);
            if missing.is_empty() {
                active_interceptors.push(*name);
            } else {
                issues.push(HealthIssue {
                    name: *name,
                    missing,
                });
            }
        }

        let conditional = state
            .conditionals
            .iter()
            .map(|(name, gate)| {
                let enabled = active_interceptors.contains(name)
                    && state.active.get(name).is_some_and(|active| active.conditional);
                (*name, gate.status(enabled))
            })
            .collect();

        ManagerStatus {
            groups: state.groups.clone(),
            conditional,
            active_interceptors,
            health: Health {
                healthy: issues.is_empty(),
                issues,
                chains: ChainLengths {
                    dispatch: self.engine.dispatch_chain().len(),
                    request: self.engine.request_chain().len(),
                    response: self.engine.response_chain().len(),
                },
            },
        }
    }

    /// Register a callback for [`cleanup`](Self::cleanup).
    pub fn on_cleanup(&self, callback: impl FnOnce() -> Result<()> + Send + 'static) {
        self.state().cleanup.push(Box::new(callback));
    }

    /// Disable every group, remove every conditional, eject every policy,
    /// reset policy state and run the cleanup callbacks.
    ///
    /// Never fails: errors (including panicking callbacks) are logged and
    /// collected in the report.
    pub fn cleanup(&self) -> CleanupReport {
        let mut report = CleanupReport::default();

        let callbacks = {
            let mut state = self.state();
            let now = epoch_millis();
            for group in state.groups.values_mut().filter(|group| group.enabled) {
                group.enabled = false;
                group.disabled_at = Some(now);
            }
            state.conditionals.clear();

            for (name, active) in std::mem::take(&mut state.active) {
                let missing = self.engine.uninstall(&active.registration);
                if !missing.is_empty() {
                    report
                        .errors
                        .push(format!("{name}: handlers already ejected from {missing:?}"));
                }
                report.disabled.push(name);
            }
            for policy in state.policies.values() {
                policy.reset();
            }
            std::mem::take(&mut state.cleanup)
        };

        for callback in callbacks {
            report.callbacks += 1;
            match catch_unwind(AssertUnwindSafe(callback)) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => report.errors.push(err.to_string()),
                Err(_) => report.errors.push("cleanup callback panicked".to_string()),
            }
        }

        for err in &report.errors {
            warn!(error = %err, "cleanup step failed");
        }
        info!(
            disabled = report.disabled.len(),
            callbacks = report.callbacks,
            errors = report.errors.len(),
            "interceptor manager cleaned up"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use assert2::{check, let_assert};

    use super::*;
    use crate::chain::Phase;
    use crate::engine::tests::{MockService, engine, get};
    use crate::policy::{CacheOptions, RetryDelay, RetryOptions};

    fn manager(mock: &MockService) -> InterceptorManager {
        InterceptorManager::new(engine(mock))
    }

    fn instant_retry() -> PolicyOptions {
        PolicyOptions::Retry(RetryOptions::default().delay(RetryDelay::Fixed(Duration::ZERO)))
    }

    #[test]
    fn group_enables_and_disables_every_member() {
        let mock = MockService::new(200);
        let manager = manager(&mock);
        manager.create_group("g", ["auth", "retry"]).expect("group");

        let_assert!(Ok(report) = manager.enable_group("g"));
        check!(report.changed);
        check!(report.switched == [PolicyName::Auth, PolicyName::Retry]);
        let status = manager.get_status();
        check!(status.is_active(PolicyName::Auth));
        check!(status.is_active(PolicyName::Retry));
        check!(status.groups["g"].enabled);
        check!(status.groups["g"].metadata.enabled_count == 1);

        let_assert!(Ok(report) = manager.disable_group("g"));
        check!(report.switched == [PolicyName::Auth, PolicyName::Retry]);
        let status = manager.get_status();
        check!(!status.is_active(PolicyName::Auth));
        check!(!status.is_active(PolicyName::Retry));
        check!(status.groups["g"].disabled_at.is_some());
        check!(status.health.chains == ChainLengths::default());
    }

    #[test]
    fn group_validation() {
        let mock = MockService::new(200);
        let manager = manager(&mock);

        let_assert!(Err(Error::Validation(message)) = manager.create_group("g", ["auth", "circuit"]));
        check!(message.contains("circuit"));
        check!(matches!(manager.create_group("g", Vec::<&str>::new()), Err(Error::Validation(_))));
        check!(matches!(manager.create_group("", ["auth"]), Err(Error::Validation(_))));
        check!(matches!(manager.enable_group("missing"), Err(Error::NotFound(_))));
        check!(matches!(manager.disable_group("missing"), Err(Error::NotFound(_))));
        check!(matches!(manager.toggle_group("missing"), Err(Error::NotFound(_))));
    }

    #[test]
    fn enabling_twice_is_a_no_op() {
        let mock = MockService::new(200);
        let manager = manager(&mock);
        manager.create_group("g", ["cache"]).expect("group");

        let_assert!(Ok(first) = manager.enable_group("g"));
        let_assert!(Ok(second) = manager.enable_group("g"));
        check!(first.changed);
        check!(!second.changed);
        check!(manager.engine().request_chain().len() == 1);
        check!(manager.get_status().groups["g"].metadata.enabled_count == 1);

        check!(manager.enable_interceptor("cache").ok() == Some(false));
        check!(manager.engine().request_chain().len() == 1);
        check!(manager.disable_interceptor("dedupe").ok() == Some(false));
        check!(matches!(manager.enable_interceptor("nope"), Err(Error::NotFound(_))));
    }

    #[test]
    fn toggle_flips_state() {
        let mock = MockService::new(200);
        let manager = manager(&mock);
        manager.create_group("g", ["logging"]).expect("group");

        check!(manager.toggle_group("g").ok() == Some(true));
        check!(manager.is_enabled(PolicyName::Logging));
        check!(manager.toggle_group("g").ok() == Some(false));
        check!(!manager.is_enabled(PolicyName::Logging));
    }

    #[test]
    fn status_tracks_manual_ejection() {
        let mock = MockService::new(200);
        let manager = manager(&mock);
        manager.enable(PolicyName::Retry).expect("enable");

        let engine = manager.engine();
        let_assert!(Some(id) = engine.response_chain().ids().first().copied());
        check!(engine.response_chain().eject(id));

        let status = manager.get_status();
        check!(!status.is_active(PolicyName::Retry));
        check!(!status.health.healthy);
        check!(
            status.health.issues
                == [HealthIssue {
                    name: PolicyName::Retry,
                    missing: vec![Phase::Response],
                }]
        );

        check!(manager.enable_interceptor("retry").ok() == Some(true));
        let status = manager.get_status();
        check!(status.is_active(PolicyName::Retry));
        check!(status.health.healthy);
        check!(status.health.chains.response == 1);
    }

    #[tokio::test]
    async fn conditional_applies_only_when_predicate_holds() {
        let mock = MockService::sequence(&[500, 200, 500], 200);
        let manager = manager(&mock);
        manager
            .add_conditional_interceptor(
                "retry",
                ConditionalConfig::new(Condition::path_prefix("/api")).options(instant_retry()),
            )
            .expect("conditional");
        check!(!manager.is_enabled(PolicyName::Retry));
        manager.enable_interceptor("retry").expect("enable");

        let engine = manager.engine();
        let_assert!(Ok(_) = engine.dispatch(get("https://example.com/api/users")).await);
        check!(mock.call_count() == 2);

        let_assert!(Err(err) = engine.dispatch(get("https://example.com/static")).await);
        check!(err.status() == Some(500));
        check!(mock.call_count() == 3);

        let status = manager.get_status();
        let conditional = &status.conditional[&PolicyName::Retry];
        check!(conditional.enabled);
        // The replay reuses the decision of its original request.
        check!(conditional.activation_count == 1);
    }

    #[tokio::test(start_paused = true)]
    async fn conditional_dedupe_collapses_matching_paths_only() {
        let mock = MockService::new(200).with_delay(Duration::from_millis(50));
        let manager = manager(&mock);
        manager
            .add_conditional_interceptor(
                "dedupe",
                ConditionalConfig::new(Condition::path_prefix("/reports")),
            )
            .expect("conditional");
        manager.enable(PolicyName::Dedupe).expect("enable");
        check!(manager.get_status().health.chains.dispatch == 1);

        let engine = manager.engine();
        let (a, b) = tokio::join!(
            engine.dispatch(get("https://example.com/reports/daily")),
            engine.dispatch(get("https://example.com/reports/daily")),
        );
        let_assert!(Ok(a) = a);
        let_assert!(Ok(b) = b);
        check!(a.body() == b.body());
        check!(mock.call_count() == 1);

        let (c, d) = tokio::join!(
            engine.dispatch(get("https://example.com/live")),
            engine.dispatch(get("https://example.com/live")),
        );
        let_assert!(Ok(c) = c);
        let_assert!(Ok(d) = d);
        check!(c.body() != d.body());
        check!(mock.call_count() == 3);

        let status = manager.get_status();
        check!(status.conditional[&PolicyName::Dedupe].activation_count == 2);
    }

    #[tokio::test]
    async fn failing_predicate_skips_policy() {
        let mock = MockService::new(200);
        let manager = manager(&mock);
        manager
            .add_conditional_interceptor(
                "cache",
                ConditionalConfig::new(Condition::fallible(|_| Err("boom".to_string()))),
            )
            .expect("conditional");
        manager.enable(PolicyName::Cache).expect("enable");

        let engine = manager.engine();
        for _ in 0..2 {
            let_assert!(Ok(_) = engine.dispatch(get("https://example.com/")).await);
        }
        check!(mock.call_count() == 2);

        let status = manager.get_status();
        let conditional = &status.conditional[&PolicyName::Cache];
        check!(conditional.activation_count == 0);
        check!(conditional.errors == ["boom", "boom"]);
    }

    #[test]
    fn conditional_replaces_active_plain_interceptor() {
        let mock = MockService::new(200);
        let manager = manager(&mock);
        manager.enable(PolicyName::Cache).expect("enable");

        manager
            .add_conditional_interceptor("cache", ConditionalConfig::new(Condition::new(|_| true)))
            .expect("conditional");

        let status = manager.get_status();
        check!(status.is_active(PolicyName::Cache));
        check!(status.conditional[&PolicyName::Cache].enabled);
        check!(status.health.chains.request == 1);
        check!(status.health.chains.response == 1);

        manager.remove_conditional_interceptor("cache").expect("remove");
        let status = manager.get_status();
        check!(!status.is_active(PolicyName::Cache));
        check!(status.conditional.is_empty());
    }

    #[test]
    fn conditional_validation() {
        let mock = MockService::new(200);
        let manager = manager(&mock);
        let always = || ConditionalConfig::new(Condition::new(|_| true));

        check!(matches!(
            manager.add_conditional_interceptor("bogus", always()),
            Err(Error::Validation(_))
        ));
        check!(matches!(
            manager.add_conditional_interceptor("retry", always().options(PolicyOptions::Cache(CacheOptions::default()))),
            Err(Error::Validation(_))
        ));
        check!(matches!(
            manager.add_conditional_interceptor(
                "cache",
                always().options(PolicyOptions::Cache(CacheOptions::default().max_size(0)))
            ),
            Err(Error::Validation(_))
        ));
        check!(matches!(manager.remove_conditional_interceptor("retry"), Err(Error::NotFound(_))));
    }

    #[test]
    fn configure_reinstalls_active_policy() {
        let mock = MockService::new(200);
        let manager = manager(&mock);
        manager.enable(PolicyName::Cache).expect("enable");
        let before = manager.engine().request_chain().ids();

        manager
            .configure(PolicyOptions::Cache(CacheOptions::default().max_size(1)))
            .expect("configure");

        let after = manager.engine().request_chain().ids();
        check!(after.len() == 1);
        check!(before != after);
        check!(manager.is_enabled(PolicyName::Cache));
    }

    #[test]
    fn cleanup_never_fails() {
        let mock = MockService::new(200);
        let manager = manager(&mock);
        manager.create_group("g", ["auth", "cache", "dedupe"]).expect("group");
        manager.enable_group("g").expect("enable");
        manager
            .add_conditional_interceptor("retry", ConditionalConfig::new(Condition::new(|_| true)))
            .expect("conditional");

        let ran = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&ran);
        manager.on_cleanup(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        manager.on_cleanup(|| Err(Error::validation("broken teardown")));
        manager.on_cleanup(|| panic!("teardown exploded"));

        let report = manager.cleanup();
        check!(report.callbacks == 3);
        check!(ran.load(Ordering::SeqCst) == 1);
        check!(report.errors.len() == 2);
        check!(report.disabled.len() == 3);

        let status = manager.get_status();
        check!(status.active_interceptors.is_empty());
        check!(status.conditional.is_empty());
        check!(!status.groups["g"].enabled);
        check!(status.health.chains == ChainLengths::default());

        // Callbacks run once.
        check!(manager.cleanup().callbacks == 0);
    }
}
