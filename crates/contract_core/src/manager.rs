//! Lifecycle manager.
//!
//! # Responsibility
//! - Produce contract handles: create, adopt, observe, latest.
//! - Own the process-wide template scope slot.
//! - Track live handles by contract id.
//!
//! # Invariants
//! - At most one template scope is installed at a time.
//! - Failures never return partially bound handles.
//! - Registry entries are weak; abandoned or dropped handles are pruned.

use crate::config::ContractConfig;
use crate::error::{ContractError, ContractResult};
use crate::handle::{ContractHandle, HandleOrigin, HandleShared};
use crate::kernel::{Access, ContractKernel, KernelError};
use crate::model::event::Ctid;
use crate::model::template::Template;
use crate::scope::TemplateScope;
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

#[derive(Debug, Default)]
struct ScopeSlot {
    template: Option<Template>,
    generation: u64,
}

type HandleRegistry = BTreeMap<Ctid, Vec<Weak<HandleShared>>>;

/// Entry point for binding to contracts.
pub struct ContractManager {
    kernel: Arc<dyn ContractKernel>,
    config: ContractConfig,
    scope: Mutex<ScopeSlot>,
    registry: Mutex<HandleRegistry>,
}

impl std::fmt::Debug for ContractManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContractManager")
            .field("config", &self.config)
            .field("scope_generation", &self.scope_generation())
            .finish()
    }
}

impl ContractManager {
    /// Builds a manager with configuration read from the environment.
    pub fn new(kernel: Arc<dyn ContractKernel>) -> Self {
        Self::with_config(kernel, ContractConfig::from_env())
    }

    pub fn with_config(kernel: Arc<dyn ContractKernel>, config: ContractConfig) -> Self {
        Self {
            kernel,
            config: config.normalized(),
            scope: Mutex::new(ScopeSlot::default()),
            registry: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &ContractConfig {
        &self.config
    }

    pub fn kernel(&self) -> &Arc<dyn ContractKernel> {
        &self.kernel
    }

    /// Allocates an unactivated process contract with the default template.
    pub fn create(&self) -> ContractResult<ContractHandle> {
        self.create_with(&Template::process_default())
    }

    /// Allocates an unactivated contract from `template`.
    pub fn create_with(&self, template: &Template) -> ContractResult<ContractHandle> {
        template.validate()?;
        let ctid = self
            .kernel
            .create(template)
            .map_err(|err| self.rejected("create", err))?;
        Ok(self.bind(ctid, Access::Control, HandleOrigin::Created))
    }

    /// Binds with control access to an existing contract.
    pub fn adopt(&self, ctid: Ctid) -> ContractResult<ContractHandle> {
        self.kernel
            .open(ctid, Access::Control)
            .map_err(|err| self.rejected("adopt", err))?;
        Ok(self.bind(ctid, Access::Control, HandleOrigin::Adopted))
    }

    /// Binds read-only to an existing contract.
    pub fn observe(&self, ctid: Ctid) -> ContractResult<ContractHandle> {
        self.kernel
            .open(ctid, Access::Observe)
            .map_err(|err| self.rejected("observe", err))?;
        Ok(self.bind(ctid, Access::Observe, HandleOrigin::Observed))
    }

    /// Binds to the most recently created contract, waiting up to the
    /// configured timeout for one to register.
    pub fn latest(&self) -> ContractResult<ContractHandle> {
        let ctid = self
            .kernel
            .latest(self.config.latest_timeout())
            .map_err(|err| self.rejected("latest", err))?
            .ok_or(ContractError::NoContract)?;
        self.kernel
            .open(ctid, Access::Control)
            .map_err(|err| self.rejected("latest", err))?;
        Ok(self.bind(ctid, Access::Control, HandleOrigin::Latest))
    }

    /// Installs `template` for subsequently spawned processes.
    pub fn set_template(&self, template: Template) -> ContractResult<TemplateScope<'_>> {
        template.validate()?;
        let mut slot = self.scope.lock();
        if slot.template.is_some() {
            return Err(ContractError::ScopeAlreadyActive);
        }
        match self.kernel.set_template(&template) {
            Ok(()) => {}
            Err(KernelError::Busy(_)) => return Err(ContractError::ScopeAlreadyActive),
            Err(err) => return Err(self.rejected("set_template", err)),
        }
        slot.generation += 1;
        slot.template = Some(template.clone());
        info!(
            "event=scope_set module=manager status=ok generation={} type={} cookie={}",
            slot.generation, template.contract_type, template.cookie
        );
        Ok(TemplateScope::new(self, slot.generation, template))
    }

    /// Removes the installed template scope.
    pub fn clear_template(&self) -> ContractResult<()> {
        let generation = self.scope.lock().generation;
        self.release_scope(generation)
    }

    /// Runs `f` with `template` installed and clears it afterwards,
    /// whether `f` succeeds or not.
    pub fn with_template<T, E>(
        &self,
        template: Template,
        f: impl FnOnce(&TemplateScope<'_>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<ContractError>,
    {
        let scope = self.set_template(template)?;
        let outcome = f(&scope);
        let cleared = scope.clear();
        let value = outcome?;
        cleared?;
        Ok(value)
    }

    /// Live, unabandoned handles bound to `ctid`.
    pub fn find(&self, ctid: Ctid) -> Vec<ContractHandle> {
        let mut registry = self.registry.lock();
        prune(&mut registry);
        registry
            .get(&ctid)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(Weak::upgrade)
                    .map(ContractHandle::from_shared)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Contract ids with at least one live handle, ascending.
    pub fn live_contracts(&self) -> Vec<Ctid> {
        let mut registry = self.registry.lock();
        prune(&mut registry);
        registry.keys().copied().collect()
    }

    pub(crate) fn scope_generation(&self) -> Option<u64> {
        let slot = self.scope.lock();
        slot.template.as_ref().map(|_| slot.generation)
    }

    /// Clears the scope installed as `generation`.
    pub(crate) fn release_scope(&self, generation: u64) -> ContractResult<()> {
        let mut slot = self.scope.lock();
        if slot.template.is_none() || slot.generation != generation {
            return Err(ContractError::NoActiveScope);
        }
        self.kernel
            .clear_template()
            .map_err(|err| self.rejected("clear_template", err))?;
        slot.template = None;
        info!(
            "event=scope_clear module=manager status=ok generation={}",
            generation
        );
        Ok(())
    }

    fn bind(&self, ctid: Ctid, access: Access, origin: HandleOrigin) -> ContractHandle {
        let handle = ContractHandle::bind(
            self.kernel.clone(),
            ctid,
            access,
            origin,
            self.config.clone(),
        );
        let mut registry = self.registry.lock();
        prune(&mut registry);
        registry
            .entry(ctid)
            .or_default()
            .push(Arc::downgrade(handle.shared()));
        info!(
            "event=contract_bind module=manager status=ok ctid={} origin={}",
            ctid,
            origin.as_str()
        );
        handle
    }

    fn rejected(&self, operation: &'static str, err: KernelError) -> ContractError {
        warn!(
            "event=contract_{} module=manager status=error error={}",
            operation, err
        );
        ContractError::kernel(operation, err)
    }
}

fn prune(registry: &mut HandleRegistry) {
    registry.retain(|_, entries| {
        entries.retain(|entry| {
            entry
                .upgrade()
                .map_or(false, |shared| !shared.is_abandoned())
        });
        !entries.is_empty()
    });
}

#[cfg(test)]
mod tests {
    use super::ContractManager;
    use crate::config::ContractConfig;
    use crate::error::ContractError;
    use crate::kernel::sim::SimKernel;
    use crate::model::event::EventKind;
    use crate::model::template::{ContractType, Template};
    use std::sync::Arc;

    fn manager() -> (Arc<SimKernel>, ContractManager) {
        let kernel = Arc::new(SimKernel::new());
        let config = ContractConfig {
            latest_timeout_ms: 20,
            ..ContractConfig::default()
        };
        let manager = ContractManager::with_config(kernel.clone(), config);
        (kernel, manager)
    }

    #[test]
    fn registry_tracks_live_handles() {
        let (_kernel, manager) = manager();
        let first = manager.create().expect("create");
        let second = manager.create().expect("create");
        assert_eq!(manager.live_contracts(), vec![first.id(), second.id()]);

        let ctid = first.id();
        first.abandon().expect("abandon");
        assert!(manager.find(ctid).is_empty());
        drop(second);
        assert!(manager.live_contracts().is_empty());
    }

    #[test]
    fn latest_without_contract_is_retryable() {
        let (_kernel, manager) = manager();
        let err = manager.latest().expect_err("nothing spawned yet");
        assert_eq!(err, ContractError::NoContract);
        assert!(err.is_retryable());
    }

    #[test]
    fn invalid_template_is_rejected_before_the_facility() {
        let (kernel, manager) = manager();
        let template = Template::new(ContractType::Process)
            .with_critical(EventKind::ProcessExit)
            .with_informative(EventKind::ProcessExit);
        let err = manager.set_template(template).expect_err("overlap");
        assert!(matches!(err, ContractError::InvalidTemplate(_)));
        assert!(kernel.scoped_template().is_none());
    }

    #[test]
    fn stale_guard_does_not_clear_newer_scope() {
        let (kernel, manager) = manager();
        let stale = manager
            .set_template(Template::process_default())
            .expect("first scope");
        manager.clear_template().expect("explicit clear");
        let fresh = manager
            .set_template(Template::process_default().with_cookie(2))
            .expect("second scope");

        assert_eq!(stale.clear(), Err(ContractError::NoActiveScope));
        assert!(fresh.is_current());
        assert_eq!(kernel.scoped_template().map(|t| t.cookie), Some(2));
        drop(fresh);
        assert!(kernel.scoped_template().is_none());
    }
}
