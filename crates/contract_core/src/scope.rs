//! Template scope guard.
//!
//! # Responsibility
//! - Keep a template installed for the next spawned processes while the
//!   guard lives, and remove it on every exit path.
//!
//! # Invariants
//! - A guard only clears the scope it installed. After an explicit
//!   `ContractManager::clear_template` and a new `set_template`, a stale
//!   guard leaves the newer scope alone.

use crate::error::ContractResult;
use crate::kernel::{LaunchError, LaunchRequest, ProcessLauncher};
use crate::manager::ContractManager;
use crate::model::event::Pid;
use crate::model::template::Template;
use log::{info, warn};

/// Active template scope, released by [`TemplateScope::clear`] or on drop.
#[derive(Debug)]
#[must_use = "dropping the scope clears the template immediately"]
pub struct TemplateScope<'m> {
    manager: &'m ContractManager,
    generation: u64,
    template: Template,
    released: bool,
}

impl<'m> TemplateScope<'m> {
    pub(crate) fn new(manager: &'m ContractManager, generation: u64, template: Template) -> Self {
        Self {
            manager,
            generation,
            template,
            released: false,
        }
    }

    pub fn template(&self) -> &Template {
        &self.template
    }

    /// Whether this guard's template is still the installed scope.
    pub fn is_current(&self) -> bool {
        !self.released && self.manager.scope_generation() == Some(self.generation)
    }

    /// Runs `launch` while the template is installed.
    pub fn spawn<T, E>(&self, launch: impl FnOnce(&Template) -> Result<T, E>) -> Result<T, E> {
        launch(&self.template)
    }

    /// Spawns `request` through `launcher` into a fresh contract built from
    /// this template.
    pub fn launch(
        &self,
        launcher: &dyn ProcessLauncher,
        request: &LaunchRequest,
    ) -> Result<Pid, LaunchError> {
        if !self.is_current() {
            return Err(LaunchError::Failed(
                "template scope is no longer active".to_string(),
            ));
        }
        let pid = launcher.spawn(request)?;
        info!(
            "event=scope_spawn module=scope status=ok pid={} program={}",
            pid, request.program
        );
        Ok(pid)
    }

    /// Removes the template now.
    ///
    /// Fails with `NoActiveScope` when this guard's scope was already
    /// cleared elsewhere.
    pub fn clear(mut self) -> ContractResult<()> {
        self.released = true;
        self.manager.release_scope(self.generation)
    }
}

impl Drop for TemplateScope<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if self.manager.scope_generation() != Some(self.generation) {
            return;
        }
        if let Err(err) = self.manager.release_scope(self.generation) {
            warn!(
                "event=scope_release module=scope status=error generation={} error={}",
                self.generation, err
            );
        }
    }
}
