//! In-process contract facility.
//!
//! # Responsibility
//! - Implement [`ContractKernel`] and [`ProcessLauncher`] entirely in memory.
//! - Model members, holders, per-contract event logs and acknowledgment
//!   state closely enough to drive the core end to end.
//! - Expose lifecycle drivers (`exit`, `fork`, `dump_core`, ...) that
//!   stand in for processes doing things on their own.
//!
//! # Invariants
//! - Events are generated only for kinds the contract's template lists.
//! - `pr_empty` is generated exactly once, when the last member leaves.
//! - Evids start at 1 and increase by one per generated event.
//! - Contracts that are abandoned and empty are destroyed.

use crate::kernel::{
    Access, ContractKernel, KernelError, KernelResult, KernelStatus, LaunchError, LaunchRequest,
    ProcessLauncher,
};
use crate::model::event::{Ctid, Event, EventClass, EventKind, EventPayload, Evid, Pid};
use crate::model::status::ContractState;
use crate::model::template::{ContractType, Template, TemplateParam};
use log::{debug, info};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

const FIRST_CTID: Ctid = 1;
const FIRST_PID: Pid = 1000;
const FIRST_EVID: Evid = 1;
const SIGKILL: i32 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Holder {
    Creator,
    Adopter,
    Orphaned,
    Foreign,
    Released,
}

impl Holder {
    fn state(self) -> ContractState {
        match self {
            Self::Creator | Self::Foreign => ContractState::Owned,
            Self::Adopter => ContractState::Inherited,
            Self::Orphaned => ContractState::Orphan,
            Self::Released => ContractState::Dead,
        }
    }

    fn has_control(self) -> bool {
        matches!(self, Self::Creator | Self::Adopter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Pending,
    Quiesced,
    Acked,
    Nacked,
    Informative,
}

#[derive(Debug)]
struct LoggedEvent {
    event: Event,
    disposition: Disposition,
}

impl LoggedEvent {
    /// Retired critical events are no longer handed to readers.
    fn is_readable(&self) -> bool {
        matches!(
            self.disposition,
            Disposition::Pending | Disposition::Informative
        )
    }
}

#[derive(Debug)]
struct SimContract {
    template: Template,
    holder: Holder,
    members: BTreeSet<Pid>,
    log: Vec<LoggedEvent>,
    next_evid: Evid,
}

impl SimContract {
    fn new(template: Template, holder: Holder) -> Self {
        Self {
            template,
            holder,
            members: BTreeSet::new(),
            log: Vec::new(),
            next_evid: FIRST_EVID,
        }
    }

    fn emit(&mut self, ctid: Ctid, kind: EventKind, payload: EventPayload) -> Option<Evid> {
        let class = self.template.class_of(kind)?;
        let evid = self.next_evid;
        self.next_evid += 1;
        let disposition = match class {
            EventClass::Critical => Disposition::Pending,
            EventClass::Informative => Disposition::Informative,
        };
        self.log.push(LoggedEvent {
            event: Event {
                ctid,
                evid,
                kind,
                class,
                cookie: self.template.cookie,
                payload,
            },
            disposition,
        });
        debug!(
            "event=sim_emit module=sim status=ok ctid={} evid={} kind={}",
            ctid, evid, kind
        );
        Some(evid)
    }

    fn count(&self, disposition: Disposition) -> usize {
        self.log
            .iter()
            .filter(|entry| entry.disposition == disposition)
            .count()
    }

    /// Drops every hold the previous holder had on outstanding events.
    fn release_holds(&mut self) {
        for entry in &mut self.log {
            if matches!(
                entry.disposition,
                Disposition::Pending | Disposition::Quiesced
            ) {
                entry.disposition = Disposition::Acked;
            }
        }
    }
}

#[derive(Debug)]
struct SimState {
    next_ctid: Ctid,
    next_pid: Pid,
    contracts: BTreeMap<Ctid, SimContract>,
    processes: BTreeMap<Pid, Option<Ctid>>,
    template: Option<Template>,
    active: Option<Ctid>,
    latest: Option<Ctid>,
    read_fault: Option<String>,
}

impl SimState {
    fn allocate(&mut self, template: Template, holder: Holder, visible: bool) -> Ctid {
        let ctid = self.next_ctid;
        self.next_ctid += 1;
        self.contracts.insert(ctid, SimContract::new(template, holder));
        if visible {
            self.latest = Some(ctid);
        }
        ctid
    }

    fn contract(&self, ctid: Ctid) -> KernelResult<&SimContract> {
        self.contracts.get(&ctid).ok_or(KernelError::NotFound(ctid))
    }

    fn contract_mut(&mut self, ctid: Ctid) -> KernelResult<&mut SimContract> {
        self.contracts
            .get_mut(&ctid)
            .ok_or(KernelError::NotFound(ctid))
    }

    fn controlled_mut(&mut self, ctid: Ctid) -> KernelResult<&mut SimContract> {
        let contract = self.contract_mut(ctid)?;
        if !contract.holder.has_control() {
            return Err(KernelError::PermissionDenied(ctid));
        }
        Ok(contract)
    }

    fn enroll(&mut self, pid: Pid, ctid: Option<Ctid>) {
        self.processes.insert(pid, ctid);
        if let Some(contract) = ctid.and_then(|ctid| self.contracts.get_mut(&ctid)) {
            contract.members.insert(pid);
        }
    }

    fn member_contract(&self, pid: Pid) -> KernelResult<Option<Ctid>> {
        self.processes
            .get(&pid)
            .copied()
            .ok_or_else(|| KernelError::Rejected(format!("no such process: {pid}")))
    }

    fn emit_for(&mut self, pid: Pid, kind: EventKind, payload: EventPayload) -> KernelResult<()> {
        if let Some(ctid) = self.member_contract(pid)? {
            if let Some(contract) = self.contracts.get_mut(&ctid) {
                contract.emit(ctid, kind, payload);
            }
        }
        Ok(())
    }

    /// Removes `pid` from its contract, generating exit/empty events.
    fn leave(&mut self, pid: Pid, status: i32) -> KernelResult<()> {
        let ctid = self.member_contract(pid)?;
        self.processes.remove(&pid);
        let Some(ctid) = ctid else {
            return Ok(());
        };
        let Some(contract) = self.contracts.get_mut(&ctid) else {
            return Ok(());
        };

        contract.emit(ctid, EventKind::ProcessExit, EventPayload::Exit { pid, status });
        contract.members.remove(&pid);
        if contract.members.is_empty() {
            contract.emit(ctid, EventKind::ProcessEmpty, EventPayload::Empty);
            if contract.holder == Holder::Released {
                self.contracts.remove(&ctid);
                debug!(
                    "event=sim_destroy module=sim status=ok ctid={} reason=empty",
                    ctid
                );
            }
        }
        Ok(())
    }

    fn terminate(&mut self, pid: Pid, signal: i32) -> KernelResult<()> {
        self.emit_for(pid, EventKind::ProcessSignal, EventPayload::Signal { pid, signal })?;
        self.leave(pid, 128 + signal)
    }
}

/// In-memory contract facility and process launcher.
#[derive(Debug)]
pub struct SimKernel {
    state: Mutex<SimState>,
    changed: Condvar,
}

impl Default for SimKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl SimKernel {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                next_ctid: FIRST_CTID,
                next_pid: FIRST_PID,
                contracts: BTreeMap::new(),
                processes: BTreeMap::new(),
                template: None,
                active: None,
                latest: None,
                read_fault: None,
            }),
            changed: Condvar::new(),
        }
    }

    /// Member `pid` exits with `status`.
    pub fn exit(&self, pid: Pid, status: i32) -> KernelResult<()> {
        self.mutate(|state| state.leave(pid, status))
    }

    /// Member `parent` forks a child into its own contract.
    pub fn fork(&self, parent: Pid) -> KernelResult<Pid> {
        self.mutate(|state| {
            let ctid = state.member_contract(parent)?;
            let pid = state.next_pid;
            state.next_pid += 1;
            state.enroll(pid, ctid);
            state.emit_for(
                pid,
                EventKind::ProcessFork,
                EventPayload::Fork { pid, ppid: parent },
            )?;
            Ok(pid)
        })
    }

    /// Member `pid` dumps core and keeps running.
    pub fn dump_core(&self, pid: Pid) -> KernelResult<()> {
        self.mutate(|state| state.emit_for(pid, EventKind::ProcessCore, EventPayload::Core { pid }))
    }

    /// Member `pid` is killed by an uncorrectable hardware error.
    pub fn hardware_error(&self, pid: Pid) -> KernelResult<()> {
        self.mutate(|state| {
            state.emit_for(pid, EventKind::ProcessHwErr, EventPayload::HwErr { pid })?;
            state.leave(pid, 128 + SIGKILL)
        })
    }

    /// Member `pid` receives fatal `signal`.
    pub fn kill(&self, pid: Pid, signal: i32) -> KernelResult<()> {
        self.mutate(|state| state.terminate(pid, signal))
    }

    /// Device contract `ctid` reports a state transition for `path`.
    pub fn device_event(&self, ctid: Ctid, kind: EventKind, path: &str) -> KernelResult<()> {
        self.mutate(|state| {
            let contract = state.contract_mut(ctid)?;
            if contract.template.contract_type != ContractType::Device
                || !kind.belongs_to(ContractType::Device)
            {
                return Err(KernelError::Rejected(format!(
                    "event kind {kind} is not a device event for contract {ctid}"
                )));
            }
            contract.emit(
                ctid,
                kind,
                EventPayload::Device {
                    path: path.to_string(),
                },
            );
            Ok(())
        })
    }

    /// Creates a contract held by another process, with `members` running
    /// processes. It is not visible through `latest`.
    pub fn insert_foreign_contract(&self, template: Template, members: usize) -> Ctid {
        let mut state = self.state.lock();
        let ctid = state.allocate(template, Holder::Foreign, false);
        for _ in 0..members {
            let pid = state.next_pid;
            state.next_pid += 1;
            state.enroll(pid, Some(ctid));
        }
        self.changed.notify_all();
        ctid
    }

    /// Makes every subsequent `read_event` fail with `reason`; `None` heals.
    pub fn fail_reads(&self, reason: Option<&str>) {
        let mut state = self.state.lock();
        state.read_fault = reason.map(str::to_string);
        self.changed.notify_all();
    }

    /// Returns current members of `ctid`.
    pub fn members(&self, ctid: Ctid) -> Vec<Pid> {
        let state = self.state.lock();
        state
            .contracts
            .get(&ctid)
            .map(|contract| contract.members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Returns the contract `pid` belongs to.
    pub fn process_contract(&self, pid: Pid) -> Option<Ctid> {
        self.state.lock().processes.get(&pid).copied().flatten()
    }

    pub fn active_contract(&self) -> Option<Ctid> {
        self.state.lock().active
    }

    pub fn scoped_template(&self) -> Option<Template> {
        self.state.lock().template.clone()
    }

    pub fn contract_exists(&self, ctid: Ctid) -> bool {
        self.state.lock().contracts.contains_key(&ctid)
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut SimState) -> KernelResult<T>) -> KernelResult<T> {
        let mut state = self.state.lock();
        let result = f(&mut state);
        self.changed.notify_all();
        result
    }
}

impl ContractKernel for SimKernel {
    fn create(&self, template: &Template) -> KernelResult<Ctid> {
        let ctid = self.mutate(|state| Ok(state.allocate(template.clone(), Holder::Creator, true)))?;
        debug!("event=sim_create module=sim status=ok ctid={}", ctid);
        Ok(ctid)
    }

    fn open(&self, ctid: Ctid, access: Access) -> KernelResult<()> {
        self.mutate(|state| {
            let contract = state.contract_mut(ctid)?;
            if access == Access::Observe {
                return Ok(());
            }
            match contract.holder {
                Holder::Creator | Holder::Adopter => Ok(()),
                Holder::Orphaned => {
                    contract.holder = Holder::Adopter;
                    Ok(())
                }
                Holder::Foreign => Err(KernelError::PermissionDenied(ctid)),
                Holder::Released => Err(KernelError::Rejected(format!(
                    "contract {ctid} is dead"
                ))),
            }
        })
    }

    fn latest(&self, timeout: Duration) -> KernelResult<Option<Ctid>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(ctid) = state.latest {
                return Ok(Some(ctid));
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return Ok(state.latest);
            }
        }
    }

    fn set_template(&self, template: &Template) -> KernelResult<()> {
        self.mutate(|state| {
            if state.template.is_some() {
                return Err(KernelError::Busy("a template is already set".to_string()));
            }
            state.template = Some(template.clone());
            Ok(())
        })
    }

    fn clear_template(&self) -> KernelResult<()> {
        self.mutate(|state| {
            state.template = None;
            Ok(())
        })
    }

    fn activate(&self, ctid: Ctid) -> KernelResult<()> {
        self.mutate(|state| {
            state.controlled_mut(ctid)?;
            match state.active {
                Some(current) if current != ctid => Err(KernelError::Busy(format!(
                    "contract {current} is already active"
                ))),
                _ => {
                    state.active = Some(ctid);
                    Ok(())
                }
            }
        })
    }

    fn deactivate(&self, ctid: Ctid) -> KernelResult<()> {
        self.mutate(|state| {
            if state.active != Some(ctid) {
                return Err(KernelError::Rejected(format!(
                    "contract {ctid} is not active"
                )));
            }
            state.active = None;
            Ok(())
        })
    }

    fn read_event(
        &self,
        ctid: Ctid,
        after: Evid,
        timeout: Duration,
    ) -> KernelResult<Option<Event>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(reason) = &state.read_fault {
                return Err(KernelError::Rejected(reason.clone()));
            }
            let contract = state.contract(ctid)?;
            if let Some(entry) = contract
                .log
                .iter()
                .find(|entry| entry.event.evid > after && entry.is_readable())
            {
                return Ok(Some(entry.event.clone()));
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return Ok(None);
            }
        }
    }

    fn event_class(&self, ctid: Ctid, evid: Evid) -> KernelResult<Option<EventClass>> {
        let state = self.state.lock();
        let contract = state.contract(ctid)?;
        Ok(contract
            .log
            .iter()
            .find(|entry| entry.event.evid == evid)
            .map(|entry| entry.event.class))
    }

    fn ack(&self, ctid: Ctid, evid: Evid) -> KernelResult<()> {
        self.mutate(|state| {
            let contract = state.controlled_mut(ctid)?;
            let entry = find_entry(contract, ctid, evid)?;
            match entry.disposition {
                Disposition::Informative => return Ok(()),
                Disposition::Pending | Disposition::Quiesced => {
                    entry.disposition = Disposition::Acked
                }
                Disposition::Acked | Disposition::Nacked => {
                    return Err(not_outstanding(ctid, evid))
                }
            }
            for entry in &mut contract.log {
                if entry.event.evid < evid && entry.disposition == Disposition::Quiesced {
                    entry.disposition = Disposition::Acked;
                }
            }
            Ok(())
        })
    }

    fn nack(&self, ctid: Ctid, evid: Evid) -> KernelResult<()> {
        self.mutate(|state| {
            let contract = state.controlled_mut(ctid)?;
            let entry = find_entry(contract, ctid, evid)?;
            match entry.disposition {
                Disposition::Informative => Ok(()),
                Disposition::Pending => {
                    entry.disposition = Disposition::Nacked;
                    Ok(())
                }
                _ => Err(not_outstanding(ctid, evid)),
            }
        })
    }

    fn qack(&self, ctid: Ctid, evid: Evid) -> KernelResult<()> {
        self.mutate(|state| {
            let contract = state.controlled_mut(ctid)?;
            let entry = find_entry(contract, ctid, evid)?;
            match entry.disposition {
                Disposition::Informative => Ok(()),
                Disposition::Pending => {
                    entry.disposition = Disposition::Quiesced;
                    Ok(())
                }
                _ => Err(not_outstanding(ctid, evid)),
            }
        })
    }

    fn status(&self, ctid: Ctid) -> KernelResult<KernelStatus> {
        let state = self.state.lock();
        let contract = state.contract(ctid)?;
        Ok(KernelStatus {
            ctid,
            state: contract.holder.state(),
            template: contract.template.clone(),
            members: contract.members.iter().copied().collect(),
            outstanding: contract.count(Disposition::Pending),
            quiesced: contract.count(Disposition::Quiesced),
            last_evid: contract.next_evid - 1,
        })
    }

    fn signal(&self, ctid: Ctid, signal: i32) -> KernelResult<()> {
        self.mutate(|state| {
            let contract = state.controlled_mut(ctid)?;
            if signal == 0 {
                return Ok(());
            }
            let members: Vec<Pid> = contract.members.iter().copied().collect();
            for pid in members {
                state.terminate(pid, signal)?;
            }
            Ok(())
        })
    }

    fn abandon(&self, ctid: Ctid) -> KernelResult<()> {
        self.mutate(|state| {
            state.controlled_mut(ctid)?;
            if state.active == Some(ctid) {
                state.active = None;
            }
            let contract = state.controlled_mut(ctid)?;
            contract.release_holds();

            if contract.members.is_empty() {
                state.contracts.remove(&ctid);
                info!(
                    "event=sim_abandon module=sim status=ok ctid={} outcome=destroyed",
                    ctid
                );
                return Ok(());
            }

            if contract.template.has_param(TemplateParam::NoOrphan) {
                let members: Vec<Pid> = contract.members.iter().copied().collect();
                state.contracts.remove(&ctid);
                for pid in &members {
                    state.processes.remove(pid);
                }
                info!(
                    "event=sim_abandon module=sim status=ok ctid={} outcome=members_killed count={}",
                    ctid,
                    members.len()
                );
                return Ok(());
            }

            let outcome = if contract.template.has_param(TemplateParam::Inherit) {
                contract.holder = Holder::Orphaned;
                "orphaned"
            } else {
                contract.holder = Holder::Released;
                "dead"
            };
            info!(
                "event=sim_abandon module=sim status=ok ctid={} outcome={}",
                ctid, outcome
            );
            Ok(())
        })
    }
}

impl ProcessLauncher for SimKernel {
    fn spawn(&self, request: &LaunchRequest) -> Result<Pid, LaunchError> {
        if request.program.trim().is_empty() {
            return Err(LaunchError::EmptyProgram);
        }

        let mut state = self.state.lock();
        let pid = state.next_pid;
        state.next_pid += 1;
        let ctid = match state.template.clone() {
            Some(template) => Some(state.allocate(template, Holder::Creator, true)),
            None => state.active,
        };
        state.enroll(pid, ctid);
        self.changed.notify_all();
        debug!(
            "event=sim_spawn module=sim status=ok pid={} ctid={} program={}",
            pid,
            ctid.unwrap_or_default(),
            request.program
        );
        Ok(pid)
    }
}

fn find_entry(contract: &mut SimContract, ctid: Ctid, evid: Evid) -> KernelResult<&mut LoggedEvent> {
    contract
        .log
        .iter_mut()
        .find(|entry| entry.event.evid == evid)
        .ok_or_else(|| KernelError::Rejected(format!("no event {evid} on contract {ctid}")))
}

fn not_outstanding(ctid: Ctid, evid: Evid) -> KernelError {
    KernelError::Rejected(format!("event {evid} on contract {ctid} is not outstanding"))
}

#[cfg(test)]
mod tests {
    use super::SimKernel;
    use crate::kernel::{Access, ContractKernel, KernelError, LaunchRequest, ProcessLauncher};
    use crate::model::event::{EventClass, EventKind, EventPayload};
    use crate::model::status::ContractState;
    use crate::model::template::{ContractType, Template, TemplateParam};
    use std::time::Duration;

    const NO_WAIT: Duration = Duration::from_millis(0);

    fn exit_template() -> Template {
        Template::new(ContractType::Process)
            .with_critical(EventKind::ProcessEmpty)
            .with_informative(EventKind::ProcessExit)
            .with_cookie(7)
    }

    fn scoped_spawn(kernel: &SimKernel, template: &Template) -> (u64, u32) {
        kernel.set_template(template).expect("set template");
        let pid = kernel
            .spawn(&LaunchRequest::new("/usr/bin/false"))
            .expect("spawn");
        kernel.clear_template().expect("clear template");
        let ctid = kernel.process_contract(pid).expect("child enrolled");
        (ctid, pid)
    }

    #[test]
    fn scoped_spawn_enrolls_child_into_fresh_contract() {
        let kernel = SimKernel::new();
        let (ctid, pid) = scoped_spawn(&kernel, &exit_template());
        assert_eq!(kernel.members(ctid), vec![pid]);
        assert_eq!(kernel.latest(NO_WAIT).expect("latest"), Some(ctid));
    }

    #[test]
    fn exit_generates_informative_exit_then_critical_empty() {
        let kernel = SimKernel::new();
        let (ctid, pid) = scoped_spawn(&kernel, &exit_template());
        kernel.exit(pid, 1).expect("exit");

        let first = kernel
            .read_event(ctid, 0, NO_WAIT)
            .expect("read")
            .expect("exit event");
        assert_eq!(first.kind, EventKind::ProcessExit);
        assert_eq!(first.class, EventClass::Informative);
        assert_eq!(first.payload, EventPayload::Exit { pid, status: 1 });
        assert_eq!(first.cookie, 7);

        let second = kernel
            .read_event(ctid, first.evid, NO_WAIT)
            .expect("read")
            .expect("empty event");
        assert_eq!(second.kind, EventKind::ProcessEmpty);
        assert!(second.evid > first.evid);

        let status = kernel.status(ctid).expect("status");
        assert_eq!(status.outstanding, 1);
        kernel.ack(ctid, second.evid).expect("ack");
        assert_eq!(kernel.status(ctid).expect("status").outstanding, 0);
    }

    #[test]
    fn event_class_reports_posted_events_only() {
        let kernel = SimKernel::new();
        let (ctid, pid) = scoped_spawn(&kernel, &exit_template());
        kernel.exit(pid, 0).expect("exit");
        kernel.ack(ctid, 2).expect("ack empty");

        assert_eq!(
            kernel.event_class(ctid, 1).expect("class"),
            Some(EventClass::Informative)
        );
        assert_eq!(
            kernel.event_class(ctid, 2).expect("class"),
            Some(EventClass::Critical)
        );
        assert_eq!(kernel.event_class(ctid, 3).expect("class"), None);
    }

    #[test]
    fn read_times_out_without_events() {
        let kernel = SimKernel::new();
        let ctid = kernel.create(&exit_template()).expect("create");
        let event = kernel
            .read_event(ctid, 0, Duration::from_millis(10))
            .expect("read");
        assert!(event.is_none());
    }

    #[test]
    fn responses_require_outstanding_critical_event() {
        let kernel = SimKernel::new();
        let (ctid, pid) = scoped_spawn(&kernel, &exit_template());
        kernel.exit(pid, 0).expect("exit");

        kernel.ack(ctid, 1).expect("informative ack is a no-op");
        kernel.nack(ctid, 2).expect("nack critical");
        let err = kernel.ack(ctid, 2).expect_err("second response must fail");
        assert!(matches!(err, KernelError::Rejected(_)));
        let err = kernel.qack(ctid, 99).expect_err("unknown evid must fail");
        assert!(matches!(err, KernelError::Rejected(_)));
    }

    #[test]
    fn ack_releases_lower_quiesced_events() {
        let kernel = SimKernel::new();
        let template = Template::new(ContractType::Process)
            .with_critical(EventKind::ProcessFork)
            .with_critical(EventKind::ProcessEmpty);
        let (ctid, pid) = scoped_spawn(&kernel, &template);
        let child = kernel.fork(pid).expect("fork");
        kernel.exit(child, 0).expect("child exit");
        kernel.exit(pid, 0).expect("parent exit");

        kernel.qack(ctid, 1).expect("qack fork");
        let status = kernel.status(ctid).expect("status");
        assert_eq!(status.quiesced, 1);
        assert_eq!(status.outstanding, 1);

        kernel.ack(ctid, 2).expect("ack empty");
        let status = kernel.status(ctid).expect("status");
        assert_eq!(status.quiesced, 0);
        assert_eq!(status.outstanding, 0);
    }

    #[test]
    fn foreign_contracts_deny_control_but_allow_observe() {
        let kernel = SimKernel::new();
        let ctid = kernel.insert_foreign_contract(exit_template(), 2);
        assert_eq!(
            kernel.open(ctid, Access::Control),
            Err(KernelError::PermissionDenied(ctid))
        );
        kernel.open(ctid, Access::Observe).expect("observe");
        assert_eq!(kernel.members(ctid).len(), 2);
        assert_eq!(kernel.latest(NO_WAIT).expect("latest"), None);
    }

    #[test]
    fn abandon_with_inherit_orphans_and_allows_adoption() {
        let kernel = SimKernel::new();
        let template = exit_template().with_param(TemplateParam::Inherit);
        let (ctid, _pid) = scoped_spawn(&kernel, &template);
        kernel.abandon(ctid).expect("abandon");
        assert_eq!(
            kernel.status(ctid).expect("status").state,
            ContractState::Orphan
        );
        kernel.open(ctid, Access::Control).expect("adopt orphan");
        assert_eq!(
            kernel.status(ctid).expect("status").state,
            ContractState::Inherited
        );
    }

    #[test]
    fn abandon_with_noorphan_kills_members_and_destroys() {
        let kernel = SimKernel::new();
        let template = exit_template().with_param(TemplateParam::NoOrphan);
        let (ctid, pid) = scoped_spawn(&kernel, &template);
        kernel.abandon(ctid).expect("abandon");
        assert!(!kernel.contract_exists(ctid));
        assert_eq!(kernel.process_contract(pid), None);
    }

    #[test]
    fn signal_terminates_every_member() {
        let kernel = SimKernel::new();
        let template = exit_template().with_informative(EventKind::ProcessSignal);
        let (ctid, pid) = scoped_spawn(&kernel, &template);
        kernel.fork(pid).expect("fork");
        kernel.signal(ctid, 15).expect("signal");
        assert!(kernel.members(ctid).is_empty());
        let status = kernel.status(ctid).expect("status");
        assert_eq!(status.outstanding, 1);
    }

    #[test]
    fn spawn_joins_active_contract_when_no_scope() {
        let kernel = SimKernel::new();
        let ctid = kernel.create(&exit_template()).expect("create");
        kernel.activate(ctid).expect("activate");
        let pid = kernel
            .spawn(&LaunchRequest::new("/bin/sleep").arg("10"))
            .expect("spawn");
        assert_eq!(kernel.process_contract(pid), Some(ctid));
        kernel.deactivate(ctid).expect("deactivate");
        assert!(kernel.active_contract().is_none());
    }

    #[test]
    fn read_fault_surfaces_as_rejection() {
        let kernel = SimKernel::new();
        let ctid = kernel.create(&exit_template()).expect("create");
        kernel.fail_reads(Some("event endpoint closed"));
        let err = kernel
            .read_event(ctid, 0, NO_WAIT)
            .expect_err("faulted read must fail");
        assert_eq!(err, KernelError::Rejected("event endpoint closed".to_string()));
    }
}
