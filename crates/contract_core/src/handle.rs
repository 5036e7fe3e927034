//! Contract handle.
//!
//! # Responsibility
//! - Own one binding to a facility contract from bind until abandon.
//! - Gate acknowledgment, signalling and activation on access level and
//!   lifecycle phase.
//! - Host the lazily started event dispatcher and its subscriptions.
//!
//! # Invariants
//! - `is_active()` implies `id() != 0`.
//! - Abandon releases the binding exactly once; afterwards `id() == 0`.
//! - Mutating facility calls run under the handle lock, so an abandon that
//!   wins the lock is observed by every later call.

use crate::config::ContractConfig;
use crate::dispatch::{
    closed_subscription, spawn_consumer, spawn_dispatcher, CloseReason, Delivery, DispatchTarget,
    ListenerId, ListenerSet, Subscription, Target,
};
use crate::error::{ContractError, ContractResult};
use crate::kernel::{Access, ContractKernel, KernelResult};
use crate::model::event::{Ctid, Event, EventClass, EventKind, Evid, UNBOUND_CTID};
use crate::model::status::StatusSnapshot;
use crate::protocol::ack::{AckKind, AckLedger, Disposition};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How a handle came to be bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOrigin {
    /// Allocated by `ContractManager::create`.
    Created,
    /// Bound with control access by `ContractManager::adopt`.
    Adopted,
    /// Bound read-only by `ContractManager::observe`.
    Observed,
    /// Bound to the newest contract by `ContractManager::latest`.
    Latest,
}

impl HandleOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Adopted => "adopted",
            Self::Observed => "observed",
            Self::Latest => "latest",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Bound,
    Abandoned,
}

#[derive(Debug)]
struct HandleState {
    phase: Phase,
    ctid: Ctid,
    active: bool,
    ever_activated: bool,
    ledger: AckLedger,
    listeners: ListenerSet,
    dispatching: bool,
    dispatch_failure: Option<String>,
}

impl HandleState {
    fn bound_ctid(&self) -> ContractResult<Ctid> {
        match self.phase {
            Phase::Bound => Ok(self.ctid),
            Phase::Abandoned => Err(ContractError::HandleAbandoned),
        }
    }
}

pub(crate) struct HandleShared {
    kernel: Arc<dyn ContractKernel>,
    bound_ctid: Ctid,
    access: Access,
    origin: HandleOrigin,
    config: ContractConfig,
    stop: Arc<AtomicBool>,
    state: Mutex<HandleState>,
}

impl HandleShared {
    pub(crate) fn bound_ctid(&self) -> Ctid {
        self.bound_ctid
    }

    pub(crate) fn is_abandoned(&self) -> bool {
        self.state.lock().phase == Phase::Abandoned
    }
}

impl Drop for HandleShared {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

impl DispatchTarget for HandleShared {
    fn accept(&self, event: &Event) -> Option<Vec<Target>> {
        let mut state = self.state.lock();
        if state.phase == Phase::Abandoned || event.ctid != state.ctid {
            return None;
        }
        if !state.ledger.record(event) {
            debug!(
                "event=handle_accept module=handle status=skipped ctid={} evid={}",
                event.ctid, event.evid
            );
            return Some(Vec::new());
        }
        Some(state.listeners.targets(event.kind))
    }

    fn forget(&self, ids: &[ListenerId]) {
        self.state.lock().listeners.forget(ids);
    }

    fn fail(&self, reason: String) -> bool {
        let mut state = self.state.lock();
        if state.phase == Phase::Abandoned {
            return false;
        }
        state
            .listeners
            .close_all(Some(CloseReason::Failed(reason.clone())));
        state.dispatch_failure = Some(reason);
        true
    }
}

/// Binding to one facility contract.
///
/// Clones share the same binding, listeners and lifecycle.
#[derive(Clone)]
pub struct ContractHandle {
    shared: Arc<HandleShared>,
}

impl std::fmt::Debug for ContractHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContractHandle")
            .field("id", &self.id())
            .field("access", &self.shared.access)
            .field("origin", &self.shared.origin)
            .finish()
    }
}

impl ContractHandle {
    pub(crate) fn bind(
        kernel: Arc<dyn ContractKernel>,
        ctid: Ctid,
        access: Access,
        origin: HandleOrigin,
        config: ContractConfig,
    ) -> Self {
        let ledger = AckLedger::new(config.ack_history_limit);
        Self {
            shared: Arc::new(HandleShared {
                kernel,
                bound_ctid: ctid,
                access,
                origin,
                config,
                stop: Arc::new(AtomicBool::new(false)),
                state: Mutex::new(HandleState {
                    phase: Phase::Bound,
                    ctid,
                    active: false,
                    ever_activated: false,
                    ledger,
                    listeners: ListenerSet::default(),
                    dispatching: false,
                    dispatch_failure: None,
                }),
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<HandleShared> {
        &self.shared
    }

    pub(crate) fn from_shared(shared: Arc<HandleShared>) -> Self {
        Self { shared }
    }

    /// Current contract id; `0` once abandoned.
    pub fn id(&self) -> Ctid {
        self.shared.state.lock().ctid
    }

    pub fn access(&self) -> Access {
        self.shared.access
    }

    pub fn origin(&self) -> HandleOrigin {
        self.shared.origin
    }

    pub fn is_active(&self) -> bool {
        self.shared.state.lock().active
    }

    pub fn is_abandoned(&self) -> bool {
        self.shared.is_abandoned()
    }

    /// Outstanding critical evids delivered to this handle, ascending.
    pub fn pending_events(&self) -> Vec<Evid> {
        self.shared.state.lock().ledger.outstanding()
    }

    /// Reads a fresh status snapshot from the facility.
    pub fn status(&self) -> ContractResult<StatusSnapshot> {
        let state = self.shared.state.lock();
        let ctid = state.bound_ctid()?;
        let status = self
            .shared
            .kernel
            .status(ctid)
            .map_err(|err| ContractError::kernel("status", err))?;
        Ok(StatusSnapshot {
            ctid,
            contract_type: status.template.contract_type,
            state: status.state,
            members: status.members,
            critical: status.template.critical,
            informative: status.template.informative,
            params: status.template.params,
            cookie: status.template.cookie,
            outstanding: status.outstanding,
            quiesced: status.quiesced,
            last_evid: status.last_evid,
            active: state.active,
        })
    }

    /// Makes this contract the one new children are enrolled into.
    pub fn activate(&self) -> ContractResult<()> {
        let mut state = self.shared.state.lock();
        if state.phase == Phase::Abandoned || state.ctid == UNBOUND_CTID {
            return Err(ContractError::InvalidState("handle is not bound to a contract"));
        }
        if state.active {
            return Err(ContractError::InvalidState("contract is already active"));
        }
        let ctid = state.ctid;
        self.require_control(ctid)?;
        let result = self.shared.kernel.activate(ctid);
        self.finish("activate", ctid, result)?;
        state.active = true;
        state.ever_activated = true;
        Ok(())
    }

    pub fn deactivate(&self) -> ContractResult<()> {
        let mut state = self.shared.state.lock();
        if state.phase == Phase::Abandoned || state.ctid == UNBOUND_CTID {
            return Err(ContractError::InvalidState("handle is not bound to a contract"));
        }
        if !state.active {
            return Err(ContractError::InvalidState("contract is not active"));
        }
        let ctid = state.ctid;
        let result = self.shared.kernel.deactivate(ctid);
        self.finish("deactivate", ctid, result)?;
        state.active = false;
        Ok(())
    }

    /// Releases the facility binding and closes every subscription.
    ///
    /// On facility rejection the handle stays bound.
    pub fn abandon(&self) -> ContractResult<()> {
        let mut state = self.shared.state.lock();
        if state.phase == Phase::Abandoned {
            return Err(ContractError::AlreadyAbandoned);
        }
        let ctid = state.ctid;
        self.require_control(ctid)?;
        let result = self.shared.kernel.abandon(ctid);
        self.finish("abandon", ctid, result)?;

        state.phase = Phase::Abandoned;
        state.ctid = UNBOUND_CTID;
        state.active = false;
        state.ledger.clear();
        self.shared.stop.store(true, Ordering::Release);
        let closed = state.listeners.len();
        state.listeners.close_all(Some(CloseReason::Abandoned));
        info!(
            "event=handle_release module=handle status=ok ctid={} listeners_closed={}",
            ctid, closed
        );
        Ok(())
    }

    /// Accepts a delivered event.
    pub fn ack(&self, evid: Evid) -> ContractResult<()> {
        self.respond(AckKind::Ack, evid)
    }

    /// Negatively acknowledges a delivered event.
    pub fn nack(&self, evid: Evid) -> ContractResult<()> {
        self.respond(AckKind::Nack, evid)
    }

    /// Acknowledges a delivered event and keeps the facility holding the
    /// contract quiesced.
    pub fn qack(&self, evid: Evid) -> ContractResult<()> {
        self.respond(AckKind::Qack, evid)
    }

    /// Delivers `signal` to every member process.
    pub fn send_signal(&self, signal: i32) -> ContractResult<()> {
        let state = self.shared.state.lock();
        let ctid = state.bound_ctid()?;
        self.require_control(ctid)?;
        if self.shared.origin == HandleOrigin::Created && !state.ever_activated {
            return Err(ContractError::InvalidState("contract was never activated"));
        }
        let status = self
            .shared
            .kernel
            .status(ctid)
            .map_err(|err| ContractError::kernel("send_signal", err))?;
        if status.members.is_empty() {
            return Err(ContractError::EmptyContract(ctid));
        }
        let result = self.shared.kernel.signal(ctid, signal);
        self.finish("send_signal", ctid, result)?;
        info!(
            "event=contract_signal module=handle status=ok ctid={} signal={} members={}",
            ctid,
            signal,
            status.members.len()
        );
        Ok(())
    }

    /// Registers a subscription for one event kind.
    pub fn subscribe(&self, kind: EventKind) -> ContractResult<Subscription> {
        self.add_subscription(Some(kind))
    }

    /// Registers a subscription for every event kind.
    pub fn subscribe_all(&self) -> ContractResult<Subscription> {
        self.add_subscription(None)
    }

    /// Runs `callback` on its own thread for each `kind` delivery, then once
    /// with the terminal delivery.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> ContractResult<ListenerId>
    where
        F: FnMut(Delivery) + Send + 'static,
    {
        self.add_consumer(Some(kind), callback)
    }

    /// Like [`ContractHandle::on`] for every event kind.
    pub fn on_any<F>(&self, callback: F) -> ContractResult<ListenerId>
    where
        F: FnMut(Delivery) + Send + 'static,
    {
        self.add_consumer(None, callback)
    }

    /// Drops one subscription; returns whether it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut state = self.shared.state.lock();
        let before = state.listeners.len();
        state.listeners.forget(&[id]);
        state.listeners.len() < before
    }

    /// Drops every subscription; consumer threads end after draining.
    pub fn remove_all_listeners(&self) -> usize {
        let mut state = self.shared.state.lock();
        let removed = state.listeners.len();
        state.listeners.close_all(None);
        removed
    }

    fn add_consumer<F>(&self, filter: Option<EventKind>, callback: F) -> ContractResult<ListenerId>
    where
        F: FnMut(Delivery) + Send + 'static,
    {
        let subscription = self.add_subscription(filter)?;
        let id = subscription.id();
        let ctid = self.shared.bound_ctid;
        if let Err(err) = spawn_consumer(subscription, callback, ctid) {
            error!(
                "event=listener_start module=handle status=error ctid={} error={}",
                ctid, err
            );
            self.remove_listener(id);
            return Err(ContractError::InvalidState("listener thread could not start"));
        }
        Ok(id)
    }

    fn add_subscription(&self, filter: Option<EventKind>) -> ContractResult<Subscription> {
        let mut state = self.shared.state.lock();
        let ctid = state.bound_ctid()?;
        if let Some(reason) = &state.dispatch_failure {
            return Ok(closed_subscription(
                filter,
                CloseReason::Failed(reason.clone()),
            ));
        }

        let subscription = state
            .listeners
            .subscribe(filter, self.shared.config.event_channel_capacity);
        if !state.dispatching {
            if let Err(err) = spawn_dispatcher(
                Arc::downgrade(&self.shared),
                self.shared.kernel.clone(),
                ctid,
                self.shared.stop.clone(),
                self.shared.config.dispatch_poll_interval(),
            ) {
                error!(
                    "event=dispatch_start module=handle status=error ctid={} error={}",
                    ctid, err
                );
                state.listeners.forget(&[subscription.id()]);
                return Err(ContractError::InvalidState("event dispatcher could not start"));
            }
            state.dispatching = true;
        }
        debug!(
            "event=listener_add module=handle status=ok ctid={} listener_id={} kind={}",
            ctid,
            subscription.id(),
            filter.map_or("*", EventKind::as_str)
        );
        Ok(subscription)
    }

    fn respond(&self, kind: AckKind, evid: Evid) -> ContractResult<()> {
        let mut state = self.shared.state.lock();
        let ctid = state.bound_ctid()?;
        self.require_control(ctid)?;

        match state.ledger.disposition(evid) {
            None if state.ledger.covers(evid) => self.respond_evicted(kind, ctid, evid),
            None => Err(ContractError::UnknownEvent { ctid, evid }),
            Some(Disposition::Informative) => {
                debug!(
                    "event=contract_{} module=handle status=ok ctid={} evid={} class=informative",
                    kind, ctid, evid
                );
                Ok(())
            }
            Some(Disposition::Outstanding(event_kind)) => {
                let result = match kind {
                    AckKind::Ack => self.shared.kernel.ack(ctid, evid),
                    AckKind::Nack => self.shared.kernel.nack(ctid, evid),
                    AckKind::Qack => self.shared.kernel.qack(ctid, evid),
                };
                self.finish(kind.as_str(), ctid, result)?;
                state.ledger.retire(evid);
                info!(
                    "event=contract_{} module=handle status=ok ctid={} evid={} kind={}",
                    kind, ctid, evid, event_kind
                );
                Ok(())
            }
        }
    }

    /// Delivered evid the ledger no longer holds: informative ones aged out
    /// of its history, critical ones were already answered.
    fn respond_evicted(&self, kind: AckKind, ctid: Ctid, evid: Evid) -> ContractResult<()> {
        let class = match self.shared.kernel.event_class(ctid, evid) {
            Ok(class) => class,
            Err(err) => return self.finish(kind.as_str(), ctid, Err(err)),
        };
        match class {
            Some(EventClass::Informative) => {
                debug!(
                    "event=contract_{} module=handle status=ok ctid={} evid={} class=informative source=facility",
                    kind, ctid, evid
                );
                Ok(())
            }
            Some(EventClass::Critical) | None => Err(ContractError::UnknownEvent { ctid, evid }),
        }
    }

    fn require_control(&self, ctid: Ctid) -> ContractResult<()> {
        match self.shared.access {
            Access::Control => Ok(()),
            Access::Observe => Err(ContractError::NotOwner(ctid)),
        }
    }

    /// Logs a facility result and maps its error.
    fn finish(&self, operation: &'static str, ctid: Ctid, result: KernelResult<()>) -> ContractResult<()> {
        match result {
            Ok(()) => {
                debug!(
                    "event=contract_{} module=handle status=ok ctid={}",
                    operation, ctid
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    "event=contract_{} module=handle status=error ctid={} error={}",
                    operation, ctid, err
                );
                Err(ContractError::kernel(operation, err))
            }
        }
    }
}
