//! Event dispatcher.
//!
//! # Responsibility
//! - Pull events for one contract from the facility on a dedicated thread.
//! - Fan each event out, in delivery order, to bounded per-subscription
//!   queues whose filter matches.
//! - Run callback listeners as independent consumer threads.
//!
//! # Invariants
//! - One delivery loop per handle; events for one contract are never
//!   reordered or delivered concurrently.
//! - Each subscription sees strictly increasing evids.
//! - A facility read failure is reported once to every subscription as a
//!   terminal delivery, then the loop stops.
//! - A terminal delivery is never lost to a full queue and never followed
//!   by an event.

use crate::kernel::ContractKernel;
use crate::model::event::{Ctid, Event, EventKind, Evid};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use uuid::Uuid;

/// Stable id of one subscription on a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl ListenerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for ListenerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a subscription stopped receiving events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The handle was abandoned.
    Abandoned,
    /// Pulling events from the facility failed.
    Failed(String),
}

/// One item received by a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Event(Event),
    /// Terminal; nothing follows.
    Closed(CloseReason),
}

impl Delivery {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed(_))
    }

    pub fn event(&self) -> Option<&Event> {
        match self {
            Self::Event(event) => Some(event),
            Self::Closed(_) => None,
        }
    }
}

/// Close state shared by both ends of one subscription.
///
/// Events are only queued under `state` while it is open, so once closed no
/// event can follow the terminal delivery.
#[derive(Debug, Default)]
struct Gate {
    state: Mutex<GateState>,
    space: Condvar,
    reported: AtomicBool,
}

#[derive(Debug, Default)]
struct GateState {
    closed: bool,
    reason: Option<CloseReason>,
}

impl Gate {
    fn closed_with(reason: CloseReason) -> Self {
        Self {
            state: Mutex::new(GateState {
                closed: true,
                reason: Some(reason),
            }),
            ..Self::default()
        }
    }

    /// First close wins; a `None` reason ends the stream silently.
    fn close(&self, reason: Option<CloseReason>) {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            state.reason = reason;
        }
        drop(state);
        self.space.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Hands out the terminal delivery at most once.
    fn terminal(&self) -> Option<Delivery> {
        let reason = self.state.lock().reason.clone()?;
        if self.reported.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(Delivery::Closed(reason))
    }
}

/// Receiving end of one subscription.
///
/// Dropping it unsubscribes; the dispatcher forgets it on the next delivery.
/// Events queued before a close are still handed out, then the terminal
/// delivery, then nothing.
#[derive(Debug)]
pub struct Subscription {
    id: ListenerId,
    filter: Option<EventKind>,
    receiver: Receiver<Delivery>,
    gate: Arc<Gate>,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Kind this subscription is limited to, `None` for every kind.
    pub fn filter(&self) -> Option<EventKind> {
        self.filter
    }

    /// Number of events waiting to be received.
    pub fn queued(&self) -> usize {
        self.receiver.len()
    }

    /// Blocks for the next delivery; `None` once the subscription is closed
    /// and drained.
    pub fn recv(&self) -> Option<Delivery> {
        match self.receiver.recv() {
            Ok(delivery) => Some(self.received(delivery)),
            Err(_) => self.gate.terminal(),
        }
    }

    /// Waits up to `timeout` for the next delivery.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Delivery> {
        match self.receiver.recv_timeout(timeout) {
            Ok(delivery) => Some(self.received(delivery)),
            Err(RecvTimeoutError::Disconnected) => self.gate.terminal(),
            Err(RecvTimeoutError::Timeout) => self.terminal_if_drained(),
        }
    }

    pub fn try_recv(&self) -> Option<Delivery> {
        match self.receiver.try_recv() {
            Ok(delivery) => Some(self.received(delivery)),
            Err(TryRecvError::Disconnected) => self.gate.terminal(),
            Err(TryRecvError::Empty) => self.terminal_if_drained(),
        }
    }

    /// Iterates deliveries until the subscription is closed.
    pub fn iter(&self) -> impl Iterator<Item = Delivery> + '_ {
        std::iter::from_fn(move || self.recv())
    }

    fn received(&self, delivery: Delivery) -> Delivery {
        self.gate.space.notify_one();
        delivery
    }

    // A closed gate may still have a dispatcher holding a sender for a moment.
    fn terminal_if_drained(&self) -> Option<Delivery> {
        if self.gate.is_closed() && self.receiver.is_empty() {
            self.gate.terminal()
        } else {
            None
        }
    }
}

/// Sending side of a subscription, kept by the handle.
#[derive(Debug)]
pub(crate) struct Listener {
    id: ListenerId,
    filter: Option<EventKind>,
    sender: Sender<Delivery>,
    gate: Arc<Gate>,
}

impl Listener {
    fn matches(&self, kind: EventKind) -> bool {
        self.filter.map_or(true, |filter| filter == kind)
    }
}

/// Fan-out target resolved for one event.
#[derive(Debug, Clone)]
pub(crate) struct Target {
    id: ListenerId,
    sender: Sender<Delivery>,
    gate: Arc<Gate>,
}

/// Ordered listener registrations of one handle.
#[derive(Debug, Default)]
pub(crate) struct ListenerSet {
    listeners: Vec<Listener>,
}

impl ListenerSet {
    /// Registers a new subscription with a queue of `capacity`.
    pub(crate) fn subscribe(&mut self, filter: Option<EventKind>, capacity: usize) -> Subscription {
        let (sender, receiver) = bounded(capacity.max(1));
        let id = ListenerId::new();
        let gate = Arc::new(Gate::default());
        self.listeners.push(Listener {
            id,
            filter,
            sender,
            gate: gate.clone(),
        });
        Subscription {
            id,
            filter,
            receiver,
            gate,
        }
    }

    /// Returns matching targets in registration order.
    pub(crate) fn targets(&self, kind: EventKind) -> Vec<Target> {
        self.listeners
            .iter()
            .filter(|listener| listener.matches(kind))
            .map(|listener| Target {
                id: listener.id,
                sender: listener.sender.clone(),
                gate: listener.gate.clone(),
            })
            .collect()
    }

    pub(crate) fn forget(&mut self, ids: &[ListenerId]) {
        self.listeners.retain(|listener| {
            let keep = !ids.contains(&listener.id);
            if !keep {
                listener.gate.close(None);
            }
            keep
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Removes every registration; each subscription ends with `reason`
    /// after its queued events.
    pub(crate) fn close_all(&mut self, reason: Option<CloseReason>) {
        for listener in self.listeners.drain(..) {
            listener.gate.close(reason.clone());
        }
    }
}

/// Builds a subscription that is already closed with `reason`.
pub(crate) fn closed_subscription(filter: Option<EventKind>, reason: CloseReason) -> Subscription {
    let (_, receiver) = bounded(1);
    Subscription {
        id: ListenerId::new(),
        filter,
        receiver,
        gate: Arc::new(Gate::closed_with(reason)),
    }
}

/// Handle-side hooks the delivery loop drives.
pub(crate) trait DispatchTarget: Send + Sync + 'static {
    /// Records `event` and returns its fan-out targets, or `None` when the
    /// loop must stop.
    fn accept(&self, event: &Event) -> Option<Vec<Target>>;
    /// Drops subscriptions whose receivers are gone.
    fn forget(&self, ids: &[ListenerId]);
    /// Reports a terminal read failure to every subscription; returns
    /// `false` when the handle was already torn down.
    fn fail(&self, reason: String) -> bool;
}

/// Starts the delivery loop for `ctid` on its own thread.
pub(crate) fn spawn_dispatcher<T: DispatchTarget>(
    target: Weak<T>,
    kernel: Arc<dyn ContractKernel>,
    ctid: Ctid,
    stop: Arc<AtomicBool>,
    poll: Duration,
) -> std::io::Result<()> {
    thread::Builder::new()
        .name(format!("contract-{ctid}-dispatch"))
        .spawn(move || run_dispatch_loop(target, kernel, ctid, stop, poll))
        .map(|_| ())
}

fn run_dispatch_loop<T: DispatchTarget>(
    target: Weak<T>,
    kernel: Arc<dyn ContractKernel>,
    ctid: Ctid,
    stop: Arc<AtomicBool>,
    poll: Duration,
) {
    let mut cursor: Evid = 0;
    let mut delivered = 0usize;
    info!("event=dispatch_start module=dispatch status=ok ctid={}", ctid);

    while !stop.load(Ordering::Acquire) && target.strong_count() > 0 {
        let event = match kernel.read_event(ctid, cursor, poll) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(err) => {
                let reported = !stop.load(Ordering::Acquire)
                    && target
                        .upgrade()
                        .map_or(false, |strong| strong.fail(err.to_string()));
                if reported {
                    error!(
                        "event=dispatch_read module=dispatch status=error ctid={} after_evid={} error={}",
                        ctid, cursor, err
                    );
                } else {
                    debug!(
                        "event=dispatch_read module=dispatch status=stopped ctid={} error={}",
                        ctid, err
                    );
                }
                break;
            }
        };
        cursor = event.evid;

        let Some(strong) = target.upgrade() else {
            break;
        };
        let Some(targets) = strong.accept(&event) else {
            break;
        };
        drop(strong);

        let gone = deliver(&targets, &event, &stop, poll);
        delivered += 1;
        if !gone.is_empty() {
            if let Some(strong) = target.upgrade() {
                strong.forget(&gone);
            }
        }
    }

    info!(
        "event=dispatch_stop module=dispatch status=ok ctid={} delivered={} last_evid={}",
        ctid, delivered, cursor
    );
}

/// Sends `event` to every open target in order, blocking while a queue is
/// full.
///
/// Returns the ids of targets whose receiver is gone.
fn deliver(targets: &[Target], event: &Event, stop: &AtomicBool, poll: Duration) -> Vec<ListenerId> {
    let mut gone = Vec::new();
    if targets.is_empty() && event.is_critical() {
        warn!(
            "event=dispatch_deliver module=dispatch status=unhandled ctid={} evid={} kind={}",
            event.ctid, event.evid, event.kind
        );
    }

    for target in targets {
        let mut delivery = Delivery::Event(event.clone());
        let mut gate = target.gate.state.lock();
        loop {
            if gate.closed {
                break;
            }
            match target.sender.try_send(delivery) {
                Ok(()) => break,
                Err(TrySendError::Disconnected(_)) => {
                    gone.push(target.id);
                    break;
                }
                Err(TrySendError::Full(pending)) => {
                    if stop.load(Ordering::Acquire) {
                        return gone;
                    }
                    delivery = pending;
                    target.gate.space.wait_for(&mut gate, poll);
                }
            }
        }
    }
    gone
}

/// Runs `callback` for every delivery of `subscription` on its own thread.
pub(crate) fn spawn_consumer<F>(
    subscription: Subscription,
    mut callback: F,
    ctid: Ctid,
) -> std::io::Result<()>
where
    F: FnMut(Delivery) + Send + 'static,
{
    thread::Builder::new()
        .name(format!("contract-{ctid}-listener"))
        .spawn(move || {
            for delivery in subscription.iter() {
                let terminal = delivery.is_terminal();
                callback(delivery);
                if terminal {
                    break;
                }
            }
        })
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::{
        closed_subscription, deliver, spawn_dispatcher, CloseReason, Delivery, DispatchTarget,
        ListenerId, ListenerSet, Target,
    };
    use crate::kernel::sim::SimKernel;
    use crate::kernel::{ContractKernel, LaunchRequest, ProcessLauncher};
    use crate::model::event::{Event, EventClass, EventKind, EventPayload};
    use crate::model::template::{ContractType, Template};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);
    const POLL: Duration = Duration::from_millis(5);

    #[derive(Default)]
    struct RecordingTarget {
        listeners: Mutex<ListenerSet>,
        accepted: Mutex<Vec<u64>>,
    }

    impl DispatchTarget for RecordingTarget {
        fn accept(&self, event: &Event) -> Option<Vec<Target>> {
            self.accepted.lock().push(event.evid);
            Some(self.listeners.lock().targets(event.kind))
        }

        fn forget(&self, ids: &[ListenerId]) {
            self.listeners.lock().forget(ids);
        }

        fn fail(&self, reason: String) -> bool {
            self.listeners
                .lock()
                .close_all(Some(CloseReason::Failed(reason)));
            true
        }
    }

    #[test]
    fn filters_targets_by_kind_in_registration_order() {
        let mut set = ListenerSet::default();
        let all = set.subscribe(None, 4);
        let exits = set.subscribe(Some(EventKind::ProcessExit), 4);
        let empties = set.subscribe(Some(EventKind::ProcessEmpty), 4);

        let ids: Vec<_> = set
            .targets(EventKind::ProcessExit)
            .into_iter()
            .map(|target| target.id)
            .collect();
        assert_eq!(ids, vec![all.id(), exits.id()]);
        assert!(!ids.contains(&empties.id()));
    }

    #[test]
    fn closed_subscription_yields_terminal_delivery() {
        let subscription = closed_subscription(None, CloseReason::Abandoned);
        assert_eq!(
            subscription.recv(),
            Some(Delivery::Closed(CloseReason::Abandoned))
        );
        assert_eq!(subscription.recv(), None);
    }

    fn fork_event(evid: u64) -> Event {
        Event {
            ctid: 1,
            evid,
            kind: EventKind::ProcessFork,
            class: EventClass::Critical,
            cookie: 0,
            payload: EventPayload::Empty,
        }
    }

    #[test]
    fn terminal_delivery_follows_a_full_queue() {
        let mut set = ListenerSet::default();
        let subscription = set.subscribe(None, 1);
        let targets = set.targets(EventKind::ProcessFork);
        let stop = AtomicBool::new(false);
        assert!(deliver(&targets, &fork_event(1), &stop, POLL).is_empty());
        assert_eq!(subscription.queued(), 1);

        set.close_all(Some(CloseReason::Failed("endpoint lost".to_string())));
        drop(targets);

        assert_eq!(
            subscription.recv().and_then(|delivery| delivery.event().map(|event| event.evid)),
            Some(1)
        );
        assert_eq!(
            subscription.recv(),
            Some(Delivery::Closed(CloseReason::Failed("endpoint lost".to_string())))
        );
        assert_eq!(subscription.recv(), None);
    }

    #[test]
    fn targets_resolved_before_close_deliver_nothing_after_it() {
        let mut set = ListenerSet::default();
        let subscription = set.subscribe(None, 4);
        let targets = set.targets(EventKind::ProcessFork);
        set.close_all(Some(CloseReason::Abandoned));

        let stop = AtomicBool::new(false);
        assert!(deliver(&targets, &fork_event(1), &stop, POLL).is_empty());
        assert_eq!(subscription.queued(), 0);
        assert_eq!(
            subscription.recv_timeout(POLL),
            Some(Delivery::Closed(CloseReason::Abandoned))
        );
        drop(targets);
        assert_eq!(subscription.recv(), None);
    }

    #[test]
    fn forgotten_listener_ends_without_terminal_delivery() {
        let mut set = ListenerSet::default();
        let subscription = set.subscribe(None, 4);
        let targets = set.targets(EventKind::ProcessFork);
        set.forget(&[subscription.id()]);

        let stop = AtomicBool::new(false);
        deliver(&targets, &fork_event(1), &stop, POLL);
        assert_eq!(subscription.try_recv(), None);
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn loop_delivers_in_order_and_reports_read_failure() {
        let kernel = Arc::new(SimKernel::new());
        let template = Template::new(ContractType::Process)
            .with_critical(EventKind::ProcessEmpty)
            .with_informative(EventKind::ProcessExit);
        kernel.set_template(&template).expect("set template");
        let pid = kernel.spawn(&LaunchRequest::new("a.out")).expect("spawn");
        kernel.clear_template().expect("clear template");
        let ctid = kernel.process_contract(pid).expect("enrolled");

        let target = Arc::new(RecordingTarget::default());
        let subscription = target.listeners.lock().subscribe(None, 1);
        let stop = Arc::new(AtomicBool::new(false));
        spawn_dispatcher(
            Arc::downgrade(&target),
            kernel.clone(),
            ctid,
            stop,
            POLL,
        )
        .expect("dispatcher starts");

        kernel.exit(pid, 0).expect("exit");
        let first = subscription.recv_timeout(WAIT).expect("first delivery");
        let second = subscription.recv_timeout(WAIT).expect("second delivery");
        assert_eq!(first.event().map(|event| event.kind), Some(EventKind::ProcessExit));
        assert_eq!(second.event().map(|event| event.kind), Some(EventKind::ProcessEmpty));

        kernel.fail_reads(Some("endpoint lost"));
        let terminal = subscription.recv_timeout(WAIT).expect("terminal delivery");
        assert_eq!(
            terminal,
            Delivery::Closed(CloseReason::Failed(
                "facility rejected request: endpoint lost".to_string()
            ))
        );
        assert_eq!(*target.accepted.lock(), vec![1, 2]);
    }
}
