use contract_core::{
    Access, ContractConfig, ContractError, ContractManager, ContractState, ContractType, Delivery,
    Event, EventKind, EventPayload, HandleOrigin, LaunchRequest, ProcessLauncher, SimKernel,
    Subscription, Template, TemplateParam,
};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

fn setup() -> (Arc<SimKernel>, ContractManager) {
    let kernel = Arc::new(SimKernel::new());
    let config = ContractConfig {
        latest_timeout_ms: 50,
        dispatch_poll_interval_ms: 5,
        ..ContractConfig::default()
    };
    let manager = ContractManager::with_config(kernel.clone(), config);
    (kernel, manager)
}

fn exit_template() -> Template {
    Template::new(ContractType::Process)
        .with_critical(EventKind::ProcessEmpty)
        .with_informative(EventKind::ProcessExit)
}

fn scoped_spawn(kernel: &SimKernel, manager: &ContractManager, template: Template) -> u32 {
    let scope = manager.set_template(template).expect("set template");
    let pid = scope
        .launch(kernel, &LaunchRequest::new("/usr/bin/true"))
        .expect("spawn inside scope");
    scope.clear().expect("clear template");
    pid
}

fn next_event(subscription: &Subscription) -> Event {
    match subscription.recv_timeout(WAIT) {
        Some(Delivery::Event(event)) => event,
        other => panic!("expected an event, got {other:?}"),
    }
}

#[test]
fn scoped_spawn_exit_streams_exit_then_empty_and_ack_settles_contract() {
    let (kernel, manager) = setup();
    let pid = scoped_spawn(&kernel, &manager, exit_template());

    let handle = manager.latest().expect("latest contract");
    assert_eq!(handle.origin(), HandleOrigin::Latest);
    let events = handle.subscribe_all().expect("subscribe");
    kernel.exit(pid, 3).expect("member exits");

    let exit = next_event(&events);
    assert_eq!(exit.kind, EventKind::ProcessExit);
    assert_eq!(exit.payload, EventPayload::Exit { pid, status: 3 });
    let empty = next_event(&events);
    assert_eq!(empty.kind, EventKind::ProcessEmpty);
    assert!(empty.evid > exit.evid);

    handle.ack(empty.evid).expect("ack empty");
    let status = handle.status().expect("status");
    assert!(status.is_empty());
    assert!(status.is_fully_acknowledged());
    assert!(handle.pending_events().is_empty());
}

#[test]
fn created_contract_must_be_activated_before_signalling() {
    let (kernel, manager) = setup();
    let handle = manager.create().expect("create");
    assert!(!handle.is_active());
    assert_eq!(
        handle.send_signal(15),
        Err(ContractError::InvalidState("contract was never activated"))
    );

    handle.activate().expect("activate");
    assert_eq!(
        handle.send_signal(15),
        Err(ContractError::EmptyContract(handle.id()))
    );

    let pid = kernel
        .spawn(&LaunchRequest::new("/bin/sleep").arg("60"))
        .expect("spawn into active contract");
    assert_eq!(kernel.process_contract(pid), Some(handle.id()));
    handle.send_signal(15).expect("signal members");
    assert!(handle.status().expect("status").is_empty());
}

#[test]
fn consecutive_scoped_spawns_yield_distinct_contracts() {
    let (kernel, manager) = setup();

    scoped_spawn(&kernel, &manager, exit_template());
    let first = manager.latest().expect("first latest");
    scoped_spawn(&kernel, &manager, exit_template().with_cookie(2));
    let second = manager.latest().expect("second latest");

    assert_ne!(first.id(), 0);
    assert_ne!(second.id(), 0);
    assert_ne!(first.id(), second.id());
    assert_eq!(second.status().expect("status").cookie, 2);
}

#[test]
fn repeated_status_without_events_is_identical() {
    let (kernel, manager) = setup();
    scoped_spawn(&kernel, &manager, exit_template());
    let handle = manager.latest().expect("latest");

    let first = handle.status().expect("first status");
    let second = handle.status().expect("second status");
    assert_eq!(first, second);
    assert_eq!(first.state, ContractState::Owned);
    assert_eq!(first.members.len(), 1);
}

#[test]
fn inheritable_contract_is_adopted_after_abandon() {
    let (kernel, manager) = setup();
    scoped_spawn(
        &kernel,
        &manager,
        exit_template().with_param(TemplateParam::Inherit),
    );
    let holder = manager.latest().expect("latest");
    let ctid = holder.id();
    holder.abandon().expect("abandon");

    let observer = manager.observe(ctid).expect("observe orphan");
    assert_eq!(observer.status().expect("status").state, ContractState::Orphan);

    let adopter = manager.adopt(ctid).expect("adopt orphan");
    assert_eq!(adopter.access(), Access::Control);
    assert_eq!(adopter.status().expect("status").state, ContractState::Inherited);
    assert_eq!(manager.live_contracts(), vec![ctid]);
}

#[test]
fn foreign_contract_can_be_observed_but_not_adopted() {
    let (kernel, manager) = setup();
    let ctid = kernel.insert_foreign_contract(exit_template(), 2);

    assert_eq!(
        manager.adopt(ctid).expect_err("foreign contracts refuse control"),
        ContractError::PermissionDenied(ctid)
    );
    let observer = manager.observe(ctid).expect("observe");
    assert_eq!(observer.abandon(), Err(ContractError::NotOwner(ctid)));
    assert_eq!(observer.status().expect("status").members.len(), 2);
}

#[test]
fn adopting_unknown_contract_is_rejected() {
    let (_kernel, manager) = setup();
    let err = manager.adopt(999).expect_err("unknown ctid");
    assert!(matches!(
        err,
        ContractError::KernelRejected {
            operation: "adopt",
            ..
        }
    ));
    assert!(!err.is_retryable());
}
