use contract_core::{
    ContractConfig, ContractError, ContractManager, ContractType, EventKind, LaunchError,
    LaunchRequest, SimKernel, Template, TemplateParam, TemplateValidationError,
};
use std::sync::Arc;

fn setup() -> (Arc<SimKernel>, ContractManager) {
    let kernel = Arc::new(SimKernel::new());
    let config = ContractConfig {
        latest_timeout_ms: 50,
        ..ContractConfig::default()
    };
    let manager = ContractManager::with_config(kernel.clone(), config);
    (kernel, manager)
}

#[derive(Debug, PartialEq)]
enum SpawnFailure {
    Contract(ContractError),
    Launch(LaunchError),
}

impl From<ContractError> for SpawnFailure {
    fn from(value: ContractError) -> Self {
        Self::Contract(value)
    }
}

impl From<LaunchError> for SpawnFailure {
    fn from(value: LaunchError) -> Self {
        Self::Launch(value)
    }
}

#[test]
fn second_scope_is_rejected_while_one_is_active() {
    let (_kernel, manager) = setup();
    let scope = manager
        .set_template(Template::process_default())
        .expect("first scope");
    assert_eq!(
        manager
            .set_template(Template::process_default())
            .expect_err("scope already active"),
        ContractError::ScopeAlreadyActive
    );
    scope.clear().expect("clear");
    manager
        .set_template(Template::process_default())
        .expect("scope can be set again after clear");
}

#[test]
fn clearing_without_scope_fails() {
    let (_kernel, manager) = setup();
    assert_eq!(manager.clear_template(), Err(ContractError::NoActiveScope));

    let scope = manager
        .set_template(Template::process_default())
        .expect("scope");
    manager.clear_template().expect("explicit clear");
    assert_eq!(manager.clear_template(), Err(ContractError::NoActiveScope));
    assert_eq!(scope.clear(), Err(ContractError::NoActiveScope));
}

#[test]
fn scope_is_released_when_spawn_fails() {
    let (kernel, manager) = setup();
    let result: Result<u32, SpawnFailure> =
        manager.with_template(Template::process_default(), |scope| {
            assert!(kernel.scoped_template().is_some());
            Ok(scope.launch(&*kernel, &LaunchRequest::new("  "))?)
        });

    assert_eq!(result, Err(SpawnFailure::Launch(LaunchError::EmptyProgram)));
    assert!(kernel.scoped_template().is_none());
    assert!(manager.latest().is_err());
}

#[test]
fn dropped_guard_clears_scope() {
    let (kernel, manager) = setup();
    {
        let scope = manager
            .set_template(Template::process_default().with_cookie(9))
            .expect("scope");
        assert_eq!(scope.template().cookie, 9);
        assert_eq!(kernel.scoped_template().map(|template| template.cookie), Some(9));
    }
    assert!(kernel.scoped_template().is_none());
    assert_eq!(manager.clear_template(), Err(ContractError::NoActiveScope));
}

#[test]
fn stale_guard_cannot_launch_into_a_newer_scope() {
    let (kernel, manager) = setup();
    let stale = manager
        .set_template(Template::process_default())
        .expect("first scope");
    manager.clear_template().expect("explicit clear");
    let _fresh = manager
        .set_template(Template::process_default().with_cookie(5))
        .expect("second scope");

    assert!(!stale.is_current());
    let err = stale
        .launch(&*kernel, &LaunchRequest::new("/usr/bin/true"))
        .expect_err("stale guard must not launch");
    assert!(matches!(err, LaunchError::Failed(_)));
    drop(stale);
    assert_eq!(kernel.scoped_template().map(|template| template.cookie), Some(5));
}

#[test]
fn with_template_yields_spawned_contract() {
    let (kernel, manager) = setup();
    let template = Template::new(ContractType::Process)
        .with_critical(EventKind::ProcessEmpty)
        .with_param(TemplateParam::NoOrphan)
        .with_cookie(0xfeed);

    let pid: Result<u32, SpawnFailure> = manager.with_template(template, |scope| {
        Ok(scope.launch(&*kernel, &LaunchRequest::new("/usr/bin/true"))?)
    });
    let pid = pid.expect("scoped spawn");

    let handle = manager.latest().expect("latest");
    let status = handle.status().expect("status");
    assert_eq!(status.members, vec![pid]);
    assert_eq!(status.cookie, 0xfeed);
    assert!(status.params.contains(&TemplateParam::NoOrphan));
}

#[test]
fn template_document_is_validated_before_scoping() {
    let (kernel, manager) = setup();
    let document = serde_json::json!({
        "type": "process",
        "critical": ["pr_empty"],
        "informative": ["dev_online"]
    });
    let err = serde_json::from_value::<Template>(document)
        .expect_err("device kind in a process template");
    assert!(err.to_string().contains("does not belong to process contracts"));

    let template = Template::new(ContractType::Process)
        .with_critical(EventKind::ProcessEmpty)
        .with_informative(EventKind::DeviceOnline);
    assert_eq!(
        manager.set_template(template).expect_err("invalid template"),
        ContractError::InvalidTemplate(TemplateValidationError::KindOutsideDomain {
            kind: EventKind::DeviceOnline,
            contract_type: ContractType::Process,
        })
    );
    assert!(kernel.scoped_template().is_none());
}

#[test]
fn template_document_with_param_alias_round_trips_to_status() {
    let (kernel, manager) = setup();
    let template: Template = serde_json::from_value(serde_json::json!({
        "type": "process",
        "critical": { "pr_empty": true, "pr_hwerr": true },
        "informative": { "pr_exit": true, "pr_core": false },
        "param": { "inherit": true },
        "cookie": "0x2a"
    }))
    .expect("document parses");

    let scope = manager.set_template(template.clone()).expect("scope");
    scope
        .launch(&*kernel, &LaunchRequest::new("/usr/bin/true"))
        .expect("spawn");
    scope.clear().expect("clear");

    let status = manager.latest().expect("latest").status().expect("status");
    assert_eq!(status.critical, template.critical);
    assert_eq!(status.informative, template.informative);
    assert!(status.params.contains(&TemplateParam::Inherit));
    assert_eq!(status.cookie, 42);
}
