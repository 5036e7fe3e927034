//! CLI smoke entry point.
//!
//! # Responsibility
//! - Run the canonical scoped-spawn scenario against the simulated facility.
//! - Keep output deterministic for quick local sanity checks.

use contract_core::{
    default_log_level, init_logging, ContractManager, ContractType, Delivery, EventKind,
    LaunchRequest, SimKernel, Template,
};
use log::info;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

const LOG_DIR_ENV: &str = "CONTRACT_LOG_DIR";

fn main() -> Result<(), Box<dyn Error>> {
    if let Ok(log_dir) = std::env::var(LOG_DIR_ENV) {
        init_logging(default_log_level(), log_dir.as_str())?;
    }
    println!("contract_core version={}", contract_core::core_version());

    let kernel = Arc::new(SimKernel::new());
    let manager = ContractManager::new(kernel.clone());
    let template = Template::new(ContractType::Process)
        .with_critical(EventKind::ProcessEmpty)
        .with_informative(EventKind::ProcessExit);

    let scope = manager.set_template(template)?;
    let pid = scope.launch(&*kernel, &LaunchRequest::new("/usr/bin/true"))?;
    scope.clear()?;

    let handle = manager.latest()?;
    println!("spawned pid={} ctid={}", pid, handle.id());
    let events = handle.subscribe_all()?;
    kernel.exit(pid, 0)?;

    while let Some(delivery) = events.recv_timeout(Duration::from_secs(2)) {
        let Delivery::Event(event) = delivery else {
            break;
        };
        println!("event evid={} kind={} class={:?}", event.evid, event.kind, event.class);
        if event.is_critical() {
            handle.ack(event.evid)?;
        }
        if event.kind == EventKind::ProcessEmpty {
            break;
        }
    }

    let status = handle.status()?;
    println!(
        "status empty={} fully_acknowledged={}",
        status.is_empty(),
        status.is_fully_acknowledged()
    );
    handle.abandon()?;
    info!("event=cli_done module=cli status=ok ctid={}", status.ctid);
    Ok(())
}
