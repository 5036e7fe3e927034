//! FFI use-case API for host-facing contract calls.
//!
//! # Responsibility
//! - Expose contract lifecycle, template scope and event calls to hosts via
//!   FRB, backed by one process-wide manager over the simulated facility.
//! - Keep handles alive between calls in a table keyed by contract id;
//!   abandoned handles stay in it until their id is bound again.
//!
//! # Invariants
//! - Exported functions must not panic across the FFI boundary.
//! - Every failure is reported in the envelope with a stable `error_code`.
//! - Blocking waits never hold the handle table lock.

use contract_core::{
    core_version as core_version_inner, init_logging as init_logging_inner, ContractError,
    ContractHandle, ContractManager, Ctid, Delivery, LaunchRequest, ProcessLauncher, SimKernel,
    Subscription, Template, TemplateScope,
};
use log::warn;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const NEXT_EVENT_TIMEOUT_MAX_MS: u64 = 30_000;

static KERNEL: Lazy<Arc<SimKernel>> = Lazy::new(|| Arc::new(SimKernel::new()));
static MANAGER: Lazy<ContractManager> = Lazy::new(|| ContractManager::new(KERNEL.clone()));
static SCOPE: Lazy<Mutex<Option<TemplateScope<'static>>>> = Lazy::new(|| Mutex::new(None));
static HANDLES: Lazy<Mutex<BTreeMap<Ctid, Binding>>> = Lazy::new(|| Mutex::new(BTreeMap::new()));

struct Binding {
    handle: ContractHandle,
    events: Option<Arc<Subscription>>,
}

/// Expose core crate version through FFI.
///
/// # FFI contract
/// - Sync call, non-blocking.
/// - Never throws; always returns a UTF-8 string.
#[flutter_rust_bridge::frb(sync)]
pub fn core_version() -> String {
    core_version_inner().to_owned()
}

/// Initializes Rust core logging once per process.
///
/// Input semantics:
/// - `level`: one of `trace|debug|info|warn|error` (case-insensitive).
/// - `log_dir`: absolute directory path where rolling logs are written.
///
/// # FFI contract
/// - Safe to call repeatedly with the same `level + log_dir` (idempotent).
/// - Never panics; returns empty string on success and error message on failure.
#[flutter_rust_bridge::frb(sync)]
pub fn init_logging(level: String, log_dir: String) -> String {
    match init_logging_inner(level.as_str(), log_dir.as_str()) {
        Ok(()) => String::new(),
        Err(err) => err.to_string(),
    }
}

/// Result envelope for contract and scope calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractResponse {
    /// Whether operation succeeded.
    pub ok: bool,
    /// Contract id the call acted on, `0` when none.
    pub ctid: u64,
    /// Stable machine-readable failure code.
    pub error_code: Option<String>,
    /// Human-readable response message for diagnostics.
    pub message: String,
}

impl ContractResponse {
    fn success(ctid: Ctid, message: impl Into<String>) -> Self {
        Self {
            ok: true,
            ctid,
            error_code: None,
            message: message.into(),
        }
    }

    fn failure(operation: &str, ctid: Ctid, code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        warn!(
            "event=ffi_call module=ffi status=error op={} ctid={} code={}",
            operation, ctid, code
        );
        Self {
            ok: false,
            ctid,
            error_code: Some(code.to_string()),
            message: format!("{operation} failed: {message}"),
        }
    }

    fn from_error(operation: &str, ctid: Ctid, err: &ContractError) -> Self {
        Self::failure(operation, ctid, err.code(), err.to_string())
    }
}

/// Result envelope carrying one JSON document (status or event).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractJsonResponse {
    pub ok: bool,
    /// JSON payload on success; `None` on failure or timeout.
    pub json: Option<String>,
    /// Set when the event stream has ended for this handle.
    pub closed: bool,
    pub error_code: Option<String>,
    pub message: String,
}

impl ContractJsonResponse {
    fn failure(code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            json: None,
            closed: false,
            error_code: Some(code.to_string()),
            message: message.into(),
        }
    }
}

/// Result envelope for simulated process calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResponse {
    pub ok: bool,
    pub pid: Option<u32>,
    pub message: String,
}

/// Installs a template scope from a JSON document.
///
/// Accepts `params` or `param`, flag maps or lists, and numeric or hex
/// string cookies.
///
/// # FFI contract
/// - Sync call, non-blocking.
/// - Fails with `invalid_template` for malformed or invalid documents and
///   `scope_already_active` while a scope is set.
#[flutter_rust_bridge::frb(sync)]
pub fn set_template(template_json: String) -> ContractResponse {
    let template: Template = match serde_json::from_str(template_json.as_str()) {
        Ok(template) => template,
        Err(err) => {
            return ContractResponse::failure("set_template", 0, "invalid_template", err.to_string())
        }
    };

    let mut slot = SCOPE.lock();
    let manager: &'static ContractManager = &MANAGER;
    match manager.set_template(template) {
        Ok(scope) => {
            *slot = Some(scope);
            ContractResponse::success(0, "Template scope set.")
        }
        Err(err) => ContractResponse::from_error("set_template", 0, &err),
    }
}

/// Clears the template scope installed by [`set_template`].
#[flutter_rust_bridge::frb(sync)]
pub fn clear_template() -> ContractResponse {
    let scope = SCOPE.lock().take();
    let result = match scope {
        Some(scope) => scope.clear(),
        None => MANAGER.clear_template(),
    };
    match result {
        Ok(()) => ContractResponse::success(0, "Template scope cleared."),
        Err(err) => ContractResponse::from_error("clear_template", 0, &err),
    }
}

/// Allocates a new unactivated process contract with the default template.
#[flutter_rust_bridge::frb(sync)]
pub fn contract_create() -> ContractResponse {
    bind_with("contract_create", MANAGER.create())
}

/// Binds with control access to an existing contract.
#[flutter_rust_bridge::frb(sync)]
pub fn contract_adopt(ctid: u64) -> ContractResponse {
    bind_with("contract_adopt", MANAGER.adopt(ctid))
}

/// Binds read-only to an existing contract.
#[flutter_rust_bridge::frb(sync)]
pub fn contract_observe(ctid: u64) -> ContractResponse {
    bind_with("contract_observe", MANAGER.observe(ctid))
}

/// Binds to the most recently created contract.
///
/// # FFI contract
/// - Blocks up to the configured `latest` timeout.
/// - Fails with retryable `no_contract` when nothing registered in time.
#[flutter_rust_bridge::frb(sync)]
pub fn contract_latest() -> ContractResponse {
    bind_with("contract_latest", MANAGER.latest())
}

/// Returns a JSON status snapshot for a bound contract.
#[flutter_rust_bridge::frb(sync)]
pub fn contract_status(ctid: u64) -> ContractJsonResponse {
    let Some(handle) = lookup(ctid) else {
        return ContractJsonResponse::failure("unknown_handle", unknown_handle_message(ctid));
    };
    let status = match handle.status() {
        Ok(status) => status,
        Err(err) => return ContractJsonResponse::failure(err.code(), err.to_string()),
    };
    match serde_json::to_string(&status) {
        Ok(json) => ContractJsonResponse {
            ok: true,
            json: Some(json),
            closed: false,
            error_code: None,
            message: "Status read.".to_string(),
        },
        Err(err) => ContractJsonResponse::failure("encode_failed", err.to_string()),
    }
}

#[flutter_rust_bridge::frb(sync)]
pub fn contract_activate(ctid: u64) -> ContractResponse {
    with_handle("contract_activate", ctid, |handle| handle.activate())
}

#[flutter_rust_bridge::frb(sync)]
pub fn contract_deactivate(ctid: u64) -> ContractResponse {
    with_handle("contract_deactivate", ctid, |handle| handle.deactivate())
}

#[flutter_rust_bridge::frb(sync)]
pub fn contract_ack(ctid: u64, evid: u64) -> ContractResponse {
    with_handle("contract_ack", ctid, |handle| handle.ack(evid))
}

#[flutter_rust_bridge::frb(sync)]
pub fn contract_nack(ctid: u64, evid: u64) -> ContractResponse {
    with_handle("contract_nack", ctid, |handle| handle.nack(evid))
}

#[flutter_rust_bridge::frb(sync)]
pub fn contract_qack(ctid: u64, evid: u64) -> ContractResponse {
    with_handle("contract_qack", ctid, |handle| handle.qack(evid))
}

#[flutter_rust_bridge::frb(sync)]
pub fn contract_send_signal(ctid: u64, signal: i32) -> ContractResponse {
    with_handle("contract_send_signal", ctid, |handle| handle.send_signal(signal))
}

/// Abandons a bound contract.
///
/// The binding stays in the table so later calls on `ctid` report
/// `handle_abandoned` until the id is bound again.
#[flutter_rust_bridge::frb(sync)]
pub fn contract_abandon(ctid: u64) -> ContractResponse {
    with_handle("contract_abandon", ctid, |handle| handle.abandon())
}

/// Waits up to `timeout_ms` for the next event of a bound contract.
///
/// # FFI contract
/// - Blocking call; the wait is capped at 30 seconds.
/// - `ok=true, json=None` means the wait timed out.
/// - `closed=true` means no further events will arrive.
#[flutter_rust_bridge::frb(sync)]
pub fn contract_next_event(ctid: u64, timeout_ms: u64) -> ContractJsonResponse {
    let events = match event_stream(ctid) {
        Ok(events) => events,
        Err(response) => return response,
    };

    let timeout = Duration::from_millis(timeout_ms.min(NEXT_EVENT_TIMEOUT_MAX_MS));
    match events.recv_timeout(timeout) {
        Some(Delivery::Event(event)) => match serde_json::to_string(&event) {
            Ok(json) => ContractJsonResponse {
                ok: true,
                json: Some(json),
                closed: false,
                error_code: None,
                message: format!("Event {} delivered.", event.evid),
            },
            Err(err) => ContractJsonResponse::failure("encode_failed", err.to_string()),
        },
        Some(Delivery::Closed(reason)) => ContractJsonResponse {
            ok: true,
            json: None,
            closed: true,
            error_code: None,
            message: format!("Event stream closed: {reason:?}."),
        },
        None => ContractJsonResponse {
            ok: true,
            json: None,
            closed: false,
            error_code: None,
            message: "No event before timeout.".to_string(),
        },
    }
}

/// Starts a simulated process.
///
/// Inside a template scope the process gets a fresh contract; otherwise it
/// joins the activated contract, if any.
#[flutter_rust_bridge::frb(sync)]
pub fn process_spawn(program: String, args: Vec<String>) -> ProcessResponse {
    let request = args
        .into_iter()
        .fold(LaunchRequest::new(program.trim()), LaunchRequest::arg);
    let scope = SCOPE.lock();
    let launched = match scope.as_ref() {
        Some(scope) => scope.launch(&**KERNEL, &request),
        None => KERNEL.spawn(&request),
    };
    match launched {
        Ok(pid) => ProcessResponse {
            ok: true,
            pid: Some(pid),
            message: "Process started.".to_string(),
        },
        Err(err) => ProcessResponse {
            ok: false,
            pid: None,
            message: format!("process_spawn failed: {err}"),
        },
    }
}

/// Terminates a simulated process with `status`.
#[flutter_rust_bridge::frb(sync)]
pub fn process_exit(pid: u32, status: i32) -> ProcessResponse {
    match KERNEL.exit(pid, status) {
        Ok(()) => ProcessResponse {
            ok: true,
            pid: Some(pid),
            message: "Process exited.".to_string(),
        },
        Err(err) => ProcessResponse {
            ok: false,
            pid: Some(pid),
            message: format!("process_exit failed: {err}"),
        },
    }
}

fn bind_with(operation: &str, result: Result<ContractHandle, ContractError>) -> ContractResponse {
    match result {
        Ok(handle) => {
            let ctid = handle.id();
            HANDLES.lock().insert(
                ctid,
                Binding {
                    handle,
                    events: None,
                },
            );
            ContractResponse::success(ctid, "Contract bound.")
        }
        Err(err) => ContractResponse::from_error(operation, 0, &err),
    }
}

fn lookup(ctid: Ctid) -> Option<ContractHandle> {
    HANDLES.lock().get(&ctid).map(|binding| binding.handle.clone())
}

fn with_handle(
    operation: &str,
    ctid: Ctid,
    f: impl FnOnce(&ContractHandle) -> Result<(), ContractError>,
) -> ContractResponse {
    let Some(handle) = lookup(ctid) else {
        return ContractResponse::failure(
            operation,
            ctid,
            "unknown_handle",
            unknown_handle_message(ctid),
        );
    };
    match f(&handle) {
        Ok(()) => ContractResponse::success(ctid, "Done."),
        Err(err) => ContractResponse::from_error(operation, ctid, &err),
    }
}

/// Returns the table-owned subscription for `ctid`, subscribing on first use.
fn event_stream(ctid: Ctid) -> Result<Arc<Subscription>, ContractJsonResponse> {
    let mut handles = HANDLES.lock();
    let Some(binding) = handles.get_mut(&ctid) else {
        return Err(ContractJsonResponse::failure(
            "unknown_handle",
            unknown_handle_message(ctid),
        ));
    };
    if let Some(events) = &binding.events {
        return Ok(events.clone());
    }
    let events = binding
        .handle
        .subscribe_all()
        .map(Arc::new)
        .map_err(|err| ContractJsonResponse::failure(err.code(), err.to_string()))?;
    binding.events = Some(events.clone());
    Ok(events)
}

fn unknown_handle_message(ctid: Ctid) -> String {
    format!("no handle is bound to contract {ctid}")
}
