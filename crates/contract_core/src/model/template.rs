//! Contract template declaration and validation.
//!
//! # Responsibility
//! - Describe which event kinds are critical or informative for contracts
//!   created from a template, plus boolean params and an opaque cookie.
//! - Accept the loose document shape hosts send (flag maps or lists,
//!   `param` alias, hex cookie strings) and normalize it.
//!
//! # Invariants
//! - `critical` and `informative` are disjoint.
//! - Every listed kind and param belongs to the template's contract domain.

use crate::model::event::{parse_event_kind, EventClass, EventKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Contract domain string for process contracts.
pub const CONTRACT_TYPE_PROCESS: &str = "process";
/// Contract domain string for device contracts.
pub const CONTRACT_TYPE_DEVICE: &str = "device";

/// Template param string: orphaned members may be inherited by a regent.
pub const PARAM_INHERIT: &str = "inherit";
/// Template param string: kill members when the contract is abandoned.
pub const PARAM_NOORPHAN: &str = "noorphan";
/// Template param string: fatal events affect the process group only.
pub const PARAM_PGRPONLY: &str = "pgrponly";
/// Template param string: the holder acts as regent for inherited contracts.
pub const PARAM_REGENT: &str = "regent";
/// Template param string: keep the contract across exec.
pub const PARAM_KEEP_EXEC: &str = "keep_exec";

/// Contract domain tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractType {
    Process,
    Device,
}

impl ContractType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Process => CONTRACT_TYPE_PROCESS,
            Self::Device => CONTRACT_TYPE_DEVICE,
        }
    }
}

impl Display for ContractType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Boolean template parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TemplateParam {
    #[serde(rename = "inherit")]
    Inherit,
    #[serde(rename = "noorphan")]
    NoOrphan,
    #[serde(rename = "pgrponly")]
    PgrpOnly,
    #[serde(rename = "regent")]
    Regent,
    #[serde(rename = "keep_exec")]
    KeepExec,
}

impl TemplateParam {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inherit => PARAM_INHERIT,
            Self::NoOrphan => PARAM_NOORPHAN,
            Self::PgrpOnly => PARAM_PGRPONLY,
            Self::Regent => PARAM_REGENT,
            Self::KeepExec => PARAM_KEEP_EXEC,
        }
    }

    /// All params are process-contract params.
    pub fn domain(self) -> ContractType {
        ContractType::Process
    }
}

/// Validated contract template.
///
/// Deserializes through [`TemplateDocument`], so any accepted document is
/// already normalized and valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TemplateDocument", into = "TemplateDocument")]
pub struct Template {
    pub contract_type: ContractType,
    pub critical: BTreeSet<EventKind>,
    pub informative: BTreeSet<EventKind>,
    pub params: BTreeSet<TemplateParam>,
    pub cookie: u64,
}

impl Template {
    /// Creates an empty template for one contract domain.
    pub fn new(contract_type: ContractType) -> Self {
        Self {
            contract_type,
            critical: BTreeSet::new(),
            informative: BTreeSet::new(),
            params: BTreeSet::new(),
            cookie: 0,
        }
    }

    /// Template used by `create()` when the caller supplies none.
    ///
    /// Empty membership and hardware errors are critical; core dumps and
    /// fatal signals are informative.
    pub fn process_default() -> Self {
        Self::new(ContractType::Process)
            .with_critical(EventKind::ProcessEmpty)
            .with_critical(EventKind::ProcessHwErr)
            .with_informative(EventKind::ProcessCore)
            .with_informative(EventKind::ProcessSignal)
    }

    pub fn with_critical(mut self, kind: EventKind) -> Self {
        self.critical.insert(kind);
        self
    }

    pub fn with_informative(mut self, kind: EventKind) -> Self {
        self.informative.insert(kind);
        self
    }

    pub fn with_param(mut self, param: TemplateParam) -> Self {
        self.params.insert(param);
        self
    }

    pub fn with_cookie(mut self, cookie: u64) -> Self {
        self.cookie = cookie;
        self
    }

    pub fn has_param(&self, param: TemplateParam) -> bool {
        self.params.contains(&param)
    }

    /// Returns the delivery class of `kind`, or `None` when the template
    /// does not subscribe to it.
    pub fn class_of(&self, kind: EventKind) -> Option<EventClass> {
        if self.critical.contains(&kind) {
            Some(EventClass::Critical)
        } else if self.informative.contains(&kind) {
            Some(EventClass::Informative)
        } else {
            None
        }
    }

    /// Validates declaration-level template invariants.
    pub fn validate(&self) -> Result<(), TemplateValidationError> {
        if let Some(kind) = self.critical.intersection(&self.informative).next() {
            return Err(TemplateValidationError::OverlappingKind(*kind));
        }

        for kind in self.critical.iter().chain(self.informative.iter()) {
            if !kind.belongs_to(self.contract_type) {
                return Err(TemplateValidationError::KindOutsideDomain {
                    kind: *kind,
                    contract_type: self.contract_type,
                });
            }
        }

        for param in &self.params {
            if param.domain() != self.contract_type {
                return Err(TemplateValidationError::ParamOutsideDomain {
                    param: *param,
                    contract_type: self.contract_type,
                });
            }
        }
        Ok(())
    }
}

/// Flag set as hosts send it: either `{name: bool}` or `[name, ...]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagSet {
    List(Vec<String>),
    Map(BTreeMap<String, bool>),
}

impl Default for FlagSet {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl FlagSet {
    /// Returns enabled flag names in declaration order.
    fn enabled(&self) -> Vec<&str> {
        match self {
            Self::List(values) => values.iter().map(String::as_str).collect(),
            Self::Map(values) => values
                .iter()
                .filter(|(_, enabled)| **enabled)
                .map(|(name, _)| name.as_str())
                .collect(),
        }
    }
}

/// Cookie as hosts send it: a number or a decimal/hex string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CookieValue {
    Number(u64),
    Text(String),
}

/// Raw template document.
///
/// Canonical parameter field is `params`; `param` is accepted as an alias.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateDocument {
    #[serde(rename = "type", default)]
    pub contract_type: String,
    #[serde(default)]
    pub critical: FlagSet,
    #[serde(default)]
    pub informative: FlagSet,
    #[serde(default, alias = "param")]
    pub params: FlagSet,
    #[serde(default)]
    pub cookie: Option<CookieValue>,
}

impl TryFrom<TemplateDocument> for Template {
    type Error = TemplateValidationError;

    fn try_from(document: TemplateDocument) -> Result<Self, Self::Error> {
        let contract_type = parse_contract_type(&document.contract_type)?;
        let mut template = Template::new(contract_type);

        for name in document.critical.enabled() {
            template.critical.insert(parse_template_kind(name)?);
        }
        for name in document.informative.enabled() {
            template.informative.insert(parse_template_kind(name)?);
        }
        for name in document.params.enabled() {
            template.params.insert(parse_template_param(name)?);
        }
        if let Some(cookie) = &document.cookie {
            template.cookie = parse_cookie(cookie)?;
        }

        template.validate()?;
        Ok(template)
    }
}

impl From<Template> for TemplateDocument {
    fn from(template: Template) -> Self {
        let names = |kinds: &BTreeSet<EventKind>| {
            FlagSet::List(kinds.iter().map(|kind| kind.as_str().to_string()).collect())
        };
        Self {
            contract_type: template.contract_type.as_str().to_string(),
            critical: names(&template.critical),
            informative: names(&template.informative),
            params: FlagSet::List(
                template
                    .params
                    .iter()
                    .map(|param| param.as_str().to_string())
                    .collect(),
            ),
            cookie: Some(CookieValue::Number(template.cookie)),
        }
    }
}

/// Parses a contract domain tag.
pub fn parse_contract_type(value: &str) -> Result<ContractType, TemplateValidationError> {
    match value.trim() {
        "" => Err(TemplateValidationError::EmptyType),
        CONTRACT_TYPE_PROCESS => Ok(ContractType::Process),
        CONTRACT_TYPE_DEVICE => Ok(ContractType::Device),
        other => Err(TemplateValidationError::UnsupportedType(other.to_string())),
    }
}

/// Parses one template param name.
pub fn parse_template_param(value: &str) -> Result<TemplateParam, TemplateValidationError> {
    match value.trim() {
        PARAM_INHERIT => Ok(TemplateParam::Inherit),
        PARAM_NOORPHAN => Ok(TemplateParam::NoOrphan),
        PARAM_PGRPONLY => Ok(TemplateParam::PgrpOnly),
        PARAM_REGENT => Ok(TemplateParam::Regent),
        PARAM_KEEP_EXEC => Ok(TemplateParam::KeepExec),
        other => Err(TemplateValidationError::UnsupportedParam(other.to_string())),
    }
}

fn parse_template_kind(value: &str) -> Result<EventKind, TemplateValidationError> {
    parse_event_kind(value)
        .map_err(|_| TemplateValidationError::UnsupportedEventKind(value.trim().to_string()))
}

fn parse_cookie(value: &CookieValue) -> Result<u64, TemplateValidationError> {
    let raw = match value {
        CookieValue::Number(number) => return Ok(*number),
        CookieValue::Text(raw) => raw.trim(),
    };
    let parsed = match raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse::<u64>(),
    };
    parsed.map_err(|_| TemplateValidationError::InvalidCookie(raw.to_string()))
}

/// Template validation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateValidationError {
    EmptyType,
    UnsupportedType(String),
    UnsupportedEventKind(String),
    OverlappingKind(EventKind),
    KindOutsideDomain {
        kind: EventKind,
        contract_type: ContractType,
    },
    UnsupportedParam(String),
    ParamOutsideDomain {
        param: TemplateParam,
        contract_type: ContractType,
    },
    InvalidCookie(String),
}

impl Display for TemplateValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyType => write!(f, "template type must not be empty"),
            Self::UnsupportedType(value) => write!(f, "template type is unsupported: {value}"),
            Self::UnsupportedEventKind(value) => {
                write!(f, "template event kind is unsupported: {value}")
            }
            Self::OverlappingKind(kind) => write!(
                f,
                "event kind {kind} cannot be both critical and informative"
            ),
            Self::KindOutsideDomain {
                kind,
                contract_type,
            } => write!(
                f,
                "event kind {kind} does not belong to {contract_type} contracts"
            ),
            Self::UnsupportedParam(value) => write!(f, "template param is unsupported: {value}"),
            Self::ParamOutsideDomain {
                param,
                contract_type,
            } => write!(
                f,
                "template param {} does not apply to {contract_type} contracts",
                param.as_str()
            ),
            Self::InvalidCookie(value) => write!(f, "template cookie is invalid: {value}"),
        }
    }
}

impl Error for TemplateValidationError {}

#[cfg(test)]
mod tests {
    use super::{
        ContractType, Template, TemplateParam, TemplateValidationError,
    };
    use crate::model::event::{EventClass, EventKind};

    fn original_document() -> serde_json::Value {
        serde_json::json!({
            "type": "process",
            "critical": { "pr_empty": true, "pr_hwerr": true },
            "informative": { "pr_exit": true, "pr_core": true },
            "param": { "noorphan": true },
            "cookie": "0xdeadbeef"
        })
    }

    #[test]
    fn parses_flag_map_document_with_param_alias() {
        let template: Template =
            serde_json::from_value(original_document()).expect("document should parse");
        assert_eq!(template.contract_type, ContractType::Process);
        assert!(template.critical.contains(&EventKind::ProcessEmpty));
        assert!(template.critical.contains(&EventKind::ProcessHwErr));
        assert!(template.informative.contains(&EventKind::ProcessExit));
        assert!(template.has_param(TemplateParam::NoOrphan));
        assert_eq!(template.cookie, 0xdead_beef);
    }

    #[test]
    fn parses_list_document_and_skips_disabled_flags() {
        let template: Template = serde_json::from_value(serde_json::json!({
            "type": "process",
            "critical": ["pr_empty"],
            "informative": { "pr_exit": true, "pr_core": false },
            "params": ["inherit"],
            "cookie": 42
        }))
        .expect("document should parse");
        assert_eq!(template.informative.len(), 1);
        assert!(template.has_param(TemplateParam::Inherit));
        assert_eq!(template.cookie, 42);
    }

    #[test]
    fn serializes_with_canonical_params_field() {
        let template = Template::process_default().with_param(TemplateParam::Regent);
        let value = serde_json::to_value(&template).expect("template serializes");
        assert_eq!(value["type"], "process");
        assert_eq!(value["params"][0], "regent");
        assert!(value.get("param").is_none());

        let back: Template = serde_json::from_value(value).expect("template parses back");
        assert_eq!(back, template);
    }

    #[test]
    fn rejects_empty_type() {
        let err = serde_json::from_value::<Template>(serde_json::json!({ "critical": [] }))
            .expect_err("missing type must fail");
        assert!(err.to_string().contains("type must not be empty"));
    }

    #[test]
    fn rejects_overlapping_kinds() {
        let template = Template::new(ContractType::Process)
            .with_critical(EventKind::ProcessExit)
            .with_informative(EventKind::ProcessExit);
        assert_eq!(
            template.validate(),
            Err(TemplateValidationError::OverlappingKind(EventKind::ProcessExit))
        );
    }

    #[test]
    fn rejects_kinds_and_params_outside_domain() {
        let kind_err = Template::new(ContractType::Device)
            .with_critical(EventKind::ProcessEmpty)
            .validate()
            .expect_err("process kind in device template must fail");
        assert!(matches!(
            kind_err,
            TemplateValidationError::KindOutsideDomain { .. }
        ));

        let param_err = Template::new(ContractType::Device)
            .with_param(TemplateParam::NoOrphan)
            .validate()
            .expect_err("process param in device template must fail");
        assert!(matches!(
            param_err,
            TemplateValidationError::ParamOutsideDomain { .. }
        ));
    }

    #[test]
    fn rejects_bad_cookie_and_unknown_names() {
        let cookie = serde_json::from_value::<Template>(serde_json::json!({
            "type": "process",
            "cookie": "0xnothex"
        }));
        assert!(cookie.is_err());

        let kind = serde_json::from_value::<Template>(serde_json::json!({
            "type": "process",
            "critical": ["pr_reboot"]
        }));
        assert!(kind.is_err());
    }

    #[test]
    fn classifies_kinds() {
        let template = Template::process_default();
        assert_eq!(
            template.class_of(EventKind::ProcessEmpty),
            Some(EventClass::Critical)
        );
        assert_eq!(
            template.class_of(EventKind::ProcessCore),
            Some(EventClass::Informative)
        );
        assert_eq!(template.class_of(EventKind::ProcessFork), None);
    }
}
