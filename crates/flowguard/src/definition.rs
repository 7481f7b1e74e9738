//! Declarative workflow definitions (YAML).
//!
//! A definition file holds a library of named, parameterized workflows:
//!
//! ```yaml
//! version: "1.0"
//! workflows:
//!   add_contact:
//!     steps:
//!       - click: { target: { role: button, name: "Add contact" } }
//!       - fill:
//!           target: { role: textbox, name: Name, within: { role: dialog } }
//!           text: "${name}"
//!       - click:
//!           target: { role: button, name: Confirm }
//!           creates: { kind: contact, key: "${name}", cleanup: delete_contact, vars: { name: "${name}" } }
//!       - verify: { type: names_include, target: { role: row }, name: "${name}" }
//!   delete_contact:
//!     steps:
//!       - click: { target: { role: button, name: Delete, within: { role: row, name: "${name}" } } }
//! ```
//!
//! String scalars may reference `${var}` (supplied to [`WorkflowLibrary::build`])
//! or `${unique:Prefix}`, which expands to one fresh [`unique_key`] per prefix
//! per build so the same key can be typed and registered for cleanup.

use crate::action::{Action, ActionError};
use crate::driver::{ActionKind, Role};
use crate::lifecycle::unique_key;
use crate::locator::ElementReference;
use crate::verify::{ClaimError, Settle, VerificationClaim};
use crate::config::EngineConfig;
use crate::wait::{UrlPattern, WaitCondition, NETWORK_IDLE_THRESHOLD_MS};
use crate::workflow::{EntityRegistration, Workflow, WorkflowStep};
use serde::Deserialize;
use serde_yaml_ng::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

/// Supported definition format version
pub const DEFINITION_VERSION: &str = "1.0";

/// Deepest allowed chain of `run` / `creates.cleanup` references
pub const MAX_NESTING: usize = 8;

/// Errors raised while loading or instantiating definitions
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("Failed to parse YAML: {0}")]
    ParseError(String),

    #[error("Invalid version '{0}', expected '1.0'")]
    InvalidVersion(String),

    #[error("Workflow '{0}' is not defined")]
    UnknownWorkflow(String),

    #[error("Workflow '{workflow}' references undefined workflow '{target}'")]
    DanglingReference { workflow: String, target: String },

    #[error("Workflow '{workflow}': undefined variable '{name}'")]
    UndefinedVariable { workflow: String, name: String },

    #[error("Workflow '{workflow}': {message}")]
    Invalid { workflow: String, message: String },

    #[error("Workflow nesting exceeds {MAX_NESTING} levels at '{0}'")]
    TooDeep(String),

    #[error(transparent)]
    Action(#[from] ActionError),

    #[error(transparent)]
    Claim(#[from] ClaimError),
}

// =============================================================================
// SCHEMA
// =============================================================================

/// Element reference as written in YAML
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReferenceSpec {
    pub role: Role,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub contains: Option<String>,
    #[serde(default)]
    pub within: Option<Box<ReferenceSpec>>,
    #[serde(default)]
    pub nth: Option<usize>,
}

impl ReferenceSpec {
    fn build(&self, workflow: &str) -> Result<ElementReference, DefinitionError> {
        let mut reference = match (&self.name, &self.contains) {
            (Some(_), Some(_)) => {
                return Err(DefinitionError::Invalid {
                    workflow: workflow.to_string(),
                    message: format!("{} reference sets both name and contains", self.role),
                })
            }
            (Some(name), None) => ElementReference::named(self.role, name.as_str()),
            (None, Some(needle)) => ElementReference::name_contains(self.role, needle.as_str()),
            (None, None) => ElementReference::role(self.role),
        };
        if let Some(scope) = &self.within {
            reference = reference.within(scope.build(workflow)?);
        }
        if let Some(n) = self.nth {
            reference = reference.nth(n);
        }
        Ok(reference)
    }
}

/// Wait condition as written in YAML
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionSpec {
    ElementVisible {
        target: ReferenceSpec,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    ElementHidden {
        target: ReferenceSpec,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    CountEquals {
        target: ReferenceSpec,
        count: usize,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    UrlMatches {
        pattern: UrlPattern,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    TextEquals {
        target: ReferenceSpec,
        text: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    /// `idle_ms` defaults to the library's network idle window
    NetworkQuiescent {
        #[serde(default)]
        idle_ms: Option<u64>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
}

impl ConditionSpec {
    fn build(&self, workflow: &str, network_idle: Duration) -> Result<WaitCondition, DefinitionError> {
        let (condition, timeout_ms) = match self {
            Self::ElementVisible { target, timeout_ms } => {
                (WaitCondition::element_visible(target.build(workflow)?), timeout_ms)
            }
            Self::ElementHidden { target, timeout_ms } => {
                (WaitCondition::element_hidden(target.build(workflow)?), timeout_ms)
            }
            Self::CountEquals {
                target,
                count,
                timeout_ms,
            } => (
                WaitCondition::count_equals(target.build(workflow)?, *count),
                timeout_ms,
            ),
            Self::UrlMatches {
                pattern,
                timeout_ms,
            } => (WaitCondition::url_matches(pattern.clone()), timeout_ms),
            Self::TextEquals {
                target,
                text,
                timeout_ms,
            } => (
                WaitCondition::text_equals(target.build(workflow)?, text.as_str()),
                timeout_ms,
            ),
            Self::NetworkQuiescent {
                idle_ms,
                timeout_ms,
            } => (
                WaitCondition::network_quiescent(
                    idle_ms.map_or(network_idle, Duration::from_millis),
                ),
                timeout_ms,
            ),
        };
        Ok(match timeout_ms {
            Some(ms) => condition.with_timeout(Duration::from_millis(*ms)),
            None => condition,
        })
    }
}

/// Verification claim as written in YAML
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaimSpec {
    CountDelta {
        target: ReferenceSpec,
        delta: i64,
        #[serde(default)]
        settle_ms: Option<u64>,
    },
    CountAtLeast {
        target: ReferenceSpec,
        min: i64,
        #[serde(default)]
        settle_ms: Option<u64>,
    },
    UrlEquals {
        url: String,
        #[serde(default)]
        settle_ms: Option<u64>,
    },
    TextEquals {
        target: ReferenceSpec,
        text: String,
        #[serde(default)]
        settle_ms: Option<u64>,
    },
    TextContains {
        target: ReferenceSpec,
        text: String,
        #[serde(default)]
        settle_ms: Option<u64>,
    },
    ElementAbsent {
        target: ReferenceSpec,
        #[serde(default)]
        settle_ms: Option<u64>,
    },
    NamesInclude {
        target: ReferenceSpec,
        name: String,
        #[serde(default)]
        settle_ms: Option<u64>,
    },
    NamesExclude {
        target: ReferenceSpec,
        name: String,
        #[serde(default)]
        settle_ms: Option<u64>,
    },
}

impl ClaimSpec {
    fn build(&self, workflow: &str) -> Result<VerificationClaim, DefinitionError> {
        let (claim, settle_ms) = match self {
            Self::CountDelta {
                target,
                delta,
                settle_ms,
            } => (VerificationClaim::count_delta(target.build(workflow)?, *delta), settle_ms),
            Self::CountAtLeast {
                target,
                min,
                settle_ms,
            } => (VerificationClaim::count_at_least(target.build(workflow)?, *min), settle_ms),
            Self::UrlEquals { url, settle_ms } => {
                (VerificationClaim::url_equals(url.as_str()), settle_ms)
            }
            Self::TextEquals {
                target,
                text,
                settle_ms,
            } => (
                VerificationClaim::text_equals(target.build(workflow)?, text.as_str()),
                settle_ms,
            ),
            Self::TextContains {
                target,
                text,
                settle_ms,
            } => (
                VerificationClaim::text_contains(target.build(workflow)?, text.as_str()),
                settle_ms,
            ),
            Self::ElementAbsent { target, settle_ms } => {
                (VerificationClaim::element_absent(target.build(workflow)?), settle_ms)
            }
            Self::NamesInclude {
                target,
                name,
                settle_ms,
            } => (
                VerificationClaim::names_include(target.build(workflow)?, name.as_str()),
                settle_ms,
            ),
            Self::NamesExclude {
                target,
                name,
                settle_ms,
            } => (
                VerificationClaim::names_exclude(target.build(workflow)?, name.as_str()),
                settle_ms,
            ),
        };
        Ok(match settle_ms {
            Some(0) => claim.with_settle(Settle::Immediate),
            Some(ms) => claim.with_settle(Settle::Window(Duration::from_millis(*ms))),
            None => claim,
        })
    }
}

/// Test entity registration as written in YAML
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreatesSpec {
    pub kind: String,
    pub key: String,
    /// Name of the cleanup workflow
    pub cleanup: String,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

/// Common fields of the interaction steps
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionSpec {
    pub target: ReferenceSpec,
    /// Fill text or option name
    #[serde(default, alias = "option")]
    pub text: Option<String>,
    #[serde(default)]
    pub precondition: Option<ConditionSpec>,
    #[serde(default)]
    pub postcondition: Option<ConditionSpec>,
    #[serde(default)]
    pub creates: Option<CreatesSpec>,
}

/// Nested workflow invocation
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunSpec {
    pub workflow: String,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    #[serde(default)]
    pub creates: Option<CreatesSpec>,
}

/// One step as written in YAML
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepSpec {
    Click(ActionSpec),
    Fill(ActionSpec),
    Select(ActionSpec),
    Check(ActionSpec),
    Navigate(String),
    Wait(ConditionSpec),
    Verify(ClaimSpec),
    Run(RunSpec),
}

impl StepSpec {
    /// Workflows this step refers to
    fn references(&self) -> Vec<&str> {
        let creates = match self {
            Self::Click(a) | Self::Fill(a) | Self::Select(a) | Self::Check(a) => a.creates.as_ref(),
            Self::Run(run) => run.creates.as_ref(),
            _ => None,
        };
        let mut refs: Vec<&str> = creates.map(|c| c.cleanup.as_str()).into_iter().collect();
        if let Self::Run(run) = self {
            refs.push(run.workflow.as_str());
        }
        refs
    }
}

/// A parameterized workflow as written in YAML
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowSpec {
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub cleanup: Vec<StepSpec>,
}

#[derive(Debug, Deserialize)]
struct LibraryFile {
    version: String,
    #[serde(default)]
    workflows: BTreeMap<String, Value>,
}

// =============================================================================
// LIBRARY
// =============================================================================

/// Named workflow templates loaded from YAML
#[derive(Debug, Clone)]
pub struct WorkflowLibrary {
    templates: BTreeMap<String, Value>,
    network_idle: Duration,
}

impl WorkflowLibrary {
    /// Parse and validate a library.
    ///
    /// # Errors
    /// Returns error if the YAML is malformed, the version is unsupported,
    /// a workflow does not match the step schema, or a `run` / `cleanup`
    /// reference names an undefined workflow.
    pub fn from_yaml(yaml: &str) -> Result<Self, DefinitionError> {
        let file: LibraryFile =
            serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::ParseError(e.to_string()))?;
        if file.version != DEFINITION_VERSION {
            return Err(DefinitionError::InvalidVersion(file.version));
        }
        let library = Self {
            templates: file.workflows,
            network_idle: Duration::from_millis(NETWORK_IDLE_THRESHOLD_MS),
        };
        library.validate()?;
        Ok(library)
    }

    /// Read and parse a library file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or fails [`Self::from_yaml`].
    pub fn load(path: impl AsRef<Path>) -> crate::FlowResult<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Ok(Self::from_yaml(&yaml)?)
    }

    /// Idle window for `network_quiescent` conditions that omit `idle_ms`
    #[must_use]
    pub fn with_network_idle(mut self, window: Duration) -> Self {
        self.network_idle = window;
        self
    }

    /// Take the network idle window from an engine config
    #[must_use]
    pub fn with_config(self, config: &EngineConfig) -> Self {
        self.with_network_idle(config.network_idle())
    }

    fn validate(&self) -> Result<(), DefinitionError> {
        for (name, template) in &self.templates {
            let spec = parse_spec(name, template.clone())?;
            for step in spec.steps.iter().chain(&spec.cleanup) {
                for target in step.references() {
                    if !self.templates.contains_key(target) {
                        return Err(DefinitionError::DanglingReference {
                            workflow: name.clone(),
                            target: target.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Workflow names, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    /// Whether `name` is defined
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    /// Instantiate `name` with `vars`.
    ///
    /// # Errors
    /// Returns error if the workflow or a variable it uses is undefined, a
    /// step is invalid once variables are substituted, or references nest
    /// deeper than [`MAX_NESTING`].
    pub fn build(&self, name: &str, vars: &HashMap<String, String>) -> Result<Workflow, DefinitionError> {
        let vars: BTreeMap<String, String> =
            vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        self.instantiate(name, &vars, 0)
    }

    fn instantiate(
        &self,
        name: &str,
        vars: &BTreeMap<String, String>,
        depth: usize,
    ) -> Result<Workflow, DefinitionError> {
        if depth > MAX_NESTING {
            return Err(DefinitionError::TooDeep(name.to_string()));
        }
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| DefinitionError::UnknownWorkflow(name.to_string()))?;

        let mut expander = Expander {
            workflow: name,
            vars,
            unique: HashMap::new(),
        };
        let spec = parse_spec(name, expander.expand(template.clone())?)?;

        let mut workflow = Workflow::new(name);
        for step in &spec.steps {
            workflow = workflow.then(self.build_step(name, step, depth)?);
        }
        for step in &spec.cleanup {
            workflow = workflow.cleanup(self.build_step(name, step, depth)?);
        }
        Ok(workflow)
    }

    fn build_step(
        &self,
        workflow: &str,
        step: &StepSpec,
        depth: usize,
    ) -> Result<WorkflowStep, DefinitionError> {
        let (kind, spec) = match step {
            StepSpec::Click(a) => (ActionKind::Click, a),
            StepSpec::Fill(a) => (ActionKind::Fill, a),
            StepSpec::Select(a) => (ActionKind::Select, a),
            StepSpec::Check(a) => (ActionKind::Check, a),
            StepSpec::Navigate(path) => return Ok(WorkflowStep::Navigate(path.clone())),
            StepSpec::Wait(condition) => {
                return Ok(WorkflowStep::Wait(condition.build(workflow, self.network_idle)?))
            }
            StepSpec::Verify(claim) => return Ok(WorkflowStep::Verify(claim.build(workflow)?)),
            StepSpec::Run(run) => {
                return Ok(WorkflowStep::Workflow {
                    workflow: Box::new(self.instantiate(&run.workflow, &run.vars, depth + 1)?),
                    creates: self.registration(run.creates.as_ref(), depth)?,
                })
            }
        };

        let mut action = Action::new(kind, spec.target.build(workflow)?, spec.text.clone())?;
        if let Some(pre) = &spec.precondition {
            action = action.with_precondition(pre.build(workflow, self.network_idle)?);
        }
        if let Some(post) = &spec.postcondition {
            action = action.with_postcondition(post.build(workflow, self.network_idle)?);
        }
        Ok(WorkflowStep::Action {
            action,
            creates: self.registration(spec.creates.as_ref(), depth)?,
        })
    }

    fn registration(
        &self,
        creates: Option<&CreatesSpec>,
        depth: usize,
    ) -> Result<Option<EntityRegistration>, DefinitionError> {
        creates
            .map(|c| {
                let cleanup = self.instantiate(&c.cleanup, &c.vars, depth + 1)?;
                Ok(EntityRegistration::new(c.kind.as_str(), c.key.as_str(), cleanup))
            })
            .transpose()
    }
}

/// Steps are single-key maps (`- click: {...}`), not YAML-tagged values.
fn parse_spec(name: &str, value: Value) -> Result<WorkflowSpec, DefinitionError> {
    serde_yaml_ng::with::singleton_map_recursive::deserialize(value).map_err(|e| {
        DefinitionError::Invalid {
            workflow: name.to_string(),
            message: e.to_string(),
        }
    })
}

/// `${...}` substitution over a YAML tree
struct Expander<'a> {
    workflow: &'a str,
    vars: &'a BTreeMap<String, String>,
    unique: HashMap<String, String>,
}

impl Expander<'_> {
    fn expand(&mut self, value: Value) -> Result<Value, DefinitionError> {
        Ok(match value {
            Value::String(s) => Value::String(self.expand_str(&s)?),
            Value::Sequence(items) => Value::Sequence(
                items
                    .into_iter()
                    .map(|v| self.expand(v))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Mapping(map) => {
                let mut out = serde_yaml_ng::Mapping::new();
                for (k, v) in map {
                    out.insert(k, self.expand(v)?);
                }
                Value::Mapping(out)
            }
            other => other,
        })
    }

    fn expand_str(&mut self, input: &str) -> Result<String, DefinitionError> {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                return Err(DefinitionError::Invalid {
                    workflow: self.workflow.to_string(),
                    message: format!("unterminated placeholder in {input:?}"),
                });
            };
            let token = after[..end].trim();
            if let Some(prefix) = token.strip_prefix("unique:") {
                let key = self
                    .unique
                    .entry(prefix.to_string())
                    .or_insert_with(|| unique_key(prefix));
                out.push_str(key);
            } else {
                let value = self.vars.get(token).ok_or_else(|| DefinitionError::UndefinedVariable {
                    workflow: self.workflow.to_string(),
                    name: token.to_string(),
                })?;
                out.push_str(value);
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}
