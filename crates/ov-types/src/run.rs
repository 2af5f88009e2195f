//! Pass specifications, run templates and fully resolved run configurations.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::artifact::{ContentHasher, Digest};
use crate::errors::SchemaError;
use crate::params::{Domain, ParamSetting, ParamValue};

/// Concrete values chosen by a search strategy, keyed by `pass.param`.
pub type Assignment = BTreeMap<String, ParamValue>;

/// Key under which a searchable parameter appears in an [`Assignment`].
pub fn search_key(pass_name: &str, param: &str) -> String {
    format!("{pass_name}.{param}")
}

/// One pass as authored in a run document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassSpec {
    /// Author-chosen name, unique within a run.
    pub name: String,
    #[serde(rename = "type")]
    pub pass_type: String,
    #[serde(default)]
    pub params: BTreeMap<String, ParamSetting>,
    /// Name of a data config supplying calibration samples.
    #[serde(default)]
    pub data_config: Option<String>,
    /// Ignore schema search defaults for this pass.
    #[serde(default)]
    pub disable_search: bool,
}

impl PassSpec {
    pub fn new(name: impl Into<String>, pass_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pass_type: pass_type.into(),
            params: BTreeMap::new(),
            data_config: None,
            disable_search: false,
        }
    }

    pub fn with_fixed(mut self, param: &str, value: impl Into<ParamValue>) -> Self {
        self.params
            .insert(param.to_string(), ParamSetting::Fixed(value.into()));
        self
    }

    pub fn with_search(mut self, param: &str, domain: Domain) -> Self {
        self.params
            .insert(param.to_string(), ParamSetting::Searchable(domain));
        self
    }

    pub fn with_data_config(mut self, name: &str) -> Self {
        self.data_config = Some(name.to_string());
        self
    }
}

/// A pass whose parameters have been validated against the registry.
/// Searchable parameters are still open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassTemplate {
    pub name: String,
    pub pass_type: String,
    pub params: BTreeMap<String, ParamSetting>,
    /// Schema defaults, preferred when search is disabled.
    pub defaults: BTreeMap<String, ParamValue>,
    pub informational: BTreeSet<String>,
    pub data_config: Option<String>,
}

/// The validated pass chain with its search space still unbound.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunTemplate {
    pub passes: Vec<PassTemplate>,
}

impl RunTemplate {
    pub fn new(passes: Vec<PassTemplate>) -> Self {
        Self { passes }
    }

    /// Searchable dimensions in pass order, then parameter name order.
    pub fn searchable(&self) -> Vec<(String, Domain)> {
        self.passes
            .iter()
            .flat_map(|pass| {
                pass.params.iter().filter_map(move |(param, setting)| match setting {
                    ParamSetting::Searchable(domain) => {
                        Some((search_key(&pass.name, param), domain.clone()))
                    }
                    ParamSetting::Fixed(_) => None,
                })
            })
            .collect()
    }

    pub fn is_fixed(&self) -> bool {
        self.searchable().is_empty()
    }

    /// Binding used when search is disabled: the schema default when the
    /// domain allows it, otherwise the domain's first value.
    pub fn fixed_assignment(&self) -> Assignment {
        let mut assignment = Assignment::new();
        for pass in &self.passes {
            for (param, setting) in &pass.params {
                if let ParamSetting::Searchable(domain) = setting {
                    let value = pass
                        .defaults
                        .get(param)
                        .filter(|d| domain.contains(d))
                        .cloned()
                        .or_else(|| domain.first());
                    if let Some(value) = value {
                        assignment.insert(search_key(&pass.name, param), value);
                    }
                }
            }
        }
        assignment
    }

    /// Bind every searchable parameter and produce an immutable [`RunConfig`].
    pub fn bind(&self, assignment: &Assignment) -> Result<RunConfig, SchemaError> {
        let mut used = 0usize;
        let mut passes = Vec::with_capacity(self.passes.len());

        for pass in &self.passes {
            let mut params = BTreeMap::new();
            for (param, setting) in &pass.params {
                let value = match setting {
                    ParamSetting::Fixed(v) => v.clone(),
                    ParamSetting::Searchable(domain) => {
                        let key = search_key(&pass.name, param);
                        let value = assignment.get(&key).ok_or_else(|| {
                            SchemaError::MissingParameter {
                                pass_type: pass.pass_type.clone(),
                                parameter: key.clone(),
                            }
                        })?;
                        if !domain.contains(value) {
                            return Err(SchemaError::InvalidValue {
                                pass_type: pass.pass_type.clone(),
                                parameter: param.clone(),
                                message: format!("{value} is outside the search domain"),
                            });
                        }
                        used += 1;
                        value.clone()
                    }
                };
                params.insert(param.clone(), value);
            }
            passes.push(ResolvedPass {
                name: pass.name.clone(),
                pass_type: pass.pass_type.clone(),
                params,
                informational: pass.informational.clone(),
                data_config: pass.data_config.clone(),
            });
        }

        if used != assignment.len() {
            return Err(SchemaError::Invalid {
                message: format!(
                    "assignment binds {} values but the template has {} searchable parameters",
                    assignment.len(),
                    used
                ),
            });
        }

        Ok(RunConfig::new(passes, assignment.clone()))
    }
}

/// One pass with every parameter bound to a concrete value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedPass {
    pub name: String,
    pub pass_type: String,
    pub params: BTreeMap<String, ParamValue>,
    #[serde(default)]
    pub informational: BTreeSet<String>,
    #[serde(default)]
    pub data_config: Option<String>,
}

impl ResolvedPass {
    pub fn get(&self, param: &str) -> Option<&ParamValue> {
        self.params.get(param)
    }

    /// Digest over the pass type and every output-affecting parameter.
    pub fn identity_digest(&self) -> Digest {
        let mut hasher = ContentHasher::new("olivine.pass");
        hasher.str(&self.pass_type);
        for (name, value) in &self.params {
            if self.informational.contains(name) {
                continue;
            }
            hasher.str(name).str(&canonical(value));
        }
        hasher.str(self.data_config.as_deref().unwrap_or(""));
        hasher.finish()
    }
}

/// Type-tagged rendering so `4` and `"4"` hash differently.
fn canonical(value: &ParamValue) -> String {
    match value {
        ParamValue::Bool(v) => format!("b:{v}"),
        ParamValue::Int(v) => format!("i:{v}"),
        ParamValue::Float(v) => format!("f:{v:?}"),
        ParamValue::Str(v) => format!("s:{v}"),
        ParamValue::Json(v) => format!("j:{v}"),
    }
}

/// Identity of a [`RunConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunConfigId(pub Digest);

impl RunConfigId {
    pub fn short(&self) -> String {
        self.0.short()
    }
}

impl fmt::Display for RunConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One full pipeline instantiation. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub id: RunConfigId,
    pub passes: Vec<ResolvedPass>,
    /// The search assignment this configuration was bound from.
    pub assignment: Assignment,
}

impl RunConfig {
    pub fn new(passes: Vec<ResolvedPass>, assignment: Assignment) -> Self {
        let mut hasher = ContentHasher::new("olivine.run");
        for pass in &passes {
            hasher.digest(&pass.identity_digest());
        }
        Self {
            id: RunConfigId(hasher.finish()),
            passes,
            assignment,
        }
    }

    /// The configuration of the unmodified input model.
    pub fn empty() -> Self {
        Self::new(Vec::new(), Assignment::new())
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    /// Compact human-readable rendering of the search choices.
    pub fn describe(&self) -> String {
        if self.assignment.is_empty() {
            return if self.passes.is_empty() {
                "<input model>".to_string()
            } else {
                "<fixed pipeline>".to_string()
            };
        }
        self.assignment
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}
