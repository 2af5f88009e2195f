//! Registries of pass types, metric implementations and data providers.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use ov_types::{
    Assignment, DataConfig, DataProvider, Metric, ParamSetting, ParamValue, Pass, PassSchema,
    PassSpec, PassTemplate, ResolvedPass, RunTemplate, SchemaError,
};

/// Pass type name to schema and implementation.
///
/// Schemas and implementations are registered separately so a document can be
/// validated on a machine that cannot run the passes.
#[derive(Default)]
pub struct PassRegistry {
    schemas: BTreeMap<String, PassSchema>,
    implementations: HashMap<String, Arc<dyn Pass>>,
}

impl PassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a pass type. Defaults and search defaults are checked against
    /// their declared types here, once.
    pub fn register(&mut self, pass_type: &str, schema: PassSchema) -> Result<(), SchemaError> {
        if self.schemas.contains_key(pass_type) {
            return Err(SchemaError::DuplicateName {
                kind: "pass type".into(),
                name: pass_type.to_string(),
            });
        }
        for (name, param) in &schema.params {
            if let Some(default) = &param.default {
                param
                    .param_type
                    .coerce(default)
                    .map_err(|message| SchemaError::InvalidValue {
                        pass_type: pass_type.to_string(),
                        parameter: name.clone(),
                        message,
                    })?;
            }
            if let Some(domain) = &param.search_default {
                let invalid_domain = |message: String| SchemaError::InvalidDomain {
                    pass_type: pass_type.to_string(),
                    parameter: name.clone(),
                    message,
                };
                if !param.affects_output {
                    return Err(invalid_domain(
                        "informational parameters cannot have a search domain".to_string(),
                    ));
                }
                param.param_type.coerce_domain(domain).map_err(invalid_domain)?;
            }
        }
        self.schemas.insert(pass_type.to_string(), schema);
        Ok(())
    }

    pub fn bind(&mut self, pass_type: &str, implementation: Arc<dyn Pass>) {
        self.implementations
            .insert(pass_type.to_string(), implementation);
    }

    /// `register` followed by `bind`.
    pub fn with_pass(
        mut self,
        pass_type: &str,
        schema: PassSchema,
        implementation: Arc<dyn Pass>,
    ) -> Result<Self, SchemaError> {
        self.register(pass_type, schema)?;
        self.bind(pass_type, implementation);
        Ok(self)
    }

    pub fn schema(&self, pass_type: &str) -> Option<&PassSchema> {
        self.schemas.get(pass_type)
    }

    pub fn implementation(&self, pass_type: &str) -> Option<Arc<dyn Pass>> {
        self.implementations.get(pass_type).cloned()
    }

    pub fn pass_types(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    /// Validate literal parameter values for a pass type and fill defaults.
    pub fn resolve(
        &self,
        pass_type: &str,
        params: &BTreeMap<String, ParamValue>,
    ) -> Result<ResolvedPass, SchemaError> {
        let mut spec = PassSpec::new(pass_type, pass_type);
        spec.disable_search = true;
        spec.params = params
            .iter()
            .map(|(k, v)| (k.clone(), ParamSetting::Fixed(v.clone())))
            .collect();

        let template = RunTemplate::new(vec![self.template_for(&spec)?]);
        let mut config = template.bind(&Assignment::new())?;
        config.passes.pop().ok_or_else(|| SchemaError::Invalid {
            message: format!("{pass_type} resolved to no pass"),
        })
    }

    /// Check a pass as written in a document against its schema.
    ///
    /// Omitted parameters take their schema search domain (unless search is
    /// disabled for the pass), then their default. Optional parameters with
    /// neither are left out.
    pub fn template_for(&self, spec: &PassSpec) -> Result<PassTemplate, SchemaError> {
        let schema = self
            .schema(&spec.pass_type)
            .ok_or_else(|| SchemaError::UnknownPassType {
                pass_type: spec.pass_type.clone(),
            })?;

        if let Some(unknown) = spec.params.keys().find(|k| !schema.params.contains_key(*k)) {
            return Err(SchemaError::UnknownParameter {
                pass_type: spec.pass_type.clone(),
                parameter: unknown.clone(),
            });
        }

        let mut params = BTreeMap::new();
        let mut defaults = BTreeMap::new();
        let mut informational = BTreeSet::new();

        for (name, param) in &schema.params {
            let invalid_value = |message: String| SchemaError::InvalidValue {
                pass_type: spec.pass_type.clone(),
                parameter: name.clone(),
                message,
            };
            let invalid_domain = |message: String| SchemaError::InvalidDomain {
                pass_type: spec.pass_type.clone(),
                parameter: name.clone(),
                message,
            };

            if !param.affects_output {
                informational.insert(name.clone());
            }
            if let Some(default) = &param.default {
                defaults.insert(name.clone(), param.param_type.coerce(default).map_err(invalid_value)?);
            }

            let setting = match spec.params.get(name) {
                Some(ParamSetting::Fixed(value)) => {
                    Some(ParamSetting::Fixed(param.param_type.coerce(value).map_err(invalid_value)?))
                }
                Some(ParamSetting::Searchable(_)) if !param.affects_output => {
                    return Err(invalid_domain(
                        "informational parameters do not affect the output and cannot be searched"
                            .to_string(),
                    ))
                }
                Some(ParamSetting::Searchable(domain)) => Some(ParamSetting::Searchable(
                    param.param_type.coerce_domain(domain).map_err(invalid_domain)?,
                )),
                None if param.required => {
                    return Err(SchemaError::MissingParameter {
                        pass_type: spec.pass_type.clone(),
                        parameter: name.clone(),
                    })
                }
                None => match (&param.search_default, defaults.get(name)) {
                    (Some(domain), _) if !spec.disable_search => Some(ParamSetting::Searchable(
                        param.param_type.coerce_domain(domain).map_err(invalid_domain)?,
                    )),
                    (_, Some(default)) => Some(ParamSetting::Fixed(default.clone())),
                    _ => None,
                },
            };
            if let Some(setting) = setting {
                params.insert(name.clone(), setting);
            }
        }

        Ok(PassTemplate {
            name: spec.name.clone(),
            pass_type: spec.pass_type.clone(),
            params,
            defaults,
            informational,
            data_config: spec.data_config.clone(),
        })
    }
}

/// Metric type name to implementation.
#[derive(Default)]
pub struct MetricRegistry {
    metrics: HashMap<String, Arc<dyn Metric>>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, metric_type: &str, metric: Arc<dyn Metric>) {
        self.metrics.insert(metric_type.to_string(), metric);
    }

    pub fn with_metric(mut self, metric_type: &str, metric: Arc<dyn Metric>) -> Self {
        self.register(metric_type, metric);
        self
    }

    pub fn get(&self, metric_type: &str) -> Option<Arc<dyn Metric>> {
        self.metrics.get(metric_type).cloned()
    }
}

/// Builds a provider from the `params` of a data config.
pub type DataFactory =
    Arc<dyn Fn(&serde_json::Value) -> Result<Arc<dyn DataProvider>, String> + Send + Sync>;

/// Data config type name to provider factory.
#[derive(Default)]
pub struct DataRegistry {
    factories: HashMap<String, DataFactory>,
}

impl DataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, data_type: &str, factory: F)
    where
        F: Fn(&serde_json::Value) -> Result<Arc<dyn DataProvider>, String> + Send + Sync + 'static,
    {
        self.factories
            .insert(data_type.to_string(), Arc::new(factory));
    }

    pub fn has(&self, data_type: &str) -> bool {
        self.factories.contains_key(data_type)
    }

    pub fn create(&self, name: &str, config: &DataConfig) -> Result<Arc<dyn DataProvider>, SchemaError> {
        let factory = self
            .factories
            .get(&config.data_type)
            .ok_or_else(|| SchemaError::MissingImplementation {
                kind: "data config type".into(),
                name: config.data_type.clone(),
            })?;
        factory(&config.params).map_err(|message| SchemaError::Invalid {
            message: format!("data config {name}: {message}"),
        })
    }
}

/// Everything an engine needs to look up by name.
#[derive(Default)]
pub struct Registries {
    pub passes: PassRegistry,
    pub metrics: MetricRegistry,
    pub data: DataRegistry,
}

impl Registries {
    pub fn new(passes: PassRegistry, metrics: MetricRegistry) -> Self {
        Self {
            passes,
            metrics,
            data: DataRegistry::new(),
        }
    }

    pub fn with_data(mut self, data: DataRegistry) -> Self {
        self.data = data;
        self
    }
}
