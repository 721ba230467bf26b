use fxhash::FxHashMap;
use serde::de::DeserializeOwned;
use std::sync::Arc;

use super::config::StageConfig;
use super::error::RegistryError;
use super::event::EventKind;
use super::graph::KindFilter;
use super::node::Node;
use super::stages::{KindFilterStage, Prescale, TriggerFilter};

/// Builds one kind of processing stage from its configuration
pub trait StageFactory: Send + Sync {
    fn create(&self, config: &StageConfig) -> Result<Box<dyn Node>, RegistryError>;
}

impl<F> StageFactory for F
where
    F: Fn(&StageConfig) -> Result<Box<dyn Node>, RegistryError> + Send + Sync,
{
    fn create(&self, config: &StageConfig) -> Result<Box<dyn Node>, RegistryError> {
        self(config)
    }
}

/// Maps stage kind names to their factories. Each collector owns its registry; there is
/// no process-wide table.
#[derive(Default, Clone)]
pub struct NodeRegistry {
    factories: FxHashMap<String, Arc<dyn StageFactory>>,
}

impl NodeRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry knowing `trigger_filter`, `kind_filter` and `prescale`
    pub fn with_builtin_stages() -> Self {
        let mut registry = Self::new();
        registry.register("trigger_filter", create_trigger_filter);
        registry.register("kind_filter", create_kind_filter);
        registry.register("prescale", create_prescale);
        registry
    }

    /// Register a factory, replacing any previous one of the same kind
    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: StageFactory + 'static,
    {
        if self
            .factories
            .insert(kind.to_string(), Arc::new(factory))
            .is_some()
        {
            spdlog::debug!("Stage kind {kind} was registered again; the new factory wins");
        }
    }

    pub fn create(&self, config: &StageConfig) -> Result<Box<dyn Node>, RegistryError> {
        self.factories
            .get(&config.kind)
            .ok_or_else(|| RegistryError::UnknownStageKind(config.kind.clone()))?
            .create(config)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered kind names, sorted
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

/// Read an optional parameter of a stage
pub fn param<T: DeserializeOwned>(
    config: &StageConfig,
    key: &str,
) -> Result<Option<T>, RegistryError> {
    match config.params.get(key) {
        Some(value) => serde_yaml::from_value(value.clone())
            .map(Some)
            .map_err(|e| bad_param(config, key, e.to_string())),
        None => Ok(None),
    }
}

/// Read a parameter the stage cannot do without
pub fn required_param<T: DeserializeOwned>(
    config: &StageConfig,
    key: &str,
) -> Result<T, RegistryError> {
    param(config, key)?.ok_or_else(|| bad_param(config, key, String::from("missing")))
}

fn bad_param(config: &StageConfig, key: &str, reason: String) -> RegistryError {
    RegistryError::BadParam {
        stage: config.name.clone(),
        param: key.to_string(),
        reason,
    }
}

fn create_trigger_filter(config: &StageConfig) -> Result<Box<dyn Node>, RegistryError> {
    let first: u32 = param(config, "first")?.unwrap_or(0);
    let last: u32 = param(config, "last")?.unwrap_or(u32::MAX);
    if first > last {
        return Err(bad_param(
            config,
            "last",
            format!("{last} is below first ({first})"),
        ));
    }
    Ok(Box::new(TriggerFilter::new(&config.name, first, last)))
}

fn create_kind_filter(config: &StageConfig) -> Result<Box<dyn Node>, RegistryError> {
    let kinds: Vec<String> = required_param(config, "kinds")?;
    if kinds.is_empty() {
        return Err(bad_param(config, "kinds", String::from("empty")));
    }
    let filter = KindFilter::only(kinds.iter().map(|kind| EventKind::from(kind.as_str())));
    Ok(Box::new(KindFilterStage::new(&config.name, filter)))
}

fn create_prescale(config: &StageConfig) -> Result<Box<dyn Node>, RegistryError> {
    let factor: u64 = required_param(config, "factor")?;
    if factor == 0 {
        return Err(bad_param(config, "factor", String::from("must be at least 1")));
    }
    Ok(Box::new(Prescale::new(&config.name, factor)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::node::{Context, Outcome};
    use std::collections::BTreeMap;

    fn stage(name: &str, kind: &str, params: &str) -> StageConfig {
        let params: BTreeMap<String, serde_yaml::Value> = if params.is_empty() {
            BTreeMap::new()
        } else {
            serde_yaml::from_str(params).unwrap()
        };
        StageConfig {
            name: name.to_string(),
            kind: kind.to_string(),
            params,
        }
    }

    #[test]
    fn test_builtin_kinds() {
        let registry = NodeRegistry::with_builtin_stages();
        assert_eq!(
            registry.kinds(),
            vec!["kind_filter", "prescale", "trigger_filter"]
        );
        assert!(matches!(
            registry.create(&stage("x", "histogram", "")),
            Err(RegistryError::UnknownStageKind(kind)) if kind == "histogram"
        ));
    }

    #[test]
    fn test_params_are_checked() {
        let registry = NodeRegistry::with_builtin_stages();
        assert!(registry
            .create(&stage("scaled", "prescale", "factor: 10"))
            .is_ok());
        assert!(matches!(
            registry.create(&stage("scaled", "prescale", "")),
            Err(RegistryError::BadParam { param, .. }) if param == "factor"
        ));
        assert!(matches!(
            registry.create(&stage("scaled", "prescale", "factor: many")),
            Err(RegistryError::BadParam { .. })
        ));
        assert!(matches!(
            registry.create(&stage("range", "trigger_filter", "{first: 9, last: 2}")),
            Err(RegistryError::BadParam { param, .. }) if param == "last"
        ));
    }

    #[test]
    fn test_created_stage_runs() {
        let registry = NodeRegistry::with_builtin_stages();
        let mut node = registry
            .create(&stage("range", "trigger_filter", "{first: 2, last: 2}"))
            .unwrap();
        assert_eq!(node.name(), "range");
        let (fatal_tx, _fatal_rx) = flume::unbounded();
        let mut ctx = Context::new("range", &fatal_tx);
        let inside = Event::new(EventKind::Sync, 0, 1).with_trigger(2).into_ref();
        let outside = Event::new(EventKind::Sync, 0, 1).with_trigger(3).into_ref();
        assert_eq!(node.process(inside, &mut ctx), Outcome::Continue);
        assert_eq!(node.process(outside, &mut ctx), Outcome::SkipEvent);
        assert_eq!(ctx.take_forwarded().len(), 1);
    }

    #[test]
    fn test_custom_factory() {
        let mut registry = NodeRegistry::new();
        registry.register("every_other", |config: &StageConfig| {
            Ok(Box::new(Prescale::new(&config.name, 2)) as Box<dyn Node>)
        });
        assert!(registry.contains("every_other"));
        assert!(registry.create(&stage("half", "every_other", "")).is_ok());
    }
}
