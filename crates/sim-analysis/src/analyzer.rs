use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sim_core::{AnalyzerBinding, Error, Tags};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Handle on one simulation's outputs, as resolved by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationOutput {
    pub sim_id: String,
    pub experiment_id: String,
    pub dir: PathBuf,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderContext {
    pub output_dir: PathBuf,
    pub experiment_ids: Vec<String>,
}

/// Scatter/gather analysis capability.
///
/// `apply` runs concurrently on many simulations and must not mutate the
/// analyzer; `combine` and `finalize` run once per analysis after every
/// `apply` has resolved.
pub trait Analyzer: Send + Sync {
    fn name(&self) -> &str;

    fn binding(&self) -> AnalyzerBinding;

    fn filter(&self, _tags: &Tags) -> bool {
        true
    }

    fn apply(&self, output: &SimulationOutput) -> Result<Value>;

    fn combine(&mut self, results: &BTreeMap<String, Value>) -> Result<Value>;

    fn finalize(&mut self, aggregate: Value) -> Result<Value> {
        Ok(aggregate)
    }

    fn render(&self, _summary: &Value, _ctx: &RenderContext) -> Result<()> {
        Ok(())
    }
}

pub type AnalyzerCtor = fn(&Value) -> Result<Box<dyn Analyzer>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryEntry {
    pub name: String,
    pub version: u32,
    pub description: String,
}

/// Stable name/version to constructor mapping, used to rebuild analyzers
/// from persisted bindings.
#[derive(Clone, Default)]
pub struct AnalyzerRegistry {
    entries: BTreeMap<(String, u32), (AnalyzerCtor, String)>,
}

impl AnalyzerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::builtin::register_builtins(&mut registry);
        registry
    }

    pub fn register(&mut self, name: &str, version: u32, description: &str, ctor: AnalyzerCtor) {
        self.entries
            .insert((name.to_string(), version), (ctor, description.to_string()));
    }

    pub fn latest_version(&self, name: &str) -> Option<u32> {
        self.entries
            .keys()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| *v)
            .max()
    }

    pub fn build(&self, binding: &AnalyzerBinding) -> sim_core::Result<Box<dyn Analyzer>> {
        let (ctor, _) = self
            .entries
            .get(&(binding.name.clone(), binding.version))
            .ok_or_else(|| {
                Error::Config(format!("no analyzer registered as {}", binding.key()))
            })?;
        ctor(&binding.args)
            .map_err(|e| Error::Config(format!("analyzer {}: {}", binding.key(), e)))
    }

    pub fn list(&self) -> Vec<RegistryEntry> {
        self.entries
            .iter()
            .map(|((name, version), (_, description))| RegistryEntry {
                name: name.clone(),
                version: *version,
                description: description.clone(),
            })
            .collect()
    }
}

/// Tag equality predicate built from an analyzer's `where` argument.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagMatcher(BTreeMap<String, Value>);

impl TagMatcher {
    pub fn from_args(args: &Value) -> Result<Self> {
        match args.get("where") {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(Value::Object(map)) => Ok(Self(
                map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            )),
            Some(other) => anyhow::bail!("'where' must be an object, got {}", other),
        }
    }

    pub fn matches(&self, tags: &Tags) -> bool {
        self.0.iter().all(|(k, v)| tags.get(k) == Some(v))
    }
}
