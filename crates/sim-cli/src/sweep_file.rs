use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use sim_core::{AnalyzerBinding, Tags};
use sim_runner::{NewExperiment, Sweep};
use std::fs;
use std::path::Path;

/// A `run` input file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepFile {
    pub name: String,
    /// Launch command line; `{config}` is replaced by the job config path.
    pub command: String,
    #[serde(default)]
    pub suite_id: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default = "empty_object")]
    pub base: Value,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default)]
    pub sweep: Option<SweepSection>,
    #[serde(default)]
    pub analyzers: Vec<AnalyzerBinding>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepSection {
    /// Parameter -> values, expanded in file order.
    #[serde(default)]
    pub cartesian: Option<serde_yaml::Mapping>,
    #[serde(default)]
    pub list: Option<ListSection>,
    /// Repeats every job with `Run_Number` 0..runs.
    #[serde(default)]
    pub runs: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListSection {
    pub params: Vec<String>,
    pub values: Vec<Vec<Value>>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl SweepFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading sweep file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing sweep file {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn new_experiment(&self) -> NewExperiment {
        NewExperiment {
            name: self.name.clone(),
            command_line: self.command.clone(),
            suite_id: self.suite_id.clone(),
            revision: self.revision.clone(),
            analyzers: self.analyzers.clone(),
        }
    }

    pub fn to_sweep(&self) -> Result<Sweep> {
        let section = self.sweep.as_ref();
        let cartesian = section.and_then(|s| s.cartesian.as_ref());
        let list = section.and_then(|s| s.list.as_ref());
        let runs = section.and_then(|s| s.runs);

        let sweep = match (cartesian, list) {
            (Some(_), Some(_)) => bail!("sweep.cartesian and sweep.list are mutually exclusive"),
            (Some(map), None) => {
                let mut params = cartesian_params(map)?;
                if let Some(n) = runs {
                    params.push(("Run_Number".to_string(), (0..n).map(Value::from).collect()));
                }
                Sweep::cartesian(self.base.clone(), &params)
            }
            (None, Some(list)) => {
                if runs.is_some() {
                    bail!("sweep.runs cannot be combined with sweep.list");
                }
                Sweep::from_list(self.base.clone(), &list.params, &list.values)?
            }
            (None, None) => match runs {
                Some(n) => Sweep::run_numbers(self.base.clone(), n),
                None => Sweep::single(self.base.clone()),
            },
        };
        Ok(sweep.with_tags(self.tags.clone()))
    }
}

fn cartesian_params(map: &serde_yaml::Mapping) -> Result<Vec<(String, Vec<Value>)>> {
    let mut params = Vec::with_capacity(map.len());
    for (key, values) in map {
        let key = key
            .as_str()
            .ok_or_else(|| anyhow!("sweep.cartesian keys must be strings"))?;
        let values = match serde_json::to_value(values)? {
            Value::Array(items) => items,
            single => vec![single],
        };
        if values.is_empty() {
            bail!("sweep.cartesian.{} has no values", key);
        }
        params.push((key.to_string(), values));
    }
    Ok(params)
}
