use anyhow::{anyhow, bail, Result};
use serde_json::{Map, Value};
use sim_core::{SimulationDraft, Tags};
use std::sync::Arc;

/// Mutates one job's configuration and reports the tags describing the
/// change.
pub type Modifier = Arc<dyn Fn(&mut Value) -> Result<Tags> + Send + Sync>;

/// Sets `key` to `value`. Keys starting with `/` address a nested field as a
/// JSON pointer (missing objects are created) and are tagged by their last
/// segment.
pub fn param_modifier(key: &str, value: Value) -> Modifier {
    let key = key.to_string();
    Arc::new(move |config: &mut Value| {
        let tag = if key.starts_with('/') {
            set_pointer(config, &key, value.clone())?;
            key.rsplit('/')
                .next()
                .map(unescape_segment)
                .unwrap_or_else(|| key.clone())
        } else {
            let obj = config
                .as_object_mut()
                .ok_or_else(|| anyhow!("base configuration must be an object to set '{}'", key))?;
            obj.insert(key.clone(), value.clone());
            key.clone()
        };
        let mut tags = Tags::new();
        tags.insert(tag, value.clone());
        Ok(tags)
    })
}

fn unescape_segment(seg: &str) -> String {
    seg.replace("~1", "/").replace("~0", "~")
}

fn set_pointer(doc: &mut Value, pointer: &str, value: Value) -> Result<()> {
    let segments = pointer
        .split('/')
        .skip(1)
        .map(unescape_segment)
        .collect::<Vec<_>>();
    let Some((last, parents)) = segments.split_last() else {
        bail!("empty pointer");
    };
    let mut cur = doc;
    for seg in parents {
        if cur.is_null() {
            *cur = Value::Object(Map::new());
        }
        cur = match cur {
            Value::Object(map) => map
                .entry(seg.clone())
                .or_insert_with(|| Value::Object(Map::new())),
            Value::Array(items) => {
                let idx = seg
                    .parse::<usize>()
                    .map_err(|_| anyhow!("'{}' is not an array index in {}", seg, pointer))?;
                items
                    .get_mut(idx)
                    .ok_or_else(|| anyhow!("index {} out of range in {}", idx, pointer))?
            }
            _ => bail!("cannot descend into scalar at '{}' in {}", seg, pointer),
        };
    }
    if cur.is_null() {
        *cur = Value::Object(Map::new());
    }
    match cur {
        Value::Object(map) => {
            map.insert(last.clone(), value);
        }
        Value::Array(items) => {
            let idx = last
                .parse::<usize>()
                .map_err(|_| anyhow!("'{}' is not an array index in {}", last, pointer))?;
            let slot = items
                .get_mut(idx)
                .ok_or_else(|| anyhow!("index {} out of range in {}", idx, pointer))?;
            *slot = value;
        }
        _ => bail!("cannot set '{}' on a scalar in {}", last, pointer),
    }
    Ok(())
}

/// A base configuration plus one modifier list per job.
#[derive(Clone)]
pub struct Sweep {
    pub base: Value,
    pub tags: Tags,
    pub jobs: Vec<Vec<Modifier>>,
}

impl Sweep {
    pub fn single(base: Value) -> Self {
        Self {
            base,
            tags: Tags::new(),
            jobs: vec![Vec::new()],
        }
    }

    pub fn run_numbers(base: Value, n: usize) -> Self {
        Self {
            base,
            tags: Tags::new(),
            jobs: (0..n)
                .map(|i| vec![param_modifier("Run_Number", Value::from(i))])
                .collect(),
        }
    }

    /// Cartesian product over parameters, first parameter varying slowest.
    pub fn cartesian(base: Value, params: &[(String, Vec<Value>)]) -> Self {
        let mut jobs: Vec<Vec<Modifier>> = vec![Vec::new()];
        for (key, values) in params {
            let mut next = Vec::with_capacity(jobs.len() * values.len());
            for job in &jobs {
                for value in values {
                    let mut extended = job.clone();
                    extended.push(param_modifier(key, value.clone()));
                    next.push(extended);
                }
            }
            jobs = next;
        }
        Self {
            base,
            tags: Tags::new(),
            jobs,
        }
    }

    /// One job per row of `combos`, pairing each value with `params`.
    pub fn from_list(base: Value, params: &[String], combos: &[Vec<Value>]) -> Result<Self> {
        let mut jobs = Vec::with_capacity(combos.len());
        for (row, combo) in combos.iter().enumerate() {
            if combo.len() != params.len() {
                bail!(
                    "sweep row {} has {} values for {} parameters",
                    row,
                    combo.len(),
                    params.len()
                );
            }
            jobs.push(
                params
                    .iter()
                    .zip(combo)
                    .map(|(k, v)| param_modifier(k, v.clone()))
                    .collect(),
            );
        }
        Ok(Self {
            base,
            tags: Tags::new(),
            jobs,
        })
    }

    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Applies one job's modifiers to a fresh copy of the base configuration.
    pub fn materialize(&self, modifiers: &[Modifier]) -> Result<SimulationDraft> {
        let mut config = self.base.clone();
        let mut tags = self.tags.clone();
        for modifier in modifiers {
            tags.extend(modifier(&mut config)?);
        }
        Ok(SimulationDraft { tags, config })
    }
}
