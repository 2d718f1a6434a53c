use crate::analyzer::{Analyzer, AnalyzerRegistry, RenderContext, SimulationOutput, TagMatcher};
use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use sim_core::fsutil::{atomic_write_bytes, atomic_write_json_pretty, load_json_file};
use sim_core::{AnalyzerBinding, Tags};
use std::collections::BTreeMap;
use std::fs;

pub fn register_builtins(registry: &mut AnalyzerRegistry) {
    registry.register(
        "stdout",
        1,
        "line counts and last line of each simulation's StdOut.txt",
        StdoutAnalyzer::build,
    );
    registry.register(
        "json_channel",
        1,
        "count/mean/min/max of a numeric value read from a JSON output file",
        JsonChannelAnalyzer::build,
    );
}

pub struct StdoutAnalyzer {
    args: Value,
    matcher: TagMatcher,
}

impl StdoutAnalyzer {
    pub fn build(args: &Value) -> Result<Box<dyn Analyzer>> {
        Ok(Box::new(Self {
            args: args.clone(),
            matcher: TagMatcher::from_args(args)?,
        }))
    }
}

impl Analyzer for StdoutAnalyzer {
    fn name(&self) -> &str {
        "stdout"
    }

    fn binding(&self) -> AnalyzerBinding {
        AnalyzerBinding::new("stdout", 1, self.args.clone())
    }

    fn filter(&self, tags: &Tags) -> bool {
        self.matcher.matches(tags)
    }

    fn apply(&self, output: &SimulationOutput) -> Result<Value> {
        let path = output.dir.join("StdOut.txt");
        let raw = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let last = raw
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| l.trim().to_string());
        Ok(json!({"lines": raw.lines().count(), "last": last}))
    }

    fn combine(&mut self, results: &BTreeMap<String, Value>) -> Result<Value> {
        let per_sim = results
            .iter()
            .map(|(id, v)| (id.clone(), v.get("lines").cloned().unwrap_or(json!(0))))
            .collect::<serde_json::Map<_, _>>();
        let total = per_sim.values().filter_map(Value::as_u64).sum::<u64>();
        Ok(json!({"simulations": results.len(), "total_lines": total, "lines": per_sim}))
    }

    fn render(&self, summary: &Value, ctx: &RenderContext) -> Result<()> {
        atomic_write_json_pretty(&ctx.output_dir.join("stdout_summary.json"), summary)?;
        Ok(())
    }
}

pub struct JsonChannelAnalyzer {
    args: Value,
    file: String,
    pointer: String,
    label: String,
    matcher: TagMatcher,
}

impl JsonChannelAnalyzer {
    pub fn build(args: &Value) -> Result<Box<dyn Analyzer>> {
        let file = args
            .get("file")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("json_channel requires a 'file' argument"))?;
        let pointer = args
            .get("pointer")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("json_channel requires a 'pointer' argument"))?;
        if !pointer.is_empty() && !pointer.starts_with('/') {
            return Err(anyhow!("pointer must start with '/': {}", pointer));
        }
        let label = args
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or("json_channel")
            .to_string();
        Ok(Box::new(Self {
            args: args.clone(),
            file: file.to_string(),
            pointer: pointer.to_string(),
            label,
            matcher: TagMatcher::from_args(args)?,
        }))
    }
}

impl Analyzer for JsonChannelAnalyzer {
    fn name(&self) -> &str {
        &self.label
    }

    fn binding(&self) -> AnalyzerBinding {
        AnalyzerBinding::new("json_channel", 1, self.args.clone())
    }

    fn filter(&self, tags: &Tags) -> bool {
        self.matcher.matches(tags)
    }

    fn apply(&self, output: &SimulationOutput) -> Result<Value> {
        let path = output.dir.join(&self.file);
        let doc = load_json_file(&path).with_context(|| format!("reading {}", path.display()))?;
        let value = doc
            .pointer(&self.pointer)
            .and_then(Value::as_f64)
            .ok_or_else(|| anyhow!("{} has no number at {}", path.display(), self.pointer))?;
        Ok(json!(value))
    }

    fn combine(&mut self, results: &BTreeMap<String, Value>) -> Result<Value> {
        let values = results
            .iter()
            .filter_map(|(id, v)| v.as_f64().map(|x| (id.clone(), x)))
            .collect::<BTreeMap<_, _>>();
        Ok(json!({"values": values}))
    }

    fn finalize(&mut self, aggregate: Value) -> Result<Value> {
        let values = aggregate
            .get("values")
            .and_then(Value::as_object)
            .map(|m| m.values().filter_map(Value::as_f64).collect::<Vec<_>>())
            .unwrap_or_default();
        let count = values.len();
        let (mean, min, max) = if count == 0 {
            (Value::Null, Value::Null, Value::Null)
        } else {
            let sum = values.iter().sum::<f64>();
            let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            (json!(sum / count as f64), json!(min), json!(max))
        };
        Ok(json!({
            "count": count,
            "mean": mean,
            "min": min,
            "max": max,
            "values": aggregate.get("values").cloned().unwrap_or(json!({})),
        }))
    }

    fn render(&self, summary: &Value, ctx: &RenderContext) -> Result<()> {
        let mut csv = String::from("sim_id,value\n");
        if let Some(values) = summary.get("values").and_then(Value::as_object) {
            for (id, v) in values {
                csv.push_str(&format!("{},{}\n", id, v));
            }
        }
        atomic_write_bytes(&ctx.output_dir.join(format!("{}.csv", self.label)), csv.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sim_core::fsutil::ensure_dir;
    use std::path::PathBuf;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "simtools_builtin_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp root");
        root
    }

    fn output(root: &std::path::Path, id: &str) -> SimulationOutput {
        SimulationOutput {
            sim_id: id.to_string(),
            experiment_id: "e1".to_string(),
            dir: root.join(id),
            tags: Tags::new(),
        }
    }

    #[test]
    fn stdout_counts_lines_and_renders_summary() {
        let root = temp_root("stdout");
        atomic_write_bytes(&root.join("s1").join("StdOut.txt"), b"a\nb\nfinished\n").expect("out");
        let mut analyzer = StdoutAnalyzer::build(&json!({})).expect("build");
        let one = analyzer.apply(&output(&root, "s1")).expect("apply");
        assert_eq!(one["lines"], json!(3));
        assert_eq!(one["last"], json!("finished"));
        assert!(analyzer.apply(&output(&root, "missing")).is_err());

        let results = [("s1".to_string(), one)].into_iter().collect::<BTreeMap<_, _>>();
        let combined = analyzer.combine(&results).expect("combine");
        let summary = analyzer.finalize(combined).expect("finalize");
        assert_eq!(summary["total_lines"], json!(3));
        let ctx = RenderContext {
            output_dir: root.join("analysis"),
            experiment_ids: vec!["e1".into()],
        };
        analyzer.render(&summary, &ctx).expect("render");
        assert!(root.join("analysis").join("stdout_summary.json").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn json_channel_reduces_to_statistics_and_csv() {
        let root = temp_root("channel");
        for (id, v) in [("s1", 1.0), ("s2", 3.0), ("s3", 8.0)] {
            atomic_write_json_pretty(
                &root.join(id).join("output.json"),
                &json!({"Channels": {"Prevalence": v}}),
            )
            .expect("seed");
        }
        let mut analyzer = JsonChannelAnalyzer::build(
            &json!({"file": "output.json", "pointer": "/Channels/Prevalence", "label": "prev"}),
        )
        .expect("build");
        assert_eq!(analyzer.name(), "prev");
        let results = ["s1", "s2", "s3"]
            .iter()
            .map(|id| {
                (
                    id.to_string(),
                    analyzer.apply(&output(&root, id)).expect("apply"),
                )
            })
            .collect::<BTreeMap<_, _>>();
        let combined = analyzer.combine(&results).expect("combine");
        let summary = analyzer.finalize(combined).expect("finalize");
        assert_eq!(summary["count"], json!(3));
        assert_eq!(summary["mean"], json!(4.0));
        assert_eq!(summary["min"], json!(1.0));
        assert_eq!(summary["max"], json!(8.0));

        let ctx = RenderContext {
            output_dir: root.join("analysis"),
            experiment_ids: vec!["e1".into()],
        };
        analyzer.render(&summary, &ctx).expect("render");
        let csv = fs::read_to_string(root.join("analysis").join("prev.csv")).expect("csv");
        assert_eq!(csv, "sim_id,value\ns1,1.0\ns2,3.0\ns3,8.0\n");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn json_channel_rejects_non_numeric_values() {
        let root = temp_root("nonnumeric");
        atomic_write_json_pretty(&root.join("s1").join("output.json"), &json!({"x": "high"}))
            .expect("seed");
        let analyzer =
            JsonChannelAnalyzer::build(&json!({"file": "output.json", "pointer": "/x"})).expect("build");
        let err = analyzer.apply(&output(&root, "s1")).expect_err("not a number");
        assert!(err.to_string().contains("has no number at /x"));
        assert!(JsonChannelAnalyzer::build(&json!({"file": "o.json", "pointer": "x"})).is_err());
        let _ = fs::remove_dir_all(root);
    }
}
