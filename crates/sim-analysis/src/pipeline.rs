use crate::analyzer::{Analyzer, RenderContext, SimulationOutput};
use crate::render::{render_isolated, RenderMode, RenderStatus};
use anyhow::{anyhow, Result};
use rayon::prelude::*;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobFailure {
    pub sim_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyzerResult {
    pub name: String,
    pub version: u32,
    pub summary: Option<Value>,
    pub contributing: Vec<String>,
    pub failures: Vec<JobFailure>,
    /// combine/finalize error; the summary is absent when set.
    pub error: Option<String>,
    pub render: RenderStatus,
}

/// A simulation that never reached the analyzers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Exclusion {
    pub sim_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub analyzers: Vec<AnalyzerResult>,
    /// Simulations no analyzer selected.
    pub skipped: Vec<String>,
    /// Simulations left out before filtering: unfinished, unsuccessful or
    /// without a resolvable output location.
    pub excluded: Vec<Exclusion>,
}

impl AnalysisReport {
    pub fn failure_count(&self) -> usize {
        self.analyzers.iter().map(|a| a.failures.len()).sum()
    }

    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        for a in &self.analyzers {
            for f in &a.failures {
                out.push(format!("{}: simulation {} failed: {}", a.name, f.sim_id, f.error));
            }
            if let Some(e) = &a.error {
                out.push(format!("{}: aggregation failed: {}", a.name, e));
            }
            if let RenderStatus::Failed(e) = &a.render {
                out.push(format!("{}: render failed: {}", a.name, e));
            }
        }
        for x in &self.excluded {
            out.push(format!("simulation {} not analyzed: {}", x.sim_id, x.reason));
        }
        out
    }
}

/// Filter, parallel apply, barrier, then combine/finalize/render per
/// analyzer.
pub struct AnalysisPipeline {
    max_threads: usize,
    render: RenderMode,
}

impl AnalysisPipeline {
    pub fn new(max_threads: usize, render: RenderMode) -> Self {
        Self {
            max_threads: max_threads.max(1),
            render,
        }
    }

    pub fn run(
        &self,
        outputs: &[SimulationOutput],
        mut analyzers: Vec<Box<dyn Analyzer>>,
        ctx: &RenderContext,
    ) -> Result<AnalysisReport> {
        let mut report = AnalysisReport::default();

        let mut tasks: Vec<(&SimulationOutput, Vec<usize>)> = Vec::new();
        for output in outputs {
            let mut tags = output.tags.clone();
            tags.insert("sim_id".to_string(), Value::String(output.sim_id.clone()));
            let matching = analyzers
                .iter()
                .enumerate()
                .filter(|(_, a)| a.filter(&tags))
                .map(|(i, _)| i)
                .collect::<Vec<_>>();
            if matching.is_empty() {
                report.skipped.push(output.sim_id.clone());
            } else {
                tasks.push((output, matching));
            }
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.max_threads)
            .thread_name(|i| format!("simtools-analysis-{}", i))
            .build()
            .map_err(|e| anyhow!("analysis worker pool: {}", e))?;
        let shared: &[Box<dyn Analyzer>] = &analyzers;
        // collect() is the barrier: every apply resolves before aggregation.
        let applied: Vec<(usize, String, std::result::Result<Value, String>)> = pool.install(|| {
            tasks
                .par_iter()
                .flat_map_iter(|(output, matching)| {
                    matching.iter().map(move |&i| {
                        let analyzer = &shared[i];
                        let result = catch_unwind(AssertUnwindSafe(|| analyzer.apply(output)))
                            .unwrap_or_else(|_| Err(anyhow!("apply panicked")))
                            .map_err(|e| format!("{:#}", e));
                        (i, output.sim_id.clone(), result)
                    })
                })
                .collect()
        });

        let mut per_analyzer: Vec<(BTreeMap<String, Value>, Vec<JobFailure>)> =
            (0..analyzers.len()).map(|_| Default::default()).collect();
        for (i, sim_id, result) in applied {
            match result {
                Ok(value) => {
                    per_analyzer[i].0.insert(sim_id, value);
                }
                Err(error) => {
                    warn!(analyzer = analyzers[i].name(), sim = %sim_id, %error, "apply failed");
                    per_analyzer[i].1.push(JobFailure { sim_id, error });
                }
            }
        }

        for (analyzer, (results, mut failures)) in analyzers.iter_mut().zip(per_analyzer) {
            failures.sort_by(|a, b| a.sim_id.cmp(&b.sim_id));
            let binding = analyzer.binding();
            let aggregated = catch_unwind(AssertUnwindSafe(|| {
                analyzer
                    .combine(&results)
                    .and_then(|combined| analyzer.finalize(combined))
            }))
            .unwrap_or_else(|_| Err(anyhow!("combine panicked")));
            let (summary, error, render) = match aggregated {
                Ok(summary) => {
                    let render = render_isolated(&self.render, &**analyzer, &summary, ctx);
                    (Some(summary), None, render)
                }
                Err(e) => {
                    warn!(analyzer = analyzer.name(), error = %e, "aggregation failed");
                    (None, Some(format!("{:#}", e)), RenderStatus::Skipped)
                }
            };
            info!(
                analyzer = analyzer.name(),
                contributing = results.len(),
                failures = failures.len(),
                "analyzer finished"
            );
            report.analyzers.push(AnalyzerResult {
                name: analyzer.name().to_string(),
                version: binding.version,
                summary,
                contributing: results.keys().cloned().collect(),
                failures,
                error,
                render,
            });
        }
        Ok(report)
    }
}
