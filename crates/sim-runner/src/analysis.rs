use crate::Services;
use anyhow::{bail, Result};
use chrono::Utc;
use serde_json::json;
use sim_analysis::{AnalysisPipeline, AnalysisReport, Exclusion, RenderContext, SimulationOutput};
use sim_core::fsutil::atomic_write_json_pretty;
use sim_core::{AnalyzerBinding, Experiment, SimulationStatus};
use std::path::PathBuf;
use tracing::{info, warn};

pub const ANALYSIS_DIR: &str = "analysis";
pub const REPORT_FILE: &str = "analysis_report.json";

/// Output handles for an experiment's succeeded simulations, plus every
/// simulation that cannot be analyzed and why.
pub fn resolve_outputs(
    services: &Services,
    exp: &Experiment,
) -> Result<(Vec<SimulationOutput>, Vec<Exclusion>)> {
    let mut excluded = Vec::new();
    let mut sims = Vec::new();
    for sim in services.store.simulations(&exp.id)? {
        if sim.status == SimulationStatus::Succeeded {
            sims.push(sim);
            continue;
        }
        let reason = if sim.message.is_empty() {
            format!("status {}", sim.status)
        } else {
            format!("status {}: {}", sim.status, sim.message)
        };
        excluded.push(Exclusion {
            sim_id: sim.id,
            reason,
        });
    }
    if sims.is_empty() {
        return Ok((Vec::new(), excluded));
    }
    let mut backend = services.backends.create(exp.location)?;
    let locations = backend.output_locations(exp, &sims)?;
    let mut outputs = Vec::with_capacity(sims.len());
    for sim in sims {
        match locations.get(&sim.id) {
            Some(dir) => outputs.push(SimulationOutput {
                sim_id: sim.id.clone(),
                experiment_id: exp.id.clone(),
                dir: dir.clone(),
                tags: sim.tags,
            }),
            None => {
                warn!(sim = %sim.id, "no output location; excluded from analysis");
                excluded.push(Exclusion {
                    sim_id: sim.id,
                    reason: "no output location".to_string(),
                });
            }
        }
    }
    Ok((outputs, excluded))
}

fn output_dir(services: &Services, exps: &[Experiment]) -> PathBuf {
    match exps {
        [single] => single.exp_dir().join(ANALYSIS_DIR),
        _ => services
            .settings
            .state_dir
            .join(ANALYSIS_DIR)
            .join(Utc::now().format("%Y_%m_%d_%H_%M_%S_%6f").to_string()),
    }
}

/// Runs the analysis pipeline over the experiments' outputs. `bindings`
/// replaces the experiments' own analyzers when given. The report is also
/// written next to the rendered artifacts.
pub fn analyze_experiments(
    services: &Services,
    exps: &[Experiment],
    bindings: Option<&[AnalyzerBinding]>,
) -> Result<AnalysisReport> {
    if exps.is_empty() {
        bail!("no experiments to analyze");
    }
    let bindings = match bindings {
        Some(b) => b.to_vec(),
        None => {
            let mut merged: Vec<AnalyzerBinding> = Vec::new();
            for binding in exps.iter().flat_map(|e| e.analyzers.iter()) {
                if !merged.contains(binding) {
                    merged.push(binding.clone());
                }
            }
            merged
        }
    };
    if bindings.is_empty() {
        bail!("no analyzers bound to the selected experiments");
    }
    let analyzers = bindings
        .iter()
        .map(|b| services.registry.build(b))
        .collect::<sim_core::Result<Vec<_>>>()?;

    let mut outputs = Vec::new();
    let mut excluded = Vec::new();
    for exp in exps {
        let (resolved, left_out) = resolve_outputs(services, exp)?;
        outputs.extend(resolved);
        excluded.extend(left_out);
    }
    let ctx = RenderContext {
        output_dir: output_dir(services, exps),
        experiment_ids: exps.iter().map(|e| e.id.clone()).collect(),
    };
    info!(
        experiments = exps.len(),
        simulations = outputs.len(),
        analyzers = analyzers.len(),
        "analysis started"
    );
    let pipeline = AnalysisPipeline::new(services.settings.max_threads, services.render.clone());
    let mut report = pipeline.run(&outputs, analyzers, &ctx)?;
    report.excluded = excluded;
    atomic_write_json_pretty(
        &ctx.output_dir.join(REPORT_FILE),
        &json!({
            "experiments": ctx.experiment_ids,
            "created_at": Utc::now().to_rfc3339(),
            "report": report,
        }),
    )?;
    for warning in report.warnings() {
        warn!("{}", warning);
    }
    info!(
        output = %ctx.output_dir.display(),
        failures = report.failure_count(),
        excluded = report.excluded.len(),
        "analysis finished"
    );
    Ok(report)
}
