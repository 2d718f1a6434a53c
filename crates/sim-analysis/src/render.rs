use crate::analyzer::{Analyzer, AnalyzerRegistry, RenderContext};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sim_core::AnalyzerBinding;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use tracing::{debug, warn};

/// Where `render` runs.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderMode {
    /// A child process receives a [`RenderRequest`] as JSON on stdin and
    /// rebuilds the analyzer from its binding.
    Process { program: PathBuf, args: Vec<String> },
    /// A supervised thread; panics are caught and reported.
    Inline,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderRequest {
    pub binding: AnalyzerBinding,
    pub summary: Value,
    pub context: RenderContext,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum RenderStatus {
    Ok,
    Failed(String),
    Skipped,
}

pub fn render_isolated(
    mode: &RenderMode,
    analyzer: &dyn Analyzer,
    summary: &Value,
    ctx: &RenderContext,
) -> RenderStatus {
    let status = match mode {
        RenderMode::Disabled => return RenderStatus::Skipped,
        RenderMode::Inline => render_in_thread(analyzer, summary, ctx),
        RenderMode::Process { program, args } => {
            let request = RenderRequest {
                binding: analyzer.binding(),
                summary: summary.clone(),
                context: ctx.clone(),
            };
            render_in_process(program, args, &request)
        }
    };
    match status {
        Ok(()) => {
            debug!(analyzer = analyzer.name(), "render finished");
            RenderStatus::Ok
        }
        Err(e) => {
            warn!(analyzer = analyzer.name(), error = %e, "render failed");
            RenderStatus::Failed(e.to_string())
        }
    }
}

fn render_in_thread(analyzer: &dyn Analyzer, summary: &Value, ctx: &RenderContext) -> Result<()> {
    thread::scope(|scope| {
        let handle = scope.spawn(|| analyzer.render(summary, ctx));
        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(anyhow!("render panicked")),
        }
    })
}

fn render_in_process(program: &Path, args: &[String], request: &RenderRequest) -> Result<()> {
    let payload = serde_json::to_vec(request)?;
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawning render worker {}", program.display()))?;
    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(&payload);
    }
    let output = child.wait_with_output()?;
    if output.status.success() {
        return Ok(());
    }
    let stderr_tail = String::from_utf8_lossy(&output.stderr)
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("render worker exited without output")
        .to_string();
    Err(anyhow!(
        "render worker exited with {}: {}",
        output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string()),
        stderr_tail
    ))
}

/// Worker side of the process protocol: reads one request, rebuilds the
/// analyzer and renders.
pub fn serve_render_request(registry: &AnalyzerRegistry, mut input: impl Read) -> Result<()> {
    let mut raw = Vec::new();
    input.read_to_end(&mut raw)?;
    let request: RenderRequest = serde_json::from_slice(&raw).context("parsing render request")?;
    let analyzer = registry.build(&request.binding)?;
    analyzer.render(&request.summary, &request.context)
}
