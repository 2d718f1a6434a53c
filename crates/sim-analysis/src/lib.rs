pub mod analyzer;
pub mod builtin;
pub mod pipeline;
pub mod render;

pub use analyzer::{
    Analyzer, AnalyzerCtor, AnalyzerRegistry, RegistryEntry, RenderContext, SimulationOutput,
    TagMatcher,
};
pub use pipeline::{AnalysisPipeline, AnalysisReport, AnalyzerResult, Exclusion, JobFailure};
pub use render::{render_isolated, serve_render_request, RenderMode, RenderRequest, RenderStatus};
