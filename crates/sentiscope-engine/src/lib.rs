pub mod normalize;
pub mod pipeline;
pub mod prompts;
pub mod providers;
pub mod resilience;
pub mod stats;
pub mod units;

#[cfg(test)]
mod test_support;

pub use pipeline::{AnalysisPipeline, PipelineOptions, RunReport, UnitOutcome};
pub use providers::{
    AnalysisProvider, AnalysisRequest, DryrunProvider, GeminiProvider, GenerationSettings,
};
pub use resilience::{ResilientInvoker, RetryPolicy};
