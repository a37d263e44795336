pub mod evaluator;
pub mod types;

pub use evaluator::analyze;
pub use types::{AnalyzerParams, ArbitrageResult, Opportunity};
