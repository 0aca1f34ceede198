pub mod engine;
pub mod operator;
pub mod walk;

pub use engine::{EngineError, RunOutcome, RunSummary, SpanningEngine};
pub use operator::{parse_size, Operator, VolumeChoice, VolumeSpec};
pub use walk::source_files;
