pub mod discovery;
pub mod extraction;
pub mod storage;
pub mod schema;
pub mod resilience;
pub mod processor;

pub use processor::{build_pipeline, IngestionPipeline, IngestionReport, ItemOutcome, ProcessingError};
