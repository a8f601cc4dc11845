pub mod document_ctx;
pub mod document_flow;
pub mod reprocessor;

pub use document_ctx::DocumentCtx;
pub use document_flow::{AnswerSheetPipeline, IngestRequest, PipelineBuilder};
pub use reprocessor::SheetReprocessor;
