pub mod backend;
pub mod llm_extractor;
pub mod plausibility;
pub mod result_sink;
pub mod review_queue;
pub mod structured_extractor;

pub use backend::{ExtractionBackend, ExtractionRequest, OpenAiBackend};
pub use llm_extractor::LlmExtractor;
pub use result_sink::ResultSink;
pub use review_queue::{QueueEntry, ResolutionTag, ReviewQueue};
