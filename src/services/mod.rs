pub mod aggregator;
pub mod answer_extractor;
pub mod complexity;
pub mod handwriting;
pub mod model_router;
pub mod recovery;
pub mod review_writer;
pub mod roi_manager;
pub mod template_recognizer;
pub mod validation;

pub use aggregator::{AggregationInput, ResultAggregator};
pub use answer_extractor::{AnswerExtractor, ExtractionInput, ExtractionParams, TemplateAwareExtractor};
pub use handwriting::{DiscriminationContext, GeometricDiscriminator, HandwritingDiscriminator};
pub use model_router::{ModelRouter, RouterSettings, RoutingOutcome};
pub use recovery::{RecoveryController, RecoverySettings, Reprocessor};
pub use review_writer::ReviewWriter;
pub use roi_manager::{ProcessingRegion, RoiManager};
pub use template_recognizer::{StructuralTemplateRecognizer, TemplateRecognizer};
pub use validation::{ValidationEngine, ValidationSettings};
